//! Built-in trigger handlers for the sandbox views.

use shared::domain::{ActionTag, HookId};

use crate::{
    context::{order_select_context, order_sign_context, patient_view_context, HookContext},
    registry::{SystemActionPolicy, TriggerHandler, TriggerPolicy},
    state::AppState,
};

pub const PATIENT_VIEW: &str = "patient-view";
pub const RX_VIEW_ORDER_SELECT: &str = "rx-view/order-select";
pub const RX_SIGN_ORDER_SIGN: &str = "rx-sign/order-sign";

pub struct PatientViewHandler {
    hook_id: HookId,
    policy: TriggerPolicy,
}

impl PatientViewHandler {
    pub fn new() -> Self {
        Self {
            hook_id: HookId::from(PATIENT_VIEW),
            policy: TriggerPolicy::Reactive,
        }
    }
}

impl Default for PatientViewHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl TriggerHandler for PatientViewHandler {
    fn hook_id(&self) -> &HookId {
        &self.hook_id
    }

    fn trigger_policy(&self) -> &TriggerPolicy {
        &self.policy
    }

    fn generate_context(&self, state: &AppState) -> HookContext {
        patient_view_context(state)
    }
}

/// Medication entry view. Reacts to every draft change and lets services
/// rewrite the draft directly through system actions.
pub struct OrderSelectHandler {
    hook_id: HookId,
    policy: TriggerPolicy,
}

impl OrderSelectHandler {
    pub fn new() -> Self {
        Self {
            hook_id: HookId::from(RX_VIEW_ORDER_SELECT),
            policy: TriggerPolicy::Reactive,
        }
    }
}

impl Default for OrderSelectHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl TriggerHandler for OrderSelectHandler {
    fn hook_id(&self) -> &HookId {
        &self.hook_id
    }

    fn trigger_policy(&self) -> &TriggerPolicy {
        &self.policy
    }

    fn system_action_policy(&self) -> SystemActionPolicy {
        SystemActionPolicy::Apply
    }

    fn generate_context(&self, state: &AppState) -> HookContext {
        order_select_context(state)
    }
}

pub struct OrderSignHandler {
    hook_id: HookId,
    policy: TriggerPolicy,
}

impl OrderSignHandler {
    /// Fires only on the sign-order action.
    pub fn explicit() -> Self {
        Self::with_policy(TriggerPolicy::Explicit(ActionTag::sign_order()))
    }

    pub fn reactive() -> Self {
        Self::with_policy(TriggerPolicy::Reactive)
    }

    pub fn with_policy(policy: TriggerPolicy) -> Self {
        Self {
            hook_id: HookId::from(RX_SIGN_ORDER_SIGN),
            policy,
        }
    }
}

impl TriggerHandler for OrderSignHandler {
    fn hook_id(&self) -> &HookId {
        &self.hook_id
    }

    fn trigger_policy(&self) -> &TriggerPolicy {
        &self.policy
    }

    fn generate_context(&self, state: &AppState) -> HookContext {
        order_sign_context(state)
    }
}
