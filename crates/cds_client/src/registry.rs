use std::{collections::HashMap, sync::Arc};

use shared::domain::{ActionTag, HookId};
use tracing::{debug, warn};

use crate::{
    context::{EmptyContext, HookContext},
    state::AppState,
};

/// When a handler is allowed to fire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerPolicy {
    /// Fires on every relevant state change.
    Reactive,
    /// Fires only when the firing action carries this tag.
    Explicit(ActionTag),
    /// Never fires.
    Inert,
}

impl TriggerPolicy {
    pub fn allows(&self, action: &ActionTag) -> bool {
        match self {
            Self::Reactive => true,
            Self::Explicit(tag) => tag == action,
            Self::Inert => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SystemActionPolicy {
    Apply,
    #[default]
    Ignore,
}

pub trait TriggerHandler: Send + Sync {
    fn hook_id(&self) -> &HookId;
    fn trigger_policy(&self) -> &TriggerPolicy;

    fn system_action_policy(&self) -> SystemActionPolicy {
        SystemActionPolicy::Ignore
    }

    /// Must be pure: identical state yields an identical context.
    fn generate_context(&self, state: &AppState) -> HookContext;
}

pub struct NoopHandler {
    hook_id: HookId,
    policy: TriggerPolicy,
}

impl NoopHandler {
    pub fn new(hook_id: HookId) -> Self {
        Self {
            hook_id,
            policy: TriggerPolicy::Inert,
        }
    }
}

impl TriggerHandler for NoopHandler {
    fn hook_id(&self) -> &HookId {
        &self.hook_id
    }

    fn trigger_policy(&self) -> &TriggerPolicy {
        &self.policy
    }

    fn generate_context(&self, _state: &AppState) -> HookContext {
        HookContext::Empty(EmptyContext::default())
    }
}

#[derive(Default, Clone)]
pub struct HookRegistry {
    handlers: HashMap<HookId, Arc<dyn TriggerHandler>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `handler` under its hook id. A handler already registered for
    /// that id is replaced and handed back.
    pub fn register(&mut self, handler: Arc<dyn TriggerHandler>) -> Option<Arc<dyn TriggerHandler>> {
        let hook_id = handler.hook_id().clone();
        let previous = self.handlers.insert(hook_id.clone(), handler);
        if previous.is_some() {
            warn!(hook = %hook_id, "registry: replaced existing trigger handler");
        } else {
            debug!(hook = %hook_id, "registry: registered trigger handler");
        }
        previous
    }

    pub fn resolve(&self, hook_id: &HookId) -> Arc<dyn TriggerHandler> {
        match self.handlers.get(hook_id) {
            Some(handler) => Arc::clone(handler),
            None => Arc::new(NoopHandler::new(hook_id.clone())),
        }
    }

    pub fn contains(&self, hook_id: &HookId) -> bool {
        self.handlers.contains_key(hook_id)
    }

    pub fn hook_ids(&self) -> Vec<HookId> {
        let mut ids = self.handlers.keys().cloned().collect::<Vec<_>>();
        ids.sort();
        ids
    }
}

#[cfg(test)]
#[path = "tests/registry_tests.rs"]
mod tests;
