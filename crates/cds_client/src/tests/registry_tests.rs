use super::*;
use crate::handlers::{OrderSignHandler, PatientViewHandler, RX_SIGN_ORDER_SIGN};

#[test]
fn explicit_policy_only_allows_matching_tag() {
    let policy = TriggerPolicy::Explicit(ActionTag::sign_order());
    assert!(policy.allows(&ActionTag::sign_order()));
    assert!(!policy.allows(&ActionTag::from(ActionTag::DOSAGE_CHANGED)));
    assert!(TriggerPolicy::Reactive.allows(&ActionTag::from("anything")));
    assert!(!TriggerPolicy::Inert.allows(&ActionTag::sign_order()));
}

#[test]
fn unknown_hook_resolves_to_inert_noop() {
    let registry = HookRegistry::new();
    let handler = registry.resolve(&HookId::from("order-dispatch"));

    assert_eq!(handler.hook_id(), &HookId::from("order-dispatch"));
    assert_eq!(handler.trigger_policy(), &TriggerPolicy::Inert);
    assert!(!registry.contains(&HookId::from("order-dispatch")));
}

#[test]
fn duplicate_registration_returns_replaced_handler() {
    let mut registry = HookRegistry::new();
    assert!(registry
        .register(Arc::new(OrderSignHandler::reactive()))
        .is_none());

    let previous = registry
        .register(Arc::new(OrderSignHandler::explicit()))
        .expect("previous handler");

    assert_eq!(previous.trigger_policy(), &TriggerPolicy::Reactive);
    let current = registry.resolve(&HookId::from(RX_SIGN_ORDER_SIGN));
    assert_eq!(
        current.trigger_policy(),
        &TriggerPolicy::Explicit(ActionTag::sign_order())
    );
}

#[test]
fn hook_ids_are_sorted() {
    let mut registry = HookRegistry::new();
    registry.register(Arc::new(OrderSignHandler::explicit()));
    registry.register(Arc::new(PatientViewHandler::new()));

    assert_eq!(
        registry.hook_ids(),
        vec![HookId::from("patient-view"), HookId::from(RX_SIGN_ORDER_SIGN)]
    );
}
