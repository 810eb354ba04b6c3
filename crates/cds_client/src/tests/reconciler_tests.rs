use serde_json::json;
use shared::protocol::{ActionType, CdsResponse, ExchangeBody, Indicator};

use super::*;
use crate::exchange::ServiceExchange;

fn card(summary: &str, suggestion_uuid: Option<&str>) -> Card {
    serde_json::from_value(json!({
        "summary": summary,
        "indicator": "warning",
        "source": { "label": "test" },
        "suggestions": suggestion_uuid
            .map(|uuid| vec![json!({ "label": "Fix", "uuid": uuid, "actions": [] })])
            .unwrap_or_default(),
    }))
    .expect("card")
}

fn result(url: &str, current: bool, response: Option<CdsResponse>) -> ServiceResult {
    ServiceResult {
        service_url: url.to_string(),
        seq: 1,
        exchange: current.then(|| ServiceExchange {
            service_url: url.to_string(),
            request: ExchangeBody::Json(json!({})),
            response: ExchangeBody::Json(json!({})),
            status: 200,
            error_count: 0,
            seq: 1,
        }),
        response,
    }
}

fn system_action() -> Action {
    Action {
        kind: ActionType::Update,
        description: None,
        resource: None,
        resource_id: Some("MedicationRequest/request-123".into()),
        field: Some("quantity".into()),
        value: Some(json!(2)),
    }
}

#[test]
fn stale_results_are_skipped_and_failed_results_withdrawn() {
    let response = CdsResponse {
        cards: vec![card("stale", None)],
        ..Default::default()
    };
    let commands = reconcile(
        SystemActionPolicy::Apply,
        &[
            result("https://a/stale", false, Some(response)),
            result("https://a/failed", true, None),
        ],
    );
    assert_eq!(
        commands,
        vec![ReconcileCommand::Withdraw {
            service_url: "https://a/failed".into(),
        }]
    );
}

#[test]
fn system_actions_follow_the_policy() {
    let response = CdsResponse {
        cards: vec![card("dose", None)],
        system_actions: vec![system_action()],
        messages: vec!["checked".into()],
    };
    let results = [result("https://a/1", true, Some(response))];

    let applied = reconcile(SystemActionPolicy::Apply, &results);
    assert_eq!(applied.len(), 3);
    assert!(matches!(
        &applied[1],
        ReconcileCommand::ApplySystemActions { actions, .. } if actions.len() == 1
    ));
    assert_eq!(
        applied[2],
        ReconcileCommand::ShowMessage {
            service_url: "https://a/1".into(),
            message: "checked".into(),
        }
    );

    let ignored = reconcile(SystemActionPolicy::Ignore, &results);
    assert!(!ignored
        .iter()
        .any(|command| matches!(command, ReconcileCommand::ApplySystemActions { .. })));
}

#[test]
fn empty_response_still_clears_cards() {
    let commands = reconcile(
        SystemActionPolicy::Ignore,
        &[result("https://a/1", true, Some(CdsResponse::default()))],
    );
    assert_eq!(
        commands,
        vec![ReconcileCommand::ShowCards {
            service_url: "https://a/1".into(),
            cards: Vec::new(),
        }]
    );
}

#[test]
fn deck_keeps_service_order_and_finds_suggestions() {
    let mut deck = CardDeck::new();
    deck.replace("https://a/1", vec![card("first", Some("s-1"))]);
    deck.replace("https://a/2", vec![card("second", None)]);
    deck.replace("https://a/1", vec![card("first again", Some("s-2"))]);

    let summaries = deck
        .all_cards()
        .into_iter()
        .map(|card| card.summary)
        .collect::<Vec<_>>();
    assert_eq!(summaries, vec!["first again", "second"]);
    assert_eq!(deck.all_cards()[1].indicator, Indicator::Warning);
    assert!(deck.find_suggestion("s-1").is_none());
    assert_eq!(deck.find_suggestion("s-2").map(|s| s.label.as_str()), Some("Fix"));

    deck.remove("https://a/1");
    assert!(deck.find_suggestion("s-2").is_none());
    assert_eq!(deck.all_cards().len(), 1);
    deck.clear();
    assert!(deck.is_empty());
}
