use super::*;
use serde_json::json;

const URL: &str = "https://svc/order-sign";

fn request() -> ExchangeBody {
    ExchangeBody::Json(json!({ "hook": "order-sign" }))
}

#[test]
fn success_records_status_and_zero_errors() {
    let mut store = ExchangeStore::new();
    let seq = store.issue(URL);

    let exchange = store
        .record(
            URL,
            seq,
            request(),
            CallOutcome::Success {
                status: 200,
                body: ExchangeBody::Json(json!({ "cards": [] })),
            },
        )
        .expect("stored");

    assert_eq!(exchange.status, 200);
    assert_eq!(exchange.error_count, 0);
    assert_eq!(exchange.response, ExchangeBody::Json(json!({ "cards": [] })));
    assert_eq!(store.get(URL), Some(&exchange));
}

#[test]
fn failures_increment_and_success_resets_error_count() {
    let mut store = ExchangeStore::new();
    for expected in 1..=2 {
        let seq = store.issue(URL);
        let exchange = store
            .record(
                URL,
                seq,
                request(),
                CallOutcome::Failure {
                    status: 500,
                    body: ExchangeBody::Json(json!({ "error": "boom" })),
                },
            )
            .expect("stored");
        assert_eq!(exchange.error_count, expected);
    }

    let seq = store.issue(URL);
    let exchange = store
        .record(
            URL,
            seq,
            request(),
            CallOutcome::Success {
                status: 200,
                body: ExchangeBody::Json(json!({})),
            },
        )
        .expect("stored");
    assert_eq!(exchange.error_count, 0);
}

#[test]
fn stale_result_does_not_overwrite_newer_call() {
    let mut store = ExchangeStore::new();
    let original = store.issue(URL);
    let resend = store.issue(URL);

    let newer = store
        .record(
            URL,
            resend,
            ExchangeBody::Text("edited".into()),
            CallOutcome::Success {
                status: 200,
                body: ExchangeBody::Json(json!({ "cards": [] })),
            },
        )
        .expect("newer stored");
    let stale = store.record(
        URL,
        original,
        request(),
        CallOutcome::Failure {
            status: 504,
            body: ExchangeBody::Text("timeout".into()),
        },
    );

    assert!(stale.is_none());
    assert!(!store.is_current(URL, original));
    assert_eq!(store.get(URL), Some(&newer));
}

#[test]
fn unissued_url_is_not_recorded() {
    let mut store = ExchangeStore::new();
    let outcome = CallOutcome::Success {
        status: 200,
        body: ExchangeBody::Json(json!({})),
    };
    assert!(store.record(URL, 1, request(), outcome).is_none());
    assert!(store.is_empty());
}

#[test]
fn clear_keeps_in_flight_calls_stale() {
    let mut store = ExchangeStore::new();
    let first = store.issue(URL);
    store.clear();
    let second = store.issue(URL);

    assert!(second > first);
    assert!(!store.is_current(URL, first));
}

#[test]
fn service_in_context_falls_back_to_first_configured() {
    let mut store = ExchangeStore::new();
    let configured = ["https://a/svc", "https://b/svc"];

    assert_eq!(store.service_in_context(&configured), Some("https://a/svc"));

    store.select_service("https://b/svc");
    assert_eq!(store.service_in_context(&configured), Some("https://b/svc"));

    store.select_service("https://removed/svc");
    assert_eq!(store.service_in_context(&configured), Some("https://a/svc"));
    assert_eq!(store.service_in_context(&[]), None);
}

#[test]
fn phases_walk_from_dispatching_to_idle() {
    let mut store = ExchangeStore::new();
    let hook = HookId::from("rx-sign/order-sign");

    assert_eq!(store.phase(&hook), HookPhase::Idle);
    assert_eq!(
        store.begin_dispatch(&hook, 2),
        HookPhase::Dispatching { pending: 2 }
    );
    assert_eq!(
        store.settle(&hook),
        HookPhase::PartialResults {
            settled: 1,
            pending: 1
        }
    );
    assert_eq!(store.settle(&hook), HookPhase::AllResults { settled: 2 });
    assert_eq!(store.finish_dispatch(&hook), HookPhase::Idle);
}

#[test]
fn dispatch_without_calls_is_immediately_complete() {
    let mut store = ExchangeStore::new();
    let hook = HookId::from("patient-view");
    assert_eq!(
        store.begin_dispatch(&hook, 0),
        HookPhase::AllResults { settled: 0 }
    );
}
