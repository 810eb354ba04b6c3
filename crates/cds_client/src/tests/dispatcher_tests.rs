use std::{
    sync::{Arc, Mutex as StdMutex},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::post,
    Json, Router,
};
use serde_json::json;
use shared::protocol::ServiceDescriptor;
use tokio::net::TcpListener;

use super::*;
use crate::{
    auth::ServiceTokenConfig,
    exchange::HookPhase,
    fhir::FhirError,
    handlers::{OrderSignHandler, PatientViewHandler, PATIENT_VIEW, RX_SIGN_ORDER_SIGN},
};

struct OfflineFhir;

#[async_trait]
impl FhirRetriever for OfflineFhir {
    async fn fetch(&self, url: &str) -> Result<Value, FhirError> {
        Err(FhirError::Transport {
            url: url.to_string(),
            message: "offline".into(),
        })
    }
}

type Seen = Arc<StdMutex<Vec<(Option<String>, Value)>>>;

const SLOW_SERVICE_DELAY: Duration = Duration::from_millis(500);

async fn slow_service() -> Json<Value> {
    tokio::time::sleep(SLOW_SERVICE_DELAY).await;
    Json(json!({ "cards": [{ "summary": "Took a while" }] }))
}

async fn spawn_services(seen: Seen) -> String {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let app = Router::new()
        .route(
            "/cds-services/ok",
            post(
                |State(seen): State<Seen>, headers: HeaderMap, Json(body): Json<Value>| async move {
                    let auth = headers
                        .get("authorization")
                        .and_then(|value| value.to_str().ok())
                        .map(str::to_string);
                    seen.lock().expect("lock").push((auth, body));
                    Json(json!({
                        "cards": [{ "summary": "Looks fine", "indicator": "info" }]
                    }))
                },
            ),
        )
        .route(
            "/cds-services/boom",
            post(|| async {
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": "boom" })),
                )
            }),
        )
        .route("/cds-services/slow", post(slow_service))
        .route("/cds-services/slow-too", post(slow_service))
        .route(
            "/cds-services/garbled",
            post(|| async { "definitely not json" }),
        )
        .with_state(seen);
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}/cds-services")
}

fn descriptor(hook: &str, id: &str) -> ServiceDescriptor {
    ServiceDescriptor {
        hook: hook.into(),
        id: id.into(),
        title: None,
        description: None,
        prefetch: Default::default(),
    }
}

fn dispatcher(auth: Option<ServiceTokenConfig>) -> (ExecutionDispatcher, broadcast::Receiver<ClientEvent>) {
    let (events, rx) = broadcast::channel(64);
    (
        ExecutionDispatcher::new(Client::new(), Arc::new(OfflineFhir), auth, events),
        rx,
    )
}

fn registry() -> HookRegistry {
    let mut registry = HookRegistry::new();
    registry.register(Arc::new(PatientViewHandler::new()));
    registry.register(Arc::new(OrderSignHandler::explicit()));
    registry
}

#[tokio::test]
async fn rejected_action_issues_no_calls() {
    let seen = Seen::default();
    let base = spawn_services(seen.clone()).await;
    let mut services = ConfiguredServices::new();
    services.insert(format!("{base}/ok"), descriptor("order-sign", "ok"));
    let (dispatcher, _rx) = dispatcher(None);
    let exchanges = Mutex::new(ExchangeStore::new());
    let hook_id = HookId::from(RX_SIGN_ORDER_SIGN);
    let state = AppState::new("http://fhir.test/r4", hook_id.clone());

    let report = dispatcher
        .execute(
            &registry(),
            DispatchRequest {
                hook_id: &hook_id,
                action: &ActionTag::from(ActionTag::DOSAGE_CHANGED),
                state: &state,
                services: &services,
            },
            &exchanges,
        )
        .await;

    assert!(report.is_skipped());
    assert!(seen.lock().expect("lock").is_empty());
    let store = exchanges.lock().await;
    assert!(store.is_empty());
    assert_eq!(store.phase(&hook_id), HookPhase::Idle);
}

#[tokio::test]
async fn every_service_settles_independently() {
    let seen = Seen::default();
    let base = spawn_services(seen.clone()).await;
    let mut services = ConfiguredServices::new();
    for id in ["ok", "boom", "garbled"] {
        services.insert(format!("{base}/{id}"), descriptor("patient-view", id));
    }
    services.insert(format!("{base}/ignored"), descriptor("order-sign", "ignored"));
    let (dispatcher, mut rx) = dispatcher(None);
    let exchanges = Mutex::new(ExchangeStore::new());
    let hook_id = HookId::from(PATIENT_VIEW);
    let state = AppState::new("http://fhir.test/r4", hook_id.clone());

    let report = dispatcher
        .execute(
            &registry(),
            DispatchRequest {
                hook_id: &hook_id,
                action: &ActionTag::from(ActionTag::PATIENT_SELECTED),
                state: &state,
                services: &services,
            },
            &exchanges,
        )
        .await;

    assert_eq!(report.results().len(), 3);
    let store = exchanges.lock().await;
    assert_eq!(store.len(), 3);

    let ok = store.get(&format!("{base}/ok")).expect("ok exchange");
    assert_eq!(ok.status, 200);
    assert_eq!(ok.error_count, 0);
    assert_eq!(ok.request.as_json().expect("json")["hook"], "patient-view");

    let boom = store.get(&format!("{base}/boom")).expect("boom exchange");
    assert_eq!(boom.status, 500);
    assert_eq!(boom.error_count, 1);
    assert_eq!(boom.response.as_json().expect("json")["error"], "boom");

    let garbled = store.get(&format!("{base}/garbled")).expect("garbled exchange");
    assert_eq!(garbled.error_count, 1);
    assert_eq!(
        garbled.response,
        ExchangeBody::Text("definitely not json".into())
    );

    let ok_result = report
        .results()
        .iter()
        .find(|result| result.service_url.ends_with("/ok"))
        .expect("ok result");
    assert_eq!(
        ok_result.response.as_ref().map(|response| response.cards.len()),
        Some(1)
    );
    assert_eq!(store.phase(&hook_id), HookPhase::Idle);

    let mut phases = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let ClientEvent::PhaseChanged { phase, .. } = event {
            phases.push(phase);
        }
    }
    assert_eq!(phases.first(), Some(&HookPhase::Dispatching { pending: 3 }));
    assert!(phases.contains(&HookPhase::AllResults { settled: 3 }));
    assert_eq!(phases.last(), Some(&HookPhase::Idle));
}

#[tokio::test]
async fn signed_bearer_token_is_sent() {
    let seen = Seen::default();
    let base = spawn_services(seen.clone()).await;
    let mut services = ConfiguredServices::new();
    services.insert(format!("{base}/ok"), descriptor("patient-view", "ok"));
    let (dispatcher, _rx) = dispatcher(Some(ServiceTokenConfig::new("sandbox", "secret")));
    let exchanges = Mutex::new(ExchangeStore::new());
    let hook_id = HookId::from(PATIENT_VIEW);
    let mut state = AppState::new("http://fhir.test/r4", hook_id.clone());
    state.fhir_server.current_fhir_server = Some("http://fhir.test/r4".into());

    dispatcher
        .execute(
            &registry(),
            DispatchRequest {
                hook_id: &hook_id,
                action: &ActionTag::from(ActionTag::PATIENT_SELECTED),
                state: &state,
                services: &services,
            },
            &exchanges,
        )
        .await;

    let seen = seen.lock().expect("lock");
    assert_eq!(seen.len(), 1);
    let (auth, body) = &seen[0];
    assert!(auth.as_deref().is_some_and(|value| value.starts_with("Bearer ")));
    assert_eq!(body["fhirServer"], "http://fhir.test/r4");
    assert!(body["hookInstance"].is_string());
    assert_eq!(body["context"]["userId"], "Practitioner/example");
}

#[tokio::test]
async fn resend_overwrites_exchange_and_keeps_text_bodies() {
    let seen = Seen::default();
    let base = spawn_services(seen.clone()).await;
    let url = format!("{base}/boom");
    let (dispatcher, _rx) = dispatcher(None);
    let exchanges = Mutex::new(ExchangeStore::new());

    let first = dispatcher
        .resend(&url, ExchangeBody::Text("{not json".into()), &exchanges)
        .await;
    let second = dispatcher
        .resend(&url, ExchangeBody::Json(json!({ "hook": "patient-view" })), &exchanges)
        .await;

    assert!(first.is_current());
    assert_eq!(first.exchange.expect("first").error_count, 1);
    let stored = exchanges.lock().await.get(&url).cloned().expect("stored");
    assert_eq!(stored.error_count, 2);
    assert_eq!(stored.request, ExchangeBody::Json(json!({ "hook": "patient-view" })));
    assert_eq!(second.exchange, Some(stored));
}

#[tokio::test]
async fn unreachable_service_is_recorded_as_failure() {
    let (dispatcher, _rx) = dispatcher(None);
    let exchanges = Mutex::new(ExchangeStore::new());
    let url = "http://127.0.0.1:1/cds-services/down";

    let result = dispatcher
        .resend(url, ExchangeBody::Json(json!({})), &exchanges)
        .await;

    let exchange = result.exchange.expect("exchange");
    assert_eq!(exchange.status, TRANSPORT_FAILURE_STATUS);
    assert_eq!(exchange.error_count, 1);
    assert!(exchange.response.as_json().expect("json")["error"].is_string());
    assert!(result.response.is_none());
}

#[tokio::test]
async fn slow_services_run_concurrently_and_do_not_hold_back_others() {
    let seen = Seen::default();
    let base = spawn_services(seen.clone()).await;
    let mut services = ConfiguredServices::new();
    services.insert(format!("{base}/slow"), descriptor("patient-view", "slow"));
    services.insert(format!("{base}/slow-too"), descriptor("patient-view", "slow-too"));
    services.insert(format!("{base}/ok"), descriptor("patient-view", "ok"));
    let (dispatcher, mut rx) = dispatcher(None);
    let exchanges = Mutex::new(ExchangeStore::new());
    let hook_id = HookId::from(PATIENT_VIEW);
    let state = AppState::new("http://fhir.test/r4", hook_id.clone());

    let started = Instant::now();
    let report = dispatcher
        .execute(
            &registry(),
            DispatchRequest {
                hook_id: &hook_id,
                action: &ActionTag::from(ActionTag::PATIENT_SELECTED),
                state: &state,
                services: &services,
            },
            &exchanges,
        )
        .await;
    let elapsed = started.elapsed();

    assert_eq!(report.results().len(), 3);
    assert!(
        elapsed < SLOW_SERVICE_DELAY * 2 - Duration::from_millis(50),
        "slow calls ran one after another: {elapsed:?}"
    );

    let mut stored = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let ClientEvent::ExchangeStored(exchange) = event {
            stored.push(exchange.service_url);
        }
    }
    assert_eq!(stored.len(), 3);
    assert_eq!(stored[0], format!("{base}/ok"));
    assert_eq!(report.results()[0].service_url, format!("{base}/ok"));
}

#[tokio::test]
async fn resend_during_dispatch_supersedes_the_slower_call() {
    let seen = Seen::default();
    let base = spawn_services(seen.clone()).await;
    let url = format!("{base}/slow");
    let mut services = ConfiguredServices::new();
    services.insert(url.clone(), descriptor("patient-view", "slow"));
    let (dispatcher, _rx) = dispatcher(None);
    let exchanges = Mutex::new(ExchangeStore::new());
    let hook_id = HookId::from(PATIENT_VIEW);
    let state = AppState::new("http://fhir.test/r4", hook_id.clone());
    let edited = ExchangeBody::Json(json!({ "hook": "patient-view", "edited": true }));
    let registry = registry();
    let action = ActionTag::from(ActionTag::PATIENT_SELECTED);

    let (report, resent) = tokio::join!(
        dispatcher.execute(
            &registry,
            DispatchRequest {
                hook_id: &hook_id,
                action: &action,
                state: &state,
                services: &services,
            },
            &exchanges,
        ),
        async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            dispatcher.resend(&url, edited.clone(), &exchanges).await
        }
    );

    let dispatched = &report.results()[0];
    assert!(!dispatched.is_current());
    assert!(dispatched.exchange.is_none());
    assert!(dispatched.response.is_none());
    assert_eq!(resent.seq, dispatched.seq + 1);

    let stored = exchanges.lock().await.get(&url).cloned().expect("stored");
    assert_eq!(stored.request, edited);
    assert_eq!(stored.seq, resent.seq);
    assert_eq!(resent.exchange, Some(stored));
}
