use std::sync::Arc;

use futures::{stream::FuturesUnordered, StreamExt};
use reqwest::{header, Client};
use serde_json::Value;
use shared::{
    domain::{ActionTag, HookId},
    error::ErrorBody,
    protocol::{CdsResponse, ExchangeBody, HookRequest},
};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    auth::{mint_service_token, ServiceTokenConfig},
    context::HookContext,
    discovery::{ConfiguredService, ConfiguredServices},
    exchange::{CallOutcome, ExchangeStore, ServiceExchange},
    fhir::FhirRetriever,
    prefetch::resolve_prefetch,
    registry::{HookRegistry, TriggerHandler},
    state::AppState,
    ClientEvent,
};

/// Status recorded when a call fails without an HTTP answer.
pub const TRANSPORT_FAILURE_STATUS: u16 = 500;

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceResult {
    pub service_url: String,
    pub seq: u64,
    /// The exchange as written, `None` when a newer call superseded this one.
    pub exchange: Option<ServiceExchange>,
    pub response: Option<CdsResponse>,
}

impl ServiceResult {
    pub fn is_current(&self) -> bool {
        self.exchange.is_some()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    TriggerMismatch { action: ActionTag },
    InvalidContext(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchReport {
    Skipped {
        hook_id: HookId,
        reason: SkipReason,
    },
    Completed {
        hook_id: HookId,
        results: Vec<ServiceResult>,
    },
}

impl DispatchReport {
    pub fn hook_id(&self) -> &HookId {
        match self {
            Self::Skipped { hook_id, .. } | Self::Completed { hook_id, .. } => hook_id,
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped { .. })
    }

    pub fn results(&self) -> &[ServiceResult] {
        match self {
            Self::Skipped { .. } => &[],
            Self::Completed { results, .. } => results,
        }
    }
}

pub struct DispatchRequest<'a> {
    pub hook_id: &'a HookId,
    pub action: &'a ActionTag,
    pub state: &'a AppState,
    pub services: &'a ConfiguredServices,
}

struct SettledCall {
    service_url: String,
    seq: u64,
    request: ExchangeBody,
    outcome: CallOutcome,
    response: Option<CdsResponse>,
}

pub struct ExecutionDispatcher {
    http: Client,
    fhir: Arc<dyn FhirRetriever>,
    auth: Option<ServiceTokenConfig>,
    events: broadcast::Sender<ClientEvent>,
}

impl ExecutionDispatcher {
    pub fn new(
        http: Client,
        fhir: Arc<dyn FhirRetriever>,
        auth: Option<ServiceTokenConfig>,
        events: broadcast::Sender<ClientEvent>,
    ) -> Self {
        Self {
            http,
            fhir,
            auth,
            events,
        }
    }

    /// Fires `request.hook_id` at every enabled service configured for it.
    /// Each exchange is stored as soon as its call settles; a failed call
    /// becomes an errored exchange and never aborts the others.
    pub async fn execute(
        &self,
        registry: &HookRegistry,
        request: DispatchRequest<'_>,
        exchanges: &Mutex<ExchangeStore>,
    ) -> DispatchReport {
        let handler = registry.resolve(request.hook_id);
        let hook_id = handler.hook_id().clone();
        if !handler.trigger_policy().allows(request.action) {
            debug!(
                hook = %hook_id,
                action = %request.action,
                "dispatch: trigger policy rejected action"
            );
            return DispatchReport::Skipped {
                hook_id,
                reason: SkipReason::TriggerMismatch {
                    action: request.action.clone(),
                },
            };
        }

        let context = handler.generate_context(request.state);
        let context_value = match serde_json::to_value(&context) {
            Ok(value) => value,
            Err(err) => {
                error!(hook = %hook_id, "dispatch: context serialization failed: {err}");
                return DispatchReport::Skipped {
                    hook_id,
                    reason: SkipReason::InvalidContext(err.to_string()),
                };
            }
        };

        let services = request.services.for_hook(hook_id.hook_name());
        let fhir_server = request.state.fhir_base().to_string();

        let calls = {
            let mut store = exchanges.lock().await;
            let phase = store.begin_dispatch(&hook_id, services.len());
            let _ = self.events.send(ClientEvent::PhaseChanged {
                hook_id: hook_id.clone(),
                phase,
            });
            services
                .into_iter()
                .map(|service| {
                    let seq = store.issue(&service.url);
                    (service, seq)
                })
                .collect::<Vec<_>>()
        };

        info!(
            hook = %hook_id,
            action = %request.action,
            services = calls.len(),
            "dispatch: firing hook"
        );

        let mut in_flight = calls
            .into_iter()
            .map(|(service, seq)| {
                self.call_service(
                    handler.as_ref(),
                    service,
                    seq,
                    &context,
                    &context_value,
                    &fhir_server,
                )
            })
            .collect::<FuturesUnordered<_>>();

        let mut results = Vec::new();
        while let Some(settled) = in_flight.next().await {
            let (exchange, phase) = {
                let mut store = exchanges.lock().await;
                let exchange = store.record(
                    &settled.service_url,
                    settled.seq,
                    settled.request,
                    settled.outcome,
                );
                (exchange, store.settle(&hook_id))
            };
            if let Some(exchange) = &exchange {
                let _ = self.events.send(ClientEvent::ExchangeStored(exchange.clone()));
            }
            let _ = self.events.send(ClientEvent::PhaseChanged {
                hook_id: hook_id.clone(),
                phase,
            });
            let response = exchange.as_ref().and(settled.response);
            results.push(ServiceResult {
                service_url: settled.service_url,
                seq: settled.seq,
                exchange,
                response,
            });
        }

        let phase = exchanges.lock().await.finish_dispatch(&hook_id);
        let _ = self.events.send(ClientEvent::PhaseChanged {
            hook_id: hook_id.clone(),
            phase,
        });

        DispatchReport::Completed { hook_id, results }
    }

    /// Posts an edited request body to one service and overwrites that
    /// service's exchange with the outcome.
    pub async fn resend(
        &self,
        service_url: &str,
        body: ExchangeBody,
        exchanges: &Mutex<ExchangeStore>,
    ) -> ServiceResult {
        let seq = exchanges.lock().await.issue(service_url);
        let (outcome, response) = self.post(service_url, &body).await;
        let exchange = exchanges
            .lock()
            .await
            .record(service_url, seq, body, outcome);
        if let Some(exchange) = &exchange {
            let _ = self.events.send(ClientEvent::ExchangeStored(exchange.clone()));
        }
        let response = exchange.as_ref().and(response);
        ServiceResult {
            service_url: service_url.to_string(),
            seq,
            exchange,
            response,
        }
    }

    async fn call_service(
        &self,
        handler: &dyn TriggerHandler,
        service: ConfiguredService,
        seq: u64,
        context: &HookContext,
        context_value: &Value,
        fhir_server: &str,
    ) -> SettledCall {
        let prefetch = resolve_prefetch(
            self.fhir.as_ref(),
            Some(fhir_server),
            &service.descriptor.prefetch,
            context,
        )
        .await;

        let hook_request = HookRequest {
            hook: handler.hook_id().hook_name().to_string(),
            hook_instance: Uuid::new_v4(),
            fhir_server: Some(fhir_server.to_string()),
            context: context_value.clone(),
            prefetch,
        };

        let request = match serde_json::to_value(&hook_request) {
            Ok(value) => ExchangeBody::Json(value),
            Err(err) => {
                return SettledCall {
                    service_url: service.url,
                    seq,
                    request: ExchangeBody::Text(String::new()),
                    outcome: CallOutcome::Failure {
                        status: TRANSPORT_FAILURE_STATUS,
                        body: error_body(&err.to_string()),
                    },
                    response: None,
                };
            }
        };

        let (outcome, response) = self.post(&service.url, &request).await;
        SettledCall {
            service_url: service.url,
            seq,
            request,
            outcome,
            response,
        }
    }

    async fn post(
        &self,
        service_url: &str,
        body: &ExchangeBody,
    ) -> (CallOutcome, Option<CdsResponse>) {
        let mut builder = self
            .http
            .post(service_url)
            .header(header::ACCEPT, "application/json");
        builder = match body {
            ExchangeBody::Json(value) => builder.json(value),
            ExchangeBody::Text(text) => builder
                .header(header::CONTENT_TYPE, "text/plain")
                .body(text.clone()),
        };
        if let Some(auth) = &self.auth {
            match mint_service_token(auth, service_url) {
                Ok(token) => builder = builder.bearer_auth(token),
                Err(err) => warn!(service_url, "dispatch: failed to sign service token: {err}"),
            }
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(err) => {
                let status = err
                    .status()
                    .map(|status| status.as_u16())
                    .unwrap_or(TRANSPORT_FAILURE_STATUS);
                warn!(service_url, status, "dispatch: service call failed: {err}");
                return (
                    CallOutcome::Failure {
                        status,
                        body: error_body(&err.to_string()),
                    },
                    None,
                );
            }
        };

        let status = response.status();
        let text = match response.text().await {
            Ok(text) => text,
            Err(err) => {
                warn!(service_url, "dispatch: failed to read service response: {err}");
                return (
                    CallOutcome::Failure {
                        status: status.as_u16(),
                        body: error_body(&err.to_string()),
                    },
                    None,
                );
            }
        };
        let body = ExchangeBody::from_text(&text);

        if !status.is_success() {
            warn!(
                service_url,
                status = status.as_u16(),
                "dispatch: service returned error status"
            );
            return (
                CallOutcome::Failure {
                    status: status.as_u16(),
                    body,
                },
                None,
            );
        }

        let parsed = body
            .as_json()
            .map(|value| serde_json::from_value::<CdsResponse>(value.clone()));
        match parsed {
            Some(Ok(response)) => {
                debug!(
                    service_url,
                    status = status.as_u16(),
                    cards = response.cards.len(),
                    "dispatch: service responded"
                );
                (
                    CallOutcome::Success {
                        status: status.as_u16(),
                        body,
                    },
                    Some(response),
                )
            }
            Some(Err(err)) => {
                warn!(service_url, "dispatch: response is not a CDS response: {err}");
                (
                    CallOutcome::Malformed {
                        status: status.as_u16(),
                        body,
                    },
                    None,
                )
            }
            None => {
                warn!(service_url, "dispatch: response body is not JSON");
                (
                    CallOutcome::Malformed {
                        status: status.as_u16(),
                        body,
                    },
                    None,
                )
            }
        }
    }
}

fn error_body(message: &str) -> ExchangeBody {
    match serde_json::to_value(ErrorBody::new(message)) {
        Ok(value) => ExchangeBody::Json(value),
        Err(_) => ExchangeBody::Text(message.to_string()),
    }
}

#[cfg(test)]
#[path = "tests/dispatcher_tests.rs"]
mod tests;
