use std::{sync::Arc, time::Duration};

use chrono::NaiveDate;
use reqwest::Client;
use serde_json::Value;
use shared::{
    domain::{ActionTag, DateRangeKind, DoseFrequency, FhirVersion, HookId, PatientId},
    error::{ErrorCode, SandboxError},
    protocol::{Card, ExchangeBody, ServiceDescriptor, Suggestion},
};
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, error, info, warn};

pub mod auth;
pub mod context;
pub mod discovery;
pub mod dispatcher;
pub mod exchange;
pub mod fhir;
pub mod handlers;
pub mod input;
pub mod medication;
pub mod prefetch;
pub mod reconciler;
pub mod registry;
pub mod state;

use auth::ServiceTokenConfig;
use discovery::{ConfiguredService, ConfiguredServices, DiscoveryClient};
use dispatcher::{DispatchReport, DispatchRequest, ExecutionDispatcher, ServiceResult};
use exchange::{ExchangeStore, HookPhase, ServiceExchange};
use fhir::{
    fhir_version_from_metadata, metadata_url, resource_url, FhirError, FhirRetriever,
    HttpFhirRetriever,
};
use handlers::{OrderSelectHandler, OrderSignHandler, PatientViewHandler, PATIENT_VIEW};
use input::{normalize_endpoint, EMPTY_DISCOVERY_MESSAGE, EMPTY_FHIR_SERVER_MESSAGE};
use medication::{create_fhir_resource, Prescribable};
use reconciler::{reconcile, CardDeck, ReconcileCommand};
use registry::{HookRegistry, TriggerHandler};
use state::{AppState, Patient};

pub const DEFAULT_FHIR_SERVER: &str = "https://launch.smarthealthit.org/v/r2/fhir";
pub const DEFAULT_DISCOVERY_URL: &str = "https://sandbox-services.cds-hooks.org/cds-services";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub const SECURED_FHIR_MESSAGE: &str =
    "Cannot configure secured FHIR endpoints. Please use an open (unsecured) FHIR endpoint.";
pub const FHIR_CONNECT_FAILURE_MESSAGE: &str =
    "Failed to connect to the FHIR server. See console for details.";
pub const DISCOVERY_FAILURE_MESSAGE: &str =
    "Failed to connect to the discovery endpoint. See console for details.";
pub const PATIENT_LOAD_FAILURE_MESSAGE: &str =
    "Failed to load the patient. See console for details.";
pub const EMPTY_PATIENT_MESSAGE: &str = "Enter a valid patient ID";

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    PhaseChanged { hook_id: HookId, phase: HookPhase },
    ExchangeStored(ServiceExchange),
    CardsReceived { service_url: String, cards: Vec<Card> },
    SystemActionsApplied { service_url: String, applied: usize },
    Message(ServiceMessage),
    FhirServerConnected { url: String, version: FhirVersion },
    PatientLoaded(PatientId),
    ServicesChanged,
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceMessage {
    pub service_url: String,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct CdsClientOptions {
    pub default_fhir_server: String,
    pub user_id: Option<String>,
    pub initial_hook: HookId,
    pub request_timeout: Duration,
    /// Signs every service call when present.
    pub service_auth: Option<ServiceTokenConfig>,
}

impl Default for CdsClientOptions {
    fn default() -> Self {
        Self {
            default_fhir_server: DEFAULT_FHIR_SERVER.to_string(),
            user_id: None,
            initial_hook: HookId::from(PATIENT_VIEW),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            service_auth: None,
        }
    }
}

/// Handlers for the three built-in views. Signing fires only on an
/// explicit sign-order action.
pub fn default_registry() -> HookRegistry {
    let mut registry = HookRegistry::new();
    registry.register(Arc::new(PatientViewHandler::new()));
    registry.register(Arc::new(OrderSelectHandler::new()));
    registry.register(Arc::new(OrderSignHandler::explicit()));
    registry
}

pub struct CdsClient {
    fhir: Arc<dyn FhirRetriever>,
    discovery: DiscoveryClient,
    dispatcher: ExecutionDispatcher,
    registry: RwLock<HookRegistry>,
    state: Mutex<AppState>,
    services: Mutex<ConfiguredServices>,
    exchanges: Mutex<ExchangeStore>,
    cards: Mutex<CardDeck>,
    messages: Mutex<Vec<ServiceMessage>>,
    events: broadcast::Sender<ClientEvent>,
}

impl CdsClient {
    pub fn new(options: CdsClientOptions) -> Result<Arc<Self>, SandboxError> {
        let http = Client::builder()
            .timeout(options.request_timeout)
            .build()
            .map_err(|err| SandboxError::new(ErrorCode::Internal, err.to_string()))?;
        let fhir = Arc::new(HttpFhirRetriever::new(http.clone()));
        Ok(Self::new_with_dependencies(
            options,
            http,
            fhir,
            default_registry(),
        ))
    }

    pub fn new_with_dependencies(
        options: CdsClientOptions,
        http: Client,
        fhir: Arc<dyn FhirRetriever>,
        registry: HookRegistry,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        let mut state = AppState::new(options.default_fhir_server, options.initial_hook);
        if let Some(user_id) = options.user_id {
            state.user_id = user_id;
        }
        Arc::new(Self {
            fhir: Arc::clone(&fhir),
            discovery: DiscoveryClient::new(http.clone()),
            dispatcher: ExecutionDispatcher::new(
                http,
                fhir,
                options.service_auth,
                events.clone(),
            ),
            registry: RwLock::new(registry),
            state: Mutex::new(state),
            services: Mutex::new(ConfiguredServices::new()),
            exchanges: Mutex::new(ExchangeStore::new()),
            cards: Mutex::new(CardDeck::new()),
            messages: Mutex::new(Vec::new()),
            events,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub async fn register_handler(
        &self,
        handler: Arc<dyn TriggerHandler>,
    ) -> Option<Arc<dyn TriggerHandler>> {
        self.registry.write().await.register(handler)
    }

    pub async fn state_snapshot(&self) -> AppState {
        self.state.lock().await.clone()
    }

    /// Validates `input`, reads the server's capability statement and makes
    /// it the current FHIR server. The loaded patient is dropped.
    pub async fn connect_fhir_server(&self, input: &str) -> Result<FhirVersion, SandboxError> {
        let url = normalize_endpoint(input, EMPTY_FHIR_SERVER_MESSAGE)?;
        let metadata = self
            .fhir
            .fetch(&metadata_url(&url))
            .await
            .map_err(|err| {
                error!(fhir_server = %url, "fhir: connect failed: {err}");
                self.report(fhir_failure(&err, FHIR_CONNECT_FAILURE_MESSAGE))
            })?;
        let version = fhir_version_from_metadata(&metadata);

        {
            let mut state = self.state.lock().await;
            state.fhir_server.current_fhir_server = Some(url.clone());
            state.fhir_server.fhir_version = version;
            state.current_patient = None;
        }
        info!(fhir_server = %url, ?version, "fhir: server connected");
        let _ = self
            .events
            .send(ClientEvent::FhirServerConnected { url, version });
        Ok(version)
    }

    pub async fn reset_fhir_server(&self) -> Result<FhirVersion, SandboxError> {
        let default = self
            .state
            .lock()
            .await
            .fhir_server
            .default_fhir_server
            .clone();
        self.connect_fhir_server(&default).await
    }

    /// Fetches `Patient/<id>` from the current FHIR server, stores it and
    /// fires the current hook.
    pub async fn load_patient(&self, patient_id: &str) -> Result<DispatchReport, SandboxError> {
        let patient_id = patient_id.trim();
        if patient_id.is_empty() {
            return Err(SandboxError::validation(EMPTY_PATIENT_MESSAGE));
        }
        let base = self.state.lock().await.fhir_base().to_string();
        let url = resource_url(&base, &format!("Patient/{patient_id}"));
        let resource = self.fhir.fetch(&url).await.map_err(|err| {
            error!(patient_id, "fhir: patient load failed: {err}");
            self.report(match err {
                FhirError::Status { status: 404, .. } => SandboxError::new(
                    ErrorCode::NotFound,
                    PATIENT_LOAD_FAILURE_MESSAGE,
                ),
                other => fhir_failure(&other, PATIENT_LOAD_FAILURE_MESSAGE),
            })
        })?;
        let patient = Patient::from_resource(resource).ok_or_else(|| {
            self.report(SandboxError::new(
                ErrorCode::NotFound,
                PATIENT_LOAD_FAILURE_MESSAGE,
            ))
        })?;

        let id = patient.id.clone();
        self.state.lock().await.current_patient = Some(patient);
        info!(patient_id = %id, "fhir: patient loaded");
        let _ = self.events.send(ClientEvent::PatientLoaded(id));
        Ok(self.fire(ActionTag::from(ActionTag::PATIENT_SELECTED)).await)
    }

    /// Configures every service advertised at `input`. Returns how many
    /// services the endpoint listed.
    pub async fn discover_services(&self, input: &str) -> Result<usize, SandboxError> {
        let url = normalize_endpoint(input, EMPTY_DISCOVERY_MESSAGE)?;
        let discovered = self.discovery.fetch(&url).await.map_err(|err| {
            error!(discovery_url = %url, "discovery: failed: {err}");
            self.report(SandboxError::new(
                ErrorCode::Transport,
                DISCOVERY_FAILURE_MESSAGE,
            ))
        })?;

        let count = discovered.len();
        {
            let mut services = self.services.lock().await;
            for (service_url, descriptor) in discovered {
                services.insert(service_url, descriptor);
            }
        }
        self.reset_results().await;
        let _ = self.events.send(ClientEvent::ServicesChanged);
        Ok(count)
    }

    pub async fn add_service(&self, service_url: impl Into<String>, descriptor: ServiceDescriptor) {
        self.services.lock().await.insert(service_url, descriptor);
        self.reset_results().await;
        let _ = self.events.send(ClientEvent::ServicesChanged);
    }

    pub async fn remove_service(&self, service_url: &str) -> bool {
        let removed = self.services.lock().await.remove(service_url).is_some();
        if removed {
            self.reset_results().await;
            let _ = self.events.send(ClientEvent::ServicesChanged);
        }
        removed
    }

    pub async fn set_service_enabled(&self, service_url: &str, enabled: bool) -> bool {
        let changed = self
            .services
            .lock()
            .await
            .set_enabled(service_url, enabled);
        if changed {
            let _ = self.events.send(ClientEvent::ServicesChanged);
        }
        changed
    }

    pub async fn configured_services(&self) -> Vec<ConfiguredService> {
        self.services.lock().await.iter().cloned().collect()
    }

    /// Switches the active view. Exchanges and cards of the previous hook
    /// are dropped; nothing is fired.
    pub async fn set_current_hook(&self, hook_id: HookId) {
        self.state.lock().await.current_hook = hook_id;
        self.reset_results().await;
    }

    pub async fn select_service(&self, service_url: &str) {
        self.exchanges.lock().await.select_service(service_url);
    }

    /// Exchange of the selected service, or of the first service
    /// configured for the current hook.
    pub async fn selected_exchange(&self) -> Option<ServiceExchange> {
        let hook_name = self
            .state
            .lock()
            .await
            .current_hook
            .hook_name()
            .to_string();
        let configured = self.services.lock().await.for_hook(&hook_name);
        let urls = configured
            .iter()
            .map(|service| service.url.as_str())
            .collect::<Vec<_>>();
        let exchanges = self.exchanges.lock().await;
        let url = exchanges.service_in_context(&urls)?;
        exchanges.get(url).cloned()
    }

    pub async fn exchange(&self, service_url: &str) -> Option<ServiceExchange> {
        self.exchanges.lock().await.get(service_url).cloned()
    }

    pub async fn exchanges(&self) -> Vec<ServiceExchange> {
        self.exchanges.lock().await.exchanges()
    }

    pub async fn phase(&self, hook_id: &HookId) -> HookPhase {
        self.exchanges.lock().await.phase(hook_id)
    }

    pub async fn cards(&self) -> Vec<Card> {
        self.cards.lock().await.all_cards()
    }

    pub async fn messages(&self) -> Vec<ServiceMessage> {
        self.messages.lock().await.clone()
    }

    /// The draft order as the current FHIR version renders it.
    pub async fn draft_order(&self) -> Option<Value> {
        let state = self.state.lock().await;
        create_fhir_resource(
            state.fhir_server.fhir_version,
            state.patient_id(),
            &state.medication,
        )
    }

    /// Fires the current hook.
    pub async fn fire(&self, action: ActionTag) -> DispatchReport {
        let hook_id = self.state.lock().await.current_hook.clone();
        self.fire_hook(&hook_id, action).await
    }

    pub async fn fire_hook(&self, hook_id: &HookId, action: ActionTag) -> DispatchReport {
        let state = self.state.lock().await.clone();
        let services = self.services.lock().await.clone();
        let registry = self.registry.read().await.clone();
        let policy = registry.resolve(hook_id).system_action_policy();

        let report = self
            .dispatcher
            .execute(
                &registry,
                DispatchRequest {
                    hook_id,
                    action: &action,
                    state: &state,
                    services: &services,
                },
                &self.exchanges,
            )
            .await;

        if let DispatchReport::Completed { results, .. } = &report {
            self.apply(reconcile(policy, results)).await;
        }
        report
    }

    pub async fn choose_medication(&self, code: &str, name: &str) -> DispatchReport {
        self.state
            .lock()
            .await
            .medication
            .choose_medication(Prescribable {
                code: code.to_string(),
                name: name.to_string(),
            });
        self.fire(ActionTag::from(ActionTag::MEDICATION_CHOSEN)).await
    }

    pub async fn update_dosage_instructions(
        &self,
        number: u32,
        frequency: DoseFrequency,
    ) -> DispatchReport {
        self.state
            .lock()
            .await
            .medication
            .set_dosage(number, frequency);
        self.fire(ActionTag::from(ActionTag::DOSAGE_CHANGED)).await
    }

    pub async fn update_dispense_request(&self, supply_days: u32) -> DispatchReport {
        self.state
            .lock()
            .await
            .medication
            .set_supply_duration(supply_days);
        self.fire(ActionTag::from(ActionTag::DISPENSE_CHANGED)).await
    }

    pub async fn update_date(&self, range: DateRangeKind, date: Option<NaiveDate>) -> DispatchReport {
        self.state.lock().await.medication.set_date(range, date);
        self.fire(ActionTag::from(ActionTag::DATE_CHANGED)).await
    }

    pub async fn toggle_date(&self, range: DateRangeKind) -> DispatchReport {
        self.state.lock().await.medication.toggle_date(range);
        self.fire(ActionTag::from(ActionTag::DATE_CHANGED)).await
    }

    pub async fn sign_order(&self) -> DispatchReport {
        self.fire(ActionTag::sign_order()).await
    }

    /// Applies the suggestion's actions to the draft, then fires the current
    /// hook again.
    pub async fn take_suggestion(&self, suggestion: &Suggestion) -> DispatchReport {
        {
            let mut state = self.state.lock().await;
            for action in &suggestion.actions {
                let outcome = state.medication.apply_action(action);
                if let medication::ActionOutcome::Ignored(reason) = outcome {
                    warn!(label = %suggestion.label, "suggestion: action ignored: {reason}");
                }
            }
        }
        info!(label = %suggestion.label, "suggestion: taken");
        self.fire(ActionTag::from(ActionTag::SUGGESTION_TAKEN)).await
    }

    pub async fn take_suggestion_by_uuid(&self, uuid: &str) -> Result<DispatchReport, SandboxError> {
        let suggestion = self
            .cards
            .lock()
            .await
            .find_suggestion(uuid)
            .cloned()
            .ok_or_else(|| {
                SandboxError::new(ErrorCode::NotFound, format!("no suggestion with uuid {uuid}"))
            })?;
        Ok(self.take_suggestion(&suggestion).await)
    }

    /// Posts an edited request to one service. Only the exchange is
    /// updated; cards stay as they are.
    pub async fn resend(&self, service_url: &str, body: ExchangeBody) -> ServiceResult {
        self.dispatcher
            .resend(service_url, body, &self.exchanges)
            .await
    }

    async fn apply(&self, commands: Vec<ReconcileCommand>) {
        for command in commands {
            match command {
                ReconcileCommand::ShowCards { service_url, cards } => {
                    self.cards.lock().await.replace(&service_url, cards.clone());
                    self.messages
                        .lock()
                        .await
                        .retain(|message| message.service_url != service_url);
                    let _ = self
                        .events
                        .send(ClientEvent::CardsReceived { service_url, cards });
                }
                ReconcileCommand::ApplySystemActions {
                    service_url,
                    actions,
                } => {
                    let applied = {
                        let mut state = self.state.lock().await;
                        actions
                            .iter()
                            .filter(|action| state.medication.apply_action(action).is_applied())
                            .count()
                    };
                    info!(%service_url, applied, "reconcile: system actions applied");
                    let _ = self.events.send(ClientEvent::SystemActionsApplied {
                        service_url,
                        applied,
                    });
                }
                ReconcileCommand::ShowMessage {
                    service_url,
                    message,
                } => {
                    let message = ServiceMessage {
                        service_url,
                        message,
                    };
                    self.messages.lock().await.push(message.clone());
                    let _ = self.events.send(ClientEvent::Message(message));
                }
                ReconcileCommand::Withdraw { service_url } => {
                    self.cards.lock().await.remove(&service_url);
                    self.messages
                        .lock()
                        .await
                        .retain(|message| message.service_url != service_url);
                    debug!(%service_url, "reconcile: withdrew results of failed call");
                    let _ = self.events.send(ClientEvent::CardsReceived {
                        service_url,
                        cards: Vec::new(),
                    });
                }
            }
        }
    }

    /// Publishes a failure to subscribers before it is returned.
    fn report(&self, err: SandboxError) -> SandboxError {
        let _ = self.events.send(ClientEvent::Error(err.message.clone()));
        err
    }

    async fn reset_results(&self) {
        self.exchanges.lock().await.clear();
        self.cards.lock().await.clear();
        self.messages.lock().await.clear();
    }
}

fn fhir_failure(err: &FhirError, message: &str) -> SandboxError {
    match err {
        FhirError::Unauthorized { .. } => {
            SandboxError::new(ErrorCode::Unauthorized, SECURED_FHIR_MESSAGE)
        }
        _ => SandboxError::new(ErrorCode::Transport, message),
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
