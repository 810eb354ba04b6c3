use serde_json::Value;
use shared::domain::{FhirVersion, HookId, PatientId};

use crate::medication::MedicationState;

pub const DEFAULT_USER_ID: &str = "Practitioner/example";

#[derive(Debug, Clone, PartialEq)]
pub struct Patient {
    pub id: PatientId,
    pub resource: Value,
}

impl Patient {
    /// Builds a patient from a FHIR `Patient` resource; `None` when the
    /// resource carries no id.
    pub fn from_resource(resource: Value) -> Option<Self> {
        let id = resource.get("id").and_then(Value::as_str)?.to_string();
        Some(Self {
            id: PatientId(id),
            resource,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FhirServerState {
    pub current_fhir_server: Option<String>,
    pub default_fhir_server: String,
    pub fhir_version: FhirVersion,
}

impl FhirServerState {
    pub fn new(default_fhir_server: impl Into<String>) -> Self {
        Self {
            current_fhir_server: None,
            default_fhir_server: default_fhir_server.into(),
            fhir_version: FhirVersion::default(),
        }
    }
}

/// Snapshot of everything a context generator may read.
#[derive(Debug, Clone, PartialEq)]
pub struct AppState {
    pub user_id: String,
    pub current_hook: HookId,
    pub current_patient: Option<Patient>,
    pub encounter_id: Option<String>,
    pub fhir_server: FhirServerState,
    pub medication: MedicationState,
}

impl AppState {
    pub fn new(default_fhir_server: impl Into<String>, current_hook: HookId) -> Self {
        Self {
            user_id: DEFAULT_USER_ID.to_string(),
            current_hook,
            current_patient: None,
            encounter_id: None,
            fhir_server: FhirServerState::new(default_fhir_server),
            medication: MedicationState::default(),
        }
    }

    /// The connected FHIR server, or the default one before any connect.
    pub fn fhir_base(&self) -> &str {
        self.fhir_server
            .current_fhir_server
            .as_deref()
            .unwrap_or(&self.fhir_server.default_fhir_server)
    }

    pub fn patient_id(&self) -> Option<&PatientId> {
        self.current_patient.as_ref().map(|patient| &patient.id)
    }
}
