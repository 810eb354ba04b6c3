//! Hook context payloads, one variant per supported hook.
//!
//! Generators take an immutable [`AppState`] snapshot and never fail:
//! missing data becomes an absent field or an empty bundle.

use serde::Serialize;
use serde_json::Value;
use shared::domain::PatientId;

use crate::{medication::create_fhir_resource, state::AppState};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum HookContext {
    PatientView(PatientViewContext),
    OrderSelect(OrderSelectContext),
    OrderSign(OrderSignContext),
    Empty(EmptyContext),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
pub struct EmptyContext {}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PatientViewContext {
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patient_id: Option<PatientId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encounter_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderSelectContext {
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patient_id: Option<PatientId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encounter_id: Option<String>,
    pub selections: Vec<String>,
    pub draft_orders: Bundle,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderSignContext {
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patient_id: Option<PatientId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encounter_id: Option<String>,
    pub draft_orders: Bundle,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Bundle {
    pub resource_type: &'static str,
    pub entry: Vec<BundleEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BundleEntry {
    pub resource: Value,
}

impl Bundle {
    fn draft_orders(state: &AppState) -> Self {
        let entry = create_fhir_resource(
            state.fhir_server.fhir_version,
            state.patient_id(),
            &state.medication,
        )
        .map(|resource| vec![BundleEntry { resource }])
        .unwrap_or_default();
        Self {
            resource_type: "Bundle",
            entry,
        }
    }

    /// `ResourceType/id` references for every entry that has both.
    pub fn references(&self) -> Vec<String> {
        self.entry
            .iter()
            .filter_map(|entry| {
                let resource_type = entry.resource.get("resourceType")?.as_str()?;
                let id = entry.resource.get("id")?.as_str()?;
                Some(format!("{resource_type}/{id}"))
            })
            .collect()
    }
}

impl HookContext {
    pub fn patient_id(&self) -> Option<&PatientId> {
        match self {
            Self::PatientView(ctx) => ctx.patient_id.as_ref(),
            Self::OrderSelect(ctx) => ctx.patient_id.as_ref(),
            Self::OrderSign(ctx) => ctx.patient_id.as_ref(),
            Self::Empty(_) => None,
        }
    }

    pub fn user_id(&self) -> Option<&str> {
        match self {
            Self::PatientView(ctx) => Some(&ctx.user_id),
            Self::OrderSelect(ctx) => Some(&ctx.user_id),
            Self::OrderSign(ctx) => Some(&ctx.user_id),
            Self::Empty(_) => None,
        }
    }

    pub fn encounter_id(&self) -> Option<&str> {
        match self {
            Self::PatientView(ctx) => ctx.encounter_id.as_deref(),
            Self::OrderSelect(ctx) => ctx.encounter_id.as_deref(),
            Self::OrderSign(ctx) => ctx.encounter_id.as_deref(),
            Self::Empty(_) => None,
        }
    }
}

pub fn patient_view_context(state: &AppState) -> HookContext {
    HookContext::PatientView(PatientViewContext {
        user_id: state.user_id.clone(),
        patient_id: state.patient_id().cloned(),
        encounter_id: state.encounter_id.clone(),
    })
}

pub fn order_select_context(state: &AppState) -> HookContext {
    let draft_orders = Bundle::draft_orders(state);
    HookContext::OrderSelect(OrderSelectContext {
        user_id: state.user_id.clone(),
        patient_id: state.patient_id().cloned(),
        encounter_id: state.encounter_id.clone(),
        selections: draft_orders.references(),
        draft_orders,
    })
}

pub fn order_sign_context(state: &AppState) -> HookContext {
    HookContext::OrderSign(OrderSignContext {
        user_id: state.user_id.clone(),
        patient_id: state.patient_id().cloned(),
        encounter_id: state.encounter_id.clone(),
        draft_orders: Bundle::draft_orders(state),
    })
}

#[cfg(test)]
#[path = "tests/context_tests.rs"]
mod tests;
