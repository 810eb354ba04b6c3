//! Prefetch template resolution.
//!
//! Descriptors may ask for FHIR data up front with templates such as
//! `Patient/{{context.patientId}}`. Each template is filled from the hook
//! context and fetched from the current FHIR server; a key whose template
//! cannot be filled or fetched is left out of the request.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::warn;

use crate::{
    context::HookContext,
    fhir::{resource_url, FhirRetriever},
};

/// Replaces `{{context.*}}` tokens; `None` if a token has no value.
pub fn fill_template(template: &str, context: &HookContext) -> Option<String> {
    let mut filled = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        filled.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find("}}")?;
        let token = after[..end].trim();
        let value = match token {
            "context.patientId" => context.patient_id().map(|id| id.as_str().to_string()),
            "context.userId" => context.user_id().map(str::to_string),
            "context.encounterId" => context.encounter_id().map(str::to_string),
            _ => None,
        }?;
        filled.push_str(&value);
        rest = &after[end + 2..];
    }
    filled.push_str(rest);
    Some(filled)
}

pub async fn resolve_prefetch(
    fhir: &dyn FhirRetriever,
    fhir_server: Option<&str>,
    templates: &BTreeMap<String, String>,
    context: &HookContext,
) -> BTreeMap<String, Value> {
    let mut prefetch = BTreeMap::new();
    let Some(fhir_server) = fhir_server else {
        return prefetch;
    };

    for (key, template) in templates {
        let Some(path) = fill_template(template, context) else {
            warn!(key = %key, template = %template, "prefetch: template has unresolved tokens");
            continue;
        };
        match fhir.fetch(&resource_url(fhir_server, &path)).await {
            Ok(resource) => {
                prefetch.insert(key.clone(), resource);
            }
            Err(err) => warn!(key = %key, "prefetch: fetch failed: {err}"),
        }
    }
    prefetch
}

#[cfg(test)]
#[path = "tests/prefetch_tests.rs"]
mod tests;
