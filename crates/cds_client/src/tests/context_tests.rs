use super::*;
use serde_json::json;
use shared::domain::{FhirVersion, HookId};

use crate::{
    medication::{Prescribable, DRAFT_ORDER_ID},
    state::Patient,
};

fn state_with_patient() -> AppState {
    let mut state = AppState::new("http://fhir.test", HookId::from("rx-sign/order-sign"));
    state.current_patient = Patient::from_resource(json!({
        "resourceType": "Patient",
        "id": "smart-1288992"
    }));
    state
}

#[test]
fn order_sign_without_medication_has_empty_bundle() {
    let state = state_with_patient();

    let context = serde_json::to_value(order_sign_context(&state)).expect("serialize");

    assert_eq!(
        context,
        json!({
            "userId": "Practitioner/example",
            "patientId": "smart-1288992",
            "draftOrders": { "resourceType": "Bundle", "entry": [] }
        })
    );
}

#[test]
fn order_sign_bundle_carries_draft_order() {
    let mut state = state_with_patient();
    state.fhir_server.fhir_version = FhirVersion::Stu3;
    state.medication.choose_medication(Prescribable {
        code: "617993".into(),
        name: "Amoxicillin 120 MG/ML".into(),
    });

    let context = serde_json::to_value(order_sign_context(&state)).expect("serialize");

    let entry = &context["draftOrders"]["entry"];
    assert_eq!(entry.as_array().map(Vec::len), Some(1));
    assert_eq!(entry[0]["resource"]["resourceType"], "MedicationRequest");
    assert_eq!(entry[0]["resource"]["subject"]["reference"], "Patient/smart-1288992");
}

#[test]
fn order_select_lists_selections() {
    let mut state = state_with_patient();
    state.medication.choose_medication(Prescribable {
        code: "617993".into(),
        name: "Amoxicillin 120 MG/ML".into(),
    });

    let HookContext::OrderSelect(context) = order_select_context(&state) else {
        panic!("expected order-select context");
    };

    assert_eq!(
        context.selections,
        vec![format!("MedicationRequest/{DRAFT_ORDER_ID}")]
    );
}

#[test]
fn missing_patient_is_omitted_not_an_error() {
    let state = AppState::new("http://fhir.test", HookId::from("patient-view"));

    let context = patient_view_context(&state);

    assert!(context.patient_id().is_none());
    assert_eq!(
        serde_json::to_value(&context).expect("serialize"),
        json!({ "userId": "Practitioner/example" })
    );
}

#[test]
fn generation_is_deterministic() {
    let mut state = state_with_patient();
    state.encounter_id = Some("enc-1".into());
    state.medication.choose_medication(Prescribable {
        code: "617993".into(),
        name: "Amoxicillin 120 MG/ML".into(),
    });
    state.medication.set_supply_duration(30);

    for generate in [patient_view_context, order_select_context, order_sign_context] {
        let first = serde_json::to_value(generate(&state)).expect("first");
        let second = serde_json::to_value(generate(&state)).expect("second");
        assert_eq!(first, second);
    }
}
