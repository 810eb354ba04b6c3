//! Draft prescription state and its FHIR rendering.
//!
//! The draft is what the order hooks send as `draftOrders`, and what card
//! suggestions and system actions write back into.

use chrono::NaiveDate;
use serde_json::{json, Map, Value};
use shared::{
    domain::{DateRangeKind, DoseFrequency, FhirVersion, PatientId},
    protocol::{Action, ActionType},
};
use tracing::debug;

pub const DRAFT_ORDER_ID: &str = "request-123";
pub const RXNORM_SYSTEM: &str = "http://www.nlm.nih.gov/research/umls/rxnorm";
pub const MIN_DOSE_NUMBER: u32 = 1;
pub const MAX_DOSE_NUMBER: u32 = 5;
pub const MIN_SUPPLY_DAYS: u32 = 1;
pub const MAX_SUPPLY_DAYS: u32 = 90;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prescribable {
    pub code: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MedicationInstructions {
    pub number: u32,
    pub frequency: DoseFrequency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateSelection {
    pub enabled: bool,
    pub value: Option<NaiveDate>,
}

impl Default for DateSelection {
    fn default() -> Self {
        Self {
            enabled: true,
            value: None,
        }
    }
}

impl DateSelection {
    fn effective(&self) -> Option<NaiveDate> {
        self.enabled.then_some(self.value).flatten()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PrescriptionDates {
    pub start: DateSelection,
    pub end: DateSelection,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MedicationState {
    pub prescribable: Option<Prescribable>,
    pub instructions: MedicationInstructions,
    pub supply_duration: u32,
    pub dates: PrescriptionDates,
}

impl Default for MedicationState {
    fn default() -> Self {
        Self {
            prescribable: None,
            instructions: MedicationInstructions {
                number: MIN_DOSE_NUMBER,
                frequency: DoseFrequency::Daily,
            },
            supply_duration: MIN_SUPPLY_DAYS,
            dates: PrescriptionDates::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    Applied,
    Ignored(String),
}

impl ActionOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied)
    }
}

fn clamp_dose(number: u64) -> u32 {
    number.clamp(MIN_DOSE_NUMBER as u64, MAX_DOSE_NUMBER as u64) as u32
}

fn clamp_supply(days: u64) -> u32 {
    days.clamp(MIN_SUPPLY_DAYS as u64, MAX_SUPPLY_DAYS as u64) as u32
}

fn parse_fhir_date(raw: &str) -> Option<NaiveDate> {
    let day = raw.get(..10).unwrap_or(raw);
    NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()
}

fn value_as_count(value: &Value) -> Option<u64> {
    match value {
        Value::Number(number) => number
            .as_u64()
            .or_else(|| number.as_f64().filter(|v| *v >= 0.0).map(|v| v.round() as u64)),
        Value::String(text) => text.trim().parse::<u64>().ok(),
        _ => None,
    }
}

impl MedicationState {
    pub fn choose_medication(&mut self, prescribable: Prescribable) {
        self.prescribable = Some(prescribable);
    }

    /// Dose number is clamped into `1..=5`.
    pub fn set_dosage(&mut self, number: u32, frequency: DoseFrequency) {
        self.instructions = MedicationInstructions {
            number: clamp_dose(number as u64),
            frequency,
        };
    }

    /// Supply duration is clamped into `1..=90` days.
    pub fn set_supply_duration(&mut self, days: u32) {
        self.supply_duration = clamp_supply(days as u64);
    }

    pub fn set_date(&mut self, range: DateRangeKind, value: Option<NaiveDate>) {
        self.date_mut(range).value = value;
    }

    pub fn toggle_date(&mut self, range: DateRangeKind) {
        let selection = self.date_mut(range);
        selection.enabled = !selection.enabled;
    }

    fn date_mut(&mut self, range: DateRangeKind) -> &mut DateSelection {
        match range {
            DateRangeKind::Start => &mut self.dates.start,
            DateRangeKind::End => &mut self.dates.end,
        }
    }

    fn targets_draft(&self, resource_id: Option<&str>) -> bool {
        let Some(resource_id) = resource_id else {
            return true;
        };
        let resource_id = resource_id.rsplit('/').next().unwrap_or(resource_id);
        resource_id == DRAFT_ORDER_ID
            || self
                .prescribable
                .as_ref()
                .is_some_and(|p| p.code == resource_id)
    }

    /// Folds a card or system action into the draft.
    ///
    /// An action targets the draft when its `resourceId` is absent, or when
    /// its last path segment equals [`DRAFT_ORDER_ID`] or the code of the
    /// chosen prescribable. So `MedicationRequest/request-123` and the bare
    /// medication code (`med-1` for a draft of `med-1`) both match; any
    /// other id leaves the draft untouched.
    pub fn apply_action(&mut self, action: &Action) -> ActionOutcome {
        if !self.targets_draft(action.resource_id.as_deref()) {
            return ActionOutcome::Ignored(format!(
                "resource {} is not the draft order",
                action.resource_id.as_deref().unwrap_or_default()
            ));
        }

        match action.kind {
            ActionType::Delete => {
                self.prescribable = None;
                ActionOutcome::Applied
            }
            ActionType::Create | ActionType::Update => {
                if let Some(field) = action.field.as_deref() {
                    let Some(value) = action.value.as_ref() else {
                        return ActionOutcome::Ignored(format!("field {field} has no value"));
                    };
                    return self.apply_field(field, value);
                }
                if let Some(resource) = action.resource.as_ref() {
                    return self.apply_resource(resource);
                }
                ActionOutcome::Ignored("action carries neither a field nor a resource".into())
            }
        }
    }

    fn apply_field(&mut self, field: &str, value: &Value) -> ActionOutcome {
        match field {
            "quantity" | "number" | "dosageAmount" | "doseQuantity" => {
                let Some(number) = value_as_count(value) else {
                    return ActionOutcome::Ignored(format!("invalid dose number {value}"));
                };
                self.instructions.number = clamp_dose(number);
            }
            "frequency" => {
                let frequency = match value {
                    Value::String(text) => DoseFrequency::parse(text),
                    other => value_as_count(other).and_then(DoseFrequency::from_times_per_day),
                };
                let Some(frequency) = frequency else {
                    return ActionOutcome::Ignored(format!("invalid frequency {value}"));
                };
                self.instructions.frequency = frequency;
            }
            "supplyDuration" | "expectedSupplyDuration" => {
                let Some(days) = value_as_count(value) else {
                    return ActionOutcome::Ignored(format!("invalid supply duration {value}"));
                };
                self.supply_duration = clamp_supply(days);
            }
            "startDate" | "endDate" => {
                let range = if field == "startDate" {
                    DateRangeKind::Start
                } else {
                    DateRangeKind::End
                };
                let date = value.as_str().and_then(parse_fhir_date);
                if date.is_none() && !value.is_null() {
                    return ActionOutcome::Ignored(format!("invalid date {value}"));
                }
                self.set_date(range, date);
            }
            other => return ActionOutcome::Ignored(format!("unsupported field {other}")),
        }
        ActionOutcome::Applied
    }

    fn apply_resource(&mut self, resource: &Value) -> ActionOutcome {
        let resource_type = resource
            .get("resourceType")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if resource_type != "MedicationRequest" && resource_type != "MedicationOrder" {
            return ActionOutcome::Ignored(format!("unsupported resource type {resource_type}"));
        }

        if let Some(coding) = resource
            .pointer("/medicationCodeableConcept/coding/0")
            .and_then(Value::as_object)
        {
            let code = coding.get("code").and_then(Value::as_str);
            let name = coding.get("display").and_then(Value::as_str).or_else(|| {
                resource
                    .pointer("/medicationCodeableConcept/text")
                    .and_then(Value::as_str)
            });
            if let (Some(code), Some(name)) = (code, name) {
                self.prescribable = Some(Prescribable {
                    code: code.to_string(),
                    name: name.to_string(),
                });
            }
        }

        if let Some(dosage) = resource.pointer("/dosageInstruction/0") {
            let dose = dosage
                .pointer("/doseQuantity/value")
                .or_else(|| dosage.pointer("/doseAndRate/0/doseQuantity/value"))
                .and_then(value_as_count);
            if let Some(dose) = dose {
                self.instructions.number = clamp_dose(dose);
            }
            if let Some(frequency) = dosage
                .pointer("/timing/repeat/frequency")
                .and_then(value_as_count)
                .and_then(DoseFrequency::from_times_per_day)
            {
                self.instructions.frequency = frequency;
            }
            if let Some(start) = dosage
                .pointer("/timing/repeat/boundsPeriod/start")
                .and_then(Value::as_str)
                .and_then(parse_fhir_date)
            {
                self.dates.start.value = Some(start);
            }
            if let Some(end) = dosage
                .pointer("/timing/repeat/boundsPeriod/end")
                .and_then(Value::as_str)
                .and_then(parse_fhir_date)
            {
                self.dates.end.value = Some(end);
            }
        }

        if let Some(days) = resource
            .pointer("/dispenseRequest/expectedSupplyDuration/value")
            .and_then(value_as_count)
        {
            self.supply_duration = clamp_supply(days);
        }

        debug!(resource_type, "medication: folded suggested resource into draft");
        ActionOutcome::Applied
    }
}

/// Renders the draft as the FHIR order resource for `version`. `None` when
/// no medication has been chosen yet.
pub fn create_fhir_resource(
    version: FhirVersion,
    patient_id: Option<&PatientId>,
    medication: &MedicationState,
) -> Option<Value> {
    let prescribable = medication.prescribable.as_ref()?;

    let medication_concept = json!({
        "text": prescribable.name,
        "coding": [{
            "display": prescribable.name,
            "system": RXNORM_SYSTEM,
            "code": prescribable.code,
        }],
    });

    let mut repeat = Map::new();
    repeat.insert(
        "frequency".into(),
        json!(medication.instructions.frequency.times_per_day()),
    );
    repeat.insert("period".into(), json!(1));
    let period_unit_key = match version {
        FhirVersion::Dstu2 => "periodUnits",
        FhirVersion::Stu3 | FhirVersion::R4 => "periodUnit",
    };
    repeat.insert(period_unit_key.into(), json!("d"));

    let start = medication.dates.start.effective();
    let end = medication.dates.end.effective();
    if start.is_some() || end.is_some() {
        let mut bounds = Map::new();
        if let Some(start) = start {
            bounds.insert("start".into(), json!(start.format("%Y-%m-%d").to_string()));
        }
        if let Some(end) = end {
            bounds.insert("end".into(), json!(end.format("%Y-%m-%d").to_string()));
        }
        repeat.insert("boundsPeriod".into(), Value::Object(bounds));
    }

    let dose_quantity = json!({ "value": medication.instructions.number });
    let mut dosage = Map::new();
    dosage.insert("timing".into(), json!({ "repeat": Value::Object(repeat) }));
    match version {
        FhirVersion::Dstu2 | FhirVersion::Stu3 => {
            dosage.insert("doseQuantity".into(), dose_quantity);
        }
        FhirVersion::R4 => {
            dosage.insert("doseAndRate".into(), json!([{ "doseQuantity": dose_quantity }]));
        }
    }

    let patient_reference = patient_id.map(|id| json!({ "reference": format!("Patient/{id}") }));
    let dispense_request = json!({
        "numberOfRepeatsAllowed": 1,
        "expectedSupplyDuration": {
            "value": medication.supply_duration,
            "unit": "days",
            "system": "http://unitsofmeasure.org",
            "code": "d",
        },
    });

    let mut resource = Map::new();
    match version {
        FhirVersion::Dstu2 => {
            resource.insert("resourceType".into(), json!("MedicationOrder"));
            resource.insert("id".into(), json!(DRAFT_ORDER_ID));
            resource.insert("status".into(), json!("draft"));
            if let Some(reference) = patient_reference {
                resource.insert("patient".into(), reference);
            }
        }
        FhirVersion::Stu3 | FhirVersion::R4 => {
            resource.insert("resourceType".into(), json!("MedicationRequest"));
            resource.insert("id".into(), json!(DRAFT_ORDER_ID));
            resource.insert("status".into(), json!("draft"));
            resource.insert("intent".into(), json!("order"));
            if let Some(reference) = patient_reference {
                resource.insert("subject".into(), reference);
            }
        }
    }
    resource.insert("medicationCodeableConcept".into(), medication_concept);
    resource.insert("dosageInstruction".into(), json!([Value::Object(dosage)]));
    resource.insert("dispenseRequest".into(), dispense_request);

    Some(Value::Object(resource))
}

#[cfg(test)]
#[path = "tests/medication_tests.rs"]
mod tests;
