use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

id_newtype!(HookId);
id_newtype!(ActionTag);
id_newtype!(PatientId);

impl HookId {
    /// Wire-level hook name. Handler keys may be scoped by view
    /// (`rx-sign/order-sign`); services only see the trailing segment.
    pub fn hook_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }
}

impl ActionTag {
    pub const PATIENT_SELECTED: &'static str = "patient-selected";
    pub const MEDICATION_CHOSEN: &'static str = "medication-chosen";
    pub const DOSAGE_CHANGED: &'static str = "dosage-changed";
    pub const DISPENSE_CHANGED: &'static str = "dispense-changed";
    pub const DATE_CHANGED: &'static str = "date-changed";
    pub const SUGGESTION_TAKEN: &'static str = "suggestion-taken";
    pub const SIGN_ORDER: &'static str = "sign-order";

    pub fn sign_order() -> Self {
        Self::new(Self::SIGN_ORDER)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FhirVersion {
    Dstu2,
    Stu3,
    #[default]
    R4,
}

impl FhirVersion {
    /// Maps a capability statement `fhirVersion` string onto a release.
    pub fn from_capability_version(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.starts_with("1.0") {
            Some(Self::Dstu2)
        } else if raw.starts_with("3.") || raw.starts_with("1.") {
            Some(Self::Stu3)
        } else if raw.starts_with("4.") {
            Some(Self::R4)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DoseFrequency {
    #[default]
    Daily,
    Bid,
    Tid,
    Qid,
}

impl DoseFrequency {
    pub fn times_per_day(self) -> u32 {
        match self {
            Self::Daily => 1,
            Self::Bid => 2,
            Self::Tid => 3,
            Self::Qid => 4,
        }
    }

    pub fn from_times_per_day(times: u64) -> Option<Self> {
        match times {
            1 => Some(Self::Daily),
            2 => Some(Self::Bid),
            3 => Some(Self::Tid),
            4 => Some(Self::Qid),
            _ => None,
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "daily" => Some(Self::Daily),
            "bid" | "twice-daily" => Some(Self::Bid),
            "tid" | "three-daily" => Some(Self::Tid),
            "qid" | "four-daily" => Some(Self::Qid),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DateRangeKind {
    Start,
    End,
}
