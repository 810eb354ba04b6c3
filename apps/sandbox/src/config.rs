use std::{fs, path::Path, time::Duration};

use cds_client::{
    auth::ServiceTokenConfig, CdsClientOptions, DEFAULT_DISCOVERY_URL, DEFAULT_FHIR_SERVER,
};
use tracing::warn;

pub const CONFIG_FILE: &str = "sandbox.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub fhir_server: String,
    pub discovery_urls: Vec<String>,
    pub patient_id: Option<String>,
    pub user_id: Option<String>,
    pub issuer: String,
    pub jwt_secret: Option<String>,
    pub request_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            fhir_server: DEFAULT_FHIR_SERVER.into(),
            discovery_urls: vec![DEFAULT_DISCOVERY_URL.into()],
            patient_id: None,
            user_id: None,
            issuer: "https://sandbox.cds-hooks.org".into(),
            jwt_secret: None,
            request_timeout_secs: 30,
        }
    }
}

impl Settings {
    pub fn client_options(&self) -> CdsClientOptions {
        CdsClientOptions {
            default_fhir_server: self.fhir_server.clone(),
            user_id: self.user_id.clone(),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            service_auth: self
                .jwt_secret
                .as_ref()
                .map(|secret| ServiceTokenConfig::new(self.issuer.clone(), secret.clone())),
            ..CdsClientOptions::default()
        }
    }
}

pub fn load_settings() -> Settings {
    load_settings_from(Path::new(CONFIG_FILE), |key| std::env::var(key).ok())
}

/// Defaults, then the config file, then `CDS_*` and finally `APP__*`
/// variables.
pub fn load_settings_from(path: &Path, env: impl Fn(&str) -> Option<String>) -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        match toml::from_str::<toml::Table>(&raw) {
            Ok(file_cfg) => apply_file(&mut settings, &file_cfg),
            Err(err) => warn!(path = %path.display(), "config: ignoring unreadable file: {err}"),
        }
    }

    for prefix in ["CDS_", "APP__"] {
        let var = |key: &str| env(&format!("{prefix}{key}"));
        if let Some(v) = var("FHIR_SERVER") {
            settings.fhir_server = v;
        }
        if let Some(v) = var("DISCOVERY_URLS") {
            settings.discovery_urls = split_list(&v);
        }
        if let Some(v) = var("PATIENT_ID") {
            settings.patient_id = Some(v);
        }
        if let Some(v) = var("USER_ID") {
            settings.user_id = Some(v);
        }
        if let Some(v) = var("ISSUER") {
            settings.issuer = v;
        }
        if let Some(v) = var("JWT_SECRET") {
            settings.jwt_secret = Some(v);
        }
        if let Some(v) = var("REQUEST_TIMEOUT_SECS") {
            if let Ok(parsed) = v.parse::<u64>() {
                settings.request_timeout_secs = parsed;
            }
        }
    }

    settings
}

fn apply_file(settings: &mut Settings, file_cfg: &toml::Table) {
    let text = |key: &str| file_cfg.get(key).and_then(toml::Value::as_str);

    if let Some(v) = text("fhir_server") {
        settings.fhir_server = v.to_string();
    }
    match file_cfg.get("discovery_urls") {
        Some(toml::Value::String(v)) => settings.discovery_urls = split_list(v),
        Some(toml::Value::Array(values)) => {
            settings.discovery_urls = values
                .iter()
                .filter_map(toml::Value::as_str)
                .map(str::to_string)
                .collect();
        }
        _ => {}
    }
    if let Some(v) = text("patient_id") {
        settings.patient_id = Some(v.to_string());
    }
    if let Some(v) = text("user_id") {
        settings.user_id = Some(v.to_string());
    }
    if let Some(v) = text("issuer") {
        settings.issuer = v.to_string();
    }
    if let Some(v) = text("jwt_secret") {
        settings.jwt_secret = Some(v.to_string());
    }
    if let Some(v) = file_cfg
        .get("request_timeout_secs")
        .and_then(toml::Value::as_integer)
        .and_then(|v| u64::try_from(v).ok())
    {
        settings.request_timeout_secs = v;
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
