use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use serde_json::Value;
use shared::domain::FhirVersion;
use thiserror::Error;
use tracing::{debug, warn};

const FHIR_ACCEPT: &str = "application/fhir+json, application/json";

#[derive(Debug, Error)]
pub enum FhirError {
    #[error("FHIR endpoint {url} requires authorization")]
    Unauthorized { url: String },
    #[error("FHIR request to {url} failed with status {status}")]
    Status { url: String, status: u16 },
    #[error("FHIR request to {url} failed: {message}")]
    Transport { url: String, message: String },
    #[error("invalid FHIR response from {url}: {message}")]
    Decode { url: String, message: String },
}

#[async_trait]
pub trait FhirRetriever: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Value, FhirError>;
}

pub struct HttpFhirRetriever {
    http: Client,
}

impl HttpFhirRetriever {
    pub fn new(http: Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl FhirRetriever for HttpFhirRetriever {
    async fn fetch(&self, url: &str) -> Result<Value, FhirError> {
        let response = self
            .http
            .get(url)
            .header(header::ACCEPT, FHIR_ACCEPT)
            .send()
            .await
            .map_err(|err| FhirError::Transport {
                url: url.to_string(),
                message: err.to_string(),
            })?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(FhirError::Unauthorized {
                url: url.to_string(),
            });
        }
        if !status.is_success() {
            return Err(FhirError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        debug!(url, status = status.as_u16(), "fhir: resource fetched");
        response.json::<Value>().await.map_err(|err| FhirError::Decode {
            url: url.to_string(),
            message: err.to_string(),
        })
    }
}

pub fn metadata_url(base: &str) -> String {
    resource_url(base, "metadata")
}

pub fn resource_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Release advertised by a capability statement, R4 when it says nothing
/// recognisable.
pub fn fhir_version_from_metadata(metadata: &Value) -> FhirVersion {
    let raw = metadata
        .get("fhirVersion")
        .and_then(Value::as_str)
        .unwrap_or_default();
    FhirVersion::from_capability_version(raw).unwrap_or_else(|| {
        warn!(fhir_version = raw, "fhir: unrecognised version, assuming R4");
        FhirVersion::default()
    })
}
