use reqwest::{header, Client};
use shared::protocol::{DiscoveryResponse, ServiceDescriptor};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("discovery request to {url} failed: {message}")]
    Transport { url: String, message: String },
    #[error("discovery endpoint {url} answered with status {status}")]
    Status { url: String, status: u16 },
    #[error("invalid discovery document from {url}: {message}")]
    Decode { url: String, message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConfiguredService {
    pub url: String,
    pub descriptor: ServiceDescriptor,
    pub enabled: bool,
}

/// Services keyed by URL, kept in configuration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfiguredServices {
    entries: Vec<ConfiguredService>,
}

impl ConfiguredServices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces the service at `url`. A replaced service keeps its
    /// position and enabled flag.
    pub fn insert(&mut self, url: impl Into<String>, descriptor: ServiceDescriptor) {
        let url = url.into();
        if let Some(existing) = self.entries.iter_mut().find(|entry| entry.url == url) {
            existing.descriptor = descriptor;
            return;
        }
        self.entries.push(ConfiguredService {
            url,
            descriptor,
            enabled: true,
        });
    }

    pub fn remove(&mut self, url: &str) -> Option<ConfiguredService> {
        let index = self.entries.iter().position(|entry| entry.url == url)?;
        Some(self.entries.remove(index))
    }

    pub fn set_enabled(&mut self, url: &str, enabled: bool) -> bool {
        match self.entries.iter_mut().find(|entry| entry.url == url) {
            Some(entry) => {
                entry.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, url: &str) -> Option<&ConfiguredService> {
        self.entries.iter().find(|entry| entry.url == url)
    }

    /// Enabled services implementing `hook_name`, in configuration order.
    pub fn for_hook(&self, hook_name: &str) -> Vec<ConfiguredService> {
        self.entries
            .iter()
            .filter(|entry| entry.enabled && entry.descriptor.hook == hook_name)
            .cloned()
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConfiguredService> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

pub fn service_url(discovery_url: &str, service_id: &str) -> String {
    format!("{}/{}", discovery_url.trim_end_matches('/'), service_id)
}

pub struct DiscoveryClient {
    http: Client,
}

impl DiscoveryClient {
    pub fn new(http: Client) -> Self {
        Self { http }
    }

    /// Fetches the discovery document and returns each service paired with
    /// the URL it is invoked at.
    pub async fn fetch(
        &self,
        discovery_url: &str,
    ) -> Result<Vec<(String, ServiceDescriptor)>, DiscoveryError> {
        let discovery_url = discovery_url.trim_end_matches('/');
        let response = self
            .http
            .get(discovery_url)
            .header(header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|err| DiscoveryError::Transport {
                url: discovery_url.to_string(),
                message: err.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(DiscoveryError::Status {
                url: discovery_url.to_string(),
                status: status.as_u16(),
            });
        }

        let document: DiscoveryResponse =
            response.json().await.map_err(|err| DiscoveryError::Decode {
                url: discovery_url.to_string(),
                message: err.to_string(),
            })?;

        info!(
            discovery_url,
            services = document.services.len(),
            "discovery: services retrieved"
        );
        Ok(document
            .services
            .into_iter()
            .map(|descriptor| (service_url(discovery_url, &descriptor.id), descriptor))
            .collect())
    }
}

#[cfg(test)]
#[path = "tests/discovery_tests.rs"]
mod tests;
