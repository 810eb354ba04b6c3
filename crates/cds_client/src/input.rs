use shared::error::SandboxError;
use url::Url;

pub const EMPTY_FHIR_SERVER_MESSAGE: &str = "Enter a valid FHIR server base URL";
pub const EMPTY_DISCOVERY_MESSAGE: &str = "Enter a valid discovery endpoint";

/// Validates a user-typed endpoint. Inputs without a scheme are taken as
/// plain `http://` URLs; a trailing slash is dropped.
pub fn normalize_endpoint(input: &str, empty_message: &str) -> Result<String, SandboxError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(SandboxError::validation(empty_message));
    }

    let lowered = trimmed.to_ascii_lowercase();
    let candidate = if lowered.starts_with("http://") || lowered.starts_with("https://") {
        trimmed.to_string()
    } else if let Some(rest) = trimmed.strip_prefix("//") {
        format!("http://{rest}")
    } else {
        format!("http://{trimmed}")
    };

    let parsed = Url::parse(&candidate)
        .map_err(|err| SandboxError::validation(format!("{empty_message}: {err}")))?;
    if parsed.host_str().is_none() {
        return Err(SandboxError::validation(empty_message));
    }

    Ok(candidate.trim_end_matches('/').to_string())
}
