//! Participant configuration loading.
//!
//! TOML is the sole config source; the binary's flags may override single
//! fields afterwards.  Default config path: `/etc/lockstep/participant.toml`.
//!
//! # Required fields
//! - `schema_version = 1`
//! - `display_name`
//! - `server.url`
//! - `auth.token_file`
//!
//! # Token file format
//! Raw token string on a single line; trimmed on read.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("missing required field '{0}'")]
    MissingField(String),
    #[error("invalid value: {0}")]
    InvalidValue(String),
}

// ---------------------------------------------------------------------------
// Config types (validated)
// ---------------------------------------------------------------------------

/// Top-level participant configuration.
#[derive(Debug, Clone)]
pub struct ParticipantConfig {
    pub schema_version: u32,
    /// Name shown to the other peers in the room.
    pub display_name: String,
    /// WebSocket URL of the room endpoint, e.g. `wss://watch.example.com/ws`.
    pub server_url: String,
    /// The auth token (read from the token file, not the file path).
    pub token: String,
    /// Per-request deadline for the session layer.
    pub request_timeout: Duration,
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    display_name: Option<String>,
    server: Option<RawServerConfig>,
    auth: Option<RawAuthConfig>,
    session: Option<RawSessionConfig>,
}

#[derive(Debug, Deserialize)]
struct RawServerConfig {
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawAuthConfig {
    token_file: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawSessionConfig {
    request_timeout_ms: Option<u64>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5_000;

/// Load participant config from the default path
/// `/etc/lockstep/participant.toml`.
pub fn load_config() -> Result<ParticipantConfig, ConfigError> {
    load_config_from_path(Path::new("/etc/lockstep/participant.toml"))
}

/// Load participant config from a custom path.
pub fn load_config_from_path(path: &Path) -> Result<ParticipantConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

/// Load participant config from a TOML string.
pub fn load_config_from_str(toml_str: &str) -> Result<ParticipantConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let schema_version = raw
        .schema_version
        .ok_or_else(|| ConfigError::MissingField("schema_version".to_owned()))?;
    if schema_version != 1 {
        return Err(ConfigError::InvalidValue(format!(
            "schema_version must be 1, got {schema_version}"
        )));
    }

    let display_name = raw
        .display_name
        .filter(|name| !name.trim().is_empty())
        .ok_or_else(|| ConfigError::MissingField("display_name".to_owned()))?;

    let server_url = raw
        .server
        .and_then(|server| server.url)
        .ok_or_else(|| ConfigError::MissingField("server.url".to_owned()))?;
    if !server_url.starts_with("ws://") && !server_url.starts_with("wss://") {
        return Err(ConfigError::InvalidValue(format!(
            "server.url must be a ws:// or wss:// URL, got '{server_url}'"
        )));
    }

    let token_file = raw
        .auth
        .and_then(|auth| auth.token_file)
        .ok_or_else(|| ConfigError::MissingField("auth.token_file".to_owned()))?;
    let token = std::fs::read_to_string(&token_file)
        .map_err(|e| ConfigError::Io(format!("reading token file '{token_file}': {e}")))?
        .trim()
        .to_owned();
    if token.is_empty() {
        return Err(ConfigError::InvalidValue(format!(
            "token file '{token_file}' is empty"
        )));
    }

    let request_timeout_ms = raw
        .session
        .and_then(|session| session.request_timeout_ms)
        .unwrap_or(DEFAULT_REQUEST_TIMEOUT_MS);
    if request_timeout_ms == 0 {
        return Err(ConfigError::InvalidValue(
            "session.request_timeout_ms must be positive".to_owned(),
        ));
    }

    Ok(ParticipantConfig {
        schema_version,
        display_name,
        server_url,
        token,
        request_timeout: Duration::from_millis(request_timeout_ms),
    })
}
