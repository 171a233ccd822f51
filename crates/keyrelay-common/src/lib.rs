use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum GlobalConfigError {
    #[error("missing required global config field: {0}")]
    MissingField(&'static str),
}

/// Final, merged global configuration used by the running process.
///
/// Merge order: CLI > ENV > default. No outbound proxy and no database DSN:
/// persistence is the JSON usage store under `data_dir`, not a SQL backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalConfig {
    pub host: String,
    pub port: u16,
    /// Stored as a hash (not plaintext).
    pub admin_key_hash: String,
    /// Root directory for `oauth_creds/` and per-provider usage JSON files.
    pub data_dir: String,
    /// Whether to redact sensitive fields in emitted events.
    pub event_redact_sensitive: bool,
    /// Per-attempt upstream timeout, in seconds.
    pub global_timeout_secs: u64,
    /// Cap on credential-rotation attempts per inbound request.
    pub max_retries: u32,
    /// Request-count band treated as tied when `RotationMode::Balanced`
    /// orders candidates; `0` means "exact count match only".
    pub rotation_tolerance: u64,
    /// Skips the preemptive OAuth refresh pass at startup.
    pub skip_oauth_init_check: bool,
}

/// Optional layer used for merging global config.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GlobalConfigPatch {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub admin_key_hash: Option<String>,
    pub data_dir: Option<String>,
    pub event_redact_sensitive: Option<bool>,
    pub global_timeout_secs: Option<u64>,
    pub max_retries: Option<u32>,
    pub rotation_tolerance: Option<u64>,
    pub skip_oauth_init_check: Option<bool>,
}

impl GlobalConfigPatch {
    pub fn overlay(&mut self, other: GlobalConfigPatch) {
        if other.host.is_some() {
            self.host = other.host;
        }
        if other.port.is_some() {
            self.port = other.port;
        }
        if other.admin_key_hash.is_some() {
            self.admin_key_hash = other.admin_key_hash;
        }
        if other.data_dir.is_some() {
            self.data_dir = other.data_dir;
        }
        if other.event_redact_sensitive.is_some() {
            self.event_redact_sensitive = other.event_redact_sensitive;
        }
        if other.global_timeout_secs.is_some() {
            self.global_timeout_secs = other.global_timeout_secs;
        }
        if other.max_retries.is_some() {
            self.max_retries = other.max_retries;
        }
        if other.rotation_tolerance.is_some() {
            self.rotation_tolerance = other.rotation_tolerance;
        }
        if other.skip_oauth_init_check.is_some() {
            self.skip_oauth_init_check = other.skip_oauth_init_check;
        }
    }

    pub fn into_config(self) -> Result<GlobalConfig, GlobalConfigError> {
        Ok(GlobalConfig {
            host: self.host.unwrap_or_else(|| "0.0.0.0".to_string()),
            port: self.port.unwrap_or(8787),
            admin_key_hash: self
                .admin_key_hash
                .ok_or(GlobalConfigError::MissingField("admin_key_hash"))?,
            data_dir: self.data_dir.unwrap_or_else(|| "./data".to_string()),
            event_redact_sensitive: self.event_redact_sensitive.unwrap_or(true),
            global_timeout_secs: self.global_timeout_secs.unwrap_or(600),
            max_retries: self.max_retries.unwrap_or(8),
            rotation_tolerance: self.rotation_tolerance.unwrap_or(0),
            skip_oauth_init_check: self.skip_oauth_init_check.unwrap_or(false),
        })
    }
}

impl From<GlobalConfig> for GlobalConfigPatch {
    fn from(value: GlobalConfig) -> Self {
        Self {
            host: Some(value.host),
            port: Some(value.port),
            admin_key_hash: Some(value.admin_key_hash),
            data_dir: Some(value.data_dir),
            event_redact_sensitive: Some(value.event_redact_sensitive),
            global_timeout_secs: Some(value.global_timeout_secs),
            max_retries: Some(value.max_retries),
            rotation_tolerance: Some(value.rotation_tolerance),
            skip_oauth_init_check: Some(value.skip_oauth_init_check),
        }
    }
}
