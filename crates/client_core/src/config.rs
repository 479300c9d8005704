use std::{fs, path::Path, time::Duration};

use anyhow::Context;
use serde::Deserialize;

use crate::local_id::{DEFAULT_INCREMENT_THOUSANDTHS, DEFAULT_MAX_STEPS};

pub const SETTINGS_FILE: &str = "echo_client.toml";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EchoSettings {
    pub server_url: String,
    pub local_id_increment_thousandths: i64,
    pub max_local_steps: i64,
    pub slow_send_threshold_ms: u64,
    pub event_catchup_ms: u64,
    pub event_buffer: usize,
    pub backend_only_markers: Vec<String>,
}

impl Default for EchoSettings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8443".into(),
            local_id_increment_thousandths: DEFAULT_INCREMENT_THOUSANDTHS,
            max_local_steps: DEFAULT_MAX_STEPS,
            slow_send_threshold_ms: 5_000,
            event_catchup_ms: 5_000,
            event_buffer: 1024,
            backend_only_markers: vec!["$$".into(), "```math".into()],
        }
    }
}

impl EchoSettings {
    pub fn slow_send_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_send_threshold_ms)
    }

    pub fn event_catchup_after(&self) -> Duration {
        Duration::from_millis(self.event_catchup_ms)
    }

    /// Applies `APP__*` overrides. Unparseable numbers are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("APP__SERVER_URL") {
            self.server_url = v;
        }
        if let Some(v) = lookup("APP__LOCAL_ID_INCREMENT").and_then(|v| v.parse().ok()) {
            self.local_id_increment_thousandths = v;
        }
        if let Some(v) = lookup("APP__MAX_LOCAL_STEPS").and_then(|v| v.parse().ok()) {
            self.max_local_steps = v;
        }
        if let Some(v) = lookup("APP__SLOW_SEND_THRESHOLD_MS").and_then(|v| v.parse().ok()) {
            self.slow_send_threshold_ms = v;
        }
        if let Some(v) = lookup("APP__EVENT_CATCHUP_MS").and_then(|v| v.parse().ok()) {
            self.event_catchup_ms = v;
        }
        if let Some(v) = lookup("APP__EVENT_BUFFER").and_then(|v| v.parse().ok()) {
            self.event_buffer = v;
        }
    }
}

pub fn load_settings_from(path: &Path) -> anyhow::Result<EchoSettings> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read settings file {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("invalid settings file {}", path.display()))
}

/// Defaults, then `echo_client.toml` if present, then the environment.
pub fn load_settings() -> anyhow::Result<EchoSettings> {
    let path = Path::new(SETTINGS_FILE);
    let mut settings = if path.exists() {
        load_settings_from(path)?
    } else {
        EchoSettings::default()
    };
    settings.apply_overrides(|key| std::env::var(key).ok());
    Ok(settings)
}
