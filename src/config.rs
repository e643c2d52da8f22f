// Конфигурация клиента
// Логирование по умолчанию включено только в debug-сборке

use crate::error::{CallError, Result};
use crate::peer::types::ServerConfig;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[cfg(debug_assertions)]
pub const LOGGING_ENABLED: bool = true;

#[cfg(not(debug_assertions))]
pub const LOGGING_ENABLED: bool = false; // в release нужен явный фильтр

#[cfg(debug_assertions)]
pub mod dev {
    // фильтр по умолчанию для отладочной сборки
    pub const DEFAULT_FILTER: &str = "peercall_lib=debug,peercall=debug,webrtc=warn";
}

#[cfg(not(debug_assertions))]
pub mod dev {
    pub const DEFAULT_FILTER: &str = "peercall_lib=info,peercall=info,webrtc=error";
}

/// Публичные STUN Google, если свои серверы не заданы
pub static DEFAULT_ICE_SERVERS: Lazy<Vec<ServerConfig>> = Lazy::new(|| {
    vec![
        ServerConfig {
            id: "default-stun".into(),
            r#type: "stun".into(),
            url: "stun:stun.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
        ServerConfig {
            id: "default-stun-1".into(),
            r#type: "stun".into(),
            url: "stun:stun1.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
    ]
});

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    pub relay_url: String,
    pub ice_servers: Vec<ServerConfig>,
    pub data_channel_label: String,
    pub join_timeout_ms: u64,
    /// EnvFilter-директива; `None` значит фильтр по умолчанию
    pub log_filter: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_url: "ws://127.0.0.1:8000/relay".into(),
            ice_servers: DEFAULT_ICE_SERVERS.clone(),
            data_channel_label: "chat".into(),
            join_timeout_ms: 10_000,
            log_filter: None,
        }
    }
}

impl ClientConfig {
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: ClientConfig =
            toml::from_str(text).map_err(|e| CallError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            CallError::InvalidConfig(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml(&text)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.relay_url.is_empty() {
            return Err(CallError::InvalidConfig("relay_url cannot be empty".into()));
        }
        if self.data_channel_label.is_empty() {
            return Err(CallError::InvalidConfig(
                "data_channel_label cannot be empty".into(),
            ));
        }
        if self.join_timeout_ms == 0 {
            return Err(CallError::InvalidConfig(
                "join_timeout_ms must be positive".into(),
            ));
        }
        for server in &self.ice_servers {
            if server.url.is_empty() {
                return Err(CallError::InvalidConfig(format!(
                    "ICE server '{}' has an empty url",
                    server.id
                )));
            }
            if server.r#type == "turn" && (server.username.is_none() || server.credential.is_none())
            {
                return Err(CallError::InvalidConfig(format!(
                    "TURN server '{}' requires username and credential",
                    server.id
                )));
            }
        }
        Ok(())
    }
}
