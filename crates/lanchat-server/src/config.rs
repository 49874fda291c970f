//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration on a LAN.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use lanchat_shared::constants::{CHAT_PROTOCOL_PORT, PUBLIC_ROOM_NAME};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the chat listener.
    /// Env: `CHAT_ADDR`
    /// Default: `0.0.0.0:60000`
    pub chat_addr: SocketAddr,

    /// Root folder for uploaded files, one sub-folder per room or client.
    /// Env: `STORAGE_PATH`
    /// Default: `./chat_files`
    pub storage_path: PathBuf,

    /// Display name of the permanent room every client starts in.
    /// Env: `DEFAULT_ROOM_NAME`
    /// Default: `Public Room`
    pub default_room_name: String,

    /// How long a new connection may take to send its connection request.
    /// Env: `HANDSHAKE_TIMEOUT_SECS`
    /// Default: `10`
    pub handshake_timeout: Duration,

    /// Bound on every chat send and every file-transfer read/write.
    /// Env: `IO_TIMEOUT_SECS`
    /// Default: `30`
    pub io_timeout: Duration,

    /// How long an upload listener waits for the client to connect.
    /// Env: `TRANSFER_ACCEPT_TIMEOUT_SECS`
    /// Default: `60`
    pub transfer_accept_timeout: Duration,

    /// Maximum number of concurrently connected clients (0 = unlimited).
    /// Env: `MAX_CLIENTS`
    /// Default: `0`
    pub max_clients: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            chat_addr: ([0, 0, 0, 0], CHAT_PROTOCOL_PORT).into(),
            storage_path: PathBuf::from("./chat_files"),
            default_room_name: PUBLIC_ROOM_NAME.to_string(),
            handshake_timeout: Duration::from_secs(10),
            io_timeout: Duration::from_secs(30),
            transfer_accept_timeout: Duration::from_secs(60),
            max_clients: 0,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = lookup("CHAT_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.chat_addr = parsed;
            } else {
                tracing::warn!(value = %addr, "Invalid CHAT_ADDR, using default");
            }
        }

        if let Some(path) = lookup("STORAGE_PATH") {
            config.storage_path = PathBuf::from(path);
        }

        if let Some(name) = lookup("DEFAULT_ROOM_NAME") {
            let name = lanchat_shared::types::sanitize_name(&name);
            if name.is_empty() {
                tracing::warn!("Empty DEFAULT_ROOM_NAME, using default");
            } else {
                config.default_room_name = name;
            }
        }

        if let Some(secs) = lookup("HANDSHAKE_TIMEOUT_SECS") {
            if let Some(d) = parse_secs("HANDSHAKE_TIMEOUT_SECS", &secs) {
                config.handshake_timeout = d;
            }
        }

        if let Some(secs) = lookup("IO_TIMEOUT_SECS") {
            if let Some(d) = parse_secs("IO_TIMEOUT_SECS", &secs) {
                config.io_timeout = d;
            }
        }

        if let Some(secs) = lookup("TRANSFER_ACCEPT_TIMEOUT_SECS") {
            if let Some(d) = parse_secs("TRANSFER_ACCEPT_TIMEOUT_SECS", &secs) {
                config.transfer_accept_timeout = d;
            }
        }

        if let Some(val) = lookup("MAX_CLIENTS") {
            if let Ok(n) = val.trim().parse::<usize>() {
                config.max_clients = n;
            } else {
                tracing::warn!(value = %val, "Invalid MAX_CLIENTS, using default");
            }
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter.

        config
    }
}

/// Whole seconds, strictly positive.
fn parse_secs(key: &str, value: &str) -> Option<Duration> {
    match value.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => Some(Duration::from_secs(secs)),
        _ => {
            tracing::warn!(key, value, "Invalid duration, using default");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.chat_addr, ([0, 0, 0, 0], 60000).into());
        assert_eq!(config.default_room_name, "Public Room");
        assert_eq!(config.max_clients, 0);
    }

    #[test]
    fn test_overrides_applied() {
        let config = ServerConfig::from_lookup(lookup_from(&[
            ("CHAT_ADDR", "127.0.0.1:7000"),
            ("STORAGE_PATH", "/tmp/chat"),
            ("IO_TIMEOUT_SECS", "5"),
            ("MAX_CLIENTS", "12"),
        ]));
        assert_eq!(config.chat_addr, "127.0.0.1:7000".parse().unwrap());
        assert_eq!(config.storage_path, PathBuf::from("/tmp/chat"));
        assert_eq!(config.io_timeout, Duration::from_secs(5));
        assert_eq!(config.max_clients, 12);
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let config = ServerConfig::from_lookup(lookup_from(&[
            ("CHAT_ADDR", "not an address"),
            ("HANDSHAKE_TIMEOUT_SECS", "0"),
            ("MAX_CLIENTS", "many"),
            ("DEFAULT_ROOM_NAME", "   "),
        ]));
        let defaults = ServerConfig::default();
        assert_eq!(config.chat_addr, defaults.chat_addr);
        assert_eq!(config.handshake_timeout, defaults.handshake_timeout);
        assert_eq!(config.max_clients, 0);
        assert_eq!(config.default_room_name, "Public Room");
    }
}
