use crate::Role;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Protocol constants
pub mod protocol {
    /// ALPN token negotiated by both sides
    pub const ALPN: &[u8] = b"quicmux";

    /// Default bind/connect host
    pub const DEFAULT_HOST: &str = "127.0.0.1";

    /// Default UDP port
    pub const DEFAULT_PORT: u16 = 4433;

    /// Server name presented for TLS verification when none is configured
    pub const DEFAULT_SERVER_NAME: &str = "localhost";

    /// Maximum accumulated size of one request or response (10 MB)
    pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

    /// How long `start()` waits for the handshake
    pub const CONNECT_TIMEOUT_MS: u64 = 10_000;

    /// How long `close()` lets in-flight requests finish
    pub const CLOSE_GRACE_MS: u64 = 2_000;

    /// Idle timeout negotiated with the peer
    pub const IDLE_TIMEOUT_MS: u64 = 60_000;

    /// Keep-alive interval
    pub const KEEP_ALIVE_MS: u64 = 5_000;

    /// Concurrent bidirectional streams the peer may open
    pub const MAX_CONCURRENT_STREAMS: u32 = 1024;

    /// Application close code for an orderly shutdown
    pub const CLOSE_CODE_OK: u32 = 0;

    /// Stream reset code: the handler produced no reply for the final chunk
    pub const RESET_NO_REPLY: u32 = 1;

    /// Stream reset code: the handler failed
    pub const RESET_HANDLER_FAILED: u32 = 2;

    /// Stream reset code: the inbound message exceeded the size limit
    pub const RESET_TOO_LARGE: u32 = 3;
}

/// How the server feeds inbound stream data to the handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// Accumulate the whole request, call the handler once when the peer ends the stream
    #[default]
    Buffered,

    /// Call the handler for every inbound chunk, mirroring each chunk's end flag
    PerChunk,
}

/// Endpoint configuration, consumed once at `start()`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Host to bind (server) or connect to (client)
    pub host: String,

    /// UDP port
    pub port: u16,

    /// PEM certificate chain (server)
    pub cert_path: Option<PathBuf>,

    /// PEM private key (server)
    pub key_path: Option<PathBuf>,

    /// PEM trust anchors used to verify the server (client)
    pub ca_path: Option<PathBuf>,

    /// Name checked against the server certificate
    pub server_name: Option<String>,

    /// Skip server certificate verification (development only)
    pub insecure: bool,

    /// Server handler feeding mode
    pub dispatch_mode: DispatchMode,

    /// Upper bound on one accumulated message
    pub max_message_size: usize,

    pub connect_timeout_ms: u64,

    pub close_grace_ms: u64,

    pub idle_timeout_ms: u64,

    pub keep_alive_ms: u64,

    pub max_concurrent_streams: u32,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            host: protocol::DEFAULT_HOST.to_string(),
            port: protocol::DEFAULT_PORT,
            cert_path: None,
            key_path: None,
            ca_path: None,
            server_name: None,
            insecure: false,
            dispatch_mode: DispatchMode::default(),
            max_message_size: protocol::MAX_MESSAGE_SIZE,
            connect_timeout_ms: protocol::CONNECT_TIMEOUT_MS,
            close_grace_ms: protocol::CLOSE_GRACE_MS,
            idle_timeout_ms: protocol::IDLE_TIMEOUT_MS,
            keep_alive_ms: protocol::KEEP_ALIVE_MS,
            max_concurrent_streams: protocol::MAX_CONCURRENT_STREAMS,
        }
    }
}

impl EndpointConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.cert_path = Some(path.into());
        self
    }

    pub fn with_key(mut self, path: impl Into<PathBuf>) -> Self {
        self.key_path = Some(path.into());
        self
    }

    pub fn with_ca(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_path = Some(path.into());
        self
    }

    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    pub fn insecure(mut self, value: bool) -> Self {
        self.insecure = value;
        self
    }

    pub fn with_dispatch_mode(mut self, mode: DispatchMode) -> Self {
        self.dispatch_mode = mode;
        self
    }

    pub fn with_max_message_size(mut self, limit: usize) -> Self {
        self.max_message_size = limit;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = duration_to_ms(timeout);
        self
    }

    pub fn with_close_grace(mut self, grace: Duration) -> Self {
        self.close_grace_ms = duration_to_ms(grace);
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_millis(self.keep_alive_ms)
    }

    /// Name presented for SNI and checked against the server certificate
    pub fn effective_server_name(&self) -> &str {
        match &self.server_name {
            Some(name) => name.as_str(),
            None if self.host.parse::<std::net::IpAddr>().is_ok() => protocol::DEFAULT_SERVER_NAME,
            None => self.host.as_str(),
        }
    }

    /// Check that the configuration can start an endpoint playing `role`
    pub fn validate(&self, role: Role) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::Invalid("host must not be empty".to_string()));
        }
        if self.max_message_size == 0 {
            return Err(ConfigError::Invalid(
                "max_message_size must be greater than zero".to_string(),
            ));
        }
        if self.max_concurrent_streams == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_streams must be greater than zero".to_string(),
            ));
        }

        match role {
            Role::Server => {
                if self.cert_path.is_none() || self.key_path.is_none() {
                    return Err(ConfigError::Invalid(
                        "server requires both a certificate and a private key".to_string(),
                    ));
                }
            }
            Role::Client => {
                if self.port == 0 {
                    return Err(ConfigError::Invalid("client needs a non-zero port".to_string()));
                }
                if !self.insecure && self.ca_path.is_none() {
                    return Err(ConfigError::Invalid(
                        "client verification needs a CA bundle (with_ca) or insecure mode".to_string(),
                    ));
                }
            }
        }

        Ok(())
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError(e.to_string()))?;

        toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let contents =
            toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, contents).map_err(|e| ConfigError::WriteError(e.to_string()))?;

        Ok(())
    }
}

fn duration_to_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Failed to serialize config: {0}")]
    SerializeError(String),

    #[error("Failed to write config file: {0}")]
    WriteError(String),

    #[error("{0}")]
    Invalid(String),
}
