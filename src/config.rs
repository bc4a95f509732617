use std::{env, net::SocketAddr, str::FromStr, time::Duration};

use thiserror::Error;

pub const DEFAULT_MAX_CONNECTIONS: usize = 100;
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(90);
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Http,
    Sse,
    WebSocket,
}

impl FromStr for TransportKind {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(Self::Http),
            "sse" | "streamable-http" | "streamable_http" => Ok(Self::Sse),
            "websocket" | "ws" => Ok(Self::WebSocket),
            _ => Err(ConfigError::InvalidTransport),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub transport: TransportKind,
    pub bind_addr: String,
    pub bind_port: u16,
    pub max_connections: usize,
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
    pub tool_timeout: Duration,
    pub allowed_origins: Vec<String>,
    pub max_body_bytes: usize,
    pub sse_endpoint: String,
}

/// Settings shared by every transport implementation.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub bind: SocketAddr,
    pub max_connections: usize,
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
    pub allowed_origins: Vec<String>,
    pub max_body_bytes: usize,
    pub sse_endpoint: String,
}

impl TransportConfig {
    pub fn new(bind: SocketAddr) -> Self {
        Self {
            bind,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            ping_interval: DEFAULT_PING_INTERVAL,
            ping_timeout: DEFAULT_PING_TIMEOUT,
            allowed_origins: vec!["*".to_string()],
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            sse_endpoint: "/".to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("MCP_TRANSPORT must be one of: http, sse, websocket")]
    InvalidTransport,
    #[error("BIND_PORT must be a valid u16")]
    InvalidPort,
    #[error("{0} must be a positive integer")]
    InvalidNumber(&'static str),
    #[error("MCP_PING_TIMEOUT_SECS must not be shorter than MCP_PING_INTERVAL_SECS")]
    PingTimeoutTooShort,
    #[error("MCP_SSE_ENDPOINT must start with '/'")]
    InvalidEndpoint,
    #[error("invalid bind address or port")]
    InvalidSocket,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let transport = read("MCP_TRANSPORT")
            .map(|value| value.parse::<TransportKind>())
            .transpose()?
            .unwrap_or(TransportKind::Http);
        let bind_addr = read("BIND_ADDR").unwrap_or_else(|| "127.0.0.1".to_string());
        let bind_port = read("BIND_PORT")
            .map(|value| value.parse::<u16>().map_err(|_| ConfigError::InvalidPort))
            .transpose()?
            .unwrap_or(8080);

        let max_connections =
            positive(read("MCP_MAX_CONNECTIONS"), "MCP_MAX_CONNECTIONS")?
                .map(|value| value as usize)
                .unwrap_or(DEFAULT_MAX_CONNECTIONS);
        let ping_interval = positive(read("MCP_PING_INTERVAL_SECS"), "MCP_PING_INTERVAL_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_PING_INTERVAL);
        let ping_timeout = positive(read("MCP_PING_TIMEOUT_SECS"), "MCP_PING_TIMEOUT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_PING_TIMEOUT);
        let tool_timeout = positive(read("MCP_TOOL_TIMEOUT_SECS"), "MCP_TOOL_TIMEOUT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TOOL_TIMEOUT);
        let max_body_bytes = positive(read("MCP_MAX_BODY_BYTES"), "MCP_MAX_BODY_BYTES")?
            .map(|value| value as usize)
            .unwrap_or(DEFAULT_MAX_BODY_BYTES);

        if ping_timeout < ping_interval {
            return Err(ConfigError::PingTimeoutTooShort);
        }

        let allowed_origins = read("MCP_ALLOWED_ORIGINS")
            .map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|origin| !origin.is_empty())
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .filter(|origins| !origins.is_empty())
            .unwrap_or_else(|| vec!["*".to_string()]);

        let sse_endpoint = read("MCP_SSE_ENDPOINT").unwrap_or_else(|| "/".to_string());
        if !sse_endpoint.starts_with('/') {
            return Err(ConfigError::InvalidEndpoint);
        }

        let config = Self {
            transport,
            bind_addr,
            bind_port,
            max_connections,
            ping_interval,
            ping_timeout,
            tool_timeout,
            allowed_origins,
            max_body_bytes,
            sse_endpoint,
        };

        let _ = config.bind_socket()?;
        Ok(config)
    }

    pub fn bind_socket(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.bind_addr, self.bind_port)
            .parse::<SocketAddr>()
            .map_err(|_| ConfigError::InvalidSocket)
    }

    pub fn transport_config(&self) -> Result<TransportConfig, ConfigError> {
        Ok(TransportConfig {
            bind: self.bind_socket()?,
            max_connections: self.max_connections,
            ping_interval: self.ping_interval,
            ping_timeout: self.ping_timeout,
            allowed_origins: self.allowed_origins.clone(),
            max_body_bytes: self.max_body_bytes,
            sse_endpoint: self.sse_endpoint.clone(),
        })
    }
}

fn positive(value: Option<String>, key: &'static str) -> Result<Option<u64>, ConfigError> {
    value
        .map(|value| {
            value
                .parse::<u64>()
                .ok()
                .filter(|parsed| *parsed > 0)
                .ok_or(ConfigError::InvalidNumber(key))
        })
        .transpose()
}
