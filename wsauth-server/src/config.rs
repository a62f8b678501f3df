use miette::{IntoDiagnostic, WrapErr};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use xdg::BaseDirectories;

#[derive(Debug, Clone, Deserialize)]
pub struct WsAuthConfig {
    /// Configuration of the HTTP server.
    pub server: ServerConfig,
    /// Configuration of client WebSocket connections.
    #[serde(default)]
    pub socket: SocketConfig,
    /// Configuration of server logging.
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind to.
    pub bind_address: SocketAddr,
    /// Path of the WebSocket endpoint clients connect to.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Optional TLS mode for testing only.
    pub testing_only_tls_config: Option<TestingOnlyTlsConfig>,
}

fn default_endpoint() -> String {
    "/connect".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct TestingOnlyTlsConfig {
    /// Public key (for TLS).
    pub cert: PathBuf,
    /// Private key (for TLS).
    pub key: PathBuf,
}

/// Per-connection transport parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct SocketConfig {
    /// How long a single write may take before the connection is considered dead.
    #[serde(with = "humantime_serde", default = "default_write_timeout")]
    pub write_timeout: Duration,
    /// How long the connection may go without any inbound traffic.
    #[serde(with = "humantime_serde", default = "default_liveness_timeout")]
    pub liveness_timeout: Duration,
    /// Interval between PINGs. Defaults to 9/10 of `liveness_timeout`.
    #[serde(with = "humantime_serde", default)]
    pub ping_interval: Option<Duration>,
    /// Number of inbound frames buffered ahead of the consumer.
    #[serde(default = "default_inbound_buffer")]
    pub inbound_buffer: usize,
}

fn default_write_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_liveness_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_inbound_buffer() -> usize {
    16
}

impl Default for SocketConfig {
    fn default() -> Self {
        SocketConfig {
            write_timeout: default_write_timeout(),
            liveness_timeout: default_liveness_timeout(),
            ping_interval: None,
            inbound_buffer: default_inbound_buffer(),
        }
    }
}

impl SocketConfig {
    pub fn ping_interval(&self) -> Duration {
        self.ping_interval
            .unwrap_or_else(|| self.liveness_timeout * 9 / 10)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogConfig {
    /// Whether to include `console-subscriber`.
    #[serde(default)]
    pub use_tokio_console_subscriber: bool,
}

/// Load the server configuration.
pub fn load_configuration(
    path: Option<&Path>,
    xdg_basedirs: &BaseDirectories,
) -> miette::Result<WsAuthConfig> {
    let path = path
        .and_then(|p| {
            if p.exists() {
                Some(p.to_path_buf())
            } else {
                tracing::warn!(
                    "Specified configuration file '{}' does not exist",
                    p.display()
                );
                None
            }
        })
        .ok_or(())
        .or_else(|()| {
            tracing::warn!("Searching for wsauth/config.toml in XDG configuration directories.");
            xdg_basedirs
                .find_config_file("config.toml")
                .ok_or(miette::miette!(
                    "couldn't find path to 'config.toml' in XDG config dirs"
                ))
        })?;

    extract_configuration(&path)
}

fn extract_configuration(path: &Path) -> miette::Result<WsAuthConfig> {
    use figment::providers::{self, Format};
    let config: WsAuthConfig = figment::Figment::new()
        .merge(providers::Toml::file(path))
        .merge(providers::Env::prefixed("WSAUTH_").split("__"))
        .extract()
        .into_diagnostic()
        .wrap_err_with(|| {
            format!(
                "Failed to extract configuration from {}",
                path.display()
            )
        })?;

    let socket = &config.socket;
    if socket.write_timeout.is_zero()
        || socket.liveness_timeout.is_zero()
        || socket.ping_interval().is_zero()
    {
        miette::bail!("socket timeouts and the ping interval must be non-zero");
    }
    if socket.ping_interval() >= socket.liveness_timeout {
        miette::bail!(
            "ping interval ({:?}) must be shorter than the liveness timeout ({:?})",
            socket.ping_interval(),
            socket.liveness_timeout
        );
    }
    if !config.server.endpoint.starts_with('/') {
        miette::bail!(
            "server endpoint '{}' must start with '/'",
            config.server.endpoint
        );
    }

    Ok(config)
}
