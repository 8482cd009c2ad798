use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;

use crate::cli::{Cli, LogFormat};
use crate::proxy::upstream::{BackendTarget, BackendTlsSettings};

const DEFAULT_CONFIG_FILE: &str = "sessiongate.toml";

fn default_log_format() -> LogFormat {
    LogFormat::Json
}

fn default_true() -> bool {
    true
}

fn default_client_timeout() -> u64 {
    30
}

fn default_backend_connect_timeout() -> u64 {
    5
}

fn default_backend_timeout() -> u64 {
    60
}

fn default_max_header_size() -> usize {
    32 * 1024
}

fn default_max_request_body_size() -> usize {
    64 * 1024 * 1024
}

fn default_proxy_buffer_size() -> usize {
    512 * 1024
}

fn default_connect_retry_initial_ms() -> u64 {
    50
}

fn default_connect_retry_max_ms() -> u64 {
    2_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub listen: SocketAddr,
    pub backend_host: String,
    pub backend_port: u16,
    /// When set, the backend is reached over a Unix domain socket and the
    /// TCP/proxy/TLS settings are ignored.
    #[serde(default)]
    pub backend_socket: Option<PathBuf>,
    #[serde(default)]
    pub backend_tls: bool,
    #[serde(default = "default_true")]
    pub backend_tls_verify: bool,
    #[serde(default)]
    pub backend_tls_ca: Option<PathBuf>,
    #[serde(default = "default_log_format")]
    pub log: LogFormat,
    #[serde(default = "default_client_timeout")]
    pub client_timeout: u64,
    #[serde(default = "default_backend_connect_timeout")]
    pub backend_connect_timeout: u64,
    #[serde(default = "default_backend_timeout")]
    pub backend_timeout: u64,
    #[serde(default = "default_max_header_size")]
    pub max_header_size: usize,
    #[serde(default = "default_max_request_body_size")]
    pub max_request_body_size: usize,
    #[serde(default = "default_proxy_buffer_size")]
    pub proxy_buffer_size: usize,
    #[serde(default = "default_connect_retry_initial_ms")]
    pub connect_retry_initial_ms: u64,
    #[serde(default = "default_connect_retry_max_ms")]
    pub connect_retry_max_ms: u64,
    /// 0 means "retry until the backoff saturates at its wait cap".
    #[serde(default)]
    pub connect_retry_max_retries: usize,
}

impl Settings {
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut builder = Config::builder();
        match &cli.config {
            Some(path) => {
                builder = builder.add_source(File::from(path.clone()));
            }
            None => {
                if Path::new(DEFAULT_CONFIG_FILE).exists() {
                    builder = builder.add_source(File::with_name(DEFAULT_CONFIG_FILE));
                }
            }
        }
        builder = builder.add_source(Environment::with_prefix("SESSIONGATE"));

        let settings: Settings = builder
            .build()
            .context("loading configuration")?
            .try_deserialize()
            .context("deserializing configuration")?;
        settings.validate()?;
        Ok(settings)
    }

    /// A settings value with every optional knob at its default.
    pub fn with_backend(listen: SocketAddr, backend_host: impl Into<String>, backend_port: u16) -> Self {
        Self {
            listen,
            backend_host: backend_host.into(),
            backend_port,
            backend_socket: None,
            backend_tls: false,
            backend_tls_verify: true,
            backend_tls_ca: None,
            log: default_log_format(),
            client_timeout: default_client_timeout(),
            backend_connect_timeout: default_backend_connect_timeout(),
            backend_timeout: default_backend_timeout(),
            max_header_size: default_max_header_size(),
            max_request_body_size: default_max_request_body_size(),
            proxy_buffer_size: default_proxy_buffer_size(),
            connect_retry_initial_ms: default_connect_retry_initial_ms(),
            connect_retry_max_ms: default_connect_retry_max_ms(),
            connect_retry_max_retries: 0,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.backend_socket.is_none() {
            ensure!(
                !self.backend_host.is_empty(),
                "backend_host must not be empty"
            );
            ensure!(self.backend_port != 0, "backend_port must not be zero");
        }
        ensure!(
            self.max_header_size > 0,
            "max_header_size must be greater than zero"
        );
        // The relay buffers must fit at least one read segment plus chunk
        // framing overhead, or a single segment could never be queued.
        ensure!(
            self.proxy_buffer_size >= 16 * 1024,
            "proxy_buffer_size must be at least 16 KiB"
        );
        ensure!(
            self.connect_retry_initial_ms > 0,
            "connect_retry_initial_ms must be greater than zero"
        );
        ensure!(
            self.connect_retry_max_ms >= self.connect_retry_initial_ms,
            "connect_retry_max_ms must not be below connect_retry_initial_ms"
        );
        Ok(())
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout)
    }

    pub fn backend_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.backend_connect_timeout)
    }

    pub fn backend_timeout(&self) -> Duration {
        Duration::from_secs(self.backend_timeout)
    }

    pub fn connect_retry_initial(&self) -> Duration {
        Duration::from_millis(self.connect_retry_initial_ms)
    }

    pub fn connect_retry_max(&self) -> Duration {
        Duration::from_millis(self.connect_retry_max_ms)
    }

    pub fn backend_target(&self) -> BackendTarget {
        let tls = if self.backend_tls {
            Some(BackendTlsSettings {
                verify: self.backend_tls_verify,
                certificate_authority: self
                    .backend_tls_ca
                    .as_ref()
                    .map(|path| path.display().to_string())
                    .unwrap_or_default(),
            })
        } else {
            None
        };
        BackendTarget {
            host: self.backend_host.clone(),
            port: self.backend_port,
            tls,
        }
    }
}
