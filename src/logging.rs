use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{anyhow, Result};
use http::{Method, StatusCode};
use time::OffsetDateTime;
use tracing_subscriber::{fmt, EnvFilter};

use crate::cli::LogFormat;

const DEFAULT_FILTER: &str = "info";

pub fn init_logger(format: LogFormat) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    match format {
        LogFormat::Json => fmt::fmt()
            .with_env_filter(filter)
            .json()
            .with_current_span(false)
            .with_span_list(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .try_init()
            .map_err(|err| anyhow!(err))?,
        LogFormat::Text => fmt::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .try_init()
            .map_err(|err| anyhow!(err))?,
    }

    Ok(())
}

/// How a client session was handled.
#[derive(Debug, Clone, Copy)]
pub enum SessionKind {
    Terminal,
    Upload,
    Proxy,
    Tunnel,
}

impl SessionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionKind::Terminal => "terminal",
            SessionKind::Upload => "upload",
            SessionKind::Proxy => "proxy",
            SessionKind::Tunnel => "tunnel",
        }
    }
}

/// Emits one structured record per handled session.
#[allow(clippy::too_many_arguments)]
pub fn log_session(
    peer: SocketAddr,
    method: &Method,
    uri: &str,
    kind: SessionKind,
    status: Option<StatusCode>,
    bytes_in: u64,
    bytes_out: u64,
    elapsed: Duration,
) {
    let now = OffsetDateTime::now_utc();
    let (year, month, day) = now.to_calendar_date();
    let (hour, minute, second) = now.to_hms();
    let millisecond = now.millisecond();
    let month_number: u8 = month.into();
    let ts = format!(
        "{year:04}-{month:02}-{day:02}T{hour:02}:{minute:02}:{second:02}.{millisecond:03}Z",
        month = month_number
    );

    let status_field = status.map(|status| status.as_u16());

    tracing::info!(
        target: "session_log",
        ts,
        client_ip = %peer.ip(),
        client_port = peer.port(),
        method = %method,
        uri,
        kind = kind.as_str(),
        status = status_field,
        bytes_in,
        bytes_out,
        elapsed_ms = elapsed.as_millis() as u64,
    );
}
