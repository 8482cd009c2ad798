use anyhow::{Context, Result};
use http::StatusCode;
use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};

use crate::http::Response;

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

static SESSIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("sessions_total", "Handled client sessions by kind");
    let vec = IntCounterVec::new(opts, &["kind"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register sessions_total");
    vec
});

static RELAY_BYTES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("relay_bytes_total", "Bytes relayed by direction");
    let vec = IntCounterVec::new(opts, &["direction"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register relay_bytes_total");
    vec
});

static BACKEND_CONNECTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new(
        "backend_connects_total",
        "Backend connection outcomes after retries",
    );
    let vec = IntCounterVec::new(opts, &["result"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register backend_connects_total");
    vec
});

pub fn record_session(kind: &str) {
    SESSIONS_TOTAL.with_label_values(&[kind]).inc();
}

pub fn record_relay_bytes(direction: &str, bytes: u64) {
    RELAY_BYTES_TOTAL
        .with_label_values(&[direction])
        .inc_by(bytes);
}

pub fn record_backend_connect(result: &str) {
    BACKEND_CONNECTS_TOTAL.with_label_values(&[result]).inc();
}

/// Renders the registry in the Prometheus text exposition format.
pub fn render() -> Result<Vec<u8>> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&REGISTRY.gather(), &mut buffer)
        .context("encoding metrics")?;
    Ok(buffer)
}

/// The `/metrics` terminal handler body.
pub fn render_response() -> Result<Response> {
    let body = render()?;
    Ok(Response::with_body(
        StatusCode::OK,
        "text/plain; version=0.0.4",
        body,
    ))
}
