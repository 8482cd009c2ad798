pub mod backoff;
pub mod cli;
pub mod http;
pub mod logging;
pub mod metrics;
pub mod proxy;
pub mod settings;
pub mod tls;
pub mod util;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use ::http::StatusCode;
use tokio::net::TcpListener;
use tracing::info;

use crate::http::handlers::{UriHandler, UriHandlers};
use crate::http::Response;
use crate::proxy::env::ProxyEnvironment;
use crate::proxy::server::{self, AppContext};
use crate::proxy::upstream::{BackendConnector, TcpBackendConnector};
use crate::settings::Settings;
use crate::tls::context_cache::SslContextCache;

fn build_connector(settings: &Settings) -> Result<Arc<dyn BackendConnector>> {
    if let Some(socket_path) = &settings.backend_socket {
        #[cfg(unix)]
        {
            info!(socket = %socket_path.display(), "backend reached over a Unix domain socket");
            return Ok(Arc::new(crate::proxy::upstream::UnixBackendConnector::new(
                socket_path.clone(),
                settings.backend_connect_timeout(),
            )));
        }
        #[cfg(not(unix))]
        anyhow::bail!(
            "backend_socket = {} is not supported on this platform",
            socket_path.display()
        );
    }

    let proxy_env = Arc::new(ProxyEnvironment::from_env());
    if let Some(proxy) = proxy_env.http_proxy() {
        info!(host = %proxy.host, port = proxy.port, "outbound HTTP connections use a proxy");
    }
    if let Some(proxy) = proxy_env.https_proxy() {
        info!(host = %proxy.host, port = proxy.port, "outbound HTTPS connections use a proxy");
    }

    let tls_contexts = Arc::new(SslContextCache::new());
    Ok(Arc::new(TcpBackendConnector::new(
        proxy_env,
        tls_contexts,
        settings.backend_connect_timeout(),
    )))
}

pub async fn run(settings: Settings) -> Result<()> {
    let settings = Arc::new(settings);
    let connector = build_connector(&settings)?;

    let mut handlers = UriHandlers::new();
    handlers.add(UriHandler::terminal("/gateway/health", |_request| async {
        Ok(Response::json(StatusCode::OK, "{\"status\":\"ok\"}"))
    }));
    handlers.add(UriHandler::terminal("/gateway/metrics", |_request| async {
        metrics::render_response()
    }));

    let accepting = Arc::new(AtomicBool::new(true));
    let shutdown_flag = accepting.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested; draining");
            shutdown_flag.store(false, Ordering::SeqCst);
        }
    });

    let listener = TcpListener::bind(settings.listen)
        .await
        .with_context(|| format!("binding {}", settings.listen))?;
    let app = AppContext {
        settings,
        handlers: Arc::new(handlers),
        connector,
        accepting,
    };
    server::serve(app, listener).await
}
