use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use http::StatusCode;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::sleep;

use sessiongate::http::handlers::{UriHandler, UriHandlers};
use sessiongate::http::Response;
use sessiongate::proxy::env::ProxyEnvironment;
use sessiongate::proxy::server::{serve, AppContext};
use sessiongate::proxy::upstream::TcpBackendConnector;
use sessiongate::settings::Settings;
use sessiongate::tls::context_cache::SslContextCache;

/// Starts the gateway in front of `backend_addr` and returns its address.
async fn start_gateway(handlers: UriHandlers, backend_addr: SocketAddr) -> SocketAddr {
    start_gateway_with(handlers, backend_addr, |_settings| {}).await
}

async fn start_gateway_with<F>(
    handlers: UriHandlers,
    backend_addr: SocketAddr,
    adjust: F,
) -> SocketAddr
where
    F: FnOnce(&mut Settings),
{
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let address = listener.local_addr().unwrap();
    let mut settings = Settings::with_backend(address, backend_addr.ip().to_string(), backend_addr.port());
    adjust(&mut settings);
    let settings = Arc::new(settings);

    let connector = Arc::new(TcpBackendConnector::new(
        Arc::new(ProxyEnvironment::from_lookup(|_| None)),
        Arc::new(SslContextCache::new()),
        settings.backend_connect_timeout(),
    ));
    let app = AppContext {
        settings,
        handlers: Arc::new(handlers),
        connector,
        accepting: Arc::new(AtomicBool::new(true)),
    };
    tokio::spawn(async move {
        let _ = serve(app, listener).await;
    });
    address
}

/// A backend that reads one request head and replies with a fixed byte
/// sequence, then closes.
async fn spawn_scripted_backend(response: &'static [u8]) -> SocketAddr {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let address = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut collected = Vec::new();
                let mut buf = [0u8; 1024];
                while !collected.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => collected.extend_from_slice(&buf[..n]),
                    }
                }
                let _ = stream.write_all(response).await;
            });
        }
    });
    address
}

async fn send_and_collect(gateway: SocketAddr, request: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(gateway).await.unwrap();
    stream.write_all(request).await.unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    response
}

fn dead_backend() -> SocketAddr {
    // Port 9 (discard) is almost never listening on loopback.
    SocketAddr::from((Ipv4Addr::LOCALHOST, 9))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn terminal_handlers_dispatch_first_registered_prefix() -> Result<()> {
    let mut handlers = UriHandlers::new();
    handlers.add(UriHandler::terminal("/foo", |_request| async {
        Ok(Response::text(StatusCode::OK, "from-foo"))
    }));
    handlers.add(UriHandler::terminal("/foo/bar", |_request| async {
        Ok(Response::text(StatusCode::OK, "from-foo-bar"))
    }));

    let gateway = start_gateway(handlers, dead_backend()).await;
    let response = send_and_collect(
        gateway,
        b"GET /foo/bar HTTP/1.1\r\nHost: gw\r\nConnection: close\r\n\r\n",
    )
    .await;
    let text = String::from_utf8(response).unwrap();
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(text.ends_with("from-foo"), "response was: {text}");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn keep_alive_serves_multiple_terminal_requests() -> Result<()> {
    let mut handlers = UriHandlers::new();
    handlers.add(UriHandler::terminal("/ping", |_request| async {
        Ok(Response::text(StatusCode::OK, "pong"))
    }));

    let gateway = start_gateway(handlers, dead_backend()).await;
    let mut stream = TcpStream::connect(gateway).await.unwrap();
    for _round in 0..3 {
        stream
            .write_all(b"GET /ping HTTP/1.1\r\nHost: gw\r\n\r\n")
            .await
            .unwrap();
        let mut collected = Vec::new();
        let mut buf = [0u8; 256];
        while !collected.ends_with(b"pong") {
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "gateway closed a keep-alive connection");
            collected.extend_from_slice(&buf[..n]);
        }
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn proxies_chunked_response_to_the_client() -> Result<()> {
    let backend = spawn_scripted_backend(
        b"HTTP/1.1 200 OK\r\nx-session-id: s-1\r\nTransfer-Encoding: chunked\r\n\r\n\
          5\r\nhello\r\n1\r\n \r\n7\r\nsession\r\n0\r\n\r\n",
    )
    .await;
    let gateway = start_gateway(UriHandlers::new(), backend).await;

    let response = send_and_collect(
        gateway,
        b"GET /sessions/1/output HTTP/1.1\r\nHost: gw\r\n\r\n",
    )
    .await;
    let text = String::from_utf8(response).unwrap();
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(text.contains("Transfer-Encoding: chunked\r\n"));
    assert!(text.contains("x-session-id: s-1\r\n"));
    let body_start = text.find("\r\n\r\n").unwrap() + 4;
    assert_eq!(
        &text[body_start..],
        "5\r\nhello\r\n1\r\n \r\n7\r\nsession\r\n0\r\n\r\n"
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn proxies_fixed_length_response_to_the_client() -> Result<()> {
    let backend = spawn_scripted_backend(
        b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 7\r\n\r\nresults",
    )
    .await;
    let gateway = start_gateway(UriHandlers::new(), backend).await;

    let response =
        send_and_collect(gateway, b"GET /files/report HTTP/1.1\r\nHost: gw\r\n\r\n").await;
    let text = String::from_utf8(response).unwrap();
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(text.contains("Content-Length: 7\r\n"));
    assert!(text.ends_with("results"));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn forwards_request_body_to_the_backend() -> Result<()> {
    // This backend drains the request (head plus body, until the gateway
    // finishes the write side) and reports how many body bytes it saw.
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let backend = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut collected = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => collected.extend_from_slice(&buf[..n]),
            }
        }
        let head_end = collected
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .map(|idx| idx + 4)
            .unwrap_or(collected.len());
        let body = String::from_utf8_lossy(&collected[head_end..]).into_owned();
        let reply = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\nbody={body}",
            body.len() + 5
        );
        let _ = stream.write_all(reply.as_bytes()).await;
    });

    let gateway = start_gateway(UriHandlers::new(), backend).await;
    let response = send_and_collect(
        gateway,
        b"POST /sessions/1/input HTTP/1.1\r\nHost: gw\r\nContent-Length: 11\r\n\r\nhello-input",
    )
    .await;
    let text = String::from_utf8(response).unwrap();
    assert!(text.ends_with("body=hello-input"), "response was: {text}");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn upload_handler_sees_segments_and_completion_flag() -> Result<()> {
    let observed: Arc<Mutex<Vec<(usize, bool)>>> = Arc::new(Mutex::new(Vec::new()));
    let recorded = observed.clone();

    let mut handlers = UriHandlers::new();
    handlers.add(UriHandler::upload(
        "/upload",
        move |_request, data: Bytes, is_complete| {
            let recorded = recorded.clone();
            async move {
                recorded.lock().push((data.len(), is_complete));
                if is_complete {
                    Ok(Some(Response::text(StatusCode::CREATED, "stored")))
                } else {
                    Ok(None)
                }
            }
        },
    ));

    let gateway = start_gateway(handlers, dead_backend()).await;
    let body = vec![b'z'; 20_000];
    let mut request = format!(
        "POST /upload/data.bin HTTP/1.1\r\nHost: gw\r\nConnection: close\r\nContent-Length: {}\r\n\r\n",
        body.len()
    )
    .into_bytes();
    request.extend_from_slice(&body);

    let response = send_and_collect(gateway, &request).await;
    let text = String::from_utf8(response).unwrap();
    assert!(text.starts_with("HTTP/1.1 201 Created\r\n"));
    assert!(text.ends_with("stored"));

    let segments = observed.lock().clone();
    let total: usize = segments.iter().map(|(len, _)| len).sum();
    assert_eq!(total, 20_000);
    assert!(segments.len() >= 2, "expected multiple segments");
    let completes: Vec<bool> = segments.iter().map(|(_, complete)| *complete).collect();
    assert!(completes[..completes.len() - 1].iter().all(|c| !c));
    assert!(*completes.last().unwrap());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn upgrade_requests_become_a_raw_tunnel() -> Result<()> {
    // Echo backend: consume the forwarded request head, then echo bytes.
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let backend = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut collected = Vec::new();
        let mut buf = [0u8; 1024];
        while !collected.windows(4).any(|w| w == b"\r\n\r\n") {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => collected.extend_from_slice(&buf[..n]),
            }
        }
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => {
                    if stream.write_all(&buf[..n]).await.is_err() {
                        return;
                    }
                }
            }
        }
    });

    let gateway = start_gateway(UriHandlers::new(), backend).await;
    let mut stream = TcpStream::connect(gateway).await.unwrap();
    stream
        .write_all(
            b"GET /events HTTP/1.1\r\nHost: gw\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n",
        )
        .await
        .unwrap();
    // Give the gateway a moment to establish the tunnel.
    sleep(Duration::from_millis(100)).await;

    stream.write_all(b"tunneled-bytes").await.unwrap();
    let mut echoed = [0u8; 14];
    stream.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"tunneled-bytes");

    stream.write_all(b"more").await.unwrap();
    let mut echoed = [0u8; 4];
    stream.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"more");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unreachable_backend_yields_bad_gateway() -> Result<()> {
    let gateway = start_gateway_with(UriHandlers::new(), dead_backend(), |settings| {
        settings.connect_retry_initial_ms = 1;
        settings.connect_retry_max_ms = 5;
        settings.connect_retry_max_retries = 2;
    })
    .await;

    let response = send_and_collect(gateway, b"GET /anything HTTP/1.1\r\nHost: gw\r\n\r\n").await;
    let text = String::from_utf8(response).unwrap();
    assert!(
        text.starts_with("HTTP/1.1 502 Bad Gateway\r\n"),
        "response was: {text}"
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn forwards_chunked_request_body_byte_for_byte() -> Result<()> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let backend = listener.local_addr().unwrap();
    let seen: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut collected = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => collected.extend_from_slice(&buf[..n]),
            }
        }
        *sink.lock() = collected;
        let _ = stream
            .write_all(b"HTTP/1.1 204 No Content\r\nContent-Length: 0\r\n\r\n")
            .await;
    });

    let gateway = start_gateway(UriHandlers::new(), backend).await;
    let response = send_and_collect(
        gateway,
        b"POST /sessions/1/stream HTTP/1.1\r\nHost: gw\r\nTransfer-Encoding: chunked\r\n\r\n\
          4\r\nwiki\r\n5\r\npedia\r\n0\r\n\r\n",
    )
    .await;
    let text = String::from_utf8(response).unwrap();
    assert!(text.starts_with("HTTP/1.1 204 No Content\r\n"));

    let forwarded = seen.lock().clone();
    let text = String::from_utf8_lossy(&forwarded).into_owned();
    // The chunked framing must arrive at the backend unmodified.
    assert!(
        text.ends_with("4\r\nwiki\r\n5\r\npedia\r\n0\r\n\r\n"),
        "backend saw: {text}"
    );
    Ok(())
}
