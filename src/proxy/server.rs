use std::sync::atomic::{AtomicBool, Ordering};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use bytes::Bytes;
use http::StatusCode;
use tokio::io::{
    split, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf,
};
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::http::codec::{
    encode_request_head, read_line_with_timeout, read_request_head, read_response_head,
};
use crate::http::handlers::{HandlerAction, UploadFn, UriHandlers};
use crate::http::{BodyPlan, Request, Response, ResponseHead};
use crate::logging::{log_session, SessionKind};
use crate::metrics;
use crate::settings::Settings;
use crate::util::timeout_with_context;

use super::chunk::ChunkProxy;
use super::form::FormProxy;
use super::socket::{self, SocketProxyOptions};
use super::upstream::{connect_with_retry, BackendConnector};

const READ_SEGMENT_SIZE: usize = 8192;
const MAX_CHUNK_LINE_LENGTH: usize = 8192;

/// Everything a connection task needs, shared by reference.
#[derive(Clone)]
pub struct AppContext {
    pub settings: Arc<Settings>,
    pub handlers: Arc<UriHandlers>,
    pub connector: Arc<dyn BackendConnector>,
    pub accepting: Arc<AtomicBool>,
}

/// Accept loop: one task per client connection.
pub async fn serve(app: AppContext, listener: TcpListener) -> Result<()> {
    let address = listener.local_addr().context("reading listener address")?;
    info!(address = %address, "gateway listening");

    loop {
        let (stream, peer) = listener.accept().await.context("accepting connection")?;
        if !app.accepting.load(Ordering::SeqCst) {
            info!("gateway no longer accepting connections");
            return Ok(());
        }
        if let Err(err) = stream.set_nodelay(true) {
            debug!(peer = %peer, error = %err, "failed to set TCP_NODELAY on client stream");
        }
        let app = app.clone();
        tokio::spawn(async move {
            if let Err(error) = handle_connection(stream, peer, app).await {
                let benign = error
                    .downcast_ref::<std::io::Error>()
                    .map(super::is_connection_terminated)
                    .unwrap_or(false);
                if benign {
                    debug!(peer = %peer, error = %error, "connection ended by peer");
                } else {
                    error!(peer = %peer, error = %error, "connection failed");
                }
                metrics::record_session("error");
            }
        });
    }
}

/// Per-connection loop: read a request head, dispatch. Terminal and upload
/// handlers keep the connection alive; a proxied request consumes it.
pub async fn handle_connection<S>(stream: S, peer: SocketAddr, app: AppContext) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = split(stream);
    let mut reader = BufReader::new(read_half);
    let mut writer = write_half;
    let settings = app.settings.clone();

    loop {
        let request = match read_request_head(
            &mut reader,
            peer,
            settings.client_timeout(),
            settings.client_timeout(),
            settings.max_header_size,
        )
        .await?
        {
            Some(request) => request,
            None => return Ok(()),
        };
        let start = Instant::now();
        let wants_close = request.connection_close();

        let action = app
            .handlers
            .handler_for(&request.uri)
            .map(|handler| handler.action().clone());

        match action {
            Some(HandlerAction::Terminal(handler)) => {
                let request = read_full_body(&mut reader, request, &settings).await?;
                let uri = request.uri.clone();
                let method = request.method.clone();
                let response = match handler(request).await {
                    Ok(response) => response,
                    Err(handler_error) => {
                        error!(peer = %peer, uri = %uri, error = %handler_error, "terminal handler failed");
                        Response::text(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
                    }
                };
                writer
                    .write_all(&response.encode())
                    .await
                    .context("writing handler response")?;
                log_session(
                    peer,
                    &method,
                    &uri,
                    SessionKind::Terminal,
                    Some(response.status),
                    0,
                    response.body.len() as u64,
                    start.elapsed(),
                );
                metrics::record_session("terminal");
                if wants_close {
                    return Ok(());
                }
            }
            Some(HandlerAction::Upload(handler)) => {
                let response =
                    drive_upload_handler(&mut reader, request.clone(), handler, &settings).await?;
                writer
                    .write_all(&response.encode())
                    .await
                    .context("writing upload response")?;
                log_session(
                    peer,
                    &request.method,
                    &request.uri,
                    SessionKind::Upload,
                    Some(response.status),
                    0,
                    response.body.len() as u64,
                    start.elapsed(),
                );
                metrics::record_session("upload");
                if wants_close {
                    return Ok(());
                }
            }
            None => {
                return proxy_to_backend(reader, writer, request, peer, app, start).await;
            }
        }
    }
}

/// Consumes the whole (bounded) request body before a terminal handler runs.
async fn read_full_body<R>(
    reader: &mut BufReader<R>,
    mut request: Request,
    settings: &Settings,
) -> Result<Request>
where
    R: AsyncRead + Unpin,
{
    let limit = settings.max_request_body_size;
    let timeout = settings.client_timeout();
    let body = match request.body_plan() {
        BodyPlan::Empty => Bytes::new(),
        BodyPlan::Fixed(length) => {
            if length > limit {
                bail!("request body of {length} bytes exceeds the configured limit");
            }
            let mut body = vec![0u8; length];
            timeout_with_context(timeout, reader.read_exact(&mut body), "reading request body")
                .await?;
            Bytes::from(body)
        }
        BodyPlan::Chunked => {
            let mut body = Vec::new();
            loop {
                let size = read_chunk_size(reader, timeout).await?;
                if size == 0 {
                    consume_trailers(reader, timeout).await?;
                    break;
                }
                if body.len() + size > limit {
                    bail!("chunked request body exceeds the configured limit");
                }
                let offset = body.len();
                body.resize(offset + size, 0);
                timeout_with_context(
                    timeout,
                    reader.read_exact(&mut body[offset..]),
                    "reading chunk data",
                )
                .await?;
                consume_chunk_terminator(reader, timeout).await?;
            }
            Bytes::from(body)
        }
    };
    request.body = body;
    Ok(request)
}

/// Feeds the decoded request body to an upload handler in segments, with the
/// completion flag on the final one. The handler must produce the response
/// on completion.
async fn drive_upload_handler<R>(
    reader: &mut BufReader<R>,
    request: Request,
    handler: UploadFn,
    settings: &Settings,
) -> Result<Response>
where
    R: AsyncRead + Unpin,
{
    let timeout = settings.client_timeout();
    let mut response = None;

    match request.body_plan() {
        BodyPlan::Empty => {
            response = handler(request.clone(), Bytes::new(), true).await?;
        }
        BodyPlan::Fixed(length) => {
            if length == 0 {
                response = handler(request.clone(), Bytes::new(), true).await?;
            }
            let mut remaining = length;
            let mut buffer = [0u8; READ_SEGMENT_SIZE];
            while remaining > 0 {
                let take = remaining.min(buffer.len());
                let read = timeout_with_context(
                    timeout,
                    reader.read(&mut buffer[..take]),
                    "reading upload data",
                )
                .await?;
                if read == 0 {
                    bail!("connection closed in the middle of an upload body");
                }
                remaining -= read;
                let is_complete = remaining == 0;
                if let Some(done) = handler(
                    request.clone(),
                    Bytes::copy_from_slice(&buffer[..read]),
                    is_complete,
                )
                .await?
                {
                    response = Some(done);
                }
            }
        }
        BodyPlan::Chunked => {
            let mut buffer = [0u8; READ_SEGMENT_SIZE];
            loop {
                let size = read_chunk_size(reader, timeout).await?;
                if size == 0 {
                    consume_trailers(reader, timeout).await?;
                    if let Some(done) = handler(request.clone(), Bytes::new(), true).await? {
                        response = Some(done);
                    }
                    break;
                }
                let mut remaining = size;
                while remaining > 0 {
                    let take = remaining.min(buffer.len());
                    timeout_with_context(
                        timeout,
                        reader.read_exact(&mut buffer[..take]),
                        "reading upload chunk data",
                    )
                    .await?;
                    remaining -= take;
                    if let Some(done) = handler(
                        request.clone(),
                        Bytes::copy_from_slice(&buffer[..take]),
                        false,
                    )
                    .await?
                    {
                        response = Some(done);
                    }
                }
                consume_chunk_terminator(reader, timeout).await?;
            }
        }
    }

    response.ok_or_else(|| anyhow!("upload handler produced no response at completion"))
}

/// Relays a request to the backend session process: request head, then the
/// body through the form relay, then the response (chunked responses go
/// through the chunk relay). Upgrade requests become opaque tunnels.
async fn proxy_to_backend<S>(
    mut reader: BufReader<ReadHalf<S>>,
    mut writer: WriteHalf<S>,
    request: Request,
    peer: SocketAddr,
    app: AppContext,
    start: Instant,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let settings = app.settings.clone();
    let backend = match connect_with_retry(
        app.connector.clone(),
        settings.backend_target(),
        settings.connect_retry_initial(),
        settings.connect_retry_max(),
        settings.connect_retry_max_retries,
    )
    .await
    {
        Ok(backend) => {
            metrics::record_backend_connect("ok");
            backend
        }
        Err(connect_error) => {
            metrics::record_backend_connect("failed");
            warn!(peer = %peer, error = %connect_error, "backend unavailable");
            let response = Response::text(StatusCode::BAD_GATEWAY, "backend session unavailable");
            writer
                .write_all(&response.encode())
                .await
                .context("writing bad-gateway response")?;
            log_session(
                peer,
                &request.method,
                &request.uri,
                SessionKind::Proxy,
                Some(StatusCode::BAD_GATEWAY),
                0,
                0,
                start.elapsed(),
            );
            return Ok(());
        }
    };

    let (backend_read, backend_write) = split(backend);
    let mut backend_reader = BufReader::new(backend_read);
    let mut backend_writer = backend_write;

    backend_writer
        .write_all(&encode_request_head(&request))
        .await
        .context("forwarding request head to backend")?;

    if request.wants_upgrade() {
        let accepting = app.accepting.clone();
        let stats = socket::run_split(
            reader,
            writer,
            backend_reader,
            backend_writer,
            SocketProxyOptions {
                check: Some(Arc::new(move || accepting.load(Ordering::SeqCst))),
                on_close: Some(Box::new(|| {
                    metrics::record_session("tunnel");
                })),
            },
        )
        .await;
        metrics::record_relay_bytes("client_to_backend", stats.client_bytes);
        metrics::record_relay_bytes("backend_to_client", stats.server_bytes);
        log_session(
            peer,
            &request.method,
            &request.uri,
            SessionKind::Tunnel,
            None,
            stats.client_bytes,
            stats.server_bytes,
            start.elapsed(),
        );
        return Ok(());
    }

    // Request body: raw bytes through the form relay, deferred until the
    // backend handshake completed (it already has at this point, so the
    // drain starts flushing immediately).
    let body_plan = request.body_plan();
    let mut bytes_in = 0u64;
    if body_plan != BodyPlan::Empty {
        let resume = Arc::new(Notify::new());
        let resume_signal = resume.clone();
        let form = FormProxy::new(
            settings.proxy_buffer_size,
            Some(Arc::new(move || resume_signal.notify_one())),
            None,
        );
        let drain = tokio::spawn({
            let form = form.clone();
            async move { form.run(backend_writer).await }
        });

        let forwarded = match body_plan {
            BodyPlan::Fixed(length) => {
                forward_fixed_body(&mut reader, &form, &resume, length, &settings).await
            }
            BodyPlan::Chunked => forward_chunked_body(&mut reader, &form, &resume, &settings).await,
            BodyPlan::Empty => unreachable!("empty body plans skip the form relay"),
        };
        match forwarded {
            Ok(bytes) => bytes_in = bytes,
            Err(forward_error) => {
                form.close();
                return Err(forward_error.context("relaying request body to backend"));
            }
        }
        form.complete();
        drain
            .await
            .context("form relay task panicked")?
            .context("form relay failed")?;
        metrics::record_relay_bytes("client_to_backend", bytes_in);
    }

    // Response side.
    let head = read_response_head(
        &mut backend_reader,
        settings.backend_timeout(),
        settings.max_header_size,
    )
    .await?;
    let response_head = head.to_response_head();

    let bytes_out = if head.chunked {
        relay_chunked_response(&mut backend_reader, writer, &response_head, &settings).await?
    } else {
        let length = head.content_length;
        relay_sized_response(&mut backend_reader, &mut writer, &response_head, length, &settings)
            .await?
    };
    metrics::record_relay_bytes("backend_to_client", bytes_out);
    metrics::record_session("proxy");
    log_session(
        peer,
        &request.method,
        &request.uri,
        SessionKind::Proxy,
        Some(head.status),
        bytes_in,
        bytes_out,
        start.elapsed(),
    );
    Ok(())
}

async fn queue_form_data(form: &FormProxy, resume: &Notify, data: &[u8]) -> Result<()> {
    loop {
        if form.queue_data(data) {
            return Ok(());
        }
        if form.is_closed() {
            bail!("backend write side closed during body relay");
        }
        if form.buffered_bytes() == 0 {
            bail!(
                "body segment of {} bytes exceeds the relay buffer",
                data.len()
            );
        }
        resume.notified().await;
    }
}

async fn forward_fixed_body<R>(
    reader: &mut BufReader<R>,
    form: &FormProxy,
    resume: &Notify,
    length: usize,
    settings: &Settings,
) -> Result<u64>
where
    R: AsyncRead + Unpin,
{
    let timeout = settings.client_timeout();
    let mut buffer = [0u8; READ_SEGMENT_SIZE];
    let mut remaining = length;
    let mut transferred = 0u64;
    while remaining > 0 {
        let take = remaining.min(buffer.len());
        let read = timeout_with_context(
            timeout,
            reader.read(&mut buffer[..take]),
            "reading request body from client",
        )
        .await?;
        if read == 0 {
            bail!("connection closed in the middle of the request body");
        }
        remaining -= read;
        queue_form_data(form, resume, &buffer[..read]).await?;
        transferred = transferred.saturating_add(read as u64);
    }
    Ok(transferred)
}

/// Forwards a chunked request body to the backend byte-for-byte, tracking
/// the framing only to find where the body ends.
async fn forward_chunked_body<R>(
    reader: &mut BufReader<R>,
    form: &FormProxy,
    resume: &Notify,
    settings: &Settings,
) -> Result<u64>
where
    R: AsyncRead + Unpin,
{
    let timeout = settings.client_timeout();
    let mut line = String::new();
    let mut buffer = [0u8; READ_SEGMENT_SIZE];
    let mut transferred = 0u64;

    loop {
        let read =
            read_line_with_timeout(reader, &mut line, timeout, MAX_CHUNK_LINE_LENGTH).await?;
        if read == 0 {
            bail!("connection closed while reading a chunk size line");
        }
        queue_form_data(form, resume, line.as_bytes()).await?;
        transferred = transferred.saturating_add(read as u64);

        let size = parse_chunk_size(&line)?;
        if size == 0 {
            // Trailers, byte-for-byte, through to the blank line.
            loop {
                let read =
                    read_line_with_timeout(reader, &mut line, timeout, MAX_CHUNK_LINE_LENGTH)
                        .await?;
                if read == 0 {
                    bail!("connection closed while reading chunk trailers");
                }
                queue_form_data(form, resume, line.as_bytes()).await?;
                transferred = transferred.saturating_add(read as u64);
                if line.trim_end_matches(['\r', '\n']).is_empty() {
                    return Ok(transferred);
                }
            }
        }

        // Chunk data plus its trailing CRLF.
        let mut remaining = size + 2;
        while remaining > 0 {
            let take = remaining.min(buffer.len());
            timeout_with_context(
                timeout,
                reader.read_exact(&mut buffer[..take]),
                "reading chunk data from client",
            )
            .await?;
            queue_form_data(form, resume, &buffer[..take]).await?;
            transferred = transferred.saturating_add(take as u64);
            remaining -= take;
        }
    }
}

/// Relays a chunked backend response through the chunk proxy: decode each
/// chunk, queue it (pausing on backpressure), finish on the terminal chunk.
async fn relay_chunked_response<R, W>(
    backend_reader: &mut BufReader<R>,
    client_writer: W,
    response_head: &ResponseHead,
    settings: &Settings,
) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let timeout = settings.backend_timeout();
    let resume = Arc::new(Notify::new());
    let resume_signal = resume.clone();
    let proxy = ChunkProxy::new(
        settings.proxy_buffer_size,
        Some(Arc::new(move || resume_signal.notify_one())),
        None,
    );
    let drain = tokio::spawn({
        let proxy = proxy.clone();
        async move { proxy.drain(client_writer).await }
    });

    let mut buffer = [0u8; READ_SEGMENT_SIZE];
    let mut line = String::new();
    let mut transferred = 0u64;

    let relay = async {
        loop {
            let read =
                read_line_with_timeout(backend_reader, &mut line, timeout, MAX_CHUNK_LINE_LENGTH)
                    .await?;
            if read == 0 {
                bail!("backend closed while sending a chunked response");
            }
            let size = parse_chunk_size(&line)?;
            if size == 0 {
                consume_trailers(backend_reader, timeout).await?;
                queue_response_chunk(&proxy, &resume, response_head, b"").await?;
                return Ok(());
            }
            let mut remaining = size;
            while remaining > 0 {
                let take = remaining.min(buffer.len());
                timeout_with_context(
                    timeout,
                    backend_reader.read_exact(&mut buffer[..take]),
                    "reading chunk data from backend",
                )
                .await?;
                queue_response_chunk(&proxy, &resume, response_head, &buffer[..take]).await?;
                transferred = transferred.saturating_add(take as u64);
                remaining -= take;
            }
            consume_chunk_terminator(backend_reader, timeout).await?;
        }
    };

    match relay.await {
        Ok(()) => {}
        Err(relay_error) => {
            proxy.close();
            let _ = drain.await;
            return Err(relay_error);
        }
    }

    drain
        .await
        .context("chunk relay task panicked")?
        .context("chunk relay failed")?;
    Ok(transferred)
}

async fn queue_response_chunk(
    proxy: &ChunkProxy,
    resume: &Notify,
    head: &ResponseHead,
    chunk: &[u8],
) -> Result<()> {
    loop {
        if proxy.queue_chunk(head, chunk) {
            return Ok(());
        }
        if proxy.is_closed() {
            bail!("client write side closed during chunk relay");
        }
        if proxy.buffered_bytes() == 0 {
            bail!("chunk of {} bytes exceeds the relay buffer", chunk.len());
        }
        resume.notified().await;
    }
}

/// Relays a fixed-length or read-until-close response directly.
async fn relay_sized_response<R, W>(
    backend_reader: &mut BufReader<R>,
    client_writer: &mut W,
    response_head: &ResponseHead,
    content_length: Option<u64>,
    settings: &Settings,
) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let timeout = settings.backend_timeout();
    let mut buffer = [0u8; READ_SEGMENT_SIZE];
    let mut transferred = 0u64;

    match content_length {
        Some(length) => {
            client_writer
                .write_all(&response_head.encode(BodyPlan::Fixed(length as usize)))
                .await
                .context("writing response head")?;
            let mut remaining = length;
            while remaining > 0 {
                let take = remaining.min(buffer.len() as u64) as usize;
                timeout_with_context(
                    timeout,
                    backend_reader.read_exact(&mut buffer[..take]),
                    "reading response body from backend",
                )
                .await?;
                client_writer
                    .write_all(&buffer[..take])
                    .await
                    .context("writing response body")?;
                transferred = transferred.saturating_add(take as u64);
                remaining -= take as u64;
            }
        }
        None => {
            client_writer
                .write_all(&response_head.encode_until_close())
                .await
                .context("writing response head")?;
            loop {
                let read = timeout_with_context(
                    timeout,
                    backend_reader.read(&mut buffer),
                    "reading response body from backend",
                )
                .await?;
                if read == 0 {
                    break;
                }
                client_writer
                    .write_all(&buffer[..read])
                    .await
                    .context("writing response body")?;
                transferred = transferred.saturating_add(read as u64);
            }
        }
    }
    let _ = client_writer.flush().await;
    Ok(transferred)
}

fn parse_chunk_size(line: &str) -> Result<usize> {
    let trimmed = line.trim_end_matches(['\r', '\n']);
    let size_str = trimmed
        .split_once(';')
        .map(|(size, _extensions)| size)
        .unwrap_or(trimmed)
        .trim();
    usize::from_str_radix(size_str, 16).with_context(|| format!("invalid chunk size '{size_str}'"))
}

async fn read_chunk_size<R>(reader: &mut BufReader<R>, timeout: Duration) -> Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut line = String::new();
    let read = read_line_with_timeout(reader, &mut line, timeout, MAX_CHUNK_LINE_LENGTH).await?;
    if read == 0 {
        bail!("connection closed while reading a chunk size line");
    }
    parse_chunk_size(&line)
}

async fn consume_chunk_terminator<R>(reader: &mut BufReader<R>, timeout: Duration) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut terminator = [0u8; 2];
    timeout_with_context(
        timeout,
        reader.read_exact(&mut terminator),
        "reading chunk terminator",
    )
    .await?;
    if &terminator != b"\r\n" {
        bail!("chunk data is not terminated by CRLF");
    }
    Ok(())
}

async fn consume_trailers<R>(reader: &mut BufReader<R>, timeout: Duration) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        let read = read_line_with_timeout(reader, &mut line, timeout, MAX_CHUNK_LINE_LENGTH).await?;
        if read == 0 {
            bail!("connection closed while reading chunk trailers");
        }
        if line.trim_end_matches(['\r', '\n']).is_empty() {
            return Ok(());
        }
    }
}
