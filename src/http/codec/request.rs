use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use http::header::{HeaderName, HeaderValue};
use http::Method;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::debug;

use crate::http::Request;

use super::line::read_line_with_timeout;

/// Reads one HTTP/1.1 request head. Returns `None` when the connection was
/// closed (or went idle) before a request line arrived; the keep-alive loop
/// treats that as a normal end of the connection. The request body is not
/// consumed.
pub async fn read_request_head<S>(
    reader: &mut BufReader<S>,
    peer: SocketAddr,
    idle_timeout: Duration,
    header_timeout: Duration,
    max_header_bytes: usize,
) -> Result<Option<Request>>
where
    S: AsyncRead + Unpin,
{
    let available = match tokio::time::timeout(idle_timeout, reader.fill_buf()).await {
        Ok(Ok(buf)) => buf,
        Ok(Err(err)) => {
            return Err(err).with_context(|| format!("waiting for request data from {peer}"))
        }
        Err(_) => return Ok(None),
    };
    if available.is_empty() {
        return Ok(None);
    }

    let mut line = String::new();
    let request_line_bytes =
        read_line_with_timeout(reader, &mut line, header_timeout, max_header_bytes)
            .await
            .with_context(|| format!("reading request line from {peer}"))?;
    if request_line_bytes == 0 {
        debug!(peer = %peer, "connection closed before request line");
        return Ok(None);
    }

    let request_line = line.trim_end_matches(['\r', '\n']);
    let mut parts = request_line.split_whitespace();
    let method_str = parts
        .next()
        .ok_or_else(|| anyhow!("malformed request line from {peer}: missing method"))?;
    let target = parts
        .next()
        .ok_or_else(|| anyhow!("malformed request line from {peer}: missing target"))?;
    let version = parts
        .next()
        .ok_or_else(|| anyhow!("malformed request line from {peer}: missing version"))?;
    if parts.next().is_some() {
        bail!("malformed request line from {peer}: unexpected data");
    }
    if version != "HTTP/1.1" {
        bail!("unsupported HTTP version '{version}' from {peer}");
    }

    let method = Method::from_bytes(method_str.as_bytes())
        .with_context(|| format!("invalid method '{method_str}' from {peer}"))?;
    let mut request = Request::new(method, target);

    let mut header_bytes = request_line_bytes;
    loop {
        let remaining = max_header_bytes
            .checked_sub(header_bytes)
            .filter(|remaining| *remaining > 0)
            .ok_or_else(|| anyhow!("request headers from {peer} exceed configured limit"))?;
        let read = read_line_with_timeout(reader, &mut line, header_timeout, remaining)
            .await
            .with_context(|| format!("reading request headers from {peer}"))?;
        if read == 0 {
            bail!("connection from {peer} closed inside request headers");
        }
        header_bytes += read;

        let header_line = line.trim_end_matches(['\r', '\n']);
        if header_line.is_empty() {
            break;
        }
        let (name, value) = header_line
            .split_once(':')
            .ok_or_else(|| anyhow!("malformed header from {peer}: '{header_line}'"))?;
        let name = name
            .trim()
            .parse::<HeaderName>()
            .with_context(|| format!("invalid header name from {peer}"))?;
        let value = value
            .trim()
            .parse::<HeaderValue>()
            .with_context(|| format!("invalid header value from {peer}"))?;
        request.headers.append(name, value);
    }

    Ok(Some(request))
}

/// Encodes a request head for forwarding to the backend, headers unchanged.
pub fn encode_request_head(request: &Request) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(256);
    buffer.extend_from_slice(request.method.as_str().as_bytes());
    buffer.extend_from_slice(b" ");
    buffer.extend_from_slice(request.uri.as_bytes());
    buffer.extend_from_slice(b" HTTP/1.1\r\n");
    for (name, value) in &request.headers {
        buffer.extend_from_slice(name.as_str().as_bytes());
        buffer.extend_from_slice(b": ");
        buffer.extend_from_slice(value.as_bytes());
        buffer.extend_from_slice(b"\r\n");
    }
    buffer.extend_from_slice(b"\r\n");
    buffer
}
