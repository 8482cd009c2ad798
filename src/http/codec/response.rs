use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, StatusCode};
use tokio::io::{AsyncRead, BufReader};

use crate::http::ResponseHead;

use super::line::read_line_with_timeout;

/// The head of a backend response, with the body framing already decoded.
#[derive(Debug, Clone)]
pub struct BackendResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub content_length: Option<u64>,
    pub chunked: bool,
    pub connection_close: bool,
}

impl BackendResponseHead {
    /// The metadata assigned onto the client connection when relaying.
    pub fn to_response_head(&self) -> ResponseHead {
        ResponseHead {
            status: self.status,
            headers: self.headers.clone(),
        }
    }
}

/// Reads and decodes one HTTP/1.1 response head from the backend.
pub async fn read_response_head<S>(
    reader: &mut BufReader<S>,
    read_timeout: Duration,
    max_header_bytes: usize,
) -> Result<BackendResponseHead>
where
    S: AsyncRead + Unpin,
{
    let mut line = String::new();
    let status_line_bytes =
        read_line_with_timeout(reader, &mut line, read_timeout, max_header_bytes)
            .await
            .context("reading response status line")?;
    if status_line_bytes == 0 {
        bail!("backend closed the connection before sending a response");
    }

    let status_line = line.trim_end_matches(['\r', '\n']);
    let mut parts = status_line.splitn(3, ' ');
    let version = parts
        .next()
        .ok_or_else(|| anyhow!("malformed status line '{status_line}'"))?;
    if version != "HTTP/1.1" && version != "HTTP/1.0" {
        bail!("unsupported backend HTTP version '{version}'");
    }
    let code = parts
        .next()
        .ok_or_else(|| anyhow!("malformed status line '{status_line}': missing status code"))?;
    let status = code
        .parse::<u16>()
        .ok()
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or_else(|| anyhow!("invalid status code '{code}'"))?;

    let mut headers = HeaderMap::new();
    let mut header_bytes = status_line_bytes;
    loop {
        let remaining = max_header_bytes
            .checked_sub(header_bytes)
            .filter(|remaining| *remaining > 0)
            .ok_or_else(|| anyhow!("response headers exceed configured limit"))?;
        let read = read_line_with_timeout(reader, &mut line, read_timeout, remaining)
            .await
            .context("reading response headers")?;
        if read == 0 {
            bail!("backend closed the connection inside response headers");
        }
        header_bytes += read;

        let header_line = line.trim_end_matches(['\r', '\n']);
        if header_line.is_empty() {
            break;
        }
        let (name, value) = header_line
            .split_once(':')
            .ok_or_else(|| anyhow!("malformed response header '{header_line}'"))?;
        let name = name
            .trim()
            .parse::<HeaderName>()
            .context("invalid response header name")?;
        let value = value
            .trim()
            .parse::<HeaderValue>()
            .context("invalid response header value")?;
        headers.append(name, value);
    }

    let chunked = headers
        .get("transfer-encoding")
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false);
    let content_length = if chunked {
        None
    } else {
        match headers.get("content-length") {
            Some(value) => Some(
                value
                    .to_str()
                    .ok()
                    .and_then(|value| value.trim().parse::<u64>().ok())
                    .ok_or_else(|| anyhow!("invalid Content-Length in backend response"))?,
            ),
            None => None,
        }
    };
    let connection_close = headers
        .get("connection")
        .and_then(|value| value.to_str().ok())
        .map(|value| {
            value
                .split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("close"))
        })
        .unwrap_or(false);

    Ok(BackendResponseHead {
        status,
        headers,
        content_length,
        chunked,
        connection_close,
    })
}
