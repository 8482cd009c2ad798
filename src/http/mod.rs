pub mod chunk;
pub mod codec;
pub mod handlers;

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode, Version};

/// How the body of a message is framed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyPlan {
    Empty,
    Fixed(usize),
    Chunked,
}

/// A parsed inbound request. The head is always complete; `body` is only
/// populated for terminal handlers, which consume the body before invocation.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub uri: String,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Request {
    pub fn new(method: Method, uri: impl Into<String>) -> Self {
        Self {
            method,
            uri: uri.into(),
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    pub fn body_plan(&self) -> BodyPlan {
        if self
            .header("transfer-encoding")
            .map(|value| value.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false)
        {
            return BodyPlan::Chunked;
        }
        match self
            .header("content-length")
            .and_then(|v| v.trim().parse::<usize>().ok())
        {
            Some(0) | None => BodyPlan::Empty,
            Some(length) => BodyPlan::Fixed(length),
        }
    }

    /// True when the client asked to switch protocols (e.g. websockets); the
    /// session then becomes an opaque tunnel.
    pub fn wants_upgrade(&self) -> bool {
        self.header("connection")
            .map(|value| {
                value
                    .split(',')
                    .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
            })
            .unwrap_or(false)
            && self.headers.contains_key("upgrade")
    }

    pub fn connection_close(&self) -> bool {
        self.header("connection")
            .map(|value| {
                value
                    .split(',')
                    .any(|token| token.trim().eq_ignore_ascii_case("close"))
            })
            .unwrap_or(false)
    }
}

/// Response metadata assigned onto the client connection before any body
/// bytes are relayed.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

impl ResponseHead {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
        }
    }

    /// Encodes the head for a body following the given plan. Framing headers
    /// (`Content-Length`, `Transfer-Encoding`) are owned by the encoder and
    /// stripped from the carried header map, along with hop-by-hop headers.
    pub fn encode(&self, body_plan: BodyPlan) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(256);
        buffer.extend_from_slice(b"HTTP/1.1 ");
        buffer.extend_from_slice(self.status.as_str().as_bytes());
        buffer.extend_from_slice(b" ");
        buffer.extend_from_slice(
            self.status
                .canonical_reason()
                .unwrap_or("Unknown")
                .as_bytes(),
        );
        buffer.extend_from_slice(b"\r\n");

        for (name, value) in &self.headers {
            let lower = name.as_str();
            if lower == "content-length"
                || lower == "transfer-encoding"
                || lower == "connection"
                || lower == "keep-alive"
                || lower == "proxy-connection"
            {
                continue;
            }
            buffer.extend_from_slice(name.as_str().as_bytes());
            buffer.extend_from_slice(b": ");
            buffer.extend_from_slice(value.as_bytes());
            buffer.extend_from_slice(b"\r\n");
        }

        match body_plan {
            BodyPlan::Chunked => buffer.extend_from_slice(b"Transfer-Encoding: chunked\r\n"),
            BodyPlan::Fixed(length) => {
                buffer.extend_from_slice(b"Content-Length: ");
                buffer.extend_from_slice(length.to_string().as_bytes());
                buffer.extend_from_slice(b"\r\n");
            }
            BodyPlan::Empty => buffer.extend_from_slice(b"Content-Length: 0\r\n"),
        }
        buffer.extend_from_slice(b"\r\n");
        buffer
    }

    /// Encodes the head for a body delimited only by connection close: no
    /// framing header, an explicit `Connection: close`.
    pub fn encode_until_close(&self) -> Vec<u8> {
        let mut buffer = self.encode(BodyPlan::Empty);
        // Swap the trailing "Content-Length: 0" framing for close-delimited
        // framing.
        let marker = b"Content-Length: 0\r\n\r\n";
        buffer.truncate(buffer.len() - marker.len());
        buffer.extend_from_slice(b"Connection: close\r\n\r\n");
        buffer
    }
}

/// A complete response produced by a terminal or upload handler.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_body(status: StatusCode, content_type: &str, body: impl Into<Bytes>) -> Self {
        let mut response = Self::new(status);
        response.headers.insert(
            http::header::CONTENT_TYPE,
            content_type.parse().expect("static content type"),
        );
        response.body = body.into();
        response
    }

    pub fn text(status: StatusCode, body: impl Into<String>) -> Self {
        Self::with_body(status, "text/plain; charset=utf-8", body.into().into_bytes())
    }

    pub fn json(status: StatusCode, body: impl Into<String>) -> Self {
        Self::with_body(status, "application/json", body.into().into_bytes())
    }

    pub fn head(&self) -> ResponseHead {
        ResponseHead {
            status: self.status,
            headers: self.headers.clone(),
        }
    }

    /// Encodes the full response with `Content-Length` framing.
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = self.head().encode(if self.body.is_empty() {
            BodyPlan::Empty
        } else {
            BodyPlan::Fixed(self.body.len())
        });
        buffer.extend_from_slice(&self.body);
        buffer
    }
}
