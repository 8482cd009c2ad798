use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// The five-byte sequence that ends a chunked response body.
pub const TERMINAL_CHUNK: &[u8] = b"0\r\n\r\n";

const CRLF: &[u8] = b"\r\n";

#[derive(Debug, Error)]
pub enum ChunkFramingError {
    #[error("chunk is missing the size line terminator")]
    MissingSizeLine,
    #[error("invalid chunk size '{0}'")]
    InvalidSize(String),
    #[error("chunk data is truncated: expected {expected} bytes, found {found}")]
    Truncated { expected: usize, found: usize },
    #[error("chunk data is not terminated by CRLF")]
    MissingDataTerminator,
}

/// Frames `data` as a single HTTP chunk: hex length, CRLF, data, CRLF.
///
/// An empty slice produces the terminal chunk `0\r\n\r\n`.
pub fn wrap_as_http_chunk(data: &[u8]) -> Bytes {
    let mut framed = BytesMut::with_capacity(data.len() + 18);
    framed.put_slice(format!("{:x}", data.len()).as_bytes());
    framed.put_slice(CRLF);
    framed.put_slice(data);
    framed.put_slice(CRLF);
    framed.freeze()
}

/// Reverses [`wrap_as_http_chunk`] for exactly one framed chunk.
pub fn unwrap_http_chunk(framed: &[u8]) -> Result<Bytes, ChunkFramingError> {
    let size_end = framed
        .windows(2)
        .position(|window| window == CRLF)
        .ok_or(ChunkFramingError::MissingSizeLine)?;
    let size_str = std::str::from_utf8(&framed[..size_end]).map_err(|_| {
        ChunkFramingError::InvalidSize(String::from_utf8_lossy(&framed[..size_end]).into_owned())
    })?;
    let size = usize::from_str_radix(size_str, 16)
        .map_err(|_| ChunkFramingError::InvalidSize(size_str.to_string()))?;

    let data_start = size_end + CRLF.len();
    let remaining = framed.len().saturating_sub(data_start);
    if remaining < size + CRLF.len() {
        return Err(ChunkFramingError::Truncated {
            expected: size,
            found: remaining.saturating_sub(CRLF.len().min(remaining)),
        });
    }
    let data_end = data_start + size;
    if &framed[data_end..data_end + CRLF.len()] != CRLF {
        return Err(ChunkFramingError::MissingDataTerminator);
    }
    Ok(Bytes::copy_from_slice(&framed[data_start..data_end]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_data_with_hex_length() {
        let framed = wrap_as_http_chunk(b"hello");
        assert_eq!(&framed[..], b"5\r\nhello\r\n");
    }

    #[test]
    fn frames_lengths_as_lowercase_hex() {
        let data = vec![b'x'; 26];
        let framed = wrap_as_http_chunk(&data);
        assert!(framed.starts_with(b"1a\r\n"));
    }

    #[test]
    fn empty_data_produces_terminal_chunk() {
        let framed = wrap_as_http_chunk(b"");
        assert_eq!(&framed[..], TERMINAL_CHUNK);
    }

    #[test]
    fn round_trips_arbitrary_bytes() {
        let cases: &[&[u8]] = &[
            b"",
            b"a",
            b"hello world",
            b"data with \r\n embedded \r\n twice",
            b"\r\n",
            &[0u8, 1, 2, 255, 254],
        ];
        for data in cases {
            let framed = wrap_as_http_chunk(data);
            let unwrapped = unwrap_http_chunk(&framed).unwrap();
            assert_eq!(&unwrapped[..], *data);
        }
    }

    #[test]
    fn rejects_truncated_chunk() {
        let framed = wrap_as_http_chunk(b"hello");
        let err = unwrap_http_chunk(&framed[..framed.len() - 3]).unwrap_err();
        assert!(matches!(err, ChunkFramingError::Truncated { expected: 5, .. }));
    }

    #[test]
    fn rejects_bad_size_line() {
        let err = unwrap_http_chunk(b"zz\r\nhello\r\n").unwrap_err();
        assert!(matches!(err, ChunkFramingError::InvalidSize(_)));
    }

    #[test]
    fn rejects_missing_data_terminator() {
        let err = unwrap_http_chunk(b"5\r\nhelloXX").unwrap_err();
        assert!(matches!(err, ChunkFramingError::MissingDataTerminator));
    }
}
