use std::time::Duration;

use anyhow::{anyhow, bail, ensure, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

use crate::util::timeout_with_context;

/// Reads one CRLF- (or LF-) terminated line into `buf`, bounded in both time
/// and length. Returns the number of bytes consumed including the
/// terminator, or 0 for a clean end of stream before any byte arrived.
pub(crate) async fn read_line_with_timeout<S>(
    reader: &mut BufReader<S>,
    buf: &mut String,
    timeout_dur: Duration,
    max_len: usize,
) -> Result<usize>
where
    S: AsyncRead + Unpin,
{
    ensure!(max_len > 0, "line length limit must be greater than zero");
    buf.clear();
    let mut collected = Vec::new();

    loop {
        let available =
            timeout_with_context(timeout_dur, reader.fill_buf(), "reading line").await?;

        if available.is_empty() {
            if collected.is_empty() {
                return Ok(0);
            }
            bail!("connection closed in the middle of a line");
        }

        let newline_pos = available.iter().position(|byte| *byte == b'\n');
        let consume = newline_pos.map(|idx| idx + 1).unwrap_or(available.len());

        if collected
            .len()
            .checked_add(consume)
            .ok_or_else(|| anyhow!("line length overflow"))?
            > max_len
        {
            bail!("line exceeds configured limit of {max_len} bytes");
        }

        collected.extend_from_slice(&available[..consume]);
        reader.consume(consume);

        if newline_pos.is_some() {
            break;
        }
    }

    let string =
        String::from_utf8(collected).map_err(|_| anyhow!("line contained invalid bytes"))?;
    let len = string.len();
    *buf = string;
    Ok(len)
}
