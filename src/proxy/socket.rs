use std::io;
use std::sync::Arc;

use thiserror::Error;
use tokio::io::{split, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use super::{is_connection_terminated, log_session_error, CloseOnce};

const READ_BUFFER_SIZE: usize = 8192;

/// Liveness/policy gate applied after every client-side read. Returning
/// false tears the session down immediately.
pub type CheckFn = Arc<dyn Fn() -> bool + Send + Sync>;

#[derive(Default)]
pub struct SocketProxyOptions {
    pub check: Option<CheckFn>,
    pub on_close: Option<Box<dyn FnOnce() + Send>>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SocketProxyStats {
    pub client_bytes: u64,
    pub server_bytes: u64,
}

#[derive(Debug, Error)]
enum RelayEnd {
    #[error("liveness check rejected the session")]
    CheckRejected,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Relays opaque bytes between a client and a server stream until either
/// side closes, errors, or the check function rejects the session.
///
/// The two directions run concurrently; the first terminal event on either
/// one cancels the other and closes both streams, discarding anything still
/// in flight. The close callback runs exactly once.
pub async fn run<C, S>(client: C, server: S, options: SocketProxyOptions) -> SocketProxyStats
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (client_read, client_write) = split(client);
    let (server_read, server_write) = split(server);
    run_split(
        client_read,
        client_write,
        server_read,
        server_write,
        options,
    )
    .await
}

/// Same as [`run`], for callers that already hold the four halves (e.g. a
/// client stream wrapped in a buffered reader).
pub async fn run_split<CR, CW, SR, SW>(
    client_read: CR,
    client_write: CW,
    server_read: SR,
    server_write: SW,
    options: SocketProxyOptions,
) -> SocketProxyStats
where
    CR: AsyncRead + Send + Unpin,
    CW: AsyncWrite + Send + Unpin,
    SR: AsyncRead + Send + Unpin,
    SW: AsyncWrite + Send + Unpin,
{
    let close = CloseOnce::new(options.on_close);

    let client_to_server = relay_half(client_read, server_write, options.check.clone());
    let server_to_client = relay_half(server_read, client_write, None);

    let mut stats = SocketProxyStats::default();
    // The first direction to finish ends the session; the other future is
    // dropped, which closes its halves and aborts any pending operation.
    let (direction, outcome) = tokio::select! {
        outcome = client_to_server => ("client to server", outcome),
        outcome = server_to_client => ("server to client", outcome),
    };

    match outcome {
        Ok(bytes) => {
            trace!(direction, bytes, "relay finished at end of stream");
            if direction == "client to server" {
                stats.client_bytes = bytes;
            } else {
                stats.server_bytes = bytes;
            }
        }
        Err(RelayEnd::CheckRejected) => {
            debug!(direction, "liveness check rejected session; closing both ends");
        }
        Err(RelayEnd::Io(error)) => {
            log_session_error(direction, &error);
        }
    }

    close.close();
    stats
}

async fn relay_half<R, W>(
    mut reader: R,
    mut writer: W,
    check: Option<CheckFn>,
) -> Result<u64, RelayEnd>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = [0u8; READ_BUFFER_SIZE];
    let mut transferred = 0u64;
    loop {
        let read = reader.read(&mut buffer).await?;
        if read == 0 {
            let _ = writer.shutdown().await;
            return Ok(transferred);
        }
        if let Some(check) = &check {
            if !check() {
                return Err(RelayEnd::CheckRejected);
            }
        }
        // Forward exactly the bytes read, then resume reading from the same
        // source; one write is in flight per direction at any time.
        writer.write_all(&buffer[..read]).await?;
        transferred = transferred.saturating_add(read as u64);
    }
}

/// Classification helper exposed for callers that handle relay errors
/// themselves.
pub fn is_benign_disconnect(error: &io::Error) -> bool {
    is_connection_terminated(error)
}
