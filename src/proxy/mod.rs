pub mod buffer;
pub mod chunk;
pub mod env;
pub mod form;
pub mod no_proxy;
pub mod server;
pub mod socket;
pub mod upstream;

use std::io;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error};

/// Shared notification hook installed on a proxy session (resume a paused
/// producer, observe teardown).
pub type SessionCallback = Arc<dyn Fn() + Send + Sync>;

/// Guards a session's close callback so teardown runs exactly once no matter
/// which side of the relay reaches it first.
pub struct CloseOnce {
    closed: Mutex<bool>,
    callback: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl CloseOnce {
    pub fn new(callback: Option<Box<dyn FnOnce() + Send>>) -> Self {
        Self {
            closed: Mutex::new(false),
            callback: Mutex::new(callback),
        }
    }

    /// Returns true for the caller that actually performed the close.
    pub fn close(&self) -> bool {
        {
            let mut closed = self.closed.lock();
            if *closed {
                return false;
            }
            *closed = true;
        }
        let callback = self.callback.lock().take();
        if let Some(callback) = callback {
            callback();
        }
        true
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock()
    }
}

/// Errors that mean "the peer went away": end of stream, resets, broken
/// pipes, aborted connections, an abrupt TLS shutdown, or a missing Unix
/// socket path. These end the session but are not noteworthy.
pub fn is_connection_terminated(error: &io::Error) -> bool {
    use io::ErrorKind::*;
    if matches!(
        error.kind(),
        UnexpectedEof | ConnectionReset | ConnectionAborted | BrokenPipe | NotConnected | NotFound
    ) {
        return true;
    }
    error
        .get_ref()
        .map(|inner| {
            let text = inner.to_string();
            text.contains("close_notify") || text.contains("CloseNotify")
        })
        .unwrap_or(false)
}

/// Logs a session error at the level its class warrants.
pub fn log_session_error(context: &str, error: &io::Error) {
    if is_connection_terminated(error) {
        debug!(context, error = %error, "session ended by peer");
    } else {
        error!(context, error = %error, "session failed");
    }
}
