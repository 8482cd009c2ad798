use std::io;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;

use super::buffer::BoundedWriteBuffer;
use super::{log_session_error, CloseOnce, SessionCallback};

/// Relays a request body to a downstream backend with the same backpressure
/// discipline as the chunk relay, but symmetric: raw bytes in, raw bytes
/// out, no framing.
///
/// The lifecycle is connect-then-drain: data queued before the downstream
/// handshake completes is only buffered; [`run`](FormProxy::run) is invoked
/// once the downstream connection is established and first flushes whatever
/// already accumulated. [`complete`](FormProxy::complete) marks the end of
/// the body; the drain finishes the downstream write side once the queue is
/// empty.
#[derive(Clone)]
pub struct FormProxy {
    shared: Arc<Shared>,
}

struct Shared {
    state: Mutex<State>,
    wake: Notify,
    on_resume: Option<SessionCallback>,
    close: CloseOnce,
}

struct State {
    buffer: BoundedWriteBuffer,
    connected_downstream: bool,
    completed: bool,
}

impl FormProxy {
    pub fn new(
        max_buffer_size: usize,
        on_resume: Option<SessionCallback>,
        on_close: Option<Box<dyn FnOnce() + Send>>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    buffer: BoundedWriteBuffer::new(max_buffer_size),
                    connected_downstream: false,
                    completed: false,
                }),
                wake: Notify::new(),
                on_resume,
                close: CloseOnce::new(on_close),
            }),
        }
    }

    /// Queues body bytes for the backend. Returns false when the buffer cap
    /// would be exceeded; the caller must pause the upstream connection and
    /// re-deliver the same data after the resume signal.
    pub fn queue_data(&self, data: &[u8]) -> bool {
        let accepted = {
            let mut state = self.shared.state.lock();
            if state.completed || self.shared.close.is_closed() {
                return false;
            }
            state.buffer.try_enqueue(Bytes::copy_from_slice(data))
        };
        if accepted {
            self.shared.wake.notify_one();
        }
        accepted
    }

    /// Marks the body as fully delivered. The drain finishes the downstream
    /// write side once everything queued has been written.
    pub fn complete(&self) {
        self.shared.state.lock().completed = true;
        self.shared.wake.notify_one();
    }

    /// Tears the session down, discarding buffered-but-unsent data.
    pub fn close(&self) {
        self.shared.close.close();
        self.shared.wake.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.close.is_closed()
    }

    pub fn is_connected_downstream(&self) -> bool {
        self.shared.state.lock().connected_downstream
    }

    pub fn buffered_bytes(&self) -> usize {
        self.shared.state.lock().buffer.current_size()
    }

    /// Drives the downstream writes. Call once the downstream connection
    /// (TCP/TLS handshake included) is established; queued data is flushed
    /// first, then the drain follows the producer until `complete`.
    pub async fn run<W>(&self, mut writer: W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        self.shared.state.lock().connected_downstream = true;

        loop {
            let notified = self.shared.wake.notified();
            enum Work {
                Write(Bytes),
                Finish,
                Wait,
            }
            let work = {
                let state = self.shared.state.lock();
                if self.shared.close.is_closed() {
                    return Ok(());
                }
                match state.buffer.front() {
                    Some(segment) => Work::Write(segment),
                    None if state.completed => Work::Finish,
                    None => Work::Wait,
                }
            };

            match work {
                Work::Wait => notified.await,
                Work::Finish => {
                    let _ = writer.flush().await;
                    let _ = writer.shutdown().await;
                    self.close();
                    return Ok(());
                }
                Work::Write(segment) => {
                    if let Err(error) = writer.write_all(&segment).await {
                        log_session_error("form relay", &error);
                        self.close();
                        return Err(error);
                    }
                    let resume = {
                        let mut state = self.shared.state.lock();
                        state.buffer.complete_front();
                        !state.completed && state.buffer.take_resume_signal()
                    };
                    if resume {
                        if let Some(on_resume) = &self.shared.on_resume {
                            on_resume();
                        }
                    }
                }
            }
        }
    }
}
