use std::io;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use tracing::trace;

use crate::http::chunk::{wrap_as_http_chunk, TERMINAL_CHUNK};
use crate::http::{BodyPlan, ResponseHead};

use super::buffer::BoundedWriteBuffer;
use super::{log_session_error, CloseOnce, SessionCallback};

/// Relays a backend's chunked response to the client, buffering because the
/// client write rate may lag the backend read rate.
///
/// Producers call [`queue_chunk`](ChunkProxy::queue_chunk) with raw chunk
/// data; a single drain task ([`drain`](ChunkProxy::drain)) writes the
/// response head once, then the framed chunks in FIFO order with one write
/// in flight at a time. A rejected enqueue pauses the producer; the drain
/// side signals resume exactly once when the queue empties. Writing the
/// terminal chunk finishes the relay and closes both ends.
#[derive(Clone)]
pub struct ChunkProxy {
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
    pending_head: Option<ResponseHead>,
    seen_first_chunk: bool,
    finished: bool,
}

impl ChunkProxy {
    pub fn new(
        max_buffer_size: usize,
        on_resume: Option<SessionCallback>,
        on_close: Option<Box<dyn FnOnce() + Send>>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    buffer: BoundedWriteBuffer::new(max_buffer_size),
                    pending_head: None,
                    seen_first_chunk: false,
                    finished: false,
                }),
                wake: Notify::new(),
                on_resume,
                close: CloseOnce::new(on_close),
            }),
        }
    }

    /// Queues one chunk of response data. Returns false when the buffer cap
    /// would be exceeded: the caller must stop reading from the backend and
    /// re-deliver this exact chunk after the resume signal. The first
    /// accepted chunk also latches the response metadata that will be
    /// written ahead of it.
    pub fn queue_chunk(&self, response: &ResponseHead, chunk: &[u8]) -> bool {
        let framed = wrap_as_http_chunk(chunk);
        let terminal = framed.as_ref() == TERMINAL_CHUNK;
        let accepted = {
            let mut state = self.shared.state.lock();
            if state.finished || self.shared.close.is_closed() {
                return false;
            }
            if !state.buffer.try_enqueue(framed) {
                false
            } else {
                if !state.seen_first_chunk {
                    state.seen_first_chunk = true;
                    state.pending_head = Some(response.clone());
                }
                if terminal {
                    state.finished = true;
                }
                true
            }
        };
        if accepted {
            self.shared.wake.notify_one();
        }
        accepted
    }

    /// Tears the session down without waiting for the terminal chunk. Any
    /// buffered-but-unsent chunks are discarded.
    pub fn close(&self) {
        self.shared.close.close();
        self.shared.wake.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.close.is_closed()
    }

    pub fn buffered_bytes(&self) -> usize {
        self.shared.state.lock().buffer.current_size()
    }

    /// Drains queued chunks to the client until the terminal chunk has been
    /// written or the session is closed. Must be driven by exactly one task.
    pub async fn drain<W>(&self, mut writer: W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        loop {
            let notified = self.shared.wake.notified();
            let work = {
                let mut state = self.shared.state.lock();
                if self.shared.close.is_closed() {
                    return Ok(());
                }
                match state.buffer.front() {
                    Some(segment) => {
                        let head = state.pending_head.take();
                        Some((head, segment))
                    }
                    None => None,
                }
            };

            let Some((head, segment)) = work else {
                notified.await;
                continue;
            };

            let write_result = async {
                if let Some(head) = &head {
                    writer.write_all(&head.encode(BodyPlan::Chunked)).await?;
                    trace!(status = %head.status, "wrote response head before first chunk");
                }
                writer.write_all(&segment).await
            }
            .await;

            if let Err(error) = write_result {
                log_session_error("chunk relay", &error);
                self.close();
                return Err(error);
            }

            let (terminal, resume) = {
                let mut state = self.shared.state.lock();
                let written = state.buffer.complete_front();
                let terminal = written.as_deref() == Some(TERMINAL_CHUNK);
                let resume = !terminal && state.buffer.take_resume_signal();
                (terminal, resume)
            };

            if terminal {
                let _ = writer.flush().await;
                let _ = writer.shutdown().await;
                self.close();
                return Ok(());
            }
            if resume {
                if let Some(on_resume) = &self.shared.on_resume {
                    on_resume();
                }
            }
        }
    }
}
