use std::collections::VecDeque;

use bytes::Bytes;

/// An ordered queue of pending write segments with a hard size cap.
///
/// `current_size` always equals the sum of the queued segment lengths,
/// including a segment currently being written (segments are only popped
/// after their write completes). An enqueue that would push `current_size`
/// past `max_size` is rejected outright rather than truncated, and the
/// buffer remembers that its producer was paused so the drain side can
/// signal resume exactly once.
pub struct BoundedWriteBuffer {
    queue: VecDeque<Bytes>,
    current_size: usize,
    max_size: usize,
    full: bool,
}

impl BoundedWriteBuffer {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            current_size: 0,
            max_size,
            full: false,
        }
    }

    /// Appends a segment, or rejects it and marks the producer paused.
    pub fn try_enqueue(&mut self, segment: Bytes) -> bool {
        if self.current_size + segment.len() > self.max_size {
            self.full = true;
            return false;
        }
        self.current_size += segment.len();
        self.queue.push_back(segment);
        true
    }

    /// The segment whose write should be started (or is in flight).
    pub fn front(&self) -> Option<Bytes> {
        self.queue.front().cloned()
    }

    /// Removes the front segment after its write completed.
    pub fn complete_front(&mut self) -> Option<Bytes> {
        let segment = self.queue.pop_front()?;
        self.current_size -= segment.len();
        Some(segment)
    }

    /// True exactly once per pause: when the queue has fully drained after a
    /// rejected enqueue. Clears the paused flag.
    pub fn take_resume_signal(&mut self) -> bool {
        if self.full && self.queue.is_empty() {
            self.full = false;
            return true;
        }
        false
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn current_size(&self) -> usize {
        self.current_size
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn is_full(&self) -> bool {
        self.full
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(len: usize) -> Bytes {
        Bytes::from(vec![b'x'; len])
    }

    #[test]
    fn tracks_current_size_across_enqueue_and_drain() {
        let mut buffer = BoundedWriteBuffer::new(100);
        assert!(buffer.try_enqueue(segment(30)));
        assert!(buffer.try_enqueue(segment(50)));
        assert_eq!(buffer.current_size(), 80);
        buffer.complete_front();
        assert_eq!(buffer.current_size(), 50);
        buffer.complete_front();
        assert_eq!(buffer.current_size(), 0);
        assert!(buffer.is_empty());
    }

    #[test]
    fn rejects_enqueue_that_would_exceed_cap() {
        let mut buffer = BoundedWriteBuffer::new(100);
        assert!(buffer.try_enqueue(segment(60)));
        assert!(!buffer.try_enqueue(segment(41)));
        // The rejected segment must not mutate the queue.
        assert_eq!(buffer.current_size(), 60);
        assert_eq!(buffer.len(), 1);
        assert!(buffer.is_full());
    }

    #[test]
    fn fills_exactly_to_cap() {
        let mut buffer = BoundedWriteBuffer::new(100);
        assert!(buffer.try_enqueue(segment(100)));
        assert_eq!(buffer.current_size(), 100);
        assert!(!buffer.try_enqueue(segment(1)));
    }

    #[test]
    fn preserves_fifo_order() {
        let mut buffer = BoundedWriteBuffer::new(1024);
        for label in [b"one".as_slice(), b"two", b"three"] {
            assert!(buffer.try_enqueue(Bytes::copy_from_slice(label)));
        }
        assert_eq!(buffer.complete_front().unwrap(), Bytes::from_static(b"one"));
        assert_eq!(buffer.complete_front().unwrap(), Bytes::from_static(b"two"));
        assert_eq!(
            buffer.complete_front().unwrap(),
            Bytes::from_static(b"three")
        );
    }

    #[test]
    fn resume_signal_fires_exactly_once_per_pause() {
        let mut buffer = BoundedWriteBuffer::new(10);
        assert!(buffer.try_enqueue(segment(8)));
        assert!(!buffer.try_enqueue(segment(8)));
        // Not yet drained.
        assert!(!buffer.take_resume_signal());
        buffer.complete_front();
        assert!(buffer.take_resume_signal());
        // Second query does not re-signal.
        assert!(!buffer.take_resume_signal());
    }

    #[test]
    fn no_resume_signal_without_a_pause() {
        let mut buffer = BoundedWriteBuffer::new(10);
        assert!(buffer.try_enqueue(segment(4)));
        buffer.complete_front();
        assert!(!buffer.take_resume_signal());
    }
}
