//! Bounded inbox for messages arriving off the network, before they reach
//! the dispatch thread.
//!
//! Uses `crossbeam-queue::ArrayQueue` for a lock-free, bounded MPSC queue:
//! receive threads push, the dispatch thread drains. When full,
//! `try_push` hands the item back so the receive thread can drop it (and
//! count it) rather than block or grow without bound.

use crossbeam_queue::ArrayQueue;

use quorate_core::RawFrame;

/// Result of attempting to push a frame onto a full queue.
#[derive(Debug)]
pub enum PushResult<T> {
    /// Item was successfully enqueued.
    Ok,
    /// Queue is full. Returns the item for the caller to handle.
    Backpressure(T),
}

/// A bounded, lock-free queue of not-yet-decoded [`RawFrame`]s
/// (`spec.md` §4.3 "Incoming message storage").
///
/// Decoding and validation happen after a frame leaves this queue, not
/// before it enters — the queue itself only ever moves bytes.
pub struct IncomingMsgsStorage {
    inner: ArrayQueue<RawFrame>,
}

impl IncomingMsgsStorage {
    /// Creates a new bounded inbox.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "incoming queue capacity must be positive");
        Self {
            inner: ArrayQueue::new(capacity),
        }
    }

    pub fn try_push(&self, frame: RawFrame) -> PushResult<RawFrame> {
        match self.inner.push(frame) {
            Ok(()) => PushResult::Ok,
            Err(frame) => PushResult::Backpressure(frame),
        }
    }

    pub fn try_pop(&self) -> Option<RawFrame> {
        self.inner.pop()
    }

    /// Drains up to `max` frames for one dispatch-thread pass.
    pub fn pop_batch(&self, max: usize) -> Vec<RawFrame> {
        let mut batch = Vec::with_capacity(max.min(self.inner.len()));
        for _ in 0..max {
            match self.inner.pop() {
                Some(frame) => batch.push(frame),
                None => break,
            }
        }
        batch
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.inner.is_full()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quorate_core::{Message, MessagePayload};
    use quorate_types::{ClientId, ReplicaId, SeqNum};

    fn frame() -> RawFrame {
        let msg = Message::new(
            ReplicaId::new(0),
            MessagePayload::ClientPreProcessRequest(quorate_core::ClientPreProcessRequestMsg {
                client_id: ClientId::new(1),
                req_seq_num: SeqNum::new(1),
                cid: "cid".into(),
                payload: b"x".to_vec(),
                request_timeout_milli: 1_000,
                signature: None,
                flags: 0,
            }),
        );
        RawFrame::encode(&msg)
    }

    #[test]
    fn push_then_pop_round_trips() {
        let q = IncomingMsgsStorage::new(2);
        assert!(matches!(q.try_push(frame()), PushResult::Ok));
        assert!(q.try_pop().is_some());
        assert!(q.try_pop().is_none());
    }

    #[test]
    fn backpressure_when_full() {
        let q = IncomingMsgsStorage::new(1);
        assert!(matches!(q.try_push(frame()), PushResult::Ok));
        match q.try_push(frame()) {
            PushResult::Backpressure(_) => {}
            PushResult::Ok => panic!("expected backpressure"),
        }
    }

    #[test]
    fn pop_batch_drains_up_to_max() {
        let q = IncomingMsgsStorage::new(10);
        for _ in 0..5 {
            let _ = q.try_push(frame());
        }
        assert_eq!(q.pop_batch(3).len(), 3);
        assert_eq!(q.len(), 2);
    }

    #[test]
    #[should_panic(expected = "capacity must be positive")]
    fn zero_capacity_panics() {
        let _q = IncomingMsgsStorage::new(0);
    }
}
