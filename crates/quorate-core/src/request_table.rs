//! `RequestTable` — the keyed collection of in-flight
//! `RequestProcessingState` instances (`spec.md` §3, §5).
//!
//! Locking discipline follows `spec.md` §5: a top-level `RwLock` guards
//! structural changes (insert/remove of an entry), while each entry carries
//! its own `Mutex` for field updates. A lookup takes the table lock in read
//! mode, clones the entry's `Arc<Mutex<_>>` handle, and releases the table
//! lock before acquiring the entry lock — so a caller never holds both
//! locks while doing anything that might block (e.g. a peer send).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use quorate_types::{ClientId, OffsetInBatch};

use crate::error::PreProcessorError;
use crate::request_state::RequestProcessingState;

/// Key identifying one in-flight request (`spec.md` §3 Invariant 1).
pub type RequestKey = (ClientId, OffsetInBatch);

/// A table entry: the state machine plus its own mutex.
pub type TableEntry = Arc<Mutex<RequestProcessingState>>;

/// Keyed collection of `RequestProcessingState` instances, one per
/// `(client id, offset-in-batch)` (`spec.md` §3 `RequestTable`).
#[derive(Debug, Default)]
pub struct RequestTable {
    entries: RwLock<HashMap<RequestKey, TableEntry>>,
    per_client_inflight: RwLock<HashMap<ClientId, AtomicU16>>,
}

impl RequestTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a freshly-constructed state for `key`, enforcing the
    /// per-client admission cap (`spec.md` §4.2 "Admission") and Invariant
    /// 1 (at most one active entry per key).
    pub fn insert(
        &self,
        key: RequestKey,
        state: RequestProcessingState,
        per_client_cap: u16,
    ) -> Result<TableEntry, PreProcessorError> {
        {
            let entries = self.entries.read().expect("request table lock poisoned");
            if entries.contains_key(&key) {
                return Err(PreProcessorError::DuplicateInFlight {
                    client: key.0.as_u16(),
                    offset: key.1.as_u16(),
                });
            }
        }

        {
            let clients = self
                .per_client_inflight
                .read()
                .expect("per-client counter lock poisoned");
            if let Some(counter) = clients.get(&key.0) {
                if counter.load(Ordering::Relaxed) >= per_client_cap {
                    return Err(PreProcessorError::Overloaded(key.0.as_u16()));
                }
            }
        }

        let mut entries = self.entries.write().expect("request table lock poisoned");
        if entries.contains_key(&key) {
            return Err(PreProcessorError::DuplicateInFlight {
                client: key.0.as_u16(),
                offset: key.1.as_u16(),
            });
        }
        let handle: TableEntry = Arc::new(Mutex::new(state));
        entries.insert(key, Arc::clone(&handle));
        drop(entries);

        let mut clients = self
            .per_client_inflight
            .write()
            .expect("per-client counter lock poisoned");
        clients
            .entry(key.0)
            .or_insert_with(|| AtomicU16::new(0))
            .fetch_add(1, Ordering::Relaxed);

        Ok(handle)
    }

    /// Looks up the entry handle for `key` without touching the entry
    /// mutex (`spec.md` §5: "take the table lock in shared mode, then the
    /// entry lock").
    pub fn get(&self, key: RequestKey) -> Option<TableEntry> {
        let entries = self.entries.read().expect("request table lock poisoned");
        entries.get(&key).cloned()
    }

    /// Removes `key` from the table, decrementing its client's in-flight
    /// counter. Idempotent: removing an absent key is a no-op.
    pub fn remove(&self, key: RequestKey) -> Option<TableEntry> {
        let removed = {
            let mut entries = self.entries.write().expect("request table lock poisoned");
            entries.remove(&key)
        };
        if removed.is_some() {
            let clients = self
                .per_client_inflight
                .read()
                .expect("per-client counter lock poisoned");
            if let Some(counter) = clients.get(&key.0) {
                let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                    Some(v.saturating_sub(1))
                });
            }
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("request table lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the keys of every currently-tracked entry, for the timer
    /// thread's expiry scan (`spec.md` §4.2 `onTimerTick`).
    pub fn keys(&self) -> Vec<RequestKey> {
        self.entries
            .read()
            .expect("request table lock poisoned")
            .keys()
            .copied()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quorate_types::{ReplicaId, ResultHash, RetryId, SeqNum, Timestamp};

    fn dummy_state() -> RequestProcessingState {
        RequestProcessingState::new(
            ReplicaId::new(0),
            4,
            2,
            "batch#1".into(),
            ClientId::new(1),
            OffsetInBatch::new(0),
            "cid#1".into(),
            SeqNum::new(1),
            crate::message::ClientPreProcessRequestMsg {
                client_id: ClientId::new(1),
                req_seq_num: SeqNum::new(1),
                cid: "cid#1".into(),
                payload: b"x".to_vec(),
                request_timeout_milli: 5_000,
                signature: None,
                flags: 0,
            },
            crate::message::PreProcessRequestMsg {
                batch_cid: "batch#1".into(),
                client_id: ClientId::new(1),
                offset_in_batch: OffsetInBatch::new(0),
                cid: "cid#1".into(),
                retry_id: RetryId::ZERO,
                primary_seq_num: 1,
                payload_digest: ResultHash::ZERO,
                payload: b"x".to_vec(),
            },
            None,
            Timestamp::from_millis(0),
        )
    }

    #[test]
    fn insert_then_get_round_trips() {
        let table = RequestTable::new();
        let key = (ClientId::new(1), OffsetInBatch::new(0));
        table.insert(key, dummy_state(), 16).unwrap();
        assert!(table.get(key).is_some());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let table = RequestTable::new();
        let key = (ClientId::new(1), OffsetInBatch::new(0));
        table.insert(key, dummy_state(), 16).unwrap();
        let err = table.insert(key, dummy_state(), 16).unwrap_err();
        assert_eq!(
            err,
            PreProcessorError::DuplicateInFlight {
                client: 1,
                offset: 0
            }
        );
    }

    #[test]
    fn remove_then_reinsert_succeeds() {
        let table = RequestTable::new();
        let key = (ClientId::new(1), OffsetInBatch::new(0));
        table.insert(key, dummy_state(), 16).unwrap();
        table.remove(key);
        assert!(table.get(key).is_none());
        table.insert(key, dummy_state(), 16).unwrap();
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn per_client_cap_rejects_beyond_limit() {
        let table = RequestTable::new();
        let key0 = (ClientId::new(1), OffsetInBatch::new(0));
        let key1 = (ClientId::new(1), OffsetInBatch::new(1));
        let key2 = (ClientId::new(1), OffsetInBatch::new(2));
        table.insert(key0, dummy_state(), 2).unwrap();
        table.insert(key1, dummy_state(), 2).unwrap();
        let err = table.insert(key2, dummy_state(), 2).unwrap_err();
        assert_eq!(err, PreProcessorError::Overloaded(1));
    }

    #[test]
    fn remove_is_idempotent() {
        let table = RequestTable::new();
        let key = (ClientId::new(1), OffsetInBatch::new(0));
        assert!(table.remove(key).is_none());
    }
}
