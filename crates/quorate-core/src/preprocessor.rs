//! `PreProcessor` — owner of the `RequestTable`, ingress/fan-out/retry
//! control flow, and the boundary to the ordering engine (`spec.md` §4.2).
//!
//! The back-reference the original holds into its owning replica
//! (`InternalReplicaApi`) is replaced with a single-method capability
//! (`spec.md` §9 "Cyclic ownership"): [`OrderingEngineSubmit`]. This crate
//! never reaches back toward its owner through any other path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use quorate_crypto::{digest_result, SigningKey, VerifyingKey};
use quorate_types::{OperationResult, ReplicaId, Timestamp};

use crate::arena::ResultArena;
use crate::config::PreProcessorConfig;
use crate::error::PreProcessorError;
use crate::instrumentation::{MetricsSnapshot, METRICS};
use crate::message::{
    ClientPreProcessRequestMsg, ClientRequestMsg, PreProcessReplyMsg, PreProcessRequestMsg,
    ReplyStatus,
};
use crate::request_state::{PreProcessingResult, RequestProcessingState};
use crate::request_table::{RequestKey, RequestTable, TableEntry};

/// The only way `quorate-core` reaches its owner: submit an agreed
/// request to the ordering engine (`spec.md` §9 "Cyclic ownership").
pub trait OrderingEngineSubmit: Send + Sync {
    fn submit(&self, msg: ClientRequestMsg) -> Result<(), SubmitError>;
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("ordering engine rejected submission: {0}")]
    Rejected(String),
}

/// Receives periodic metrics snapshots (`spec.md` §4.2 `setAggregator`).
pub trait MetricsAggregator: Send + Sync {
    fn observe(&self, snapshot: MetricsSnapshot);
}

/// Work a dispatching replica must perform outside any lock: send each
/// `PreProcessRequestMsg` to its target peer (`spec.md` §5 "Suspension
/// points" — message sends happen after the snapshot, never while holding
/// an entry mutex).
pub type DispatchWork = Vec<(ReplicaId, PreProcessRequestMsg)>;

/// Owns the `RequestTable`, the result arena shared across its entries,
/// and the capabilities needed to dispatch, verify, and submit
/// (`spec.md` §4.2).
pub struct PreProcessor {
    my_replica_id: ReplicaId,
    primary: ReplicaId,
    config: PreProcessorConfig,
    table: RequestTable,
    arena: Mutex<ResultArena>,
    signing_key: SigningKey,
    peer_verifying_keys: HashMap<ReplicaId, VerifyingKey>,
    ordering_engine: Arc<dyn OrderingEngineSubmit>,
    aggregator: Mutex<Option<Arc<dyn MetricsAggregator>>>,
    next_primary_seq_num: AtomicU64,
}

impl PreProcessor {
    pub fn new(
        my_replica_id: ReplicaId,
        primary: ReplicaId,
        config: PreProcessorConfig,
        signing_key: SigningKey,
        peer_verifying_keys: HashMap<ReplicaId, VerifyingKey>,
        ordering_engine: Arc<dyn OrderingEngineSubmit>,
    ) -> Self {
        Self {
            my_replica_id,
            primary,
            config,
            table: RequestTable::new(),
            arena: Mutex::new(ResultArena::new()),
            signing_key,
            peer_verifying_keys,
            ordering_engine,
            aggregator: Mutex::new(None),
            next_primary_seq_num: AtomicU64::new(0),
        }
    }

    pub fn is_primary(&self) -> bool {
        self.my_replica_id == self.primary
    }

    pub fn config(&self) -> &PreProcessorConfig {
        &self.config
    }

    pub fn table_len(&self) -> usize {
        self.table.len()
    }

    /// Snapshot of the request keys currently in flight, for a caller
    /// driving its own retry schedule (`spec.md` §4.2 `onRetryDue`).
    pub fn table_keys(&self) -> Vec<RequestKey> {
        self.table.keys()
    }

    /// Wires a metrics aggregator (`spec.md` §4.2 `setAggregator`).
    pub fn set_aggregator(&self, aggregator: Arc<dyn MetricsAggregator>) {
        *self.aggregator.lock().expect("aggregator lock poisoned") = Some(aggregator);
    }

    /// Pushes the current metrics snapshot to the wired aggregator, if
    /// any. Called by the replica shim's timer thread alongside
    /// `on_timer_tick`.
    pub fn publish_metrics(&self) {
        if let Some(aggregator) = &*self.aggregator.lock().expect("aggregator lock poisoned") {
            aggregator.observe(METRICS.snapshot());
        }
    }

    fn peer_replica_ids(&self) -> Vec<ReplicaId> {
        (0..self.config.num_replicas)
            .map(ReplicaId::new)
            .filter(|id| *id != self.my_replica_id)
            .collect()
    }

    /// Ingress from the client-facing port (`spec.md` §4.2
    /// `onClientPreProcessRequest`). `offset_in_batch` is assigned by the
    /// (external, unmodeled) client-batching component. When this replica
    /// is primary, the returned [`DispatchWork`] must be sent to every
    /// peer by the caller.
    pub fn on_client_pre_process_request(
        &self,
        msg: ClientPreProcessRequestMsg,
        offset_in_batch: quorate_types::OffsetInBatch,
        now: Timestamp,
    ) -> Result<Option<DispatchWork>, PreProcessorError> {
        let key = (msg.client_id, offset_in_batch);
        let primary_seq_num = self.next_primary_seq_num.fetch_add(1, Ordering::Relaxed);
        let pre_process_request = PreProcessRequestMsg {
            batch_cid: format!("{}/{}", msg.client_id, msg.req_seq_num),
            client_id: msg.client_id,
            offset_in_batch,
            cid: msg.cid.clone(),
            retry_id: quorate_types::RetryId::ZERO,
            primary_seq_num,
            payload_digest: digest_result(&msg.payload),
            payload: msg.payload.clone(),
        };

        let state = RequestProcessingState::new(
            self.my_replica_id,
            self.config.num_replicas,
            self.config.num_of_required_equal_replies(),
            pre_process_request.batch_cid.clone(),
            msg.client_id,
            offset_in_batch,
            msg.cid.clone(),
            msg.req_seq_num,
            msg.clone(),
            pre_process_request.clone(),
            msg.signature,
            now,
        );
        self.table.insert(key, state, self.config.per_client_request_cap)?;
        METRICS.entry_created();

        if self.is_primary() {
            METRICS.pre_process_request_sent();
            let dispatch = self
                .peer_replica_ids()
                .into_iter()
                .map(|id| (id, pre_process_request.clone()))
                .collect();
            Ok(Some(dispatch))
        } else {
            Ok(None)
        }
    }

    /// Non-primary path (`spec.md` §4.2 `onPreProcessRequest`). Actual
    /// speculative execution is performed by the (external) request
    /// handler; `speculative_result` is its already-computed output.
    pub fn on_pre_process_request(
        &self,
        from: ReplicaId,
        req: &PreProcessRequestMsg,
        speculative_result: (Vec<u8>, OperationResult),
    ) -> Result<PreProcessReplyMsg, PreProcessorError> {
        if from != self.primary {
            return Err(PreProcessorError::MalformedMessage(format!(
                "pre-process request from non-primary {from}"
            )));
        }
        let (data, result) = speculative_result;
        let status = if result.is_definitive_failure() {
            ReplyStatus::Rejected
        } else {
            ReplyStatus::Ok
        };
        let hash = digest_result(&data);
        let signature = self.signing_key.sign_hash(&hash);
        Ok(PreProcessReplyMsg {
            sender: self.my_replica_id,
            batch_cid: req.batch_cid.clone(),
            client_id: req.client_id,
            offset_in_batch: req.offset_in_batch,
            retry_id: req.retry_id,
            status,
            result_hash: hash,
            signature,
        })
    }

    /// Records this replica's own speculative execution (primary path,
    /// paired with `on_client_pre_process_request`).
    pub fn on_primary_pre_processed(
        &self,
        key: RequestKey,
        data: Vec<u8>,
        result: OperationResult,
    ) -> Result<(), PreProcessorError> {
        let entry = self
            .table
            .get(key)
            .ok_or(PreProcessorError::NoSuchEntry {
                client: key.0.as_u16(),
                offset: key.1.as_u16(),
            })?;
        let mut state = entry.lock().expect("entry mutex poisoned");
        let mut arena = self.arena.lock().expect("arena mutex poisoned");
        state.handle_primary_pre_processed(&mut arena, data, result);
        Ok(())
    }

    /// Primary path (`spec.md` §4.2 `onPreProcessReply`): verifies the
    /// sender's signature against its known verifying key, folds the
    /// reply into the entry, and submits or releases on a terminal
    /// outcome.
    pub fn on_pre_process_reply(
        &self,
        reply: PreProcessReplyMsg,
        now: Timestamp,
    ) -> Result<(), PreProcessorError> {
        if let Some(verifying_key) = self.peer_verifying_keys.get(&reply.sender) {
            if verifying_key
                .verify_hash(&reply.result_hash, &reply.signature)
                .is_err()
            {
                METRICS.signature_failure();
                return Err(PreProcessorError::SignatureInvalid);
            }
        }

        let key = (reply.client_id, reply.offset_in_batch);
        let Some(entry) = self.table.get(key) else {
            return Err(PreProcessorError::NoSuchEntry {
                client: key.0.as_u16(),
                offset: key.1.as_u16(),
            });
        };
        METRICS.pre_process_reply_received();

        {
            let mut state = entry.lock().expect("entry mutex poisoned");
            state.handle_pre_process_reply_msg(&reply)?;
        }

        self.finalize_if_terminal(key, &entry, now);
        Ok(())
    }

    /// Scans the table for entries past their deadline (`spec.md` §4.2
    /// `onTimerTick`).
    pub fn on_timer_tick(&self, now: Timestamp) {
        for key in self.table.keys() {
            if let Some(entry) = self.table.get(key) {
                self.finalize_if_terminal(key, &entry, now);
            }
        }
    }

    /// Issues a fresh retry round for `key` if it is still `CONTINUE` and
    /// has not yet timed out (`spec.md` §4.2 `onRetryDue`). Targets only
    /// peers that have not yet responded in the round being superseded.
    pub fn on_retry_due(&self, key: RequestKey, now: Timestamp) -> Option<DispatchWork> {
        let entry = self.table.get(key)?;
        let mut state = entry.lock().expect("entry mutex poisoned");
        if state.is_released() {
            return None;
        }
        let mut arena = self.arena.lock().expect("arena mutex poisoned");
        if state.define_pre_processing_consensus_result(&mut arena, now) != PreProcessingResult::Continue
        {
            return None;
        }
        if state.is_req_timed_out(now) {
            return None;
        }

        let already_responded = state.responded_replica_ids();
        let retry_id = state.next_retry_id();
        state.reset_for_retry(&mut arena);
        drop(arena);
        METRICS.retry_issued();

        let base = state.pre_process_request().clone();
        let targets: Vec<ReplicaId> = self
            .peer_replica_ids()
            .into_iter()
            .filter(|id| !already_responded.contains(id))
            .collect();
        Some(
            targets
                .into_iter()
                .map(|id| {
                    let mut msg = base.clone();
                    msg.retry_id = retry_id;
                    (id, msg)
                })
                .collect(),
        )
    }

    /// Computes the outcome for `key`'s entry; on a terminal outcome,
    /// releases it, removes it from the table, and submits the resulting
    /// message to the ordering engine (`spec.md` §4.2 dispatch table).
    fn finalize_if_terminal(&self, key: RequestKey, entry: &TableEntry, now: Timestamp) {
        let (outcome, msg) = {
            let mut state = entry.lock().expect("entry mutex poisoned");
            let mut arena = self.arena.lock().expect("arena mutex poisoned");
            let outcome = state.define_pre_processing_consensus_result(&mut arena, now);
            let msg = match outcome {
                PreProcessingResult::Complete => Some(state.build_client_request_msg(&arena, false)),
                PreProcessingResult::Cancel
                | PreProcessingResult::CancelledByPrimary
                | PreProcessingResult::Expired
                | PreProcessingResult::Failed => Some(state.build_client_request_msg(&arena, true)),
                PreProcessingResult::Continue | PreProcessingResult::None => None,
            };
            if msg.is_some() {
                state.release_resources(&mut arena);
            }
            (outcome, msg)
        };

        if let Some(msg) = msg {
            self.table.remove(key);
            METRICS.entry_released();
            METRICS.record_outcome(outcome);
            if let Err(err) = self.ordering_engine.submit(msg) {
                tracing::warn!(error = %err, client = %key.0, offset = %key.1, "ordering engine rejected submission");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quorate_crypto::SigningKey;
    use quorate_types::{ClientId, OffsetInBatch, RetryId, SeqNum};
    use std::sync::Mutex as StdMutex;

    struct CollectingSubmitter {
        submitted: StdMutex<Vec<ClientRequestMsg>>,
    }

    impl CollectingSubmitter {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                submitted: StdMutex::new(Vec::new()),
            })
        }
    }

    impl OrderingEngineSubmit for CollectingSubmitter {
        fn submit(&self, msg: ClientRequestMsg) -> Result<(), SubmitError> {
            self.submitted.lock().unwrap().push(msg);
            Ok(())
        }
    }

    fn client_msg(timeout_ms: u64) -> ClientPreProcessRequestMsg {
        ClientPreProcessRequestMsg {
            client_id: ClientId::new(1),
            req_seq_num: SeqNum::new(100),
            cid: "cid#1".into(),
            payload: b"work".to_vec(),
            request_timeout_milli: timeout_ms,
            signature: None,
            flags: 0,
        }
    }

    fn build_preprocessor(my_id: u16, primary: u16) -> (PreProcessor, Arc<CollectingSubmitter>) {
        let submitter = CollectingSubmitter::new();
        let config = PreProcessorConfig::for_tests(1, 0);
        let signing_key = SigningKey::from_bytes(&[my_id as u8 + 1; 32]);
        let pp = PreProcessor::new(
            ReplicaId::new(my_id),
            ReplicaId::new(primary),
            config,
            signing_key,
            HashMap::new(),
            submitter.clone(),
        );
        (pp, submitter)
    }

    #[test]
    fn primary_dispatches_to_all_peers() {
        let (pp, _submitter) = build_preprocessor(0, 0);
        let dispatch = pp
            .on_client_pre_process_request(client_msg(5_000), OffsetInBatch::new(0), Timestamp::from_millis(0))
            .unwrap();
        let dispatch = dispatch.expect("primary must dispatch");
        assert_eq!(dispatch.len(), pp.config().num_of_peers() as usize);
    }

    #[test]
    fn non_primary_does_not_dispatch() {
        let (pp, _submitter) = build_preprocessor(1, 0);
        let dispatch = pp
            .on_client_pre_process_request(client_msg(5_000), OffsetInBatch::new(0), Timestamp::from_millis(0))
            .unwrap();
        assert!(dispatch.is_none());
    }

    #[test]
    fn full_round_trip_submits_to_ordering_engine() {
        let (pp, submitter) = build_preprocessor(0, 0);
        let key = (ClientId::new(1), OffsetInBatch::new(0));
        pp.on_client_pre_process_request(client_msg(5_000), OffsetInBatch::new(0), Timestamp::from_millis(0))
            .unwrap();
        pp.on_primary_pre_processed(key, b"RESULT".to_vec(), OperationResult::Success)
            .unwrap();

        let hash = digest_result(b"RESULT");
        for sender in [1u16, 2] {
            let reply = PreProcessReplyMsg {
                sender: ReplicaId::new(sender),
                batch_cid: format!("{}/{}", key.0, SeqNum::new(100)),
                client_id: key.0,
                offset_in_batch: key.1,
                retry_id: RetryId::ZERO,
                status: ReplyStatus::Ok,
                result_hash: hash,
                signature: quorate_crypto::Signature([0u8; 64]),
            };
            pp.on_pre_process_reply(reply, Timestamp::from_millis(10))
                .unwrap();
        }

        assert_eq!(submitter.submitted.lock().unwrap().len(), 1);
        assert_eq!(pp.table_len(), 0);
    }

    #[test]
    fn duplicate_client_offset_is_rejected() {
        let (pp, _submitter) = build_preprocessor(0, 0);
        pp.on_client_pre_process_request(client_msg(5_000), OffsetInBatch::new(0), Timestamp::from_millis(0))
            .unwrap();
        let err = pp
            .on_client_pre_process_request(client_msg(5_000), OffsetInBatch::new(0), Timestamp::from_millis(0))
            .unwrap_err();
        assert!(matches!(err, PreProcessorError::DuplicateInFlight { .. }));
    }

    #[test]
    fn timer_tick_expires_stale_entry() {
        let (pp, submitter) = build_preprocessor(0, 0);
        pp.on_client_pre_process_request(client_msg(50), OffsetInBatch::new(0), Timestamp::from_millis(0))
            .unwrap();
        pp.on_timer_tick(Timestamp::from_millis(100));
        assert_eq!(pp.table_len(), 0);
        let submitted = submitter.submitted.lock().unwrap();
        assert_eq!(submitted[0].agreed_result, OperationResult::Timeout);
    }

    #[test]
    fn retry_due_targets_only_non_responders() {
        let (pp, _submitter) = build_preprocessor(0, 0);
        let key = (ClientId::new(1), OffsetInBatch::new(0));
        pp.on_client_pre_process_request(client_msg(5_000), OffsetInBatch::new(0), Timestamp::from_millis(0))
            .unwrap();

        let reply = PreProcessReplyMsg {
            sender: ReplicaId::new(1),
            batch_cid: format!("{}/{}", key.0, SeqNum::new(100)),
            client_id: key.0,
            offset_in_batch: key.1,
            retry_id: RetryId::ZERO,
            status: ReplyStatus::Ok,
            result_hash: digest_result(b"whatever"),
            signature: quorate_crypto::Signature([0u8; 64]),
        };
        pp.on_pre_process_reply(reply, Timestamp::from_millis(10))
            .unwrap();

        let dispatch = pp
            .on_retry_due(key, Timestamp::from_millis(20))
            .expect("still continuing, retry should fire");
        let targets: Vec<u16> = dispatch.iter().map(|(id, _)| id.as_u16()).collect();
        assert!(!targets.contains(&1));
        assert!(targets.contains(&2));
    }
}
