//! `RequestProcessingState` — the per-request consensus state machine
//! (`spec.md` §4.1).
//!
//! One instance lives for exactly one `(client id, offset-in-batch)`
//! pair, from ingress until `COMPLETE`/`CANCEL`/`CANCELLED_BY_PRIMARY`/
//! `EXPIRED`/`FAILED`. It is not internally synchronized
//! (`spec.md` §5): the `RequestTable` entry mutex around it is the only
//! thing making its methods safe to call concurrently with itself.

use std::collections::HashMap;

use quorate_crypto::{digest_result, Signature};
use quorate_types::{
    ClientId, OffsetInBatch, OperationResult, ReplicaId, ResultHash, RetryId, SeqNum, Timestamp,
};

use crate::arena::{ArenaSlice, ResultArena};
use crate::error::PreProcessorError;
use crate::message::{
    ClientPreProcessRequestMsg, ClientRequestMsg, PreProcessReplyMsg, PreProcessRequestMsg,
    ReplyStatus,
};

/// Outcome of [`RequestProcessingState::define_pre_processing_consensus_result`]
/// (`spec.md` §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreProcessingResult {
    /// Insufficient replies; no decision yet.
    Continue,
    /// A hash reached threshold and the primary's hash agrees with it.
    Complete,
    /// No hash can ever reach threshold given the replies still possible.
    Cancel,
    /// The primary's own speculative execution failed definitively.
    CancelledByPrimary,
    /// `now - entryTime` exceeded the request's timeout before completion.
    Expired,
    /// Non-deterministic execution detected beyond recovery.
    Failed,
    /// Terminal sentinel returned after `release_resources`.
    None,
}

/// The per-request consensus state machine (`spec.md` §4.1).
#[derive(Debug)]
pub struct RequestProcessingState {
    my_replica_id: ReplicaId,
    num_of_replicas: u16,
    num_of_required_equal_replies: u16,

    batch_cid: String,
    client_id: ClientId,
    offset_in_batch: OffsetInBatch,
    cid: String,
    req_seq_num: SeqNum,

    client_request: Option<ClientPreProcessRequestMsg>,
    pre_process_request: PreProcessRequestMsg,
    client_signature: Option<Signature>,

    num_of_received_replies: u16,
    primary_pre_process_result_hash: ResultHash,
    primary_pre_process_result_data: Option<ArenaSlice>,
    primary_pre_process_result: OperationResult,
    agreed_pre_process_result: OperationResult,

    pre_processing_result_hashes: HashMap<ResultHash, Vec<(ReplicaId, Signature)>>,
    rejected_replica_ids: Vec<ReplicaId>,

    preprocessing_right_now: bool,
    released: bool,
    req_retry_id: RetryId,
    entry_time: Timestamp,
    request_timeout_milli: u64,
}

impl RequestProcessingState {
    /// Constructs a new state for one `(client id, offset-in-batch)`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        my_replica_id: ReplicaId,
        num_of_replicas: u16,
        num_of_required_equal_replies: u16,
        batch_cid: String,
        client_id: ClientId,
        offset_in_batch: OffsetInBatch,
        cid: String,
        req_seq_num: SeqNum,
        client_request: ClientPreProcessRequestMsg,
        pre_process_request: PreProcessRequestMsg,
        client_signature: Option<Signature>,
        entry_time: Timestamp,
    ) -> Self {
        let request_timeout_milli = client_request.request_timeout_milli();
        Self {
            my_replica_id,
            num_of_replicas,
            num_of_required_equal_replies,
            batch_cid,
            client_id,
            offset_in_batch,
            cid,
            req_seq_num,
            client_request: Some(client_request),
            pre_process_request,
            client_signature,
            num_of_received_replies: 0,
            primary_pre_process_result_hash: ResultHash::ZERO,
            primary_pre_process_result_data: None,
            primary_pre_process_result: OperationResult::Unknown,
            agreed_pre_process_result: OperationResult::Unknown,
            pre_processing_result_hashes: HashMap::new(),
            rejected_replica_ids: Vec::new(),
            preprocessing_right_now: false,
            released: false,
            req_retry_id: RetryId::ZERO,
            entry_time,
            request_timeout_milli,
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn offset_in_batch(&self) -> OffsetInBatch {
        self.offset_in_batch
    }

    pub fn req_retry_id(&self) -> RetryId {
        self.req_retry_id
    }

    pub fn cid(&self) -> &str {
        &self.cid
    }

    pub fn req_timeout_milli(&self) -> u64 {
        self.request_timeout_milli
    }

    pub fn is_req_timed_out(&self, now: Timestamp) -> bool {
        now.since(self.entry_time) >= self.request_timeout_milli
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// The client's original request payload — what peers speculatively
    /// execute, distinct from the primary's result (`spec.md` §3).
    pub fn client_request_payload(&self) -> Option<&[u8]> {
        self.client_request.as_ref().map(|r| r.payload.as_slice())
    }

    pub fn client_signature(&self) -> Option<Signature> {
        self.client_signature.clone()
    }

    /// The `PreProcessRequestMsg` the primary originally dispatched —
    /// what gets resent, addressed to non-responders, on retry.
    pub fn pre_process_request(&self) -> &PreProcessRequestMsg {
        &self.pre_process_request
    }

    pub fn num_of_received_replies(&self) -> u16 {
        self.num_of_received_replies
    }

    /// Replicas that have already contributed a reply (OK or REJECTED)
    /// in the current retry round — used to target resends at peers that
    /// have not yet responded (`spec.md` §4.2 `onRetryDue`).
    pub fn responded_replica_ids(&self) -> Vec<ReplicaId> {
        let mut ids: Vec<ReplicaId> = self.rejected_replica_ids.clone();
        for signers in self.pre_processing_result_hashes.values() {
            for (id, _) in signers {
                if !ids.contains(id) {
                    ids.push(*id);
                }
            }
        }
        ids
    }

    /// Bumps `reqRetryId` for a fresh dispatch round (`spec.md` §4.2
    /// `onRetryDue`): previously collected votes remain in the map keyed
    /// by hash (harmless — they simply can no longer reach threshold
    /// alone since new replies are tagged with the new id and old ones
    /// are dropped in `handle_pre_process_reply_msg`), but are no longer
    /// eligible to be joined by further same-retry peers. A pre-processor
    /// driving retries is expected to rebuild the state's hash map
    /// fresh via [`Self::reset_for_retry`] if it wants a clean slate.
    pub fn next_retry_id(&mut self) -> RetryId {
        self.req_retry_id = self.req_retry_id.next();
        self.req_retry_id
    }

    /// Clears reply bookkeeping for a new retry round, keeping the
    /// client request and construction parameters intact.
    pub fn reset_for_retry(&mut self, arena: &mut ResultArena) {
        self.num_of_received_replies = 0;
        self.pre_processing_result_hashes.clear();
        self.rejected_replica_ids.clear();
        if let Some(slice) = self.primary_pre_process_result_data.take() {
            arena.release(slice);
        }
        self.primary_pre_process_result_hash = ResultHash::ZERO;
        self.primary_pre_process_result = OperationResult::Unknown;
    }

    /// Records the primary's speculative execution output (`spec.md`
    /// §4.1 `handlePrimaryPreProcessed`). Idempotent when called twice
    /// with the same bytes for the current retry; a differing result for
    /// the same retry id is an unrecoverable local invariant violation
    /// (Error kind 7, `spec.md` §7).
    pub fn handle_primary_pre_processed(
        &mut self,
        arena: &mut ResultArena,
        data: Vec<u8>,
        result: OperationResult,
    ) {
        let hash = digest_result(&data);
        if self.primary_pre_process_result_hash.is_zero() {
            let slice = arena.alloc(data);
            self.primary_pre_process_result_data = Some(slice);
            self.primary_pre_process_result_hash = hash;
            self.primary_pre_process_result = result;
            // The primary is a signer of its own hash (`spec.md` §4.1
            // "records the primary as its own contributor"): without this,
            // `max_nbr_of_equal_hashes` undercounts by one and a primary
            // plus a single matching peer can never reach threshold.
            self.pre_processing_result_hashes
                .entry(hash)
                .or_default()
                .push((self.my_replica_id, Signature([0u8; 64])));
            return;
        }
        crate::invariant!(
            self.primary_pre_process_result_hash == hash,
            "duplicate primary pre-process for retry {} of client {} offset {} with differing hash",
            self.req_retry_id,
            self.client_id,
            self.offset_in_batch,
        );
    }

    /// Absorbs a peer's reply (`spec.md` §4.1 `handlePreProcessReplyMsg`).
    /// Stale-retry and duplicate-sender replies are dropped silently, per
    /// Invariant 2 in `spec.md` §3.
    pub fn handle_pre_process_reply_msg(
        &mut self,
        reply: &PreProcessReplyMsg,
    ) -> Result<(), PreProcessorError> {
        if reply.sender.as_u16() >= self.num_of_replicas {
            return Err(PreProcessorError::MalformedMessage(format!(
                "reply sender {} out of range",
                reply.sender
            )));
        }
        if reply.retry_id != self.req_retry_id {
            return Ok(());
        }
        if self.rejected_replica_ids.contains(&reply.sender) {
            return Ok(());
        }
        if self
            .pre_processing_result_hashes
            .values()
            .any(|signers| signers.iter().any(|(id, _)| *id == reply.sender))
        {
            return Ok(());
        }

        match reply.status {
            ReplyStatus::Rejected => {
                self.rejected_replica_ids.push(reply.sender);
                self.num_of_received_replies += 1;
            }
            ReplyStatus::Ok => {
                let is_new_disagreeing_hash = !self.pre_processing_result_hashes.is_empty()
                    && !self
                        .pre_processing_result_hashes
                        .contains_key(&reply.result_hash);
                if is_new_disagreeing_hash {
                    for existing in self.pre_processing_result_hashes.keys() {
                        self.detect_non_deterministic_preprocessing(
                            reply.sender,
                            *existing,
                            reply.result_hash,
                        );
                    }
                }
                self.pre_processing_result_hashes
                    .entry(reply.result_hash)
                    .or_default()
                    .push((reply.sender, reply.signature.clone()));
                self.num_of_received_replies += 1;
            }
        }
        Ok(())
    }

    fn detect_non_deterministic_preprocessing(
        &self,
        sender: ReplicaId,
        existing_hash: ResultHash,
        new_hash: ResultHash,
    ) {
        tracing::error!(
            non_deterministic = true,
            sender = %sender,
            retry_id = %self.req_retry_id,
            existing_hash = ?existing_hash,
            new_hash = ?new_hash,
            "disagreeing pre-process result hashes observed",
        );
    }

    /// Largest signer count across all observed hashes, and the hash it
    /// belongs to (`spec.md` §4.1 `calculateMaxNbrOfEqualHashes`). Ties
    /// resolve to whichever hash the map iterates first; `spec.md` §9
    /// Ambiguity (1) leaves the tie-break undefined, and this can only
    /// occur when the threshold is misconfigured at or below `(N-1)/2`.
    fn max_nbr_of_equal_hashes(&self) -> (ResultHash, u16) {
        self.pre_processing_result_hashes
            .iter()
            .map(|(hash, signers)| (*hash, signers.len() as u16))
            .max_by_key(|(_, count)| *count)
            .unwrap_or((ResultHash::ZERO, 0))
    }

    fn remaining_possible_replies(&self) -> u16 {
        (self.num_of_replicas - 1).saturating_sub(self.num_of_received_replies)
    }

    /// True once every peer has either replied or been marked rejected.
    fn all_peers_replied(&self) -> bool {
        self.remaining_possible_replies() == 0
    }

    /// FAILED trigger (`spec.md` §4.1 "Non-determinism detection"):
    /// more than one hash has reached a simple majority of the peer
    /// pool.
    fn has_conflicting_majorities(&self) -> bool {
        let majority = (self.num_of_replicas - 1) / 2 + 1;
        self.pre_processing_result_hashes
            .values()
            .filter(|signers| signers.len() as u16 >= majority)
            .count()
            > 1
    }

    /// Attempts the BlockID fixup (`spec.md` §4.1 "BlockID fixup"): the
    /// agreed block id is the `primarySeqNum` already carried on the
    /// outbound pre-process request (see `SPEC_FULL.md` §4.1). Strips the
    /// primary's trailing 8-byte block id, appends the agreed one, and
    /// re-hashes; succeeds only if that matches `winning_hash`.
    fn try_block_id_fixup(
        &mut self,
        arena: &mut ResultArena,
        winning_hash: ResultHash,
    ) -> Option<ResultHash> {
        let slice = self.primary_pre_process_result_data?;
        let data = arena.get(slice);
        if data.len() < 8 {
            return None;
        }
        let mut rebuilt = data[..data.len() - 8].to_vec();
        rebuilt.extend_from_slice(&self.pre_process_request.primary_seq_num.to_be_bytes());
        let candidate = digest_result(&rebuilt);
        if candidate == winning_hash {
            let new_slice = arena.replace(slice, rebuilt);
            self.primary_pre_process_result_data = Some(new_slice);
            Some(candidate)
        } else {
            None
        }
    }

    /// Decides the current outcome (`spec.md` §4.1
    /// `definePreProcessingConsensusResult`). `now` drives the expiry
    /// check; callers poll this on reply arrival and on timer tick.
    pub fn define_pre_processing_consensus_result(
        &mut self,
        arena: &mut ResultArena,
        now: Timestamp,
    ) -> PreProcessingResult {
        if self.released {
            return PreProcessingResult::None;
        }
        if self.preprocessing_right_now {
            return PreProcessingResult::Continue;
        }
        self.preprocessing_right_now = true;
        let result = self.compute_result(arena, now);
        self.preprocessing_right_now = false;
        result
    }

    fn compute_result(&mut self, arena: &mut ResultArena, now: Timestamp) -> PreProcessingResult {
        if self.primary_pre_process_result.is_definitive_failure() {
            self.agreed_pre_process_result = self.primary_pre_process_result;
            return PreProcessingResult::CancelledByPrimary;
        }

        let (winning_hash, max_count) = self.max_nbr_of_equal_hashes();
        if max_count >= self.num_of_required_equal_replies {
            if self.primary_pre_process_result_hash == winning_hash {
                self.agreed_pre_process_result = self.primary_pre_process_result;
                return PreProcessingResult::Complete;
            }
            if let Some(fixed_hash) = self.try_block_id_fixup(arena, winning_hash) {
                self.primary_pre_process_result_hash = fixed_hash;
                self.agreed_pre_process_result = self.primary_pre_process_result;
                return PreProcessingResult::Complete;
            }
            if self.all_peers_replied() {
                return PreProcessingResult::Failed;
            }
        } else {
            let remaining = self.remaining_possible_replies();
            if remaining + max_count < self.num_of_required_equal_replies {
                return PreProcessingResult::Cancel;
            }
        }

        if self.has_conflicting_majorities() {
            return PreProcessingResult::Failed;
        }

        if self.is_req_timed_out(now) {
            self.agreed_pre_process_result = OperationResult::Timeout;
            return PreProcessingResult::Expired;
        }

        PreProcessingResult::Continue
    }

    /// Builds the message forwarded to the ordering engine (`spec.md`
    /// §4.1 `buildClientRequestMsg`). `empty_req` is set on `CANCEL`-class
    /// outcomes, carrying only the header.
    pub fn build_client_request_msg(
        &self,
        arena: &ResultArena,
        empty_req: bool,
    ) -> ClientRequestMsg {
        let payload = if empty_req {
            None
        } else {
            self.primary_pre_process_result_data
                .map(|slice| arena.get(slice).to_vec())
        };
        ClientRequestMsg {
            client_id: self.client_id,
            offset_in_batch: self.offset_in_batch,
            cid: self.cid.clone(),
            req_seq_num: self.req_seq_num,
            agreed_result: self.agreed_pre_process_result,
            payload,
        }
    }

    /// Frees the owned client request and the primary's arena allocation
    /// (`spec.md` §4.1 `releaseResources`). Idempotent.
    pub fn release_resources(&mut self, arena: &mut ResultArena) {
        if self.released {
            return;
        }
        if let Some(slice) = self.primary_pre_process_result_data.take() {
            arena.release(slice);
        }
        self.client_request = None;
        self.pre_processing_result_hashes.clear();
        self.released = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quorate_crypto::Signature;

    fn client_request(timeout_ms: u64) -> ClientPreProcessRequestMsg {
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

    fn pre_process_request(primary_seq_num: u64) -> PreProcessRequestMsg {
        PreProcessRequestMsg {
            batch_cid: "batch#1".into(),
            client_id: ClientId::new(1),
            offset_in_batch: OffsetInBatch::new(0),
            cid: "cid#1".into(),
            retry_id: RetryId::ZERO,
            primary_seq_num,
            payload_digest: ResultHash::ZERO,
            payload: b"work".to_vec(),
        }
    }

    fn new_state(num_of_replicas: u16, threshold: u16, timeout_ms: u64) -> RequestProcessingState {
        RequestProcessingState::new(
            ReplicaId::new(0),
            num_of_replicas,
            threshold,
            "batch#1".into(),
            ClientId::new(1),
            OffsetInBatch::new(0),
            "cid#1".into(),
            SeqNum::new(100),
            client_request(timeout_ms),
            pre_process_request(42),
            None,
            Timestamp::from_millis(0),
        )
    }

    fn reply(
        sender: u16,
        retry_id: RetryId,
        status: ReplyStatus,
        hash: ResultHash,
    ) -> PreProcessReplyMsg {
        PreProcessReplyMsg {
            sender: ReplicaId::new(sender),
            batch_cid: "batch#1".into(),
            client_id: ClientId::new(1),
            offset_in_batch: OffsetInBatch::new(0),
            retry_id,
            status,
            result_hash: hash,
            signature: Signature([0u8; 64]),
        }
    }

    // Scenario 1: happy path, N=4.
    #[test]
    fn scenario_happy_path_completes() {
        let mut arena = ResultArena::new();
        let mut state = new_state(4, 2, 5_000);
        state.handle_primary_pre_processed(&mut arena, b"RESULT".to_vec(), OperationResult::Success);
        let hash = digest_result(b"RESULT");

        state
            .handle_pre_process_reply_msg(&reply(1, RetryId::ZERO, ReplyStatus::Ok, hash))
            .unwrap();
        state
            .handle_pre_process_reply_msg(&reply(2, RetryId::ZERO, ReplyStatus::Ok, hash))
            .unwrap();

        let result = state.define_pre_processing_consensus_result(&mut arena, Timestamp::from_millis(10));
        assert_eq!(result, PreProcessingResult::Complete);
        let msg = state.build_client_request_msg(&arena, false);
        assert_eq!(msg.payload.as_deref(), Some(b"RESULT".as_slice()));
        assert_eq!(msg.agreed_result, OperationResult::Success);
    }

    // Boundary (`spec.md` §8): N=4, f=1 → threshold 2. The primary counts
    // as one signer of its own hash, so exactly one matching peer reply
    // is enough to reach COMPLETE — two peer replies are not required.
    #[test]
    fn primary_plus_one_matching_peer_completes() {
        let mut arena = ResultArena::new();
        let mut state = new_state(4, 2, 5_000);
        state.handle_primary_pre_processed(&mut arena, b"RESULT".to_vec(), OperationResult::Success);
        let hash = digest_result(b"RESULT");

        state
            .handle_pre_process_reply_msg(&reply(1, RetryId::ZERO, ReplyStatus::Ok, hash))
            .unwrap();

        let result = state.define_pre_processing_consensus_result(&mut arena, Timestamp::from_millis(10));
        assert_eq!(result, PreProcessingResult::Complete);
    }

    // Scenario 2: a disagreeing minority does not block consensus.
    #[test]
    fn scenario_non_deterministic_minority_still_completes() {
        let mut arena = ResultArena::new();
        let mut state = new_state(4, 2, 5_000);
        state.handle_primary_pre_processed(&mut arena, b"RESULT".to_vec(), OperationResult::Success);
        let h_r = digest_result(b"RESULT");
        let h_x = digest_result(b"OTHER");

        state
            .handle_pre_process_reply_msg(&reply(1, RetryId::ZERO, ReplyStatus::Ok, h_r))
            .unwrap();
        state
            .handle_pre_process_reply_msg(&reply(2, RetryId::ZERO, ReplyStatus::Ok, h_x))
            .unwrap();
        state
            .handle_pre_process_reply_msg(&reply(3, RetryId::ZERO, ReplyStatus::Ok, h_r))
            .unwrap();

        let result = state.define_pre_processing_consensus_result(&mut arena, Timestamp::from_millis(10));
        assert_eq!(result, PreProcessingResult::Complete);
    }

    // Scenario 3: unreachable quorum.
    #[test]
    fn scenario_unreachable_quorum_cancels() {
        let mut arena = ResultArena::new();
        let mut state = new_state(4, 2, 5_000);
        state.handle_primary_pre_processed(&mut arena, b"P".to_vec(), OperationResult::Success);

        state
            .handle_pre_process_reply_msg(&reply(1, RetryId::ZERO, ReplyStatus::Ok, digest_result(b"A")))
            .unwrap();
        state
            .handle_pre_process_reply_msg(&reply(2, RetryId::ZERO, ReplyStatus::Ok, digest_result(b"B")))
            .unwrap();
        state
            .handle_pre_process_reply_msg(&reply(3, RetryId::ZERO, ReplyStatus::Ok, digest_result(b"C")))
            .unwrap();

        let result = state.define_pre_processing_consensus_result(&mut arena, Timestamp::from_millis(10));
        assert_eq!(result, PreProcessingResult::Cancel);
    }

    // Scenario 4: retry recovery; stale-retry replies are dropped.
    #[test]
    fn scenario_retry_recovery_drops_stale_replies() {
        let mut arena = ResultArena::new();
        let mut state = new_state(4, 2, 5_000);

        // retry 0: only replica 1 responds before the retry fires.
        state
            .handle_pre_process_reply_msg(&reply(1, RetryId::ZERO, ReplyStatus::Ok, digest_result(b"stale")))
            .unwrap();

        let retry_one = state.next_retry_id();
        state.reset_for_retry(&mut arena);
        state.handle_primary_pre_processed(&mut arena, b"RESULT".to_vec(), OperationResult::Success);
        let h_r = digest_result(b"RESULT");

        state
            .handle_pre_process_reply_msg(&reply(2, retry_one, ReplyStatus::Ok, h_r))
            .unwrap();
        state
            .handle_pre_process_reply_msg(&reply(3, retry_one, ReplyStatus::Ok, h_r))
            .unwrap();

        // Late reply tagged with the old retry id must not count.
        state
            .handle_pre_process_reply_msg(&reply(1, RetryId::ZERO, ReplyStatus::Ok, h_r))
            .unwrap();

        let result = state.define_pre_processing_consensus_result(&mut arena, Timestamp::from_millis(10));
        assert_eq!(result, PreProcessingResult::Complete);
    }

    // Scenario 5: BlockID fixup.
    #[test]
    fn scenario_block_id_fixup_rewrites_primary_result() {
        let mut arena = ResultArena::new();
        let mut state = new_state(4, 2, 5_000);

        let mut primary_bytes = b"bytes".to_vec();
        primary_bytes.extend_from_slice(&41u64.to_be_bytes());
        state.handle_primary_pre_processed(&mut arena, primary_bytes, OperationResult::Success);

        let mut peer_bytes = b"bytes".to_vec();
        peer_bytes.extend_from_slice(&42u64.to_be_bytes());
        let h_y = digest_result(&peer_bytes);

        state
            .handle_pre_process_reply_msg(&reply(1, RetryId::ZERO, ReplyStatus::Ok, h_y))
            .unwrap();
        state
            .handle_pre_process_reply_msg(&reply(2, RetryId::ZERO, ReplyStatus::Ok, h_y))
            .unwrap();

        let result = state.define_pre_processing_consensus_result(&mut arena, Timestamp::from_millis(10));
        assert_eq!(result, PreProcessingResult::Complete);
        let msg = state.build_client_request_msg(&arena, false);
        assert_eq!(msg.payload.as_deref(), Some(peer_bytes.as_slice()));
    }

    // Scenario 6: expiry.
    #[test]
    fn scenario_expiry_at_exact_boundary() {
        let mut arena = ResultArena::new();
        let mut state = new_state(4, 2, 200);
        let result =
            state.define_pre_processing_consensus_result(&mut arena, Timestamp::from_millis(200));
        assert_eq!(result, PreProcessingResult::Expired);
        assert_eq!(state.agreed_pre_process_result, OperationResult::Timeout);
    }

    #[test]
    fn not_yet_timed_out_continues() {
        let mut arena = ResultArena::new();
        let mut state = new_state(4, 2, 200);
        let result =
            state.define_pre_processing_consensus_result(&mut arena, Timestamp::from_millis(199));
        assert_eq!(result, PreProcessingResult::Continue);
    }

    #[test]
    fn duplicate_sender_reply_is_ignored() {
        let mut arena = ResultArena::new();
        let mut state = new_state(4, 2, 5_000);
        let hash = digest_result(b"RESULT");
        state
            .handle_pre_process_reply_msg(&reply(1, RetryId::ZERO, ReplyStatus::Ok, hash))
            .unwrap();
        state
            .handle_pre_process_reply_msg(&reply(1, RetryId::ZERO, ReplyStatus::Ok, hash))
            .unwrap();
        assert_eq!(state.num_of_received_replies, 1);
    }

    #[test]
    fn primary_definitive_failure_cancels() {
        let mut arena = ResultArena::new();
        let mut state = new_state(4, 2, 5_000);
        state.handle_primary_pre_processed(&mut arena, b"bad".to_vec(), OperationResult::InvalidRequest);
        let result =
            state.define_pre_processing_consensus_result(&mut arena, Timestamp::from_millis(10));
        assert_eq!(result, PreProcessingResult::CancelledByPrimary);
    }

    #[test]
    #[should_panic(expected = "differing hash")]
    fn primary_reprocessing_with_different_data_panics() {
        let mut arena = ResultArena::new();
        let mut state = new_state(4, 2, 5_000);
        state.handle_primary_pre_processed(&mut arena, b"one".to_vec(), OperationResult::Success);
        state.handle_primary_pre_processed(&mut arena, b"two".to_vec(), OperationResult::Success);
    }

    #[test]
    fn primary_reprocessing_with_same_data_is_idempotent() {
        let mut arena = ResultArena::new();
        let mut state = new_state(4, 2, 5_000);
        state.handle_primary_pre_processed(&mut arena, b"same".to_vec(), OperationResult::Success);
        state.handle_primary_pre_processed(&mut arena, b"same".to_vec(), OperationResult::Success);
        assert_eq!(
            state.primary_pre_process_result_hash,
            digest_result(b"same")
        );
    }

    #[test]
    fn release_resources_is_idempotent_and_then_returns_none() {
        let mut arena = ResultArena::new();
        let mut state = new_state(4, 2, 5_000);
        state.handle_primary_pre_processed(&mut arena, b"data".to_vec(), OperationResult::Success);
        state.release_resources(&mut arena);
        state.release_resources(&mut arena);
        let result =
            state.define_pre_processing_consensus_result(&mut arena, Timestamp::from_millis(10));
        assert_eq!(result, PreProcessingResult::None);
    }

    #[test]
    fn rejected_reply_counts_toward_received_replies() {
        let mut arena = ResultArena::new();
        let mut state = new_state(4, 2, 5_000);
        state
            .handle_pre_process_reply_msg(&reply(
                1,
                RetryId::ZERO,
                ReplyStatus::Rejected,
                ResultHash::ZERO,
            ))
            .unwrap();
        assert_eq!(state.num_of_received_replies, 1);
        assert_eq!(state.rejected_replica_ids.len(), 1);
        // 2 peers remain possible (2, 3); max_hash_count is 0; remaining(2) + 0 >= threshold(2): still alive.
        let result =
            state.define_pre_processing_consensus_result(&mut arena, Timestamp::from_millis(10));
        assert_eq!(result, PreProcessingResult::Continue);
    }

    #[test]
    fn stale_retry_reply_is_dropped() {
        let mut arena = ResultArena::new();
        let mut state = new_state(4, 2, 5_000);
        state.next_retry_id();
        state
            .handle_pre_process_reply_msg(&reply(
                1,
                RetryId::ZERO,
                ReplyStatus::Ok,
                digest_result(b"x"),
            ))
            .unwrap();
        assert_eq!(state.num_of_received_replies, 0);
    }
}
