//! Shared value types for the pre-execution consensus coordinator.
//!
//! This crate contains the small, logic-free types that cross module and
//! crate boundaries in `quorate-core` and `quorate-replica`:
//! - Identity types ([`ReplicaId`], [`ClientId`])
//! - Request addressing ([`SeqNum`], [`RetryId`], [`OffsetInBatch`])
//! - Result types ([`ResultHash`], [`OperationResult`])
//! - Temporal types ([`Timestamp`])

use std::fmt::{Debug, Display};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

// ============================================================================
// Identity
// ============================================================================

/// Identifies one replica among the `N = 3f + 2c + 1` members of the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReplicaId(u16);

impl ReplicaId {
    pub fn new(id: u16) -> Self {
        Self(id)
    }

    pub fn as_u16(self) -> u16 {
        self.0
    }
}

impl Display for ReplicaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "replica#{}", self.0)
    }
}

impl From<u16> for ReplicaId {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

/// Identifies a client connected to the cluster.
///
/// `(ClientId, OffsetInBatch)` is the key under which
/// `RequestProcessingState` entries live in the `RequestTable`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClientId(u16);

impl ClientId {
    pub fn new(id: u16) -> Self {
        Self(id)
    }

    pub fn as_u16(self) -> u16 {
        self.0
    }
}

impl Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "client#{}", self.0)
    }
}

impl From<u16> for ClientId {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

/// Position of a request within a client's batch.
///
/// Paired with [`ClientId`] to form the `RequestTable` key (`spec.md` §3,
/// Invariant 1: at most one active `RequestProcessingState` per pair).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OffsetInBatch(u16);

impl OffsetInBatch {
    pub fn new(offset: u16) -> Self {
        Self(offset)
    }

    pub fn as_u16(self) -> u16 {
        self.0
    }
}

impl Display for OffsetInBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A client-assigned request sequence number.
///
/// Monotonically increasing per client; distinguishes successive requests
/// from the same client (not to be confused with [`RetryId`], which
/// distinguishes successive *dispatch rounds* of the same request).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SeqNum(u64);

impl SeqNum {
    pub fn new(seq: u64) -> Self {
        Self(seq)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Display for SeqNum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotone counter distinguishing successive dispatch rounds of one
/// request (`spec.md` §2 / Glossary: "Retry id").
///
/// Replies tagged with a stale `RetryId` are dropped on arrival
/// (`spec.md` §4.1 `handlePreProcessReplyMsg`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct RetryId(u64);

impl RetryId {
    pub const ZERO: RetryId = RetryId(0);

    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the next retry id in sequence.
    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl Display for RetryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "retry#{}", self.0)
    }
}

// ============================================================================
// Result hash
// ============================================================================

/// SHA3-256 digest of a speculatively executed result (`spec.md` §6, §2
/// Glossary: "Hash").
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResultHash([u8; 32]);

impl ResultHash {
    pub const ZERO: ResultHash = ResultHash([0u8; 32]);

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// A zero hash means "the primary has not yet pre-processed this
    /// request" (`spec.md` §4.1, `primaryPreProcessResultHash`).
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl Debug for ResultHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ResultHash({:02x}{:02x}{:02x}{:02x}...)",
            self.0[0], self.0[1], self.0[2], self.0[3]
        )
    }
}

// ============================================================================
// Operation result
// ============================================================================

/// Outcome of a speculative (or agreed) execution (`spec.md` §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationResult {
    Unknown,
    Success,
    ExecDataTooLarge,
    InvalidRequest,
    NotReady,
    Timeout,
    InternalError,
}

impl OperationResult {
    /// Definitive failures that short-circuit pre-processing regardless of
    /// peer agreement (`spec.md` §4.1, `CANCELLED_BY_PRIMARY`).
    pub fn is_definitive_failure(self) -> bool {
        matches!(
            self,
            OperationResult::InvalidRequest | OperationResult::ExecDataTooLarge
        )
    }
}

impl Default for OperationResult {
    fn default() -> Self {
        OperationResult::Unknown
    }
}

// ============================================================================
// Timestamp
// ============================================================================

/// Monotonic-enough wall-clock timestamp in milliseconds, used for
/// `entryTime`/timeout arithmetic (`spec.md` §4.1, §8 "Exactly at timeout
/// boundary").
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Timestamp {
    pub fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    pub fn as_millis(self) -> u64 {
        self.0
    }

    /// Current wall-clock time. Not used in tests (which construct fixed
    /// timestamps instead, so that boundary assertions are deterministic).
    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Self(millis)
    }

    /// Milliseconds elapsed since `earlier`, saturating at zero.
    pub fn since(self, earlier: Timestamp) -> u64 {
        self.0.saturating_sub(earlier.0)
    }

    #[must_use]
    pub fn add_millis(self, millis: u64) -> Self {
        Self(self.0 + millis)
    }
}
