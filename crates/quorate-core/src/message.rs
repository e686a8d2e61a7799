//! Message envelope layer (`spec.md` §4.3, §6).
//!
//! Every message that crosses a process boundary is a [`Message`]: a
//! small tagged union with a shared header (sender, optional span
//! context) carrying one of the three payload kinds the pre-processing
//! protocol uses. This replaces the original's inheritance-based
//! `MessageBase` + subclasses with the tagged-variant redesign
//! `spec.md` §9 calls for.
//!
//! Ownership of the underlying bytes is enforced by the type system: a
//! [`RawFrame`] owns a receive buffer exclusively, and
//! [`RawFrame::into_message`] *consumes* it to produce a typed [`Message`]
//! that owns its own decoded fields. There is no runtime "owner" bit to
//! get wrong, because Rust's move semantics make the transfer explicit
//! and checked at compile time (`spec.md` §9, "Cyclic ownership" /
//! "Dynamic downcasting" redesign notes apply the same idea to this
//! layer).

use quorate_crypto::Signature;
use quorate_types::{ClientId, OffsetInBatch, OperationResult, ResultHash, RetryId, SeqNum};
use serde::{Deserialize, Serialize};

use crate::error::PreProcessorError;

/// Maximum span-context trailer size (`spec.md` §4.3, §8).
pub const SPAN_CONTEXT_MAX_SIZE: usize = 1024;

/// Maximum batch size accepted at validation (`spec.md` §4.3, §8).
pub const MAX_BATCH_SIZE: usize = 1024;

/// Magic number for the local-buffer envelope used to round-trip messages
/// through in-process queues (`spec.md` §6).
pub const LOCAL_BUFFER_MAGIC: u32 = 0x5555_897B;

// ============================================================================
// Payloads
// ============================================================================

/// A client's request to pre-process, before dispatch (`spec.md` §3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientPreProcessRequestMsg {
    pub client_id: ClientId,
    pub req_seq_num: SeqNum,
    pub cid: String,
    pub payload: Vec<u8>,
    pub request_timeout_milli: u64,
    pub signature: Option<Signature>,
    pub flags: u32,
}

impl ClientPreProcessRequestMsg {
    pub fn request_timeout_milli(&self) -> u64 {
        self.request_timeout_milli
    }
}

/// One outbound dispatch of a client request to peers (`spec.md` §3, §6).
///
/// Shared across the fan-out sends to all peers; the last sender's clone
/// is dropped once all sends complete (`spec.md` §5 "Shared-resource
/// policy" — modeled here simply as `Clone`, since Rust's `Arc` or an
/// owned clone both express "shared until everyone is done" without a
/// manual refcount).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreProcessRequestMsg {
    pub batch_cid: String,
    pub client_id: ClientId,
    pub offset_in_batch: OffsetInBatch,
    pub cid: String,
    pub retry_id: RetryId,
    pub primary_seq_num: u64,
    pub payload_digest: ResultHash,
    pub payload: Vec<u8>,
}

/// A peer's response to a `PreProcessRequestMsg` (`spec.md` §3, §6).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreProcessReplyMsg {
    pub sender: quorate_types::ReplicaId,
    pub batch_cid: String,
    pub client_id: ClientId,
    pub offset_in_batch: OffsetInBatch,
    pub retry_id: RetryId,
    pub status: ReplyStatus,
    pub result_hash: ResultHash,
    pub signature: Signature,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplyStatus {
    Ok,
    Rejected,
}

/// The message submitted to the ordering engine once a request reaches
/// `COMPLETE` (or a terminal failure, with `empty = true`) — `spec.md`
/// §4.1 `buildClientRequestMsg`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRequestMsg {
    pub client_id: ClientId,
    pub offset_in_batch: OffsetInBatch,
    pub cid: String,
    pub req_seq_num: SeqNum,
    pub agreed_result: OperationResult,
    /// `None` when this is an empty request (built on `CANCEL`).
    pub payload: Option<Vec<u8>>,
}

// ============================================================================
// Envelope
// ============================================================================

/// The header shared by every message on the wire (`spec.md` §4.3, §6):
/// a message-type tag (here, the enum discriminant of [`Message`] itself)
/// and an optional span-context trailer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub sender: quorate_types::ReplicaId,
    pub span_context: Option<Vec<u8>>,
    pub payload: MessagePayload,
    /// Diagnostics only (`spec.md` §4.3 "Ingress carries an `isIncoming`
    /// flag"); never consulted by protocol logic.
    pub is_incoming: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessagePayload {
    ClientPreProcessRequest(ClientPreProcessRequestMsg),
    PreProcessRequest(PreProcessRequestMsg),
    PreProcessReply(PreProcessReplyMsg),
}

impl Message {
    pub fn new(sender: quorate_types::ReplicaId, payload: MessagePayload) -> Self {
        Self {
            sender,
            span_context: None,
            payload,
            is_incoming: false,
        }
    }

    pub fn with_span_context(mut self, span_context: Vec<u8>) -> Self {
        self.span_context = Some(span_context);
        self
    }

    /// Returns true if this message type should be validated on the
    /// worker pool rather than the receive thread (`spec.md` §4.3
    /// `shouldValidateAsync`). `PreProcessRequest` triggers speculative
    /// execution downstream, so it is the expensive one to validate.
    pub fn should_validate_async(&self) -> bool {
        matches!(self.payload, MessagePayload::PreProcessRequest(_))
    }

    /// Validates message-type-specific invariants (`spec.md` §4.3
    /// `validate`): length bounds, span-context size, batch size.
    ///
    /// `replica_count` stands in for the `ReplicasInfo` the original
    /// consults to check "sender in-set"; the caller must also verify the
    /// sender against its own replica roster before trusting a message
    /// (done at the `PreProcessor` boundary, not here, since this layer
    /// has no notion of cluster membership).
    pub fn validate(&self, replica_count: u16) -> Result<(), PreProcessorError> {
        if let Some(span) = &self.span_context {
            if span.len() > SPAN_CONTEXT_MAX_SIZE {
                return Err(PreProcessorError::MalformedMessage(format!(
                    "span context too large: {} > {SPAN_CONTEXT_MAX_SIZE}",
                    span.len()
                )));
            }
        }
        if self.sender.as_u16() >= replica_count {
            return Err(PreProcessorError::MalformedMessage(format!(
                "sender {} out of range for {replica_count} replicas",
                self.sender
            )));
        }
        match &self.payload {
            MessagePayload::ClientPreProcessRequest(req) => {
                if req.payload.is_empty() {
                    return Err(PreProcessorError::MalformedMessage(
                        "client request payload is empty".to_string(),
                    ));
                }
            }
            MessagePayload::PreProcessRequest(req) => {
                if req.payload.len() > MAX_BATCH_SIZE * 1024 {
                    return Err(PreProcessorError::MalformedMessage(format!(
                        "pre-process request payload too large: {}",
                        req.payload.len()
                    )));
                }
            }
            MessagePayload::PreProcessReply(reply) => {
                if reply.sender.as_u16() >= replica_count {
                    return Err(PreProcessorError::MalformedMessage(format!(
                        "reply sender {} out of range",
                        reply.sender
                    )));
                }
            }
        }
        Ok(())
    }

    /// Serializes this message canonically via `postcard`, matching the
    /// wire form `spec.md` §6 describes (length-prefixed fields, fixed
    /// integer widths) without hand-rolling per-field byte packing.
    pub fn to_wire_bytes(&self) -> Vec<u8> {
        postcard::to_allocvec(self).expect("Message serialization is infallible")
    }

    pub fn from_wire_bytes(bytes: &[u8]) -> Result<Self, PreProcessorError> {
        postcard::from_bytes(bytes)
            .map_err(|e| PreProcessorError::MalformedMessage(format!("postcard decode: {e}")))
    }
}

// ============================================================================
// Local-buffer envelope
// ============================================================================

/// A raw, received frame: a local in-process queue round-trips through
/// this type, then [`RawFrame::into_message`] consumes it to produce an
/// owned, typed [`Message`].
///
/// Carries the local-buffer prefix from `spec.md` §6
/// (`magic | msgSize | sender`) so that a queue entry can be validated
/// cheaply (magic check) before the full postcard decode runs.
#[derive(Debug)]
pub struct RawFrame {
    bytes: Vec<u8>,
}

impl RawFrame {
    /// Encodes `message` into a local-buffer frame.
    pub fn encode(message: &Message) -> Self {
        let payload = message.to_wire_bytes();
        let mut bytes = Vec::with_capacity(10 + payload.len());
        bytes.extend_from_slice(&LOCAL_BUFFER_MAGIC.to_be_bytes());
        bytes.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        bytes.extend_from_slice(&message.sender.as_u16().to_be_bytes());
        bytes.extend_from_slice(&payload);
        Self { bytes }
    }

    /// Parses the local-buffer prefix and checks the magic number without
    /// decoding the payload.
    pub fn sniff(bytes: Vec<u8>) -> Result<Self, PreProcessorError> {
        if bytes.len() < 10 {
            return Err(PreProcessorError::MalformedMessage(
                "frame shorter than local-buffer header".to_string(),
            ));
        }
        let magic = u32::from_be_bytes(bytes[0..4].try_into().unwrap());
        if magic != LOCAL_BUFFER_MAGIC {
            return Err(PreProcessorError::MalformedMessage(format!(
                "bad local-buffer magic: {magic:#x}"
            )));
        }
        Ok(Self { bytes })
    }

    /// The encoded frame bytes, ready to hand to a transport (`magic |
    /// msgSize | sender | payload`).
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Consumes the raw frame, decoding its payload into an owned,
    /// typed [`Message`]. This is the ownership-transfer boundary the
    /// spec's envelope layer exists to make explicit: after this call,
    /// nothing else can reach into `self.bytes`.
    pub fn into_message(self) -> Result<Message, PreProcessorError> {
        let msg_size = u32::from_be_bytes(self.bytes[4..8].try_into().unwrap()) as usize;
        let payload_start = 10;
        let payload_end = payload_start + msg_size;
        if self.bytes.len() < payload_end {
            return Err(PreProcessorError::MalformedMessage(
                "frame shorter than declared msgSize".to_string(),
            ));
        }
        Message::from_wire_bytes(&self.bytes[payload_start..payload_end])
    }
}
