//! # quorate-replica: the pre-processing coordinator's replica shim
//!
//! This crate wires `quorate-core`'s `PreProcessor` state machine to the
//! things `spec.md` explicitly treats as external collaborators: the
//! network transport, persistent metadata storage, and the worker pool
//! that runs asynchronous validation and speculative execution.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌────────────────────┐   ┌────────────────────┐
//! │ ReceiveLoop│ → │ IncomingMsgsStorage│ → │  dispatch thread    │
//! │ (mio poll) │   │  (ArrayQueue)      │   │  (→ PreProcessor)   │
//! └────────────┘   └────────────────────┘   └─────────┬──────────┘
//!                                                       │
//!                                      ValidationWorkerPool (rayon)
//!
//! timer thread (std::thread + sleep) ──► onTimerTick / onRetryDue
//! ```
//!
//! See [`runtime::ReplicaRuntime`] for the struct that owns all of this.

pub mod config;
pub mod error;
pub mod handler;
pub mod incoming_queue;
pub mod metadata_store;
pub mod metrics_export;
pub mod network;
pub mod runtime;
pub mod transport;
pub mod worker_pool;

pub use config::{ConsensusConfig, NetworkConfig, ReplicaConfig, StorageConfig};
pub use error::ReplicaError;
pub use handler::RequestHandler;
pub use incoming_queue::{IncomingMsgsStorage, PushResult};
pub use metadata_store::{erase_key_view_files, run_startup_sequence, PersistentMetadataStore};
pub use metrics_export::export_prometheus;
pub use network::ReceiveLoop;
pub use runtime::ReplicaRuntime;
pub use transport::{PeerTransport, UdpPeerTransport};
pub use worker_pool::ValidationWorkerPool;
