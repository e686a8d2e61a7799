//! Pre-execution consensus coordinator: the per-request quorum state
//! machine, the primary/non-primary dispatch and retry control flow, and
//! the message-envelope ownership discipline it depends on.
//!
//! This crate has no knowledge of the BFT ordering/agreement engine,
//! network transport, or persistent storage — those are modeled as the
//! narrow capability traits in [`preprocessor`] and consumed by
//! `quorate-replica`.

pub mod arena;
pub mod config;
pub mod error;
pub mod instrumentation;
pub mod message;
pub mod preprocessor;
pub mod request_state;
pub mod request_table;

pub use config::PreProcessorConfig;
pub use error::PreProcessorError;
pub use instrumentation::{Metrics, MetricsSnapshot, METRICS};
pub use message::{
    ClientPreProcessRequestMsg, ClientRequestMsg, Message, MessagePayload, PreProcessReplyMsg,
    PreProcessRequestMsg, RawFrame, ReplyStatus,
};
pub use preprocessor::{DispatchWork, MetricsAggregator, OrderingEngineSubmit, PreProcessor, SubmitError};
pub use request_state::{PreProcessingResult, RequestProcessingState};
pub use request_table::{RequestKey, RequestTable, TableEntry};
