//! The request handler capability (`spec.md` §4.2 "schedules its own
//! speculative execution via the user request handler").
//!
//! `spec.md` explicitly keeps the actual service logic external — this
//! trait is the seam a host application implements to plug its state
//! machine in underneath pre-processing.

use quorate_types::OperationResult;

/// Speculatively executes a request payload and reports the outcome
/// (`spec.md` §4.1 Glossary: "Pre-processing").
///
/// Implementations must be side-effect-free with respect to any
/// durable/ordered state — this runs *before* agreement, purely to
/// compute a result digest peers can compare.
pub trait RequestHandler: Send + Sync {
    fn execute(&self, payload: &[u8]) -> (Vec<u8>, OperationResult);
}
