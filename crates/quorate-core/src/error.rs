//! Error kinds for the pre-processing coordinator (`spec.md` §7).
//!
//! All of these are absorbed locally (logged + counted); only the terminal
//! request outcomes (`PreProcessingResult`) cross the `PreProcessor`
//! boundary. Kind 7 ("internal invariant violation") is deliberately not a
//! variant here — it is modeled as a panic via [`invariant`], since the
//! spec is explicit that local corruption cannot be recovered from.

/// Non-fatal errors absorbed at the `PreProcessor` boundary.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PreProcessorError {
    /// Kind 1: length or field constraint violated.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// Kind 2: signature verification failed.
    #[error("signature verification failed")]
    SignatureInvalid,

    /// A client request arrived for a `(client, offset)` that already has
    /// an active entry (`spec.md` §9 Ambiguity 3, resolved in `DESIGN.md`).
    #[error("duplicate in-flight request for client {client}, offset {offset}")]
    DuplicateInFlight { client: u16, offset: u16 },

    /// Kind 6: resource exhaustion at ingress (per-client soft cap
    /// exceeded, `spec.md` §4.2 "Admission").
    #[error("client {0} exceeded its in-flight request cap")]
    Overloaded(u16),

    /// The referenced `(client, offset)` has no active entry.
    #[error("no active request for client {client}, offset {offset}")]
    NoSuchEntry { client: u16, offset: u16 },
}

/// Aborts the process for an unrecoverable local invariant violation
/// (`spec.md` §7, Error kind 7).
///
/// Mirrors how the teacher escalates severity through structured
/// `tracing` fields rather than a dedicated FATAL level
/// (`kimberlite-vsr::replica::state`'s replay-detection `tracing::warn!`
/// pattern), but panics afterward since this class of error cannot be
/// absorbed.
#[macro_export]
macro_rules! invariant {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            tracing::error!(fatal = true, $($arg)+);
            panic!($($arg)+);
        }
    };
}
