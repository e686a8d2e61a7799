//! Pre-processing configuration (`spec.md` §6 "Configuration").

/// Static, process-wide configuration for the pre-processing coordinator.
///
/// Threaded through constructors explicitly rather than held in a global
/// singleton (`spec.md` §9 "Global singletons" redesign note).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreProcessorConfig {
    /// Maximum number of tolerated Byzantine replicas.
    pub f_val: u16,
    /// Maximum number of tolerated crash-faulty replicas.
    pub c_val: u16,
    /// Total replica count, `N = 3f + 2c + 1`.
    pub num_replicas: u16,
    /// Read-only replicas (do not participate in pre-processing quorum).
    pub num_ro_replicas: u16,
    /// Number of client proxies.
    pub num_of_client_proxies: u16,
    /// Number of external clients.
    pub num_of_external_clients: u16,
    /// Number of client services.
    pub num_of_client_services: u16,
    /// Max messages per client batch.
    pub client_batching_max_msgs_nbr: u16,
    /// Timer tick resolution, in milliseconds.
    pub timers_resolution_ms: u64,
    /// Pre-processing consensus timeout, in milliseconds.
    pub pre_processing_consensus_timeout_ms: u64,
    /// Pre-processing retry interval, in milliseconds.
    pub pre_processing_retry_interval_ms: u64,
    /// Soft per-client cap on in-flight requests (`spec.md` §4.2 "Admission").
    pub per_client_request_cap: u16,
}

impl PreProcessorConfig {
    /// The number of matching replies required to declare `COMPLETE`,
    /// typically `f + c + 1` (`spec.md` §4.1 "Static configuration").
    pub fn num_of_required_equal_replies(&self) -> u16 {
        self.f_val + self.c_val + 1
    }

    /// The number of peers a primary fans a pre-process request out to
    /// (everyone but itself).
    pub fn num_of_peers(&self) -> u16 {
        self.num_replicas.saturating_sub(1)
    }

    /// Builds a configuration from `(f, c)` with single-digit cluster
    /// sizing, useful for tests and small deployments.
    pub fn for_tests(f_val: u16, c_val: u16) -> Self {
        let num_replicas = 3 * f_val + 2 * c_val + 1;
        Self {
            f_val,
            c_val,
            num_replicas,
            num_ro_replicas: 0,
            num_of_client_proxies: 1,
            num_of_external_clients: 1,
            num_of_client_services: 1,
            client_batching_max_msgs_nbr: 1,
            timers_resolution_ms: 10,
            pre_processing_consensus_timeout_ms: 5_000,
            pre_processing_retry_interval_ms: 1_500,
            per_client_request_cap: 16,
        }
    }
}
