//! Replica-level configuration: cluster sizing, timers, and the
//! transport/storage settings `quorate-core` has no notion of.
//!
//! Loaded the way the teacher's `kimberlite-config` layers sources
//! (built-in defaults, then a project TOML file, then `QUORATE_*`
//! environment variables, later sources winning) via the `config` crate,
//! rather than hand-rolling a TOML reader.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use quorate_core::PreProcessorConfig;

use crate::error::ReplicaError;

/// Full replica configuration (`spec.md` §6 "Configuration" plus the
/// transport/storage ambient settings `spec.md` explicitly treats as
/// external).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicaConfig {
    pub replica_id: u16,
    pub primary: u16,
    pub consensus: ConsensusConfig,
    pub network: NetworkConfig,
    pub storage: StorageConfig,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            replica_id: 0,
            primary: 0,
            consensus: ConsensusConfig::default(),
            network: NetworkConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

/// Cluster sizing and timer settings (`spec.md` §6 "Static
/// configuration").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    pub f_val: u16,
    pub c_val: u16,
    pub num_ro_replicas: u16,
    pub num_of_client_proxies: u16,
    pub num_of_external_clients: u16,
    pub num_of_client_services: u16,
    pub client_batching_max_msgs_nbr: u16,
    pub timers_resolution_ms: u64,
    pub pre_processing_consensus_timeout_ms: u64,
    pub pre_processing_retry_interval_ms: u64,
    pub per_client_request_cap: u16,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            f_val: 1,
            c_val: 0,
            num_ro_replicas: 0,
            num_of_client_proxies: 1,
            num_of_external_clients: 1,
            num_of_client_services: 1,
            client_batching_max_msgs_nbr: 1,
            timers_resolution_ms: 10,
            pre_processing_consensus_timeout_ms: 5_000,
            pre_processing_retry_interval_ms: 1_500,
            per_client_request_cap: 64,
        }
    }
}

impl ConsensusConfig {
    pub fn to_preprocessor_config(&self) -> PreProcessorConfig {
        PreProcessorConfig {
            f_val: self.f_val,
            c_val: self.c_val,
            num_replicas: 3 * self.f_val + 2 * self.c_val + 1,
            num_ro_replicas: self.num_ro_replicas,
            num_of_client_proxies: self.num_of_client_proxies,
            num_of_external_clients: self.num_of_external_clients,
            num_of_client_services: self.num_of_client_services,
            client_batching_max_msgs_nbr: self.client_batching_max_msgs_nbr,
            timers_resolution_ms: self.timers_resolution_ms,
            pre_processing_consensus_timeout_ms: self.pre_processing_consensus_timeout_ms,
            pre_processing_retry_interval_ms: self.pre_processing_retry_interval_ms,
            per_client_request_cap: self.per_client_request_cap,
        }
    }
}

/// Transport settings for the `mio` receive loop (`spec.md` §2
/// "Out of scope: the network transport" — the shim owns the socket, not
/// the protocol on top of it).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub bind_address: String,
    pub incoming_queue_capacity: usize,
    pub validation_worker_threads: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:5733".to_string(),
            incoming_queue_capacity: 4096,
            validation_worker_threads: 4,
        }
    }
}

/// On-disk locations for persisted metadata (`spec.md` §6 "Persisted
/// state").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub key_view_prefix: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".quorate/data"),
            key_view_prefix: "kv_view_".to_string(),
        }
    }
}

/// Loads a [`ReplicaConfig`], layering: built-in defaults, then
/// `quorate.toml` in `project_dir` if present, then `QUORATE_*`
/// environment variables (highest precedence).
pub fn load(project_dir: &Path) -> Result<ReplicaConfig, ReplicaError> {
    let defaults = ReplicaConfig::default();
    let mut builder = config::Config::builder()
        .add_source(config::Config::try_from(&defaults).map_err(ReplicaError::Config)?);

    let project_file = project_dir.join("quorate.toml");
    if project_file.exists() {
        builder = builder.add_source(
            config::File::from(project_file)
                .required(false)
                .format(config::FileFormat::Toml),
        );
    }

    builder = builder.add_source(
        config::Environment::with_prefix("QUORATE")
            .separator("__")
            .try_parsing(true),
    );

    let built = builder.build().map_err(ReplicaError::Config)?;
    built.try_deserialize().map_err(ReplicaError::Config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_produce_a_sane_cluster_size() {
        let config = ReplicaConfig::default();
        let pp = config.consensus.to_preprocessor_config();
        assert_eq!(pp.num_replicas, 4);
        assert_eq!(pp.num_of_required_equal_replies(), 2);
    }

    #[test]
    fn load_without_project_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load(dir.path()).unwrap();
        assert_eq!(config.network.bind_address, "127.0.0.1:5733");
    }

    #[test]
    fn load_merges_project_toml_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("quorate.toml"),
            r#"
replica_id = 2

[consensus]
f_val = 2
c_val = 1

[network]
bind_address = "0.0.0.0:9000"
"#,
        )
        .unwrap();

        let config = load(dir.path()).unwrap();
        assert_eq!(config.replica_id, 2);
        assert_eq!(config.consensus.f_val, 2);
        assert_eq!(config.consensus.c_val, 1);
        assert_eq!(config.network.bind_address, "0.0.0.0:9000");
        // untouched default still applies
        assert_eq!(config.network.incoming_queue_capacity, 4096);
    }
}
