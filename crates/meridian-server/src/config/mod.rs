//! Node configuration.
//!
//! One TOML file per node. Every field has a default so an empty file
//! is a working single-node configuration; `validate` runs before the
//! runtime touches any of it.

use std::path::Path;
use std::time::Duration;

use meridian_common::types::{ClientId, NodeId};
use meridian_common::{
    MeridianError, MeridianResult, DEFAULT_LEASE_DURATION_MS, DEFAULT_LOCK_TIMEOUT_MS,
    DEFAULT_SWEEP_PAUSE_MILLIS, DEFAULT_SWEEP_PERSISTENT_LOCK_WAIT_MILLIS,
    DEFAULT_TRANSACTION_RETRIES, LOCK_REFRESH_INTERVAL_MS, MAX_CLUSTER_SIZE,
};
use serde::{Deserialize, Serialize};

/// Client names a node may not take for itself.
const RESERVED_CLIENT_NAMES: &[&str] = &["anonymous"];

/// This node's identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSection {
    /// Node id, stable for the node's lifetime. Zero is invalid.
    #[serde(default = "default_node_id")]
    pub id: u32,

    /// Name this node's transactions lock under.
    #[serde(default = "default_client_name")]
    pub client_name: String,
}

fn default_node_id() -> u32 {
    1
}

fn default_client_name() -> String {
    "meridian".to_string()
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            id: default_node_id(),
            client_name: default_client_name(),
        }
    }
}

/// The consensus cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSection {
    /// Node ids of every cluster member, this node included.
    #[serde(default = "default_members")]
    pub members: Vec<u32>,
}

fn default_members() -> Vec<u32> {
    vec![default_node_id()]
}

impl Default for ClusterSection {
    fn default() -> Self {
        Self {
            members: default_members(),
        }
    }
}

impl ClusterSection {
    /// Acceptors required for a majority.
    #[must_use]
    pub fn quorum_size(&self) -> usize {
        self.members.len() / 2 + 1
    }
}

/// Transaction layer tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionSection {
    /// Attempts `run` gives a transaction task before giving up.
    #[serde(default = "default_retries")]
    pub retries: u32,
}

fn default_retries() -> u32 {
    DEFAULT_TRANSACTION_RETRIES
}

impl Default for TransactionSection {
    fn default() -> Self {
        Self {
            retries: default_retries(),
        }
    }
}

/// Lock service tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockSection {
    /// How long an acquire may block before timing out.
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_millis: u64,

    /// Lease granted to a successful acquire.
    #[serde(default = "default_lease")]
    pub lease_millis: u64,

    /// How often held leases are refreshed in the background.
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_millis: u64,
}

fn default_acquire_timeout() -> u64 {
    DEFAULT_LOCK_TIMEOUT_MS
}

fn default_lease() -> u64 {
    DEFAULT_LEASE_DURATION_MS
}

fn default_refresh_interval() -> u64 {
    LOCK_REFRESH_INTERVAL_MS
}

impl Default for LockSection {
    fn default() -> Self {
        Self {
            acquire_timeout_millis: default_acquire_timeout(),
            lease_millis: default_lease(),
            refresh_interval_millis: default_refresh_interval(),
        }
    }
}

/// Background sweep tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepSection {
    /// Whether the background sweeper runs at all.
    #[serde(default = "default_sweep_enabled")]
    pub enabled: bool,

    /// Pause between background iterations.
    #[serde(default = "default_sweep_pause")]
    pub pause_millis: u64,

    /// Pause after finding the persistent lock taken by a backup.
    #[serde(default = "default_lock_wait")]
    pub persistent_lock_wait_millis: u64,

    /// Override for the examined-pairs budget per batch.
    #[serde(default)]
    pub max_cell_ts_pairs_to_examine: Option<usize>,

    /// Override for the candidate batch size.
    #[serde(default)]
    pub candidate_batch_size: Option<usize>,

    /// Override for the delete batch size.
    #[serde(default)]
    pub delete_batch_size: Option<usize>,
}

fn default_sweep_enabled() -> bool {
    true
}

fn default_sweep_pause() -> u64 {
    DEFAULT_SWEEP_PAUSE_MILLIS
}

fn default_lock_wait() -> u64 {
    DEFAULT_SWEEP_PERSISTENT_LOCK_WAIT_MILLIS
}

impl Default for SweepSection {
    fn default() -> Self {
        Self {
            enabled: default_sweep_enabled(),
            pause_millis: default_sweep_pause(),
            persistent_lock_wait_millis: default_lock_wait(),
            max_cell_ts_pairs_to_examine: None,
            candidate_batch_size: None,
            delete_batch_size: None,
        }
    }
}

/// Full node configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MeridianConfig {
    /// This node's identity.
    #[serde(default)]
    pub node: NodeSection,

    /// The consensus cluster.
    #[serde(default)]
    pub cluster: ClusterSection,

    /// Transaction layer tuning.
    #[serde(default)]
    pub transaction: TransactionSection,

    /// Lock service tuning.
    #[serde(default)]
    pub lock: LockSection,

    /// Background sweep tuning.
    #[serde(default)]
    pub sweep: SweepSection,
}

impl MeridianConfig {
    /// Loads and validates a configuration file.
    ///
    /// # Errors
    ///
    /// `Io` when the file cannot be read, `InvalidConfig` when it does
    /// not parse or fails validation.
    pub fn from_file(path: &Path) -> MeridianResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content).map_err(|err| {
            MeridianError::invalid_config(format!("{}: {err}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Saves the configuration, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// `Io` when writing fails, `InvalidConfig` when encoding does.
    pub fn save(&self, path: &Path) -> MeridianResult<()> {
        let content = self.to_toml()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Renders the configuration as TOML.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` when encoding fails.
    pub fn to_toml(&self) -> MeridianResult<String> {
        toml::to_string_pretty(self)
            .map_err(|err| MeridianError::invalid_config(format!("encoding failed: {err}")))
    }

    /// Checks every field the runtime will rely on.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` or `InvalidClientName` naming the first problem
    /// found.
    pub fn validate(&self) -> MeridianResult<()> {
        if self.node.id == 0 {
            return Err(MeridianError::invalid_config("node id 0 is reserved"));
        }
        validate_client_name(&self.node.client_name)?;

        if self.cluster.members.is_empty() {
            return Err(MeridianError::invalid_config(
                "cluster needs at least one member",
            ));
        }
        if self.cluster.members.len() > MAX_CLUSTER_SIZE {
            return Err(MeridianError::invalid_config(format!(
                "cluster has {} members, the maximum is {MAX_CLUSTER_SIZE}",
                self.cluster.members.len()
            )));
        }
        let mut seen = self.cluster.members.clone();
        seen.sort_unstable();
        seen.dedup();
        if seen.len() != self.cluster.members.len() {
            return Err(MeridianError::invalid_config(
                "cluster members must be unique",
            ));
        }
        if self.cluster.members.contains(&0) {
            return Err(MeridianError::invalid_config(
                "cluster member id 0 is reserved",
            ));
        }
        if !self.cluster.members.contains(&self.node.id) {
            return Err(MeridianError::invalid_config(format!(
                "node {} is not a cluster member",
                self.node.id
            )));
        }

        if self.transaction.retries == 0 {
            return Err(MeridianError::invalid_config(
                "transaction retries must be at least 1",
            ));
        }

        if self.lock.acquire_timeout_millis == 0 || self.lock.lease_millis == 0 {
            return Err(MeridianError::invalid_config(
                "lock timeout and lease must be at least 1ms",
            ));
        }
        if self.lock.refresh_interval_millis >= self.lock.lease_millis {
            return Err(MeridianError::invalid_config(
                "lock refresh interval must be shorter than the lease",
            ));
        }

        if self.sweep.pause_millis == 0 || self.sweep.persistent_lock_wait_millis == 0 {
            return Err(MeridianError::invalid_config(
                "sweep pauses must be at least 1ms",
            ));
        }
        for limit in [
            self.sweep.max_cell_ts_pairs_to_examine,
            self.sweep.candidate_batch_size,
            self.sweep.delete_batch_size,
        ] {
            if limit == Some(0) {
                return Err(MeridianError::invalid_config(
                    "sweep batch overrides must be at least 1",
                ));
            }
        }
        Ok(())
    }

    /// This node's id.
    #[must_use]
    pub fn node_id(&self) -> NodeId {
        NodeId::new(self.node.id)
    }

    /// This node's client identity.
    #[must_use]
    pub fn client_id(&self) -> ClientId {
        ClientId::new(self.node.client_name.clone())
    }

    /// The cluster member ids.
    #[must_use]
    pub fn member_node_ids(&self) -> Vec<NodeId> {
        self.cluster.members.iter().copied().map(NodeId::new).collect()
    }

    /// The configured lock acquire timeout.
    #[must_use]
    pub fn lock_acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.lock.acquire_timeout_millis)
    }

    /// The configured lock lease.
    #[must_use]
    pub fn lock_lease(&self) -> Duration {
        Duration::from_millis(self.lock.lease_millis)
    }

    /// The configured lease refresh interval.
    #[must_use]
    pub fn lock_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.lock.refresh_interval_millis)
    }
}

/// Checks the rules a client name must satisfy.
///
/// # Errors
///
/// `InvalidClientName` with the rule that failed.
pub fn validate_client_name(name: &str) -> MeridianResult<()> {
    if name.is_empty() {
        return Err(MeridianError::InvalidClientName {
            name: name.to_string(),
            reason: "name is empty".to_string(),
        });
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(MeridianError::InvalidClientName {
            name: name.to_string(),
            reason: "only ASCII letters, digits, '_' and '-' are allowed".to_string(),
        });
    }
    if name.starts_with('_') || RESERVED_CLIENT_NAMES.contains(&name) {
        return Err(MeridianError::InvalidClientName {
            name: name.to_string(),
            reason: "name is reserved".to_string(),
        });
    }
    Ok(())
}
