//! # meridian-test
//!
//! Cross-crate integration tests and their shared fixtures. The tests
//! themselves live under `tests/`; this crate exports the cluster
//! helper they are built on.

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::Arc;

use meridian_common::types::{Cell, TableRef};
use meridian_common::MeridianResult;
use meridian_kvs::{InMemoryKeyValueService, KeyValueService, TableSchema};
use meridian_server::{MeridianConfig, MeridianRuntime};
use meridian_txn::TransactionManager;

/// A single-node cluster over an in-memory store.
///
/// The background sweeper is disabled so tests control exactly when
/// versions disappear; enable it through [`TestCluster::with_config`]
/// when a test is about the background loop itself.
pub struct TestCluster {
    kvs: Arc<InMemoryKeyValueService>,
    runtime: MeridianRuntime,
}

impl TestCluster {
    /// Brings up a single-node cluster with the background sweeper
    /// off.
    ///
    /// # Errors
    ///
    /// Fails when the runtime cannot be built.
    pub fn single() -> MeridianResult<Self> {
        let mut config = MeridianConfig::default();
        config.sweep.enabled = false;
        Self::with_config(config)
    }

    /// Brings up a cluster with the given configuration.
    ///
    /// # Errors
    ///
    /// Fails when the configuration is invalid or the runtime cannot
    /// be built.
    pub fn with_config(config: MeridianConfig) -> MeridianResult<Self> {
        let kvs = Arc::new(InMemoryKeyValueService::new());
        let runtime = MeridianRuntime::create(config, Arc::clone(&kvs) as _)?;
        Ok(Self { kvs, runtime })
    }

    /// The cluster's store.
    #[must_use]
    pub fn kvs(&self) -> Arc<InMemoryKeyValueService> {
        Arc::clone(&self.kvs)
    }

    /// The running node.
    #[must_use]
    pub fn runtime(&self) -> &MeridianRuntime {
        &self.runtime
    }

    /// The node's transaction manager.
    #[must_use]
    pub fn transactions(&self) -> Arc<TransactionManager> {
        self.runtime.transactions()
    }

    /// Creates a user table with the default schema.
    ///
    /// # Errors
    ///
    /// Fails on an invalid name or storage error.
    pub fn create_table(&self, namespace: &str, name: &str) -> MeridianResult<TableRef> {
        let table = TableRef::create(namespace, name)?;
        self.kvs.create_table(&table, &TableSchema::default())?;
        Ok(table)
    }

    /// Creates a user table with an explicit schema.
    ///
    /// # Errors
    ///
    /// Fails on an invalid name or storage error.
    pub fn create_table_with_schema(
        &self,
        namespace: &str,
        name: &str,
        schema: TableSchema,
    ) -> MeridianResult<TableRef> {
        let table = TableRef::create(namespace, name)?;
        self.kvs.create_table(&table, &schema)?;
        Ok(table)
    }
}

/// Shorthand for a cell from two string literals.
#[must_use]
pub fn cell(row: &str, column: &str) -> Cell {
    Cell::new(row.to_owned().into_bytes(), column.to_owned().into_bytes())
}

/// Routes `tracing` output to the test harness, honoring `RUST_LOG`.
/// Safe to call from every test; only the first call installs.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
