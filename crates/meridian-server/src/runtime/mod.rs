//! Service wiring for one node.
//!
//! `MeridianRuntime` assembles the whole stack over a caller-supplied
//! key-value store: the two Paxos fleets (timestamp bound and leader
//! election), the timestamp oracle, the lock service with its lease
//! refresher, the transaction manager, and the sweeper. Shutdown runs
//! in reverse of construction so nothing works against a torn-down
//! dependency.
//!
//! The fleets are built over in-memory clients; every acceptor and
//! learner for the configured members lives inside this process. A
//! networked deployment would swap the client construction, nothing
//! else.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use meridian_common::types::{LockToken, NodeId};
use meridian_common::{
    LeadershipState, MeridianResult, Role, LEADERSHIP_CHECK_INTERVAL_MS,
};
use meridian_kvs::KeyValueService;
use meridian_lock::{LockDescriptor, LockRefresher, LockRequest, LockService};
use meridian_paxos::storage::MemoryStateLog;
use meridian_paxos::{
    AcceptorClient, InMemoryAcceptorClient, InMemoryLearnerClient, LeaderElector, LearnerClient,
    PaxosAcceptor, PaxosLearner, PaxosProposer,
};
use meridian_sweep::{
    create_persistent_lock_service, BackgroundSweepSettings, BackgroundSweeper,
    PersistentLockManager, SweepBatchConfig, SweepConfigOverrides, SweepProgressStore,
    SweepTaskRunner, SweeperService,
};
use meridian_timestamp::{PaxosTimestampBoundStore, PersistentTimestampService, TimestampService};
use meridian_txn::{SweepStrategyManager, TransactionManager, WatermarkSource};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::config::MeridianConfig;

/// One in-process Paxos fleet: an acceptor and a learner per member,
/// reachable through in-memory clients.
struct Fleet {
    acceptor_clients: Vec<Arc<dyn AcceptorClient>>,
    learner_clients: Vec<Arc<dyn LearnerClient>>,
}

impl Fleet {
    fn create(members: &[NodeId]) -> MeridianResult<Self> {
        let mut acceptor_clients: Vec<Arc<dyn AcceptorClient>> = Vec::new();
        let mut learner_clients: Vec<Arc<dyn LearnerClient>> = Vec::new();
        for &member in members {
            let acceptor = Arc::new(PaxosAcceptor::new(
                member,
                Arc::new(MemoryStateLog::new()),
            )?);
            acceptor_clients.push(Arc::new(InMemoryAcceptorClient::new(acceptor)));
            let learner = Arc::new(PaxosLearner::new(
                member,
                Arc::new(MemoryStateLog::new()),
            )?);
            learner_clients.push(Arc::new(InMemoryLearnerClient::new(learner)));
        }
        Ok(Self {
            acceptor_clients,
            learner_clients,
        })
    }

    fn proposer(&self, node_id: NodeId) -> Arc<PaxosProposer> {
        Arc::new(PaxosProposer::new(
            node_id,
            self.acceptor_clients.clone(),
            self.learner_clients.clone(),
        ))
    }
}

struct SupervisorShared {
    shutdown: Mutex<bool>,
    wake: Condvar,
}

/// Keeps leadership current in the background: re-elects when the node
/// is not the leader and verifies quorum while it is.
struct LeadershipSupervisor {
    shared: Arc<SupervisorShared>,
    handle: Option<JoinHandle<()>>,
}

impl LeadershipSupervisor {
    fn start(elector: Arc<LeaderElector>, interval: Duration) -> Self {
        let shared = Arc::new(SupervisorShared {
            shutdown: Mutex::new(false),
            wake: Condvar::new(),
        });
        let handle = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("leadership-supervisor".to_string())
                .spawn(move || Self::run(&elector, &shared, interval))
                .expect("failed to spawn leadership supervisor thread")
        };
        Self {
            shared,
            handle: Some(handle),
        }
    }

    fn run(elector: &LeaderElector, shared: &SupervisorShared, interval: Duration) {
        loop {
            {
                let mut shutdown = shared.shutdown.lock();
                if !*shutdown {
                    shared.wake.wait_for(&mut shutdown, interval);
                }
                if *shutdown {
                    return;
                }
            }
            if elector.leadership().is_leader() {
                match elector.verify_leadership() {
                    Ok(true) => {}
                    Ok(false) => warn!("leadership lost to another node"),
                    Err(err) => warn!(error = %err, "leadership verification failed"),
                }
            } else {
                match elector.elect() {
                    Ok(Role::Leader) => info!("won the leader election"),
                    Ok(_) => debug!("lost the leader election"),
                    Err(err) => debug!(error = %err, "leader election attempt failed"),
                }
            }
        }
    }

    fn shutdown(&mut self) {
        *self.shared.shutdown.lock() = true;
        self.shared.wake.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for LeadershipSupervisor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// The fully wired node.
pub struct MeridianRuntime {
    config: MeridianConfig,
    kvs: Arc<dyn KeyValueService>,
    leadership: Arc<LeadershipState>,
    elector: Arc<LeaderElector>,
    timestamps: Arc<dyn TimestampService>,
    locks: Arc<LockService>,
    transactions: Arc<TransactionManager>,
    sweeper: Arc<SweeperService>,
    // Shutdown order: sweeper first, then the refresher, then the
    // supervisor; fields drop bottom-up.
    supervisor: LeadershipSupervisor,
    refresher: LockRefresher,
    background_sweeper: BackgroundSweeper,
}

impl std::fmt::Debug for MeridianRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeridianRuntime")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl MeridianRuntime {
    /// Validates the configuration and brings every service up.
    ///
    /// The initial election runs before the oracle is built; in a
    /// single-node cluster this node is the leader when `create`
    /// returns.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` for a bad configuration, storage errors from
    /// the system tables, and consensus errors from the first
    /// election.
    pub fn create(
        config: MeridianConfig,
        kvs: Arc<dyn KeyValueService>,
    ) -> MeridianResult<Self> {
        config.validate()?;
        let node_id = config.node_id();
        let members = config.member_node_ids();
        info!(
            node = %node_id,
            members = members.len(),
            "bringing up the meridian runtime"
        );

        // Elections and the timestamp bound run on separate fleets so
        // neither protocol's rounds interleave with the other's.
        let election_fleet = Fleet::create(&members)?;
        let bound_fleet = Fleet::create(&members)?;

        let leadership = Arc::new(LeadershipState::new());
        let elector = Arc::new(LeaderElector::new(
            node_id,
            election_fleet.proposer(node_id),
            election_fleet.learner_clients.clone(),
            Arc::clone(&leadership),
        ));
        let role = elector.elect()?;
        info!(role = %role, "initial election finished");
        let supervisor = LeadershipSupervisor::start(
            Arc::clone(&elector),
            Duration::from_millis(LEADERSHIP_CHECK_INTERVAL_MS),
        );

        let bound_store = Arc::new(PaxosTimestampBoundStore::new(
            node_id,
            bound_fleet.proposer(node_id),
            bound_fleet.acceptor_clients.clone(),
            bound_fleet.learner_clients.clone(),
        ));
        let timestamps: Arc<dyn TimestampService> = Arc::new(
            PersistentTimestampService::create(bound_store, Arc::clone(&leadership))?,
        );

        let locks = Arc::new(LockService::new(Arc::clone(&leadership)));
        let refresher = LockRefresher::start(Arc::clone(&locks), config.lock_refresh_interval());

        let transactions = Arc::new(TransactionManager::create(
            Arc::clone(&kvs),
            Arc::clone(&timestamps),
            Arc::clone(&locks),
            config.client_id(),
        )?);

        let strategies = Arc::new(SweepStrategyManager::new(Arc::clone(&kvs)));
        let runner = Arc::new(SweepTaskRunner::new(
            Arc::clone(&kvs),
            transactions.transaction_service(),
            Arc::clone(&strategies),
            Arc::clone(&transactions) as Arc<dyn WatermarkSource>,
        ));
        let progress = Arc::new(SweepProgressStore::create(Arc::clone(&kvs))?);
        let persistent_lock = Arc::new(PersistentLockManager::new(
            create_persistent_lock_service(Arc::clone(&kvs))?,
            "background sweep",
        ));
        let batch = Self::batch_config(&config);
        let background_sweeper = BackgroundSweeper::start(
            Arc::clone(&kvs),
            Arc::clone(&runner),
            progress,
            persistent_lock,
            BackgroundSweepSettings {
                enabled: config.sweep.enabled,
                pause: Duration::from_millis(config.sweep.pause_millis),
                lock_wait: Duration::from_millis(config.sweep.persistent_lock_wait_millis),
                batch,
            },
        );
        let sweeper = Arc::new(SweeperService::new(
            strategies,
            runner,
            SweepConfigOverrides {
                max_cell_ts_pairs_to_examine: config.sweep.max_cell_ts_pairs_to_examine,
                candidate_batch_size: config.sweep.candidate_batch_size,
                delete_batch_size: config.sweep.delete_batch_size,
            },
        ));

        info!(node = %node_id, "meridian runtime is up");
        Ok(Self {
            config,
            kvs,
            leadership,
            elector,
            timestamps,
            locks,
            transactions,
            sweeper,
            supervisor,
            refresher,
            background_sweeper,
        })
    }

    fn batch_config(config: &MeridianConfig) -> SweepBatchConfig {
        let defaults = SweepBatchConfig::default();
        SweepBatchConfig {
            max_cell_ts_pairs_to_examine: config
                .sweep
                .max_cell_ts_pairs_to_examine
                .unwrap_or(defaults.max_cell_ts_pairs_to_examine),
            candidate_batch_size: config
                .sweep
                .candidate_batch_size
                .unwrap_or(defaults.candidate_batch_size),
            delete_batch_size: config
                .sweep
                .delete_batch_size
                .unwrap_or(defaults.delete_batch_size),
        }
    }

    /// The configuration the runtime was built from.
    #[must_use]
    pub fn config(&self) -> &MeridianConfig {
        &self.config
    }

    /// The underlying store.
    #[must_use]
    pub fn kvs(&self) -> Arc<dyn KeyValueService> {
        Arc::clone(&self.kvs)
    }

    /// This node's role state.
    #[must_use]
    pub fn leadership(&self) -> Arc<LeadershipState> {
        Arc::clone(&self.leadership)
    }

    /// Whether this node currently leads the cluster.
    #[must_use]
    pub fn is_leader(&self) -> bool {
        self.leadership.is_leader()
    }

    /// The timestamp oracle.
    #[must_use]
    pub fn timestamps(&self) -> Arc<dyn TimestampService> {
        Arc::clone(&self.timestamps)
    }

    /// The lock service.
    #[must_use]
    pub fn locks(&self) -> Arc<LockService> {
        Arc::clone(&self.locks)
    }

    /// Registers a held token for background lease refresh.
    pub fn keep_refreshed(&self, token: LockToken) {
        self.refresher.register(token);
    }

    /// The transaction manager.
    #[must_use]
    pub fn transactions(&self) -> Arc<TransactionManager> {
        Arc::clone(&self.transactions)
    }

    /// The manual sweep trigger.
    #[must_use]
    pub fn sweeper(&self) -> Arc<SweeperService> {
        Arc::clone(&self.sweeper)
    }

    /// Whether the background sweeper thread is running.
    #[must_use]
    pub fn background_sweep_running(&self) -> bool {
        self.background_sweeper.is_running()
    }

    /// Builds a lock request with this node's configured timeout and
    /// lease applied.
    ///
    /// # Errors
    ///
    /// Rejects an empty descriptor set.
    pub fn lock_request(&self, descriptors: Vec<LockDescriptor>) -> MeridianResult<LockRequest> {
        Ok(LockRequest::new(self.config.client_id(), descriptors)?
            .with_acquire_timeout(self.config.lock_acquire_timeout())
            .with_lease_duration(self.config.lock_lease()))
    }

    /// Stops background work and steps down from leadership. Safe to
    /// call more than once.
    pub fn shutdown(&mut self) {
        info!(node = %self.config.node_id(), "shutting the meridian runtime down");
        self.background_sweeper.shutdown();
        self.refresher.shutdown();
        self.supervisor.shutdown();
        self.elector.step_down();
    }
}

impl Drop for MeridianRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_common::types::{Cell, TableRef, Value};
    use meridian_common::MeridianError;
    use meridian_kvs::{InMemoryKeyValueService, TableSchema};
    use meridian_sweep::SweepRequest;

    fn runtime() -> MeridianRuntime {
        MeridianRuntime::create(
            MeridianConfig::default(),
            Arc::new(InMemoryKeyValueService::new()),
        )
        .unwrap()
    }

    #[test]
    fn test_single_node_runtime_leads_immediately() {
        let runtime = runtime();
        assert!(runtime.is_leader());
        assert!(runtime.background_sweep_running());
        assert!(runtime.timestamps().fresh_timestamp().is_ok());
    }

    #[test]
    fn test_transactions_run_end_to_end() {
        let runtime = runtime();
        let table = TableRef::create("accounts", "balances").unwrap();
        runtime
            .kvs()
            .create_table(&table, &TableSchema::default())
            .unwrap();
        let cell = Cell::new(&b"alice"[..], &b"balance"[..]);

        runtime
            .transactions()
            .run(|txn| txn.put(&table, cell.clone(), Value::from_bytes(b"100")))
            .unwrap();

        let read = runtime
            .transactions()
            .run(|txn| txn.get(&table, &cell))
            .unwrap();
        assert_eq!(read, Some(Value::from_bytes(b"100")));
    }

    #[test]
    fn test_manual_sweep_through_the_runtime() {
        let mut config = MeridianConfig::default();
        config.sweep.enabled = false;
        let runtime =
            MeridianRuntime::create(config, Arc::new(InMemoryKeyValueService::new())).unwrap();
        let table = TableRef::create("accounts", "balances").unwrap();
        runtime
            .kvs()
            .create_table(&table, &TableSchema::default())
            .unwrap();
        let cell = Cell::new(&b"alice"[..], &b"balance"[..]);

        for value in [&b"1"[..], &b"2"[..]] {
            runtime
                .transactions()
                .run(|txn| txn.put(&table, cell.clone(), Value::from_bytes(value)))
                .unwrap();
        }

        let response = runtime
            .sweeper()
            .sweep(&SweepRequest {
                table_name: table.qualified_name(),
                ..SweepRequest::default()
            })
            .unwrap();
        assert_eq!(response.cell_ts_pairs_deleted, 1);

        let read = runtime
            .transactions()
            .run(|txn| txn.get(&table, &cell))
            .unwrap();
        assert_eq!(read, Some(Value::from_bytes(b"2")));
    }

    #[test]
    fn test_configured_sweep_overrides_reach_the_service() {
        let mut config = MeridianConfig::default();
        config.sweep.enabled = false;
        config.sweep.delete_batch_size = Some(3);
        let runtime =
            MeridianRuntime::create(config, Arc::new(InMemoryKeyValueService::new())).unwrap();

        assert!(!runtime.background_sweep_running());
    }

    #[test]
    fn test_invalid_config_refused() {
        let mut config = MeridianConfig::default();
        config.cluster.members = vec![2];
        let err = MeridianRuntime::create(config, Arc::new(InMemoryKeyValueService::new()))
            .unwrap_err();
        assert!(matches!(err, MeridianError::InvalidConfig { .. }));
    }

    #[test]
    fn test_lock_request_carries_configured_limits() {
        let mut config = MeridianConfig::default();
        config.lock.acquire_timeout_millis = 1_234;
        config.lock.lease_millis = 60_000;
        let runtime =
            MeridianRuntime::create(config, Arc::new(InMemoryKeyValueService::new())).unwrap();

        let table = TableRef::create("accounts", "balances").unwrap();
        let request = runtime
            .lock_request(vec![LockDescriptor::from_row(&table, b"alice")])
            .unwrap();
        assert_eq!(request.acquire_timeout(), Duration::from_millis(1_234));
        assert_eq!(request.lease_duration(), Duration::from_millis(60_000));
    }

    #[test]
    fn test_shutdown_is_idempotent_and_steps_down() {
        let mut runtime = runtime();
        assert!(runtime.is_leader());
        runtime.shutdown();
        assert!(!runtime.is_leader());
        runtime.shutdown();
    }
}
