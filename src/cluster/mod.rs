/// Cluster facade: the single entry point used by operation callers
///
/// Owns the topology snapshot, one monitor per known server, and the logical
/// session pool. Callers select servers against the latest snapshot and are
/// suspended (async or blocking) until a qualifying topology change arrives
/// or their timeout elapses.
pub(crate) mod state;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, info};

use crate::config::ClusterConfig;
use crate::conn::{ConnectionFactory, CryptClient};
use crate::error::{Error, Result};
use crate::monitor::{self, MonitorHandle, MonitorOptions};
use crate::selection::{self, SelectionCriteria};
use crate::session::{SessionHandle, SessionOptions, SessionRegistry};
use crate::topology::{ServerAddress, ServerDescription, TopologyDescription};

use self::state::SharedTopology;
pub use self::state::ChangeListener;

static NEXT_CLUSTER_ID: AtomicU32 = AtomicU32::new(1);

/// Process-lifetime-unique cluster identifier, used to correlate monitor and
/// log events; never reused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClusterId(u32);

impl ClusterId {
    fn next() -> Self {
        Self(NEXT_CLUSTER_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn value(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cluster-{}", self.0)
    }
}

/// Cooperative cancellation for blocking selection calls. Clones share the
/// cancelled state; cancelling any clone wakes every call waiting on it.
#[derive(Clone, Default)]
pub struct CancellationToken {
    state: Arc<TokenState>,
}

#[derive(Default)]
struct TokenState {
    cancelled: AtomicBool,
    waiters: Mutex<Vec<Weak<SharedTopology>>>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    /// Cancel: selection calls waiting on this token wake and fail with
    /// [`Error::SelectionCancelled`]
    pub fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::SeqCst);
        for waiter in self.state.waiters.lock().unwrap().drain(..) {
            if let Some(topology) = waiter.upgrade() {
                topology.wake_waiters();
            }
        }
    }

    fn attach(&self, topology: &Arc<SharedTopology>) {
        self.state
            .waiters
            .lock()
            .unwrap()
            .push(Arc::downgrade(topology));
    }
}

/// Cluster topology manager and server-selection engine
pub struct Cluster {
    config: ClusterConfig,
    cluster_id: ClusterId,
    topology: Arc<SharedTopology>,
    factory: Arc<dyn ConnectionFactory>,
    crypt_client: Option<Arc<dyn CryptClient>>,
    monitors: Arc<Mutex<HashMap<ServerAddress, MonitorHandle>>>,
    sessions: SessionRegistry,
    initialized: AtomicBool,
    closed: AtomicBool,
}

impl Cluster {
    /// Create a cluster from validated configuration. Monitoring does not
    /// start until [`initialize`](Self::initialize) is called.
    pub fn new(config: ClusterConfig, factory: Arc<dyn ConnectionFactory>) -> Result<Self> {
        config.validate()?;

        let cluster_id = ClusterId::next();
        let initial = TopologyDescription::seeded(
            config.seed_addresses(),
            config.replica_set.clone(),
            config.load_balanced,
        );
        let sessions = SessionRegistry::new(config.default_session_timeout());

        info!(%cluster_id, seeds = ?config.seeds, "cluster created");

        Ok(Self {
            config,
            cluster_id,
            topology: Arc::new(SharedTopology::new(initial)),
            factory,
            crypt_client: None,
            monitors: Arc::new(Mutex::new(HashMap::new())),
            sessions,
            initialized: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// Attach an optional field-level-encryption capability, passed through
    /// to callers that need it
    pub fn with_crypt_client(mut self, crypt_client: Arc<dyn CryptClient>) -> Self {
        self.crypt_client = Some(crypt_client);
        self
    }

    pub fn cluster_id(&self) -> ClusterId {
        self.cluster_id
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Latest topology snapshot
    pub fn description(&self) -> Arc<TopologyDescription> {
        self.topology.current()
    }

    /// The optional crypt client handle
    pub fn crypt_client(&self) -> Option<&Arc<dyn CryptClient>> {
        self.crypt_client.as_ref()
    }

    /// Selection criteria pre-configured with this cluster's latency window
    pub fn criteria(&self, mode: crate::selection::ReadMode) -> SelectionCriteria {
        SelectionCriteria::new(mode).with_latency_window(self.config.local_threshold())
    }

    /// Register a listener invoked synchronously, in registration order, with
    /// the replaced and the new topology snapshot
    pub fn on_description_changed(&self, listener: ChangeListener) {
        self.topology.add_listener(listener);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Start one monitor per seed address and begin reconciling monitors
    /// against membership changes. Idempotent.
    pub fn initialize(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ClusterClosed);
        }
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let options = MonitorOptions {
            heartbeat_interval: self.config.heartbeat_interval(),
            min_heartbeat_interval: self.config.min_heartbeat_interval(),
        };

        {
            let mut monitors = self.monitors.lock().unwrap();
            for address in self.topology.current().addresses() {
                monitors.insert(
                    address.clone(),
                    monitor::spawn(
                        address,
                        Arc::clone(&self.factory),
                        Arc::clone(&self.topology),
                        options.clone(),
                    ),
                );
            }
        }

        tokio::spawn(reconcile_monitors(
            Arc::clone(&self.monitors),
            Arc::clone(&self.topology),
            Arc::clone(&self.factory),
            options,
            self.topology.subscribe(),
        ));

        info!(cluster_id = %self.cluster_id, "cluster initialized");
        Ok(())
    }

    /// Select one eligible server, suspending until a qualifying topology
    /// change is published or the timeout elapses
    pub async fn select_server(
        &self,
        criteria: &SelectionCriteria,
        timeout: Duration,
    ) -> Result<ServerDescription> {
        if self.is_closed() {
            return Err(Error::ClusterClosed);
        }

        let mut rx = self.topology.subscribe();
        let started = Instant::now();

        loop {
            // mark the current revision seen before reading the snapshot so
            // a publish in between still wakes us
            rx.borrow_and_update();

            match self.try_select(criteria) {
                SelectAttempt::Found(server) => return Ok(server),
                SelectAttempt::Closed => return Err(Error::ClusterClosed),
                SelectAttempt::NoneEligible => {}
            }

            let elapsed = started.elapsed();
            if elapsed >= timeout {
                return Err(self.selection_timeout_error(criteria, elapsed));
            }

            match tokio::time::timeout(timeout - elapsed, rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return Err(Error::ClusterClosed),
                Err(_) => {
                    return Err(self.selection_timeout_error(criteria, started.elapsed()));
                }
            }
        }
    }

    /// Blocking variant of [`select_server`](Self::select_server) with
    /// identical semantics, for callers without an async context
    pub fn select_server_blocking(
        &self,
        criteria: &SelectionCriteria,
        timeout: Duration,
    ) -> Result<ServerDescription> {
        self.select_server_blocking_cancellable(criteria, timeout, &CancellationToken::new())
    }

    /// Like [`select_server_blocking`](Self::select_server_blocking), but the
    /// wait also ends, with [`Error::SelectionCancelled`], when `token` is
    /// cancelled from another thread
    pub fn select_server_blocking_cancellable(
        &self,
        criteria: &SelectionCriteria,
        timeout: Duration,
        token: &CancellationToken,
    ) -> Result<ServerDescription> {
        if self.is_closed() {
            return Err(Error::ClusterClosed);
        }

        token.attach(&self.topology);
        let started = Instant::now();

        loop {
            if token.is_cancelled() {
                return Err(Error::SelectionCancelled);
            }

            let seen = self.topology.current().revision;

            match self.try_select(criteria) {
                SelectAttempt::Found(server) => return Ok(server),
                SelectAttempt::Closed => return Err(Error::ClusterClosed),
                SelectAttempt::NoneEligible => {}
            }

            let elapsed = started.elapsed();
            if elapsed >= timeout {
                return Err(self.selection_timeout_error(criteria, elapsed));
            }

            self.topology
                .wait_for_update_blocking(seen, timeout - elapsed, || token.is_cancelled());
        }
    }

    fn try_select(&self, criteria: &SelectionCriteria) -> SelectAttempt {
        if self.is_closed() || self.topology.is_closed() {
            return SelectAttempt::Closed;
        }

        let snapshot = self.topology.current();
        let eligible = selection::select(&snapshot, criteria);
        match selection::pick(&eligible) {
            Some(server) => {
                debug!(
                    cluster_id = %self.cluster_id,
                    address = %server.address,
                    "selected server"
                );
                SelectAttempt::Found(server)
            }
            None => {
                // speed up discovery while the caller waits
                self.request_immediate_checks();
                SelectAttempt::NoneEligible
            }
        }
    }

    fn selection_timeout_error(&self, criteria: &SelectionCriteria, elapsed: Duration) -> Error {
        let snapshot = self.topology.current();
        Error::selection_timeout(
            format!(
                "no server satisfied {:?} in topology {:?} with {} known servers",
                criteria.mode,
                snapshot.topology_type,
                snapshot.servers.len()
            ),
            elapsed,
        )
    }

    /// Report a network-level failure from an operation a caller issued
    /// against the given server, so its monitor re-probes immediately rather
    /// than waiting for the next heartbeat
    pub fn notify_network_error(&self, address: &ServerAddress) {
        if let Some(handle) = self.monitors.lock().unwrap().get(address) {
            debug!(cluster_id = %self.cluster_id, %address, "network error reported, requesting check");
            handle.request_check();
        }
    }

    /// Signal every monitor to probe now rather than on its next heartbeat
    pub fn request_immediate_checks(&self) {
        for handle in self.monitors.lock().unwrap().values() {
            handle.request_check();
        }
    }

    /// Check out a logical session, reusing a pooled one when possible
    pub fn start_session(&self, options: SessionOptions) -> Result<SessionHandle> {
        if self.is_closed() {
            return Err(Error::ClusterClosed);
        }
        let advertised = self.topology.current().logical_session_timeout;
        Ok(self.sessions.checkout(options, advertised))
    }

    /// Return a session for pooling and reuse
    pub fn checkin_session(&self, handle: SessionHandle) {
        self.sessions.checkin(handle);
    }

    /// Tear the cluster down: stop all monitors, end pooled sessions, and
    /// fail subsequent calls with `ClusterClosed`. Safe to call from any
    /// context and more than once; does not wait for in-flight probes.
    pub fn dispose(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.topology.close();

        let handles: Vec<MonitorHandle> = {
            let mut monitors = self.monitors.lock().unwrap();
            monitors.drain().map(|(_, handle)| handle).collect()
        };
        for handle in &handles {
            handle.stop();
        }

        let ended = self.sessions.close();
        info!(
            cluster_id = %self.cluster_id,
            monitors = handles.len(),
            sessions_ended = ended.len(),
            "cluster disposed"
        );
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.dispose();
    }
}

enum SelectAttempt {
    Found(ServerDescription),
    NoneEligible,
    Closed,
}

/// Keep the running monitors aligned with topology membership: start one for
/// every newly discovered address, stop the ones whose address was removed.
async fn reconcile_monitors(
    monitors: Arc<Mutex<HashMap<ServerAddress, MonitorHandle>>>,
    topology: Arc<SharedTopology>,
    factory: Arc<dyn ConnectionFactory>,
    options: MonitorOptions,
    mut rx: watch::Receiver<u64>,
) {
    loop {
        if rx.changed().await.is_err() {
            break;
        }
        if topology.is_closed() {
            break;
        }

        let snapshot = topology.current();
        let mut guard = monitors.lock().unwrap();

        let removed: Vec<ServerAddress> = guard
            .keys()
            .filter(|address| !snapshot.contains(address))
            .cloned()
            .collect();
        for address in removed {
            if let Some(handle) = guard.remove(&address) {
                debug!(address = %address, "membership dropped server");
                handle.stop();
            }
        }

        for address in snapshot.addresses() {
            if !guard.contains_key(&address) {
                debug!(address = %address, "membership added server");
                guard.insert(
                    address.clone(),
                    monitor::spawn(
                        address,
                        Arc::clone(&factory),
                        Arc::clone(&topology),
                        options.clone(),
                    ),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::testing::{member_reply, ScriptedFactory, ScriptedProbe};
    use crate::topology::{ServerRole, TopologyType};
    use std::sync::atomic::AtomicUsize;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }

    fn config(seeds: &[&str], heartbeat_ms: u64) -> ClusterConfig {
        let mut config = ClusterConfig {
            seeds: seeds.iter().map(|s| s.to_string()).collect(),
            replica_set: Some("rs0".to_string()),
            ..Default::default()
        };
        config.monitor.heartbeat_interval_ms = heartbeat_ms;
        config.monitor.min_heartbeat_interval_ms = heartbeat_ms.min(500);
        config
    }

    fn primary_factory(seed: &str) -> Arc<ScriptedFactory> {
        let factory = Arc::new(ScriptedFactory::new());
        factory.script(
            seed.parse().unwrap(),
            vec![ScriptedProbe::Reply(member_reply(
                ServerRole::Primary,
                "rs0",
                &[seed],
                Some(1),
            ))],
        );
        factory
    }

    #[tokio::test]
    async fn test_zero_timeout_fails_immediately() {
        let cluster = Cluster::new(
            config(&["a:1"], 10_000),
            Arc::new(ScriptedFactory::new()),
        )
        .unwrap();

        let started = Instant::now();
        let err = cluster
            .select_server(&SelectionCriteria::primary(), Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ServerSelectionTimeout { .. }));
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_select_succeeds_once_monitor_reports() {
        init_tracing();
        let factory = primary_factory("a:1");
        let cluster = Cluster::new(config(&["a:1"], 10_000), factory).unwrap();
        cluster.initialize().unwrap();

        let server = cluster
            .select_server(&SelectionCriteria::primary(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(server.role, ServerRole::Primary);
        assert_eq!(server.address, "a:1".parse().unwrap());

        cluster.dispose();
    }

    #[tokio::test]
    async fn test_suspended_selection_wakes_on_publish() {
        // no monitors: the topology only changes when the test publishes
        let cluster = Arc::new(
            Cluster::new(config(&["a:1"], 10_000), Arc::new(ScriptedFactory::new())).unwrap(),
        );

        let publisher = Arc::clone(&cluster);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let report = ServerDescription {
                role: ServerRole::Primary,
                set_name: Some("rs0".to_string()),
                election_ordinal: Some(1),
                hosts: vec!["a:1".parse().unwrap()],
                round_trip_time: Some(Duration::from_millis(1)),
                ..ServerDescription::unknown("a:1".parse().unwrap())
            };
            publisher.topology.apply_report(report);
        });

        let started = Instant::now();
        let server = cluster
            .select_server(&SelectionCriteria::primary(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(server.role, ServerRole::Primary);
        // woken by the publish, well before the timeout
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_blocking_selection_wakes_on_publish() {
        let cluster = Arc::new(
            Cluster::new(config(&["a:1"], 10_000), Arc::new(ScriptedFactory::new())).unwrap(),
        );

        let publisher = Arc::clone(&cluster);
        let thread = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            let report = ServerDescription {
                role: ServerRole::Primary,
                set_name: Some("rs0".to_string()),
                election_ordinal: Some(1),
                hosts: vec!["a:1".parse().unwrap()],
                round_trip_time: Some(Duration::from_millis(1)),
                ..ServerDescription::unknown("a:1".parse().unwrap())
            };
            publisher.topology.apply_report(report);
        });

        let server = cluster
            .select_server_blocking(&SelectionCriteria::primary(), Duration::from_secs(5))
            .unwrap();
        assert_eq!(server.role, ServerRole::Primary);
        thread.join().unwrap();
    }

    #[tokio::test]
    async fn test_dispose_fails_subsequent_calls_and_stops_monitors() {
        init_tracing();
        let factory = Arc::new(ScriptedFactory::new());
        factory.script(
            "a:1".parse().unwrap(),
            vec![ScriptedProbe::Fail("down".to_string())],
        );
        let mut cfg = config(&["a:1"], 60_000);
        cfg.monitor.min_heartbeat_interval_ms = 20;
        let cluster = Cluster::new(cfg, factory.clone()).unwrap();
        cluster.initialize().unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        cluster.dispose();

        let err = cluster
            .select_server(&SelectionCriteria::primary(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ClusterClosed));
        assert!(matches!(
            cluster.start_session(SessionOptions::default()),
            Err(Error::ClusterClosed)
        ));

        // monitors received the stop signal; probing ceases
        tokio::time::sleep(Duration::from_millis(100)).await;
        let count = factory.probe_count();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(factory.probe_count(), count);

        // dispose is idempotent
        cluster.dispose();
    }

    #[tokio::test]
    async fn test_dispose_wakes_suspended_selection() {
        let cluster = Arc::new(
            Cluster::new(config(&["a:1"], 10_000), Arc::new(ScriptedFactory::new())).unwrap(),
        );

        let disposer = Arc::clone(&cluster);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            disposer.dispose();
        });

        let started = Instant::now();
        let err = cluster
            .select_server(&SelectionCriteria::primary(), Duration::from_secs(30))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ClusterClosed));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_cancel_wakes_blocking_selection() {
        let cluster =
            Cluster::new(config(&["a:1"], 10_000), Arc::new(ScriptedFactory::new())).unwrap();
        let token = CancellationToken::new();

        let canceller = token.clone();
        let thread = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            canceller.cancel();
        });

        let started = Instant::now();
        let err = cluster
            .select_server_blocking_cancellable(
                &SelectionCriteria::primary(),
                Duration::from_secs(30),
                &token,
            )
            .unwrap_err();
        assert!(matches!(err, Error::SelectionCancelled));
        // the cancel ended the wait, not the timeout
        assert!(started.elapsed() < Duration::from_secs(5));
        thread.join().unwrap();

        // the cluster itself is still usable
        assert!(!cluster.is_closed());
    }

    #[test]
    fn test_cancelled_token_fails_without_waiting() {
        let cluster =
            Cluster::new(config(&["a:1"], 10_000), Arc::new(ScriptedFactory::new())).unwrap();
        let token = CancellationToken::new();
        token.cancel();
        assert!(token.is_cancelled());

        let err = cluster
            .select_server_blocking_cancellable(
                &SelectionCriteria::primary(),
                Duration::from_secs(30),
                &token,
            )
            .unwrap_err();
        assert!(matches!(err, Error::SelectionCancelled));
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let factory = primary_factory("a:1");
        let cluster = Cluster::new(config(&["a:1"], 10_000), factory).unwrap();
        cluster.initialize().unwrap();
        cluster.initialize().unwrap();
        assert_eq!(cluster.monitors.lock().unwrap().len(), 1);
        cluster.dispose();
    }

    #[tokio::test]
    async fn test_membership_discovery_starts_new_monitors() {
        let factory = Arc::new(ScriptedFactory::new());
        factory.script(
            "a:1".parse().unwrap(),
            vec![ScriptedProbe::Reply(member_reply(
                ServerRole::Primary,
                "rs0",
                &["a:1", "b:1"],
                Some(1),
            ))],
        );
        factory.script(
            "b:1".parse().unwrap(),
            vec![ScriptedProbe::Reply(member_reply(
                ServerRole::Secondary,
                "rs0",
                &["a:1", "b:1"],
                None,
            ))],
        );

        let cluster = Cluster::new(config(&["a:1"], 10_000), factory).unwrap();
        cluster.initialize().unwrap();

        // b:1 is only known through the primary's membership list
        let server = cluster
            .select_server(&SelectionCriteria::secondary(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(server.address, "b:1".parse().unwrap());

        cluster.dispose();
    }

    #[tokio::test]
    async fn test_session_reuse_through_facade() {
        let factory = primary_factory("a:1");
        let cluster = Cluster::new(config(&["a:1"], 10_000), factory).unwrap();

        let session = cluster.start_session(SessionOptions::default()).unwrap();
        let id = session.id();
        cluster.checkin_session(session);

        let session = cluster.start_session(SessionOptions::default()).unwrap();
        assert_eq!(session.id(), id);
    }

    #[tokio::test]
    async fn test_description_change_listener() {
        let cluster =
            Cluster::new(config(&["a:1"], 10_000), Arc::new(ScriptedFactory::new())).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        cluster.on_description_changed(Box::new(move |old, new| {
            assert!(new.revision > old.revision);
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let report = ServerDescription {
            role: ServerRole::Secondary,
            set_name: Some("rs0".to_string()),
            ..ServerDescription::unknown("a:1".parse().unwrap())
        };
        cluster.topology.apply_report(report);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cluster_ids_are_unique() {
        let a = Cluster::new(
            config(&["a:1"], 10_000),
            Arc::new(ScriptedFactory::new()),
        )
        .unwrap();
        let b = Cluster::new(
            config(&["a:1"], 10_000),
            Arc::new(ScriptedFactory::new()),
        )
        .unwrap();
        assert_ne!(a.cluster_id(), b.cluster_id());
        assert!(a.cluster_id().to_string().starts_with("cluster-"));
    }

    #[tokio::test]
    async fn test_description_accessor_snapshots() {
        let cluster =
            Cluster::new(config(&["a:1"], 10_000), Arc::new(ScriptedFactory::new())).unwrap();
        let before = cluster.description();
        assert_eq!(before.topology_type, TopologyType::ReplicaSetNoPrimary);

        let report = ServerDescription {
            role: ServerRole::Secondary,
            set_name: Some("rs0".to_string()),
            ..ServerDescription::unknown("a:1".parse().unwrap())
        };
        cluster.topology.apply_report(report);

        // previously returned snapshot is unchanged
        assert_eq!(before.revision, 0);
        assert_eq!(cluster.description().revision, 1);
    }
}
