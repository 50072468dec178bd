/// Shared ownership of the current topology snapshot
///
/// Readers only ever take a pointer to the latest immutable snapshot; the
/// single writer folds monitor reports in under a short, I/O-free critical
/// section. Both async waiters (watch channel) and blocking waiters
/// (condvar) are woken on every publish and on close.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::watch;
use tracing::trace;

use crate::topology::{coordinator, ServerDescription, TopologyDescription};

/// Callback invoked synchronously, in registration order, with the replaced
/// and the new snapshot. Listeners must not block the publisher; expensive
/// work belongs on a queue.
pub type ChangeListener = Box<dyn Fn(&TopologyDescription, &TopologyDescription) + Send + Sync>;

pub(crate) struct SharedTopology {
    state: Mutex<Arc<TopologyDescription>>,
    /// Held across listener invocation and watch publication so subscribers
    /// observe snapshots in revision order
    publish: Mutex<()>,
    changed: Condvar,
    revision_tx: watch::Sender<u64>,
    listeners: RwLock<Vec<ChangeListener>>,
    closed: AtomicBool,
}

impl SharedTopology {
    pub fn new(initial: TopologyDescription) -> Self {
        let revision = initial.revision;
        let (revision_tx, _) = watch::channel(revision);
        Self {
            state: Mutex::new(Arc::new(initial)),
            publish: Mutex::new(()),
            changed: Condvar::new(),
            revision_tx,
            listeners: RwLock::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Pointer to the latest snapshot
    pub fn current(&self) -> Arc<TopologyDescription> {
        Arc::clone(&self.state.lock().unwrap())
    }

    /// Receiver that observes the revision of every published snapshot
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision_tx.subscribe()
    }

    pub fn add_listener(&self, listener: ChangeListener) {
        self.listeners.write().unwrap().push(listener);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop accepting reports and wake every waiter
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let revision = self.state.lock().unwrap().revision;
        let _publish = self.publish.lock().unwrap();
        self.revision_tx.send_replace(revision);
        self.changed.notify_all();
    }

    /// Wake blocking waiters so they re-evaluate their wait condition
    pub fn wake_waiters(&self) {
        self.changed.notify_all();
    }

    /// Fold a monitor report into the topology and publish the new snapshot.
    /// Returns false once closed; late results from in-flight probes are
    /// discarded.
    pub fn apply_report(&self, report: ServerDescription) -> bool {
        if self.is_closed() {
            return false;
        }

        let (old, new, _publish) = {
            let mut guard = self.state.lock().unwrap();
            let next = coordinator::apply(&guard, report);
            if next.revision == guard.revision {
                // report for an address no longer in the topology
                return true;
            }
            let old = Arc::clone(&guard);
            let new = Arc::new(next);
            *guard = Arc::clone(&new);
            // take the publish lock before releasing the state lock so a
            // concurrent writer cannot deliver a newer snapshot first
            (old, new, self.publish.lock().unwrap())
        };

        trace!(revision = new.revision, topology = ?new.topology_type, "published topology");

        for listener in self.listeners.read().unwrap().iter() {
            listener(&old, &new);
        }

        self.revision_tx.send_replace(new.revision);
        self.changed.notify_all();
        true
    }

    /// Block until a snapshot newer than `seen_revision` is published, the
    /// topology closes, `interrupted` returns true, or the timeout elapses.
    /// Returns true unless the wait timed out. Interrupters must call
    /// [`wake_waiters`](Self::wake_waiters) after flipping their condition.
    pub fn wait_for_update_blocking<F>(
        &self,
        seen_revision: u64,
        timeout: Duration,
        interrupted: F,
    ) -> bool
    where
        F: Fn() -> bool,
    {
        let guard = self.state.lock().unwrap();
        let (guard, _result) = self
            .changed
            .wait_timeout_while(guard, timeout, |current| {
                current.revision <= seen_revision && !self.is_closed() && !interrupted()
            })
            .unwrap();
        guard.revision > seen_revision || self.is_closed() || interrupted()
    }
}
