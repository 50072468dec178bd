/// Logical session pooling
///
/// Sessions correlate a sequence of operations for causal consistency or
/// transactions. Handles are exclusively owned while checked out; on release
/// they return to the pool and are reused until their idle time exceeds the
/// server-advertised timeout.
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use tracing::debug;
use uuid::Uuid;

/// Options for starting a session
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Track an operation-time watermark for causally consistent reads
    pub causal_consistency: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            causal_consistency: true,
        }
    }
}

/// An exclusively-owned logical session
#[derive(Debug)]
pub struct SessionHandle {
    id: Uuid,
    created_at: SystemTime,
    last_used: SystemTime,
    operation_time: Option<u64>,
    causal_consistency: bool,
    dirty: bool,
}

impl SessionHandle {
    fn new(options: &SessionOptions) -> Self {
        let now = SystemTime::now();
        Self {
            id: Uuid::new_v4(),
            created_at: now,
            last_used: now,
            operation_time: None,
            causal_consistency: options.causal_consistency,
            dirty: false,
        }
    }

    /// Unique session identifier, generated at allocation
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub fn last_used(&self) -> SystemTime {
        self.last_used
    }

    pub fn causal_consistency(&self) -> bool {
        self.causal_consistency
    }

    /// Causal-consistency watermark of the most recent acknowledged operation
    pub fn operation_time(&self) -> Option<u64> {
        self.operation_time
    }

    /// Advance the watermark; earlier times are ignored
    pub fn advance_operation_time(&mut self, operation_time: u64) {
        match self.operation_time {
            Some(current) if current >= operation_time => {}
            _ => self.operation_time = Some(operation_time),
        }
    }

    /// Record operation activity on the session
    pub fn touch(&mut self) {
        self.last_used = SystemTime::now();
    }

    /// Mark the session unusable (e.g. after a network error mid-operation);
    /// dirty sessions are discarded instead of pooled on release
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    fn idle_time(&self, now: SystemTime) -> Duration {
        now.duration_since(self.last_used).unwrap_or_default()
    }
}

/// Pools released session handles for reuse
pub struct SessionRegistry {
    pool: Mutex<VecDeque<SessionHandle>>,
    /// Fallback idle timeout when no server advertises one
    default_timeout: Duration,
    closed: AtomicBool,
}

impl SessionRegistry {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            pool: Mutex::new(VecDeque::new()),
            default_timeout,
            closed: AtomicBool::new(false),
        }
    }

    /// Check out a session, reusing the most recently released handle whose
    /// idle time is still below the timeout. Expired handles encountered on
    /// the way are pruned.
    pub fn checkout(
        &self,
        options: SessionOptions,
        advertised_timeout: Option<Duration>,
    ) -> SessionHandle {
        let timeout = advertised_timeout.unwrap_or(self.default_timeout);
        let now = SystemTime::now();

        let mut pool = self.pool.lock().unwrap();
        while let Some(mut handle) = pool.pop_front() {
            if handle.idle_time(now) < timeout {
                debug!(session = %handle.id, "reusing pooled session");
                handle.last_used = now;
                handle.causal_consistency = options.causal_consistency;
                return handle;
            }
            debug!(session = %handle.id, "pruning expired session");
        }

        let handle = SessionHandle::new(&options);
        debug!(session = %handle.id, "allocated new session");
        handle
    }

    /// Return a session to the pool. Dirty handles and handles returned after
    /// close are discarded.
    pub fn checkin(&self, mut handle: SessionHandle) {
        if self.closed.load(Ordering::SeqCst) || handle.dirty {
            debug!(session = %handle.id, "discarding session");
            return;
        }
        handle.last_used = SystemTime::now();
        let mut pool = self.pool.lock().unwrap();
        pool.push_front(handle);
    }

    /// Number of pooled (checked-in) sessions
    pub fn pooled_count(&self) -> usize {
        self.pool.lock().unwrap().len()
    }

    /// End all pooled sessions and refuse further pooling. Returns the ids of
    /// the sessions that were proactively ended, for the caller to report to
    /// a server if it wishes.
    pub fn close(&self) -> Vec<Uuid> {
        self.closed.store(true, Ordering::SeqCst);
        let mut pool = self.pool.lock().unwrap();
        let ended: Vec<Uuid> = pool.iter().map(|h| h.id).collect();
        pool.clear();
        if !ended.is_empty() {
            debug!(count = ended.len(), "ended pooled sessions at teardown");
        }
        ended
    }
}
