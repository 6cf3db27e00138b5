//! Tenant registry: one [`Manager`] per client identity.
//!
//! Three modes, fixed at startup:
//!
//! 1. **Global** - a single shared manager; every request routes to it and
//!    the reaper is disabled. Only suitable for a single trusted operator.
//! 2. **Header-keyed** - the first request carrying a given `X-Session-Key`
//!    value creates an entry; later requests reuse it. Entries are reaped
//!    on idle time alone (default 5 minutes). This is the mode for
//!    multi-tenant front-ends behind a sticky load balancer.
//! 3. **Session-keyed** - one manager per MCP session, created when the
//!    session opens and dropped when the transport releases it.
//!
//! Fetch-or-create for keyed tenants is double-checked: a read-lock lookup
//! on the hot path, then a write-lock re-check before creating. Manager
//! construction does no network I/O, so holding the write lock across it is
//! cheap.
//!
//! The reaper wakes on an adaptive interval tuned to the next-expiring
//! entry, re-checks expiry under the write lock before removing (the entry
//! may have been touched since the scan), and closes managers only after
//! the lock is released. An in-flight request keeps its own
//! `Arc<Manager>`, so reaping can only affect future lookups.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::resolve_idle_timeout;
use super::keys::KeyStore;
use super::manager::Manager;

/// Shortest pause between reap passes.
const MIN_REAP_INTERVAL: Duration = Duration::from_secs(5);

/// Longest pause between reap passes (also used when the pool is empty).
const MAX_REAP_INTERVAL: Duration = Duration::from_secs(60);

/// First reap pass runs this long after startup.
const INITIAL_REAP_INTERVAL: Duration = Duration::from_secs(30);

/// The client identity a request is pooled under.
///
/// When a request carries both a sticky-routing header and an MCP session
/// ID, the header wins and the session ID is kept for logging only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tenant {
    /// Single shared manager (global mode).
    Global,
    /// Sticky-routing header value (`X-Session-Key`).
    Header(String),
    /// MCP transport session ID.
    Session(String),
}

impl std::fmt::Display for Tenant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tenant::Global => write!(f, "global"),
            Tenant::Header(key) => write!(f, "header:{}", key),
            Tenant::Session(id) => write!(f, "session:{}", id),
        }
    }
}

struct HeaderEntry {
    manager: Arc<Manager>,
    /// Seconds since pool start, monotonic.
    last_access: AtomicU64,
}

/// Process-wide registry dispensing managers per tenant.
pub struct Pool {
    global: Option<Arc<Manager>>,
    sessions: RwLock<HashMap<String, Arc<Manager>>>,
    header_entries: RwLock<HashMap<String, Arc<HeaderEntry>>>,
    key_store: Arc<KeyStore>,
    idle_timeout: Duration,
    epoch: Instant,
    reaper_cancel: CancellationToken,
    reaper_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Pool {
    /// Create the pool and, outside global mode, start the reaper.
    pub fn new(global_mode: bool, key_store: Arc<KeyStore>) -> Arc<Self> {
        let pool = Self::with_idle_timeout(global_mode, key_store, resolve_idle_timeout());
        if !global_mode {
            pool.spawn_reaper();
            info!(timeout = ?pool.idle_timeout, "session pool started");
        } else {
            info!("session pool running in global mode - single shared manager");
        }
        pool
    }

    /// Create without starting the reaper; used by `new` and by tests that
    /// drive reap passes explicitly.
    fn with_idle_timeout(
        global_mode: bool,
        key_store: Arc<KeyStore>,
        idle_timeout: Duration,
    ) -> Arc<Self> {
        let global = global_mode.then(|| Arc::new(Manager::new(key_store.clone())));
        Arc::new(Self {
            global,
            sessions: RwLock::new(HashMap::new()),
            header_entries: RwLock::new(HashMap::new()),
            key_store,
            idle_timeout,
            epoch: Instant::now(),
            reaper_cancel: CancellationToken::new(),
            reaper_task: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    /// Whether this pool runs a single shared manager.
    pub fn is_global(&self) -> bool {
        self.global.is_some()
    }

    /// Look up (or, for header tenants, create) the manager for a tenant.
    ///
    /// Session tenants must have been registered with [`Pool::create_session`];
    /// an unknown session yields `None` ("inactive session" at the tool
    /// layer).
    pub fn get(&self, tenant: &Tenant) -> Option<Arc<Manager>> {
        if let Some(global) = &self.global {
            return Some(global.clone());
        }

        match tenant {
            Tenant::Global => None,
            Tenant::Session(id) => self.sessions.read().get(id).cloned(),
            Tenant::Header(key) => {
                if key.is_empty() {
                    return None;
                }
                Some(self.header_manager(key))
            }
        }
    }

    /// Double-checked fetch-or-create for a header tenant.
    fn header_manager(&self, key: &str) -> Arc<Manager> {
        let now = self.elapsed_secs();

        // Fast path: read lock only.
        if let Some(entry) = self.header_entries.read().get(key) {
            entry.last_access.store(now, Ordering::Relaxed);
            return entry.manager.clone();
        }

        let mut entries = self.header_entries.write();
        // Re-check: another task may have created it between the locks.
        if let Some(entry) = entries.get(key) {
            entry.last_access.store(now, Ordering::Relaxed);
            return entry.manager.clone();
        }

        info!(key = %key, "creating manager for header tenant");
        let manager = Arc::new(Manager::new(self.key_store.clone()));
        entries.insert(
            key.to_string(),
            Arc::new(HeaderEntry {
                manager: manager.clone(),
                last_access: AtomicU64::new(now),
            }),
        );
        manager
    }

    /// Register a manager for a transport session. No-op in global mode or
    /// when the session already exists.
    pub fn create_session(&self, session_id: &str) {
        if self.global.is_some() {
            return;
        }
        let mut sessions = self.sessions.write();
        if sessions.contains_key(session_id) {
            return;
        }
        info!(session = %session_id, "creating manager for session");
        sessions.insert(
            session_id.to_string(),
            Arc::new(Manager::new(self.key_store.clone())),
        );
    }

    /// Drop a transport session's manager.
    ///
    /// Callable from synchronous teardown paths: the graceful close runs on
    /// the runtime when one is available, otherwise dropping the manager
    /// tears its transports down with it.
    pub fn destroy_session(&self, session_id: &str) {
        if self.global.is_some() {
            return;
        }
        let removed = self.sessions.write().remove(session_id);
        if let Some(manager) = removed {
            info!(session = %session_id, "destroying manager for session");
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move { manager.close().await });
            }
        }
    }

    fn spawn_reaper(self: &Arc<Self>) {
        let pool = self.clone();
        let cancel = self.reaper_cancel.clone();
        let task = tokio::spawn(async move {
            let mut interval = INITIAL_REAP_INTERVAL;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        interval = pool.reap_once().await;
                    }
                }
            }
            debug!("reaper stopped");
        });
        *self.reaper_task.lock() = Some(task);
    }

    /// One reap pass. Returns the pause until the next pass, tuned to the
    /// next-expiring entry and clamped to sane bounds.
    pub(crate) async fn reap_once(&self) -> Duration {
        let timeout_secs = self.idle_timeout.as_secs();
        let mut expired = Vec::new();
        let mut next_expiry: Option<u64> = None;
        let session_count;

        {
            let entries = self.header_entries.read();
            session_count = entries.len();
            let now = self.elapsed_secs();
            for (key, entry) in entries.iter() {
                let age = now.saturating_sub(entry.last_access.load(Ordering::Relaxed));
                if age > timeout_secs {
                    expired.push(key.clone());
                } else {
                    let remaining = timeout_secs - age;
                    next_expiry = Some(next_expiry.map_or(remaining, |n| n.min(remaining)));
                }
            }
        }

        let mut reaped = Vec::new();
        for key in expired {
            let removed = {
                let mut entries = self.header_entries.write();
                let now = self.elapsed_secs();
                match entries.get(&key) {
                    // Re-check: the entry may have been touched since the
                    // scan pass.
                    Some(entry)
                        if now.saturating_sub(entry.last_access.load(Ordering::Relaxed))
                            > timeout_secs =>
                    {
                        entries.remove(&key)
                    }
                    _ => None,
                }
            };
            if let Some(entry) = removed {
                info!(key = %key, "reaping idle tenant");
                reaped.push(entry);
            }
        }

        // Closing can be slow (tears down SSH transports); it happens with
        // no lock held.
        let reaped_count = reaped.len();
        for entry in reaped {
            entry.manager.close().await;
        }

        if reaped_count > 0 {
            debug!(reaped = reaped_count, remaining = session_count - reaped_count, "reap pass done");
        }

        match next_expiry {
            None => MAX_REAP_INTERVAL,
            Some(secs) => {
                (Duration::from_secs(secs) + Duration::from_secs(1))
                    .clamp(MIN_REAP_INTERVAL, MAX_REAP_INTERVAL)
            }
        }
    }

    /// Shut everything down. Safe to call more than once.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.reaper_cancel.cancel();
        let task = self.reaper_task.lock().take();
        if let Some(task) = task
            && let Err(err) = task.await
        {
            warn!(error = %err, "reaper task failed");
        }

        if let Some(global) = &self.global {
            global.close().await;
        }

        let session_managers: Vec<Arc<Manager>> =
            self.sessions.write().drain().map(|(_, m)| m).collect();
        let header_managers: Vec<Arc<Manager>> = self
            .header_entries
            .write()
            .drain()
            .map(|(_, e)| e.manager.clone())
            .collect();

        join_all(
            session_managers
                .iter()
                .chain(header_managers.iter())
                .map(|m| m.close()),
        )
        .await;

        info!("session pool closed");
    }

    fn elapsed_secs(&self) -> u64 {
        self.epoch.elapsed().as_secs()
    }

    #[cfg(test)]
    fn force_expire(&self, key: &str) {
        let entries = self.header_entries.read();
        if let Some(entry) = entries.get(key) {
            let past = self
                .elapsed_secs()
                .saturating_sub(self.idle_timeout.as_secs() + 2);
            entry.last_access.store(past, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_store() -> Arc<KeyStore> {
        Arc::new(KeyStore::new(Some("./data")))
    }

    fn test_pool(global_mode: bool) -> Arc<Pool> {
        Pool::with_idle_timeout(global_mode, key_store(), Duration::from_secs(0))
    }

    mod modes {
        use super::*;

        #[test]
        fn test_global_mode_shares_one_manager() {
            let pool = test_pool(true);
            let a = pool.get(&Tenant::Session("s1".into())).unwrap();
            let b = pool.get(&Tenant::Header("k1".into())).unwrap();
            let c = pool.get(&Tenant::Global).unwrap();
            assert!(Arc::ptr_eq(&a, &b));
            assert!(Arc::ptr_eq(&b, &c));
        }

        #[test]
        fn test_global_mode_ignores_session_lifecycle() {
            let pool = test_pool(true);
            pool.create_session("s1");
            assert!(pool.sessions.read().is_empty());
            pool.destroy_session("s1");
        }

        #[test]
        fn test_non_global_pool_has_no_global_manager() {
            let pool = test_pool(false);
            assert!(!pool.is_global());
            assert!(pool.get(&Tenant::Global).is_none());
        }
    }

    mod session_registry {
        use super::*;

        #[test]
        fn test_create_then_get() {
            let pool = test_pool(false);
            pool.create_session("sess-1");
            assert!(pool.get(&Tenant::Session("sess-1".into())).is_some());
        }

        #[test]
        fn test_unknown_session_is_none() {
            let pool = test_pool(false);
            assert!(pool.get(&Tenant::Session("ghost".into())).is_none());
        }

        #[test]
        fn test_create_is_idempotent() {
            let pool = test_pool(false);
            pool.create_session("sess-1");
            let first = pool.get(&Tenant::Session("sess-1".into())).unwrap();
            pool.create_session("sess-1");
            let second = pool.get(&Tenant::Session("sess-1".into())).unwrap();
            assert!(Arc::ptr_eq(&first, &second));
        }

        #[tokio::test]
        async fn test_destroy_removes_entry() {
            let pool = test_pool(false);
            pool.create_session("sess-1");
            pool.destroy_session("sess-1");
            assert!(pool.get(&Tenant::Session("sess-1".into())).is_none());
        }

        #[test]
        fn test_sessions_are_isolated() {
            let pool = test_pool(false);
            pool.create_session("a");
            pool.create_session("b");
            let ma = pool.get(&Tenant::Session("a".into())).unwrap();
            let mb = pool.get(&Tenant::Session("b".into())).unwrap();
            assert!(!Arc::ptr_eq(&ma, &mb));
        }
    }

    mod header_registry {
        use super::*;

        #[test]
        fn test_first_get_creates() {
            let pool = test_pool(false);
            assert!(pool.get(&Tenant::Header("k".into())).is_some());
        }

        #[test]
        fn test_same_key_same_manager() {
            let pool = test_pool(false);
            let a = pool.get(&Tenant::Header("k".into())).unwrap();
            let b = pool.get(&Tenant::Header("k".into())).unwrap();
            assert!(Arc::ptr_eq(&a, &b));
        }

        #[test]
        fn test_different_keys_different_managers() {
            let pool = test_pool(false);
            let a = pool.get(&Tenant::Header("k1".into())).unwrap();
            let b = pool.get(&Tenant::Header("k2".into())).unwrap();
            assert!(!Arc::ptr_eq(&a, &b));
        }

        #[test]
        fn test_empty_key_is_rejected() {
            let pool = test_pool(false);
            assert!(pool.get(&Tenant::Header(String::new())).is_none());
        }

        #[tokio::test(flavor = "multi_thread")]
        async fn test_concurrent_gets_observe_one_manager() {
            let pool = Pool::with_idle_timeout(false, key_store(), Duration::from_secs(300));
            let reference = pool.get(&Tenant::Header("shared-key".into())).unwrap();

            let mut handles = Vec::new();
            for _ in 0..50 {
                let pool = pool.clone();
                let reference = reference.clone();
                handles.push(tokio::spawn(async move {
                    for _ in 0..100 {
                        let mgr = pool.get(&Tenant::Header("shared-key".into())).unwrap();
                        assert!(Arc::ptr_eq(&mgr, &reference));
                    }
                }));
            }
            for handle in handles {
                handle.await.unwrap();
            }

            assert_eq!(pool.header_entries.read().len(), 1);
        }
    }

    mod reaping {
        use super::*;

        #[tokio::test]
        async fn test_idle_entry_is_reaped() {
            let pool = Pool::with_idle_timeout(false, key_store(), Duration::from_secs(60));
            pool.get(&Tenant::Header("idle".into())).unwrap();

            pool.force_expire("idle");
            pool.reap_once().await;

            assert!(pool.header_entries.read().is_empty());
        }

        #[tokio::test]
        async fn test_fresh_entry_survives() {
            let pool = Pool::with_idle_timeout(false, key_store(), Duration::from_secs(60));
            pool.get(&Tenant::Header("busy".into())).unwrap();

            pool.reap_once().await;

            assert_eq!(pool.header_entries.read().len(), 1);
        }

        #[tokio::test]
        async fn test_reaped_key_gets_a_fresh_manager() {
            let pool = Pool::with_idle_timeout(false, key_store(), Duration::from_secs(60));
            let before = pool.get(&Tenant::Header("k".into())).unwrap();

            pool.force_expire("k");
            pool.reap_once().await;

            let after = pool.get(&Tenant::Header("k".into())).unwrap();
            assert!(!Arc::ptr_eq(&before, &after));
        }

        #[tokio::test]
        async fn test_reap_pass_is_idempotent() {
            let pool = Pool::with_idle_timeout(false, key_store(), Duration::from_secs(60));
            pool.get(&Tenant::Header("k".into())).unwrap();
            pool.force_expire("k");

            pool.reap_once().await;
            pool.reap_once().await;

            assert!(pool.header_entries.read().is_empty());
        }

        #[tokio::test]
        async fn test_empty_pool_sleeps_longest() {
            let pool = Pool::with_idle_timeout(false, key_store(), Duration::from_secs(60));
            assert_eq!(pool.reap_once().await, MAX_REAP_INTERVAL);
        }

        #[tokio::test]
        async fn test_interval_tracks_next_expiry() {
            let pool = Pool::with_idle_timeout(false, key_store(), Duration::from_secs(20));
            pool.get(&Tenant::Header("k".into())).unwrap();
            let interval = pool.reap_once().await;
            assert!(interval >= MIN_REAP_INTERVAL);
            assert!(interval <= Duration::from_secs(21));
        }
    }

    mod shutdown {
        use super::*;

        #[tokio::test]
        async fn test_close_drains_registries() {
            let pool = test_pool(false);
            pool.create_session("s");
            pool.get(&Tenant::Header("k".into())).unwrap();

            pool.close().await;

            assert!(pool.sessions.read().is_empty());
            assert!(pool.header_entries.read().is_empty());
        }

        #[tokio::test]
        async fn test_close_is_idempotent() {
            let pool = test_pool(false);
            pool.close().await;
            pool.close().await;
        }

        #[tokio::test]
        async fn test_close_stops_the_reaper() {
            let pool = Pool::new(false, key_store());
            pool.close().await;
            assert!(pool.reaper_task.lock().is_none());
        }

        #[tokio::test]
        async fn test_close_global_pool() {
            let pool = test_pool(true);
            pool.get(&Tenant::Global).unwrap();
            pool.close().await;
        }
    }

    mod tenant_display {
        use super::*;

        #[test]
        fn test_rendering() {
            assert_eq!(Tenant::Global.to_string(), "global");
            assert_eq!(Tenant::Header("abc".into()).to_string(), "header:abc");
            assert_eq!(Tenant::Session("s1".into()).to_string(), "session:s1");
        }
    }
}
