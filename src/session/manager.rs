//! Session manager: concurrent session cache plus its two background sweeps.
//!
//! # Background tasks
//!
//! - **Refresh** ([`SessionManager::spawn_refresh_task`], weekly by default):
//!   re-verifies every certificate referenced by a live session, and every
//!   thing association, against the identity source of truth. Cloud outages
//!   never close sessions; a session is only closed on a verified negative
//!   answer or when its certificate can no longer be read from disk.
//! - **Idle expiry** ([`SessionManager::spawn_idle_expiry_task`], every 20
//!   minutes by default): closes sessions not visited within the idle
//!   timeout.
//!
//! Both tasks stop when the shutdown channel fires; their `JoinHandle`s are
//! returned to the owner.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Session, SessionCache};
use crate::certificate::device_store::DeviceCertificateStore;
use crate::certificate::helper::certificate_hash;
use crate::iot::{Certificate, IotAuthClient};
use crate::{Error, Result};

/// Default maximum number of live sessions.
pub const DEFAULT_SESSION_CAPACITY: usize = 1000;

/// Largest accepted session capacity.
pub const MAX_SESSION_CAPACITY: usize = 2_147_483_646;

/// Default interval of the refresh sweep (one week).
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Default interval of the idle-expiry sweep.
pub const DEFAULT_IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(20 * 60);

/// Default inactivity threshold after which a session is closed.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Concurrent, capacity-bounded session store.
pub struct SessionManager {
    cache: Mutex<SessionCache>,
    capacity: AtomicUsize,
    iot_client: Arc<dyn IotAuthClient>,
    device_certificates: Arc<DeviceCertificateStore>,
}

impl SessionManager {
    /// Create a manager with the default capacity.
    #[must_use]
    pub fn new(
        iot_client: Arc<dyn IotAuthClient>,
        device_certificates: Arc<DeviceCertificateStore>,
    ) -> Self {
        Self {
            cache: Mutex::new(SessionCache::new()),
            capacity: AtomicUsize::new(DEFAULT_SESSION_CAPACITY),
            iot_client,
            device_certificates,
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Cache operations
    // ─────────────────────────────────────────────────────────────────────

    /// Look up a session, refreshing its last-visit time.
    pub fn find_session(&self, session_id: &str) -> Option<Arc<Session>> {
        self.cache.lock().get_and_touch(session_id, Instant::now())
    }

    /// Store `session` under a fresh id and return the id.
    ///
    /// Evicts least recently used sessions if the cache is over capacity.
    pub fn create_session(&self, session: Session) -> String {
        let session = Arc::new(session);
        loop {
            let session_id = Uuid::new_v4().to_string();
            let capacity = self.session_capacity();
            let inserted = self.cache.lock().insert(
                session_id.clone(),
                Arc::clone(&session),
                Instant::now(),
                capacity,
            );
            match inserted {
                Some(evicted) => {
                    for id in evicted {
                        info!(session_id = %id, capacity, "Evicted least recently used session");
                    }
                    debug!(session_id = %session_id, "Created session");
                    return session_id;
                }
                None => debug!(session_id = %session_id, "Session id collision, retrying"),
            }
        }
    }

    /// Close a session.
    ///
    /// # Errors
    ///
    /// Returns `Error::SessionNotFound` if no live session has this id.
    pub fn close_session(&self, session_id: &str) -> Result<()> {
        if self.cache.lock().remove(session_id).is_none() {
            return Err(Error::SessionNotFound(format!(
                "No session is associated with session id ({session_id})"
            )));
        }
        info!(session_id = %session_id, "Closed session");
        Ok(())
    }

    /// Number of live sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.cache.lock().len()
    }

    /// Current capacity.
    #[must_use]
    pub fn session_capacity(&self) -> usize {
        self.capacity.load(Ordering::Acquire)
    }

    /// Change the capacity; applies from the next insert.
    ///
    /// Values outside `1..=MAX_SESSION_CAPACITY` are clamped with a warning.
    pub fn set_session_capacity(&self, capacity: usize) {
        let clamped = capacity.clamp(1, MAX_SESSION_CAPACITY);
        if clamped != capacity {
            warn!(
                requested = capacity,
                applied = clamped,
                "Session capacity out of range, clamping"
            );
        }
        self.capacity.store(clamped, Ordering::Release);
        debug!(capacity = clamped, "Session capacity updated");
    }

    /// Remove `session_id` only while it still maps to `session`.
    fn close_if_same(&self, session_id: &str, session: &Arc<Session>, reason: &str) -> bool {
        let removed = self.cache.lock().remove_if_same(session_id, session);
        if removed {
            info!(session_id = %session_id, reason, "Closed session");
        }
        removed
    }

    // ─────────────────────────────────────────────────────────────────────
    // Refresh
    // ─────────────────────────────────────────────────────────────────────

    /// Re-verify every live session against the identity source of truth.
    ///
    /// Failures are isolated per certificate and per session.
    pub async fn refresh_sessions(&self) {
        let snapshot = self.cache.lock().snapshot();

        let mut by_certificate: HashMap<String, Vec<(String, Arc<Session>)>> = HashMap::new();
        for (id, session) in snapshot {
            if let Some(cert) = session.certificate() {
                by_certificate
                    .entry(cert.certificate_hash.clone())
                    .or_default()
                    .push((id, session));
            }
        }

        debug!(certificates = by_certificate.len(), "Refreshing sessions");

        for (hash, sessions) in by_certificate {
            self.refresh_certificate_sessions(&hash, &sessions).await;
        }
    }

    async fn refresh_certificate_sessions(&self, hash: &str, sessions: &[(String, Arc<Session>)]) {
        let pem = match self.device_certificates.load_device_certificate(hash) {
            Ok(Some(pem)) if certificate_hash(&pem) == hash => pem,
            Ok(Some(_)) => {
                warn!(certificate_hash = %hash, "Stored certificate does not match its hash");
                self.close_all(sessions, "stored certificate corrupted");
                return;
            }
            Ok(None) => {
                warn!(certificate_hash = %hash, "Stored certificate missing");
                self.close_all(sessions, "stored certificate missing");
                return;
            }
            Err(e) => {
                warn!(certificate_hash = %hash, error = %e, "Unable to read stored certificate");
                self.close_all(sessions, "stored certificate unreadable");
                return;
            }
        };

        let certificate_id = match self.iot_client.get_active_certificate_id(&pem).await {
            Ok(Some(id)) => id,
            Ok(None) => {
                self.close_all(sessions, "certificate no longer active");
                return;
            }
            Err(e) => {
                warn!(
                    certificate_hash = %hash,
                    error = %e,
                    "Unable to verify certificate with cloud, assuming sessions remain valid"
                );
                return;
            }
        };

        let certificate = Certificate::active(hash, certificate_id);
        for (id, session) in sessions {
            let Some(thing) = session.thing() else {
                continue;
            };
            match self
                .iot_client
                .is_thing_attached_to_certificate(thing, &certificate)
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    self.close_if_same(id, session, "thing detached from certificate");
                }
                Err(e) => warn!(
                    session_id = %id,
                    thing = %thing.thing_name(),
                    error = %e,
                    "Unable to verify thing attachment with cloud, assuming session remains valid"
                ),
            }
        }
    }

    /// Returns how many of `sessions` were still live and got closed.
    fn close_all(&self, sessions: &[(String, Arc<Session>)], reason: &str) -> usize {
        sessions
            .iter()
            .filter(|(id, session)| self.close_if_same(id, session, reason))
            .count()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Idle expiry
    // ─────────────────────────────────────────────────────────────────────

    /// Close sessions not visited within `idle_timeout`. Returns how many.
    pub fn close_idle_sessions(&self, idle_timeout: Duration) -> usize {
        let now = Instant::now();
        let idle = self.cache.lock().idle_since(now, idle_timeout);
        self.close_all(&idle, "idle timeout")
    }

    // ─────────────────────────────────────────────────────────────────────
    // Background tasks
    // ─────────────────────────────────────────────────────────────────────

    /// Spawn the refresh sweep. The first pass runs immediately.
    pub fn spawn_refresh_task(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        manager.refresh_sessions().await;
                    }
                    _ = shutdown.recv() => {
                        debug!("Session refresh task shutting down");
                        break;
                    }
                }
            }
        })
    }

    /// Spawn the idle-expiry sweep.
    pub fn spawn_idle_expiry_task(
        self: &Arc<Self>,
        interval: Duration,
        idle_timeout: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let closed = manager.close_idle_sessions(idle_timeout);
                        if closed > 0 {
                            debug!(count = closed, "Closed idle sessions");
                        }
                    }
                    _ = shutdown.recv() => {
                        debug!("Session idle-expiry task shutting down");
                        break;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iot::{InMemoryIotRegistry, Thing};

    const PEM_A: &str = "-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n";
    const PEM_B: &str = "-----BEGIN CERTIFICATE-----\nBBBB\n-----END CERTIFICATE-----\n";

    struct Fixture {
        _dir: tempfile::TempDir,
        registry: Arc<InMemoryIotRegistry>,
        manager: Arc<SessionManager>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(InMemoryIotRegistry::new());
        let store = Arc::new(DeviceCertificateStore::new(dir.path()));
        let manager = Arc::new(SessionManager::new(registry.clone(), store));
        Fixture {
            _dir: dir,
            registry,
            manager,
        }
    }

    /// Store the PEM, register it active and open a session on it.
    fn open(f: &Fixture, pem: &str, cert_id: &str, thing: Option<&str>) -> String {
        let hash = certificate_hash(pem);
        f.manager
            .device_certificates
            .store_device_certificate_if_absent(&hash, pem)
            .unwrap();
        f.registry.register_certificate(pem, cert_id);
        let mut session = Session::for_certificate(Certificate::active(hash, cert_id));
        if let Some(name) = thing {
            f.registry.attach_thing(name, cert_id);
            session = session.with_thing(Thing::of(name).unwrap());
        }
        f.manager.create_session(session)
    }

    #[test]
    fn create_then_find_returns_same_session() {
        let f = fixture();
        let id = open(&f, PEM_A, "a", None);

        let found = f.manager.find_session(&id).unwrap();

        assert_eq!(found.certificate().unwrap().certificate_id, "a");
        assert!(f.manager.find_session("unknown").is_none());
    }

    #[test]
    fn closing_twice_fails_the_second_time() {
        let f = fixture();
        let id = open(&f, PEM_A, "a", None);

        assert!(f.manager.close_session(&id).is_ok());
        let err = f.manager.close_session(&id).unwrap_err();

        assert!(matches!(err, Error::SessionNotFound(_)));
        assert!(err.to_string().contains(&id));
    }

    #[test]
    fn capacity_is_clamped_and_enforced() {
        let f = fixture();
        f.manager.set_session_capacity(0);
        assert_eq!(f.manager.session_capacity(), 1);

        let first = open(&f, PEM_A, "a", None);
        let second = open(&f, PEM_B, "b", None);

        assert_eq!(f.manager.session_count(), 1);
        assert!(f.manager.find_session(&first).is_none());
        assert!(f.manager.find_session(&second).is_some());
    }

    #[test]
    fn accessed_session_survives_eviction_round() {
        let f = fixture();
        f.manager.set_session_capacity(2);
        let a = open(&f, PEM_A, "a", None);
        let b = open(&f, PEM_B, "b", None);

        f.manager.find_session(&a);
        let c = open(&f, PEM_A, "a", None);

        assert!(f.manager.find_session(&a).is_some());
        assert!(f.manager.find_session(&b).is_none());
        assert!(f.manager.find_session(&c).is_some());
    }

    #[tokio::test]
    async fn refresh_closes_all_sessions_of_inactive_certificate() {
        // GIVEN: two sessions on A, one on B
        let f = fixture();
        let a1 = open(&f, PEM_A, "a", None);
        let a2 = open(&f, PEM_A, "a", None);
        let b = open(&f, PEM_B, "b", None);

        // WHEN: A is deactivated in the cloud
        f.registry.deactivate_certificate(PEM_A);
        f.manager.refresh_sessions().await;

        // THEN
        assert!(f.manager.find_session(&a1).is_none());
        assert!(f.manager.find_session(&a2).is_none());
        assert!(f.manager.find_session(&b).is_some());
    }

    #[tokio::test]
    async fn refresh_keeps_sessions_when_cloud_unreachable() {
        let f = fixture();
        let a = open(&f, PEM_A, "a", Some("thing-a"));
        f.registry.deactivate_certificate(PEM_A);
        f.registry.set_offline(true);

        f.manager.refresh_sessions().await;

        assert!(f.manager.find_session(&a).is_some());
    }

    #[tokio::test]
    async fn refresh_closes_only_session_with_detached_thing() {
        // GIVEN: two sessions on the same certificate with different things
        let f = fixture();
        let s1 = open(&f, PEM_A, "a", Some("t1"));
        let s2 = open(&f, PEM_A, "a", Some("t2"));

        // WHEN: t1 is detached
        f.registry.detach_thing("t1", "a");
        f.manager.refresh_sessions().await;

        // THEN
        assert!(f.manager.find_session(&s1).is_none());
        assert!(f.manager.find_session(&s2).is_some());
    }

    #[tokio::test]
    async fn refresh_closes_sessions_when_stored_certificate_missing() {
        let f = fixture();
        let session = Session::for_certificate(Certificate::active("deadbeef", "x"));
        let id = f.manager.create_session(session);

        f.manager.refresh_sessions().await;

        assert!(f.manager.find_session(&id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_sessions_are_closed() {
        let f = fixture();
        let stale = open(&f, PEM_A, "a", None);

        tokio::time::advance(Duration::from_secs(50 * 60)).await;
        let fresh = open(&f, PEM_B, "b", None);
        tokio::time::advance(Duration::from_secs(15 * 60)).await;

        let closed = f.manager.close_idle_sessions(DEFAULT_IDLE_TIMEOUT);

        assert_eq!(closed, 1);
        assert!(f.manager.find_session(&stale).is_none());
        assert!(f.manager.find_session(&fresh).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_count_excludes_sessions_closed_meanwhile() {
        // GIVEN: two idle sessions collected for closing
        let f = fixture();
        let a = open(&f, PEM_A, "a", None);
        let b = open(&f, PEM_B, "b", None);
        tokio::time::advance(DEFAULT_IDLE_TIMEOUT + Duration::from_secs(1)).await;
        let idle = f.manager.cache.lock().idle_since(Instant::now(), DEFAULT_IDLE_TIMEOUT);

        // WHEN: one is closed by a device before the sweep removes it
        f.manager.close_session(&a).unwrap();
        let closed = f.manager.close_all(&idle, "idle timeout");

        // THEN
        assert_eq!(closed, 1);
        assert!(f.manager.find_session(&b).is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_sessions_respect_capacity() {
        // GIVEN: a small cache shared by many tasks
        const CAPACITY: usize = 4;
        let f = fixture();
        f.manager.set_session_capacity(CAPACITY);

        // WHEN: every task creates, looks up and closes its own sessions
        let tasks = (0..16).map(|i| {
            let manager = Arc::clone(&f.manager);
            tokio::spawn(async move {
                for round in 0..50 {
                    let session = Session::for_certificate(Certificate::active(
                        format!("hash-{i}-{round}"),
                        format!("cert-{i}"),
                    ));
                    let id = manager.create_session(session);
                    assert!(manager.session_count() <= CAPACITY);
                    manager.find_session(&id);

                    // evicted sessions fail the first close too
                    if manager.close_session(&id).is_ok() {
                        assert!(matches!(
                            manager.close_session(&id),
                            Err(Error::SessionNotFound(_))
                        ));
                    }
                    tokio::task::yield_now().await;
                }
            })
        });

        // THEN
        for result in futures::future::join_all(tasks).await {
            result.unwrap();
        }
        assert_eq!(f.manager.session_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_task_stops_on_shutdown() {
        let f = fixture();
        let (tx, _) = broadcast::channel(1);
        let handle = f.manager.spawn_idle_expiry_task(
            DEFAULT_IDLE_SWEEP_INTERVAL,
            DEFAULT_IDLE_TIMEOUT,
            tx.subscribe(),
        );

        tx.send(()).unwrap();

        handle.await.unwrap();
    }
}
