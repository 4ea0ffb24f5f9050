//! Browser session lifecycle management.
//!
//! The manager owns every live browser in the process: pooling under global
//! and per-tenant limits, sharing by workflow run, health probes with
//! bounded recovery, idle reaping, persistence records, and artifact
//! accumulation. A session is single-owner while `in_use`; acquisition
//! serializes on a per-session lock with a bounded wait.

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};
use tracing::{info, warn};

use crate::driver::{BrowserDriver, DriverConfig, DriverHandle, PageHandle};
use crate::error::{ExecutionError, Result};
use crate::storage::{BlobStore, Storage};
use crate::types::{
    Artifact, ArtifactKind, BrowserSessionRecord, SessionHealth, SessionScope, SessionState,
};

#[derive(Debug, Clone)]
pub struct SessionPoolConfig {
    pub max_global: usize,
    pub max_per_tenant: usize,
    pub acquire_timeout: Duration,
    pub idle_ttl: Duration,
    pub max_recovery_attempts: u32,
    pub driver: DriverConfig,
}

impl Default for SessionPoolConfig {
    fn default() -> Self {
        Self {
            max_global: 100,
            max_per_tenant: 10,
            acquire_timeout: Duration::from_secs(30),
            idle_ttl: Duration::from_secs(15 * 60),
            max_recovery_attempts: 3,
            driver: DriverConfig::default(),
        }
    }
}

/// Outcome of a recovery pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairOutcome {
    /// A fresh page was opened; the holder may continue the current step.
    PageReplaced,
    /// The whole browser was relaunched; the holder must restart the step.
    SessionReplaced,
}

/// A live browser session. The manager owns the in-memory handle; the
/// storage layer owns the persistence record.
impl std::fmt::Debug for ManagedSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedSession")
            .field("id", &self.id)
            .field("tenant", &self.tenant)
            .field("scope", &self.scope)
            .field("run_ref", &self.run_ref)
            .field("state", &self.state())
            .field("generation", &self.generation())
            .finish()
    }
}

pub struct ManagedSession {
    pub id: String,
    pub tenant: String,
    pub scope: SessionScope,
    pub run_ref: Option<String>,
    state: Mutex<SessionState>,
    generation: AtomicU64,
    recovery_attempts: AtomicU32,
    handle: tokio::sync::RwLock<Option<Box<dyn DriverHandle>>>,
    page: tokio::sync::RwLock<Option<Arc<dyn PageHandle>>>,
    lock: Arc<tokio::sync::Mutex<()>>,
    holder: Mutex<Option<String>>,
    /// Survives lease drop; artifact attribution on release.
    last_holder: Mutex<Option<String>>,
    last_activity: Mutex<chrono::DateTime<Utc>>,
    /// Session-lifecycle events, materialized as a log artifact on release.
    events: Mutex<Vec<String>>,
    _global_permit: OwnedSemaphorePermit,
    _tenant_permit: OwnedSemaphorePermit,
}

impl ManagedSession {
    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn holder(&self) -> Option<String> {
        self.holder.lock().clone()
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock() = state;
        self.events.lock().push(format!("{} -> {:?}", Utc::now(), state));
    }

    fn touch(&self) {
        *self.last_activity.lock() = Utc::now();
    }

    fn idle_for(&self) -> Duration {
        (Utc::now() - *self.last_activity.lock())
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

/// Exclusive use of one session. Dropping the lease returns the session to
/// `active` and releases the per-session lock.
#[derive(Debug)]
pub struct SessionLease {
    session: Arc<ManagedSession>,
    _guard: OwnedMutexGuard<()>,
}

impl SessionLease {
    pub fn session_id(&self) -> &str {
        &self.session.id
    }

    pub fn session(&self) -> &Arc<ManagedSession> {
        &self.session
    }

    /// The session's current page, opened on first use.
    pub async fn page(&self) -> Result<Arc<dyn PageHandle>> {
        self.session.touch();
        {
            let page = self.session.page.read().await;
            if let Some(page) = page.as_ref() {
                return Ok(page.clone());
            }
        }
        let handle = self.session.handle.read().await;
        let handle = handle
            .as_ref()
            .ok_or_else(|| ExecutionError::PageUnresponsive("session has no browser".into()))?;
        let page = handle.new_page().await?;
        *self.session.page.write().await = Some(page.clone());
        Ok(page)
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        *self.session.holder.lock() = None;
        self.session.touch();
        if self.session.state() == SessionState::InUse {
            self.session.set_state(SessionState::Active);
        }
    }
}

type SessionKey = (SessionScope, String, String);

pub struct BrowserSessionManager {
    driver: Arc<dyn BrowserDriver>,
    storage: Arc<dyn Storage>,
    blob: Arc<dyn BlobStore>,
    config: SessionPoolConfig,
    sessions: RwLock<HashMap<String, Arc<ManagedSession>>>,
    by_key: RwLock<HashMap<SessionKey, String>>,
    global_permits: Arc<Semaphore>,
    tenant_permits: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl BrowserSessionManager {
    pub fn new(
        driver: Arc<dyn BrowserDriver>,
        storage: Arc<dyn Storage>,
        blob: Arc<dyn BlobStore>,
        config: SessionPoolConfig,
    ) -> Self {
        Self {
            driver,
            storage,
            blob,
            global_permits: Arc::new(Semaphore::new(config.max_global)),
            tenant_permits: Mutex::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
            by_key: RwLock::new(HashMap::new()),
            config,
        }
    }

    fn tenant_semaphore(&self, tenant: &str) -> Arc<Semaphore> {
        self.tenant_permits
            .lock()
            .entry(tenant.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.config.max_per_tenant)))
            .clone()
    }

    fn key(scope: SessionScope, tenant: &str, run_ref: Option<&str>) -> SessionKey {
        (scope, tenant.to_string(), run_ref.unwrap_or_default().to_string())
    }

    /// Find or create a session for `(scope, tenant, run_ref)` and lock it
    /// for exclusive use by `holder`. Bounded by the pool's acquire timeout.
    pub async fn acquire(
        &self,
        scope: SessionScope,
        tenant: &str,
        run_ref: Option<&str>,
        holder: &str,
    ) -> Result<SessionLease> {
        let deadline = tokio::time::Instant::now() + self.config.acquire_timeout;
        let existing = {
            let by_key = self.by_key.read();
            let sessions = self.sessions.read();
            by_key
                .get(&Self::key(scope, tenant, run_ref))
                .and_then(|id| sessions.get(id))
                .filter(|s| s.state().is_live())
                .cloned()
        };

        let session = match existing {
            Some(session) => session,
            None => self.create(scope, tenant, run_ref, None, deadline).await?,
        };

        let guard = tokio::time::timeout_at(deadline, session.lock.clone().lock_owned())
            .await
            .map_err(|_| ExecutionError::SessionAcquisitionTimeout(self.config.acquire_timeout))?;

        if session.state() == SessionState::Idle {
            session.set_state(SessionState::Active);
        }
        session.set_state(SessionState::InUse);
        *session.holder.lock() = Some(holder.to_string());
        *session.last_holder.lock() = Some(holder.to_string());
        session.touch();
        info!(session_id = %session.id, holder, "session acquired");
        Ok(SessionLease {
            session,
            _guard: guard,
        })
    }

    async fn create(
        &self,
        scope: SessionScope,
        tenant: &str,
        run_ref: Option<&str>,
        session_id: Option<String>,
        deadline: tokio::time::Instant,
    ) -> Result<Arc<ManagedSession>> {
        let timeout_err =
            || ExecutionError::SessionAcquisitionTimeout(self.config.acquire_timeout);
        let global_permit =
            tokio::time::timeout_at(deadline, self.global_permits.clone().acquire_owned())
                .await
                .map_err(|_| timeout_err())?
                .map_err(|_| ExecutionError::Internal("session pool closed".into()))?;
        let tenant_permit =
            tokio::time::timeout_at(deadline, self.tenant_semaphore(tenant).acquire_owned())
                .await
                .map_err(|_| timeout_err())?
                .map_err(|_| ExecutionError::Internal("session pool closed".into()))?;

        let handle =
            match tokio::time::timeout_at(deadline, self.driver.launch(&self.config.driver)).await
            {
                Ok(result) => result?,
                Err(_) => return Err(timeout_err()),
            };

        let mut record = BrowserSessionRecord::new(tenant, scope, run_ref.map(String::from));
        if let Some(id) = session_id {
            record.browser_session_id = id;
        }
        let session = Arc::new(ManagedSession {
            id: record.browser_session_id.clone(),
            tenant: tenant.to_string(),
            scope,
            run_ref: run_ref.map(String::from),
            state: Mutex::new(SessionState::Creating),
            generation: AtomicU64::new(0),
            recovery_attempts: AtomicU32::new(0),
            handle: tokio::sync::RwLock::new(Some(handle)),
            page: tokio::sync::RwLock::new(None),
            lock: Arc::new(tokio::sync::Mutex::new(())),
            holder: Mutex::new(None),
            last_holder: Mutex::new(None),
            last_activity: Mutex::new(Utc::now()),
            events: Mutex::new(Vec::new()),
            _global_permit: global_permit,
            _tenant_permit: tenant_permit,
        });
        session.set_state(SessionState::Active);
        self.storage.upsert_browser_session(&record, None).await?;

        self.sessions
            .write()
            .insert(session.id.clone(), session.clone());
        // Persistent sessions with no binding are addressed by their own id.
        let key = match (scope, run_ref) {
            (SessionScope::Persistent, None) => Self::key(scope, tenant, Some(&session.id)),
            _ => Self::key(scope, tenant, run_ref),
        };
        self.by_key.write().insert(key, session.id.clone());
        info!(session_id = %session.id, ?scope, tenant, "session created");
        Ok(session)
    }

    /// Create a standalone persistent session (REST surface entry point).
    pub async fn create_persistent(&self, tenant: &str, ttl: Duration) -> Result<String> {
        let deadline = tokio::time::Instant::now() + self.config.acquire_timeout;
        let session = self
            .create(SessionScope::Persistent, tenant, None, None, deadline)
            .await?;
        self.persist(&session.id, ttl).await?;
        Ok(session.id.clone())
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<ManagedSession>> {
        self.sessions.read().get(session_id).cloned()
    }

    pub fn live_count(&self) -> usize {
        self.sessions
            .read()
            .values()
            .filter(|s| s.state().is_live())
            .count()
    }

    /// Return a session to the pool or close it. Task-scoped sessions always
    /// close; shared and persistent sessions go idle unless `cleanup`.
    pub async fn release(&self, session_id: &str, cleanup: bool) -> Result<()> {
        let session = match self.get(session_id) {
            Some(session) => session,
            None => return Ok(()),
        };
        if cleanup || session.scope == SessionScope::Task {
            self.close_session(&session).await
        } else {
            session.set_state(SessionState::Idle);
            session.touch();
            Ok(())
        }
    }

    async fn close_session(&self, session: &Arc<ManagedSession>) -> Result<()> {
        self.materialize_artifacts(session).await;
        if let Some(handle) = session.handle.write().await.take() {
            let _ = handle.close().await;
        }
        *session.page.write().await = None;
        session.set_state(SessionState::Released);
        self.sessions.write().remove(&session.id);
        self.by_key.write().retain(|_, id| id != &session.id);
        info!(session_id = %session.id, "session released");
        Ok(())
    }

    /// Console output and lifecycle events become artifacts attributed to
    /// the last task or run that used the session.
    async fn materialize_artifacts(&self, session: &Arc<ManagedSession>) {
        let holder = session.last_holder.lock().clone();
        let run_ref = session.run_ref.clone();
        let console = {
            let page = session.page.read().await;
            match page.as_ref() {
                Some(page) => page.drain_console().await.unwrap_or_default(),
                None => Vec::new(),
            }
        };
        let events = std::mem::take(&mut *session.events.lock());
        for (kind, lines) in [
            (ArtifactKind::ConsoleLog, console),
            (ArtifactKind::Log, events),
        ] {
            if lines.is_empty() {
                continue;
            }
            let body = lines.join("\n");
            let uri = match self.blob.put(body.as_bytes(), "text/plain").await {
                Ok(uri) => uri,
                Err(e) => {
                    warn!("failed to store session artifact: {}", e);
                    continue;
                }
            };
            let mut artifact = Artifact::new(&session.tenant, kind, &uri, 0)
                .with_content("text/plain", body.len() as u64);
            if let Some(task_id) = &holder {
                artifact.task_id = Some(task_id.clone());
            }
            if session.scope == SessionScope::WorkflowRun {
                artifact.workflow_run_id = run_ref.clone();
            }
            if let Err(e) = self.storage.insert_artifact(&artifact).await {
                warn!("failed to record session artifact: {}", e);
            }
        }
    }

    /// Mark a session persistent so it survives task end.
    pub async fn persist(&self, session_id: &str, ttl: Duration) -> Result<()> {
        let session = self
            .get(session_id)
            .ok_or_else(|| ExecutionError::Validation(format!("unknown session {}", session_id)))?;
        let cookies = {
            let handle = session.handle.read().await;
            match handle.as_ref() {
                Some(handle) => handle.cookies().await.ok(),
                None => None,
            }
        };
        let mut record = BrowserSessionRecord::new(&session.tenant, SessionScope::Persistent, None);
        record.browser_session_id = session.id.clone();
        record.state = session.state();
        record.cookies = cookies;
        record.ttl_secs = Some(ttl.as_secs());
        self.storage.upsert_browser_session(&record, None).await?;
        self.by_key.write().retain(|_, id| id != &session.id);
        self.by_key.write().insert(
            Self::key(SessionScope::Persistent, &session.tenant, Some(&session.id)),
            session.id.clone(),
        );
        Ok(())
    }

    /// Relaunch persistent sessions recorded in storage, by identity: same
    /// session id, cookies restored, DOM state deliberately fresh.
    pub async fn restore_persistent(&self, tenant: &str) -> Result<usize> {
        let records = self.storage.list_persistent_sessions(tenant).await?;
        let mut restored = 0;
        for record in records {
            if self.get(&record.browser_session_id).is_some() {
                continue;
            }
            let deadline = tokio::time::Instant::now() + self.config.acquire_timeout;
            let session = self
                .create(
                    SessionScope::Persistent,
                    tenant,
                    Some(&record.browser_session_id),
                    Some(record.browser_session_id.clone()),
                    deadline,
                )
                .await?;
            if let Some(cookies) = &record.cookies {
                let handle = session.handle.read().await;
                if let Some(handle) = handle.as_ref() {
                    let _ = handle.restore_cookies(cookies).await;
                }
            }
            restored += 1;
        }
        Ok(restored)
    }

    pub async fn cleanup_for_task(&self, task_id: &str) {
        let targets: Vec<Arc<ManagedSession>> = self
            .sessions
            .read()
            .values()
            .filter(|s| s.scope == SessionScope::Task && s.run_ref.as_deref() == Some(task_id))
            .cloned()
            .collect();
        for session in targets {
            let _ = self.close_session(&session).await;
        }
    }

    pub async fn cleanup_for_workflow_run(&self, run_id: &str) {
        let targets: Vec<Arc<ManagedSession>> = self
            .sessions
            .read()
            .values()
            .filter(|s| {
                s.scope == SessionScope::WorkflowRun && s.run_ref.as_deref() == Some(run_id)
            })
            .cloned()
            .collect();
        for session in targets {
            let _ = self.close_session(&session).await;
        }
    }

    /// Probe driver, page and a trivial evaluation.
    pub async fn health_check(&self, session_id: &str) -> Result<SessionHealth> {
        let session = self
            .get(session_id)
            .ok_or_else(|| ExecutionError::Validation(format!("unknown session {}", session_id)))?;
        let driver_alive = {
            let handle = session.handle.read().await;
            match handle.as_ref() {
                Some(handle) => handle.is_alive().await,
                None => false,
            }
        };
        if !driver_alive {
            return Ok(SessionHealth::Unhealthy);
        }
        let page_ok = {
            let page = session.page.read().await;
            match page.as_ref() {
                Some(page) => matches!(
                    page.evaluate("1 + 1").await.ok().and_then(|v| v.as_i64()),
                    Some(2)
                ),
                None => false,
            }
        };
        Ok(if page_ok {
            SessionHealth::Healthy
        } else {
            SessionHealth::Degraded
        })
    }

    /// Bounded recovery: replace the page while the driver lives, otherwise
    /// relaunch the whole browser. After `max_recovery_attempts` the session
    /// is forced to `errored` and released.
    pub async fn repair(&self, session_id: &str) -> Result<RepairOutcome> {
        let session = self
            .get(session_id)
            .ok_or_else(|| ExecutionError::Validation(format!("unknown session {}", session_id)))?;
        let attempts = session.recovery_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempts > self.config.max_recovery_attempts {
            session.set_state(SessionState::Errored);
            self.close_session(&session).await?;
            return Err(ExecutionError::PageUnresponsive(format!(
                "session {} exhausted recovery attempts",
                session_id
            )));
        }

        let driver_alive = {
            let handle = session.handle.read().await;
            match handle.as_ref() {
                Some(handle) => handle.is_alive().await,
                None => false,
            }
        };

        if driver_alive {
            // Unresponsive page: open a fresh one, drop the old.
            let handle = session.handle.read().await;
            let handle = handle
                .as_ref()
                .ok_or_else(|| ExecutionError::PageUnresponsive("no browser handle".into()))?;
            let fresh = handle.new_page().await?;
            *session.page.write().await = Some(fresh);
            warn!(session_id, attempts, "session page replaced");
            Ok(RepairOutcome::PageReplaced)
        } else {
            // Dead driver: relaunch, preserving session identity.
            let fresh = self.driver.launch(&self.config.driver).await?;
            *session.handle.write().await = Some(fresh);
            *session.page.write().await = None;
            session.generation.fetch_add(1, Ordering::SeqCst);
            session.set_state(SessionState::Active);
            warn!(session_id, attempts, "session browser replaced");
            Ok(RepairOutcome::SessionReplaced)
        }
    }

    /// Close sessions idle past the pool TTL. Returns how many were closed.
    pub async fn reap_idle(&self) -> usize {
        let idle: Vec<Arc<ManagedSession>> = self
            .sessions
            .read()
            .values()
            .filter(|s| {
                matches!(s.state(), SessionState::Idle | SessionState::Active)
                    && s.holder().is_none()
                    && s.idle_for() >= self.config.idle_ttl
            })
            .cloned()
            .collect();
        let count = idle.len();
        for session in idle {
            let _ = self.close_session(&session).await;
        }
        count
    }

    /// Background reaper, one sweep a minute.
    pub fn spawn_idle_reaper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(60)).await;
                match manager.upgrade() {
                    Some(manager) => {
                        let reaped = manager.reap_idle().await;
                        if reaped > 0 {
                            info!(reaped, "idle sessions reaped");
                        }
                    }
                    None => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::fake::{FakeDriver, FakeSite};
    use crate::storage::{InMemoryBlobStore, InMemoryStorage};

    fn manager_with(config: SessionPoolConfig) -> (Arc<BrowserSessionManager>, Arc<FakeDriver>) {
        let driver = Arc::new(FakeDriver::new(FakeSite::new()));
        let manager = Arc::new(BrowserSessionManager::new(
            driver.clone(),
            Arc::new(InMemoryStorage::new()),
            Arc::new(InMemoryBlobStore::new()),
            config,
        ));
        (manager, driver)
    }

    #[tokio::test]
    async fn workflow_run_scope_shares_one_session() {
        let (manager, driver) = manager_with(SessionPoolConfig::default());
        let first = manager
            .acquire(SessionScope::WorkflowRun, "org_1", Some("wfr_1"), "task_a")
            .await
            .unwrap();
        let first_id = first.session_id().to_string();
        drop(first);
        let second = manager
            .acquire(SessionScope::WorkflowRun, "org_1", Some("wfr_1"), "task_b")
            .await
            .unwrap();
        assert_eq!(second.session_id(), first_id);
        assert_eq!(driver.launches(), 1);
    }

    #[tokio::test]
    async fn in_use_session_blocks_second_acquirer_until_release() {
        let (manager, _driver) = manager_with(SessionPoolConfig::default());
        let lease = manager
            .acquire(SessionScope::WorkflowRun, "org_1", Some("wfr_1"), "task_a")
            .await
            .unwrap();
        assert_eq!(lease.session().holder().as_deref(), Some("task_a"));

        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .acquire(SessionScope::WorkflowRun, "org_1", Some("wfr_1"), "task_b")
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished(), "second acquirer must wait");
        drop(lease);
        let second = waiter.await.unwrap().unwrap();
        assert_eq!(second.session().holder().as_deref(), Some("task_b"));
    }

    #[tokio::test]
    async fn exhausted_pool_times_out_acquisition() {
        let config = SessionPoolConfig {
            max_global: 1,
            acquire_timeout: Duration::from_millis(150),
            ..SessionPoolConfig::default()
        };
        let (manager, _driver) = manager_with(config);
        let _held = manager
            .acquire(SessionScope::Task, "org_1", Some("task_a"), "task_a")
            .await
            .unwrap();
        let err = manager
            .acquire(SessionScope::Task, "org_1", Some("task_b"), "task_b")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "SESSION_ACQUISITION_TIMEOUT");
    }

    #[tokio::test]
    async fn task_scope_closes_on_release() {
        let (manager, _driver) = manager_with(SessionPoolConfig::default());
        let lease = manager
            .acquire(SessionScope::Task, "org_1", Some("task_a"), "task_a")
            .await
            .unwrap();
        let id = lease.session_id().to_string();
        drop(lease);
        manager.release(&id, false).await.unwrap();
        assert!(manager.get(&id).is_none());
        assert_eq!(manager.live_count(), 0);
    }

    #[tokio::test]
    async fn repair_replaces_dead_browser_and_reports_replacement() {
        let (manager, driver) = manager_with(SessionPoolConfig::default());
        let lease = manager
            .acquire(SessionScope::WorkflowRun, "org_1", Some("wfr_1"), "task_a")
            .await
            .unwrap();
        let id = lease.session_id().to_string();
        let generation = lease.session().generation();
        let _ = lease.page().await.unwrap();
        driver.last_handle().unwrap().kill();

        let outcome = manager.repair(&id).await.unwrap();
        assert_eq!(outcome, RepairOutcome::SessionReplaced);
        assert_eq!(lease.session().generation(), generation + 1);
        assert_eq!(driver.launches(), 2);
        // Health is degraded until a page is opened, then healthy.
        assert_eq!(
            manager.health_check(&id).await.unwrap(),
            SessionHealth::Degraded
        );
        let _ = lease.page().await.unwrap();
        assert_eq!(
            manager.health_check(&id).await.unwrap(),
            SessionHealth::Healthy
        );
    }

    #[tokio::test]
    async fn repair_is_bounded() {
        let config = SessionPoolConfig {
            max_recovery_attempts: 2,
            ..SessionPoolConfig::default()
        };
        let (manager, _driver) = manager_with(config);
        let lease = manager
            .acquire(SessionScope::WorkflowRun, "org_1", Some("wfr_1"), "task_a")
            .await
            .unwrap();
        let id = lease.session_id().to_string();
        drop(lease);
        assert!(manager.repair(&id).await.is_ok());
        assert!(manager.repair(&id).await.is_ok());
        let err = manager.repair(&id).await.unwrap_err();
        assert_eq!(err.code(), "PAGE_UNRESPONSIVE");
        assert!(manager.get(&id).is_none(), "exhausted session is released");
    }

    #[tokio::test]
    async fn idle_reaper_closes_stale_sessions() {
        let config = SessionPoolConfig {
            idle_ttl: Duration::ZERO,
            ..SessionPoolConfig::default()
        };
        let (manager, _driver) = manager_with(config);
        let lease = manager
            .acquire(SessionScope::WorkflowRun, "org_1", Some("wfr_1"), "task_a")
            .await
            .unwrap();
        let id = lease.session_id().to_string();
        drop(lease);
        assert_eq!(manager.reap_idle().await, 1);
        assert!(manager.get(&id).is_none());
    }

    #[tokio::test]
    async fn persist_then_restore_preserves_identity() {
        let (manager, driver) = manager_with(SessionPoolConfig::default());
        let lease = manager
            .acquire(SessionScope::WorkflowRun, "org_1", Some("wfr_1"), "task_a")
            .await
            .unwrap();
        let id = lease.session_id().to_string();
        drop(lease);
        manager.persist(&id, Duration::from_secs(600)).await.unwrap();

        // Simulate a process restart: drop the live handle.
        let session = manager.get(&id).unwrap();
        manager.close_session(&session).await.unwrap();
        assert!(manager.get(&id).is_none());

        let restored = manager.restore_persistent("org_1").await.unwrap();
        assert_eq!(restored, 1);
        assert!(driver.launches() >= 2);
        assert!(manager.get(&id).is_some(), "identity is preserved across restart");
    }
}
