use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use casetrack_storage_core::{
    reduce, CapabilityProvider, DirectoryCapability, ErrorClass, ErrorNotice,
    ExternalChangeEvent, HandleStore, LifecycleEvent, LifecycleState, PermissionState, Severity,
    SnapshotSource, StatusSnapshot, StoreError, WriteOptions, WriteReport, WriteTask,
};
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, watch, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::autosave::AutosavePlan;
use crate::backup::BackupManager;
use crate::config::EngineConfig;
use crate::executor::WriteExecutor;
use crate::instance_lock::InstanceLock;
use crate::permission::PermissionCoordinator;
use crate::watcher::DocumentWatcher;

/// Everything tied to one connected folder.
struct Session {
    capability: Arc<dyn DirectoryCapability>,
    executor: Arc<WriteExecutor>,
    backup: Arc<BackupManager>,
    watcher: Arc<DocumentWatcher>,
    _instance_lock: InstanceLock,
    stop_tx: watch::Sender<bool>,
    driver: Option<JoinHandle<()>>,
}

struct EngineState {
    lifecycle: LifecycleState,
    permission: PermissionState,
    session: Option<Session>,
    save_count: u64,
    last_save_at: Option<DateTime<Utc>>,
    last_error: Option<ErrorNotice>,
}

struct EngineInner {
    config: EngineConfig,
    provider: Arc<dyn CapabilityProvider>,
    handle_store: Arc<dyn HandleStore>,
    source: Arc<dyn SnapshotSource>,
    state: AsyncMutex<EngineState>,
    plan: StdMutex<AutosavePlan>,
    /// Wakes the driver when the plan changes.
    wake: Notify,
    /// Serializes every writer and reader against the physical write call.
    /// Holding this gate is what makes the single-writer invariant hold.
    write_gate: AsyncMutex<()>,
    status_tx: watch::Sender<StatusSnapshot>,
    failures_tx: broadcast::Sender<ErrorNotice>,
    changes_tx: broadcast::Sender<ExternalChangeEvent>,
}

/// The local persistence engine.
///
/// Composes the capability, handle store, backup manager, write executor,
/// autosave scheduler, and change watcher behind a small facade. Every
/// public method is safe to call before a folder is connected: it fails with
/// a typed [`StoreError::NotConnected`] instead of panicking, so callers can
/// treat connection state as data.
#[derive(Clone)]
pub struct StorageEngine {
    inner: Arc<EngineInner>,
}

impl StorageEngine {
    pub fn new(
        config: EngineConfig,
        provider: Arc<dyn CapabilityProvider>,
        handle_store: Arc<dyn HandleStore>,
        source: Arc<dyn SnapshotSource>,
    ) -> Self {
        let (status_tx, _) = watch::channel(StatusSnapshot::default());
        let (failures_tx, _) = broadcast::channel(64);
        let (changes_tx, _) = broadcast::channel(64);
        let plan = AutosavePlan::new(config.autosave);

        Self {
            inner: Arc::new(EngineInner {
                config,
                provider,
                handle_store,
                source,
                state: AsyncMutex::new(EngineState {
                    lifecycle: LifecycleState::Idle,
                    permission: PermissionState::Unknown,
                    session: None,
                    save_count: 0,
                    last_save_at: None,
                    last_error: None,
                }),
                plan: StdMutex::new(plan),
                wake: Notify::new(),
                write_gate: AsyncMutex::new(()),
                status_tx,
                failures_tx,
                changes_tx,
            }),
        }
    }

    /// Connect to a folder in response to a user gesture.
    ///
    /// Acquires a fresh capability, requests permission (which may probe the
    /// folder), and establishes the session. Already connected is a no-op.
    #[instrument(skip(self))]
    pub async fn connect(&self) -> Result<(), StoreError> {
        if self.inner.state.lock().await.session.is_some() {
            return Ok(());
        }
        self.inner
            .apply_event(LifecycleEvent::ConnectRequested, "connect")
            .await;

        let capability = match self.inner.provider.acquire().await {
            Ok(capability) => capability,
            Err(e) => {
                self.inner
                    .apply_event(
                        LifecycleEvent::PermissionDenied {
                            message: e.to_string(),
                        },
                        "connect",
                    )
                    .await;
                return Err(e);
            }
        };

        let coordinator = PermissionCoordinator::new(capability.clone());
        let permission = coordinator.request().await;
        self.inner.set_permission(permission).await;

        match permission {
            PermissionState::Granted => {
                self.inner
                    .apply_event(LifecycleEvent::PermissionGranted, "connect")
                    .await;
            }
            PermissionState::Denied => {
                let err = StoreError::PermissionDenied(format!(
                    "access to {} was refused",
                    capability.display_name()
                ));
                self.inner
                    .apply_event(
                        LifecycleEvent::PermissionDenied {
                            message: err.to_string(),
                        },
                        "connect",
                    )
                    .await;
                return Err(err);
            }
            PermissionState::Unknown => {
                let err = StoreError::Io(format!(
                    "permission for {} could not be determined",
                    capability.display_name()
                ));
                self.inner
                    .apply_event(
                        LifecycleEvent::ConnectFailed {
                            message: err.to_string(),
                        },
                        "connect",
                    )
                    .await;
                return Err(err);
            }
        }

        self.establish_session(capability, true).await
    }

    /// Silently reconnect to the folder remembered by the handle store.
    ///
    /// Never prompts: only the non-intrusive permission check runs, so this
    /// is safe to call at application start. A record that no longer
    /// resolves is deleted.
    #[instrument(skip(self))]
    pub async fn connect_to_existing(&self) -> Result<(), StoreError> {
        if self.inner.state.lock().await.session.is_some() {
            return Ok(());
        }
        let Some(record) = self.inner.handle_store.load().await else {
            return Err(StoreError::NotConnected);
        };
        self.inner
            .apply_event(LifecycleEvent::ConnectRequested, "connect")
            .await;

        let capability = match self.inner.provider.restore(&record).await {
            Ok(capability) => capability,
            Err(e) => {
                // The stored capability is permanently invalid; forget it.
                if let Err(ce) = self.inner.handle_store.clear().await {
                    warn!("failed to clear stale handle record: {}", ce);
                }
                self.inner
                    .apply_event(
                        LifecycleEvent::PermissionDenied {
                            message: e.to_string(),
                        },
                        "connect",
                    )
                    .await;
                return Err(e);
            }
        };

        let coordinator = PermissionCoordinator::new(capability.clone());
        let permission = coordinator.verify().await;
        self.inner.set_permission(permission).await;

        if permission != PermissionState::Granted {
            let err = StoreError::PermissionDenied(format!(
                "stored folder {} needs a fresh grant",
                record.display_name
            ));
            self.inner
                .apply_event(
                    LifecycleEvent::PermissionDenied {
                        message: err.to_string(),
                    },
                    "connect",
                )
                .await;
            return Err(err);
        }
        self.inner
            .apply_event(LifecycleEvent::PermissionGranted, "connect")
            .await;

        self.establish_session(capability, false).await
    }

    /// Re-request access after the capability was revoked mid-session.
    ///
    /// Called in direct response to a user gesture while the engine is
    /// recovering. On success the engine returns to ready and pending
    /// changes are flushed by the scheduler.
    #[instrument(skip(self))]
    pub async fn retry_permission(&self) -> Result<(), StoreError> {
        let capability = {
            let st = self.inner.state.lock().await;
            match (&st.session, st.lifecycle) {
                (Some(session), LifecycleState::Recovering) => session.capability.clone(),
                (Some(_), _) => return Ok(()),
                (None, _) => return Err(StoreError::NotConnected),
            }
        };

        let coordinator = PermissionCoordinator::new(capability.clone());
        let permission = coordinator.request().await;

        let mut st = self.inner.state.lock().await;
        st.permission = permission;
        if permission == PermissionState::Granted {
            self.inner
                .apply_event_locked(&mut st, LifecycleEvent::PermissionGranted, "reconnect");
            drop(st);
            self.inner.wake.notify_one();
            Ok(())
        } else {
            let err = StoreError::PermissionDenied(format!(
                "access to {} still refused",
                capability.display_name()
            ));
            // The reducer keeps the state in recovering.
            self.inner.apply_event_locked(
                &mut st,
                LifecycleEvent::PermissionDenied {
                    message: err.to_string(),
                },
                "reconnect",
            );
            Err(err)
        }
    }

    /// Disconnect on user request: stop timers, release the folder, and
    /// forget the stored handle. Does not flush; callers needing guaranteed
    /// persistence call [`StorageEngine::save_now`] first and await it.
    #[instrument(skip(self))]
    pub async fn disconnect(&self) -> Result<(), StoreError> {
        self.teardown(true, "disconnect").await
    }

    /// Tear the engine down on application exit, keeping the stored handle
    /// so the next start can reconnect silently.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> Result<(), StoreError> {
        self.teardown(false, "shutdown").await
    }

    /// Read the current on-disk document.
    ///
    /// Returns `Ok(None)` when no document exists yet. Malformed content is
    /// surfaced as [`StoreError::Corrupt`]; recovery policy (e.g. falling
    /// back to a backup artifact) belongs to the calling layer.
    #[instrument(skip(self))]
    pub async fn read(&self) -> Result<Option<Vec<u8>>, StoreError> {
        let capability = self.inner.session_capability().await?;
        let _gate = self.inner.write_gate.lock().await;

        match capability
            .read_file(&self.inner.config.document_name)
            .await?
        {
            None => Ok(None),
            Some(bytes) => {
                if serde_json::from_slice::<serde_json::Value>(&bytes).is_err() {
                    return Err(StoreError::Corrupt(format!(
                        "{} is not valid JSON",
                        self.inner.config.document_name
                    )));
                }
                Ok(Some(bytes))
            }
        }
    }

    /// Persist the given document bytes.
    ///
    /// A destructive write (import/migration/clear) first copies the current
    /// on-disk document to a timestamped backup; the backup is best-effort
    /// and never blocks the write.
    #[instrument(skip(self, document), fields(bytes = document.len(), destructive = options.destructive))]
    pub async fn write(&self, document: Vec<u8>, options: WriteOptions) -> Result<(), StoreError> {
        let operation = if options.destructive { "import" } else { "write" };
        self.inner
            .explicit_flush(Some(document), options.destructive, operation)
            .await
            .map(|_| ())
    }

    /// List file names in the connected folder.
    #[instrument(skip(self))]
    pub async fn list_files(&self) -> Result<Vec<String>, StoreError> {
        let capability = self.inner.session_capability().await?;
        let _gate = self.inner.write_gate.lock().await;
        capability.list_files().await
    }

    /// Record that the in-memory document changed.
    ///
    /// Collaborators call this after every mutation they want persisted; the
    /// scheduler coalesces bursts and pulls the latest snapshot when a write
    /// actually fires.
    pub async fn notify_change(&self) -> Result<(), StoreError> {
        {
            let st = self.inner.state.lock().await;
            match (&st.session, st.lifecycle) {
                (Some(_), LifecycleState::Ready | LifecycleState::Recovering) => {}
                _ => return Err(StoreError::NotConnected),
            }
        }
        self.inner
            .plan
            .lock()
            .unwrap()
            .record_change(Instant::now());
        self.inner.wake.notify_one();
        self.inner.broadcast_current().await;
        Ok(())
    }

    /// Write the latest snapshot immediately, bypassing both timers.
    ///
    /// Queues behind any in-flight write rather than racing it.
    #[instrument(skip(self))]
    pub async fn save_now(&self) -> Result<(), StoreError> {
        self.inner
            .explicit_flush(None, false, "manual save")
            .await
            .map(|_| ())
    }

    /// Poll for a document change made outside this engine, e.g. after the
    /// application regains focus. Detected changes are also pushed to
    /// event subscribers.
    #[instrument(skip(self))]
    pub async fn check_external_changes(
        &self,
    ) -> Result<Option<ExternalChangeEvent>, StoreError> {
        let watcher = {
            let st = self.inner.state.lock().await;
            match &st.session {
                Some(session) => session.watcher.clone(),
                None => return Err(StoreError::NotConnected),
            }
        };
        let change = watcher.check_for_changes(&self.inner.config.document_name);
        if let Some(change) = &change {
            let _ = self.inner.changes_tx.send(change.clone());
        }
        Ok(change)
    }

    /// Current status. Point-in-time and immutable.
    pub fn status(&self) -> StatusSnapshot {
        self.inner.status_tx.borrow().clone()
    }

    /// Subscribe to status snapshots. Each state-changing event replaces the
    /// snapshot wholesale; dropping the receiver unsubscribes.
    pub fn subscribe_status(&self) -> watch::Receiver<StatusSnapshot> {
        self.inner.status_tx.subscribe()
    }

    /// Subscribe to terminal failure notices (retries exhausted, permission
    /// lost). Dropping the receiver unsubscribes.
    pub fn subscribe_failures(&self) -> broadcast::Receiver<ErrorNotice> {
        self.inner.failures_tx.subscribe()
    }

    /// Subscribe to document changes made by something other than this
    /// engine's own writes. Dropping the receiver unsubscribes.
    pub fn subscribe_external_changes(&self) -> broadcast::Receiver<ExternalChangeEvent> {
        self.inner.changes_tx.subscribe()
    }

    async fn establish_session(
        &self,
        capability: Arc<dyn DirectoryCapability>,
        save_record: bool,
    ) -> Result<(), StoreError> {
        let record = capability.to_record();

        let instance_lock = match InstanceLock::acquire(&record.directory) {
            Ok(lock) => lock,
            Err(e) => {
                self.inner
                    .apply_event(
                        LifecycleEvent::ConnectFailed {
                            message: e.to_string(),
                        },
                        "connect",
                    )
                    .await;
                return Err(e);
            }
        };

        if save_record {
            if let Err(e) = self.inner.handle_store.save(&record).await {
                // Recall is best-effort; the session works without it.
                warn!("failed to persist handle record: {}", e);
            }
        }

        let (forward_tx, forward_rx) = mpsc::channel(64);
        let watcher = Arc::new(DocumentWatcher::new(&record.directory, forward_tx));
        if let Err(e) = watcher.watch_file(&self.inner.config.document_name) {
            warn!("external change watching unavailable: {}", e);
        }
        spawn_forwarder(self.inner.changes_tx.clone(), forward_rx);

        let executor = Arc::new(WriteExecutor::new(
            capability.clone(),
            self.inner.config.document_name.clone(),
            self.inner.config.retry.clone(),
        ));
        let backup = Arc::new(BackupManager::new(capability.clone()));

        let (stop_tx, stop_rx) = watch::channel(false);
        let driver = spawn_driver(self.inner.clone(), stop_rx);

        {
            let mut st = self.inner.state.lock().await;
            st.session = Some(Session {
                capability,
                executor,
                backup,
                watcher,
                _instance_lock: instance_lock,
                stop_tx,
                driver: Some(driver),
            });
            st.last_error = None;
            self.inner
                .apply_event_locked(&mut st, LifecycleEvent::ConnectConfirmed, "connect");
        }
        info!("connected to {}", record.display_name);
        Ok(())
    }

    async fn teardown(&self, clear_record: bool, operation: &str) -> Result<(), StoreError> {
        // Let any in-flight write run to completion before stopping timers;
        // forcibly aborting could leave a half-written document.
        let session = {
            let _gate = self.inner.write_gate.lock().await;
            let mut st = self.inner.state.lock().await;
            st.session.take()
        };

        if let Some(mut session) = session {
            let _ = session.stop_tx.send(true);
            session.watcher.stop();
            if let Some(driver) = session.driver.take() {
                let _ = driver.await;
            }
        }

        // Cancel any not-yet-fired autosave without a final flush.
        {
            let mut plan = self.inner.plan.lock().unwrap();
            *plan = AutosavePlan::new(self.inner.config.autosave);
        }

        if clear_record {
            if let Err(e) = self.inner.handle_store.clear().await {
                warn!("failed to clear handle record: {}", e);
            }
        }

        let mut st = self.inner.state.lock().await;
        st.permission = PermissionState::Unknown;
        self.inner
            .apply_event_locked(&mut st, LifecycleEvent::UserDisconnected, operation);
        Ok(())
    }
}

impl EngineInner {
    fn snapshot_from(&self, st: &EngineState) -> StatusSnapshot {
        let pending = self.plan.lock().unwrap().has_pending();
        StatusSnapshot {
            is_running: st.session.is_some(),
            last_save_at: st.last_save_at,
            save_count: st.save_count,
            pending_writes: u8::from(pending),
            lifecycle: st.lifecycle,
            permission: st.permission,
            last_error: st.last_error.clone(),
        }
    }

    /// Broadcast the status derived from the locked state. Running under
    /// the state lock keeps broadcasts strictly ordered with the transition
    /// that produced them.
    fn broadcast_locked(&self, st: &EngineState) {
        self.status_tx.send_replace(self.snapshot_from(st));
    }

    async fn broadcast_current(&self) {
        let st = self.state.lock().await;
        self.broadcast_locked(&st);
    }

    fn apply_event_locked(&self, st: &mut EngineState, event: LifecycleEvent, operation: &str) {
        if let Some(message) = event.error_message() {
            let severity = match &event {
                LifecycleEvent::WriteFailedTerminal { .. } => Severity::Warning,
                _ => Severity::Error,
            };
            st.last_error = Some(ErrorNotice {
                message: message.to_string(),
                operation: operation.to_string(),
                severity,
                timestamp: Utc::now(),
            });
        }
        let next = reduce(st.lifecycle, &event);
        if next != st.lifecycle {
            debug!(from = ?st.lifecycle, to = ?next, "lifecycle transition");
            st.lifecycle = next;
        }
        self.broadcast_locked(st);
    }

    async fn apply_event(&self, event: LifecycleEvent, operation: &str) {
        let mut st = self.state.lock().await;
        self.apply_event_locked(&mut st, event, operation);
    }

    async fn set_permission(&self, permission: PermissionState) {
        // No broadcast here; the lifecycle event that follows carries it.
        self.state.lock().await.permission = permission;
    }

    async fn session_capability(&self) -> Result<Arc<dyn DirectoryCapability>, StoreError> {
        let st = self.state.lock().await;
        match (&st.session, st.lifecycle) {
            (Some(session), LifecycleState::Ready | LifecycleState::Recovering) => {
                Ok(session.capability.clone())
            }
            _ => Err(StoreError::NotConnected),
        }
    }

    /// Debounce/fallback-triggered flush. Only runs while ready and dirty.
    ///
    /// Returns `false` when the flush is blocked (not ready), telling the
    /// driver to stop arming the deadline until the next wake.
    async fn autosave_flush(&self) -> bool {
        let _gate = self.write_gate.lock().await;

        let pieces = {
            let st = self.state.lock().await;
            if st.lifecycle != LifecycleState::Ready {
                None
            } else {
                st.session
                    .as_ref()
                    .map(|s| (s.executor.clone(), s.watcher.clone()))
            }
        };
        let Some((executor, watcher)) = pieces else {
            return false;
        };

        // Re-check under the gate: a manual save may already have flushed.
        {
            let mut plan = self.plan.lock().unwrap();
            if !plan.is_dirty() {
                return true;
            }
            plan.start_in_flight();
        }

        // Freshest snapshot at fire time, never a cached one.
        let payload = self.source.latest_snapshot();
        let result = executor
            .execute(WriteTask::new(payload.clone(), false), "autosave")
            .await;
        let _ = self.finish_write(result, "autosave", &watcher, &payload).await;
        true
    }

    /// Write either the given payload or, under the gate, the latest
    /// snapshot. Serialized with every other writer.
    async fn explicit_flush(
        &self,
        payload: Option<Vec<u8>>,
        destructive: bool,
        operation: &str,
    ) -> Result<WriteReport, StoreError> {
        let _gate = self.write_gate.lock().await;

        let pieces = {
            let st = self.state.lock().await;
            match (&st.session, st.lifecycle) {
                (Some(s), LifecycleState::Ready | LifecycleState::Recovering) => Some((
                    s.executor.clone(),
                    s.backup.clone(),
                    s.watcher.clone(),
                )),
                _ => None,
            }
        };
        let Some((executor, backup, watcher)) = pieces else {
            return Err(StoreError::NotConnected);
        };

        self.plan.lock().unwrap().start_in_flight();

        if destructive {
            // Best-effort copy of the document being replaced; failure is
            // logged by the manager and never blocks the write.
            backup.create_backup(&self.config.document_name).await;
        }

        let payload = payload.unwrap_or_else(|| self.source.latest_snapshot());
        let result = executor
            .execute(WriteTask::new(payload.clone(), destructive), operation)
            .await;
        self.finish_write(result, operation, &watcher, &payload).await
    }

    async fn finish_write(
        &self,
        result: Result<WriteReport, StoreError>,
        operation: &str,
        watcher: &DocumentWatcher,
        payload: &[u8],
    ) -> Result<WriteReport, StoreError> {
        // Changes recorded during the flight re-marked the plan dirty; the
        // driver may be sleeping without a deadline, so re-wake it either way.
        match result {
            Ok(report) => {
                watcher.record_own_write(&self.config.document_name, payload);
                self.plan.lock().unwrap().complete();
                self.wake.notify_one();

                let mut st = self.state.lock().await;
                st.save_count += 1;
                st.last_save_at = Some(report.completed_at);
                st.last_error = None;
                if st.lifecycle == LifecycleState::Recovering {
                    // A successful write proves access is back.
                    st.permission = PermissionState::Granted;
                    st.lifecycle = reduce(st.lifecycle, &LifecycleEvent::PermissionGranted);
                }
                self.broadcast_locked(&st);
                Ok(report)
            }
            Err(err) => {
                self.plan.lock().unwrap().complete();
                self.wake.notify_one();

                let event = match err.class() {
                    ErrorClass::Permission => {
                        // The snapshot still exists only in memory; keep it
                        // scheduled so a re-grant flushes it. The driver is
                        // gated on the ready state, so nothing fires while
                        // recovering.
                        self.plan.lock().unwrap().record_change(Instant::now());
                        LifecycleEvent::WriteFailedPermission {
                            message: err.to_string(),
                        }
                    }
                    _ => LifecycleEvent::WriteFailedTerminal {
                        message: err.to_string(),
                    },
                };

                let mut st = self.state.lock().await;
                if matches!(event, LifecycleEvent::WriteFailedPermission { .. }) {
                    st.permission = PermissionState::Denied;
                }
                self.apply_event_locked(&mut st, event, operation);
                if let Some(notice) = st.last_error.clone() {
                    let _ = self.failures_tx.send(notice);
                }
                Err(err)
            }
        }
    }
}

/// Drives the debounce and periodic fallback timers.
fn spawn_driver(inner: Arc<EngineInner>, mut stop_rx: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut paused = false;
        loop {
            let deadline = if paused {
                None
            } else {
                inner.plan.lock().unwrap().deadline()
            };
            tokio::select! {
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        break;
                    }
                }
                _ = inner.wake.notified() => {
                    paused = false;
                }
                _ = sleep_until_or_forever(deadline) => {
                    // A blocked flush (e.g. while recovering) pauses the
                    // timers until the next wake, instead of spinning on an
                    // expired deadline.
                    paused = !inner.autosave_flush().await;
                }
            }
        }
        debug!("autosave driver stopped");
    })
}

async fn sleep_until_or_forever(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}

/// Forwards watcher events to the engine's subscribers.
fn spawn_forwarder(
    changes_tx: broadcast::Sender<ExternalChangeEvent>,
    mut rx: mpsc::Receiver<ExternalChangeEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(change) = rx.recv().await {
            let _ = changes_tx.send(change);
        }
    })
}
