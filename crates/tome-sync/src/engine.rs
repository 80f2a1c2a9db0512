//! # Sync Engine
//!
//! Wires every component together and exposes the surface the reader app
//! uses.
//!
//! ## Engine Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          SyncEngine                                     │
//! │                                                                         │
//! │  host DB ──► ChangeCapture ──► EventQueue ──► FlushScheduler            │
//! │                  ▲                 │               │                    │
//! │                  │ suspended       │ snapshot      ▼                    │
//! │                  │                 ▼          SyncOrchestrator ──► remote│
//! │             InboundApplier ◄── tome-store          ▲                    │
//! │                  ▲                                 │                    │
//! │                  └──────── RealtimeBridge ◄────────┘ listeners          │
//! │                                                                         │
//! │  AUTH WATCHER                                                          │
//! │  ────────────                                                          │
//! │  signed in   → listeners up, download_and_merge, flush                 │
//! │  signed out  → listeners down, logout (queue and metadata cleared)     │
//! │  same user   → auth suspension lifted                                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tome_core::SyncState;
use tome_store::{Database, KvStore, StoreConfig};
use tracing::{debug, info, warn};

use crate::auth::{AuthBridge, AuthState};
use crate::capture::{ChangeCapture, ChangeSource, SuspendToken, Subscription};
use crate::clock::MonotonicClock;
use crate::config::{RealtimeSettings, SyncConfig};
use crate::echo::EchoFilter;
use crate::error::{SyncError, SyncResult};
use crate::inbound::{InboundApplier, MergeReport};
use crate::local::{LocalRepository, LocalSnapshot};
use crate::orchestrator::{FlushReport, OrchestratorDeps, SyncOrchestrator};
use crate::persist::SyncStorage;
use crate::queue::{EventQueue, RetryPolicy};
use crate::realtime::{RealtimeBridge, RealtimeHandle};
use crate::remote::RemoteStore;
use crate::scheduler::{FlushScheduler, SchedulerHandle};

type RealtimeSlot = Arc<Mutex<Option<RealtimeHandle>>>;

// =============================================================================
// Sync Engine
// =============================================================================

/// A running sync engine.
pub struct SyncEngine {
    config: Arc<SyncConfig>,
    orchestrator: Arc<SyncOrchestrator>,
    capture: ChangeCapture,
    scheduler: SchedulerHandle,
    realtime: RealtimeSlot,
    shutdown_tx: watch::Sender<bool>,
    auth_task: Option<JoinHandle<()>>,

    /// Keeps the capture registered with the host database.
    _subscription: Option<Subscription>,

    /// Owned store, closed on shutdown.
    database: Option<Database>,
}

impl SyncEngine {
    pub fn builder(config: SyncConfig) -> SyncEngineBuilder {
        SyncEngineBuilder::new(config)
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn orchestrator(&self) -> &Arc<SyncOrchestrator> {
        &self.orchestrator
    }

    pub fn capture(&self) -> &ChangeCapture {
        &self.capture
    }

    pub fn queue(&self) -> &Arc<EventQueue> {
        self.orchestrator.queue()
    }

    // =========================================================================
    // App Surface
    // =========================================================================

    pub async fn flush(&self) -> FlushReport {
        self.orchestrator.flush().await
    }

    pub fn pause(&self) {
        self.orchestrator.pause();
    }

    pub fn resume(&self) {
        self.orchestrator.resume();
    }

    pub fn set_foreground(&self, foreground: bool) {
        self.orchestrator.set_foreground(foreground);
    }

    /// Uploads the whole local library for the signed-in user.
    pub async fn upload_local_library(&self) -> SyncResult<usize> {
        self.orchestrator.upload_local_library().await
    }

    /// Uploads an explicit snapshot for the signed-in user.
    pub async fn upload_full(&self, snapshot: &LocalSnapshot) -> SyncResult<usize> {
        let user_id = self
            .orchestrator
            .current_user()
            .await
            .ok_or(SyncError::NoUser)?;
        self.orchestrator.upload_full(&user_id, snapshot).await
    }

    pub async fn download_and_merge(&self) -> SyncResult<MergeReport> {
        self.orchestrator.download_and_merge().await
    }

    pub async fn clear_queue(&self) {
        self.orchestrator.clear_queue().await;
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SyncState> {
        self.orchestrator.subscribe_state()
    }

    pub fn state(&self) -> SyncState {
        self.orchestrator.state()
    }

    /// Stops the listeners and forgets everything of the current user,
    /// including edits still waiting out their debounce delay.
    pub async fn logout(&self) {
        forget_user(&self.capture, &self.realtime, &self.orchestrator).await;
    }

    /// True when listeners are running for the signed-in user.
    pub async fn is_listening(&self) -> bool {
        self.realtime.lock().await.is_some()
    }

    /// Stops every background task. Debounced changes are queued first so
    /// they survive a restart.
    pub async fn shutdown(mut self) {
        info!("Shutting down sync engine");

        match self.capture.flush_pending().await {
            Ok(count) if count > 0 => debug!(count, "Queued debounced changes before shutdown"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Failed to queue debounced changes"),
        }
        self.capture.shutdown();

        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.auth_task.take() {
            let _ = task.await;
        }
        stop_realtime(&self.realtime).await;
        self.scheduler.shutdown().await;

        if let Some(database) = self.database.take() {
            database.close().await;
        }
        info!("Sync engine stopped");
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("device_id", &self.config.device_id())
            .field("orchestrator", &self.orchestrator)
            .finish_non_exhaustive()
    }
}

/// Debounced edits go first: queued after the clear they would be flushed
/// into the next user's account.
async fn forget_user(capture: &ChangeCapture, realtime: &RealtimeSlot, orchestrator: &SyncOrchestrator) {
    match capture.discard_pending().await {
        Ok(dropped) if dropped > 0 => debug!(dropped, "Discarded debounced changes of signed-out user"),
        Ok(_) => {}
        Err(e) => warn!(error = %e, "Failed to discard debounced changes"),
    }
    stop_realtime(realtime).await;
    orchestrator.logout().await;
}

async fn stop_realtime(slot: &RealtimeSlot) {
    let handle = slot.lock().await.take();
    if let Some(handle) = handle {
        handle.stop().await;
    }
}

// =============================================================================
// Auth Watcher
// =============================================================================

struct AuthWatcher {
    orchestrator: Arc<SyncOrchestrator>,
    capture: ChangeCapture,
    auth_rx: watch::Receiver<AuthState>,
    shutdown_rx: watch::Receiver<bool>,
    realtime: RealtimeSlot,
    settings: RealtimeSettings,
    current_user: Option<String>,
}

impl AuthWatcher {
    async fn run(mut self) {
        debug!("Auth watcher started");

        loop {
            let state = self.auth_rx.borrow_and_update().clone();
            self.handle(state).await;

            tokio::select! {
                changed = self.auth_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = self.shutdown_rx.changed() => break,
            }
        }

        debug!("Auth watcher stopped");
    }

    async fn handle(&mut self, state: AuthState) {
        let current = self.current_user.clone();
        match (state.user_id(), current.as_deref()) {
            (Some(user), Some(current)) if user == current => {
                self.orchestrator.resume_auth();
            }
            (Some(user), current) => {
                let user = user.to_string();
                if current.is_some() {
                    self.sign_out().await;
                }
                self.sign_in(user).await;
            }
            (None, Some(_)) => self.sign_out().await,
            (None, None) => {}
        }
    }

    async fn sign_in(&mut self, user_id: String) {
        info!(user_id = %user_id, "User signed in, starting sync");
        self.orchestrator.resume_auth();

        if self.settings.enabled {
            let handle = RealtimeBridge::spawn(&user_id, self.orchestrator.clone(), self.settings.clone());
            *self.realtime.lock().await = Some(handle);
        }
        self.current_user = Some(user_id);

        if let Err(e) = self.orchestrator.download_and_merge().await {
            warn!(error = %e, "Initial download failed");
        }
        let report = self.orchestrator.flush().await;
        debug!(?report, "Initial flush finished");
    }

    async fn sign_out(&mut self) {
        info!(user_id = ?self.current_user, "User signed out, stopping sync");
        forget_user(&self.capture, &self.realtime, &self.orchestrator).await;
        self.current_user = None;
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`SyncEngine`].
pub struct SyncEngineBuilder {
    config: SyncConfig,
    kv: Option<Arc<dyn KvStore>>,
    local: Option<Arc<dyn LocalRepository>>,
    source: Option<Arc<dyn ChangeSource>>,
    remote: Option<Arc<dyn RemoteStore>>,
    auth: Option<Arc<dyn AuthBridge>>,
}

impl SyncEngineBuilder {
    pub fn new(config: SyncConfig) -> Self {
        SyncEngineBuilder {
            config,
            kv: None,
            local: None,
            source: None,
            remote: None,
            auth: None,
        }
    }

    /// Stores engine state here instead of opening the configured database.
    pub fn with_kv_store(mut self, kv: Arc<dyn KvStore>) -> Self {
        self.kv = Some(kv);
        self
    }

    pub fn with_local(mut self, local: Arc<dyn LocalRepository>) -> Self {
        self.local = Some(local);
        self
    }

    /// Source of local change notifications. Without one nothing is
    /// captured automatically.
    pub fn with_change_source(mut self, source: Arc<dyn ChangeSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_remote(mut self, remote: Arc<dyn RemoteStore>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn with_auth(mut self, auth: Arc<dyn AuthBridge>) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Restores persisted state and starts the background tasks.
    ///
    /// ## Errors
    /// - [`SyncError::InvalidConfig`] for invalid settings or a missing
    ///   collaborator
    /// - [`SyncError::Persistence`] when the store cannot be opened
    pub async fn build(self) -> SyncResult<SyncEngine> {
        self.config.validate()?;

        let local = self
            .local
            .ok_or_else(|| SyncError::InvalidConfig("local repository required".into()))?;
        let remote = self
            .remote
            .ok_or_else(|| SyncError::InvalidConfig("remote store required".into()))?;
        let auth = self
            .auth
            .ok_or_else(|| SyncError::InvalidConfig("auth bridge required".into()))?;

        let (kv, database) = match self.kv {
            Some(kv) => (kv, None),
            None => {
                let store_config = if self.config.storage.in_memory {
                    StoreConfig::in_memory()
                } else {
                    let path = self.config.store_path().ok_or_else(|| {
                        SyncError::InvalidConfig("no store path and no data directory".into())
                    })?;
                    StoreConfig::new(path)
                };
                let database = Database::new(store_config).await?;
                let kv: Arc<dyn KvStore> = Arc::new(database.kv());
                (kv, Some(database))
            }
        };

        let config = Arc::new(self.config);
        let settings = config.sync.clone();

        let clock = Arc::new(MonotonicClock::new());
        let storage = SyncStorage::new(kv);
        let queue = Arc::new(EventQueue::new(
            storage.clone(),
            clock.clone(),
            settings.max_queue_size,
            RetryPolicy::from(&settings),
        ));
        let restored = queue.restore().await;

        let suspend = SuspendToken::new();
        let capture = ChangeCapture::spawn(
            queue.clone(),
            clock.clone(),
            config.capture.clone(),
            suspend.clone(),
        );
        let subscription = self.source.as_ref().map(|source| capture.attach(source.as_ref()));

        let applier = InboundApplier::new(local.clone(), queue.clone(), suspend);
        let orchestrator = Arc::new(SyncOrchestrator::new(
            OrchestratorDeps {
                queue,
                remote,
                local,
                auth: auth.clone(),
                applier,
                storage,
                clock,
                echo: Arc::new(EchoFilter::new(config.realtime.echo_window())),
                device_id: config.device_id().to_string(),
            },
            settings,
        ));
        orchestrator.initialize().await;

        let scheduler = FlushScheduler::spawn(&orchestrator);

        let realtime: RealtimeSlot = Arc::new(Mutex::new(None));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let watcher = AuthWatcher {
            orchestrator: orchestrator.clone(),
            capture: capture.clone(),
            auth_rx: auth.subscribe(),
            shutdown_rx,
            realtime: realtime.clone(),
            settings: config.realtime.clone(),
            current_user: None,
        };
        let auth_task = tokio::spawn(watcher.run());

        info!(
            device_id = %config.device_id(),
            restored,
            realtime = config.realtime.enabled,
            "Sync engine started"
        );

        Ok(SyncEngine {
            config,
            orchestrator,
            capture,
            scheduler,
            realtime,
            shutdown_tx,
            auth_task: Some(auth_task),
            _subscription: subscription,
            database,
        })
    }
}
