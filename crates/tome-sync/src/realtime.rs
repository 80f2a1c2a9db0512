//! # Realtime Bridge
//!
//! One standing listener per collection of the signed-in user. Remote changes
//! are decoded, stripped of our own echoes and merged locally.
//!
//! ## Listener Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  ┌────────────┐  subscribe()  ┌───────────┐   batch   ┌──────────────┐  │
//! │  │ Connecting │ ────────────► │ Listening │ ────────► │ decode,      │  │
//! │  └────────────┘               └─────┬─────┘ ◄──────── │ drop echoes, │  │
//! │        ▲  │ failure                 │ error / end     │ apply        │  │
//! │        │  ▼                         ▼                 └──────────────┘  │
//! │        │ ┌─────────┐          ┌─────────┐                               │
//! │        └─│ Backoff │ ◄─────── │ Backoff │                               │
//! │          └─────────┘          └─────────┘                               │
//! │                                                                         │
//! │  After any interruption the next successful subscribe is followed by a  │
//! │  catch-up merge of documents updated since the listener was last known │
//! │  healthy, so nothing written meanwhile is missed.                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use futures_util::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tome_core::{Collection, RemoteDocument};
use tracing::{debug, info, warn};

use crate::config::RealtimeSettings;
use crate::inbound::decode_documents;
use crate::orchestrator::SyncOrchestrator;
use crate::remote::{RawDocument, RemoteChange};

/// Stamps from other devices may run this far behind our clock.
const CATCH_UP_MARGIN_MS: i64 = 60_000;

/// Listener state of one collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Connecting,
    Listening,
    Backoff,
    Stopped,
}

impl std::fmt::Display for ListenerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListenerState::Connecting => write!(f, "connecting"),
            ListenerState::Listening => write!(f, "listening"),
            ListenerState::Backoff => write!(f, "backoff"),
            ListenerState::Stopped => write!(f, "stopped"),
        }
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Running listeners of one user. Dropping the handle stops them.
#[derive(Debug)]
pub struct RealtimeHandle {
    user_id: String,
    shutdown_tx: watch::Sender<bool>,
    states: Vec<(Collection, watch::Receiver<ListenerState>)>,
    tasks: Vec<JoinHandle<()>>,
}

impl RealtimeHandle {
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Current state of a collection's listener.
    pub fn state(&self, collection: Collection) -> Option<ListenerState> {
        self.states
            .iter()
            .find(|(c, _)| *c == collection)
            .map(|(_, rx)| *rx.borrow())
    }

    /// True when every listener is connected.
    pub fn all_listening(&self) -> bool {
        self.states
            .iter()
            .all(|(_, rx)| *rx.borrow() == ListenerState::Listening)
    }

    /// Stops every listener and waits for them to exit.
    pub async fn stop(mut self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        info!(user_id = %self.user_id, "Realtime listeners stopped");
    }
}

impl Drop for RealtimeHandle {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

// =============================================================================
// Bridge
// =============================================================================

/// Listener task for one collection.
pub struct RealtimeBridge {
    user_id: String,
    collection: Collection,
    orchestrator: Arc<SyncOrchestrator>,
    settings: RealtimeSettings,
    shutdown_rx: watch::Receiver<bool>,
    state_tx: watch::Sender<ListenerState>,
}

impl RealtimeBridge {
    /// Starts one listener per collection for `user_id`.
    pub fn spawn(
        user_id: &str,
        orchestrator: Arc<SyncOrchestrator>,
        settings: RealtimeSettings,
    ) -> RealtimeHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut states = Vec::with_capacity(Collection::ALL.len());
        let mut tasks = Vec::with_capacity(Collection::ALL.len());

        for collection in Collection::ALL {
            let (state_tx, state_rx) = watch::channel(ListenerState::Connecting);
            let bridge = RealtimeBridge {
                user_id: user_id.to_string(),
                collection,
                orchestrator: orchestrator.clone(),
                settings: settings.clone(),
                shutdown_rx: shutdown_rx.clone(),
                state_tx,
            };
            states.push((collection, state_rx));
            tasks.push(tokio::spawn(bridge.run()));
        }

        info!(user_id = %user_id, "Realtime listeners started");
        RealtimeHandle {
            user_id: user_id.to_string(),
            shutdown_tx,
            states,
            tasks,
        }
    }

    async fn run(mut self) {
        debug!(collection = %self.collection, "Listener starting");

        let mut backoff = self.create_backoff();
        let mut last_healthy = now_ms();
        let mut interrupted = false;

        loop {
            if self.is_shutdown() {
                break;
            }
            self.set_state(ListenerState::Connecting);

            let remote = self.orchestrator.remote().clone();
            match remote.subscribe(&self.user_id, self.collection).await {
                Ok(mut stream) => {
                    backoff.reset();
                    self.set_state(ListenerState::Listening);
                    let connected_at = now_ms();
                    if interrupted {
                        self.catch_up(last_healthy).await;
                    }
                    last_healthy = connected_at;

                    loop {
                        tokio::select! {
                            item = stream.next() => match item {
                                Some(Ok(changes)) => {
                                    last_healthy = now_ms();
                                    self.handle_changes(changes).await;
                                }
                                Some(Err(e)) => {
                                    warn!(collection = %self.collection, error = %e, "Listener failed");
                                    break;
                                }
                                None => {
                                    warn!(collection = %self.collection, "Listener stream ended");
                                    break;
                                }
                            },
                            _ = self.shutdown_rx.changed() => break,
                        }
                    }
                }
                Err(e) => {
                    warn!(collection = %self.collection, error = %e, "Failed to open listener");
                }
            }

            if self.is_shutdown() {
                break;
            }
            interrupted = true;

            let delay = backoff
                .next_backoff()
                .unwrap_or(Duration::from_millis(self.settings.reconnect_max_ms));
            self.set_state(ListenerState::Backoff);
            debug!(collection = %self.collection, ?delay, "Reconnecting after backoff");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown_rx.changed() => break,
            }
        }

        self.set_state(ListenerState::Stopped);
        debug!(collection = %self.collection, "Listener stopped");
    }

    async fn handle_changes(&self, changes: Vec<RemoteChange>) {
        let mut raw: Vec<RawDocument> = Vec::with_capacity(changes.len());
        for change in changes {
            match change {
                RemoteChange::Upserted(doc) => raw.push(doc),
                // Deletions travel as soft-deleted documents.
                RemoteChange::Removed { id } => {
                    debug!(collection = %self.collection, id = %id, "Ignoring hard removal")
                }
            }
        }

        // An echo carries our device id and a stamp we just wrote.
        let echo = self.orchestrator.echo();
        let device_id = self.orchestrator.device_id();
        let received = raw.len();
        raw.retain(|doc| {
            let ours = doc.written_by().map_or(true, |writer| writer == device_id);
            let path = self.collection.document_path(&self.user_id, &doc.id);
            !(ours && echo.is_echo(&path, doc.updated_at()))
        });

        let (fresh, invalid): (Vec<RemoteDocument>, usize) =
            decode_documents(self.collection, &raw);

        if fresh.is_empty() {
            if invalid > 0 {
                warn!(collection = %self.collection, invalid, "Skipped undecodable documents");
            }
            return;
        }

        let report = self.orchestrator.applier().apply(&fresh).await;
        debug!(
            collection = %self.collection,
            received,
            applied = fresh.len(),
            changes = report.changes(),
            invalid = invalid + report.invalid,
            "Remote changes merged"
        );
    }

    /// Merges whatever changed while the listener was down.
    async fn catch_up(&self, last_healthy: i64) {
        let last_sync = self.orchestrator.state().last_sync_timestamp;
        let since = if last_sync > 0 {
            last_healthy.min(last_sync)
        } else {
            last_healthy
        };
        let since = (since - CATCH_UP_MARGIN_MS).max(0);

        if let Err(e) = self.orchestrator.catch_up(self.collection, since).await {
            warn!(collection = %self.collection, error = %e, "Catch-up after reconnect failed");
        }
    }

    fn is_shutdown(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    fn set_state(&self, state: ListenerState) {
        self.state_tx.send_replace(state);
    }

    fn create_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: Duration::from_millis(self.settings.reconnect_initial_ms),
            max_interval: Duration::from_millis(self.settings.reconnect_max_ms),
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
