//! Publishing of [`SyncState`].
//!
//! One writer (the orchestrator), any number of readers through `watch`.

use tokio::sync::watch;
use tome_core::{SyncPhase, SyncState};

/// Owner of the sync state channel.
#[derive(Debug)]
pub struct StatePublisher {
    tx: watch::Sender<SyncState>,
}

impl StatePublisher {
    pub fn new(initial: SyncState) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncState> {
        self.tx.subscribe()
    }

    /// Current state.
    pub fn snapshot(&self) -> SyncState {
        self.tx.borrow().clone()
    }

    /// Mutates the state and notifies subscribers if anything changed.
    pub fn update(&self, f: impl FnOnce(&mut SyncState)) {
        self.tx.send_if_modified(|state| {
            let before = state.clone();
            f(state);
            *state != before
        });
    }

    /// Resets to the zeroed state, keeping the pause flag.
    pub fn reset(&self) {
        self.update(|state| {
            let is_paused = state.is_paused;
            *state = SyncState {
                is_paused,
                phase: if is_paused { SyncPhase::Paused } else { SyncPhase::Idle },
                ..SyncState::default()
            };
        });
    }
}

impl Default for StatePublisher {
    fn default() -> Self {
        Self::new(SyncState::default())
    }
}
