//! # Flush Scheduler
//!
//! Decides when the orchestrator flushes on its own.
//!
//! ```text
//!   queue pending count ──► debounce (flush_debounce) ──┐
//!                                                       ├──► orchestrator.flush()
//!   periodic tick (foreground only) ────────────────────┘
//!
//!   TimerControl { running, foreground }   pause / resume / logout
//! ```
//!
//! A debounce never fires before the retry delay of requeued events. The
//! scheduler holds only a weak reference and stops once the orchestrator is
//! gone.

use std::sync::{Arc, Weak};

use tokio::sync::{mpsc, watch};
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::orchestrator::{FlushReport, SyncOrchestrator, TimerControl};

/// Handle to the scheduler task.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    shutdown_tx: mpsc::Sender<()>,
}

impl SchedulerHandle {
    /// Stops the scheduler. A flush already running completes.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

/// Debounce and periodic flush timers.
pub struct FlushScheduler {
    orchestrator: Weak<SyncOrchestrator>,
    control: watch::Receiver<TimerControl>,
    pending: watch::Receiver<usize>,
    shutdown_rx: mpsc::Receiver<()>,
    debounce_at: Option<Instant>,
}

impl FlushScheduler {
    /// Spawns the scheduler on the current runtime.
    pub fn spawn(orchestrator: &Arc<SyncOrchestrator>) -> SchedulerHandle {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let scheduler = FlushScheduler {
            orchestrator: Arc::downgrade(orchestrator),
            control: orchestrator.subscribe_timers(),
            pending: orchestrator.queue().subscribe(),
            shutdown_rx,
            debounce_at: None,
        };
        tokio::spawn(scheduler.run());

        SchedulerHandle { shutdown_tx }
    }

    async fn run(mut self) {
        let Some(period) = self.orchestrator.upgrade().map(|o| o.settings().periodic_interval())
        else {
            return;
        };
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        // Events restored from disk flush without waiting for a change.
        if *self.pending.borrow_and_update() > 0 {
            self.schedule_debounce();
        }

        info!(?period, "Flush scheduler started");

        loop {
            let control = *self.control.borrow();

            tokio::select! {
                _ = self.shutdown_rx.recv() => {
                    info!("Flush scheduler shutting down");
                    break;
                }

                changed = self.control.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let control = *self.control.borrow_and_update();
                    self.debounce_at = None;
                    if control.running && *self.pending.borrow() > 0 {
                        self.schedule_debounce();
                    }
                    debug!(?control, "Timer control changed");
                }

                changed = self.pending.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let count = *self.pending.borrow_and_update();
                    let Some(orchestrator) = self.orchestrator.upgrade() else {
                        break;
                    };
                    orchestrator.note_pending(count);
                    if control.running && count > 0 {
                        self.schedule_debounce();
                    }
                }

                _ = sleep_until(self.debounce_at.unwrap_or_else(Instant::now)), if self.debounce_at.is_some() => {
                    self.debounce_at = None;
                    if !self.flush("debounce").await {
                        break;
                    }
                }

                _ = ticker.tick(), if control.running && control.foreground => {
                    if !self.flush("periodic").await {
                        break;
                    }
                }
            }
        }

        debug!("Flush scheduler stopped");
    }

    /// Sets the debounce deadline, never earlier than the retry delay.
    fn schedule_debounce(&mut self) {
        let Some(orchestrator) = self.orchestrator.upgrade() else {
            return;
        };
        let mut at = Instant::now() + orchestrator.settings().flush_debounce();
        if let Some(not_before) = orchestrator.retry_not_before() {
            at = at.max(not_before);
        }
        self.debounce_at = Some(at);
    }

    /// Runs one flush. Returns false when the orchestrator is gone.
    async fn flush(&mut self, trigger: &'static str) -> bool {
        let Some(orchestrator) = self.orchestrator.upgrade() else {
            return false;
        };

        // A flush started elsewhere may have set a later retry point.
        if let Some(not_before) = orchestrator.retry_not_before() {
            if not_before > Instant::now() {
                debug!(trigger, "Flush deferred until retry delay passes");
                self.debounce_at = Some(not_before);
                return true;
            }
        }

        debug!(trigger, "Scheduled flush");
        match orchestrator.flush().await {
            FlushReport::Completed(summary) => {
                if let Some(after) = summary.retry_after {
                    self.debounce_at = Some(Instant::now() + after);
                } else if summary.written > 0 && orchestrator.queue().len().await > 0 {
                    // More than one batch was pending.
                    self.schedule_debounce();
                }
            }
            FlushReport::Skipped(reason) => debug!(trigger, ?reason, "Scheduled flush skipped"),
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticAuth;
    use crate::capture::SuspendToken;
    use crate::clock::MonotonicClock;
    use crate::config::SyncSettings;
    use crate::echo::EchoFilter;
    use crate::fixtures::manga;
    use crate::inbound::InboundApplier;
    use crate::memory::{FailureKind, MemoryLibrary, MemoryRemoteStore};
    use crate::orchestrator::OrchestratorDeps;
    use crate::persist::SyncStorage;
    use crate::queue::{EventQueue, RetryPolicy};
    use std::time::Duration;
    use tome_core::{EntityType, EventKind, LibraryEntity, SyncEvent};
    use tome_store::MemoryKvStore;

    fn setup() -> (Arc<SyncOrchestrator>, Arc<EventQueue>, Arc<MemoryRemoteStore>) {
        let settings = SyncSettings::default();
        let clock = Arc::new(MonotonicClock::new());
        let storage = SyncStorage::new(Arc::new(MemoryKvStore::new()));
        let queue = Arc::new(EventQueue::new(
            storage.clone(),
            clock.clone(),
            settings.max_queue_size,
            RetryPolicy::from(&settings),
        ));
        let remote = Arc::new(MemoryRemoteStore::new());
        let library = Arc::new(MemoryLibrary::new());
        let orchestrator = Arc::new(SyncOrchestrator::new(
            OrchestratorDeps {
                queue: queue.clone(),
                remote: remote.clone(),
                local: library.clone(),
                auth: Arc::new(StaticAuth::signed_in("u1")),
                applier: InboundApplier::new(library, queue.clone(), SuspendToken::new()),
                storage,
                clock,
                echo: Arc::new(EchoFilter::new(Duration::from_secs(10))),
                device_id: "device-a".into(),
            },
            settings,
        ));
        (orchestrator, queue, remote)
    }

    fn event(id: &str, version: u64) -> SyncEvent {
        let payload = LibraryEntity::Manga(manga(id, 1)).to_payload().unwrap();
        SyncEvent::new(EntityType::Manga, id, EventKind::Update, payload, 1, version)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounced_flush_after_enqueue() {
        let (orchestrator, queue, remote) = setup();
        let _handle = FlushScheduler::spawn(&orchestrator);
        settle().await;

        queue.enqueue(event("m1", 1)).await.unwrap();
        settle().await;
        assert_eq!(remote.commit_count(), 0);
        assert_eq!(orchestrator.state().pending_count, 1);

        tokio::time::sleep(Duration::from_millis(2_100)).await;
        settle().await;
        assert_eq!(remote.commit_count(), 1);
        assert!(queue.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_paused_scheduler_does_not_flush() {
        let (orchestrator, queue, remote) = setup();
        let _handle = FlushScheduler::spawn(&orchestrator);
        orchestrator.pause();
        settle().await;

        queue.enqueue(event("m1", 1)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(600)).await;
        settle().await;
        assert_eq!(remote.commit_count(), 0);

        orchestrator.resume();
        tokio::time::sleep(Duration::from_millis(2_100)).await;
        settle().await;
        assert_eq!(remote.commit_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_requeued_event_flushes_after_backoff() {
        let (orchestrator, queue, remote) = setup();
        let _handle = FlushScheduler::spawn(&orchestrator);
        settle().await;

        // All in-flush attempts fail, the event is requeued.
        remote.fail_next(3, FailureKind::Unavailable);
        queue.enqueue(event("m1", 1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        settle().await;
        assert_eq!(remote.commit_count(), 0);

        tokio::time::sleep(Duration::from_secs(60)).await;
        settle().await;
        assert!(queue.is_empty().await);
        assert_eq!(remote.commit_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_stops_with_orchestrator() {
        let (orchestrator, queue, _remote) = setup();
        let handle = FlushScheduler::spawn(&orchestrator);
        settle().await;
        drop(orchestrator);

        queue.enqueue(event("m1", 1)).await.unwrap();
        settle().await;
        // The task has exited; shutdown finds no receiver.
        handle.shutdown().await;
    }
}
