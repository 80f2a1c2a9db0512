//! Echo suppression for realtime listeners.
//!
//! Every document this device writes comes back through the listeners. The
//! filter remembers `(path, updated_at)` of recent writes; a change carrying
//! exactly that stamp is our own write and is skipped. A later write from
//! another device carries a different stamp and passes.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// Recently written document stamps.
#[derive(Debug)]
pub struct EchoFilter {
    window: Duration,
    recent: Mutex<HashMap<String, (i64, Instant)>>,
}

impl EchoFilter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            recent: Mutex::new(HashMap::new()),
        }
    }

    /// Remembers a write.
    pub fn record(&self, path: String, updated_at: i64) {
        let now = Instant::now();
        let mut recent = self.lock();
        recent.retain(|_, (_, at)| now.duration_since(*at) < self.window);
        recent.insert(path, (updated_at, now));
    }

    /// True when the change is our own write within the window.
    pub fn is_echo(&self, path: &str, updated_at: i64) -> bool {
        let now = Instant::now();
        self.lock().get(path).is_some_and(|(stamp, at)| {
            *stamp == updated_at && now.duration_since(*at) < self.window
        })
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, (i64, Instant)>> {
        // A panic while holding the lock leaves the map usable.
        self.recent.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
