//! One-shot wake-ups keyed by domain and purpose.
//!
//! Each timed bypass arms two wake-ups: a warning shortly before the end and
//! the hard expiry. Fired wake-ups are delivered as [`Wakeup`] events on a
//! channel that the server loop feeds back into the controller.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::clock::{Clock, Timestamp};
use crate::directory::Domain;

/// Longest single sleep before the wall clock is consulted again.
///
/// Tokio timers run on a monotonic clock that may stop while the host is
/// suspended, so long waits are split up and re-checked against wall time.
pub const MAX_SLEEP_SLICE: Duration = Duration::from_secs(30);

/// What a wake-up is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Purpose {
    Warning,
    Expire,
}

/// Identity of a scheduled wake-up. Arming the same key again replaces it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WakeupKey {
    pub domain: Domain,
    pub purpose: Purpose,
}

impl WakeupKey {
    #[must_use]
    pub const fn new(domain: Domain, purpose: Purpose) -> Self {
        Self { domain, purpose }
    }
}

impl fmt::Display for WakeupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let purpose = match self.purpose {
            Purpose::Warning => "warning",
            Purpose::Expire => "expire",
        };
        write!(f, "{purpose}:{}", self.domain)
    }
}

/// A scheduled (or fired) wake-up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Wakeup {
    pub key: WakeupKey,
    /// When the wake-up fires.
    pub at: Timestamp,
    /// End of the bypass that armed it, used to discard stale firings.
    pub bypass_end: Timestamp,
}

/// Trait for arming and cancelling one-shot wake-ups.
pub trait Scheduler: Send + Sync + 'static {
    /// Arm `wakeup`, replacing any pending wake-up with the same key.
    fn arm(&self, wakeup: Wakeup);

    /// Cancel the pending wake-up for `key`, if any.
    fn cancel(&self, key: &WakeupKey);
}

/// Scheduler backed by tokio tasks.
pub struct TokioScheduler {
    clock: Arc<dyn Clock>,
    events: mpsc::UnboundedSender<Wakeup>,
    pending: Mutex<HashMap<WakeupKey, JoinHandle<()>>>,
}

impl TokioScheduler {
    /// Create a scheduler and the receiver its wake-ups are delivered to.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> (Self, mpsc::UnboundedReceiver<Wakeup>) {
        let (events, rx) = mpsc::unbounded_channel();
        let scheduler = Self {
            clock,
            events,
            pending: Mutex::new(HashMap::new()),
        };
        (scheduler, rx)
    }

    /// Number of wake-ups armed and not yet cancelled or finished.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending
            .lock()
            .values()
            .filter(|handle| !handle.is_finished())
            .count()
    }
}

impl Scheduler for TokioScheduler {
    fn arm(&self, wakeup: Wakeup) {
        let clock = Arc::clone(&self.clock);
        let events = self.events.clone();
        let key = wakeup.key.clone();

        let handle = tokio::spawn(async move {
            loop {
                let now = clock.now();
                if now >= wakeup.at {
                    break;
                }
                tokio::time::sleep(wakeup.at.duration_since(now).min(MAX_SLEEP_SLICE)).await;
            }
            tracing::debug!(key = %wakeup.key, at = %wakeup.at, "wake-up fired");
            // Receiver gone means the daemon is shutting down.
            let _ = events.send(wakeup);
        });

        if let Some(previous) = self.pending.lock().insert(key, handle) {
            previous.abort();
        }
    }

    fn cancel(&self, key: &WakeupKey) {
        if let Some(handle) = self.pending.lock().remove(key) {
            handle.abort();
            tracing::debug!(key = %key, "wake-up cancelled");
        }
    }
}

impl Drop for TokioScheduler {
    fn drop(&mut self) {
        for (_, handle) in self.pending.lock().drain() {
            handle.abort();
        }
    }
}
