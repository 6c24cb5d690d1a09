//! State publication gate and throttle
//!
//! Tracks whether the state is dirty, whether the first config arrived
//! (the gate) and when state was last sent. The device worker waits on
//! [`StatePublisher::notified`] and flushes; back-to-back dirty signals
//! coalesce into one flush carrying the latest snapshot.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tokio::time::Instant;

/// Result of a state publish request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// State was sent (or handed to the worker)
    Sent,
    /// The config gate is still closed; state stays dirty
    Deferred,
}

pub struct StatePublisher {
    dirty: AtomicBool,
    notify: Notify,
    gate: watch::Sender<bool>,
    last_publish: Mutex<Option<Instant>>,
    throttle: Duration,
}

impl StatePublisher {
    pub fn new(throttle: Duration) -> Self {
        let (gate, _) = watch::channel(false);
        Self {
            dirty: AtomicBool::new(false),
            notify: Notify::new(),
            gate,
            last_publish: Mutex::new(None),
            throttle,
        }
    }

    /// Mark state dirty and wake the worker
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    /// Mark state dirty without waking the worker
    pub fn keep_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::SeqCst)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    /// Wait for the next dirty signal
    pub async fn notified(&self) {
        self.notify.notified().await;
    }

    /// Release the config gate; true only for the first release
    pub fn open_gate(&self) -> bool {
        self.gate.send_if_modified(|open| {
            if *open {
                false
            } else {
                *open = true;
                true
            }
        })
    }

    pub fn is_open(&self) -> bool {
        *self.gate.borrow()
    }

    /// Wait up to `timeout` for the gate to open
    pub async fn wait_open(&self, timeout: Duration) -> bool {
        let mut rx = self.gate.subscribe();
        matches!(
            tokio::time::timeout(timeout, rx.wait_for(|open| *open)).await,
            Ok(Ok(_))
        )
    }

    /// Time left before the next publish is allowed
    pub fn remaining_throttle(&self) -> Duration {
        let last = *self.last_publish.lock().unwrap_or_else(|e| e.into_inner());
        last.map(|at| self.throttle.saturating_sub(at.elapsed()))
            .unwrap_or(Duration::ZERO)
    }

    /// Record a publish attempt, starting a new throttle window
    pub fn record_publish(&self) {
        *self.last_publish.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
    }
}
