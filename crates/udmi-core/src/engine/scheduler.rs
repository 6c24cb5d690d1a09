//! One-shot timer tasks
//!
//! Timers are plain tokio tasks kept in a `JoinSet` so they can all be
//! aborted on shutdown. Each timer can also be cancelled through the
//! returned [`AbortHandle`]; callers still re-check their own state when
//! a timer fires.

use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::{AbortHandle, JoinSet};

#[derive(Default)]
pub struct Scheduler {
    tasks: Mutex<JoinSet<()>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` at the wall-clock instant `at` (immediately if past)
    pub fn schedule_at<F>(&self, at: DateTime<Utc>, task: F) -> AbortHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let delay = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        self.schedule_after(delay, task)
    }

    /// Run `task` after `delay`
    pub fn schedule_after<F>(&self, delay: Duration, task: F) -> AbortHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move {
            tokio::time::sleep(delay).await;
            task.await;
        })
    }

    /// Number of timers not yet finished
    pub fn armed(&self) -> usize {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        while tasks.try_join_next().is_some() {}
        tasks.len()
    }

    /// Abort every armed timer
    pub fn shutdown(&self) {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).abort_all();
    }
}
