//! Connectivity state consumed by the storage core.
//!
//! The core never probes the network itself; the host feeds probe results
//! in and reads a boolean out. A bounded history of recent probes is kept
//! for diagnostics, and `wait_for_connection` lets callers park until the
//! host reports recovery or a timeout passes.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;

use crate::config::StoreConfig;
use crate::time::now_ms;
use crate::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeSample {
    pub at_ms: i64,
    pub success: bool,
}

struct Inner {
    history: VecDeque<ProbeSample>,
    consecutive_failures: u32,
    online: bool,
}

pub struct NetworkStatus {
    inner: Mutex<Inner>,
    recovered: Notify,
    max_history: usize,
    offline_threshold: u32,
}

impl NetworkStatus {
    pub fn new(config: &StoreConfig) -> Self {
        Self::with_tuning(config.max_history_size, config.offline_threshold)
    }

    pub fn with_tuning(max_history: usize, offline_threshold: u32) -> Self {
        Self {
            inner: Mutex::new(Inner {
                history: VecDeque::with_capacity(max_history),
                consecutive_failures: 0,
                // Optimistic until the host says otherwise.
                online: true,
            }),
            recovered: Notify::new(),
            max_history: max_history.max(1),
            offline_threshold: offline_threshold.max(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Feeds one probe result in. A success flips the state online and
    /// wakes every waiter; failures only flip offline once the consecutive
    /// count reaches the threshold, so one dropped request doesn't take the
    /// app offline.
    pub fn record_probe(&self, success: bool) {
        let mut inner = self.lock();
        inner.history.push_back(ProbeSample {
            at_ms: now_ms(),
            success,
        });
        while inner.history.len() > self.max_history {
            inner.history.pop_front();
        }

        if success {
            inner.consecutive_failures = 0;
            let was_offline = !inner.online;
            inner.online = true;
            drop(inner);
            if was_offline {
                tracing::info!(target = "vikingbase", event = "network_recovered");
            }
            self.recovered.notify_waiters();
        } else {
            inner.consecutive_failures += 1;
            if inner.consecutive_failures >= self.offline_threshold && inner.online {
                inner.online = false;
                tracing::warn!(
                    target = "vikingbase",
                    event = "network_offline",
                    failures = inner.consecutive_failures
                );
            }
        }
    }

    pub fn is_online(&self) -> bool {
        self.lock().online
    }

    pub fn history(&self) -> Vec<ProbeSample> {
        self.lock().history.iter().copied().collect()
    }

    /// Resolves as soon as the status is online, or errors after
    /// `timeout_ms` without a recovery.
    pub async fn wait_for_connection(&self, timeout_ms: u64) -> AppResult<()> {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            // Arm the notification before re-checking, so a recovery landing
            // between the check and the wait is not missed.
            let notified = self.recovered.notified();
            if self.is_online() {
                return Ok(());
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(AppError::new(
                    AppError::STORE_UNAVAILABLE,
                    format!("still offline after {timeout_ms}ms"),
                ));
            }
        }
    }
}
