// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Progress reporting for client construction
//!
//! Lets the embedding program observe connection and cache warm-up: each
//! watch reports when it starts, when its initial list is in, and when it
//! fails.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::broadcast;

/// Progress update message
#[derive(Clone, Debug)]
pub enum ProgressUpdate {
    // === Connection phases ===
    /// Connecting to a cluster
    Connecting { context: String },
    /// Connected to a cluster
    Connected { context: String, elapsed_ms: u64 },

    // === Cache warm-up ===
    /// A kind's watch was started
    WatchStarting { kind: String },
    /// A kind's initial list has been applied to the cache
    WatchSynced { kind: String, elapsed_ms: u64 },
    /// A kind's watch failed
    WatchFailed { kind: String, error: String },
    /// All eager watches are synced
    CacheReady { kinds: usize, elapsed_ms: u64 },
}

/// Progress reporter shared by the client builder and the cache
pub struct ProgressReporter {
    sender: broadcast::Sender<ProgressUpdate>,
    /// Count of synced watches
    watches_synced: AtomicUsize,
    /// Total watches started
    watches_total: AtomicUsize,
}

impl ProgressReporter {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(100);
        Self {
            sender,
            watches_synced: AtomicUsize::new(0),
            watches_total: AtomicUsize::new(0),
        }
    }

    /// Subscribe to progress updates
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressUpdate> {
        self.sender.subscribe()
    }

    /// Report connecting to a cluster
    pub fn connecting(&self, context: &str) {
        let _ = self.sender.send(ProgressUpdate::Connecting {
            context: context.to_string(),
        });
    }

    /// Report connected to a cluster
    pub fn connected(&self, context: &str, elapsed_ms: u64) {
        let _ = self.sender.send(ProgressUpdate::Connected {
            context: context.to_string(),
            elapsed_ms,
        });
    }

    /// Report a watch being started
    pub fn watch_starting(&self, kind: &str) {
        self.watches_total.fetch_add(1, Ordering::SeqCst);
        let _ = self.sender.send(ProgressUpdate::WatchStarting {
            kind: kind.to_string(),
        });
    }

    /// Report a watch completing its initial list
    pub fn watch_synced(&self, kind: &str, elapsed_ms: u64) {
        self.watches_synced.fetch_add(1, Ordering::SeqCst);
        let _ = self.sender.send(ProgressUpdate::WatchSynced {
            kind: kind.to_string(),
            elapsed_ms,
        });
    }

    pub fn watch_failed(&self, kind: &str, error: &str) {
        let _ = self.sender.send(ProgressUpdate::WatchFailed {
            kind: kind.to_string(),
            error: error.to_string(),
        });
    }

    pub fn cache_ready(&self, kinds: usize, elapsed_ms: u64) {
        let _ = self
            .sender
            .send(ProgressUpdate::CacheReady { kinds, elapsed_ms });
    }

    /// Get current progress (synced/started)
    pub fn progress(&self) -> (usize, usize) {
        (
            self.watches_synced.load(Ordering::SeqCst),
            self.watches_total.load(Ordering::SeqCst),
        )
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

/// Thread-safe handle to progress reporter
pub type ProgressHandle = Arc<ProgressReporter>;

/// Create a new progress reporter handle
pub fn create_progress_handle() -> ProgressHandle {
    Arc::new(ProgressReporter::new())
}
