// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Optimistic-concurrency retry for updates
//!
//! Each attempt reads the current object directly from the API server, copies
//! its resourceVersion onto the caller's desired object and writes it back.
//! A version conflict sends the loop around again after a backoff delay; any
//! other failure ends it. Every read, write and sleep is an await point, so
//! dropping the future (or wrapping it in `tokio::time::timeout`) cancels it.

use std::time::Duration;

use kube::api::DynamicObject;
use rand::Rng;
use tracing::{debug, warn};

use super::catalog::ResourceKind;
use super::error::{Error, Operation, Result};
use super::store::{ObjectReader, ObjectWriter};
use super::ObjectKey;

/// Decides whether and when a failed attempt is tried again
pub trait RetryPolicy: Send + Sync {
    /// Delay before the next attempt, or None to give up.
    /// `attempt` is the 0-indexed number of the attempt that just failed.
    fn next_delay(&self, attempt: u32, err: &Error) -> Option<Duration>;

    /// Upper bound on attempts, for reporting
    fn max_attempts(&self) -> u32;
}

/// Default conflict backoff: bounded attempts, exponential delay, slight jitter
#[derive(Debug, Clone)]
pub struct ConflictBackoff {
    /// Maximum number of attempts (including the first one)
    pub max_attempts: u32,
    /// Delay after the first conflict
    pub base_delay: Duration,
    /// Multiplier applied per attempt
    pub factor: f64,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Random spread as a fraction of the delay (0.1 = up to +10%)
    pub jitter: f64,
}

impl Default for ConflictBackoff {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(10),
            factor: 2.0,
            max_delay: Duration::from_secs(1),
            jitter: 0.1,
        }
    }
}

impl ConflictBackoff {
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay after the given failed attempt (0-indexed)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let multiplier = self.factor.powi(attempt as i32);
        let secs = (self.base_delay.as_secs_f64() * multiplier).min(self.max_delay.as_secs_f64());

        let secs = if self.jitter > 0.0 {
            let spread = rand::rng().random_range(0.0..=self.jitter);
            (secs * (1.0 + spread)).min(self.max_delay.as_secs_f64())
        } else {
            secs
        };

        Duration::from_secs_f64(secs)
    }
}

impl RetryPolicy for ConflictBackoff {
    fn next_delay(&self, attempt: u32, err: &Error) -> Option<Duration> {
        if !err.is_conflict() || attempt + 1 >= self.max_attempts {
            return None;
        }
        Some(self.delay_for(attempt))
    }

    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

/// Which write the protocol submits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteTarget {
    /// Full object replace
    Object,
    /// Status subresource replace
    Status,
}

impl WriteTarget {
    fn operation(self) -> Operation {
        match self {
            WriteTarget::Object => Operation::Update,
            WriteTarget::Status => Operation::StatusUpdate,
        }
    }
}

/// Write `desired` with the resourceVersion of a fresh direct read, retrying
/// on conflicts as allowed by `policy`
pub async fn update_on_conflict(
    reader: &dyn ObjectReader,
    writer: &dyn ObjectWriter,
    policy: &dyn RetryPolicy,
    kind: &ResourceKind,
    desired: &DynamicObject,
    target: WriteTarget,
) -> Result<DynamicObject> {
    let key = ObjectKey::of(desired);
    let mut obj = desired.clone();
    let mut attempt = 0u32;

    loop {
        // A failed read is not a conflict; it ends the protocol as-is
        let current = reader.get(kind, &key).await.inspect_err(|e| {
            debug!(kind = %kind, key = %key, error = %e, "Failed to fetch latest object for update");
        })?;
        obj.metadata.resource_version = current.metadata.resource_version;

        let written = match target {
            WriteTarget::Object => writer.update(kind, &obj).await,
            WriteTarget::Status => writer.update_status(kind, &obj).await,
        };

        let err = match written {
            Ok(stored) => {
                if attempt > 0 {
                    debug!(kind = %kind, key = %key, attempts = attempt + 1, "Update succeeded after conflicts");
                }
                return Ok(stored);
            }
            Err(e) => e,
        };

        if !err.is_conflict() {
            return Err(err);
        }

        match policy.next_delay(attempt, &err) {
            Some(delay) => {
                debug!(
                    kind = %kind,
                    key = %key,
                    attempt = attempt + 1,
                    max_attempts = policy.max_attempts(),
                    delay_ms = delay.as_millis() as u64,
                    "Version conflict, retrying with fresh resourceVersion"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            None => {
                warn!(
                    kind = %kind,
                    key = %key,
                    attempts = attempt + 1,
                    "Giving up after repeated version conflicts"
                );
                let message = match err {
                    Error::Conflict { message, .. } => message,
                    other => other.to_string(),
                };
                return Err(Error::Conflict {
                    op: target.operation(),
                    kind: kind.to_string(),
                    key,
                    message: format!("still conflicting after {} attempts: {}", attempt + 1, message),
                });
            }
        }
    }
}
