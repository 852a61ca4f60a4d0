// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Logging setup for programs embedding the access layer
//!
//! Logs go to a rotating file under ~/.ztwim/log/ and, optionally, to
//! stderr. `RUST_LOG` overrides the default filter.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing_rolling_file::{RollingConditionBase, RollingFileAppenderBase};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::prelude::*;

use crate::config;

/// Rotate at this size
const MAX_LOG_SIZE: u64 = 10 * 1024 * 1024;

/// Rotated files kept besides the active one
const MAX_LOG_FILES: usize = 5;

/// Directory holding log files (~/.ztwim/log/)
pub fn log_dir() -> Result<PathBuf> {
    Ok(config::base_dir()?.join("log"))
}

/// Filter used when RUST_LOG is not set
pub fn default_filter(verbose: bool) -> &'static str {
    if verbose {
        "ztwim_client=debug,kube=info"
    } else {
        "ztwim_client=info,kube=warn"
    }
}

/// Rotating appender for ztwim.log in `dir`, creating the directory if needed
fn file_appender(dir: &Path) -> Result<RollingFileAppenderBase> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Could not create log directory: {}", dir.display()))?;

    // Daily or at 10MB, whichever comes first
    let condition = RollingConditionBase::new().daily().max_size(MAX_LOG_SIZE);
    RollingFileAppenderBase::new(dir.join("ztwim.log"), condition, MAX_LOG_FILES)
        .context("Could not create log file")
}

/// Install the global subscriber: rotating file always, stderr when `to_stderr`
pub fn init_logging(verbose: bool, to_stderr: bool) -> Result<()> {
    let (non_blocking, _guard) = file_appender(&log_dir()?)?.get_non_blocking_appender();
    // Leak the guard to keep the background writer alive
    std::mem::forget(_guard);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter(verbose)));

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_span_events(FmtSpan::NONE);

    let stderr_layer = to_stderr.then(|| {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_span_events(FmtSpan::NONE)
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stderr_layer)
        .try_init()
        .context("A global tracing subscriber is already installed")
}
