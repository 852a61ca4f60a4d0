// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Cached access layer for the Kubernetes API.
//!
//! Reads are served from a watch-backed, label-filtered local cache with a
//! direct read fallback on "not found". Writes go straight to the API server,
//! and conflict-prone updates run through a read-modify-write retry loop.

pub mod config;
pub mod kubernetes;
pub mod logging;
pub mod progress;

pub use kubernetes::{
    AccessClient, CATALOG, Catalog, Error, ListOptions, ObjectKey, ResourceKind, Result,
};
