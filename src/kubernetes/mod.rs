// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

mod cache;
pub mod catalog;
mod client;
mod error;
pub mod retry;
pub mod selector;
mod store;
#[cfg(test)]
pub(crate) mod testing;

use std::fmt;

use kube::Resource;

pub use cache::{CacheBuilder, KubeWatchSource, WatchCache, WatchSource};
pub use catalog::{CATALOG, Catalog, MANAGED_BY_LABEL_KEY, MANAGED_BY_LABEL_VALUE, ResourceKind};
pub use client::AccessClient;
pub use error::{Error, Operation, Result};
pub use retry::{ConflictBackoff, RetryPolicy};
pub use selector::parse_label_selector;
pub use store::{ApiStore, ObjectReader, ObjectWriter};

/// Identifies a single object of a kind: namespace (None when cluster-scoped) and name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    /// Key for a namespaced object
    pub fn namespaced(namespace: &str, name: &str) -> Self {
        Self {
            namespace: Some(namespace.to_string()),
            name: name.to_string(),
        }
    }

    /// Key for a cluster-scoped object
    pub fn cluster(name: &str) -> Self {
        Self {
            namespace: None,
            name: name.to_string(),
        }
    }

    /// Key of an object, taken from its metadata
    pub fn of<K: Resource>(obj: &K) -> Self {
        let meta = obj.meta();
        Self {
            namespace: meta.namespace.clone().filter(|ns| !ns.is_empty()),
            name: meta.name.clone().unwrap_or_default(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Parameters for list calls, pushed down to the API server on direct lists
/// and evaluated in memory on cached lists
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    /// Restrict to one namespace (None lists across all namespaces)
    pub namespace: Option<String>,
    /// Label selector string (e.g., "app=nginx,tier in (web,api)")
    pub label_selector: Option<String>,
    /// Field selector string (e.g., "metadata.name=foo")
    pub field_selector: Option<String>,
}

impl ListOptions {
    pub fn in_namespace(namespace: &str) -> Self {
        Self {
            namespace: Some(namespace.to_string()),
            ..Default::default()
        }
    }

    pub fn labels(mut self, selector: &str) -> Self {
        self.label_selector = Some(selector.to_string());
        self
    }

    pub fn fields(mut self, selector: &str) -> Self {
        self.field_selector = Some(selector.to_string());
        self
    }
}
