// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Error taxonomy for cached and direct access
//!
//! Every error names the operation, the resource kind and the object key it
//! concerns. API server failures are classified once, at the store boundary,
//! into `NotFound`, `AlreadyExists` and `Conflict`; everything else stays in
//! the transport bucket with the underlying `kube::Error` as its source.

use std::fmt;
use std::time::Duration;

use kube::runtime::watcher;
use thiserror::Error;

use super::ObjectKey;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Operation an error occurred in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Get,
    List,
    Create,
    Update,
    StatusUpdate,
    Patch,
    Delete,
    Watch,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operation::Get => "get",
            Operation::List => "list",
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::StatusUpdate => "update status of",
            Operation::Patch => "patch",
            Operation::Delete => "delete",
            Operation::Watch => "watch",
        })
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot {op} {kind} \"{key}\": not found")]
    NotFound {
        op: Operation,
        kind: String,
        key: ObjectKey,
    },

    #[error("cannot {op} {kind} \"{key}\": already exists")]
    AlreadyExists {
        op: Operation,
        kind: String,
        key: ObjectKey,
    },

    #[error("cannot {op} {kind} \"{key}\": conflict: {message}")]
    Conflict {
        op: Operation,
        kind: String,
        key: ObjectKey,
        message: String,
    },

    #[error("failed to {op} {kind} \"{key}\"")]
    Api {
        op: Operation,
        kind: String,
        key: ObjectKey,
        #[source]
        source: kube::Error,
    },

    #[error("failed to list {kind}")]
    ListFailed {
        kind: String,
        #[source]
        source: kube::Error,
    },

    #[error("failed to convert {kind} \"{key}\"")]
    Serialization {
        kind: String,
        key: ObjectKey,
        #[source]
        source: serde_json::Error,
    },

    #[error("{kind} is not served by the cache")]
    NotCached { kind: String },

    #[error("invalid selector \"{selector}\": {reason}")]
    InvalidSelector { selector: String, reason: String },

    #[error("field selector \"{selector}\" is not supported by the cache for {kind}")]
    UnsupportedSelector { kind: String, selector: String },

    #[error("watch for {kind} could not be established")]
    WatchFailed {
        kind: String,
        #[source]
        source: watcher::Error,
    },

    #[error("watch for {kind} ended before its initial list completed")]
    WatchClosed { kind: String },

    #[error("watch for {kind} did not sync within {timeout:?}")]
    SyncTimeout { kind: String, timeout: Duration },
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::AlreadyExists { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }

    /// Classify a kube error returned by a single-object call
    pub fn from_kube(err: kube::Error, op: Operation, kind: &str, key: &ObjectKey) -> Self {
        if let kube::Error::Api(resp) = &err {
            match (resp.code, resp.reason.as_str()) {
                (404, _) => {
                    return Error::NotFound {
                        op,
                        kind: kind.to_string(),
                        key: key.clone(),
                    };
                }
                (409, "AlreadyExists") => {
                    return Error::AlreadyExists {
                        op,
                        kind: kind.to_string(),
                        key: key.clone(),
                    };
                }
                (409, _) => {
                    return Error::Conflict {
                        op,
                        kind: kind.to_string(),
                        key: key.clone(),
                        message: resp.message.clone(),
                    };
                }
                _ => {}
            }
        }
        Error::Api {
            op,
            kind: kind.to_string(),
            key: key.clone(),
            source: err,
        }
    }
}
