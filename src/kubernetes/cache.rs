// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Watch-backed local cache of cluster objects
//!
//! One watch per cached kind feeds a reflector store. Filtered kinds are
//! watched with the catalog's label selector so non-matching objects never
//! reach the process. Eager kinds must finish their initial list before
//! `CacheBuilder::build` returns; the remaining cached kinds start their
//! watch on first read.
//!
//! The cache is eventually consistent: a read may lag a write made through
//! the direct path until the watch delivers it.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{StreamExt, future};
use kube::api::DynamicObject;
use kube::core::{Selector, SelectorExt};
use kube::runtime::reflector::store::Writer;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::watcher;
use kube::{Api, Client};
use tokio::sync::{OnceCell, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::catalog::{Catalog, ResourceKind};
use super::error::{Error, Operation, Result};
use super::selector::{FieldSelector, parse_label_selector};
use super::store::{ObjectReader, with_type_meta};
use super::{ListOptions, ObjectKey};
use crate::progress::ProgressHandle;

/// Default time allowed for eager watches to complete their initial list
pub const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(120);

/// Delay before resuming a watch that failed after its initial sync
const WATCH_RETRY_BASE: Duration = Duration::from_secs(1);
const WATCH_RETRY_MAX: Duration = Duration::from_secs(30);

/// Field paths the cache can evaluate in memory
const CACHE_FIELD_PATHS: &[&str] = &["metadata.name", "metadata.namespace"];

type EventStream = BoxStream<'static, watcher::Result<watcher::Event<DynamicObject>>>;

/// Source of watch event streams, one per kind
pub trait WatchSource: Send + Sync {
    /// Cluster-wide watch of a kind, optionally scoped by a label selector
    fn watch(&self, kind: &ResourceKind, label_selector: Option<&Selector>) -> EventStream;
}

/// Watches served by the API server
#[derive(Clone)]
pub struct KubeWatchSource {
    client: Client,
}

impl KubeWatchSource {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl WatchSource for KubeWatchSource {
    fn watch(&self, kind: &ResourceKind, label_selector: Option<&Selector>) -> EventStream {
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &kind.api_resource);
        let mut config = watcher::Config::default();
        if let Some(selector) = label_selector {
            config = config.labels_from(selector);
        }
        watcher(api, config).boxed()
    }
}

/// Configures and starts a `WatchCache`
pub struct CacheBuilder {
    source: Arc<dyn WatchSource>,
    kinds: Vec<(ResourceKind, Option<Selector>)>,
    eager: Vec<ResourceKind>,
    sync_timeout: Duration,
    shutdown: CancellationToken,
    progress: Option<ProgressHandle>,
}

impl CacheBuilder {
    pub fn new(source: Arc<dyn WatchSource>) -> Self {
        Self {
            source,
            kinds: Vec::new(),
            eager: Vec::new(),
            sync_timeout: DEFAULT_SYNC_TIMEOUT,
            shutdown: CancellationToken::new(),
            progress: None,
        }
    }

    /// Builder preloaded with every kind and filter from a catalog
    pub fn from_catalog(source: Arc<dyn WatchSource>, catalog: &Catalog) -> Self {
        let mut builder = Self::new(source);
        for kind in &catalog.filtered {
            builder = builder.filtered(kind.clone(), catalog.filter.clone());
        }
        for kind in &catalog.unfiltered {
            builder = builder.unfiltered(kind.clone());
        }
        for kind in &catalog.eager {
            builder = builder.eager(kind.clone());
        }
        builder
    }

    /// Cache a kind, keeping only objects matching `selector`
    pub fn filtered(mut self, kind: ResourceKind, selector: Selector) -> Self {
        self.kinds.retain(|(k, _)| k != &kind);
        self.kinds.push((kind, Some(selector)));
        self
    }

    /// Cache every object of a kind
    pub fn unfiltered(mut self, kind: ResourceKind) -> Self {
        self.kinds.retain(|(k, _)| k != &kind);
        self.kinds.push((kind, None));
        self
    }

    /// Require a kind's watch to be synced before `build` returns
    pub fn eager(mut self, kind: ResourceKind) -> Self {
        if !self.eager.contains(&kind) {
            self.eager.push(kind);
        }
        self
    }

    pub fn sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = timeout;
        self
    }

    /// Token that stops every watch when cancelled
    pub fn shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn progress(mut self, progress: ProgressHandle) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Start all eager watches and wait for their initial lists.
    ///
    /// Fails if any eager watch errors, ends or misses the sync deadline;
    /// watches already started are stopped before returning.
    pub async fn build(self) -> Result<WatchCache> {
        let cached: Vec<&ResourceKind> = self.kinds.iter().map(|(k, _)| k).collect();
        if let Some(kind) = self.eager.iter().find(|k| !cached.contains(k)) {
            return Err(Error::NotCached {
                kind: kind.to_string(),
            });
        }

        let cache = WatchCache {
            kinds: self
                .kinds
                .into_iter()
                .map(|(kind, selector)| {
                    let entry = KindCache {
                        selector,
                        store: OnceCell::new(),
                    };
                    (kind, entry)
                })
                .collect(),
            source: self.source,
            // Child token: a failed build stops its own watches only
            shutdown: self.shutdown.child_token(),
            sync_timeout: self.sync_timeout,
            progress: self.progress,
        };

        let start = Instant::now();
        let results = future::join_all(self.eager.iter().map(|kind| cache.store_for(kind))).await;
        if let Some(err) = results.into_iter().find_map(|r| r.err()) {
            warn!(error = %err, "Cache construction failed, stopping started watches");
            cache.shutdown.cancel();
            return Err(err);
        }

        let elapsed_ms = start.elapsed().as_millis() as u64;
        info!(
            eager = self.eager.len(),
            cached = cache.kinds.len(),
            elapsed_ms,
            "Cache synced"
        );
        if let Some(ref progress) = cache.progress {
            progress.cache_ready(self.eager.len(), elapsed_ms);
        }

        Ok(cache)
    }
}

struct KindCache {
    selector: Option<Selector>,
    store: OnceCell<Store<DynamicObject>>,
}

/// Read side of the watch cache
pub struct WatchCache {
    kinds: HashMap<ResourceKind, KindCache>,
    source: Arc<dyn WatchSource>,
    shutdown: CancellationToken,
    sync_timeout: Duration,
    progress: Option<ProgressHandle>,
}

impl WatchCache {
    /// Whether reads of this kind are served from the cache
    pub fn serves(&self, kind: &ResourceKind) -> bool {
        self.kinds.contains_key(kind)
    }

    /// Whether a kind's watch is running and synced
    pub fn is_synced(&self, kind: &ResourceKind) -> bool {
        self.kinds
            .get(kind)
            .is_some_and(|entry| entry.store.initialized())
    }

    /// Stop every watch; reads of already-synced kinds keep returning the last state
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Store for a kind, starting its watch on first use
    async fn store_for(&self, kind: &ResourceKind) -> Result<&Store<DynamicObject>> {
        let entry = self.kinds.get(kind).ok_or_else(|| Error::NotCached {
            kind: kind.to_string(),
        })?;
        entry
            .store
            .get_or_try_init(|| self.start_watch(kind, entry.selector.as_ref()))
            .await
    }

    async fn start_watch(
        &self,
        kind: &ResourceKind,
        selector: Option<&Selector>,
    ) -> Result<Store<DynamicObject>> {
        debug!(
            kind = %kind,
            selector = ?selector.map(Selector::to_string),
            "Starting watch"
        );
        if let Some(ref progress) = self.progress {
            progress.watch_starting(&kind.to_string());
        }

        let writer = Writer::new(kind.api_resource.clone());
        let store = writer.as_reader();
        let stream = self.source.watch(kind, selector);
        let (ready_tx, ready_rx) = oneshot::channel();
        let token = self.shutdown.child_token();

        tokio::spawn(run_watch(
            kind.clone(),
            stream,
            writer,
            ready_tx,
            token.clone(),
        ));
        // Stops the watch if this wait fails or is dropped before sync
        let guard = token.drop_guard();

        let start = Instant::now();
        let result = match tokio::time::timeout(self.sync_timeout, ready_rx).await {
            Ok(Ok(Ok(()))) => Ok(store),
            Ok(Ok(Err(err))) => Err(err),
            // Task ended without reporting, e.g. shut down mid-sync
            Ok(Err(_)) => Err(Error::WatchClosed {
                kind: kind.to_string(),
            }),
            Err(_) => Err(Error::SyncTimeout {
                kind: kind.to_string(),
                timeout: self.sync_timeout,
            }),
        };

        match &result {
            Ok(_) => {
                guard.disarm();
                let elapsed_ms = start.elapsed().as_millis() as u64;
                debug!(kind = %kind, elapsed_ms, "Watch synced");
                if let Some(ref progress) = self.progress {
                    progress.watch_synced(&kind.to_string(), elapsed_ms);
                }
            }
            Err(err) => {
                drop(guard);
                warn!(kind = %kind, error = %err, "Watch failed to sync");
                if let Some(ref progress) = self.progress {
                    progress.watch_failed(&kind.to_string(), &err.to_string());
                }
            }
        }

        result
    }
}

impl Drop for WatchCache {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Drive one kind's watch into its store until shutdown.
///
/// The first error or end of stream before the initial list completes is
/// reported through `ready`. Later errors are logged and the watch resumes
/// after a capped delay.
async fn run_watch(
    kind: ResourceKind,
    mut stream: EventStream,
    mut writer: Writer<DynamicObject>,
    ready: oneshot::Sender<Result<()>>,
    shutdown: CancellationToken,
) {
    let mut ready = Some(ready);
    let mut retry_delay = WATCH_RETRY_BASE;

    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => {
                debug!(kind = %kind, "Watch stopped");
                return;
            }
            next = stream.next() => next,
        };

        match next {
            Some(Ok(event)) => {
                writer.apply_watcher_event(&event);
                retry_delay = WATCH_RETRY_BASE;
                if matches!(event, watcher::Event::InitDone)
                    && let Some(tx) = ready.take()
                {
                    let _ = tx.send(Ok(()));
                }
            }
            Some(Err(source)) => {
                if let Some(tx) = ready.take() {
                    let _ = tx.send(Err(Error::WatchFailed {
                        kind: kind.to_string(),
                        source,
                    }));
                    return;
                }
                warn!(
                    kind = %kind,
                    error = %source,
                    retry_in_ms = retry_delay.as_millis() as u64,
                    "Watch error, cache may serve stale data until it resumes"
                );
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(retry_delay) => {}
                }
                retry_delay = (retry_delay * 2).min(WATCH_RETRY_MAX);
            }
            None => {
                if let Some(tx) = ready.take() {
                    let _ = tx.send(Err(Error::WatchClosed {
                        kind: kind.to_string(),
                    }));
                } else {
                    warn!(kind = %kind, "Watch stream ended, cache for this kind is frozen");
                }
                return;
            }
        }
    }
}

/// Parse list options into in-memory predicates, rejecting field paths the
/// cache cannot evaluate
fn cache_predicates(
    kind: &ResourceKind,
    options: &ListOptions,
) -> Result<(Option<Selector>, Vec<FieldSelector>)> {
    let labels = options
        .label_selector
        .as_deref()
        .map(parse_label_selector)
        .transpose()?;

    let fields = match options.field_selector.as_deref() {
        Some(selector) => {
            let fields = FieldSelector::parse_all(selector)?;
            if let Some(field) = fields
                .iter()
                .find(|f| !CACHE_FIELD_PATHS.contains(&f.path.as_str()))
            {
                return Err(Error::UnsupportedSelector {
                    kind: kind.to_string(),
                    selector: field.to_k8s_string(),
                });
            }
            fields
        }
        None => Vec::new(),
    };

    Ok((labels, fields))
}

fn field_value<'a>(obj: &'a DynamicObject, path: &str) -> Option<&'a str> {
    match path {
        "metadata.name" => obj.metadata.name.as_deref(),
        "metadata.namespace" => obj.metadata.namespace.as_deref(),
        _ => None,
    }
}

#[async_trait]
impl ObjectReader for WatchCache {
    async fn get(&self, kind: &ResourceKind, key: &ObjectKey) -> Result<DynamicObject> {
        let store = self.store_for(kind).await?;
        let mut obj_ref = ObjectRef::new_with(&key.name, kind.api_resource.clone());
        if let Some(ref ns) = key.namespace {
            obj_ref = obj_ref.within(ns);
        }
        store
            .get(&obj_ref)
            .map(|obj| with_type_meta(kind, obj.as_ref().clone()))
            .ok_or_else(|| Error::NotFound {
                op: Operation::Get,
                kind: kind.to_string(),
                key: key.clone(),
            })
    }

    async fn list(&self, kind: &ResourceKind, options: &ListOptions) -> Result<Vec<DynamicObject>> {
        let (labels, fields) = cache_predicates(kind, options)?;
        let store = self.store_for(kind).await?;
        let no_labels = BTreeMap::new();

        let mut items: Vec<DynamicObject> = store
            .state()
            .into_iter()
            .filter(|obj| {
                options.namespace.is_none()
                    || obj.metadata.namespace.as_deref() == options.namespace.as_deref()
            })
            .filter(|obj| {
                labels.as_ref().is_none_or(|selector| {
                    selector.matches(obj.metadata.labels.as_ref().unwrap_or(&no_labels))
                })
            })
            .filter(|obj| {
                fields
                    .iter()
                    .all(|f| f.matches(field_value(obj, &f.path)))
            })
            .map(|obj| with_type_meta(kind, obj.as_ref().clone()))
            .collect();

        items.sort_by_cached_key(ObjectKey::of);
        debug!(kind = %kind, count = items.len(), "Cached list");
        Ok(items)
    }
}
