// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! In-memory API server for tests
//!
//! `MemoryStore` stands in for both the direct store and the watch source:
//! writes bump a global resourceVersion, conditional updates enforce it, and
//! every running watch receives the changes that match its label selector.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use futures::StreamExt;
use futures::channel::mpsc;
use futures::stream;
use kube::api::{DynamicObject, ObjectMeta, Patch};
use kube::core::{ErrorResponse, Selector, SelectorExt, TypeMeta};
use kube::runtime::watcher;

use super::cache::WatchSource;
use super::catalog::{MANAGED_BY_LABEL_KEY, MANAGED_BY_LABEL_VALUE, ResourceKind};
use super::error::{Error, Operation, Result};
use super::selector::{FieldSelector, parse_label_selector};
use super::store::{ObjectReader, ObjectWriter};
use super::{ListOptions, ObjectKey};
use futures::stream::BoxStream;

type Event = watcher::Result<watcher::Event<DynamicObject>>;

pub(crate) fn api_error(code: u16, reason: &str) -> kube::Error {
    kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{} ({})", reason, code),
        reason: reason.to_string(),
        code,
    })
}

fn object(api_version: &str, kind: &str, ns: &str, name: &str, data: serde_json::Value) -> DynamicObject {
    DynamicObject {
        types: Some(TypeMeta {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
        }),
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: (!ns.is_empty()).then(|| ns.to_string()),
            ..Default::default()
        },
        data,
    }
}

/// ConfigMap with the given data entries; an empty `rv` leaves resourceVersion unset
pub(crate) fn config_map(ns: &str, name: &str, data: &[(&str, &str)], rv: &str) -> DynamicObject {
    let entries: serde_json::Map<String, serde_json::Value> = data
        .iter()
        .map(|(k, v)| (k.to_string(), serde_json::Value::String(v.to_string())))
        .collect();
    let mut obj = object("v1", "ConfigMap", ns, name, serde_json::json!({ "data": entries }));
    obj.metadata.resource_version = (!rv.is_empty()).then(|| rv.to_string());
    obj
}

/// Role, optionally carrying the managed-by label
pub(crate) fn role(ns: &str, name: &str, managed: bool) -> DynamicObject {
    let mut obj = object(
        "rbac.authorization.k8s.io/v1",
        "Role",
        ns,
        name,
        serde_json::json!({ "rules": [] }),
    );
    if managed {
        obj.metadata.labels = Some(BTreeMap::from([(
            MANAGED_BY_LABEL_KEY.to_string(),
            MANAGED_BY_LABEL_VALUE.to_string(),
        )]));
    }
    obj
}

#[derive(Clone, Copy)]
enum WatchMode {
    Deny,
    Close,
    Stall,
}

struct Subscriber {
    kind: String,
    selector: Option<Selector>,
    tx: mpsc::UnboundedSender<Event>,
}

impl Subscriber {
    fn wants(&self, obj: &DynamicObject) -> bool {
        let no_labels = BTreeMap::new();
        self.selector
            .as_ref()
            .is_none_or(|s| s.matches(obj.metadata.labels.as_ref().unwrap_or(&no_labels)))
    }
}

#[derive(Default)]
struct State {
    objects: BTreeMap<(String, ObjectKey), DynamicObject>,
    version: u64,
    calls: HashMap<String, usize>,
    failures: HashMap<String, u16>,
    interfere: u32,
    watch_modes: HashMap<String, WatchMode>,
    watch_selectors: HashMap<String, Option<String>>,
    watches_started: usize,
    subscribers: Vec<Subscriber>,
}

impl State {
    /// Count a call and return any injected failure for it
    fn call(&mut self, op: &str) -> Option<u16> {
        *self.calls.entry(op.to_string()).or_default() += 1;
        self.failures.remove(op)
    }

    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }

    fn notify(&mut self, kind: &str, old: Option<&DynamicObject>, new: Option<&DynamicObject>) {
        self.subscribers.retain(|sub| !sub.tx.is_closed());
        for sub in self.subscribers.iter().filter(|s| s.kind == kind) {
            let event = match (old, new) {
                (_, Some(obj)) if sub.wants(obj) => watcher::Event::Apply(obj.clone()),
                (Some(obj), _) if sub.wants(obj) => watcher::Event::Delete(obj.clone()),
                _ => continue,
            };
            let _ = sub.tx.unbounded_send(Ok(event));
        }
    }
}

pub(crate) struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
        }
    }

    /// Seed an object, keeping its resourceVersion when one is set
    pub fn insert(&self, kind: &ResourceKind, mut obj: DynamicObject) {
        let mut state = self.state.lock().unwrap();
        match obj
            .metadata
            .resource_version
            .as_deref()
            .and_then(|rv| rv.parse::<u64>().ok())
        {
            Some(rv) => state.version = state.version.max(rv),
            None => obj.metadata.resource_version = Some(state.next_version()),
        }
        let key = (kind.to_string(), ObjectKey::of(&obj));
        state.objects.insert(key, obj);
    }

    pub fn object(&self, kind: &ResourceKind, key: &ObjectKey) -> Option<DynamicObject> {
        let state = self.state.lock().unwrap();
        state.objects.get(&(kind.to_string(), key.clone())).cloned()
    }

    /// Number of calls made to an operation ("get", "list", "create", ...)
    pub fn calls(&self, op: &str) -> usize {
        let state = self.state.lock().unwrap();
        state.calls.get(op).copied().unwrap_or(0)
    }

    /// Fail the next call of an operation with an API status code
    pub fn fail_next(&self, op: &str, code: u16) {
        let mut state = self.state.lock().unwrap();
        state.failures.insert(op.to_string(), code);
    }

    /// Have a concurrent writer bump the stored object just before each of
    /// the next `n` updates lands
    pub fn interfere_with_updates(&self, n: u32) {
        self.state.lock().unwrap().interfere = n;
    }

    /// Watches of this kind fail their initial list with 403
    pub fn deny_watch(&self, kind: &ResourceKind) {
        self.set_watch_mode(kind, WatchMode::Deny);
    }

    /// Watches of this kind end before the initial list
    pub fn close_watch(&self, kind: &ResourceKind) {
        self.set_watch_mode(kind, WatchMode::Close);
    }

    /// Watches of this kind never deliver anything
    pub fn stall_watch(&self, kind: &ResourceKind) {
        self.set_watch_mode(kind, WatchMode::Stall);
    }

    fn set_watch_mode(&self, kind: &ResourceKind, mode: WatchMode) {
        let mut state = self.state.lock().unwrap();
        state.watch_modes.insert(kind.to_string(), mode);
    }

    pub fn watches_started(&self) -> usize {
        self.state.lock().unwrap().watches_started
    }

    /// Label selector the last watch of a kind was opened with
    pub fn watch_selector(&self, kind: &ResourceKind) -> Option<String> {
        let state = self.state.lock().unwrap();
        state.watch_selectors.get(&kind.to_string()).cloned().flatten()
    }

    fn failure(op: Operation, code: u16, kind: &ResourceKind, key: &ObjectKey) -> Error {
        let reason = match code {
            403 => "Forbidden",
            404 => "NotFound",
            409 => "Conflict",
            _ => "InternalError",
        };
        Error::from_kube(api_error(code, reason), op, &kind.to_string(), key)
    }

    fn conditional_write(
        &self,
        op: &str,
        operation: Operation,
        kind: &ResourceKind,
        obj: &DynamicObject,
        status_only: bool,
    ) -> Result<DynamicObject> {
        let key = ObjectKey::of(obj);
        let mut state = self.state.lock().unwrap();
        if let Some(code) = state.call(op) {
            return Err(Self::failure(operation, code, kind, &key));
        }

        let map_key = (kind.to_string(), key.clone());
        if !state.objects.contains_key(&map_key) {
            return Err(Error::NotFound {
                op: operation,
                kind: kind.to_string(),
                key,
            });
        }

        if state.interfere > 0 {
            state.interfere -= 1;
            let version = state.next_version();
            if let Some(current) = state.objects.get_mut(&map_key) {
                current.metadata.resource_version = Some(version);
            }
        }

        let current = state.objects[&map_key].clone();
        if let Some(ref rv) = obj.metadata.resource_version
            && current.metadata.resource_version.as_ref() != Some(rv)
        {
            return Err(Error::Conflict {
                op: operation,
                kind: kind.to_string(),
                key,
                message: format!(
                    "the object has been modified; expected resourceVersion {:?}, have {}",
                    current.metadata.resource_version, rv
                ),
            });
        }

        let mut stored = if status_only {
            let mut stored = current.clone();
            if let Some(status) = obj.data.get("status") {
                stored.data["status"] = status.clone();
            }
            stored
        } else {
            obj.clone()
        };
        stored.metadata.resource_version = Some(state.next_version());
        state.objects.insert(map_key, stored.clone());
        state.notify(&kind.to_string(), Some(&current), Some(&stored));
        Ok(stored)
    }
}

/// RFC 7386 JSON merge patch
fn merge_patch(target: &mut serde_json::Value, patch: &serde_json::Value) {
    match patch {
        serde_json::Value::Object(entries) => {
            if !target.is_object() {
                *target = serde_json::json!({});
            }
            if let serde_json::Value::Object(map) = target {
                for (k, v) in entries {
                    if v.is_null() {
                        map.remove(k);
                    } else {
                        merge_patch(map.entry(k.clone()).or_insert(serde_json::Value::Null), v);
                    }
                }
            }
        }
        other => *target = other.clone(),
    }
}

#[async_trait]
impl ObjectReader for MemoryStore {
    async fn get(&self, kind: &ResourceKind, key: &ObjectKey) -> Result<DynamicObject> {
        let mut state = self.state.lock().unwrap();
        if let Some(code) = state.call("get") {
            return Err(Self::failure(Operation::Get, code, kind, key));
        }
        state
            .objects
            .get(&(kind.to_string(), key.clone()))
            .cloned()
            .ok_or_else(|| Error::NotFound {
                op: Operation::Get,
                kind: kind.to_string(),
                key: key.clone(),
            })
    }

    async fn list(&self, kind: &ResourceKind, options: &ListOptions) -> Result<Vec<DynamicObject>> {
        let labels = options
            .label_selector
            .as_deref()
            .map(parse_label_selector)
            .transpose()?;
        let fields = options
            .field_selector
            .as_deref()
            .map(FieldSelector::parse_all)
            .transpose()?
            .unwrap_or_default();

        let mut state = self.state.lock().unwrap();
        if let Some(code) = state.call("list") {
            return Err(Error::ListFailed {
                kind: kind.to_string(),
                source: api_error(code, "InternalError"),
            });
        }

        let kind_name = kind.to_string();
        let no_labels = BTreeMap::new();
        Ok(state
            .objects
            .iter()
            .filter(|((k, _), _)| *k == kind_name)
            .map(|(_, obj)| obj)
            .filter(|obj| {
                options.namespace.is_none()
                    || obj.metadata.namespace.as_deref() == options.namespace.as_deref()
            })
            .filter(|obj| {
                labels
                    .as_ref()
                    .is_none_or(|s| s.matches(obj.metadata.labels.as_ref().unwrap_or(&no_labels)))
            })
            .filter(|obj| {
                fields.iter().all(|f| match f.path.as_str() {
                    "metadata.name" => f.matches(obj.metadata.name.as_deref()),
                    "metadata.namespace" => f.matches(obj.metadata.namespace.as_deref()),
                    _ => true,
                })
            })
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ObjectWriter for MemoryStore {
    async fn create(&self, kind: &ResourceKind, obj: &DynamicObject) -> Result<DynamicObject> {
        let key = ObjectKey::of(obj);
        let mut state = self.state.lock().unwrap();
        if let Some(code) = state.call("create") {
            return Err(Self::failure(Operation::Create, code, kind, &key));
        }

        let map_key = (kind.to_string(), key.clone());
        if state.objects.contains_key(&map_key) {
            return Err(Error::AlreadyExists {
                op: Operation::Create,
                kind: kind.to_string(),
                key,
            });
        }

        let mut stored = obj.clone();
        stored.metadata.resource_version = Some(state.next_version());
        state.objects.insert(map_key, stored.clone());
        state.notify(&kind.to_string(), None, Some(&stored));
        Ok(stored)
    }

    async fn update(&self, kind: &ResourceKind, obj: &DynamicObject) -> Result<DynamicObject> {
        self.conditional_write("update", Operation::Update, kind, obj, false)
    }

    async fn update_status(
        &self,
        kind: &ResourceKind,
        obj: &DynamicObject,
    ) -> Result<DynamicObject> {
        self.conditional_write("update_status", Operation::StatusUpdate, kind, obj, true)
    }

    async fn patch(
        &self,
        kind: &ResourceKind,
        key: &ObjectKey,
        patch: &Patch<serde_json::Value>,
    ) -> Result<DynamicObject> {
        let mut state = self.state.lock().unwrap();
        if let Some(code) = state.call("patch") {
            return Err(Self::failure(Operation::Patch, code, kind, key));
        }

        let map_key = (kind.to_string(), key.clone());
        let current = state.objects.get(&map_key).cloned().ok_or_else(|| Error::NotFound {
            op: Operation::Patch,
            kind: kind.to_string(),
            key: key.clone(),
        })?;

        let body = match patch {
            Patch::Merge(v) | Patch::Apply(v) | Patch::Strategic(v) => v,
            #[allow(unreachable_patterns)]
            _ => {
                return Err(Self::failure(Operation::Patch, 415, kind, key));
            }
        };

        let serialization = |source| Error::Serialization {
            kind: kind.to_string(),
            key: key.clone(),
            source,
        };
        let mut value = serde_json::to_value(&current).map_err(serialization)?;
        merge_patch(&mut value, body);
        let mut stored: DynamicObject = serde_json::from_value(value).map_err(serialization)?;
        stored.metadata.resource_version = Some(state.next_version());
        state.objects.insert(map_key, stored.clone());
        state.notify(&kind.to_string(), Some(&current), Some(&stored));
        Ok(stored)
    }

    async fn delete(&self, kind: &ResourceKind, key: &ObjectKey) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(code) = state.call("delete") {
            return Err(Self::failure(Operation::Delete, code, kind, key));
        }
        let removed = state
            .objects
            .remove(&(kind.to_string(), key.clone()))
            .ok_or_else(|| Error::NotFound {
                op: Operation::Delete,
                kind: kind.to_string(),
                key: key.clone(),
            })?;
        state.notify(&kind.to_string(), Some(&removed), None);
        Ok(())
    }
}

impl WatchSource for MemoryStore {
    fn watch(
        &self,
        kind: &ResourceKind,
        label_selector: Option<&Selector>,
    ) -> BoxStream<'static, Event> {
        let mut state = self.state.lock().unwrap();
        let kind_name = kind.to_string();
        state.watches_started += 1;
        state
            .watch_selectors
            .insert(kind_name.clone(), label_selector.map(Selector::to_string));

        match state.watch_modes.get(&kind_name).copied() {
            Some(WatchMode::Deny) => {
                let denied = watcher::Error::InitialListFailed(api_error(403, "Forbidden"));
                return stream::iter(vec![Err(denied)])
                    .chain(stream::pending())
                    .boxed();
            }
            Some(WatchMode::Close) => return stream::empty().boxed(),
            Some(WatchMode::Stall) => return stream::pending().boxed(),
            None => {}
        }

        let (tx, rx) = mpsc::unbounded();
        let subscriber = Subscriber {
            kind: kind_name.clone(),
            selector: label_selector.cloned(),
            tx,
        };

        let mut initial = vec![Ok(watcher::Event::Init)];
        initial.extend(
            state
                .objects
                .iter()
                .filter(|((k, _), obj)| *k == kind_name && subscriber.wants(obj))
                .map(|(_, obj)| Ok(watcher::Event::InitApply(obj.clone()))),
        );
        initial.push(Ok(watcher::Event::InitDone));
        state.subscribers.push(subscriber);

        stream::iter(initial).chain(rx).boxed()
    }
}

/// Watch source driven by hand: each `watch` call takes the next queued
/// feed, and further calls get a stream that never yields
pub(crate) struct ScriptedWatch {
    feeds: Mutex<VecDeque<mpsc::UnboundedReceiver<Event>>>,
}

impl ScriptedWatch {
    pub fn new() -> Self {
        Self {
            feeds: Mutex::new(VecDeque::new()),
        }
    }

    /// Queue a stream for the next watch. The returned sender closes once
    /// the watch task drops its stream.
    pub fn feed(&self) -> mpsc::UnboundedSender<Event> {
        let (tx, rx) = mpsc::unbounded();
        self.feeds.lock().unwrap().push_back(rx);
        tx
    }
}

impl WatchSource for ScriptedWatch {
    fn watch(&self, _kind: &ResourceKind, _label_selector: Option<&Selector>) -> BoxStream<'static, Event> {
        match self.feeds.lock().unwrap().pop_front() {
            Some(rx) => rx.boxed(),
            None => stream::pending().boxed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;

    #[tokio::test]
    async fn test_versions_increase_across_writes() {
        let store = MemoryStore::new();
        let kind = ResourceKind::of::<ConfigMap>();
        let a = store.create(&kind, &config_map("ns", "a", &[], "")).await.unwrap();
        let b = store.create(&kind, &config_map("ns", "b", &[], "")).await.unwrap();
        assert_eq!(a.metadata.resource_version.as_deref(), Some("1"));
        assert_eq!(b.metadata.resource_version.as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_stale_update_conflicts() {
        let store = MemoryStore::new();
        let kind = ResourceKind::of::<ConfigMap>();
        store.insert(&kind, config_map("ns", "a", &[], "4"));

        let err = store
            .update(&kind, &config_map("ns", "a", &[], "3"))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_merge_patch() {
        let store = MemoryStore::new();
        let kind = ResourceKind::of::<ConfigMap>();
        store.insert(&kind, config_map("ns", "a", &[("keep", "1"), ("drop", "2")], "1"));

        let patch = Patch::Merge(serde_json::json!({ "data": { "drop": null, "new": "3" } }));
        let patched = store
            .patch(&kind, &ObjectKey::namespaced("ns", "a"), &patch)
            .await
            .unwrap();
        assert_eq!(patched.data["data"]["keep"], "1");
        assert_eq!(patched.data["data"]["new"], "3");
        assert!(patched.data["data"].get("drop").is_none());
    }

    #[tokio::test]
    async fn test_watch_replays_matching_objects() {
        let store = MemoryStore::new();
        let kind = ResourceKind::of::<ConfigMap>();
        store.insert(&kind, config_map("ns", "a", &[], "1"));

        let events: Vec<_> = store.watch(&kind, None).take(3).collect().await;
        assert!(matches!(events[0], Ok(watcher::Event::Init)));
        assert!(matches!(events[1], Ok(watcher::Event::InitApply(_))));
        assert!(matches!(events[2], Ok(watcher::Event::InitDone)));
    }
}
