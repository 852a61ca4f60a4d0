// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Read/write seams and the direct (uncached) API server store
//!
//! Objects travel as `DynamicObject` tagged with their `ResourceKind`, so one
//! implementation serves every kind in the catalog and any kind outside it.

use async_trait::async_trait;
use kube::api::{DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::{Api, Client};
use tracing::{debug, trace};

use super::catalog::ResourceKind;
use super::error::{Error, Operation, Result};
use super::{ListOptions, ObjectKey};

/// Point reads and lists
#[async_trait]
pub trait ObjectReader: Send + Sync {
    async fn get(&self, kind: &ResourceKind, key: &ObjectKey) -> Result<DynamicObject>;

    async fn list(&self, kind: &ResourceKind, options: &ListOptions) -> Result<Vec<DynamicObject>>;
}

/// Writes; `update` and `update_status` are conditional on the object's resourceVersion
#[async_trait]
pub trait ObjectWriter: Send + Sync {
    async fn create(&self, kind: &ResourceKind, obj: &DynamicObject) -> Result<DynamicObject>;

    async fn update(&self, kind: &ResourceKind, obj: &DynamicObject) -> Result<DynamicObject>;

    async fn update_status(&self, kind: &ResourceKind, obj: &DynamicObject)
    -> Result<DynamicObject>;

    async fn patch(
        &self,
        kind: &ResourceKind,
        key: &ObjectKey,
        patch: &Patch<serde_json::Value>,
    ) -> Result<DynamicObject>;

    async fn delete(&self, kind: &ResourceKind, key: &ObjectKey) -> Result<()>;
}

/// Direct access to the API server, bypassing every cache
#[derive(Clone)]
pub struct ApiStore {
    client: Client,
    field_manager: String,
}

impl ApiStore {
    pub fn new(client: Client, field_manager: &str) -> Self {
        Self {
            client,
            field_manager: field_manager.to_string(),
        }
    }

    /// API handle for an object: namespaced when the key has a namespace
    fn api(&self, kind: &ResourceKind, namespace: Option<&str>) -> Api<DynamicObject> {
        let ar = &kind.api_resource;
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, ar),
            None => Api::all_with(self.client.clone(), ar),
        }
    }

    fn post_params(&self) -> PostParams {
        PostParams {
            dry_run: false,
            field_manager: Some(self.field_manager.clone()),
        }
    }

    fn patch_params(&self, patch: &Patch<serde_json::Value>) -> PatchParams {
        // Server-side apply requires a field manager; other patch types take it as a hint
        if matches!(patch, Patch::Apply(_)) {
            PatchParams::apply(&self.field_manager)
        } else {
            PatchParams {
                field_manager: Some(self.field_manager.clone()),
                ..Default::default()
            }
        }
    }

    /// Build ListParams from list options (label selectors, field selectors)
    fn list_params(options: &ListOptions) -> ListParams {
        let mut params = ListParams::default();

        if let Some(ref label_sel) = options.label_selector {
            params = params.labels(label_sel);
        }

        if let Some(ref field_sel) = options.field_selector {
            params = params.fields(field_sel);
        }

        trace!(
            label_selector = ?options.label_selector,
            field_selector = ?options.field_selector,
            "Built ListParams"
        );

        params
    }
}

/// Ensure an object read from the API server carries apiVersion/kind,
/// which list responses omit per item
pub(crate) fn with_type_meta(kind: &ResourceKind, mut obj: DynamicObject) -> DynamicObject {
    if obj.types.is_none() {
        obj.types = Some(kube::core::TypeMeta {
            api_version: kind.api_version().to_string(),
            kind: kind.kind().to_string(),
        });
    }
    obj
}

#[async_trait]
impl ObjectReader for ApiStore {
    async fn get(&self, kind: &ResourceKind, key: &ObjectKey) -> Result<DynamicObject> {
        debug!(kind = %kind, key = %key, "Direct read");
        self.api(kind, key.namespace.as_deref())
            .get(&key.name)
            .await
            .map(|obj| with_type_meta(kind, obj))
            .map_err(|e| Error::from_kube(e, Operation::Get, &kind.to_string(), key))
    }

    async fn list(&self, kind: &ResourceKind, options: &ListOptions) -> Result<Vec<DynamicObject>> {
        debug!(kind = %kind, namespace = ?options.namespace, "Direct list");
        let list = self
            .api(kind, options.namespace.as_deref())
            .list(&Self::list_params(options))
            .await
            .map_err(|source| Error::ListFailed {
                kind: kind.to_string(),
                source,
            })?;
        Ok(list
            .items
            .into_iter()
            .map(|obj| with_type_meta(kind, obj))
            .collect())
    }
}

#[async_trait]
impl ObjectWriter for ApiStore {
    async fn create(&self, kind: &ResourceKind, obj: &DynamicObject) -> Result<DynamicObject> {
        let key = ObjectKey::of(obj);
        debug!(kind = %kind, key = %key, "Create");
        self.api(kind, key.namespace.as_deref())
            .create(&self.post_params(), obj)
            .await
            .map(|obj| with_type_meta(kind, obj))
            .map_err(|e| Error::from_kube(e, Operation::Create, &kind.to_string(), &key))
    }

    async fn update(&self, kind: &ResourceKind, obj: &DynamicObject) -> Result<DynamicObject> {
        let key = ObjectKey::of(obj);
        debug!(
            kind = %kind,
            key = %key,
            resource_version = ?obj.metadata.resource_version,
            "Update"
        );
        self.api(kind, key.namespace.as_deref())
            .replace(&key.name, &self.post_params(), obj)
            .await
            .map(|obj| with_type_meta(kind, obj))
            .map_err(|e| Error::from_kube(e, Operation::Update, &kind.to_string(), &key))
    }

    async fn update_status(
        &self,
        kind: &ResourceKind,
        obj: &DynamicObject,
    ) -> Result<DynamicObject> {
        let key = ObjectKey::of(obj);
        debug!(
            kind = %kind,
            key = %key,
            resource_version = ?obj.metadata.resource_version,
            "Status update"
        );
        let body = serde_json::to_vec(obj).map_err(|source| Error::Serialization {
            kind: kind.to_string(),
            key: key.clone(),
            source,
        })?;
        self.api(kind, key.namespace.as_deref())
            .replace_status(&key.name, &self.post_params(), body)
            .await
            .map(|obj| with_type_meta(kind, obj))
            .map_err(|e| Error::from_kube(e, Operation::StatusUpdate, &kind.to_string(), &key))
    }

    async fn patch(
        &self,
        kind: &ResourceKind,
        key: &ObjectKey,
        patch: &Patch<serde_json::Value>,
    ) -> Result<DynamicObject> {
        debug!(kind = %kind, key = %key, "Patch");
        self.api(kind, key.namespace.as_deref())
            .patch(&key.name, &self.patch_params(patch), patch)
            .await
            .map(|obj| with_type_meta(kind, obj))
            .map_err(|e| Error::from_kube(e, Operation::Patch, &kind.to_string(), key))
    }

    async fn delete(&self, kind: &ResourceKind, key: &ObjectKey) -> Result<()> {
        debug!(kind = %kind, key = %key, "Delete");
        self.api(kind, key.namespace.as_deref())
            .delete(&key.name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| Error::from_kube(e, Operation::Delete, &kind.to_string(), key))
    }
}
