// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Typed access client over the watch cache and the API server
//!
//! Reads go to the cache first and fall back to a direct read when the cache
//! says "not found", which covers objects the cache filters out as well as
//! objects it has not seen yet. Lists are served from the cache only. Writes
//! always go straight to the API server.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, anyhow};
use kube::api::{DynamicObject, Patch};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config as KubeConfig, Resource};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::cache::{CacheBuilder, KubeWatchSource};
use super::catalog::{CATALOG, ResourceKind};
use super::error::{Error, Result};
use super::retry::{ConflictBackoff, RetryPolicy, WriteTarget, update_on_conflict};
use super::store::{ApiStore, ObjectReader, ObjectWriter, with_type_meta};
use super::{ListOptions, ObjectKey};
use crate::config::Config;
use crate::progress::{ProgressHandle, create_progress_handle};

/// Cached reads, direct writes and conflict-safe updates for typed resources
#[derive(Clone)]
pub struct AccessClient {
    cache: Arc<dyn ObjectReader>,
    direct: Arc<dyn ObjectReader>,
    writer: Arc<dyn ObjectWriter>,
    retry: Arc<dyn RetryPolicy>,
}

impl AccessClient {
    pub fn new(
        cache: Arc<dyn ObjectReader>,
        direct: Arc<dyn ObjectReader>,
        writer: Arc<dyn ObjectWriter>,
    ) -> Self {
        Self {
            cache,
            direct,
            writer,
            retry: Arc::new(ConflictBackoff::default()),
        }
    }

    /// Replace the conflict retry policy used by the `*_with_retry` methods
    pub fn with_retry_policy(mut self, policy: impl RetryPolicy + 'static) -> Self {
        self.retry = Arc::new(policy);
        self
    }

    /// Connect using kubeconfig and start the catalog's watch cache.
    ///
    /// Returns only once every eager watch has synced; watches run until
    /// `shutdown` is cancelled.
    pub async fn connect(config: &Config, shutdown: CancellationToken) -> anyhow::Result<Self> {
        Self::connect_with_progress(config, shutdown, create_progress_handle()).await
    }

    /// Like `connect`, reporting connection and cache warm-up on `progress`
    pub async fn connect_with_progress(
        config: &Config,
        shutdown: CancellationToken,
        progress: ProgressHandle,
    ) -> anyhow::Result<Self> {
        // Fails when a provider is already installed, which is fine
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let kubeconfig = Kubeconfig::read().context("Failed to read kubeconfig")?;
        let context = config
            .context
            .clone()
            .or_else(|| kubeconfig.current_context.clone())
            .ok_or_else(|| anyhow!("No context specified and no current context in kubeconfig"))?;

        if !kubeconfig.contexts.iter().any(|c| c.name == context) {
            return Err(anyhow!("Context '{}' not found in kubeconfig", context));
        }

        progress.connecting(&context);
        let start = Instant::now();

        let mut kube_config = KubeConfig::from_custom_kubeconfig(
            kubeconfig,
            &KubeConfigOptions {
                context: Some(context.clone()),
                ..Default::default()
            },
        )
        .await
        .with_context(|| format!("Failed to load kubeconfig for context '{}'", context))?;

        kube_config.connect_timeout = Some(config.connect_timeout());
        kube_config.read_timeout = Some(config.read_timeout());

        let client = Client::try_from(kube_config)
            .with_context(|| format!("Failed to create client for context '{}'", context))?;

        progress.connected(&context, start.elapsed().as_millis() as u64);

        let cache = CacheBuilder::from_catalog(Arc::new(KubeWatchSource::new(client.clone())), &CATALOG)
            .sync_timeout(config.cache_sync_timeout())
            .shutdown(shutdown)
            .progress(progress)
            .build()
            .await
            .with_context(|| format!("Failed to sync resource cache for context '{}'", context))?;

        info!(
            context = %context,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Access client ready"
        );

        let direct = Arc::new(ApiStore::new(client, &config.field_manager));
        Ok(Self::new(Arc::new(cache), direct.clone(), direct)
            .with_retry_policy(config.retry.to_policy()))
    }

    /// Get an object: cache first, direct read when the cache does not have it
    pub async fn get<K>(&self, key: &ObjectKey) -> Result<K>
    where
        K: Resource<DynamicType = ()> + DeserializeOwned,
    {
        let kind = ResourceKind::of::<K>();
        let obj = match self.cache.get(&kind, key).await {
            Ok(obj) => obj,
            Err(err) if err.is_not_found() => {
                debug!(kind = %kind, key = %key, "Cache miss, reading from API server");
                self.direct.get(&kind, key).await?
            }
            Err(err) => return Err(err),
        };
        from_dynamic(&kind, obj)
    }

    /// List objects from the cache
    pub async fn list<K>(&self, options: &ListOptions) -> Result<Vec<K>>
    where
        K: Resource<DynamicType = ()> + DeserializeOwned,
    {
        let kind = ResourceKind::of::<K>();
        self.cache
            .list(&kind, options)
            .await?
            .into_iter()
            .map(|obj| from_dynamic(&kind, obj))
            .collect()
    }

    pub async fn create<K>(&self, obj: &K) -> Result<K>
    where
        K: Resource<DynamicType = ()> + Serialize + DeserializeOwned,
    {
        let kind = ResourceKind::of::<K>();
        let created = self.writer.create(&kind, &to_dynamic(&kind, obj)?).await?;
        from_dynamic(&kind, created)
    }

    /// Replace an object; conditional on its resourceVersion when set
    pub async fn update<K>(&self, obj: &K) -> Result<K>
    where
        K: Resource<DynamicType = ()> + Serialize + DeserializeOwned,
    {
        let kind = ResourceKind::of::<K>();
        let updated = self.writer.update(&kind, &to_dynamic(&kind, obj)?).await?;
        from_dynamic(&kind, updated)
    }

    /// Replace an object's status subresource
    pub async fn status_update<K>(&self, obj: &K) -> Result<K>
    where
        K: Resource<DynamicType = ()> + Serialize + DeserializeOwned,
    {
        let kind = ResourceKind::of::<K>();
        let updated = self.writer.update_status(&kind, &to_dynamic(&kind, obj)?).await?;
        from_dynamic(&kind, updated)
    }

    pub async fn patch<K>(&self, obj: &K, patch: &Patch<serde_json::Value>) -> Result<K>
    where
        K: Resource<DynamicType = ()> + DeserializeOwned,
    {
        let kind = ResourceKind::of::<K>();
        let patched = self.writer.patch(&kind, &ObjectKey::of(obj), patch).await?;
        from_dynamic(&kind, patched)
    }

    pub async fn delete<K>(&self, obj: &K) -> Result<()>
    where
        K: Resource<DynamicType = ()>,
    {
        let kind = ResourceKind::of::<K>();
        self.writer.delete(&kind, &ObjectKey::of(obj)).await
    }

    /// Whether an object exists; "not found" is `Ok(false)`, any other failure is an error
    pub async fn exists<K>(&self, key: &ObjectKey) -> Result<bool>
    where
        K: Resource<DynamicType = ()> + DeserializeOwned,
    {
        match self.get::<K>(key).await {
            Ok(_) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Create an object, or update it with the given payload if it already exists.
    ///
    /// The fallback update carries the caller's object unchanged, including
    /// its resourceVersion (or lack of one). Use `update_with_retry` when
    /// the object may be modified concurrently.
    pub async fn create_or_update<K>(&self, obj: &K) -> Result<K>
    where
        K: Resource<DynamicType = ()> + Serialize + DeserializeOwned,
    {
        match self.create(obj).await {
            Err(err) if err.is_already_exists() => {
                debug!(key = %ObjectKey::of(obj), "Object exists, updating instead");
                self.update(obj).await
            }
            result => result,
        }
    }

    /// Update with the latest resourceVersion, retrying on conflicts
    pub async fn update_with_retry<K>(&self, obj: &K) -> Result<K>
    where
        K: Resource<DynamicType = ()> + Serialize + DeserializeOwned,
    {
        self.write_with_retry(obj, WriteTarget::Object).await
    }

    /// Status-subresource variant of `update_with_retry`
    pub async fn status_update_with_retry<K>(&self, obj: &K) -> Result<K>
    where
        K: Resource<DynamicType = ()> + Serialize + DeserializeOwned,
    {
        self.write_with_retry(obj, WriteTarget::Status).await
    }

    async fn write_with_retry<K>(&self, obj: &K, target: WriteTarget) -> Result<K>
    where
        K: Resource<DynamicType = ()> + Serialize + DeserializeOwned,
    {
        let kind = ResourceKind::of::<K>();
        let desired = to_dynamic(&kind, obj)?;
        let stored = update_on_conflict(
            self.direct.as_ref(),
            self.writer.as_ref(),
            self.retry.as_ref(),
            &kind,
            &desired,
            target,
        )
        .await?;
        from_dynamic(&kind, stored)
    }
}

fn to_dynamic<K: Resource + Serialize>(kind: &ResourceKind, obj: &K) -> Result<DynamicObject> {
    let serialization = |source| Error::Serialization {
        kind: kind.to_string(),
        key: ObjectKey::of(obj),
        source,
    };
    let value = serde_json::to_value(obj).map_err(serialization)?;
    let dynamic = serde_json::from_value(value).map_err(serialization)?;
    Ok(with_type_meta(kind, dynamic))
}

fn from_dynamic<K: DeserializeOwned>(kind: &ResourceKind, obj: DynamicObject) -> Result<K> {
    let key = ObjectKey::of(&obj);
    let obj = with_type_meta(kind, obj);
    let serialization = |source| Error::Serialization {
        kind: kind.to_string(),
        key: key.clone(),
        source,
    };
    let value = serde_json::to_value(&obj).map_err(serialization)?;
    serde_json::from_value(value).map_err(serialization)
}
