// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Static catalog of cached resource kinds
//!
//! Declares which kinds the watch cache holds, which of them are scoped by
//! the managed-by label, and which must have their watch running before the
//! client is handed out. Built-in kinds come from k8s-openapi type
//! information; the operator's own CRDs are declared by GVK since their
//! schemas live outside this crate.

use std::fmt;
use std::sync::LazyLock;

use kube::Resource;
use kube::core::{Expression, GroupVersionKind, Selector};
use kube::discovery::ApiResource;

/// Label that marks objects created and owned by the operator
pub const MANAGED_BY_LABEL_KEY: &str = "app-managed-by";

/// Value of the managed-by label for this operator
pub const MANAGED_BY_LABEL_VALUE: &str = "zero-trust-workload-identity-manager";

/// API group of the operator's CRDs
pub const OPERATOR_GROUP: &str = "operator.openshift.io";

/// API version of the operator's CRDs
pub const OPERATOR_VERSION: &str = "v1alpha1";

/// Identity of a resource kind (group, version, kind, plural)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceKind {
    pub api_resource: ApiResource,
}

impl ResourceKind {
    /// Kind of a statically typed resource
    pub fn of<K: Resource<DynamicType = ()>>() -> Self {
        Self {
            api_resource: ApiResource::erase::<K>(&()),
        }
    }

    /// Kind declared by group/version/kind and its plural resource name
    pub fn from_gvk(group: &str, version: &str, kind: &str, plural: &str) -> Self {
        Self {
            api_resource: ApiResource::from_gvk_with_plural(
                &GroupVersionKind::gvk(group, version, kind),
                plural,
            ),
        }
    }

    pub fn kind(&self) -> &str {
        &self.api_resource.kind
    }

    pub fn group(&self) -> &str {
        &self.api_resource.group
    }

    /// Full apiVersion string (e.g., "v1", "apps/v1")
    pub fn api_version(&self) -> &str {
        &self.api_resource.api_version
    }

    /// Whether this kind matches an object's apiVersion/kind pair
    pub fn matches(&self, api_version: &str, kind: &str) -> bool {
        self.api_resource.api_version == api_version && self.api_resource.kind == kind
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.api_resource.api_version, self.api_resource.kind)
    }
}

/// Which kinds are cached, how they are filtered and which watch eagerly
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    /// Kinds cached only when they carry the managed-by label
    pub filtered: Vec<ResourceKind>,
    /// Kinds cached without any filter
    pub unfiltered: Vec<ResourceKind>,
    /// Kinds whose watch must be synced before the cache is ready
    pub eager: Vec<ResourceKind>,
    /// Label filter applied to every kind in `filtered`
    pub filter: Selector,
}

/// Process-wide catalog, built once on first access
pub static CATALOG: LazyLock<Catalog> = LazyLock::new(Catalog::default_catalog);

/// Selector scoping the cache to objects this operator manages
pub fn managed_by_selector() -> Selector {
    Selector::from(Expression::Equal(
        MANAGED_BY_LABEL_KEY.into(),
        MANAGED_BY_LABEL_VALUE.into(),
    ))
}

impl Catalog {
    /// The operator's catalog: built-in kinds it creates are label-filtered,
    /// its own CRDs are cached whole, and every cached kind watches eagerly
    pub fn default_catalog() -> Self {
        use k8s_openapi::api::{
            admissionregistration::v1::ValidatingWebhookConfiguration,
            apps::v1::{DaemonSet, Deployment, StatefulSet},
            core::v1::{ConfigMap, Service, ServiceAccount},
            rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding},
            storage::v1::CSIDriver,
        };

        // Uses compile-time type info from k8s-openapi via kube::Resource
        macro_rules! kinds {
            ($($type:ty),* $(,)?) => {
                vec![$(ResourceKind::of::<$type>()),*]
            };
        }

        let filtered = kinds![
            Role,
            RoleBinding,
            ClusterRole,
            ClusterRoleBinding,
            CSIDriver,
            ServiceAccount,
            Service,
            ConfigMap,
            Deployment,
            DaemonSet,
            StatefulSet,
            ValidatingWebhookConfiguration,
        ];

        let crd = |kind: &str, plural: &str| {
            ResourceKind::from_gvk(OPERATOR_GROUP, OPERATOR_VERSION, kind, plural)
        };
        let unfiltered = vec![
            crd(
                "ZeroTrustWorkloadIdentityManager",
                "zerotrustworkloadidentitymanagers",
            ),
            crd("SpireAgent", "spireagents"),
            crd("SpiffeCSIDriver", "spiffecsidrivers"),
            crd("SpireServer", "spireservers"),
            crd("SpireOIDCDiscoveryProvider", "spireoidcdiscoveryproviders"),
        ];

        let eager = filtered.iter().chain(&unfiltered).cloned().collect();

        Self {
            filtered,
            unfiltered,
            eager,
            filter: managed_by_selector(),
        }
    }

    /// Label filter for a kind: Some for filtered kinds, None otherwise
    pub fn filter_for(&self, kind: &ResourceKind) -> Option<&Selector> {
        self.filtered.contains(kind).then_some(&self.filter)
    }

    pub fn is_cached(&self, kind: &ResourceKind) -> bool {
        self.filtered.contains(kind) || self.unfiltered.contains(kind)
    }

    pub fn is_eager(&self, kind: &ResourceKind) -> bool {
        self.eager.contains(kind)
    }

    /// All cached kinds, filtered first
    pub fn cached_kinds(&self) -> impl Iterator<Item = &ResourceKind> {
        self.filtered.iter().chain(&self.unfiltered)
    }

    /// Find a cached kind by apiVersion and kind
    pub fn lookup(&self, api_version: &str, kind: &str) -> Option<&ResourceKind> {
        self.cached_kinds().find(|k| k.matches(api_version, kind))
    }
}
