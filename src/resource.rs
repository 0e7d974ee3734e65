//! The minimal entity contract the runtime operates on

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt::{Debug, Display},
    hash::{Hash, Hasher},
};

/// The slice of control-plane object metadata the runtime tracks.
///
/// Embed this in an entity type under the `metadata` key:
///
/// ```
/// use serde::{Deserialize, Serialize};
/// use steward::resource::Meta;
///
/// #[derive(Clone, Debug, Default, Serialize, Deserialize)]
/// struct Widget {
///     metadata: Meta,
///     spec: WidgetSpec,
/// }
/// # #[derive(Clone, Debug, Default, Serialize, Deserialize)]
/// # struct WidgetSpec {}
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Meta {
    /// Object name, unique within a namespace
    pub name: String,
    /// Namespace, absent for cluster-scoped kinds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Server-assigned unique id, stable across updates
    pub uid: String,
    /// Opaque per-revision token used for optimistic concurrency
    pub resource_version: String,
    /// Set by the control plane once deletion has been requested
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
    /// Cleanup obligations that must clear before the object is removed
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

/// An entity the runtime can watch and reconcile.
///
/// Implementors provide the type identity of the kind and access to its
/// [`Meta`]. The `Serialize` bound exists so the diff cache can compare
/// revisions without the type exposing its payload fields directly.
pub trait Resource: Clone + Serialize + Send + Sync + 'static {
    /// Kind of the resource, e.g. `Widget`
    fn kind() -> &'static str;
    /// API group the kind belongs to, e.g. `example.dev`
    fn group() -> &'static str;
    /// API version within the group, e.g. `v1`
    fn version() -> &'static str;
    fn meta(&self) -> &Meta;
    fn meta_mut(&mut self) -> &mut Meta;
}

/// Convenience accessors over [`Resource`]
pub trait ResourceExt: Resource {
    fn name(&self) -> &str;
    fn namespace(&self) -> Option<&str>;
    fn uid(&self) -> &str;
    fn resource_version(&self) -> &str;
    fn finalizers(&self) -> &[String];
    /// Whether deletion has been requested for this object
    fn is_terminating(&self) -> bool;
}

impl<K: Resource> ResourceExt for K {
    fn name(&self) -> &str {
        &self.meta().name
    }

    fn namespace(&self) -> Option<&str> {
        self.meta().namespace.as_deref()
    }

    fn uid(&self) -> &str {
        &self.meta().uid
    }

    fn resource_version(&self) -> &str {
        &self.meta().resource_version
    }

    fn finalizers(&self) -> &[String] {
        &self.meta().finalizers
    }

    fn is_terminating(&self) -> bool {
        self.meta().deletion_timestamp.is_some()
    }
}

/// A reference to one object, keyed by its unique id.
///
/// `name` and `namespace` ride along for logs and client lookups but are
/// excluded from equality and hashing; two refs are the same object exactly
/// when their uids match.
#[derive(Clone, Debug)]
pub struct ObjectId {
    pub uid: String,
    pub name: String,
    pub namespace: Option<String>,
}

impl ObjectId {
    #[must_use]
    pub fn from_obj<K: Resource>(obj: &K) -> Self {
        let meta = obj.meta();
        Self {
            uid: meta.uid.clone(),
            name: meta.name.clone(),
            namespace: meta.namespace.clone(),
        }
    }
}

impl PartialEq for ObjectId {
    fn eq(&self, other: &Self) -> bool {
        self.uid == other.uid
    }
}

impl Eq for ObjectId {}

impl Hash for ObjectId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.uid.hash(state);
    }
}

impl Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)?;
        if let Some(namespace) = &self.namespace {
            write!(f, ".{namespace}")?;
        }
        Ok(())
    }
}
