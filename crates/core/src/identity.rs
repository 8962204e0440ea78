use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{ObjectMeta, ResourceKind};

/// Addresses one remote object of one kind within one namespace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ResourceIdentity {
    pub kind: ResourceKind,
    pub namespace: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("invalid import identifier {input:?}: expected \"<namespace>/<name>\"")]
pub struct InvalidImportIdentifier {
    pub input: String,
}

impl ResourceIdentity {
    pub fn new(kind: ResourceKind, namespace: &str, name: &str) -> Self {
        Self { kind, namespace: namespace.to_string(), name: name.to_string() }
    }

    /// Identity declared by a manifest's metadata; `None` when name or namespace is empty.
    pub fn from_meta(kind: &ResourceKind, meta: &ObjectMeta) -> Option<Self> {
        if meta.name.is_empty() || meta.namespace.is_empty() {
            return None;
        }
        Some(Self::new(kind.clone(), &meta.namespace, &meta.name))
    }

    /// Parse an import identifier of the form `<namespace>/<name>`.
    pub fn parse_import(kind: &ResourceKind, input: &str) -> Result<Self, InvalidImportIdentifier> {
        let invalid = || InvalidImportIdentifier { input: input.to_string() };
        let (namespace, name) = input.split_once('/').ok_or_else(invalid)?;
        if namespace.is_empty() || name.is_empty() || name.contains('/') {
            return Err(invalid());
        }
        Ok(Self::new(kind.clone(), namespace, name))
    }

    /// Composite identifier, the inverse of [`ResourceIdentity::parse_import`].
    pub fn composite_id(&self) -> String { format!("{}/{}", self.namespace, self.name) }

    pub fn same_object(&self, other: &ResourceIdentity) -> bool {
        self.namespace == other.namespace && self.name == other.name
    }
}

impl fmt::Display for ResourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.kind.gvk_key(), self.namespace, self.name)
    }
}
