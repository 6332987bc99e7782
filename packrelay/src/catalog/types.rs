//! Pack identity and request value types.

use std::hash::{Hash, Hasher};
use std::sync::Arc;

use url::Url;
use uuid::Uuid;

use super::CatalogError;

/// Which backend holds a pack's bytes, plus what that backend needs to
/// locate them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackSource {
    /// Not distributed by this system. The address (and optional hash) are
    /// fixed in configuration; resolution never touches the network.
    External {
        uri: Url,
        content_hash: Option<String>,
    },
    /// Stored in an object-storage bucket. Each pack names its own bucket;
    /// the distributor supplies endpoint and credentials.
    ObjectStorage { bucket: String },
    /// Served by the built-in file server from its local root.
    SelfHosted,
}

impl PackSource {
    /// Short name for log messages and errors.
    pub fn kind(&self) -> &'static str {
        match self {
            PackSource::External { .. } => "external",
            PackSource::ObjectStorage { .. } => "object_storage",
            PackSource::SelfHosted => "self_hosted",
        }
    }
}

/// Identity of one distributable pack.
///
/// Owned by the [`Catalog`](super::Catalog) and immutable after load.
/// Equality and hashing are by `id` only: two descriptors with the same id
/// are the same pack even if other fields drifted across a reload.
#[derive(Debug, Clone)]
pub struct PackDescriptor {
    id: Uuid,
    name: String,
    source: PackSource,
    relative_path: String,
}

impl PackDescriptor {
    /// Build a descriptor, validating the backend-relative path.
    ///
    /// The path must be relative and free of traversal segments; external
    /// packs carry their address in [`PackSource::External`] and may leave
    /// the path empty.
    pub fn new(
        id: Uuid,
        name: impl Into<String>,
        source: PackSource,
        relative_path: impl Into<String>,
    ) -> Result<Self, CatalogError> {
        let name = name.into();
        let relative_path = relative_path.into();

        if !matches!(source, PackSource::External { .. }) {
            if relative_path.is_empty() {
                return Err(CatalogError::EmptyPath { name });
            }
            if relative_path.starts_with('/') {
                return Err(CatalogError::AbsolutePath { name });
            }
            if relative_path.split('/').any(|seg| seg == "..") {
                return Err(CatalogError::PathTraversal { name });
            }
        }

        Ok(Self {
            id,
            name,
            source,
            relative_path,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> &PackSource {
        &self.source
    }

    /// Backend-relative path, `/`-separated. Never absolute.
    pub fn relative_path(&self) -> &str {
        &self.relative_path
    }
}

impl PartialEq for PackDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for PackDescriptor {}

impl Hash for PackDescriptor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// An ordered set of packs a server wants applied, with display options.
///
/// The empty request is a distinguished variant rather than a zero-length
/// `Normal`, so "is there anything to do" stays a cheap variant check and a
/// `Normal` request always holds at least one pack.
#[derive(Debug, Clone, PartialEq)]
pub enum PackRequest {
    Empty,
    Normal {
        packs: Vec<Arc<PackDescriptor>>,
        enforce: bool,
        prompt: Option<String>,
    },
}

impl PackRequest {
    /// Collapse an empty pack list into [`PackRequest::Empty`].
    pub fn new(packs: Vec<Arc<PackDescriptor>>, enforce: bool, prompt: Option<String>) -> Self {
        if packs.is_empty() {
            PackRequest::Empty
        } else {
            PackRequest::Normal {
                packs,
                enforce,
                prompt,
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, PackRequest::Empty)
    }

    /// Packs in application order; empty slice for the empty request.
    pub fn packs(&self) -> &[Arc<PackDescriptor>] {
        match self {
            PackRequest::Empty => &[],
            PackRequest::Normal { packs, .. } => packs,
        }
    }

    pub fn enforce(&self) -> bool {
        match self {
            PackRequest::Empty => false,
            PackRequest::Normal { enforce, .. } => *enforce,
        }
    }

    pub fn prompt(&self) -> Option<&str> {
        match self {
            PackRequest::Empty => None,
            PackRequest::Normal { prompt, .. } => prompt.as_deref(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(name: &str) -> Arc<PackDescriptor> {
        Arc::new(
            PackDescriptor::new(
                Uuid::new_v4(),
                name,
                PackSource::SelfHosted,
                format!("{name}.zip"),
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_descriptor_rejects_absolute_path() {
        let result = PackDescriptor::new(
            Uuid::new_v4(),
            "base",
            PackSource::SelfHosted,
            "/etc/pack.zip",
        );
        assert!(matches!(result, Err(CatalogError::AbsolutePath { .. })));
    }

    #[test]
    fn test_descriptor_rejects_traversal() {
        let result = PackDescriptor::new(
            Uuid::new_v4(),
            "base",
            PackSource::SelfHosted,
            "packs/../../secret.zip",
        );
        assert!(matches!(result, Err(CatalogError::PathTraversal { .. })));
    }

    #[test]
    fn test_descriptor_rejects_empty_path_for_hosted_pack() {
        let result = PackDescriptor::new(Uuid::new_v4(), "base", PackSource::SelfHosted, "");
        assert!(matches!(result, Err(CatalogError::EmptyPath { .. })));
    }

    #[test]
    fn test_external_descriptor_allows_empty_path() {
        let source = PackSource::External {
            uri: Url::parse("https://cdn.example.com/base.zip").unwrap(),
            content_hash: None,
        };
        assert!(PackDescriptor::new(Uuid::new_v4(), "base", source, "").is_ok());
    }

    #[test]
    fn test_descriptor_equality_is_by_id_only() {
        let id = Uuid::new_v4();
        let a = PackDescriptor::new(id, "one", PackSource::SelfHosted, "one.zip").unwrap();
        let b = PackDescriptor::new(id, "two", PackSource::SelfHosted, "two.zip").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_empty_request_collapses() {
        let request = PackRequest::new(vec![], true, Some("hi".into()));
        assert!(request.is_empty());
        assert!(request.packs().is_empty());
        assert!(!request.enforce());
        assert!(request.prompt().is_none());
    }

    #[test]
    fn test_normal_request_preserves_order() {
        let a = descriptor("a");
        let b = descriptor("b");
        let request = PackRequest::new(vec![a.clone(), b.clone()], false, None);
        assert!(!request.is_empty());
        assert_eq!(request.packs(), &[a, b]);
    }
}
