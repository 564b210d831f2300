//! In-memory collection manager.
//!
//! Holds collection descriptors keyed by name, in declaration order. Used by
//! tests, the demo binary, and hosts that ship their metadata as a JSON or
//! TOML document instead of fetching it.

use super::{CollectionDescriptor, CollectionMetadata};
use indexmap::IndexMap;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetadataLoadError {
    #[error("Serialization error: {0}")]
    Serde(String),
    #[error("Duplicate collection: {0}")]
    Duplicate(String),
}

#[derive(Debug, Default, Deserialize)]
struct CollectionDocument {
    #[serde(default)]
    collections: Vec<CollectionDescriptor>,
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryCollectionManager {
    collections: IndexMap<String, CollectionDescriptor>,
}

impl InMemoryCollectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_collection(mut self, collection: CollectionDescriptor) -> Self {
        self.collections.insert(collection.name.clone(), collection);
        self
    }

    /// Adds or replaces a collection. Returns the previous descriptor.
    pub fn add_collection(
        &mut self,
        collection: CollectionDescriptor,
    ) -> Option<CollectionDescriptor> {
        self.collections.insert(collection.name.clone(), collection)
    }

    pub fn from_descriptors(
        descriptors: impl IntoIterator<Item = CollectionDescriptor>,
    ) -> Result<Self, MetadataLoadError> {
        let mut manager = Self::new();
        for descriptor in descriptors {
            let name = descriptor.name.clone();
            if manager.add_collection(descriptor).is_some() {
                return Err(MetadataLoadError::Duplicate(name));
            }
        }
        Ok(manager)
    }

    /// Parses `{"collections": [...]}`.
    pub fn from_json_str(content: &str) -> Result<Self, MetadataLoadError> {
        let doc: CollectionDocument =
            serde_json::from_str(content).map_err(|e| MetadataLoadError::Serde(e.to_string()))?;
        Self::from_descriptors(doc.collections)
    }

    /// Parses a TOML document with `[[collections]]` tables.
    pub fn from_toml_str(content: &str) -> Result<Self, MetadataLoadError> {
        let doc: CollectionDocument =
            toml::from_str(content).map_err(|e| MetadataLoadError::Serde(e.to_string()))?;
        Self::from_descriptors(doc.collections)
    }

    pub fn collection_names(&self) -> impl Iterator<Item = &str> {
        self.collections.keys().map(|k| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.collections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
    }
}

impl CollectionMetadata for InMemoryCollectionManager {
    fn get_collection(&self, name: &str) -> Option<CollectionDescriptor> {
        self.collections.get(name).cloned()
    }
}
