//! Collection metadata consumed by the resolver and the appends expander.
//!
//! The metadata service is an external collaborator; this module defines the
//! descriptors it hands out and the lookups the engine relies on. The
//! provided trait methods implement field inheritance and dotted association
//! paths on top of a single required lookup (`get_collection`), so alternate
//! backends only need to answer "what does collection X declare".

pub mod memory;

pub use memory::InMemoryCollectionManager;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Identifies a collection, optionally reached through a dotted association
/// path from a root collection (e.g. `customers.orders`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub association_path: Option<String>,
}

impl CollectionRef {
    pub fn root(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            association_path: None,
        }
    }

    pub fn via(name: impl Into<String>, association_path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            association_path: Some(association_path.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AssociationKind {
    ToOne,
    ToMany,
}

/// A field as declared by a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDescriptor {
    pub name: String,
    #[serde(rename = "type", default)]
    pub field_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    /// Target collection; present only on association fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foreign_key: Option<String>,
    #[serde(default)]
    pub is_foreign_key: bool,
    #[serde(default)]
    pub primary_key: bool,
}

impl FieldDescriptor {
    pub fn new(name: impl Into<String>, field_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            field_type: field_type.into(),
            interface: None,
            target: None,
            source_key: None,
            target_key: None,
            foreign_key: None,
            is_foreign_key: false,
            primary_key: false,
        }
    }

    pub fn belongs_to(
        name: impl Into<String>,
        target: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        let mut field = Self::new(name, "belongsTo");
        field.target = Some(target.into());
        field.foreign_key = Some(foreign_key.into());
        field
    }

    pub fn has_many(
        name: impl Into<String>,
        target: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        let mut field = Self::new(name, "hasMany");
        field.target = Some(target.into());
        field.foreign_key = Some(foreign_key.into());
        field
    }

    pub fn with_primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    pub fn with_foreign_key_flag(mut self) -> Self {
        self.is_foreign_key = true;
        self
    }

    pub fn is_association(&self) -> bool {
        self.target.is_some()
    }

    pub fn association_kind(&self) -> Option<AssociationKind> {
        self.target.as_ref()?;
        match self.field_type.as_str() {
            "hasMany" | "belongsToMany" => Some(AssociationKind::ToMany),
            _ => Some(AssociationKind::ToOne),
        }
    }

    /// Whether a filter on this field compares against a set of values.
    pub fn is_multi_valued(&self) -> bool {
        self.association_kind() == Some(AssociationKind::ToMany) || self.field_type == "array"
    }
}

/// An association field resolved against its owning collection, with key
/// defaults applied.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AssociationField {
    /// Collection that declares the field.
    pub owner: String,
    pub name: String,
    pub field_type: String,
    pub source_key: String,
    pub target_key: String,
    pub foreign_key: Option<String>,
    pub target: String,
    pub kind: AssociationKind,
}

impl AssociationField {
    pub fn from_descriptor(owner: &str, field: &FieldDescriptor) -> Option<Self> {
        let target = field.target.clone()?;
        let kind = field.association_kind()?;
        Some(Self {
            owner: owner.to_string(),
            name: field.name.clone(),
            field_type: field.field_type.clone(),
            source_key: field.source_key.clone().unwrap_or_else(|| "id".to_string()),
            target_key: field.target_key.clone().unwrap_or_else(|| "id".to_string()),
            foreign_key: field.foreign_key.clone(),
            target,
            kind,
        })
    }

    /// Dotted path `owner.name` under which the field is addressed.
    pub fn path(&self) -> String {
        format!("{}.{}", self.owner, self.name)
    }

    pub fn target_ref(&self) -> CollectionRef {
        CollectionRef::via(self.target.clone(), self.path())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_target_key: Option<String>,
    /// Parent collections whose fields this collection inherits.
    #[serde(default)]
    pub inherits: Vec<String>,
    #[serde(default)]
    pub sortable: bool,
    #[serde(default)]
    pub fields: Vec<FieldDescriptor>,
}

impl CollectionDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            title: None,
            filter_target_key: None,
            inherits: Vec::new(),
            sortable: false,
            fields: Vec::new(),
        }
    }

    pub fn with_field(mut self, field: FieldDescriptor) -> Self {
        self.fields.push(field);
        self
    }

    pub fn inheriting(mut self, parent: impl Into<String>) -> Self {
        self.inherits.push(parent.into());
        self
    }
}

/// Read-only collection metadata lookups.
pub trait CollectionMetadata {
    fn get_collection(&self, name: &str) -> Option<CollectionDescriptor>;

    fn has_collection(&self, name: &str) -> bool {
        self.get_collection(name).is_some()
    }

    /// Fields declared directly on the collection.
    fn get_current_collection_fields(&self, name: &str) -> Vec<FieldDescriptor> {
        self.get_collection(name)
            .map(|c| c.fields)
            .unwrap_or_default()
    }

    /// Transitive inheritance chain, nearest parent first, without `name`.
    fn get_inherit_collections(&self, name: &str) -> Vec<String> {
        let mut chain: Vec<String> = Vec::new();
        let mut queue: Vec<String> = self
            .get_collection(name)
            .map(|c| c.inherits)
            .unwrap_or_default();
        queue.reverse();
        while let Some(parent) = queue.pop() {
            if parent == name || chain.contains(&parent) {
                continue;
            }
            if let Some(collection) = self.get_collection(&parent) {
                queue.extend(collection.inherits.iter().rev().cloned());
            }
            chain.push(parent);
        }
        chain
    }

    /// Own fields followed by inherited ones, unique by name (own wins),
    /// foreign-key fields removed.
    fn get_collection_fields(&self, name: &str) -> Vec<FieldDescriptor> {
        let mut fields: IndexMap<String, FieldDescriptor> = IndexMap::new();
        let own = self.get_current_collection_fields(name);
        let inherited = self
            .get_inherit_collections(name)
            .into_iter()
            .flat_map(|parent| self.get_current_collection_fields(&parent));
        for field in own.into_iter().chain(inherited) {
            fields.entry(field.name.clone()).or_insert(field);
        }
        fields
            .into_values()
            .filter(|field| !field.is_foreign_key)
            .collect()
    }

    /// Resolve a dotted path `collection.field[.field...]`, following
    /// association targets for the inner segments. Returns the owning
    /// collection with the field.
    fn lookup_field(&self, path: &str) -> Option<(String, FieldDescriptor)> {
        let mut segments = path.split('.');
        let mut owner = segments.next()?.to_string();
        let mut field_name = segments.next()?;
        loop {
            let field = self
                .get_collection_fields(&owner)
                .into_iter()
                .find(|f| f.name == field_name)?;
            match segments.next() {
                None => return Some((owner, field)),
                Some(next) => {
                    owner = field.target.clone()?;
                    field_name = next;
                }
            }
        }
    }

    fn get_collection_field(&self, path: &str) -> Option<FieldDescriptor> {
        self.lookup_field(path).map(|(_, field)| field)
    }

    /// Like `get_collection_field`, but only for association fields.
    fn get_association(&self, path: &str) -> Option<AssociationField> {
        let (owner, field) = self.lookup_field(path)?;
        AssociationField::from_descriptor(&owner, &field)
    }

    /// Whether `collection.path` can hold several values for one record:
    /// the leaf is multi-valued or a to-many association is crossed.
    fn is_multi_valued_path(&self, collection: &str, path: &str) -> bool {
        let mut owner = collection.to_string();
        for segment in path.split('.') {
            let Some(field) = self
                .get_collection_fields(&owner)
                .into_iter()
                .find(|f| f.name == segment)
            else {
                return false;
            };
            if field.is_multi_valued() {
                return true;
            }
            match field.target {
                Some(target) => owner = target,
                None => return false,
            }
        }
        false
    }

    fn get_primary_key(&self, name: &str) -> String {
        let Some(collection) = self.get_collection(name) else {
            return "id".to_string();
        };
        if let Some(key) = collection.filter_target_key {
            return key;
        }
        collection
            .fields
            .iter()
            .find(|f| f.primary_key)
            .map(|f| f.name.clone())
            .unwrap_or_else(|| "id".to_string())
    }
}
