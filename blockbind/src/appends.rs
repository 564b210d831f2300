//! Association field expansion.
//!
//! Computes the `appends` a block requests so that every association its
//! rendered fields display is loaded with the rows, and nothing more.

use crate::metadata::{AssociationField, CollectionMetadata};
use crate::schema::SchemaNode;
use std::collections::BTreeSet;

/// Association fields of `collection`, inherited ones included.
pub fn association_fields(metadata: &dyn CollectionMetadata, collection: &str) -> Vec<AssociationField> {
    metadata
        .get_collection_fields(collection)
        .iter()
        .filter_map(|field| AssociationField::from_descriptor(collection, field))
        .collect()
}

/// `f` for every association `f` of the collection, and `f.g` for every
/// association `g` of `f`'s target.
pub fn association_names(metadata: &dyn CollectionMetadata, collection: &str) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    for field in association_fields(metadata, collection) {
        for nested in association_fields(metadata, &field.target) {
            names.insert(format!("{}.{}", field.name, nested.name));
        }
        names.insert(field.name);
    }
    names
}

/// Appends for the block rooted at `schema` over `collection`.
///
/// A field node named `name` contributes `name` when that is a known
/// association, else its first dotted segment when that one is.
pub fn compute_appends(
    schema: &SchemaNode,
    collection: &str,
    metadata: &dyn CollectionMetadata,
) -> BTreeSet<String> {
    let known = association_names(metadata, collection);
    let mut appends = BTreeSet::new();
    for node in schema.block_fields() {
        if node.collection_field.is_none() {
            continue;
        }
        let name = node.name();
        let first = name.split('.').next().unwrap_or(name);
        if known.contains(name) {
            appends.insert(name.to_string());
        } else if known.contains(first) {
            appends.insert(first.to_string());
        }
    }
    log::debug!("[appends] {} -> {:?}", collection, appends);
    appends
}
