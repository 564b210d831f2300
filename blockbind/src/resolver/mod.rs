//! Resource resolution for blocks.
//!
//! Maps a block's declaration and its position in the page (parent block,
//! current record) to the `ResourceHandle` it talks to. Rules are tried in a
//! fixed order and the first match wins:
//!
//! 1. table-field child: handle over the rows embedded in the current record
//! 2. nearest ancestor is a table-field block: borrow its handle
//! 3. no association: root handle for the explicit resource
//! 4. association with an explicit source id
//! 5. association with the source id read from the current record
//!
//! An unknown association or collection is an error, never a silent root
//! fallback.

use crate::block::BlockKind;
use crate::error::{BlockError, BlockResult};
use crate::metadata::{AssociationField, CollectionMetadata};
use crate::resource::{ResourceClient, ResourceHandle, SharedHandle};
use serde_json::Value;
use std::rc::Rc;

/// Field under which a nested record carries its parent record.
pub const PARENT_RECORD_KEY: &str = "__parent";

/// Where an association block takes its source id from.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceIdProvider {
    Explicit(Value),
    /// `record[association.sourceKey]`
    FromRecord,
    /// `record.__parent[association.sourceKey]`
    FromParentRecord,
}

impl SourceIdProvider {
    pub fn source_id(&self, record: &Value, association: Option<&AssociationField>) -> Option<Value> {
        let key = association.map(|a| a.source_key.as_str()).unwrap_or("id");
        let value = match self {
            SourceIdProvider::Explicit(value) => Some(value.clone()),
            SourceIdProvider::FromRecord => record.get(key).cloned(),
            SourceIdProvider::FromParentRecord => record
                .get(PARENT_RECORD_KEY)
                .and_then(|parent| parent.get(key))
                .cloned(),
        };
        value.filter(|v| !v.is_null())
    }
}

/// The nearest ancestor block of the block being resolved.
#[derive(Debug, Clone)]
pub struct ParentBinding {
    pub kind: BlockKind,
    pub handle: SharedHandle,
}

#[derive(Debug, Clone, Default)]
pub struct ResolutionContext {
    /// Explicitly declared collection.
    pub resource: Option<String>,
    /// Dotted association path, e.g. `customers.orders`.
    pub association: Option<String>,
    pub parent: Option<ParentBinding>,
    pub is_table_field_child: bool,
    /// Field of the current record holding embedded rows.
    pub table_field: Option<String>,
    pub current_record: Value,
    pub source_id: Option<SourceIdProvider>,
    /// Opt out of borrowing a table-field ancestor's handle.
    pub without_table_field_resource: bool,
}

impl ResolutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    pub fn with_association(mut self, association: impl Into<String>) -> Self {
        self.association = Some(association.into());
        self
    }

    pub fn with_parent(mut self, kind: BlockKind, handle: SharedHandle) -> Self {
        self.parent = Some(ParentBinding { kind, handle });
        self
    }

    pub fn with_record(mut self, record: Value) -> Self {
        self.current_record = record;
        self
    }

    pub fn with_source_id(mut self, provider: SourceIdProvider) -> Self {
        self.source_id = Some(provider);
        self
    }

    pub fn as_table_field_child(mut self, field: impl Into<String>) -> Self {
        self.is_table_field_child = true;
        self.table_field = Some(field.into());
        self
    }

    fn borrowable_parent(&self) -> Option<&SharedHandle> {
        if self.without_table_field_resource {
            return None;
        }
        self.parent
            .as_ref()
            .filter(|p| p.kind == BlockKind::TableField && p.handle.is_table_field())
            .map(|p| &p.handle)
    }
}

/// Which rule produced a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResolutionRule {
    TableField,
    BorrowedFromParent,
    Root,
    AssociationWithSourceId,
    AssociationFromRecord,
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub handle: SharedHandle,
    pub rule: ResolutionRule,
}

impl Resolution {
    pub fn is_borrowed(&self) -> bool {
        self.rule == ResolutionRule::BorrowedFromParent
    }
}

fn lookup_association(
    metadata: &dyn CollectionMetadata,
    path: &str,
) -> BlockResult<AssociationField> {
    metadata
        .get_association(path)
        .ok_or_else(|| BlockError::MetadataNotFound(path.to_string()))
}

pub fn resolve(
    ctx: &ResolutionContext,
    metadata: &dyn CollectionMetadata,
    client: Rc<dyn ResourceClient>,
) -> BlockResult<Resolution> {
    if ctx.is_table_field_child {
        let field = ctx.table_field.as_deref().ok_or_else(|| {
            BlockError::ResolutionAmbiguous("table-field child without a field binding".into())
        })?;
        let association = match &ctx.association {
            Some(path) => Some(lookup_association(metadata, path)?),
            None => None,
        };
        let collection = association
            .as_ref()
            .map(|a| a.target.clone())
            .or_else(|| ctx.resource.clone())
            .unwrap_or_else(|| field.to_string());
        let source_id = ctx
            .source_id
            .as_ref()
            .and_then(|provider| provider.source_id(&ctx.current_record, association.as_ref()))
            .or_else(|| {
                SourceIdProvider::FromRecord.source_id(&ctx.current_record, association.as_ref())
            });
        log::debug!("[resolver] table field `{}` over {}", field, collection);
        let handle = ResourceHandle::table_field(
            field,
            collection,
            association,
            source_id,
            &ctx.current_record,
        );
        return Ok(Resolution {
            handle: Rc::new(handle),
            rule: ResolutionRule::TableField,
        });
    }

    if let Some(parent) = ctx.borrowable_parent() {
        log::debug!("[resolver] borrowing table-field handle {}", parent.id());
        return Ok(Resolution {
            handle: Rc::clone(parent),
            rule: ResolutionRule::BorrowedFromParent,
        });
    }

    let Some(path) = &ctx.association else {
        let resource = ctx.resource.as_deref().ok_or_else(|| {
            BlockError::ResolutionAmbiguous("block declares neither resource nor association".into())
        })?;
        if !metadata.has_collection(resource) {
            return Err(BlockError::MetadataNotFound(resource.to_string()));
        }
        return Ok(Resolution {
            handle: Rc::new(ResourceHandle::root(resource, client)),
            rule: ResolutionRule::Root,
        });
    };

    let association = lookup_association(metadata, path)?;
    let provided = ctx
        .source_id
        .as_ref()
        .and_then(|provider| provider.source_id(&ctx.current_record, Some(&association)));
    let (source_id, rule) = match provided {
        Some(id) => (Some(id), ResolutionRule::AssociationWithSourceId),
        None => (
            SourceIdProvider::FromRecord.source_id(&ctx.current_record, Some(&association)),
            ResolutionRule::AssociationFromRecord,
        ),
    };
    if source_id.is_none() {
        log::warn!(
            "[resolver] no source id for association {} (key `{}`)",
            path,
            association.source_key
        );
    }
    Ok(Resolution {
        handle: Rc::new(ResourceHandle::for_association(association, source_id, client)),
        rule,
    })
}

/// Key a record-level action addresses the record by.
pub fn filter_by_tk(
    handle: &ResourceHandle,
    record: &Value,
    record_index: usize,
    metadata: &dyn CollectionMetadata,
) -> Option<Value> {
    if handle.is_table_field() {
        return Some(Value::from(record_index as u64));
    }
    let key = match handle.association() {
        Some(assoc) => assoc.target_key.clone(),
        None => metadata.get_primary_key(handle.collection()),
    };
    record.get(&key).cloned().filter(|v| !v.is_null())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{CollectionDescriptor, FieldDescriptor, InMemoryCollectionManager};
    use crate::resource::{HandleKind, InMemoryResourceClient};
    use serde_json::json;

    fn metadata() -> InMemoryCollectionManager {
        InMemoryCollectionManager::new()
            .with_collection(
                CollectionDescriptor::new("customers")
                    .with_field(FieldDescriptor::new("id", "bigInt").with_primary_key())
                    .with_field(FieldDescriptor::has_many("orders", "orders", "customerId")),
            )
            .with_collection(
                CollectionDescriptor::new("orders").with_field(FieldDescriptor::new("code", "string")),
            )
    }

    fn client() -> Rc<dyn ResourceClient> {
        Rc::new(InMemoryResourceClient::new())
    }

    #[test]
    fn test_root_resolution() {
        let ctx = ResolutionContext::new().with_resource("customers");
        let resolution = resolve(&ctx, &metadata(), client()).unwrap();
        assert_eq!(resolution.rule, ResolutionRule::Root);
        assert_eq!(resolution.handle.kind(), HandleKind::Root);
        assert_eq!(resolution.handle.collection(), "customers");
    }

    #[test]
    fn test_association_source_ids() {
        let record = json!({"id": 7, "__parent": {"id": 3}});
        let ctx = ResolutionContext::new()
            .with_association("customers.orders")
            .with_record(record.clone());
        let r = resolve(&ctx, &metadata(), client()).unwrap();
        assert_eq!(r.rule, ResolutionRule::AssociationFromRecord);
        assert_eq!(r.handle.source_id(), Some(&json!(7)));
        assert_eq!(r.handle.collection(), "orders");

        let ctx = ctx.with_source_id(SourceIdProvider::FromParentRecord);
        let r = resolve(&ctx, &metadata(), client()).unwrap();
        assert_eq!(r.handle.source_id(), Some(&json!(3)));

        let ctx = ResolutionContext::new()
            .with_association("customers.orders")
            .with_source_id(SourceIdProvider::Explicit(json!(42)));
        let r = resolve(&ctx, &metadata(), client()).unwrap();
        assert_eq!(r.rule, ResolutionRule::AssociationWithSourceId);
        assert_eq!(r.handle.source_id(), Some(&json!(42)));
    }

    #[test]
    fn test_empty_provider_falls_back_to_record() {
        let record = json!({"id": 7});
        for provider in [
            SourceIdProvider::FromParentRecord,
            SourceIdProvider::Explicit(Value::Null),
        ] {
            let ctx = ResolutionContext::new()
                .with_association("customers.orders")
                .with_record(record.clone())
                .with_source_id(provider);
            let r = resolve(&ctx, &metadata(), client()).unwrap();
            assert_eq!(r.rule, ResolutionRule::AssociationFromRecord);
            assert_eq!(r.handle.source_id(), Some(&json!(7)));
        }

        let ctx = ResolutionContext::new()
            .with_association("customers.orders")
            .with_record(json!({"id": 7, "__parent": {"id": 3}}))
            .with_source_id(SourceIdProvider::FromParentRecord);
        let r = resolve(&ctx, &metadata(), client()).unwrap();
        assert_eq!(r.rule, ResolutionRule::AssociationWithSourceId);
        assert_eq!(r.handle.source_id(), Some(&json!(3)));
    }

    #[test]
    fn test_missing_source_id_is_not_an_error() {
        let ctx = ResolutionContext::new().with_association("customers.orders");
        let r = resolve(&ctx, &metadata(), client()).unwrap();
        assert_eq!(r.handle.source_id(), None);
    }

    #[test]
    fn test_unknown_metadata_fails() {
        let ctx = ResolutionContext::new().with_association("customers.invoices");
        assert!(matches!(
            resolve(&ctx, &metadata(), client()),
            Err(BlockError::MetadataNotFound(path)) if path == "customers.invoices"
        ));
        let ctx = ResolutionContext::new().with_resource("invoices");
        assert!(matches!(
            resolve(&ctx, &metadata(), client()),
            Err(BlockError::MetadataNotFound(_))
        ));
    }

    #[test]
    fn test_ambiguous_declarations() {
        assert!(matches!(
            resolve(&ResolutionContext::new(), &metadata(), client()),
            Err(BlockError::ResolutionAmbiguous(_))
        ));
        let ctx = ResolutionContext {
            is_table_field_child: true,
            ..ResolutionContext::default()
        };
        assert!(matches!(
            resolve(&ctx, &metadata(), client()),
            Err(BlockError::ResolutionAmbiguous(_))
        ));
    }

    #[test]
    fn test_table_field_borrow_and_opt_out() {
        let record = json!({"id": 1, "orders": [{"code": "A"}]});
        let parent = resolve(
            &ResolutionContext::new()
                .with_association("customers.orders")
                .with_record(record.clone())
                .as_table_field_child("orders"),
            &metadata(),
            client(),
        )
        .unwrap();
        assert_eq!(parent.rule, ResolutionRule::TableField);
        assert_eq!(parent.handle.source_id(), Some(&json!(1)));

        let child_ctx = ResolutionContext::new()
            .with_resource("orders")
            .with_parent(BlockKind::TableField, parent.handle.clone());
        let child = resolve(&child_ctx, &metadata(), client()).unwrap();
        assert!(child.is_borrowed());
        assert!(Rc::ptr_eq(&child.handle, &parent.handle));

        let opted_out = ResolutionContext {
            without_table_field_resource: true,
            ..child_ctx
        };
        let own = resolve(&opted_out, &metadata(), client()).unwrap();
        assert_eq!(own.rule, ResolutionRule::Root);
    }

    #[test]
    fn test_filter_by_tk() {
        let m = metadata();
        let root = ResourceHandle::root("orders", client());
        assert_eq!(filter_by_tk(&root, &json!({"id": 9}), 0, &m), Some(json!(9)));

        let embedded = ResourceHandle::table_field("orders", "orders", None, None, &json!({}));
        assert_eq!(filter_by_tk(&embedded, &json!({"id": 9}), 4, &m), Some(json!(4)));

        let assoc = m.get_association("customers.orders").unwrap();
        let handle = ResourceHandle::for_association(assoc, Some(json!(1)), client());
        assert_eq!(filter_by_tk(&handle, &json!({"id": 5}), 0, &m), Some(json!(5)));
    }
}
