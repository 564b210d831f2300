//! Association filter sidebar.
//!
//! An association filter item lists the records of one association's target
//! collection and filters its host block by the selected ones. It mounts as
//! a filter block whose only mapping points at the host, on the field
//! `<association>.<targetKey>`.

use super::{BlockId, BlockKind, BlockSpec, Page};
use crate::appends::association_fields;
use crate::error::{BlockError, BlockResult};
use crate::filter_graph::FilterTarget;
use crate::metadata::{AssociationField, CollectionMetadata};
use crate::resource::{RequestParams, ResourceAction};

/// Filter-block declaration for the association `collection_field`
/// (`owner.field`) of the block named `host`.
pub fn association_filter_spec(
    metadata: &dyn CollectionMetadata,
    host: &str,
    collection_field: &str,
    page_size: u32,
) -> BlockResult<BlockSpec> {
    let assoc: AssociationField = metadata
        .get_association(collection_field)
        .ok_or_else(|| BlockError::MetadataNotFound(collection_field.to_string()))?;
    let name = format!("{}:filter:{}", host, assoc.name);
    Ok(BlockSpec {
        name: Some(name.clone()),
        uid: Some(name),
        kind: BlockKind::Filter,
        block_type: Some("filter".into()),
        collection: Some(assoc.target.clone()),
        resource: Some(assoc.target.clone()),
        action: Some(ResourceAction::List),
        params: RequestParams::new().with_page_size(page_size),
        row_key: Some(assoc.target_key.clone()),
        filter_targets: vec![FilterTarget::new(host)
            .on_field(format!("{}.{}", assoc.name, assoc.target_key))],
        ..BlockSpec::default()
    })
}

impl Page {
    /// Mount an association filter for `collection_field` inside `host`.
    pub fn mount_association_filter(&self, host: BlockId, collection_field: &str) -> BlockResult<BlockId> {
        let host_node = self.block(host)?;
        let spec = association_filter_spec(
            self.metadata(),
            &host_node.name,
            collection_field,
            self.config.filter_page_size,
        )?;
        self.mount(spec, Some(host), host_node.record.clone())
    }

    /// Association fields of `host`'s collection an association filter can
    /// be added for.
    pub fn association_filter_candidates(&self, host: BlockId) -> BlockResult<Vec<AssociationField>> {
        let node = self.block(host)?;
        Ok(association_fields(self.metadata(), &node.collection.name))
    }
}
