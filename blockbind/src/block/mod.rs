//! Blocks and the page that owns them.
//!
//! A `Page` is an arena of mounted blocks indexed by `BlockId`. Mounting a
//! block runs the whole binding pipeline once:
//!
//! 1. resolve the resource handle (own, or borrowed from a table-field
//!    ancestor)
//! 2. expand the association appends its fields display
//! 3. build its request with the default params
//! 4. register it with the filter graph according to its kind
//!
//! Data blocks register as filter targets, filter blocks as both source and
//! target, table-field blocks as neither.

pub mod association_filter;
pub mod table;

pub use table::{Pagination, SortOrder, Sorter};

use crate::appends::compute_appends;
use crate::config::EngineConfig;
use crate::error::{BlockError, BlockResult};
use crate::filter_graph::{DataBlock, FilterGraph, FilterTarget, PropagationOutcome, SourceDecl};
use crate::metadata::{CollectionMetadata, CollectionRef};
use crate::request::{BlockRequest, RequestState, RunOutcome, ServiceCache};
use crate::resolver::{resolve, ParentBinding, ResolutionContext, ResolutionRule, SourceIdProvider};
use crate::resource::{RequestParams, ResourceAction, ResourceClient, SharedHandle};
use crate::schema::{SchemaNode, TABLE_FIELD_DECORATOR};
use futures::future::join_all;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub usize);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "block#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BlockKind {
    #[default]
    Data,
    Filter,
    TableField,
}

impl BlockKind {
    /// Decided once from the decorator and its `blockType` prop.
    pub fn from_decorator(decorator: Option<&str>, block_type: Option<&str>) -> Self {
        if decorator == Some(TABLE_FIELD_DECORATOR) {
            BlockKind::TableField
        } else if block_type == Some("filter") {
            BlockKind::Filter
        } else {
            BlockKind::Data
        }
    }
}

/// Declaration of one block, as found in `x-decorator-props`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BlockSpec {
    pub name: Option<String>,
    pub uid: Option<String>,
    #[serde(skip)]
    pub kind: BlockKind,
    pub block_type: Option<String>,
    pub collection: Option<String>,
    pub resource: Option<String>,
    pub association: Option<String>,
    pub action: Option<ResourceAction>,
    pub params: RequestParams,
    pub row_key: Option<String>,
    pub drag_sort: bool,
    /// Field of the current record holding the rows of a table field.
    #[serde(alias = "tableField")]
    pub field_name: Option<String>,
    /// Serve the rows embedded in the current record instead of calling.
    pub snapshot: bool,
    pub without_table_field_resource: bool,
    pub source_id: Option<Value>,
    /// Read the source id from the parent record.
    pub source_from_parent: bool,
    #[serde(skip)]
    pub filter_targets: Vec<FilterTarget>,
    #[serde(skip)]
    pub schema: SchemaNode,
}

impl BlockSpec {
    pub fn data(collection: impl Into<String>) -> Self {
        let collection = collection.into();
        Self {
            collection: Some(collection.clone()),
            resource: Some(collection),
            action: Some(ResourceAction::List),
            ..Self::default()
        }
    }

    pub fn filter(collection: impl Into<String>) -> Self {
        Self {
            kind: BlockKind::Filter,
            block_type: Some("filter".into()),
            ..Self::data(collection)
        }
    }

    pub fn table_field(field_name: impl Into<String>) -> Self {
        Self {
            kind: BlockKind::TableField,
            field_name: Some(field_name.into()),
            ..Self::default()
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_association(mut self, association: impl Into<String>) -> Self {
        self.association = Some(association.into());
        self
    }

    pub fn with_params(mut self, params: RequestParams) -> Self {
        self.params = params;
        self
    }

    pub fn with_row_key(mut self, row_key: impl Into<String>) -> Self {
        self.row_key = Some(row_key.into());
        self
    }

    pub fn with_targets(mut self, targets: Vec<FilterTarget>) -> Self {
        self.filter_targets = targets;
        self
    }

    pub fn with_schema(mut self, schema: SchemaNode) -> Self {
        self.schema = schema;
        self
    }

    /// Read a block declaration off a decorated schema node.
    pub fn from_schema(node: &SchemaNode) -> BlockResult<Self> {
        let mut spec: BlockSpec = if node.decorator_props.is_null() {
            BlockSpec::default()
        } else {
            serde_json::from_value(node.decorator_props.clone()).map_err(|e| {
                BlockError::InvalidSchema(format!("{}: {}", node.uid.as_deref().unwrap_or(node.name()), e))
            })?
        };
        spec.kind = BlockKind::from_decorator(node.decorator.as_deref(), spec.block_type.as_deref());
        if spec.uid.is_none() {
            spec.uid = node.uid.clone();
        }
        if spec.name.is_none() {
            spec.name = spec.uid.clone().or_else(|| node.name.clone());
        }
        if spec.kind == BlockKind::TableField && spec.field_name.is_none() {
            spec.field_name = node.name.clone();
        }
        spec.filter_targets = node.filter_targets.clone().unwrap_or_default();
        spec.schema = node.clone();
        Ok(spec)
    }

    fn source_id_provider(&self) -> Option<SourceIdProvider> {
        match (&self.source_id, self.source_from_parent) {
            (Some(id), _) => Some(SourceIdProvider::Explicit(id.clone())),
            (None, true) => Some(SourceIdProvider::FromParentRecord),
            (None, false) => None,
        }
    }
}

/// Targets declared on a plain wrapper around `node`. Declarations on an
/// enclosing block belong to that block.
fn inherited_filter_targets(root: &SchemaNode, node: &SchemaNode) -> Vec<FilterTarget> {
    let Some(uid) = node.uid.as_deref() else {
        return Vec::new();
    };
    match root.find_filter_targets(uid) {
        Some((owner, targets)) if !owner.is_block() => targets.to_vec(),
        _ => Vec::new(),
    }
}

/// A mounted block.
#[derive(Debug)]
pub struct BlockNode {
    pub id: BlockId,
    pub kind: BlockKind,
    pub name: String,
    pub uid: String,
    pub collection: CollectionRef,
    pub parent: Option<BlockId>,
    pub handle: SharedHandle,
    pub rule: ResolutionRule,
    pub request: Rc<BlockRequest>,
    pub row_key: String,
    pub drag_sort: bool,
    pub record: Value,
    children: RefCell<Vec<BlockId>>,
    selection: RefCell<Vec<Value>>,
}

impl BlockNode {
    pub fn children(&self) -> Vec<BlockId> {
        self.children.borrow().clone()
    }

    pub fn selected_row_keys(&self) -> Vec<Value> {
        self.selection.borrow().clone()
    }

    fn set_selection(&self, keys: Vec<Value>) {
        *self.selection.borrow_mut() = keys;
    }
}

pub struct Page {
    config: EngineConfig,
    metadata: Rc<dyn CollectionMetadata>,
    client: Rc<dyn ResourceClient>,
    cache: Rc<ServiceCache>,
    graph: FilterGraph,
    blocks: RefCell<IndexMap<BlockId, Rc<BlockNode>>>,
    next_id: Cell<usize>,
}

impl Page {
    pub fn new(metadata: Rc<dyn CollectionMetadata>, client: Rc<dyn ResourceClient>) -> Self {
        Self::with_config(EngineConfig::default(), metadata, client)
    }

    pub fn with_config(
        config: EngineConfig,
        metadata: Rc<dyn CollectionMetadata>,
        client: Rc<dyn ResourceClient>,
    ) -> Self {
        Self {
            config,
            graph: FilterGraph::new(Rc::clone(&metadata)),
            metadata,
            client,
            cache: Rc::new(ServiceCache::new()),
            blocks: RefCell::new(IndexMap::new()),
            next_id: Cell::new(1),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn metadata(&self) -> &dyn CollectionMetadata {
        self.metadata.as_ref()
    }

    pub fn graph(&self) -> &FilterGraph {
        &self.graph
    }

    pub fn cache(&self) -> &Rc<ServiceCache> {
        &self.cache
    }

    pub fn block(&self, id: BlockId) -> BlockResult<Rc<BlockNode>> {
        self.blocks
            .borrow()
            .get(&id)
            .cloned()
            .ok_or(BlockError::UnknownBlock(id))
    }

    pub fn block_by_name(&self, name: &str) -> Option<Rc<BlockNode>> {
        self.blocks
            .borrow()
            .values()
            .find(|b| b.name == name)
            .cloned()
    }

    /// Mounted blocks in mount order.
    pub fn blocks(&self) -> Vec<Rc<BlockNode>> {
        self.blocks.borrow().values().cloned().collect()
    }

    pub fn cached_state(&self, uid: &str) -> Option<RequestState> {
        self.cache.get(uid)
    }

    fn allocate_id(&self) -> BlockId {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        BlockId(id)
    }

    pub fn mount(&self, spec: BlockSpec, parent: Option<BlockId>, record: Value) -> BlockResult<BlockId> {
        let parent_node = parent.map(|p| self.block(p)).transpose()?;
        let id = self.allocate_id();

        let table_field = spec.field_name.clone().or_else(|| {
            spec.association
                .as_deref()
                .and_then(|a| a.rsplit('.').next())
                .map(str::to_string)
        });
        let ctx = ResolutionContext {
            resource: spec.resource.clone().or_else(|| spec.collection.clone()),
            association: spec.association.clone(),
            parent: parent_node.as_ref().map(|p| ParentBinding {
                kind: p.kind,
                handle: Rc::clone(&p.handle),
            }),
            is_table_field_child: spec.kind == BlockKind::TableField,
            table_field: if spec.kind == BlockKind::TableField { table_field } else { None },
            current_record: record.clone(),
            source_id: spec.source_id_provider(),
            without_table_field_resource: spec.without_table_field_resource,
        };
        let resolution = resolve(&ctx, self.metadata.as_ref(), Rc::clone(&self.client))?;
        let handle = resolution.handle;
        let collection_name = handle.collection().to_string();
        let collection = match handle.association() {
            Some(assoc) => assoc.target_ref(),
            None => CollectionRef::root(collection_name.clone()),
        };

        let params = self.default_params(&spec, &collection_name);
        let uid = spec
            .uid
            .clone()
            .unwrap_or_else(|| format!("{}-{}", collection_name, id.0));
        let name = spec.name.clone().unwrap_or_else(|| uid.clone());

        let snapshot_rows = if spec.kind == BlockKind::TableField || spec.snapshot {
            handle.embedded_rows().or_else(|| {
                let field = ctx.table_field.clone().or_else(|| {
                    handle.association().map(|a| a.name.clone())
                })?;
                match record.get(&field) {
                    Some(Value::Array(rows)) => Some(Rc::new(RefCell::new(rows.clone()))),
                    _ => None,
                }
            })
        } else {
            None
        };
        let request = match snapshot_rows {
            Some(rows) => BlockRequest::snapshot(rows, params),
            None => BlockRequest::remote(Rc::clone(&handle), spec.action, params),
        };
        let request = if self.config.publish_results {
            Rc::new(request.with_cache(uid.clone(), Rc::clone(&self.cache)))
        } else {
            Rc::new(request)
        };

        let row_key = spec.row_key.clone().unwrap_or_else(|| self.row_key_for(&collection_name));

        match spec.kind {
            BlockKind::Data => {
                self.graph.register_target(DataBlock::new(
                    id,
                    name.clone(),
                    collection_name.clone(),
                    Rc::clone(&request),
                ));
            }
            BlockKind::Filter => {
                self.graph.register_target(DataBlock::new(
                    id,
                    name.clone(),
                    collection_name.clone(),
                    Rc::clone(&request),
                ));
                self.graph.register_source(
                    id,
                    SourceDecl {
                        name: name.clone(),
                        targets: spec.filter_targets.clone(),
                        row_key: row_key.clone(),
                    },
                );
            }
            BlockKind::TableField => {}
        }

        log::debug!(
            "[page] mounted {} `{}` ({:?}, {:?}) on {}",
            id,
            name,
            spec.kind,
            resolution.rule,
            collection_name
        );
        let node = Rc::new(BlockNode {
            id,
            kind: spec.kind,
            name,
            uid,
            collection,
            parent,
            handle,
            rule: resolution.rule,
            request,
            row_key,
            drag_sort: spec.drag_sort,
            record,
            children: RefCell::new(Vec::new()),
            selection: RefCell::new(Vec::new()),
        });
        if let Some(parent) = &parent_node {
            parent.children.borrow_mut().push(id);
        }
        self.blocks.borrow_mut().insert(id, node);
        Ok(id)
    }

    fn default_params(&self, spec: &BlockSpec, collection: &str) -> RequestParams {
        let mut params = spec.params.clone();
        if params.appends.is_none() {
            let appends = compute_appends(&spec.schema, collection, self.metadata.as_ref());
            if !appends.is_empty() {
                params.appends = Some(appends.into_iter().collect());
            }
        }
        if spec.drag_sort && params.sort.is_none() {
            params.sort = Some(vec!["sort".to_string()]);
        }
        if params.page_size.is_none() && spec.action == Some(ResourceAction::List) {
            params.page_size = Some(match spec.kind {
                BlockKind::Filter => self.config.filter_page_size,
                _ => self.config.default_page_size,
            });
        }
        params
    }

    fn row_key_for(&self, collection: &str) -> String {
        match self.metadata.get_collection(collection) {
            Some(_) => self.metadata.get_primary_key(collection),
            None => self.config.default_row_key.clone(),
        }
    }

    /// Mount every decorated node under `root`, each with its nearest block
    /// ancestor as parent. On error the blocks mounted so far are unmounted.
    pub fn mount_schema(&self, root: &SchemaNode, record: Value) -> BlockResult<Vec<BlockId>> {
        let mut mounted = Vec::new();
        match self.mount_node(root, root, None, &record, &mut mounted) {
            Ok(()) => Ok(mounted),
            Err(e) => {
                for id in mounted.iter().rev() {
                    if let Err(rollback) = self.unmount(*id) {
                        log::warn!("[page] rollback of {} failed: {}", id, rollback);
                    }
                }
                Err(e)
            }
        }
    }

    fn mount_node(
        &self,
        root: &SchemaNode,
        node: &SchemaNode,
        parent: Option<BlockId>,
        record: &Value,
        mounted: &mut Vec<BlockId>,
    ) -> BlockResult<()> {
        let mut current = parent;
        if node.is_block() {
            let mut spec = BlockSpec::from_schema(node)?;
            if node.filter_targets.is_none() {
                spec.filter_targets = inherited_filter_targets(root, node);
            }
            let id = self.mount(spec, parent, record.clone())?;
            mounted.push(id);
            current = Some(id);
        } else if node.is_association_filter_item() {
            let host = parent.ok_or_else(|| {
                BlockError::InvalidSchema("association filter outside of a block".into())
            })?;
            let field = node.collection_field.as_deref().ok_or_else(|| {
                BlockError::InvalidSchema("association filter item without x-collection-field".into())
            })?;
            let id = self.mount_association_filter(host, field)?;
            mounted.push(id);
            return Ok(());
        }
        for child in node.children() {
            self.mount_node(root, child, current, record, mounted)?;
        }
        Ok(())
    }

    /// Unmount `id` and its descendants, children first. Filters the
    /// unmounted sources applied are dropped from their targets; the ids
    /// of the targets still mounted are returned for refetching.
    pub fn unmount(&self, id: BlockId) -> BlockResult<Vec<BlockId>> {
        let mut released = Vec::new();
        self.unmount_tree(id, &mut released)?;
        let blocks = self.blocks.borrow();
        released.retain(|target| blocks.contains_key(target));
        Ok(released)
    }

    fn unmount_tree(&self, id: BlockId, released: &mut Vec<BlockId>) -> BlockResult<()> {
        let node = self.block(id)?;
        for child in node.children().into_iter().rev() {
            self.unmount_tree(child, released)?;
        }
        for target in self.graph.unregister(id) {
            if !released.contains(&target) {
                released.push(target);
            }
        }
        self.cache.remove(&node.uid);
        if let Some(parent) = node.parent.and_then(|p| self.blocks.borrow().get(&p).cloned()) {
            parent.children.borrow_mut().retain(|c| *c != id);
        }
        self.blocks.borrow_mut().shift_remove(&id);
        log::debug!("[page] unmounted {} `{}`", id, node.name);
        Ok(())
    }

    /// Unmount `id`, then refetch the blocks its filters were applied to.
    pub async fn remove(&self, id: BlockId) -> BlockResult<Vec<PropagationOutcome>> {
        let released = self.unmount(id)?;
        Ok(self.graph.refetch(&released).await)
    }

    /// Initial fetch of one block.
    pub async fn load(&self, id: BlockId) -> BlockResult<RunOutcome> {
        let node = self.block(id)?;
        node.request.load().await
    }

    /// Initial fetch of every block, concurrently.
    pub async fn load_all(&self) -> Vec<(BlockId, BlockResult<RunOutcome>)> {
        let nodes = self.blocks();
        let runs = nodes.into_iter().map(|node| async move {
            let result = node.request.load().await;
            (node.id, result)
        });
        join_all(runs).await
    }

    /// Blocks borrowing `handle`, including its owner.
    pub fn blocks_sharing(&self, handle: &SharedHandle) -> Vec<BlockId> {
        self.blocks
            .borrow()
            .values()
            .filter(|b| Rc::ptr_eq(&b.handle, handle))
            .map(|b| b.id)
            .collect()
    }
}
