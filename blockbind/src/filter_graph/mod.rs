//! Cross-block filter propagation.
//!
//! Filter sources (filter-type tables, association filters) declare the
//! blocks they drive by name. When a source emits an expression the graph
//! stores it in each declared target's filter map under the source's name,
//! merges the target's map into one `$and`, and refetches the target from
//! page 1. Targets run concurrently; each one's own request sequencing
//! decides which response sticks.

use crate::block::BlockId;
use crate::error::BlockResult;
use crate::filter::{merge_filters, FilterExpression};
use crate::metadata::CollectionMetadata;
use crate::request::{BlockRequest, RunOutcome};
use futures::future::join_all;
use indexmap::IndexMap;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// `x-filter-targets` entry: the block a source drives, and the field of
/// that block's collection the source's row key maps onto.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FilterTarget {
    #[serde(rename = "uid", alias = "blockId")]
    pub block: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

impl FilterTarget {
    pub fn new(block: impl Into<String>) -> Self {
        Self {
            block: block.into(),
            field: None,
        }
    }

    pub fn on_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SourceDecl {
    pub name: String,
    pub targets: Vec<FilterTarget>,
    /// Row key of the source's records; the default mapping field.
    pub row_key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterState {
    Idle,
    Filtering,
}

/// A registered filter target.
#[derive(Debug)]
pub struct DataBlock {
    pub id: BlockId,
    pub name: String,
    pub collection: String,
    pub request: Rc<BlockRequest>,
    /// Filter the block declares for itself; merged after source filters.
    default_filter: Option<FilterExpression>,
    /// Conjuncts keyed by source name, so a remounted source replaces
    /// its own entry.
    filter_map: RefCell<IndexMap<String, FilterExpression>>,
    in_flight: Cell<usize>,
}

impl DataBlock {
    pub fn new(
        id: BlockId,
        name: impl Into<String>,
        collection: impl Into<String>,
        request: Rc<BlockRequest>,
    ) -> Self {
        let default_filter = request.default_params().filter.clone();
        Self {
            id,
            name: name.into(),
            collection: collection.into(),
            request,
            default_filter,
            filter_map: RefCell::new(IndexMap::new()),
            in_flight: Cell::new(0),
        }
    }

    pub fn filter_state(&self) -> FilterState {
        if self.in_flight.get() > 0 {
            FilterState::Filtering
        } else {
            FilterState::Idle
        }
    }

    pub fn filter_map(&self) -> Vec<(String, FilterExpression)> {
        self.filter_map
            .borrow()
            .iter()
            .map(|(source, expr)| (source.clone(), expr.clone()))
            .collect()
    }

    /// Store (or, when it prunes away, drop) the expression of `source`.
    fn store(&self, source: &str, expression: Option<FilterExpression>) {
        let mut map = self.filter_map.borrow_mut();
        match expression.and_then(FilterExpression::prune) {
            Some(expr) => {
                map.insert(source.to_string(), expr);
            }
            None => {
                map.shift_remove(source);
            }
        }
    }

    /// Drop the conjunct of `source`; true if there was one.
    fn release(&self, source: &str) -> bool {
        self.filter_map.borrow_mut().shift_remove(source).is_some()
    }

    pub fn merged_filter(&self) -> Option<FilterExpression> {
        let map = self.filter_map.borrow();
        merge_filters(
            map.values()
                .cloned()
                .map(Some)
                .chain(std::iter::once(self.default_filter.clone())),
        )
    }

    async fn refetch(&self) -> BlockResult<RunOutcome> {
        let mut params = self.request.params();
        params.page = Some(1);
        params.filter = self.merged_filter();
        let _guard = InFlight::enter(&self.in_flight);
        self.request.run(params).await
    }
}

/// Counts a refetch as in flight until dropped, also when the future is.
struct InFlight<'a>(&'a Cell<usize>);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a Cell<usize>) -> Self {
        counter.set(counter.get() + 1);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.set(self.0.get().saturating_sub(1));
    }
}

#[derive(Debug)]
pub struct PropagationOutcome {
    pub target: BlockId,
    pub name: String,
    pub filter: Option<FilterExpression>,
    pub result: BlockResult<RunOutcome>,
}

pub struct FilterGraph {
    metadata: Rc<dyn CollectionMetadata>,
    sources: RefCell<IndexMap<BlockId, SourceDecl>>,
    targets: RefCell<IndexMap<BlockId, Rc<DataBlock>>>,
}

impl FilterGraph {
    pub fn new(metadata: Rc<dyn CollectionMetadata>) -> Self {
        Self {
            metadata,
            sources: RefCell::new(IndexMap::new()),
            targets: RefCell::new(IndexMap::new()),
        }
    }

    pub fn register_source(&self, id: BlockId, decl: SourceDecl) {
        log::debug!(
            "[filter] source {} ({}) drives {:?}",
            id,
            decl.name,
            decl.targets.iter().map(|t| t.block.as_str()).collect::<Vec<_>>()
        );
        self.sources.borrow_mut().insert(id, decl);
    }

    pub fn register_target(&self, block: DataBlock) -> Rc<DataBlock> {
        let block = Rc::new(block);
        self.targets.borrow_mut().insert(block.id, Rc::clone(&block));
        block
    }

    /// Drop both registrations of `id`. When `id` was a source, its
    /// conjuncts are removed from every target; the targets that held one
    /// are returned so the caller can refetch them.
    pub fn unregister(&self, id: BlockId) -> Vec<BlockId> {
        let source = self.sources.borrow_mut().shift_remove(&id);
        self.targets.borrow_mut().shift_remove(&id);
        let Some(decl) = source else {
            return Vec::new();
        };
        let released: Vec<BlockId> = self
            .get_data_blocks()
            .into_iter()
            .filter(|block| block.release(&decl.name))
            .map(|block| block.id)
            .collect();
        if !released.is_empty() {
            log::debug!("[filter] source {} ({}) released {:?}", id, decl.name, released);
        }
        released
    }

    /// Refetch `targets` with their current merged filters.
    pub async fn refetch(&self, targets: &[BlockId]) -> Vec<PropagationOutcome> {
        let blocks: Vec<Rc<DataBlock>> = targets.iter().filter_map(|id| self.target(*id)).collect();
        let runs = blocks.into_iter().map(|block| async move {
            let result = block.refetch().await;
            PropagationOutcome {
                target: block.id,
                name: block.name.clone(),
                filter: block.merged_filter(),
                result,
            }
        });
        join_all(runs).await
    }

    pub fn is_source(&self, id: BlockId) -> bool {
        self.sources.borrow().contains_key(&id)
    }

    pub fn source(&self, id: BlockId) -> Option<SourceDecl> {
        self.sources.borrow().get(&id).cloned()
    }

    pub fn target(&self, id: BlockId) -> Option<Rc<DataBlock>> {
        self.targets.borrow().get(&id).cloned()
    }

    pub fn get_data_blocks(&self) -> Vec<Rc<DataBlock>> {
        self.targets.borrow().values().cloned().collect()
    }

    /// Declared targets of `source` that are registered, with their mapping.
    fn matched_targets(&self, source: BlockId) -> Vec<(Rc<DataBlock>, FilterTarget)> {
        let Some(decl) = self.source(source) else {
            log::debug!("[filter] {} is not a registered source", source);
            return Vec::new();
        };
        let blocks = self.get_data_blocks();
        decl.targets
            .iter()
            .filter_map(|mapping| {
                let found = blocks
                    .iter()
                    .find(|b| b.name == mapping.block && b.id != source)
                    .cloned();
                if found.is_none() {
                    log::debug!("[filter] {} targets unknown block `{}`", decl.name, mapping.block);
                }
                found.map(|b| (b, mapping.clone()))
            })
            .collect()
    }

    async fn propagate(
        &self,
        source: BlockId,
        plan: Vec<(Rc<DataBlock>, Option<FilterExpression>)>,
    ) -> Vec<PropagationOutcome> {
        let Some(decl) = self.source(source) else {
            return Vec::new();
        };
        let key = decl.name.as_str();
        let runs = plan.into_iter().map(|(block, expression)| async move {
            block.store(key, expression);
            let filter = block.merged_filter();
            log::debug!(
                "[filter] {} -> {}: {}",
                source,
                block.name,
                filter
                    .as_ref()
                    .map(|f| f.to_value().to_string())
                    .unwrap_or_else(|| "no filter".into())
            );
            let result = block.refetch().await;
            PropagationOutcome {
                target: block.id,
                name: block.name.clone(),
                filter,
                result,
            }
        });
        join_all(runs).await
    }

    /// Apply `expression` from `source` to every target it declares.
    pub async fn apply_filter(
        &self,
        source: BlockId,
        expression: Option<FilterExpression>,
    ) -> Vec<PropagationOutcome> {
        let plan = self
            .matched_targets(source)
            .into_iter()
            .map(|(block, _)| (block, expression.clone()))
            .collect();
        self.propagate(source, plan).await
    }

    /// Filter each target by the selected row keys of `source`.
    ///
    /// The mapping field defaults to the source's row key. Multi-valued
    /// fields and multiple selections use `$in`, a single value `$eq`. An
    /// empty selection clears the source's conjunct.
    pub async fn select(&self, source: BlockId, values: Vec<Value>) -> Vec<PropagationOutcome> {
        let Some(decl) = self.source(source) else {
            log::debug!("[filter] {} is not a registered source", source);
            return Vec::new();
        };
        let values: Vec<Value> = values
            .into_iter()
            .filter(|v| !v.is_null())
            .unique_by(|v| v.to_string())
            .collect();

        let plan = self
            .matched_targets(source)
            .into_iter()
            .map(|(block, mapping)| {
                let field = mapping.field.unwrap_or_else(|| decl.row_key.clone());
                let expression = self.selection_expression(&block.collection, field, &values);
                (block, expression)
            })
            .collect();
        self.propagate(source, plan).await
    }

    fn selection_expression(
        &self,
        collection: &str,
        field: String,
        values: &[Value],
    ) -> Option<FilterExpression> {
        let multi_valued = self.metadata.is_multi_valued_path(collection, &field);
        match values {
            [] => None,
            [single] if !multi_valued => Some(FilterExpression::eq(field, single.clone())),
            many => Some(FilterExpression::in_values(field, many.to_vec())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{CollectionDescriptor, FieldDescriptor, InMemoryCollectionManager};
    use crate::resource::{
        ClientError, InMemoryResourceClient, RequestParams, ResourceAction, ResourceClient,
        ResourceHandle, ResourceTarget, ResponseEnvelope,
    };
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    struct Fixture {
        client: Rc<InMemoryResourceClient>,
        graph: FilterGraph,
    }

    const SOURCE_A: BlockId = BlockId(1);
    const SOURCE_B: BlockId = BlockId(2);
    const SOURCE_C: BlockId = BlockId(3);
    const ORDERS: BlockId = BlockId(10);
    const POSTS: BlockId = BlockId(11);

    fn fixture() -> Fixture {
        let metadata: Rc<dyn CollectionMetadata> = Rc::new(
            InMemoryCollectionManager::new()
                .with_collection(
                    CollectionDescriptor::new("orders")
                        .with_field(FieldDescriptor::new("customerId", "bigInt"))
                        .with_field(FieldDescriptor::new("status", "string")),
                )
                .with_collection(
                    CollectionDescriptor::new("posts")
                        .with_field(FieldDescriptor::has_many("tags", "tags", "postId")),
                ),
        );
        let client = Rc::new(InMemoryResourceClient::new().with_metadata(metadata.clone()));
        let graph = FilterGraph::new(metadata);
        for (id, name, collection) in [(ORDERS, "orders", "orders"), (POSTS, "posts", "posts")] {
            let dyn_client: Rc<dyn ResourceClient> = client.clone();
            let handle = Rc::new(ResourceHandle::root(collection, dyn_client));
            let request = Rc::new(BlockRequest::remote(
                handle,
                Some(ResourceAction::List),
                RequestParams::new().with_page_size(20),
            ));
            graph.register_target(DataBlock::new(id, name, collection, request));
        }
        for (id, name) in [(SOURCE_A, "a"), (SOURCE_B, "b"), (SOURCE_C, "c")] {
            graph.register_source(
                id,
                SourceDecl {
                    name: name.into(),
                    targets: vec![FilterTarget::new("orders")],
                    row_key: "id".into(),
                },
            );
        }
        Fixture { client, graph }
    }

    fn last_filter(client: &InMemoryResourceClient, collection: &str) -> Option<Value> {
        client
            .last_call(collection, ResourceAction::List)
            .and_then(|c| c.params.filter.map(|f| f.to_value()))
    }

    #[tokio::test]
    async fn test_removing_one_of_three_filters() {
        let f = fixture();
        f.graph
            .apply_filter(SOURCE_A, Some(FilterExpression::eq("status", json!("open"))))
            .await;
        f.graph
            .apply_filter(SOURCE_B, Some(FilterExpression::eq("customerId", json!(7))))
            .await;
        f.graph
            .apply_filter(SOURCE_C, Some(FilterExpression::eq("total", json!(3))))
            .await;
        assert_eq!(f.graph.target(ORDERS).unwrap().filter_map().len(), 3);

        let outcomes = f.graph.apply_filter(SOURCE_B, None).await;
        assert_eq!(outcomes.len(), 1);
        assert_eq!(
            last_filter(&f.client, "orders"),
            Some(json!({"$and": [
                {"status": {"$eq": "open"}},
                {"total": {"$eq": 3}}
            ]}))
        );
        let call = f.client.last_call("orders", ResourceAction::List).unwrap();
        assert_eq!(call.params.page, Some(1));
        assert_eq!(call.params.page_size, Some(20));
    }

    #[tokio::test]
    async fn test_untargeted_blocks_are_not_refetched() {
        let f = fixture();
        f.graph
            .apply_filter(SOURCE_A, Some(FilterExpression::eq("status", json!("open"))))
            .await;
        assert!(f.client.calls_for("posts", ResourceAction::List).is_empty());
        assert_eq!(f.graph.target(ORDERS).unwrap().filter_state(), FilterState::Idle);
    }

    #[tokio::test]
    async fn test_unknown_source_and_target_are_skipped() {
        let f = fixture();
        assert!(f.graph.apply_filter(BlockId(99), None).await.is_empty());
        f.graph.register_source(
            BlockId(4),
            SourceDecl {
                name: "d".into(),
                targets: vec![FilterTarget::new("missing")],
                row_key: "id".into(),
            },
        );
        assert!(f.graph.select(BlockId(4), vec![json!(1)]).await.is_empty());
        assert!(f.client.calls().is_empty());
    }

    #[tokio::test]
    async fn test_selection_operators() {
        let f = fixture();
        f.graph.register_source(
            BlockId(5),
            SourceDecl {
                name: "tags".into(),
                targets: vec![
                    FilterTarget::new("posts").on_field("tags"),
                    FilterTarget::new("orders").on_field("customerId"),
                ],
                row_key: "id".into(),
            },
        );

        let outcomes = f.graph.select(BlockId(5), vec![json!(3)]).await;
        assert_eq!(outcomes.len(), 2);
        assert_eq!(
            last_filter(&f.client, "posts"),
            Some(json!({"$and": [{"tags": {"$in": [3]}}]}))
        );
        assert_eq!(
            last_filter(&f.client, "orders"),
            Some(json!({"$and": [{"customerId": {"$eq": 3}}]}))
        );

        f.graph.select(BlockId(5), vec![json!(3), json!(4), json!(3)]).await;
        assert_eq!(
            last_filter(&f.client, "orders"),
            Some(json!({"$and": [{"customerId": {"$in": [3, 4]}}]}))
        );

        f.graph.select(BlockId(5), vec![]).await;
        assert_eq!(last_filter(&f.client, "orders"), None);
        assert!(f.graph.target(ORDERS).unwrap().filter_map().is_empty());
    }

    #[tokio::test]
    async fn test_remounted_source_replaces_its_conjunct() {
        let f = fixture();
        f.graph
            .apply_filter(SOURCE_A, Some(FilterExpression::eq("status", json!("open"))))
            .await;
        f.graph
            .apply_filter(SOURCE_B, Some(FilterExpression::eq("customerId", json!(7))))
            .await;

        // `b` goes away and comes back under a new id
        assert_eq!(f.graph.unregister(SOURCE_B), vec![ORDERS]);
        assert_eq!(
            f.graph.target(ORDERS).unwrap().merged_filter().map(|e| e.to_value()),
            Some(json!({"$and": [{"status": {"$eq": "open"}}]}))
        );
        let remounted = BlockId(20);
        f.graph.register_source(
            remounted,
            SourceDecl {
                name: "b".into(),
                targets: vec![FilterTarget::new("orders")],
                row_key: "id".into(),
            },
        );
        f.graph
            .apply_filter(remounted, Some(FilterExpression::eq("customerId", json!(8))))
            .await;
        assert_eq!(
            last_filter(&f.client, "orders"),
            Some(json!({"$and": [
                {"status": {"$eq": "open"}},
                {"customerId": {"$eq": 8}}
            ]}))
        );

        f.graph.apply_filter(remounted, None).await;
        assert_eq!(
            last_filter(&f.client, "orders"),
            Some(json!({"$and": [{"status": {"$eq": "open"}}]}))
        );
        let keys: Vec<String> = f
            .graph
            .target(ORDERS)
            .unwrap()
            .filter_map()
            .into_iter()
            .map(|(source, _)| source)
            .collect();
        assert_eq!(keys, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_unregistered_targets_are_not_refetched() {
        let f = fixture();
        assert!(f.graph.unregister(SOURCE_C).is_empty());
        f.graph
            .apply_filter(SOURCE_A, Some(FilterExpression::eq("status", json!("open"))))
            .await;
        let released = f.graph.unregister(SOURCE_A);
        f.graph.unregister(ORDERS);
        assert!(f.graph.refetch(&released).await.is_empty());
    }

    struct StalledClient;

    #[async_trait(?Send)]
    impl ResourceClient for StalledClient {
        async fn call(
            &self,
            _target: &ResourceTarget,
            _action: ResourceAction,
            _params: &RequestParams,
        ) -> Result<ResponseEnvelope, ClientError> {
            futures::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_dropped_refetch_leaves_target_idle() {
        let metadata: Rc<dyn CollectionMetadata> = Rc::new(InMemoryCollectionManager::new());
        let client: Rc<dyn ResourceClient> = Rc::new(StalledClient);
        let request = Rc::new(BlockRequest::remote(
            Rc::new(ResourceHandle::root("orders", client)),
            Some(ResourceAction::List),
            RequestParams::new(),
        ));
        let graph = FilterGraph::new(metadata);
        let target = graph.register_target(DataBlock::new(ORDERS, "orders", "orders", request));
        {
            let mut refetch = Box::pin(target.refetch());
            assert!(futures::poll!(refetch.as_mut()).is_pending());
            assert_eq!(target.filter_state(), FilterState::Filtering);
        }
        assert_eq!(target.filter_state(), FilterState::Idle);
    }

    #[tokio::test]
    async fn test_default_filter_is_kept() {
        let metadata: Rc<dyn CollectionMetadata> = Rc::new(InMemoryCollectionManager::new());
        let client: Rc<dyn ResourceClient> = Rc::new(InMemoryResourceClient::new());
        let graph = FilterGraph::new(metadata);
        let request = Rc::new(BlockRequest::remote(
            Rc::new(ResourceHandle::root("orders", client)),
            Some(ResourceAction::List),
            RequestParams::new().with_filter(Some(FilterExpression::eq("archived", json!(false)))),
        ));
        graph.register_target(DataBlock::new(ORDERS, "orders", "orders", request));
        graph.register_source(
            SOURCE_A,
            SourceDecl {
                name: "a".into(),
                targets: vec![FilterTarget::new("orders")],
                row_key: "id".into(),
            },
        );
        let outcomes = graph
            .apply_filter(SOURCE_A, Some(FilterExpression::eq("status", json!("open"))))
            .await;
        assert_eq!(
            outcomes[0].filter.as_ref().unwrap().to_value(),
            json!({"$and": [{"status": {"$eq": "open"}}, {"archived": {"$eq": false}}]})
        );
    }
}
