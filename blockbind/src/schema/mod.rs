//! UI schema tree consumed by the page.
//!
//! Only the keys the engine reads are modelled; everything else a renderer
//! may keep on a node is ignored. Nodes nest through `properties`, whose
//! keys double as node names when a node carries no explicit `name`.

use crate::error::{BlockError, BlockResult};
use crate::filter_graph::FilterTarget;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const TABLE_FIELD_DECORATOR: &str = "TableFieldProvider";
pub const ASSOCIATION_FILTER_ITEM: &str = "AssociationFilter.Item";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaNode {
    #[serde(rename = "x-uid", default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "x-component", default, skip_serializing_if = "Option::is_none")]
    pub component: Option<String>,
    #[serde(rename = "x-decorator", default, skip_serializing_if = "Option::is_none")]
    pub decorator: Option<String>,
    #[serde(rename = "x-decorator-props", default, skip_serializing_if = "Value::is_null")]
    pub decorator_props: Value,
    #[serde(rename = "x-component-props", default, skip_serializing_if = "Value::is_null")]
    pub component_props: Value,
    /// `collection.field` this node renders.
    #[serde(rename = "x-collection-field", default, skip_serializing_if = "Option::is_none")]
    pub collection_field: Option<String>,
    #[serde(rename = "x-filter-targets", default, skip_serializing_if = "Option::is_none")]
    pub filter_targets: Option<Vec<FilterTarget>>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub properties: IndexMap<String, SchemaNode>,
}

impl SchemaNode {
    /// Parse a schema tree and name every node after its property key.
    pub fn from_value(value: Value) -> BlockResult<Self> {
        let mut node: SchemaNode =
            serde_json::from_value(value).map_err(|e| BlockError::InvalidSchema(e.to_string()))?;
        node.assign_names();
        Ok(node)
    }

    pub fn from_json_str(content: &str) -> BlockResult<Self> {
        let value: Value =
            serde_json::from_str(content).map_err(|e| BlockError::InvalidSchema(e.to_string()))?;
        Self::from_value(value)
    }

    fn assign_names(&mut self) {
        for (key, child) in self.properties.iter_mut() {
            if child.name.is_none() {
                child.name = Some(key.clone());
            }
            child.assign_names();
        }
    }

    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or_default()
    }

    /// Nodes decorated with a block provider start a new block.
    pub fn is_block(&self) -> bool {
        self.decorator.as_deref().map_or(false, is_block_decorator)
    }

    pub fn is_table_field(&self) -> bool {
        self.decorator.as_deref() == Some(TABLE_FIELD_DECORATOR)
    }

    pub fn is_association_filter_item(&self) -> bool {
        self.component.as_deref() == Some(ASSOCIATION_FILTER_ITEM)
    }

    pub fn children(&self) -> impl DoubleEndedIterator<Item = &SchemaNode> {
        self.properties.values()
    }

    /// Depth-first over descendants that belong to this block: nested
    /// blocks are not entered.
    pub fn block_fields(&self) -> Vec<&SchemaNode> {
        let mut out = Vec::new();
        let mut stack: Vec<&SchemaNode> = self.children().collect();
        stack.reverse();
        while let Some(node) = stack.pop() {
            if node.is_block() {
                continue;
            }
            out.push(node);
            stack.extend(node.children().rev());
        }
        out
    }

    /// Filter targets declared on the node `uid` or its nearest ancestor
    /// that declares any, with the declaring node.
    pub fn find_filter_targets(&self, uid: &str) -> Option<(&SchemaNode, &[FilterTarget])> {
        let mut path = Vec::new();
        if !self.path_to(uid, &mut path) {
            return None;
        }
        path.into_iter()
            .rev()
            .find_map(|node| node.filter_targets.as_deref().map(|targets| (node, targets)))
    }

    fn path_to<'a>(&'a self, uid: &str, path: &mut Vec<&'a SchemaNode>) -> bool {
        path.push(self);
        if self.uid.as_deref() == Some(uid) {
            return true;
        }
        for child in self.children() {
            if child.path_to(uid, path) {
                return true;
            }
        }
        path.pop();
        false
    }
}

pub fn is_block_decorator(decorator: &str) -> bool {
    decorator == TABLE_FIELD_DECORATOR
        || decorator.ends_with("BlockProvider")
        || decorator == "TableSelectorProvider"
}
