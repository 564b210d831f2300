//! Table interactions: pagination and sort changes, row clicks and
//! selections on filter tables, drag-moving rows, and the props a table
//! renders from.

use super::{BlockId, BlockKind, Page};
use crate::error::{BlockError, BlockResult};
use crate::filter_graph::PropagationOutcome;
use crate::request::RunOutcome;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub current: u32,
    pub page_size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Ascend,
    Descend,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sorter {
    pub field: String,
    /// Absent when the user cleared the column sort.
    pub order: Option<SortOrder>,
}

impl Sorter {
    fn sort_key(&self) -> Option<String> {
        match self.order? {
            SortOrder::Ascend => Some(self.field.clone()),
            SortOrder::Descend => Some(format!("-{}", self.field)),
        }
    }
}

impl Page {
    /// Page or sort change from the table. A cleared column sort falls back
    /// to the block's configured sort, then to the last one used.
    pub async fn on_change(
        &self,
        id: BlockId,
        pagination: Pagination,
        sorter: Option<Sorter>,
    ) -> BlockResult<RunOutcome> {
        let node = self.block(id)?;
        let mut params = node.request.params();
        let sort = sorter
            .as_ref()
            .and_then(Sorter::sort_key)
            .map(|key| vec![key])
            .or_else(|| node.request.default_params().sort.clone())
            .or_else(|| params.sort.clone());
        params.page = Some(pagination.current);
        params.page_size = Some(pagination.page_size);
        params.sort = sort;
        node.request.run(params).await
    }

    /// Move the dragged row onto the drop row, then refresh.
    pub async fn on_row_drag_end(
        &self,
        id: BlockId,
        from: &Value,
        to: &Value,
    ) -> BlockResult<RunOutcome> {
        let node = self.block(id)?;
        let key_of = |row: &Value| {
            row.get(&node.row_key).cloned().ok_or_else(|| {
                BlockError::InvalidSchema(format!("row without `{}`", node.row_key))
            })
        };
        let (source_id, target_id) = (key_of(from)?, key_of(to)?);
        node.handle.move_row(source_id, target_id).await?;
        node.request.refresh().await
    }

    /// Row click on a filter table: select the row and filter the targets
    /// by it. Clicking the selected row again clears the selection.
    pub async fn on_click_row(
        &self,
        id: BlockId,
        record: &Value,
    ) -> BlockResult<Vec<PropagationOutcome>> {
        let node = self.block(id)?;
        if node.kind != BlockKind::Filter {
            return Ok(Vec::new());
        }
        let Some(key) = record.get(&node.row_key).cloned() else {
            log::warn!("[table] clicked row has no `{}`", node.row_key);
            return Ok(Vec::new());
        };
        let keys = if node.selected_row_keys() == [key.clone()] {
            Vec::new()
        } else {
            vec![key]
        };
        self.on_row_selection_change(id, keys).await
    }

    pub async fn clear_selection(&self, id: BlockId) -> BlockResult<Vec<PropagationOutcome>> {
        self.on_row_selection_change(id, Vec::new()).await
    }

    /// Replace the selected row keys; filter tables propagate them.
    pub async fn on_row_selection_change(
        &self,
        id: BlockId,
        keys: Vec<Value>,
    ) -> BlockResult<Vec<PropagationOutcome>> {
        let node = self.block(id)?;
        node.set_selection(keys.clone());
        if node.kind != BlockKind::Filter {
            return Ok(Vec::new());
        }
        Ok(self.graph.select(id, keys).await)
    }

    /// Props a table renders from, read from the published state.
    pub fn table_props(&self, id: BlockId) -> BlockResult<Value> {
        let node = self.block(id)?;
        let state = self
            .cache
            .get(&node.uid)
            .unwrap_or_else(|| node.request.state());
        let rows = state.rows();
        let meta = state.meta.unwrap_or_default();
        let current = state.params.page.unwrap_or(meta.page.max(1));
        let page_size = state.params.page_size.unwrap_or(meta.page_size);
        Ok(json!({
            "loading": state.loading,
            "rows": rows,
            "rowKey": node.row_key,
            "dragSort": node.drag_sort,
            "pagination": {
                "current": current,
                "pageSize": page_size,
                "total": meta.count,
            },
            "selectedRowKeys": node.selected_row_keys(),
            "error": state.error.map(|e| e.to_string()),
        }))
    }
}
