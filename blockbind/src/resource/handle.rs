//! Per-block resource handles.
//!
//! A handle is created once per block instance. Blocks nested inside a
//! table-field block share their ancestor's handle through `SharedHandle`
//! instead of creating a second one, so writes through the nested block are
//! visible through the parent.

use super::{
    ClientError, RequestParams, ResourceAction, ResourceClient, ResourceTarget, ResponseEnvelope,
    ResponseMeta,
};
use crate::metadata::AssociationField;
use serde_json::Value;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

pub type SharedHandle = Rc<ResourceHandle>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleKind {
    Root,
    Association,
    /// Rows embedded in the current record under a table field.
    TableField,
}

#[derive(Clone)]
pub enum HandleBackend {
    Remote(Rc<dyn ResourceClient>),
    Embedded(Rc<RefCell<Vec<Value>>>),
}

impl fmt::Debug for HandleBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandleBackend::Remote(_) => f.write_str("Remote"),
            HandleBackend::Embedded(rows) => write!(f, "Embedded({} rows)", rows.borrow().len()),
        }
    }
}

#[derive(Debug)]
pub struct ResourceHandle {
    id: u64,
    kind: HandleKind,
    target: ResourceTarget,
    /// Field of the current record holding the embedded rows.
    table_field: Option<String>,
    backend: HandleBackend,
}

impl ResourceHandle {
    fn next_id() -> u64 {
        NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed)
    }

    pub fn root(collection: impl Into<String>, client: Rc<dyn ResourceClient>) -> Self {
        Self {
            id: Self::next_id(),
            kind: HandleKind::Root,
            target: ResourceTarget::root(collection),
            table_field: None,
            backend: HandleBackend::Remote(client),
        }
    }

    pub fn for_association(
        association: AssociationField,
        source_id: Option<Value>,
        client: Rc<dyn ResourceClient>,
    ) -> Self {
        Self {
            id: Self::next_id(),
            kind: HandleKind::Association,
            target: ResourceTarget::association(association, source_id),
            table_field: None,
            backend: HandleBackend::Remote(client),
        }
    }

    /// Handle over `record[field]`. The rows are copied out of the record
    /// once and shared from then on.
    pub fn table_field(
        field: impl Into<String>,
        collection: impl Into<String>,
        association: Option<AssociationField>,
        source_id: Option<Value>,
        record: &Value,
    ) -> Self {
        let field = field.into();
        let rows = match record.get(&field) {
            Some(Value::Array(rows)) => rows.clone(),
            _ => Vec::new(),
        };
        Self {
            id: Self::next_id(),
            kind: HandleKind::TableField,
            target: ResourceTarget {
                collection: collection.into(),
                association,
                source_id,
            },
            table_field: Some(field),
            backend: HandleBackend::Embedded(Rc::new(RefCell::new(rows))),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> HandleKind {
        self.kind
    }

    pub fn target(&self) -> &ResourceTarget {
        &self.target
    }

    pub fn collection(&self) -> &str {
        &self.target.collection
    }

    pub fn association(&self) -> Option<&AssociationField> {
        self.target.association.as_ref()
    }

    pub fn source_id(&self) -> Option<&Value> {
        self.target.source_id.as_ref()
    }

    pub fn table_field_name(&self) -> Option<&str> {
        self.table_field.as_deref()
    }

    pub fn is_table_field(&self) -> bool {
        self.kind == HandleKind::TableField
    }

    pub fn embedded_rows(&self) -> Option<Rc<RefCell<Vec<Value>>>> {
        match &self.backend {
            HandleBackend::Embedded(rows) => Some(rows.clone()),
            HandleBackend::Remote(_) => None,
        }
    }

    pub async fn call(
        &self,
        action: ResourceAction,
        params: &RequestParams,
    ) -> Result<ResponseEnvelope, ClientError> {
        match &self.backend {
            HandleBackend::Remote(client) => {
                log::debug!("[resource] {} {} (handle {})", action, self.target, self.id);
                client.call(&self.target, action, params).await
            }
            HandleBackend::Embedded(rows) => embedded_call(rows, action, params),
        }
    }

    pub async fn list(&self, params: &RequestParams) -> Result<ResponseEnvelope, ClientError> {
        self.call(ResourceAction::List, params).await
    }

    pub async fn get(&self, filter_by_tk: Value) -> Result<ResponseEnvelope, ClientError> {
        let params = RequestParams::new().with_filter_by_tk(filter_by_tk);
        self.call(ResourceAction::Get, &params).await
    }

    pub async fn create(&self, values: Value) -> Result<ResponseEnvelope, ClientError> {
        let params = RequestParams::new().with_values(values);
        self.call(ResourceAction::Create, &params).await
    }

    pub async fn update(
        &self,
        filter_by_tk: Value,
        values: Value,
    ) -> Result<ResponseEnvelope, ClientError> {
        let params = RequestParams::new()
            .with_filter_by_tk(filter_by_tk)
            .with_values(values);
        self.call(ResourceAction::Update, &params).await
    }

    pub async fn destroy(&self, filter_by_tk: Value) -> Result<ResponseEnvelope, ClientError> {
        let params = RequestParams::new().with_filter_by_tk(filter_by_tk);
        self.call(ResourceAction::Destroy, &params).await
    }

    /// Move the row `source_id` to the position of `target_id`.
    pub async fn move_row(
        &self,
        source_id: Value,
        target_id: Value,
    ) -> Result<ResponseEnvelope, ClientError> {
        let params = RequestParams {
            source_id: Some(source_id),
            target_id: Some(target_id),
            ..RequestParams::default()
        };
        self.call(ResourceAction::Move, &params).await
    }
}

/// Embedded rows are addressed by index.
fn embedded_call(
    rows: &Rc<RefCell<Vec<Value>>>,
    action: ResourceAction,
    params: &RequestParams,
) -> Result<ResponseEnvelope, ClientError> {
    let mut rows = rows.borrow_mut();
    match action {
        ResourceAction::List => {
            let data: Vec<Value> = match &params.filter {
                Some(filter) => rows.iter().filter(|r| filter.matches(r)).cloned().collect(),
                None => rows.clone(),
            };
            let count = data.len() as u64;
            Ok(ResponseEnvelope::new(Value::Array(data)).with_meta(ResponseMeta {
                page: 1,
                page_size: count as u32,
                count,
            }))
        }
        ResourceAction::Get => {
            let index = row_index(params.filter_by_tk.as_ref(), rows.len())?;
            Ok(ResponseEnvelope::new(rows[index].clone()))
        }
        ResourceAction::Create => {
            let values = params.values.clone().unwrap_or(Value::Object(Default::default()));
            rows.push(values.clone());
            Ok(ResponseEnvelope::new(values))
        }
        ResourceAction::Update => {
            let index = row_index(params.filter_by_tk.as_ref(), rows.len())?;
            if let (Some(Value::Object(row)), Some(Value::Object(values))) =
                (rows.get_mut(index), params.values.as_ref())
            {
                for (k, v) in values {
                    row.insert(k.clone(), v.clone());
                }
            }
            Ok(ResponseEnvelope::new(rows[index].clone()))
        }
        ResourceAction::Destroy => {
            let index = row_index(params.filter_by_tk.as_ref(), rows.len())?;
            rows.remove(index);
            Ok(ResponseEnvelope::new(Value::Null))
        }
        ResourceAction::Move => {
            let from = row_index(params.source_id.as_ref(), rows.len())?;
            let to = row_index(params.target_id.as_ref(), rows.len())?;
            let row = rows.remove(from);
            rows.insert(to, row);
            Ok(ResponseEnvelope::new(Value::Null))
        }
    }
}

fn row_index(key: Option<&Value>, len: usize) -> Result<usize, ClientError> {
    let index = key
        .and_then(|k| match k {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        })
        .ok_or_else(|| ClientError::Rejected {
            status: 400,
            message: "embedded rows are addressed by index".to_string(),
        })? as usize;
    if index < len {
        Ok(index)
    } else {
        Err(ClientError::NotFound(format!("row {}", index)))
    }
}
