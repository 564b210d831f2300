//! In-memory resource client.
//!
//! Serves seeded records per collection with the same query semantics as the
//! remote API: filter evaluation, multi-key sort, paging, association
//! traversal through foreign keys, appends, and `move` over the `sort`
//! field. Every call is recorded so tests can assert on what blocks sent.

use super::{
    ClientError, RequestParams, ResourceAction, ResourceClient, ResourceTarget, ResponseEnvelope,
    ResponseMeta,
};
use crate::filter::eval::{compare, loose_eq};
use crate::metadata::{AssociationField, AssociationKind, CollectionMetadata};
use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::{Map, Value};
use std::cell::RefCell;
use std::cmp::Ordering;
use std::rc::Rc;

const DEFAULT_PAGE_SIZE: u32 = 20;
const SORT_FIELD: &str = "sort";

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub target: ResourceTarget,
    pub action: ResourceAction,
    pub params: RequestParams,
}

#[derive(Default)]
pub struct InMemoryResourceClient {
    store: RefCell<IndexMap<String, Vec<Value>>>,
    metadata: Option<Rc<dyn CollectionMetadata>>,
    calls: RefCell<Vec<RecordedCall>>,
    pending_failure: RefCell<Option<ClientError>>,
}

impl InMemoryResourceClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Metadata enables primary keys other than `id` and `appends`.
    pub fn with_metadata(mut self, metadata: Rc<dyn CollectionMetadata>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_records(self, collection: impl Into<String>, records: Vec<Value>) -> Self {
        self.seed(collection, records);
        self
    }

    pub fn seed(&self, collection: impl Into<String>, records: Vec<Value>) {
        self.store.borrow_mut().insert(collection.into(), records);
    }

    /// Load `{"<collection>": [records...], ...}`.
    pub fn seed_from_value(&self, value: &Value) -> Result<(), ClientError> {
        let Value::Object(map) = value else {
            return Err(ClientError::Decode("records must be an object of arrays".into()));
        };
        for (collection, rows) in map {
            let Value::Array(rows) = rows else {
                return Err(ClientError::Decode(format!("records of `{}` must be an array", collection)));
            };
            self.seed(collection.clone(), rows.clone());
        }
        Ok(())
    }

    pub fn records(&self, collection: &str) -> Vec<Value> {
        self.store
            .borrow()
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.borrow().clone()
    }

    pub fn calls_for(&self, collection: &str, action: ResourceAction) -> Vec<RecordedCall> {
        self.calls
            .borrow()
            .iter()
            .filter(|c| c.target.collection == collection && c.action == action)
            .cloned()
            .collect()
    }

    pub fn last_call(&self, collection: &str, action: ResourceAction) -> Option<RecordedCall> {
        self.calls_for(collection, action).pop()
    }

    /// The next call fails with `error`.
    pub fn fail_next(&self, error: ClientError) {
        *self.pending_failure.borrow_mut() = Some(error);
    }

    fn primary_key(&self, collection: &str) -> String {
        self.metadata
            .as_ref()
            .map(|m| m.get_primary_key(collection))
            .unwrap_or_else(|| "id".to_string())
    }

    /// Rows visible through `target`, with the store index of each.
    fn scoped_rows(&self, target: &ResourceTarget) -> Result<Vec<(usize, Value)>, ClientError> {
        let store = self.store.borrow();
        let rows = store.get(&target.collection).map(|r| r.as_slice()).unwrap_or(&[]);
        let Some(assoc) = &target.association else {
            return Ok(rows.iter().cloned().enumerate().collect());
        };
        let source_id = target
            .source_id
            .as_ref()
            .ok_or_else(|| ClientError::NotFound(format!("source record of {}", assoc.path())))?;
        let owner = store
            .get(&assoc.owner)
            .and_then(|owners| {
                owners
                    .iter()
                    .find(|o| o.get(&assoc.source_key).map_or(false, |v| loose_eq(v, source_id)))
            })
            .cloned();

        let scoped = rows
            .iter()
            .cloned()
            .enumerate()
            .filter(|(_, row)| belongs_to_owner(assoc, source_id, owner.as_ref(), row))
            .collect();
        Ok(scoped)
    }

    fn list(
        &self,
        target: &ResourceTarget,
        params: &RequestParams,
    ) -> Result<ResponseEnvelope, ClientError> {
        let mut rows: Vec<Value> = self
            .scoped_rows(target)?
            .into_iter()
            .map(|(_, row)| row)
            .filter(|row| params.filter.as_ref().map_or(true, |f| f.matches(row)))
            .collect();

        if let Some(sort) = &params.sort {
            rows.sort_by(|a, b| compare_by_sort(a, b, sort));
        }

        let count = rows.len() as u64;
        let page = params.page.unwrap_or(1).max(1);
        let page_size = params.page_size.unwrap_or(DEFAULT_PAGE_SIZE);
        if params.paginate != Some(false) && page_size > 0 {
            let start = u64::from(page - 1).saturating_mul(u64::from(page_size));
            let start = usize::try_from(start).unwrap_or(usize::MAX);
            rows = rows.into_iter().skip(start).take(page_size as usize).collect();
        }

        let rows = self.attach_appends(&target.collection, rows, params.appends.as_deref());
        Ok(ResponseEnvelope::new(Value::Array(rows)).with_meta(ResponseMeta {
            page,
            page_size,
            count,
        }))
    }

    fn find_index(
        &self,
        target: &ResourceTarget,
        params: &RequestParams,
        key: Option<&Value>,
    ) -> Result<usize, ClientError> {
        let pk = self.primary_key(&target.collection);
        self.scoped_rows(target)?
            .into_iter()
            .find(|(_, row)| match key {
                Some(tk) => row.get(&pk).map_or(false, |v| loose_eq(v, tk)),
                None => params.filter.as_ref().map_or(true, |f| f.matches(row)),
            })
            .map(|(index, _)| index)
            .ok_or_else(|| ClientError::NotFound(format!("{} record", target.resource_name())))
    }

    fn create(
        &self,
        target: &ResourceTarget,
        params: &RequestParams,
    ) -> Result<ResponseEnvelope, ClientError> {
        let mut values = match params.values.clone() {
            Some(Value::Object(map)) => map,
            Some(_) => {
                return Err(ClientError::Rejected {
                    status: 400,
                    message: "values must be an object".into(),
                })
            }
            None => Map::new(),
        };
        let pk = self.primary_key(&target.collection);
        let mut store = self.store.borrow_mut();
        let rows = store.entry(target.collection.clone()).or_default();
        if !values.contains_key(&pk) {
            let next = rows
                .iter()
                .filter_map(|r| r.get(&pk).and_then(Value::as_i64))
                .max()
                .unwrap_or(0)
                + 1;
            values.insert(pk, Value::from(next));
        }
        if let (Some(assoc), Some(source_id)) = (&target.association, &target.source_id) {
            if assoc.kind == AssociationKind::ToMany {
                if let Some(fk) = &assoc.foreign_key {
                    values.insert(fk.clone(), source_id.clone());
                }
            }
        }
        let row = Value::Object(values);
        rows.push(row.clone());
        Ok(ResponseEnvelope::new(row))
    }

    fn move_row(
        &self,
        target: &ResourceTarget,
        params: &RequestParams,
    ) -> Result<ResponseEnvelope, ClientError> {
        let pk = self.primary_key(&target.collection);
        let (Some(source_id), Some(target_id)) = (&params.source_id, &params.target_id) else {
            return Err(ClientError::Rejected {
                status: 400,
                message: "move needs sourceId and targetId".into(),
            });
        };

        let scope: Vec<usize> = self.scoped_rows(target)?.into_iter().map(|(i, _)| i).collect();
        let mut store = self.store.borrow_mut();
        let rows = store
            .get_mut(&target.collection)
            .ok_or_else(|| ClientError::NotFound(target.collection.clone()))?;

        let mut ordered: Vec<usize> = scope;
        ordered.sort_by(|a, b| compare_by_sort(&rows[*a], &rows[*b], &[SORT_FIELD.to_string()]));
        let position = |id: &Value| {
            ordered
                .iter()
                .position(|i| rows[*i].get(&pk).map_or(false, |v| loose_eq(v, id)))
        };
        let from = position(source_id)
            .ok_or_else(|| ClientError::NotFound(format!("sourceId {}", source_id)))?;
        let to = position(target_id)
            .ok_or_else(|| ClientError::NotFound(format!("targetId {}", target_id)))?;

        let moved = ordered.remove(from);
        ordered.insert(to, moved);
        for (n, index) in ordered.iter().enumerate() {
            if let Some(row) = rows[*index].as_object_mut() {
                row.insert(SORT_FIELD.to_string(), Value::from(n as u64 + 1));
            }
        }
        log::debug!("[memory] moved {} to position {} in {}", source_id, to + 1, target);
        Ok(ResponseEnvelope::new(Value::Null))
    }

    fn attach_appends(&self, collection: &str, rows: Vec<Value>, appends: Option<&[String]>) -> Vec<Value> {
        let (Some(metadata), Some(appends)) = (&self.metadata, appends) else {
            return rows;
        };
        rows.into_iter()
            .map(|mut row| {
                for path in appends {
                    self.attach_path(metadata.as_ref(), collection, &mut row, path);
                }
                row
            })
            .collect()
    }

    fn attach_path(&self, metadata: &dyn CollectionMetadata, collection: &str, row: &mut Value, path: &str) {
        let (head, rest) = match path.split_once('.') {
            Some((head, rest)) => (head, Some(rest)),
            None => (path, None),
        };
        let Some(assoc) = metadata.get_association(&format!("{}.{}", collection, head)) else {
            return;
        };
        let Some(source_id) = row.get(&assoc.source_key).cloned() else {
            return;
        };
        let target = ResourceTarget::association(assoc.clone(), Some(source_id));
        let Ok(scoped) = self.scoped_rows(&target) else {
            return;
        };
        let mut related: Vec<Value> = scoped.into_iter().map(|(_, r)| r).collect();
        if let Some(rest) = rest {
            for related_row in related.iter_mut() {
                self.attach_path(metadata, &assoc.target, related_row, rest);
            }
        }
        let value = match assoc.kind {
            AssociationKind::ToMany => Value::Array(related),
            AssociationKind::ToOne => related.into_iter().next().unwrap_or(Value::Null),
        };
        if let Some(obj) = row.as_object_mut() {
            obj.insert(assoc.name.clone(), value);
        }
    }
}

fn belongs_to_owner(
    assoc: &AssociationField,
    source_id: &Value,
    owner: Option<&Value>,
    row: &Value,
) -> bool {
    match (assoc.field_type.as_str(), &assoc.foreign_key) {
        // foreign key lives on the owner
        ("belongsTo", Some(fk)) => owner
            .and_then(|o| o.get(fk))
            .zip(row.get(&assoc.target_key))
            .map_or(false, |(a, b)| loose_eq(a, b)),
        // foreign key lives on the target
        (_, Some(fk)) => row.get(fk).map_or(false, |v| loose_eq(v, source_id)),
        // no foreign key: ids embedded on the owner under the field name
        (_, None) => owner
            .and_then(|o| o.get(&assoc.name))
            .map_or(false, |embedded| {
                let key = row.get(&assoc.target_key).unwrap_or(&Value::Null);
                match embedded {
                    Value::Array(items) => items
                        .iter()
                        .any(|i| loose_eq(i, key) || i.get(&assoc.target_key).map_or(false, |v| loose_eq(v, key))),
                    single => loose_eq(single, key),
                }
            }),
    }
}

fn compare_by_sort(a: &Value, b: &Value, sort: &[String]) -> Ordering {
    for key in sort {
        let (field, descending) = match key.strip_prefix('-') {
            Some(field) => (field, true),
            None => (key.as_str(), false),
        };
        let left = a.get(field).unwrap_or(&Value::Null);
        let right = b.get(field).unwrap_or(&Value::Null);
        let ordering = match (left.is_null(), right.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            _ => compare(left, right).unwrap_or(Ordering::Equal),
        };
        let ordering = if descending { ordering.reverse() } else { ordering };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

#[async_trait(?Send)]
impl ResourceClient for InMemoryResourceClient {
    async fn call(
        &self,
        target: &ResourceTarget,
        action: ResourceAction,
        params: &RequestParams,
    ) -> Result<ResponseEnvelope, ClientError> {
        self.calls.borrow_mut().push(RecordedCall {
            target: target.clone(),
            action,
            params: params.clone(),
        });
        if let Some(error) = self.pending_failure.borrow_mut().take() {
            log::debug!("[memory] injected failure for {} {}", action, target);
            return Err(error);
        }

        match action {
            ResourceAction::List => self.list(target, params),
            ResourceAction::Get => {
                let index = self.find_index(target, params, params.filter_by_tk.as_ref())?;
                let row = self.store.borrow()[&target.collection][index].clone();
                let mut rows = self.attach_appends(&target.collection, vec![row], params.appends.as_deref());
                Ok(ResponseEnvelope::new(rows.pop().unwrap_or(Value::Null)))
            }
            ResourceAction::Create => self.create(target, params),
            ResourceAction::Update => {
                let index = self.find_index(target, params, params.filter_by_tk.as_ref())?;
                let mut store = self.store.borrow_mut();
                let row = &mut store[&target.collection][index];
                if let (Some(row), Some(Value::Object(values))) = (row.as_object_mut(), &params.values) {
                    for (k, v) in values {
                        row.insert(k.clone(), v.clone());
                    }
                }
                Ok(ResponseEnvelope::new(row.clone()))
            }
            ResourceAction::Destroy => {
                let index = self.find_index(target, params, params.filter_by_tk.as_ref())?;
                let removed = self.store.borrow_mut()[&target.collection].remove(index);
                Ok(ResponseEnvelope::new(removed))
            }
            ResourceAction::Move => self.move_row(target, params),
        }
    }
}
