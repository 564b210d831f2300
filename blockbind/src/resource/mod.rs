//! Resource client boundary.
//!
//! Responsibilities:
//! - Define the query protocol (`RequestParams`) and response envelope.
//! - Define the `ResourceClient` trait blocks talk to, plus the error type.
//! - Own `ResourceHandle`, the per-block binding to a backend resource.
//!
//! Two clients ship with the crate: `InMemoryResourceClient` for tests and
//! fixtures, and `HttpResourceClient` (feature `http`) for a live backend.

pub mod handle;
#[cfg(feature = "http")]
pub mod http;
pub mod memory;

pub use handle::{HandleBackend, HandleKind, ResourceHandle, SharedHandle};
#[cfg(feature = "http")]
pub use http::HttpResourceClient;
pub use memory::{InMemoryResourceClient, RecordedCall};

use crate::filter::FilterExpression;
use crate::metadata::AssociationField;
use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResourceAction {
    List,
    Get,
    Create,
    Update,
    Destroy,
    Move,
}

impl ResourceAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceAction::List => "list",
            ResourceAction::Get => "get",
            ResourceAction::Create => "create",
            ResourceAction::Update => "update",
            ResourceAction::Destroy => "destroy",
            ResourceAction::Move => "move",
        }
    }

    /// Read actions carry their parameters in the query string only.
    pub fn is_read(&self) -> bool {
        matches!(self, ResourceAction::List | ResourceAction::Get)
    }
}

impl fmt::Display for ResourceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceAction {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "list" => Ok(ResourceAction::List),
            "get" => Ok(ResourceAction::Get),
            "create" => Ok(ResourceAction::Create),
            "update" => Ok(ResourceAction::Update),
            "destroy" => Ok(ResourceAction::Destroy),
            "move" => Ok(ResourceAction::Move),
            other => Err(ClientError::Unsupported(format!("action `{}`", other))),
        }
    }
}

/// Query parameters of one resource call. Absent fields are omitted on the
/// wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_size: Option<u32>,
    /// Field names, `-` prefix for descending.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<FilterExpression>,
    /// Dotted association paths to load eagerly. Order carries no meaning.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub appends: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_by_tk: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paginate: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<Value>,
    /// Parameters the engine forwards without interpreting.
    #[serde(flatten)]
    pub extra: IndexMap<String, Value>,
}

impl RequestParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page(mut self, page: u32) -> Self {
        self.page = Some(page);
        self
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = Some(page_size);
        self
    }

    pub fn with_sort<I, T>(mut self, sort: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.sort = Some(sort.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_filter(mut self, filter: Option<FilterExpression>) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_appends<I, T>(mut self, appends: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.appends = Some(appends.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_filter_by_tk(mut self, tk: Value) -> Self {
        self.filter_by_tk = Some(tk);
        self
    }

    pub fn with_values(mut self, values: Value) -> Self {
        self.values = Some(values);
        self
    }

    /// Fields set in `overlay` replace ours; `extra` entries are merged.
    pub fn merge(&self, overlay: &RequestParams) -> RequestParams {
        let mut extra = self.extra.clone();
        extra.extend(overlay.extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        RequestParams {
            page: overlay.page.or(self.page),
            page_size: overlay.page_size.or(self.page_size),
            sort: overlay.sort.clone().or_else(|| self.sort.clone()),
            filter: overlay.filter.clone().or_else(|| self.filter.clone()),
            appends: overlay.appends.clone().or_else(|| self.appends.clone()),
            filter_by_tk: overlay.filter_by_tk.clone().or_else(|| self.filter_by_tk.clone()),
            values: overlay.values.clone().or_else(|| self.values.clone()),
            paginate: overlay.paginate.or(self.paginate),
            source_id: overlay.source_id.clone().or_else(|| self.source_id.clone()),
            target_id: overlay.target_id.clone().or_else(|| self.target_id.clone()),
            extra,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMeta {
    pub page: u32,
    pub page_size: u32,
    pub count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<ResponseMeta>,
}

impl ResponseEnvelope {
    pub fn new(data: Value) -> Self {
        Self { data, meta: None }
    }

    pub fn with_meta(mut self, meta: ResponseMeta) -> Self {
        self.meta = Some(meta);
        self
    }

    /// List responses as rows; a single object becomes one row.
    pub fn rows(&self) -> Vec<Value> {
        match &self.data {
            Value::Array(rows) => rows.clone(),
            Value::Null => Vec::new(),
            other => vec![other.clone()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ClientError {
    #[error("Request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Decode error: {0}")]
    Decode(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Unsupported: {0}")]
    Unsupported(String),
}

impl From<serde_json::Error> for ClientError {
    fn from(e: serde_json::Error) -> Self {
        ClientError::Decode(e.to_string())
    }
}

/// What a call addresses: a root collection, or an association of one
/// owner record (`customers/7/orders`).
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceTarget {
    /// Collection whose rows the call returns.
    pub collection: String,
    pub association: Option<AssociationField>,
    pub source_id: Option<Value>,
}

impl ResourceTarget {
    pub fn root(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            association: None,
            source_id: None,
        }
    }

    pub fn association(association: AssociationField, source_id: Option<Value>) -> Self {
        Self {
            collection: association.target.clone(),
            association: Some(association),
            source_id,
        }
    }

    /// `customers` or `customers.orders`
    pub fn resource_name(&self) -> String {
        match &self.association {
            Some(assoc) => assoc.path(),
            None => self.collection.clone(),
        }
    }
}

impl fmt::Display for ResourceTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.association, &self.source_id) {
            (Some(assoc), Some(id)) => write!(f, "{}/{}/{}", assoc.owner, id, assoc.name),
            (Some(assoc), None) => write!(f, "{}/?/{}", assoc.owner, assoc.name),
            (None, _) => f.write_str(&self.collection),
        }
    }
}

/// Backend resource API.
#[async_trait(?Send)]
pub trait ResourceClient {
    async fn call(
        &self,
        target: &ResourceTarget,
        action: ResourceAction,
        params: &RequestParams,
    ) -> Result<ResponseEnvelope, ClientError>;
}
