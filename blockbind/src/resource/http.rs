//! HTTP resource client.
//!
//! Speaks the remote query protocol:
//! - `GET|POST {base}/{collection}:{action}`
//! - `GET|POST {base}/{owner}/{sourceId}/{association}:{action}`
//! - arrays are encoded as repeated `key[]=v`, `filter` as JSON text
//! - `values` travel as the JSON body of write actions

use super::{
    ClientError, RequestParams, ResourceAction, ResourceClient, ResourceTarget, ResponseEnvelope,
};
use crate::config::HttpClientConfig;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use url::Url;

#[derive(Debug)]
pub struct HttpResourceClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpResourceClient {
    pub fn new(config: &HttpClientConfig) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ClientError::Transport(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
        })
    }

    pub fn endpoint(
        &self,
        target: &ResourceTarget,
        action: ResourceAction,
        params: &RequestParams,
    ) -> Result<Url, ClientError> {
        let raw = format!("{}{}", self.base_url, resource_path(target, action)?);
        let mut url = Url::parse(&raw).map_err(|e| ClientError::Transport(format!("{}: {}", raw, e)))?;
        let query = build_query(params);
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        Ok(url)
    }
}

/// `/{collection}:{action}` or `/{owner}/{sourceId}/{association}:{action}`.
/// An association without a source record has no path.
pub fn resource_path(target: &ResourceTarget, action: ResourceAction) -> Result<String, ClientError> {
    match &target.association {
        Some(assoc) => {
            let source = target
                .source_id
                .as_ref()
                .filter(|id| !id.is_null())
                .ok_or_else(|| ClientError::NotFound(format!("source record of {}", assoc.path())))?;
            Ok(format!("/{}/{}/{}:{}", assoc.owner, scalar_text(source), assoc.name, action))
        }
        None => Ok(format!("/{}:{}", target.collection, action)),
    }
}

/// Query pairs for `params`, in a stable order. `values` is not included.
pub fn build_query(params: &RequestParams) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    if let Some(page) = params.page {
        pairs.push(("page".to_string(), page.to_string()));
    }
    if let Some(page_size) = params.page_size {
        pairs.push(("pageSize".to_string(), page_size.to_string()));
    }
    if let Some(sort) = &params.sort {
        push_array(&mut pairs, "sort", sort.iter().map(|s| s.to_string()));
    }
    if let Some(filter) = &params.filter {
        pairs.push(("filter".to_string(), filter.to_value().to_string()));
    }
    if let Some(appends) = &params.appends {
        push_array(&mut pairs, "appends", appends.iter().map(|s| s.to_string()));
    }
    if let Some(tk) = &params.filter_by_tk {
        push_value(&mut pairs, "filterByTk", tk);
    }
    if let Some(paginate) = params.paginate {
        pairs.push(("paginate".to_string(), paginate.to_string()));
    }
    if let Some(id) = &params.source_id {
        push_value(&mut pairs, "sourceId", id);
    }
    if let Some(id) = &params.target_id {
        push_value(&mut pairs, "targetId", id);
    }
    for (key, value) in &params.extra {
        push_value(&mut pairs, key, value);
    }
    pairs
}

fn push_array(pairs: &mut Vec<(String, String)>, key: &str, items: impl Iterator<Item = String>) {
    let key = format!("{}[]", key);
    pairs.extend(items.map(|item| (key.clone(), item)));
}

fn push_value(pairs: &mut Vec<(String, String)>, key: &str, value: &Value) {
    match value {
        Value::Null => {}
        Value::Array(items) => push_array(pairs, key, items.iter().map(scalar_text)),
        other => pairs.push((key.to_string(), scalar_text(other))),
    }
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.get("errors")
                .and_then(|e| e.get(0))
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.to_string())
}

#[async_trait(?Send)]
impl ResourceClient for HttpResourceClient {
    async fn call(
        &self,
        target: &ResourceTarget,
        action: ResourceAction,
        params: &RequestParams,
    ) -> Result<ResponseEnvelope, ClientError> {
        let url = self.endpoint(target, action, params)?;
        log::debug!("[http] {} {}", action, url);
        let path = url.path().to_string();

        let mut request = if action.is_read() {
            self.client.get(url)
        } else {
            let body = params.values.clone().unwrap_or(Value::Null);
            self.client.post(url).json(&body)
        };
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ClientError::NotFound(path));
        }
        if !status.is_success() {
            return Err(ClientError::Rejected {
                status: status.as_u16(),
                message: error_message(&body),
            });
        }
        if body.trim().is_empty() {
            return Ok(ResponseEnvelope::default());
        }
        Ok(serde_json::from_str(&body)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterExpression;
    use crate::metadata::{AssociationField, FieldDescriptor};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_resource_paths() {
        assert_eq!(
            resource_path(&ResourceTarget::root("orders"), ResourceAction::List).unwrap(),
            "/orders:list"
        );
        let assoc = AssociationField::from_descriptor(
            "customers",
            &FieldDescriptor::has_many("orders", "orders", "customerId"),
        )
        .unwrap();
        let target = ResourceTarget::association(assoc.clone(), Some(json!(7)));
        assert_eq!(
            resource_path(&target, ResourceAction::Create).unwrap(),
            "/customers/7/orders:create"
        );

        for source_id in [None, Some(Value::Null)] {
            let target = ResourceTarget::association(assoc.clone(), source_id);
            assert!(matches!(
                resource_path(&target, ResourceAction::List),
                Err(ClientError::NotFound(_))
            ));
        }
    }

    #[test]
    fn test_endpoint_rejects_association_without_source() {
        let client = HttpResourceClient::new(&HttpClientConfig {
            base_url: "http://localhost:13000/api".into(),
            token: None,
            timeout_secs: 5,
        })
        .unwrap();
        let assoc = AssociationField::from_descriptor(
            "customers",
            &FieldDescriptor::has_many("orders", "orders", "customerId"),
        )
        .unwrap();
        let err = client
            .endpoint(
                &ResourceTarget::association(assoc, None),
                ResourceAction::List,
                &RequestParams::new(),
            )
            .unwrap_err();
        assert_eq!(err, ClientError::NotFound("source record of customers.orders".into()));
    }

    #[test]
    fn test_build_query_encoding() {
        let params = RequestParams::new()
            .with_page(1)
            .with_page_size(10)
            .with_sort(["-id", "name"])
            .with_appends(["customer"])
            .with_filter(Some(FilterExpression::and(vec![FilterExpression::eq(
                "customerId",
                json!(7),
            )])));
        assert_eq!(
            build_query(&params),
            vec![
                ("page".to_string(), "1".to_string()),
                ("pageSize".to_string(), "10".to_string()),
                ("sort[]".to_string(), "-id".to_string()),
                ("sort[]".to_string(), "name".to_string()),
                (
                    "filter".to_string(),
                    r#"{"$and":[{"customerId":{"$eq":7}}]}"#.to_string()
                ),
                ("appends[]".to_string(), "customer".to_string()),
            ]
        );
    }

    #[test]
    fn test_endpoint_url() {
        let client = HttpResourceClient::new(&HttpClientConfig {
            base_url: "http://localhost:13000/api/".into(),
            token: None,
            timeout_secs: 5,
        })
        .unwrap();
        let url = client
            .endpoint(
                &ResourceTarget::root("orders"),
                ResourceAction::Get,
                &RequestParams::new().with_filter_by_tk(json!("A-1")),
            )
            .unwrap();
        assert_eq!(url.as_str(), "http://localhost:13000/api/orders:get?filterByTk=A-1");
    }

    #[test]
    fn test_error_message_extraction() {
        assert_eq!(error_message(r#"{"errors":[{"message":"No permissions"}]}"#), "No permissions");
        assert_eq!(error_message("boom"), "boom");
    }
}
