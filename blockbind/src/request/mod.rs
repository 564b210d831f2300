//! Per-block request orchestration.
//!
//! A `BlockRequest` owns the fetch lifecycle of one block: it issues calls
//! through the block's handle, tracks `{params, loading, data, meta, error}`
//! and publishes successful results into the page's service cache.
//!
//! Runs are numbered. A response whose number is not the latest issued is
//! dropped on arrival, so the last issued run always decides the terminal
//! state. Nothing is cancelled: superseded calls still complete at the
//! backend.
//!
//! State lives in a `RefCell` and is never borrowed across an await.

pub mod cache;

pub use cache::ServiceCache;

use crate::error::{BlockError, BlockResult};
use crate::resource::{
    ClientError, RequestParams, ResourceAction, ResponseEnvelope, ResponseMeta, SharedHandle,
};
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestState {
    /// Params of the last issued run.
    pub params: RequestParams,
    pub loading: bool,
    pub data: Value,
    pub meta: Option<ResponseMeta>,
    pub error: Option<ClientError>,
}

impl RequestState {
    pub fn rows(&self) -> Vec<Value> {
        match &self.data {
            Value::Array(rows) => rows.clone(),
            Value::Null => Vec::new(),
            other => vec![other.clone()],
        }
    }
}

#[derive(Debug, Clone)]
pub enum RequestMode {
    /// Calls go through the handle. Without an action the block resolves to
    /// empty data and never calls.
    Remote {
        handle: SharedHandle,
        action: Option<ResourceAction>,
    },
    /// Rows already in hand; runs resolve immediately.
    Snapshot { rows: Rc<RefCell<Vec<Value>>> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Applied(ResponseEnvelope),
    /// A later run was issued before this one completed.
    Superseded,
}

impl RunOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, RunOutcome::Applied(_))
    }
}

#[derive(Debug)]
pub struct BlockRequest {
    mode: RequestMode,
    default_params: RequestParams,
    state: RefCell<RequestState>,
    issued: Cell<u64>,
    publish: Option<(String, Rc<ServiceCache>)>,
}

impl BlockRequest {
    pub fn new(mode: RequestMode, default_params: RequestParams) -> Self {
        let state = RequestState {
            params: default_params.clone(),
            ..RequestState::default()
        };
        Self {
            mode,
            default_params,
            state: RefCell::new(state),
            issued: Cell::new(0),
            publish: None,
        }
    }

    pub fn remote(
        handle: SharedHandle,
        action: Option<ResourceAction>,
        default_params: RequestParams,
    ) -> Self {
        Self::new(RequestMode::Remote { handle, action }, default_params)
    }

    pub fn snapshot(rows: Rc<RefCell<Vec<Value>>>, default_params: RequestParams) -> Self {
        Self::new(RequestMode::Snapshot { rows }, default_params)
    }

    /// Publish successful results into `cache` under `uid`.
    pub fn with_cache(mut self, uid: impl Into<String>, cache: Rc<ServiceCache>) -> Self {
        self.publish = Some((uid.into(), cache));
        self
    }

    pub fn mode(&self) -> &RequestMode {
        &self.mode
    }

    pub fn handle(&self) -> Option<&SharedHandle> {
        match &self.mode {
            RequestMode::Remote { handle, .. } => Some(handle),
            RequestMode::Snapshot { .. } => None,
        }
    }

    pub fn default_params(&self) -> &RequestParams {
        &self.default_params
    }

    pub fn state(&self) -> RequestState {
        self.state.borrow().clone()
    }

    pub fn params(&self) -> RequestParams {
        self.state.borrow().params.clone()
    }

    pub fn loading(&self) -> bool {
        self.state.borrow().loading
    }

    pub fn data(&self) -> Value {
        self.state.borrow().data.clone()
    }

    pub fn meta(&self) -> Option<ResponseMeta> {
        self.state.borrow().meta
    }

    pub fn error(&self) -> Option<ClientError> {
        self.state.borrow().error.clone()
    }

    /// Number of runs issued so far.
    pub fn issued(&self) -> u64 {
        self.issued.get()
    }

    /// Caller-supplied `appends` replace the defaults wholesale.
    fn effective_params(&self, mut params: RequestParams) -> RequestParams {
        if params.appends.is_none() {
            params.appends = self.default_params.appends.clone();
        }
        params
    }

    pub async fn run(&self, params: RequestParams) -> BlockResult<RunOutcome> {
        let params = self.effective_params(params);
        let seq = self.issued.get() + 1;
        self.issued.set(seq);

        let (handle, action) = match &self.mode {
            RequestMode::Snapshot { rows } => {
                let rows = rows.borrow().clone();
                let count = rows.len() as u64;
                let envelope = ResponseEnvelope::new(Value::Array(rows)).with_meta(ResponseMeta {
                    page: 1,
                    page_size: count as u32,
                    count,
                });
                self.apply(params, Ok(envelope.clone()));
                return Ok(RunOutcome::Applied(envelope));
            }
            RequestMode::Remote { action: None, .. } => {
                let envelope = ResponseEnvelope::new(Value::Array(Vec::new()));
                self.apply(params, Ok(envelope.clone()));
                return Ok(RunOutcome::Applied(envelope));
            }
            RequestMode::Remote {
                handle,
                action: Some(action),
            } => (Rc::clone(handle), *action),
        };

        {
            let mut state = self.state.borrow_mut();
            state.params = params.clone();
            state.loading = true;
        }
        log::debug!("[request] run #{} {} on {}", seq, action, handle.target());

        let result = handle.call(action, &params).await;

        if seq != self.issued.get() {
            log::debug!(
                "[request] dropping response #{} (latest is #{})",
                seq,
                self.issued.get()
            );
            return Ok(RunOutcome::Superseded);
        }

        match result {
            Ok(envelope) => {
                self.apply(params, Ok(envelope.clone()));
                Ok(RunOutcome::Applied(envelope))
            }
            Err(e) => {
                log::warn!("[request] run #{} failed: {}", seq, e);
                self.apply(params, Err(e.clone()));
                Err(BlockError::RequestFailed(e))
            }
        }
    }

    fn apply(&self, params: RequestParams, result: Result<ResponseEnvelope, ClientError>) {
        let published = {
            let mut state = self.state.borrow_mut();
            state.params = params;
            state.loading = false;
            match result {
                Ok(envelope) => {
                    state.data = envelope.data;
                    state.meta = envelope.meta;
                    state.error = None;
                    Some(state.clone())
                }
                // keep the last good data
                Err(e) => {
                    state.error = Some(e);
                    None
                }
            }
        };
        if let (Some(state), Some((uid, cache))) = (published, &self.publish) {
            cache.set(uid.clone(), state);
        }
    }

    /// Re-issue the last params.
    pub async fn refresh(&self) -> BlockResult<RunOutcome> {
        self.run(self.params()).await
    }

    /// Merge `partial` over the last params, then run.
    pub async fn run_with(&self, partial: &RequestParams) -> BlockResult<RunOutcome> {
        let params = self.params().merge(partial);
        self.run(params).await
    }

    /// Initial fetch with the default params.
    pub async fn load(&self) -> BlockResult<RunOutcome> {
        self.run(self.default_params.clone()).await
    }

    /// Replace the data locally without a request.
    pub fn mutate(&self, data: Value) {
        let published = {
            let mut state = self.state.borrow_mut();
            state.data = data;
            state.clone()
        };
        if let Some((uid, cache)) = &self.publish {
            cache.set(uid.clone(), published);
        }
    }
}
