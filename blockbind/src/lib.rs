//! Block data binding and cross-block filter propagation.
//!
//! Pages are built from declarative schema blocks bound to backend
//! collections. This crate resolves which resource each block talks to,
//! orchestrates each block's requests, and propagates filter and selection
//! state from filter blocks to the blocks they drive.

pub mod appends;
pub mod block;
pub mod config;
pub mod error;
pub mod filter;
pub mod filter_graph;
pub mod metadata;
pub mod request;
pub mod resolver;
pub mod resource;
pub mod schema;

pub use block::{BlockId, BlockKind, BlockNode, BlockSpec, Page};
pub use config::EngineConfig;
pub use error::{BlockError, BlockResult};
pub use filter::{merge_filters, FilterExpression, Operator};
pub use filter_graph::{FilterGraph, FilterTarget, PropagationOutcome};
pub use metadata::{CollectionMetadata, InMemoryCollectionManager};
pub use request::{BlockRequest, RequestState, RunOutcome, ServiceCache};
pub use resolver::{resolve, ResolutionContext, ResolutionRule};
pub use resource::{
    ClientError, InMemoryResourceClient, RequestParams, ResourceAction, ResourceClient,
    ResourceHandle,
};
pub use schema::SchemaNode;
