//! Error taxonomy for block construction and request orchestration.
//!
//! Construction errors (`MetadataNotFound`, `ResolutionAmbiguous`,
//! `InvalidSchema`) abort a mount and bubble up to the page. `RequestFailed`
//! is local to one block: it is stored in that block's request state and the
//! block stays mounted.

use crate::block::BlockId;
use crate::config::ConfigError;
use crate::resource::ClientError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BlockError {
    #[error("Collection metadata not found: {0}")]
    MetadataNotFound(String),

    #[error("Request failed: {0}")]
    RequestFailed(#[from] ClientError),

    #[error("Ambiguous resource resolution: {0}")]
    ResolutionAmbiguous(String),

    #[error("Unknown block: {0}")]
    UnknownBlock(BlockId),

    #[error("Invalid schema: {0}")]
    InvalidSchema(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl BlockError {
    /// Construction-time errors prevent a block from mounting.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, BlockError::RequestFailed(_))
    }
}

impl From<ConfigError> for BlockError {
    fn from(e: ConfigError) -> Self {
        BlockError::Config(e.to_string())
    }
}

pub type BlockResult<T> = Result<T, BlockError>;
