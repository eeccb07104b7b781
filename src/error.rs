//! Error types for laneq.

use thiserror::Error;

use crate::model::{ItemId, Status};

#[derive(Debug, Error)]
pub enum Error {
    /// A lane received work but nothing is registered to process it.
    /// Configuration problem; never retried.
    #[error("no processor registered for queue: {queue_name}")]
    NoProcessor {
        queue_name: String,
        /// The item whose enqueue triggered the failed dispatch, if any.
        /// It stays `pending` in the lane.
        item_id: Option<ItemId>,
    },

    #[error("item not found: {0}")]
    NotFound(ItemId),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: Status, to: Status },

    #[error("item {id} is still {status}")]
    NotSettled { id: ItemId, status: Status },

    #[error("config error: {0}")]
    Config(String),

    #[error("runtime error: {0}")]
    Runtime(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True for errors caused by how the scheduler was wired up rather
    /// than by anything a handler did.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Error::NoProcessor { .. } | Error::Config(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
