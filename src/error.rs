//! Error taxonomy for the engine
//!
//! Graph mutations fail synchronously with [`GraphError`] and never leave the
//! store partially mutated. Worker faults and stale results are not errors at
//! this level: they arrive as events and are handled by the engine.

use thiserror::Error;

use crate::config::ConfigError;
use crate::io::IoError;

/// Errors raised by [`GraphStore`](crate::store::GraphStore) mutations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// An edge referenced an endpoint that is not in the store
    #[error("invalid edge '{edge_id}': endpoint '{missing}' does not exist")]
    InvalidEdge { edge_id: String, missing: String },

    /// The node is not in the store
    #[error("node not found: {0}")]
    NodeNotFound(String),

    /// The edge is not in the store
    #[error("edge not found: {0}")]
    EdgeNotFound(String),
}

/// Errors raised by the worker boundary
#[derive(Error, Debug)]
pub enum WorkerError {
    /// The background thread could not be started
    #[error("failed to start layout worker: {0}")]
    InitFailure(#[from] std::io::Error),

    /// The background thread is gone and the command could not be delivered
    #[error("layout worker channel closed")]
    ChannelClosed,
}

/// Top-level engine errors
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Io(#[from] IoError),

    /// The operation needs a simulation and none has been initialized
    #[error("no simulation is initialized")]
    NoSimulation,
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
