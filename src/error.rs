//! Error types for the graph-cut pipeline.

use thiserror::Error;

/// Errors that can occur while building graphs, cutting them or running tiled cuts.
///
/// All of them are local and synchronous. Nothing in this crate retries.
#[derive(Debug, Error)]
pub enum GraphCutError {
    /// Input volumes that have to be aligned voxel by voxel differ in shape.
    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Region labels are not dense starting from 1.
    #[error("invalid labeling: {0}")]
    InvalidLabeling(String),

    /// An edge or terminal capacity is not positive (edges) or negative (t-weights),
    /// or is not a number.
    #[error("invalid capacity {capacity} on {location}")]
    InvalidCapacity { capacity: f64, location: String },

    /// Tile parameters are out of the allowed range.
    #[error("invalid tile configuration: {0}")]
    InvalidTileConfig(String),

    /// The graph does not fit into memory or into the solver index range.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Node id is not in `[0, node_count)`.
    #[error("node {node} out of range, graph has {node_count} nodes")]
    NodeOutOfRange { node: usize, node_count: usize },

    /// Edge connecting a node with itself.
    #[error("self edge on node {0} is not allowed")]
    SelfEdge(usize),

    /// One or more tiles of a tiled run failed. Reported after all tiles finished.
    #[error("{failed} of {total} tiles failed, first failure in tile {tile}: {first}")]
    TilesFailed {
        failed: usize,
        total: usize,
        tile: usize,
        first: Box<GraphCutError>,
    },

    /// Worker pool could not be created.
    #[error("thread pool error: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

impl GraphCutError {
    pub(crate) fn invalid_capacity(capacity: f64, location: impl Into<String>) -> Self {
        GraphCutError::InvalidCapacity {
            capacity,
            location: location.into(),
        }
    }

    pub(crate) fn shape_mismatch(expected: &[usize], actual: &[usize]) -> Self {
        GraphCutError::ShapeMismatch {
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }
}

impl From<std::collections::TryReserveError> for GraphCutError {
    fn from(err: std::collections::TryReserveError) -> Self {
        GraphCutError::ResourceExhausted(err.to_string())
    }
}

/// Result type for graph-cut operations
pub type GraphCutResult<T> = Result<T, GraphCutError>;
