use crate::error::{GraphCutError, GraphCutResult};
use crate::maxflow::Segment;
use std::ops::Range;

/// Smallest supported tile edge length.
pub const MIN_TILE_EDGE_LENGTH: usize = 10;

/// Main config for the tiled processing.
///
/// The defaults follow what works for typical CT/MR volumes of a few hundred voxels per axis.
/// Tiles are tractable for the max-flow solver and still large enough that the seams are rare.
#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    /// Minimal edge length of a tile (_L_). The number of tiles along an axis of size _n_ is
    /// `max(1, n / L)`.
    ///
    /// Must be at least 10.
    pub min_edge_length: usize,
    /// By how many voxels neighbouring tiles overlap along every split axis. Inside the overlap
    /// band the partial masks are combined using logical AND.
    ///
    /// Must be smaller than `min_edge_length`. Zero means no overlap.
    pub overlap: usize,
    /// Size of the worker pool. `None` uses the rayon default (available parallelism).
    pub num_threads: Option<usize>,
    /// Side given to nodes the max-flow leaves in neither search tree. `Segment::Sink` yields
    /// the smallest object of all minimum cuts, `Segment::Source` the largest one.
    pub free_nodes: Segment,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            min_edge_length: 100,
            overlap: 10,
            num_threads: None,
            free_nodes: Segment::Sink,
        }
    }
}

impl Config {
    pub fn validate(&self) -> GraphCutResult<()> {
        if self.min_edge_length < MIN_TILE_EDGE_LENGTH {
            return Err(GraphCutError::InvalidTileConfig(format!(
                "minimal edge length {} is smaller than {MIN_TILE_EDGE_LENGTH}",
                self.min_edge_length
            )));
        }
        if self.overlap >= self.min_edge_length {
            return Err(GraphCutError::InvalidTileConfig(format!(
                "overlap {} must be smaller than the minimal edge length {}",
                self.overlap, self.min_edge_length
            )));
        }
        if self.num_threads == Some(0) {
            return Err(GraphCutError::InvalidTileConfig(
                "worker pool needs at least one thread".to_string(),
            ));
        }
        Ok(())
    }
}

/// Integer codes of the marker volume.
///
/// Every other code (including 0) is neutral.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MarkerCodes {
    pub foreground: i32,
    pub background: i32,
}

impl Default for MarkerCodes {
    fn default() -> Self {
        Self {
            foreground: 1,
            background: 2,
        }
    }
}

pub(crate) fn split_length_to_ranges(length: usize, splits: usize) -> Vec<Range<usize>> {
    let splits = splits.max(1);
    let chunk_size = length / splits;
    let rem = length % splits;
    (0..splits)
        .scan((rem, 0usize), |(r, acc), _split| {
            let mut size = chunk_size;
            if *r > 0 {
                *r -= 1;
                size += 1;
            }
            let out = (*acc, *acc + size);
            *acc += size;
            Some(out.0..out.1)
        })
        .filter(|r| !r.is_empty())
        .collect()
}
