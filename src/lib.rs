//! Interactive binary graph-cut segmentation of nD images in Rust.
//!
//! The user marks some voxels as object (foreground) and some as background. Every voxel (or
//! every region of an over-segmentation) becomes a node of a flow graph, neighbouring nodes are
//! connected with capacities derived from the image by a boundary term and the markers are
//! hard-wired to the two terminals. The minimum cut of the graph, computed with the
//! Boykov-Kolmogorov max-flow algorithm, separates object from background.
//!
//! The following example segments a bright object of a tiny image:
//!
//! ```rust
//! use fast_graphcut_rust::arrays::Volume;
//! use fast_graphcut_rust::common::MarkerCodes;
//! use fast_graphcut_rust::energy::VoxelBoundary;
//! use fast_graphcut_rust::grid::graphcut_voxels;
//! use fast_graphcut_rust::markers::split_markers;
//!
//! fn main() -> Result<(), fast_graphcut_rust::error::GraphCutError> {
//!     // image with a bright object in the middle
//!     let image = Volume::from_slice(&[0.0, 0.0, 9.0, 10.0, 9.0, 0.0], &[1, 6])?;
//!     // 1 marks the object, 2 the background
//!     let markers = Volume::from_slice(&[2, 0, 0, 1, 0, 2], &[1, 6])?;
//!     let (fg, bg) = split_markers(&markers, MarkerCodes::default());
//!     // the linear term is normalised by the intensity range of the image
//!     let term = VoxelBoundary::difference_linear(&image);
//!     let segmentation = graphcut_voxels(&fg, &bg, &image, &term)?;
//!     assert_eq!(
//!         segmentation.mask.as_slice(),
//!         &[false, false, true, true, true, false]
//!     );
//!     Ok(())
//! }
//! ```
//!
//! For large volumes use [`tiled::graphcut_tiled`] (or [`tiled::graphcut_voxels_tiled`]), which
//! cuts overlapping tiles in a worker pool and merges the masks. Region graphs built on top of a
//! label volume (e.g. from a watershed) are in [`region`].
//!
//! Capacities produced by the boundary terms are never clamped by the builders. A custom term
//! returning zero or a negative value is reported as `InvalidCapacity`.
//!
//! It's strongly recommended to use this in release build. The solver uses `assume!` macro to
//! avoid boundary checks in its hot loops in release builds.
//!
//! The crate logs through `tracing` and never installs a subscriber.
//!

pub mod arrays;
pub mod common;
pub mod energy;
pub mod error;
pub mod graph;
pub mod grid;
pub mod markers;
pub mod maxflow;
pub mod region;
pub mod tiled;
