//! Tiled execution for volumes too large to be cut in one pass.
//!
//! The volume is split into overlapping tiles, every tile is cut on its own in a worker pool
//! and the partial masks are merged. Inside the band a tile shares with its lower neighbours
//! the masks are combined using logical AND, so a voxel on a seam is object only when all tiles
//! covering it agree.

use crate::arrays::Volume;
use crate::common::Config;
use crate::energy::BoundaryTerm;
use crate::error::{GraphCutError, GraphCutResult};
use crate::grid::graphcut_voxels_with;
use crate::maxflow::Segment;
use crate::region::{graphcut_regions_with, relabel, DifferenceOfMeans, Label, SummedBoundary};
use rayon::ThreadPoolBuilder;
use std::ops::Range;
use std::sync::mpsc;
use tracing::{debug, info, warn};

/// Box of the volume `[start, end)`, tiles are numbered in lexicographic order of their start
/// (last axis fastest).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tile {
    pub index: usize,
    pub start: Vec<usize>,
    pub end: Vec<usize>,
}

impl Tile {
    pub fn shape(&self) -> Vec<usize> {
        self.start.iter().zip(&self.end).map(|(s, e)| e - s).collect()
    }
}

/// Tile ranges along one axis of length `size`.
///
/// There are `max(1, size / L)` tiles of stride `ceil(size / steps)`, each extended by the
/// overlap and clipped to the axis. Tiles starting behind the end of the axis are dropped,
/// the ones before already cover it.
pub fn axis_tiles(size: usize, config: &Config) -> Vec<Range<usize>> {
    let steps = (size / config.min_edge_length).max(1);
    let stride = size.div_ceil(steps);
    (0..steps)
        .map(|k| k * stride)
        .take_while(|start| *start < size)
        .map(|start| start..(start + stride + config.overlap).min(size))
        .collect()
}

/// All tiles of a volume of `shape`, Cartesian product of the per-axis tiles.
pub fn tile_grid(shape: &[usize], config: &Config) -> GraphCutResult<Vec<Tile>> {
    config.validate()?;
    let per_axis: Vec<Vec<Range<usize>>> = shape.iter().map(|s| axis_tiles(*s, config)).collect();
    if per_axis.iter().any(|ranges| ranges.is_empty()) {
        return Ok(Vec::new());
    }
    let total: usize = per_axis.iter().map(|ranges| ranges.len()).product();
    let mut tiles = Vec::with_capacity(total);
    let mut position = vec![0usize; shape.len()];
    for index in 0..total {
        tiles.push(Tile {
            index,
            start: position
                .iter()
                .zip(&per_axis)
                .map(|(p, ranges)| ranges[*p].start)
                .collect(),
            end: position
                .iter()
                .zip(&per_axis)
                .map(|(p, ranges)| ranges[*p].end)
                .collect(),
        });
        for axis in (0..shape.len()).rev() {
            position[axis] += 1;
            if position[axis] < per_axis[axis].len() {
                break;
            }
            position[axis] = 0;
        }
    }
    Ok(tiles)
}

/// Private copy of the inputs of one tile.
#[derive(Clone, Debug)]
pub struct TileData {
    pub tile: Tile,
    pub foreground: Volume<bool>,
    pub background: Volume<bool>,
    pub evidence: Volume<f64>,
    /// Present for region based runs. Not relabeled, a tile may miss some labels.
    pub labels: Option<Volume<Label>>,
    /// Side of the nodes left free by the solver, from [`Config::free_nodes`].
    pub free: Segment,
}

/// Full volumes a tiled run is working on.
#[derive(Clone, Copy, Debug)]
pub struct TiledInput<'a> {
    pub foreground: &'a Volume<bool>,
    pub background: &'a Volume<bool>,
    pub evidence: &'a Volume<f64>,
    pub labels: Option<&'a Volume<Label>>,
}

impl<'a> TiledInput<'a> {
    pub fn voxels(
        foreground: &'a Volume<bool>,
        background: &'a Volume<bool>,
        evidence: &'a Volume<f64>,
    ) -> Self {
        Self {
            foreground,
            background,
            evidence,
            labels: None,
        }
    }

    pub fn regions(
        labels: &'a Volume<Label>,
        foreground: &'a Volume<bool>,
        background: &'a Volume<bool>,
        evidence: &'a Volume<f64>,
    ) -> Self {
        Self {
            foreground,
            background,
            evidence,
            labels: Some(labels),
        }
    }

    fn check_shapes(&self) -> GraphCutResult<()> {
        self.evidence.check_shape(self.foreground)?;
        self.evidence.check_shape(self.background)?;
        if let Some(labels) = self.labels {
            self.evidence.check_shape(labels)?;
        }
        Ok(())
    }

    fn extract(&self, tile: &Tile, free: Segment) -> GraphCutResult<TileData> {
        Ok(TileData {
            tile: tile.clone(),
            foreground: self.foreground.subvolume(&tile.start, &tile.end)?,
            background: self.background.subvolume(&tile.start, &tile.end)?,
            evidence: self.evidence.subvolume(&tile.start, &tile.end)?,
            labels: self
                .labels
                .map(|labels| labels.subvolume(&tile.start, &tile.end))
                .transpose()?,
            free,
        })
    }
}

/// Segmentation pipeline run on every tile. Returns the object mask of the tile.
pub trait TileCut: Sync {
    fn cut(&self, data: &TileData) -> GraphCutResult<Volume<bool>>;
}

impl<F> TileCut for F
where
    F: Fn(&TileData) -> GraphCutResult<Volume<bool>> + Sync,
{
    fn cut(&self, data: &TileData) -> GraphCutResult<Volume<bool>> {
        self(data)
    }
}

/// Voxel graph cut of every tile with the same boundary term.
///
/// Terms depending on the image statistics (like [`crate::energy::VoxelBoundary::difference_linear`])
/// should be computed on the full volume, so all tiles share them.
#[derive(Clone, Debug)]
pub struct VoxelCut<B>(pub B);

impl<B: BoundaryTerm> TileCut for VoxelCut<B> {
    fn cut(&self, data: &TileData) -> GraphCutResult<Volume<bool>> {
        graphcut_voxels_with(
            &data.foreground,
            &data.background,
            &data.evidence,
            &self.0,
            data.free,
        )
        .map(|segmentation| segmentation.mask)
    }
}

/// Region graph cut of every tile. Labels are relabeled per tile, the term is computed on the
/// tile's evidence (gradient magnitude for the stawiaski terms, intensities for the means).
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RegionCut {
    Stawiaski,
    StawiaskiDirected { directedness: f64 },
    DifferenceOfMeans,
}

impl TileCut for RegionCut {
    fn cut(&self, data: &TileData) -> GraphCutResult<Volume<bool>> {
        let labels = data.labels.as_ref().ok_or_else(|| {
            GraphCutError::InvalidLabeling("region cut needs a label volume".to_string())
        })?;
        let labels = relabel(labels)?;
        let (fg, bg, evidence) = (&data.foreground, &data.background, &data.evidence);
        let free = data.free;
        let segmentation = match *self {
            RegionCut::Stawiaski => graphcut_regions_with(
                &labels,
                fg,
                bg,
                &SummedBoundary::stawiaski(evidence),
                free,
            )?,
            RegionCut::StawiaskiDirected { directedness } => graphcut_regions_with(
                &labels,
                fg,
                bg,
                &SummedBoundary::stawiaski_directed(evidence, directedness),
                free,
            )?,
            RegionCut::DifferenceOfMeans => graphcut_regions_with(
                &labels,
                fg,
                bg,
                &DifferenceOfMeans::new(&labels, evidence)?,
                free,
            )?,
        };
        Ok(segmentation.mask)
    }
}

/// Writes the mask of `tile` into `out`. Voxels closer than `overlap` to the start of the tile
/// along an axis where the tile does not start at zero are AND-ed, the rest is copied.
fn merge_tile(out: &mut Volume<bool>, tile: &Tile, mask: &Volume<bool>, overlap: usize) {
    debug_assert_eq!(mask.shape(), &tile.shape()[..]);
    let ndim = out.ndim();
    let last = ndim - 1;
    let strides = out.strides().to_vec();
    let row_len = mask.shape()[last];
    let last_band = if tile.start[last] != 0 {
        overlap.min(row_len)
    } else {
        0
    };
    let zeros = vec![0usize; ndim];
    let out_data = out.as_mut_slice();
    mask.for_each_region_row(&zeros, mask.shape(), |local, mask_index| {
        let global: usize = local
            .iter()
            .zip(&tile.start)
            .zip(&strides)
            .map(|((l, s), stride)| (l + s) * stride)
            .sum();
        let row_in_band = (0..last).any(|axis| tile.start[axis] != 0 && local[axis] < overlap);
        let src = &mask.as_slice()[mask_index..mask_index + row_len];
        let dst = &mut out_data[global..global + row_len];
        for (k, (d, s)) in dst.iter_mut().zip(src).enumerate() {
            if row_in_band || k < last_band {
                *d &= *s;
            } else {
                *d = *s;
            }
        }
    });
}

fn run_tile<C: TileCut + ?Sized>(
    input: &TiledInput<'_>,
    cut: &C,
    tile: &Tile,
    free: Segment,
) -> GraphCutResult<Volume<bool>> {
    let data = input.extract(tile, free)?;
    let mask = cut.cut(&data)?;
    let shape = tile.shape();
    if mask.shape() != &shape[..] {
        return Err(GraphCutError::shape_mismatch(&shape, mask.shape()));
    }
    Ok(mask)
}

/// Runs `cut` on every tile in a worker pool and merges the masks.
///
/// All tiles are run to the end even if some of them fail. Failures are reported afterwards as
/// `TilesFailed` carrying the error of the lowest failed tile, no partial mask is returned.
pub fn graphcut_tiled<C: TileCut + ?Sized>(
    input: &TiledInput<'_>,
    cut: &C,
    config: &Config,
) -> GraphCutResult<Volume<bool>> {
    config.validate()?;
    input.check_shapes()?;
    let shape = input.evidence.shape();
    let tiles = tile_grid(shape, config)?;
    info!(
        tiles = tiles.len(),
        ?shape,
        min_edge_length = config.min_edge_length,
        overlap = config.overlap,
        "tiled graph-cut"
    );

    let mut builder = ThreadPoolBuilder::new();
    if let Some(num_threads) = config.num_threads {
        builder = builder.num_threads(num_threads);
    }
    let pool = builder.build()?;

    let free = config.free_nodes;
    let (sender, receiver) = mpsc::channel();
    pool.scope(|s| {
        for tile in &tiles {
            let sender = sender.clone();
            s.spawn(move |_| {
                let result = run_tile(input, cut, tile, free);
                // receiver lives until all tasks are done
                let _ = sender.send((tile.index, result));
            });
        }
    });
    drop(sender);

    let mut masks: Vec<Option<Volume<bool>>> = (0..tiles.len()).map(|_| None).collect();
    let mut failures: Vec<(usize, GraphCutError)> = Vec::new();
    for (index, result) in receiver {
        match result {
            Ok(mask) => masks[index] = Some(mask),
            Err(err) => {
                warn!(tile = index, start = ?tiles[index].start, error = %err, "tile failed");
                failures.push((index, err));
            }
        }
    }
    if !failures.is_empty() {
        failures.sort_unstable_by_key(|(index, _)| *index);
        let failed = failures.len();
        let (tile, first) = failures.swap_remove(0);
        return Err(GraphCutError::TilesFailed {
            failed,
            total: tiles.len(),
            tile,
            first: Box::new(first),
        });
    }

    let mut out = Volume::from_fill(false, shape)?.with_spacing(input.evidence.spacing())?;
    for (tile, mask) in tiles.iter().zip(masks) {
        let Some(mask) = mask else {
            return Err(GraphCutError::ResourceExhausted(format!(
                "tile {} returned no result",
                tile.index
            )));
        };
        merge_tile(&mut out, tile, &mask, config.overlap);
    }
    debug!(tiles = tiles.len(), "tiles merged");
    Ok(out)
}

/// [`graphcut_tiled`] with the voxel pipeline.
pub fn graphcut_voxels_tiled<B: BoundaryTerm>(
    foreground: &Volume<bool>,
    background: &Volume<bool>,
    evidence: &Volume<f64>,
    term: B,
    config: &Config,
) -> GraphCutResult<Volume<bool>> {
    graphcut_tiled(
        &TiledInput::voxels(foreground, background, evidence),
        &VoxelCut(term),
        config,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::energy::VoxelBoundary;
    use crate::grid::graphcut_voxels;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config(min_edge_length: usize, overlap: usize) -> Config {
        Config {
            min_edge_length,
            overlap,
            num_threads: Some(2),
            ..Config::default()
        }
    }

    /// 20x20 image with an object stripe in columns 5..15, markers in full columns.
    fn stripes() -> (Volume<f64>, Volume<bool>, Volume<bool>) {
        let shape = [20, 20];
        let image = Volume::from_fn(&shape, |i| {
            if (5..15).contains(&(i % 20)) {
                100.0
            } else {
                0.0
            }
        })
        .unwrap();
        let fg = Volume::from_fn(&shape, |i| i % 20 == 7 || i % 20 == 12).unwrap();
        let bg = Volume::from_fn(&shape, |i| i % 20 == 0 || i % 20 == 19).unwrap();
        (image, fg, bg)
    }

    #[test]
    fn tiled_axis_tiles() {
        assert_eq!(axis_tiles(25, &config(10, 3)), vec![0..16, 13..25]);
        assert_eq!(axis_tiles(9, &config(10, 3)), vec![0..9]);
        assert_eq!(axis_tiles(20, &config(10, 0)), vec![0..10, 10..20]);
        // 100 steps of stride 11 overshoot, the last ones are dropped
        let ranges = axis_tiles(1001, &config(10, 2));
        assert_eq!(ranges.len(), 91);
        assert_eq!(ranges.last().unwrap().end, 1001);
        for pair in ranges.windows(2) {
            assert_eq!(pair[0].end, pair[1].start + 2);
        }
    }

    #[test]
    fn tiled_grid_order() {
        let tiles = tile_grid(&[25, 9, 20], &config(10, 3)).unwrap();
        assert_eq!(tiles.len(), 4);
        assert_eq!(tiles[0].start, vec![0, 0, 0]);
        assert_eq!(tiles[1].start, vec![0, 0, 10]);
        assert_eq!(tiles[2].start, vec![13, 0, 0]);
        assert_eq!(tiles[3].end, vec![25, 9, 20]);
        assert_eq!(tiles[1].shape(), vec![16, 9, 10]);
        assert!(tiles.iter().enumerate().all(|(i, t)| t.index == i));
        assert!(matches!(
            tile_grid(&[25], &config(9, 3)),
            Err(GraphCutError::InvalidTileConfig(_))
        ));
        assert!(matches!(
            tile_grid(&[25], &config(10, 10)),
            Err(GraphCutError::InvalidTileConfig(_))
        ));
    }

    #[test]
    fn tiled_merge_ands_overlap() {
        let mut out = Volume::from_fill(false, &[6]).unwrap();
        let first = Tile {
            index: 0,
            start: vec![0],
            end: vec![4],
        };
        let second = Tile {
            index: 1,
            start: vec![2],
            end: vec![6],
        };
        merge_tile(
            &mut out,
            &first,
            &Volume::from_slice(&[true, true, true, false], &[4]).unwrap(),
            2,
        );
        merge_tile(
            &mut out,
            &second,
            &Volume::from_slice(&[true, true, true, true], &[4]).unwrap(),
            2,
        );
        assert_eq!(out.as_slice(), &[true, true, true, false, true, true]);
    }

    #[test]
    fn tiled_merge_2d_bands() {
        // second row of tiles, the first `overlap` rows are AND-ed
        let mut out = Volume::from_fill(true, &[4, 3]).unwrap();
        let tile = Tile {
            index: 1,
            start: vec![1, 0],
            end: vec![4, 3],
        };
        let mask = Volume::from_slice(
            &[false, true, false, false, true, false, false, false, true],
            &[3, 3],
        )
        .unwrap();
        out.as_mut_slice()[4] = false;
        merge_tile(&mut out, &tile, &mask, 1);
        assert_eq!(
            out.as_slice(),
            &[true, true, true, false, false, false, false, true, false, false, false, true]
        );
    }

    #[test]
    fn tiled_matches_single_pass() {
        let (image, fg, bg) = stripes();
        let term = VoxelBoundary::difference_linear(&image);
        let single = graphcut_voxels(&fg, &bg, &image, &term).unwrap().mask;
        let expected = Volume::from_fn(&[20, 20], |i| (5..15).contains(&(i % 20))).unwrap();
        assert_eq!(single, expected);
        for overlap in [0, 3] {
            let tiled = graphcut_voxels_tiled(&fg, &bg, &image, term, &config(10, overlap))
                .unwrap();
            assert_eq!(tiled, single, "overlap {overlap}");
        }
    }

    /// Fraction of voxels within `band` of column 10 where the masks differ.
    fn seam_disagreement(tiled: &Volume<bool>, single: &Volume<bool>, band: usize) -> f64 {
        let cols = tiled.shape()[1];
        let (mut differ, mut total) = (0usize, 0usize);
        for (i, (t, s)) in tiled.as_slice().iter().zip(single.as_slice()).enumerate() {
            if (i % cols).abs_diff(10) <= band {
                total += 1;
                differ += usize::from(t != s);
            }
        }
        differ as f64 / total as f64
    }

    #[test]
    fn tiled_overlap_reduces_seam_errors() {
        // noisy bright object in columns 2..6, noisy dark background around it. The only
        // background marker right of the object is in column 11, behind the seam at column 10.
        let shape = [4, 20];
        let image = Volume::from_fn(&shape, |i| {
            let col = i % 20;
            if (2..6).contains(&col) {
                100.0 + ((i * 5) % 4) as f64
            } else {
                ((i * 7) % 4) as f64
            }
        })
        .unwrap();
        let fg = Volume::from_fn(&shape, |i| i % 20 == 3).unwrap();
        let bg = Volume::from_fn(&shape, |i| i % 20 == 0 || i % 20 == 11).unwrap();
        let term = VoxelBoundary::difference_linear(&image);
        let single = graphcut_voxels(&fg, &bg, &image, &term).unwrap().mask;
        let expected = Volume::from_fn(&shape, |i| (2..6).contains(&(i % 20))).unwrap();
        assert_eq!(single, expected);

        let rates: Vec<f64> = [0, 3]
            .into_iter()
            .map(|overlap| {
                let tiled = graphcut_voxels_tiled(&fg, &bg, &image, term, &config(10, overlap))
                    .unwrap();
                seam_disagreement(&tiled, &single, 5)
            })
            .collect();
        // without overlap the first tile never sees the marker in column 11
        assert!(rates[0] > 0.0);
        assert!(rates[1] <= rates[0], "rates {rates:?}");
        assert_eq!(rates[1], 0.0);
    }

    #[test]
    fn tiled_free_nodes_reach_the_tiles() {
        let (image, fg, bg) = stripes();
        let input = TiledInput::voxels(&fg, &bg, &image);
        let cut = |data: &TileData| -> GraphCutResult<Volume<bool>> {
            Volume::from_fill(data.free == Segment::Source, &data.tile.shape())
        };
        let mut config = config(10, 2);
        assert!(!graphcut_tiled(&input, &cut, &config).unwrap().as_slice().iter().any(|m| *m));
        config.free_nodes = Segment::Source;
        assert!(graphcut_tiled(&input, &cut, &config).unwrap().as_slice().iter().all(|m| *m));
    }

    #[test]
    fn tiled_regions() {
        let (image, fg, bg) = stripes();
        // four stripes of five columns with sparse label values
        let labels = Volume::from_fn(&[20, 20], |i| ((i % 20) / 5) as u32 * 10 + 3).unwrap();
        let input = TiledInput::regions(&labels, &fg, &bg, &image);
        let mask = graphcut_tiled(&input, &RegionCut::DifferenceOfMeans, &config(10, 3)).unwrap();
        let expected = Volume::from_fn(&[20, 20], |i| (5..15).contains(&(i % 20))).unwrap();
        assert_eq!(mask, expected);

        let voxels_only = TiledInput::voxels(&fg, &bg, &image);
        assert!(matches!(
            graphcut_tiled(&voxels_only, &RegionCut::Stawiaski, &config(10, 3)),
            Err(GraphCutError::TilesFailed {
                failed: 4,
                total: 4,
                tile: 0,
                ..
            })
        ));
    }

    #[test]
    fn tiled_failures_after_all_tiles() {
        let (image, fg, bg) = stripes();
        let input = TiledInput::voxels(&fg, &bg, &image);
        let finished = AtomicUsize::new(0);
        let cut = |data: &TileData| -> GraphCutResult<Volume<bool>> {
            finished.fetch_add(1, Ordering::Relaxed);
            if data.tile.start[0] != 0 {
                return Err(GraphCutError::InvalidCapacity {
                    capacity: 0.0,
                    location: format!("tile {}", data.tile.index),
                });
            }
            Volume::from_fill(true, &data.tile.shape())
        };
        let result = graphcut_tiled(&input, &cut, &config(10, 0));
        assert_eq!(finished.load(Ordering::Relaxed), 4);
        match result {
            Err(GraphCutError::TilesFailed {
                failed,
                total,
                tile,
                first,
            }) => {
                assert_eq!((failed, total, tile), (2, 4, 2));
                assert!(matches!(*first, GraphCutError::InvalidCapacity { .. }));
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn tiled_shape_checks() {
        let (image, fg, _) = stripes();
        let bg = Volume::from_fill(false, &[20, 19]).unwrap();
        let input = TiledInput::voxels(&fg, &bg, &image);
        let cut = VoxelCut(VoxelBoundary::difference_power(1.0));
        assert!(matches!(
            graphcut_tiled(&input, &cut, &Config::default()),
            Err(GraphCutError::ShapeMismatch { .. })
        ));

        let (image, fg, bg) = stripes();
        let input = TiledInput::voxels(&fg, &bg, &image);
        let wrong = |_: &TileData| Volume::from_fill(true, &[2, 2]);
        assert!(matches!(
            graphcut_tiled(&input, &wrong, &config(10, 0)),
            Err(GraphCutError::TilesFailed { failed: 4, .. })
        ));
    }
}
