//! Voxel graphs: one node per voxel, edges between axis-aligned neighbours.

use crate::arrays::Volume;
use crate::common::split_length_to_ranges;
use crate::energy::BoundaryTerm;
use crate::error::GraphCutResult;
use crate::graph::{Capacity, Graph};
use crate::maxflow::{maxflow, FlowStats, Segment};
use rayon::current_num_threads;
use rayon::prelude::*;
use tracing::debug;

/// Binary segmentation of a volume.
#[derive(Clone, Debug, PartialEq)]
pub struct Segmentation {
    /// `true` for object voxels. Same shape and spacing as the input.
    pub mask: Volume<bool>,
    /// Value of the maximum flow (the energy of the cut).
    pub flow: Capacity,
    pub stats: FlowStats,
}

/// Fills `out` with the capacities of the pairs `first_pair..first_pair + out.len()` along
/// `axis`, in the order of [`Volume::axis_pair`].
fn fill_axis_capacities<B: BoundaryTerm + ?Sized>(
    evidence: &Volume<f64>,
    axis: usize,
    term: &B,
    first_pair: usize,
    out: &mut [(Capacity, Capacity)],
) {
    let samples = evidence.as_slice();
    let inner = evidence.strides()[axis];
    let size = evidence.shape()[axis];
    let per_outer = (size - 1) * inner;
    let mut pair = first_pair;
    let mut filled = 0;
    // NOTE: inside one outer block both p and q run over contiguous memory, so the term gets
    //  two plain slices.
    while filled < out.len() {
        let outer = pair / per_outer;
        let rem = pair % per_outer;
        let run = (per_outer - rem).min(out.len() - filled);
        let p = outer * size * inner + rem;
        debug_assert!(p + inner + run <= samples.len());
        term.capacities_into(
            &samples[p..p + run],
            &samples[p + inner..p + inner + run],
            &mut out[filled..filled + run],
        );
        filled += run;
        pair += run;
    }
}

/// Capacities of all neighbouring pairs along `axis`, computed in parallel.
pub(crate) fn axis_capacities<B: BoundaryTerm + ?Sized>(
    evidence: &Volume<f64>,
    axis: usize,
    term: &B,
) -> GraphCutResult<Vec<(Capacity, Capacity)>> {
    let pair_count = evidence.axis_pair_count(axis);
    let mut out = Vec::new();
    out.try_reserve_exact(pair_count)?;
    out.resize(pair_count, (0.0, 0.0));
    if pair_count == 0 {
        return Ok(out);
    }
    let ranges = split_length_to_ranges(pair_count, current_num_threads() * 4);
    let mut chunks = Vec::with_capacity(ranges.len());
    let mut rest = out.as_mut_slice();
    for range in &ranges {
        let (head, tail) = rest.split_at_mut(range.len());
        chunks.push((range.start, head));
        rest = tail;
    }
    chunks
        .into_par_iter()
        .for_each(|(start, chunk)| fill_axis_capacities(evidence, axis, term, start, chunk));
    Ok(out)
}

/// Builds the voxel graph.
///
/// Node `i` is the voxel with flat (C order) index `i`. Every voxel is connected to its `2 *
/// ndim` axis neighbours with the capacities returned by `term` for the `evidence` samples,
/// divided by the voxel spacing along the axis. Voxels of `foreground` are hard-wired to the
/// source, voxels of `background` to the sink (background wins).
///
/// Fails with `ShapeMismatch` for volumes of different shape and with `InvalidCapacity` when
/// the term returns a non-positive capacity.
pub fn build_voxel_graph<B: BoundaryTerm + ?Sized>(
    foreground: &Volume<bool>,
    background: &Volume<bool>,
    evidence: &Volume<f64>,
    term: &B,
) -> GraphCutResult<Graph> {
    evidence.check_shape(foreground)?;
    evidence.check_shape(background)?;

    let ndim = evidence.ndim();
    let edge_count: usize = (0..ndim).map(|axis| evidence.axis_pair_count(axis)).sum();
    let mut graph = Graph::new(evidence.len(), edge_count)?;

    for axis in 0..ndim {
        let spacing = evidence.spacing()[axis];
        let capacities = axis_capacities(evidence, axis, term)?;
        for (pair, (cap_pq, cap_qp)) in capacities.into_iter().enumerate() {
            let (p, q) = evidence.axis_pair(axis, pair);
            graph.add_edge(p, q, cap_pq / spacing, cap_qp / spacing)?;
        }
    }

    set_markers(&mut graph, foreground, background)?;
    debug!(
        nodes = graph.node_count(),
        edges = graph.edge_count(),
        "voxel graph built"
    );
    Ok(graph)
}

fn set_markers(
    graph: &mut Graph,
    foreground: &Volume<bool>,
    background: &Volume<bool>,
) -> GraphCutResult<()> {
    let marked = |markers: &Volume<bool>| -> Vec<usize> {
        markers
            .as_slice()
            .iter()
            .enumerate()
            .filter(|(_, m)| **m)
            .map(|(i, _)| i)
            .collect()
    };
    let source = marked(foreground);
    let sink = marked(background);
    debug!(source = source.len(), sink = sink.len(), "hard-wiring markers");
    graph.set_source_nodes(source)?;
    graph.set_sink_nodes(sink)
}

/// Builds the voxel graph, cuts it and returns the object mask. Voxels left free by the solver
/// are background.
pub fn graphcut_voxels<B: BoundaryTerm + ?Sized>(
    foreground: &Volume<bool>,
    background: &Volume<bool>,
    evidence: &Volume<f64>,
    term: &B,
) -> GraphCutResult<Segmentation> {
    graphcut_voxels_with(foreground, background, evidence, term, Segment::Sink)
}

/// [`graphcut_voxels`] with voxels left free by the solver put on the `free` side.
pub fn graphcut_voxels_with<B: BoundaryTerm + ?Sized>(
    foreground: &Volume<bool>,
    background: &Volume<bool>,
    evidence: &Volume<f64>,
    term: &B,
    free: Segment,
) -> GraphCutResult<Segmentation> {
    let graph = build_voxel_graph(foreground, background, evidence, term)?;
    let cut = maxflow(graph)?;
    let mask =
        Volume::from_vec(cut.mask_or(free), evidence.shape())?.with_spacing(evidence.spacing())?;
    Ok(Segmentation {
        mask,
        flow: cut.flow(),
        stats: cut.stats(),
    })
}
