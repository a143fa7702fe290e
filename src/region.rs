//! Region graphs: one node per region of a label volume, edges between adjacent regions.
//!
//! Labels have to be dense starting from 1, region `l` becomes node `l - 1`. Two regions are
//! adjacent when they contain axis-aligned neighbouring voxels. The weight of a region pair is
//! produced by a [`RegionTerm`], usually by summing a voxel term over the voxel pairs of the
//! border. Sums are not normalised by the border size, so long borders are expensive to cut.

use crate::arrays::Volume;
use crate::energy::{floor_positive, regional_probability, BoundaryTerm, Directed, VoxelBoundary};
use crate::error::{GraphCutError, GraphCutResult};
use crate::graph::{Capacity, Graph};
use crate::grid::Segmentation;
use crate::maxflow::{maxflow, Segment};
use std::collections::HashMap;
use std::hash::Hash;
use tracing::debug;

/// Region label, dense from 1.
pub type Label = u32;

/// Weight of adjacent region pairs.
///
/// For every border voxel pair `(p, q)` the builder calls [`RegionTerm::border_contribution`]
/// and sums the results per region pair. The pair is always oriented from the region with the
/// smaller label `a` to the one with the larger label `b`, the sums are then handed to
/// [`RegionTerm::region_capacities`].
pub trait RegionTerm: Sync {
    /// `(cap(p->q), cap(q->p))` contribution of the voxels with flat indices `p` and `q`,
    /// `q` being the successor of `p` along an axis.
    fn border_contribution(&self, _p: usize, _q: usize) -> (Capacity, Capacity) {
        (0.0, 0.0)
    }

    /// Final `(cap(a->b), cap(b->a))` of the region pair, `a < b`. `None` adds no edge.
    fn region_capacities(
        &self,
        _a: Label,
        _b: Label,
        border: (Capacity, Capacity),
    ) -> Option<(Capacity, Capacity)> {
        Some(border)
    }
}

/// Voxel boundary term summed over the border of two regions.
pub struct SummedBoundary<'a, B> {
    evidence: &'a Volume<f64>,
    term: B,
}

impl<'a, B: BoundaryTerm> SummedBoundary<'a, B> {
    pub fn new(evidence: &'a Volume<f64>, term: B) -> Self {
        Self { evidence, term }
    }
}

impl<'a> SummedBoundary<'a, VoxelBoundary> {
    /// `(1 / (1 + max(|g_p|, |g_q|)))^2` summed over the border, `gradient` being the gradient
    /// magnitude image.
    pub fn stawiaski(gradient: &'a Volume<f64>) -> Self {
        Self::new(gradient, VoxelBoundary::maximum_power(2.0))
    }
}

impl<'a> SummedBoundary<'a, Directed<VoxelBoundary>> {
    /// Directed variant of [`SummedBoundary::stawiaski`], see [`Directed`].
    pub fn stawiaski_directed(gradient: &'a Volume<f64>, directedness: f64) -> Self {
        Self::new(
            gradient,
            Directed::new(VoxelBoundary::maximum_power(2.0), directedness),
        )
    }
}

impl<'a, B: BoundaryTerm> RegionTerm for SummedBoundary<'a, B> {
    #[inline(always)]
    fn border_contribution(&self, p: usize, q: usize) -> (Capacity, Capacity) {
        let samples = self.evidence.as_slice();
        self.term.capacities(samples[p], samples[q])
    }
}

/// `max(1 - |mean_a - mean_b| / range, eps)`, where `range` is the difference of the
/// largest and the smallest region mean.
#[derive(Clone, Debug)]
pub struct DifferenceOfMeans {
    /// Indexed by `label - 1`.
    means: Vec<f64>,
    range: f64,
}

impl DifferenceOfMeans {
    pub fn new(labels: &Volume<Label>, original: &Volume<f64>) -> GraphCutResult<Self> {
        labels.check_shape(original)?;
        let region_count = region_count(labels)?;
        let mut sums = vec![0.0f64; region_count];
        let mut counts = vec![0usize; region_count];
        for (label, value) in labels.as_slice().iter().zip(original.as_slice()) {
            sums[*label as usize - 1] += value;
            counts[*label as usize - 1] += 1;
        }
        let means: Vec<f64> = sums
            .iter()
            .zip(&counts)
            .map(|(s, c)| s / *c as f64)
            .collect();
        let (lo, hi) = means
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), m| {
                (lo.min(*m), hi.max(*m))
            });
        Ok(Self {
            means,
            range: (hi - lo).abs(),
        })
    }

    pub fn mean(&self, label: Label) -> f64 {
        self.means[label as usize - 1]
    }
}

impl RegionTerm for DifferenceOfMeans {
    fn region_capacities(
        &self,
        a: Label,
        b: Label,
        _border: (Capacity, Capacity),
    ) -> Option<(Capacity, Capacity)> {
        let w = if self.range == 0.0 {
            f64::MIN_POSITIVE
        } else {
            floor_positive(1.0 - (self.mean(a) - self.mean(b)).abs() / self.range)
        };
        Some((w, w))
    }
}

/// Explicit weights of region pairs. Adjacent pairs missing from the table get no edge.
#[derive(Clone, Debug, Default)]
pub struct WeightTable {
    weights: HashMap<(Label, Label), (Capacity, Capacity)>,
}

impl WeightTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the symmetric weight of the pair `(a, b)`.
    pub fn insert(&mut self, a: Label, b: Label, weight: Capacity) {
        self.insert_directed(a, b, weight, weight);
    }

    /// Sets `cap(a->b)` and `cap(b->a)`.
    pub fn insert_directed(&mut self, a: Label, b: Label, cap_ab: Capacity, cap_ba: Capacity) {
        if a <= b {
            self.weights.insert((a, b), (cap_ab, cap_ba));
        } else {
            self.weights.insert((b, a), (cap_ba, cap_ab));
        }
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }
}

impl FromIterator<((Label, Label), Capacity)> for WeightTable {
    fn from_iter<I: IntoIterator<Item = ((Label, Label), Capacity)>>(iter: I) -> Self {
        let mut table = Self::new();
        for ((a, b), w) in iter {
            table.insert(a, b, w);
        }
        table
    }
}

impl RegionTerm for WeightTable {
    fn region_capacities(
        &self,
        a: Label,
        b: Label,
        _border: (Capacity, Capacity),
    ) -> Option<(Capacity, Capacity)> {
        self.weights.get(&(a, b)).copied()
    }
}

/// Number of regions. Fails with `InvalidLabeling` unless the labels are exactly `1..=max`.
pub fn region_count(labels: &Volume<Label>) -> GraphCutResult<usize> {
    let Some((lo, hi)) = labels.min_max() else {
        return Err(GraphCutError::InvalidLabeling(
            "label volume is empty".to_string(),
        ));
    };
    if lo != 1 {
        return Err(GraphCutError::InvalidLabeling(format!(
            "labels have to start from 1, smallest label is {lo}"
        )));
    }
    if hi as usize > labels.len() {
        return Err(GraphCutError::InvalidLabeling(format!(
            "labels are not consecutive, largest label {hi} exceeds the {} voxels",
            labels.len()
        )));
    }
    let mut present = vec![false; hi as usize];
    for label in labels.as_slice() {
        present[*label as usize - 1] = true;
    }
    if let Some(missing) = present.iter().position(|p| !p) {
        return Err(GraphCutError::InvalidLabeling(format!(
            "labels are not consecutive, label {} is missing",
            missing + 1
        )));
    }
    Ok(hi as usize)
}

/// Maps arbitrary labels to dense labels starting from 1, in order of first appearance.
pub fn relabel<T>(labels: &Volume<T>) -> GraphCutResult<Volume<Label>>
where
    T: Copy + Eq + Hash,
{
    let mut mapping: HashMap<T, Label> = HashMap::new();
    let mut next: Label = 1;
    let mut out = Vec::new();
    out.try_reserve_exact(labels.len())?;
    for label in labels.as_slice() {
        let dense = *mapping.entry(*label).or_insert_with(|| {
            let l = next;
            next += 1;
            l
        });
        out.push(dense);
    }
    Ok(Volume::from_vec(out, labels.shape())?.with_spacing(labels.spacing())?)
}

/// Summed border contributions of every adjacent region pair, sorted by the pair.
fn region_borders<R: RegionTerm + ?Sized>(
    labels: &Volume<Label>,
    term: &R,
) -> Vec<((Label, Label), (Capacity, Capacity))> {
    let samples = labels.as_slice();
    let mut borders: HashMap<(Label, Label), (Capacity, Capacity)> = HashMap::new();
    for axis in 0..labels.ndim() {
        for pair in 0..labels.axis_pair_count(axis) {
            let (p, q) = labels.axis_pair(axis, pair);
            let (lp, lq) = (samples[p], samples[q]);
            if lp == lq {
                continue;
            }
            let (c_pq, c_qp) = term.border_contribution(p, q);
            let (key, contribution) = if lp < lq {
                ((lp, lq), (c_pq, c_qp))
            } else {
                ((lq, lp), (c_qp, c_pq))
            };
            let sum = borders.entry(key).or_insert((0.0, 0.0));
            sum.0 += contribution.0;
            sum.1 += contribution.1;
        }
    }
    let mut borders: Vec<_> = borders.into_iter().collect();
    borders.sort_unstable_by_key(|(key, _)| *key);
    borders
}

/// Pairs of adjacent regions `(a, b)`, `a < b`, sorted.
pub fn region_adjacency(labels: &Volume<Label>) -> Vec<(Label, Label)> {
    struct Adjacency;
    impl RegionTerm for Adjacency {}
    region_borders(labels, &Adjacency)
        .into_iter()
        .map(|(key, _)| key)
        .collect()
}

fn marked_regions(labels: &Volume<Label>, markers: &Volume<bool>) -> Vec<usize> {
    let mut regions: Vec<usize> = labels
        .as_slice()
        .iter()
        .zip(markers.as_slice())
        .filter(|(_, m)| **m)
        .map(|(l, _)| *l as usize - 1)
        .collect();
    regions.sort_unstable();
    regions.dedup();
    regions
}

/// Builds the region graph.
///
/// Regions containing a `foreground` voxel are hard-wired to the source, regions containing a
/// `background` voxel to the sink (background wins).
pub fn build_region_graph<R: RegionTerm + ?Sized>(
    labels: &Volume<Label>,
    foreground: &Volume<bool>,
    background: &Volume<bool>,
    term: &R,
) -> GraphCutResult<Graph> {
    labels.check_shape(foreground)?;
    labels.check_shape(background)?;
    let region_count = region_count(labels)?;

    let borders = region_borders(labels, term);
    let mut graph = Graph::new(region_count, borders.len())?;
    for ((a, b), summed) in borders {
        if let Some((cap_ab, cap_ba)) = term.region_capacities(a, b, summed) {
            graph.add_edge(a as usize - 1, b as usize - 1, cap_ab, cap_ba)?;
        }
    }

    let source = marked_regions(labels, foreground);
    let sink = marked_regions(labels, background);
    debug!(
        nodes = graph.node_count(),
        edges = graph.edge_count(),
        source = source.len(),
        sink = sink.len(),
        "region graph built"
    );
    graph.set_source_nodes(source)?;
    graph.set_sink_nodes(sink)?;
    Ok(graph)
}

/// Sets the t-weights of the region nodes from the mean foreground probability of each region.
pub fn regional_probability_regions(
    graph: &mut Graph,
    labels: &Volume<Label>,
    probability: &Volume<f64>,
    alpha: f64,
) -> GraphCutResult<()> {
    labels.check_shape(probability)?;
    let region_count = region_count(labels)?;
    if region_count != graph.node_count() {
        return Err(GraphCutError::shape_mismatch(
            &[graph.node_count()],
            &[region_count],
        ));
    }
    let mut sums = vec![0.0f64; region_count];
    let mut counts = vec![0usize; region_count];
    for (label, p) in labels.as_slice().iter().zip(probability.as_slice()) {
        sums[*label as usize - 1] += p;
        counts[*label as usize - 1] += 1;
    }
    graph.set_tweights_all(
        sums.iter()
            .zip(&counts)
            .map(|(s, c)| regional_probability(s / *c as f64, alpha)),
    )
}

/// Projects a per-region mask (indexed by `label - 1`) back onto the voxels.
pub fn region_mask(labels: &Volume<Label>, regions: &[bool]) -> GraphCutResult<Volume<bool>> {
    let mut mask = Vec::new();
    mask.try_reserve_exact(labels.len())?;
    for label in labels.as_slice() {
        let region = (*label as usize).checked_sub(1).and_then(|i| regions.get(i));
        match region {
            Some(m) => mask.push(*m),
            None => {
                return Err(GraphCutError::InvalidLabeling(format!(
                    "label {label} has no region among {} regions",
                    regions.len()
                )))
            }
        }
    }
    Volume::from_vec(mask, labels.shape())?.with_spacing(labels.spacing())
}

/// Builds the region graph, cuts it and returns the voxel mask. Regions left free by the
/// solver are background.
pub fn graphcut_regions<R: RegionTerm + ?Sized>(
    labels: &Volume<Label>,
    foreground: &Volume<bool>,
    background: &Volume<bool>,
    term: &R,
) -> GraphCutResult<Segmentation> {
    graphcut_regions_with(labels, foreground, background, term, Segment::Sink)
}

/// [`graphcut_regions`] with regions left free by the solver put on the `free` side.
pub fn graphcut_regions_with<R: RegionTerm + ?Sized>(
    labels: &Volume<Label>,
    foreground: &Volume<bool>,
    background: &Volume<bool>,
    term: &R,
    free: Segment,
) -> GraphCutResult<Segmentation> {
    let graph = build_region_graph(labels, foreground, background, term)?;
    let cut = maxflow(graph)?;
    Ok(Segmentation {
        mask: region_mask(labels, &cut.mask_or(free))?,
        flow: cut.flow(),
        stats: cut.stats(),
    })
}
