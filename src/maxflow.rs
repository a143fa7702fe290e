//! Boykov-Kolmogorov max-flow / min-cut.
//!
//! Two search trees are grown from the terminals. When they touch, flow is pushed along the
//! found path, saturated tree edges turn their children into orphans and the orphans are either
//! adopted by another node of the same tree or freed. The trees are kept between iterations,
//! which is what makes the algorithm fast on the grid graphs of image segmentation.
//!
//! The trees live in a flat arena: nodes and arcs are addressed by `u32` indices, a node stores
//! the index of the arc leading to its parent. Arcs are stored per node in CSR layout, every
//! arc knows its reverse (`sister`) arc.

use crate::error::{GraphCutError, GraphCutResult};
use crate::graph::{Capacity, Graph, NodeId};
use assume::assume;
use std::collections::VecDeque;
use tracing::{debug, trace};

const INFINITE_DIST: u32 = u32::MAX;

/// Side of the cut a node ended on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Segment {
    /// Object.
    Source,
    /// Background.
    Sink,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Tree {
    Source,
    Sink,
}

impl From<Tree> for Segment {
    fn from(tree: Tree) -> Self {
        match tree {
            Tree::Source => Segment::Source,
            Tree::Sink => Segment::Sink,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Parent {
    /// Not in any tree.
    Free,
    /// Directly connected to the root of its tree.
    Terminal,
    /// Parent arc was saturated, waiting for adoption.
    Orphan,
    /// Index of the arc going from the node to its parent.
    Arc(u32),
}

#[derive(Clone, Copy, Debug)]
struct Arc {
    head: u32,
    sister: u32,
    r_cap: Capacity,
}

#[derive(Clone, Copy, Debug)]
struct Node {
    parent: Parent,
    tree: Tree,
    /// Residual terminal capacity: positive towards the source, negative towards the sink.
    tr_cap: Capacity,
    /// Timestamp of the last distance update.
    ts: u64,
    /// Distance to the terminal, valid when `ts` is recent.
    dist: u32,
    active: bool,
}

/// Counters collected while solving.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlowStats {
    /// Number of augmenting paths.
    pub augmentations: usize,
    /// Number of processed orphans.
    pub orphans: usize,
    /// Number of processed active nodes.
    pub growth_steps: usize,
}

/// Solver state built from a [`Graph`]. Owns the residual network.
pub struct MaxFlow {
    arc_start: Vec<u32>,
    arcs: Vec<Arc>,
    nodes: Vec<Node>,
    active: VecDeque<u32>,
    orphans: VecDeque<u32>,
    time: u64,
    flow: Capacity,
    stats: FlowStats,
}

#[inline(always)]
fn check_residual(capacity: Capacity, location: impl FnOnce() -> String) -> GraphCutResult<()> {
    // NaN fails the comparison
    if capacity >= 0.0 {
        Ok(())
    } else {
        Err(GraphCutError::invalid_capacity(capacity, location()))
    }
}

impl MaxFlow {
    /// Takes over the graph and builds the residual network.
    ///
    /// Negative (or NaN) capacities fail with `InvalidCapacity`. The terminal part of the flow
    /// (`min(source, sink)` of every node) is pushed right away.
    pub fn new(graph: Graph) -> GraphCutResult<Self> {
        let node_count = graph.node_count();
        let edges = graph.edges();
        let arc_count = edges
            .len()
            .checked_mul(2)
            .filter(|c| *c < u32::MAX as usize)
            .ok_or_else(|| {
                GraphCutError::ResourceExhausted(format!(
                    "{} edges do not fit into 32-bit arc ids",
                    edges.len()
                ))
            })?;

        let mut arc_start = Vec::new();
        arc_start.try_reserve_exact(node_count + 1)?;
        arc_start.resize(node_count + 1, 0u32);
        for e in edges {
            arc_start[e.u as usize + 1] += 1;
            arc_start[e.v as usize + 1] += 1;
        }
        for i in 0..node_count {
            arc_start[i + 1] += arc_start[i];
        }

        let mut arcs = Vec::new();
        arcs.try_reserve_exact(arc_count)?;
        arcs.resize(
            arc_count,
            Arc {
                head: 0,
                sister: 0,
                r_cap: 0.0,
            },
        );
        let mut fill = arc_start.clone();
        for e in edges {
            let (u, v) = (e.u as usize, e.v as usize);
            check_residual(e.cap_uv, || format!("edge ({u}, {v})"))?;
            check_residual(e.cap_vu, || format!("edge ({v}, {u})"))?;
            let a = fill[u];
            fill[u] += 1;
            let b = fill[v];
            fill[v] += 1;
            arcs[a as usize] = Arc {
                head: e.v,
                sister: b,
                r_cap: e.cap_uv,
            };
            arcs[b as usize] = Arc {
                head: e.u,
                sister: a,
                r_cap: e.cap_vu,
            };
        }

        let mut nodes = Vec::new();
        nodes.try_reserve_exact(node_count)?;
        let mut flow = 0.0;
        for (node, (source, sink)) in graph.tweights().iter().enumerate() {
            check_residual(*source, || format!("t-weight of node {node}"))?;
            check_residual(*sink, || format!("t-weight of node {node}"))?;
            // NOTE: the part both terminals share is saturated immediately, only the difference
            //  is left as residual. Hard-wired nodes have one zero side, so no inf - inf here.
            flow += source.min(*sink);
            nodes.push(Node {
                parent: Parent::Free,
                tree: Tree::Source,
                tr_cap: source - sink,
                ts: 0,
                dist: 0,
                active: false,
            });
        }
        trace!(node_count, arc_count, "residual network built");

        Ok(Self {
            arc_start,
            arcs,
            nodes,
            active: VecDeque::new(),
            orphans: VecDeque::new(),
            time: 0,
            flow,
            stats: FlowStats::default(),
        })
    }

    #[inline(always)]
    fn arc_range(&self, node: u32) -> std::ops::Range<u32> {
        self.arc_start[node as usize]..self.arc_start[node as usize + 1]
    }

    #[inline(always)]
    fn set_active(&mut self, node: u32) {
        let n = &mut self.nodes[node as usize];
        if !n.active {
            n.active = true;
            self.active.push_back(node);
        }
    }

    /// Next active node that is still in a tree.
    fn next_active(&mut self) -> Option<u32> {
        while let Some(node) = self.active.pop_front() {
            let n = &mut self.nodes[node as usize];
            n.active = false;
            if n.parent != Parent::Free {
                return Some(node);
            }
        }
        None
    }

    #[inline(always)]
    fn set_orphan_front(&mut self, node: u32) {
        self.nodes[node as usize].parent = Parent::Orphan;
        self.orphans.push_front(node);
    }

    #[inline(always)]
    fn set_orphan_rear(&mut self, node: u32) {
        self.nodes[node as usize].parent = Parent::Orphan;
        self.orphans.push_back(node);
    }

    /// Runs the algorithm to completion and returns the cut.
    pub fn solve(mut self) -> Cut {
        for node in 0..self.nodes.len() as u32 {
            let n = &mut self.nodes[node as usize];
            if n.tr_cap > 0.0 {
                n.tree = Tree::Source;
            } else if n.tr_cap < 0.0 {
                n.tree = Tree::Sink;
            } else {
                continue;
            }
            n.parent = Parent::Terminal;
            n.ts = 0;
            n.dist = 1;
            self.set_active(node);
        }

        let mut current: Option<u32> = None;
        loop {
            // NOTE: the node which found the last path is processed again before taking a new
            //  one from the queue, it is likely to find another path.
            let mut node = current.take().filter(|i| {
                let n = &mut self.nodes[*i as usize];
                n.active = false;
                n.parent != Parent::Free
            });
            if node.is_none() {
                node = self.next_active();
            }
            let Some(i) = node else {
                break;
            };
            self.stats.growth_steps += 1;

            let middle = self.grow(i);
            self.time += 1;

            if let Some(middle) = middle {
                // keeps `i` out of the queue while it is the current node
                self.nodes[i as usize].active = true;
                current = Some(i);
                self.augment(middle);
                while let Some(orphan) = self.orphans.pop_front() {
                    self.stats.orphans += 1;
                    self.process_orphan(orphan);
                }
            }
        }

        debug!(
            flow = self.flow,
            augmentations = self.stats.augmentations,
            orphans = self.stats.orphans,
            "max-flow finished"
        );
        Cut {
            flow: self.flow,
            segments: self
                .nodes
                .iter()
                .map(|n| match n.parent {
                    Parent::Free => None,
                    _ => Some(n.tree.into()),
                })
                .collect(),
            stats: self.stats,
        }
    }

    /// Scans the residual neighbours of `i`. Returns the arc from the source tree to the sink
    /// tree if the trees touch.
    fn grow(&mut self, i: u32) -> Option<u32> {
        let Node {
            tree, ts, dist, ..
        } = self.nodes[i as usize];
        for a in self.arc_range(i) {
            assume!(unsafe: (a as usize) < self.arcs.len());
            let arc = self.arcs[a as usize];
            let residual = match tree {
                Tree::Source => arc.r_cap,
                Tree::Sink => self.arcs[arc.sister as usize].r_cap,
            };
            if residual <= 0.0 {
                continue;
            }
            let j = arc.head;
            assume!(unsafe: (j as usize) < self.nodes.len());
            let nj = &mut self.nodes[j as usize];
            if nj.parent == Parent::Free {
                nj.tree = tree;
                nj.parent = Parent::Arc(arc.sister);
                nj.ts = ts;
                nj.dist = dist + 1;
                if !nj.active {
                    nj.active = true;
                    self.active.push_back(j);
                }
            } else if nj.tree != tree {
                return Some(match tree {
                    Tree::Source => a,
                    Tree::Sink => arc.sister,
                });
            } else if nj.ts <= ts && nj.dist > dist {
                // shorter path to the root through i
                nj.parent = Parent::Arc(arc.sister);
                nj.ts = ts;
                nj.dist = dist + 1;
            }
        }
        None
    }

    /// Bottleneck of the path `SOURCE -> ... -> tail(middle) -> head(middle) -> ... -> SINK`.
    fn bottleneck(&self, middle: u32) -> Capacity {
        let mut bottleneck = self.arcs[middle as usize].r_cap;
        let mut i = self.arcs[self.arcs[middle as usize].sister as usize].head;
        loop {
            match self.nodes[i as usize].parent {
                Parent::Arc(a) => {
                    let a = self.arcs[a as usize];
                    bottleneck = bottleneck.min(self.arcs[a.sister as usize].r_cap);
                    i = a.head;
                }
                Parent::Terminal => {
                    bottleneck = bottleneck.min(self.nodes[i as usize].tr_cap);
                    break;
                }
                Parent::Free | Parent::Orphan => unreachable!("source path broken at node {i}"),
            }
        }
        let mut i = self.arcs[middle as usize].head;
        loop {
            match self.nodes[i as usize].parent {
                Parent::Arc(a) => {
                    let a = self.arcs[a as usize];
                    bottleneck = bottleneck.min(a.r_cap);
                    i = a.head;
                }
                Parent::Terminal => {
                    bottleneck = bottleneck.min(-self.nodes[i as usize].tr_cap);
                    break;
                }
                Parent::Free | Parent::Orphan => unreachable!("sink path broken at node {i}"),
            }
        }
        bottleneck
    }

    /// Pushes the bottleneck along the path, nodes cut off from their parents become orphans.
    fn augment(&mut self, middle: u32) {
        let bottleneck = self.bottleneck(middle);
        debug_assert!(
            bottleneck > 0.0 && bottleneck.is_finite(),
            "bottleneck {bottleneck} must be positive and finite"
        );
        let sister = self.arcs[middle as usize].sister;
        self.arcs[sister as usize].r_cap += bottleneck;
        self.arcs[middle as usize].r_cap -= bottleneck;

        // NOTE: r_cap - bottleneck is exactly zero for the arcs defining the bottleneck, so the
        //  comparisons with zero below are exact.
        let mut i = self.arcs[sister as usize].head;
        loop {
            match self.nodes[i as usize].parent {
                Parent::Arc(a) => {
                    let Arc { head, sister, .. } = self.arcs[a as usize];
                    self.arcs[a as usize].r_cap += bottleneck;
                    self.arcs[sister as usize].r_cap -= bottleneck;
                    if self.arcs[sister as usize].r_cap == 0.0 {
                        self.set_orphan_front(i);
                    }
                    i = head;
                }
                Parent::Terminal => {
                    let n = &mut self.nodes[i as usize];
                    n.tr_cap -= bottleneck;
                    if n.tr_cap == 0.0 {
                        self.set_orphan_front(i);
                    }
                    break;
                }
                Parent::Free | Parent::Orphan => unreachable!("source path broken at node {i}"),
            }
        }

        let mut i = self.arcs[middle as usize].head;
        loop {
            match self.nodes[i as usize].parent {
                Parent::Arc(a) => {
                    let Arc { head, sister, .. } = self.arcs[a as usize];
                    self.arcs[sister as usize].r_cap += bottleneck;
                    self.arcs[a as usize].r_cap -= bottleneck;
                    if self.arcs[a as usize].r_cap == 0.0 {
                        self.set_orphan_front(i);
                    }
                    i = head;
                }
                Parent::Terminal => {
                    let n = &mut self.nodes[i as usize];
                    n.tr_cap += bottleneck;
                    if n.tr_cap == 0.0 {
                        self.set_orphan_front(i);
                    }
                    break;
                }
                Parent::Free | Parent::Orphan => unreachable!("sink path broken at node {i}"),
            }
        }

        self.flow += bottleneck;
        self.stats.augmentations += 1;
    }

    /// Distance of `j` to its root, `INFINITE_DIST` if the path runs through an orphan.
    /// Terminal children met on the way get their distance refreshed.
    fn origin_distance(&mut self, mut j: u32) -> u32 {
        let time = self.time;
        let mut d = 0u32;
        loop {
            let n = &mut self.nodes[j as usize];
            if n.ts == time {
                return d.saturating_add(n.dist);
            }
            d += 1;
            match n.parent {
                Parent::Terminal => {
                    n.ts = time;
                    n.dist = 1;
                    return d;
                }
                Parent::Arc(a) => j = self.arcs[a as usize].head,
                Parent::Orphan | Parent::Free => return INFINITE_DIST,
            }
        }
    }

    /// Tries to find a new parent for the orphan `i`, frees it otherwise.
    fn process_orphan(&mut self, i: u32) {
        let time = self.time;
        let tree = self.nodes[i as usize].tree;
        let mut best: Option<(u32, u32)> = None;

        for a0 in self.arc_range(i) {
            let arc = self.arcs[a0 as usize];
            // flow has to be able to reach i from the candidate parent
            let residual = match tree {
                Tree::Source => self.arcs[arc.sister as usize].r_cap,
                Tree::Sink => arc.r_cap,
            };
            if residual <= 0.0 {
                continue;
            }
            let j = arc.head;
            let nj = self.nodes[j as usize];
            if nj.tree != tree || nj.parent == Parent::Free {
                continue;
            }
            let d = self.origin_distance(j);
            if d == INFINITE_DIST {
                continue;
            }
            if best.map_or(true, |(_, d_min)| d < d_min) {
                best = Some((a0, d));
            }
            // mark the checked path, the next orphans stop their walk there
            let mut k = j;
            let mut d = d;
            while self.nodes[k as usize].ts != time {
                let n = &mut self.nodes[k as usize];
                n.ts = time;
                n.dist = d;
                d = d.saturating_sub(1);
                match n.parent {
                    Parent::Arc(a) => k = self.arcs[a as usize].head,
                    _ => break,
                }
            }
        }

        if let Some((a, d_min)) = best {
            let n = &mut self.nodes[i as usize];
            n.parent = Parent::Arc(a);
            n.ts = time;
            n.dist = d_min + 1;
            return;
        }

        self.nodes[i as usize].parent = Parent::Free;
        for a0 in self.arc_range(i) {
            let arc = self.arcs[a0 as usize];
            let j = arc.head;
            let nj = self.nodes[j as usize];
            if nj.tree != tree || nj.parent == Parent::Free {
                continue;
            }
            let residual = match tree {
                Tree::Source => self.arcs[arc.sister as usize].r_cap,
                Tree::Sink => arc.r_cap,
            };
            if residual > 0.0 {
                self.set_active(j);
            }
            if let Parent::Arc(pa) = nj.parent {
                if self.arcs[pa as usize].head == i {
                    self.set_orphan_rear(j);
                }
            }
        }
    }
}

/// Result of a max-flow run.
#[derive(Clone, Debug, PartialEq)]
pub struct Cut {
    flow: Capacity,
    /// `None` for nodes that ended in neither tree.
    segments: Vec<Option<Segment>>,
    stats: FlowStats,
}

impl Cut {
    /// Value of the maximum flow, equal to the capacity of the minimum cut.
    pub fn flow(&self) -> Capacity {
        self.flow
    }

    pub fn stats(&self) -> FlowStats {
        self.stats
    }

    pub fn node_count(&self) -> usize {
        self.segments.len()
    }

    /// Segment of `node`. Nodes reachable from the source in the residual network are
    /// [`Segment::Source`], everything else is [`Segment::Sink`].
    ///
    /// # Panics
    ///
    /// If `node` is not smaller than [`Cut::node_count`]. The same holds for
    /// [`Cut::segment_or`] and [`Cut::is_free`].
    pub fn segment(&self, node: NodeId) -> Segment {
        self.segment_or(node, Segment::Sink)
    }

    /// Like [`Cut::segment`], but nodes that ended in neither search tree get `default`.
    ///
    /// Free nodes can lie on either side of a minimum cut. `Segment::Sink` gives the minimal
    /// object, `Segment::Source` the maximal one.
    pub fn segment_or(&self, node: NodeId, default: Segment) -> Segment {
        self.segments[node].unwrap_or(default)
    }

    pub fn is_free(&self, node: NodeId) -> bool {
        self.segments[node].is_none()
    }

    /// `true` for object (source side) nodes.
    pub fn mask(&self) -> Vec<bool> {
        self.mask_or(Segment::Sink)
    }

    pub fn mask_or(&self, default: Segment) -> Vec<bool> {
        self.segments
            .iter()
            .map(|s| s.unwrap_or(default) == Segment::Source)
            .collect()
    }
}

/// Builds the residual network of `graph` and solves it.
pub fn maxflow(graph: Graph) -> GraphCutResult<Cut> {
    Ok(MaxFlow::new(graph)?.solve())
}
