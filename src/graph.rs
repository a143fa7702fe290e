use crate::error::{GraphCutError, GraphCutResult};
use std::collections::HashSet;
use tracing::trace;

/// Node index in `[0, node_count)`. The two terminals are implicit and have no id.
pub type NodeId = usize;
/// Edge and terminal capacity.
pub type Capacity = f64;

/// Capacity of the terminal edge of a hard-wired node. Larger than any sum of finite weights,
/// so a hard-wired node can never end up on the other side of the cut.
pub const MAX_CAPACITY: Capacity = Capacity::INFINITY;

/// Undirected node pair carrying both directed capacities.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NWeight {
    pub(crate) u: u32,
    pub(crate) v: u32,
    pub(crate) cap_uv: Capacity,
    pub(crate) cap_vu: Capacity,
}

impl NWeight {
    pub fn nodes(&self) -> (NodeId, NodeId) {
        (self.u as NodeId, self.v as NodeId)
    }
    pub fn capacities(&self) -> (Capacity, Capacity) {
        (self.cap_uv, self.cap_vu)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Hardwire {
    None,
    Source,
    Sink,
}

/// Flow graph: `node_count` nodes plus implicit SOURCE and SINK.
///
/// Terminal connectivity is expressed only through t-weights `(cap(SOURCE->node),
/// cap(node->SINK))`, inter-node connectivity through n-weights. Built once by a builder,
/// then handed over to [`crate::maxflow::MaxFlow`].
#[derive(Clone, Debug)]
pub struct Graph {
    node_count: usize,
    tweights: Vec<(Capacity, Capacity)>,
    hardwired: Vec<Hardwire>,
    edges: Vec<NWeight>,
}

#[inline(always)]
fn check_edge_capacity(capacity: Capacity, u: NodeId, v: NodeId) -> GraphCutResult<()> {
    // NaN fails the comparison as well
    if capacity.is_finite() && capacity > 0.0 {
        Ok(())
    } else {
        Err(GraphCutError::invalid_capacity(
            capacity,
            format!("edge ({u}, {v})"),
        ))
    }
}

#[inline(always)]
fn check_terminal_capacity(capacity: Capacity, node: NodeId) -> GraphCutResult<()> {
    if capacity.is_finite() && capacity >= 0.0 {
        Ok(())
    } else {
        Err(GraphCutError::invalid_capacity(
            capacity,
            format!("t-weight of node {node}"),
        ))
    }
}

impl Graph {
    /// Allocates a graph of `node_count` nodes with room for `edge_count_hint` n-weights.
    ///
    /// Fails with `ResourceExhausted` when the allocation fails or the node count does not fit
    /// the 32-bit node index used by the solver.
    pub fn new(node_count: usize, edge_count_hint: usize) -> GraphCutResult<Self> {
        if node_count >= u32::MAX as usize {
            return Err(GraphCutError::ResourceExhausted(format!(
                "{node_count} nodes do not fit into 32-bit node ids"
            )));
        }
        let mut tweights = Vec::new();
        tweights.try_reserve_exact(node_count)?;
        tweights.resize(node_count, (0.0, 0.0));
        let mut hardwired = Vec::new();
        hardwired.try_reserve_exact(node_count)?;
        hardwired.resize(node_count, Hardwire::None);
        let mut edges = Vec::new();
        edges.try_reserve_exact(edge_count_hint)?;
        trace!(node_count, edge_count_hint, "graph allocated");
        Ok(Self {
            node_count,
            tweights,
            hardwired,
            edges,
        })
    }

    pub fn node_count(&self) -> usize {
        self.node_count
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    #[inline(always)]
    fn check_node(&self, node: NodeId) -> GraphCutResult<()> {
        if node < self.node_count {
            Ok(())
        } else {
            Err(GraphCutError::NodeOutOfRange {
                node,
                node_count: self.node_count,
            })
        }
    }

    /// Hard-wires the nodes to the SOURCE: t-weight `(MAX, 0)`.
    ///
    /// Nodes that are already hard-wired to the SINK stay there. All ids are validated before
    /// anything is changed.
    pub fn set_source_nodes<I>(&mut self, nodes: I) -> GraphCutResult<()>
    where
        I: IntoIterator<Item = NodeId>,
    {
        let nodes: Vec<NodeId> = nodes.into_iter().collect();
        nodes.iter().try_for_each(|n| self.check_node(*n))?;
        for node in nodes {
            if self.hardwired[node] != Hardwire::Sink {
                self.hardwired[node] = Hardwire::Source;
                self.tweights[node] = (MAX_CAPACITY, 0.0);
            }
        }
        Ok(())
    }

    /// Hard-wires the nodes to the SINK: t-weight `(0, MAX)`. Overrides source hard-wiring.
    pub fn set_sink_nodes<I>(&mut self, nodes: I) -> GraphCutResult<()>
    where
        I: IntoIterator<Item = NodeId>,
    {
        let nodes: Vec<NodeId> = nodes.into_iter().collect();
        nodes.iter().try_for_each(|n| self.check_node(*n))?;
        for node in nodes {
            self.hardwired[node] = Hardwire::Sink;
            self.tweights[node] = (0.0, MAX_CAPACITY);
        }
        Ok(())
    }

    /// Adds the n-weight `(u, v)` with capacities `cap(u->v)` and `cap(v->u)`.
    ///
    /// Both capacities have to be finite and strictly positive. Zero is never coerced into
    /// something positive, pairs without interaction simply get no edge.
    pub fn add_edge(
        &mut self,
        u: NodeId,
        v: NodeId,
        cap_uv: Capacity,
        cap_vu: Capacity,
    ) -> GraphCutResult<()> {
        self.check_node(u)?;
        self.check_node(v)?;
        if u == v {
            return Err(GraphCutError::SelfEdge(u));
        }
        check_edge_capacity(cap_uv, u, v)?;
        check_edge_capacity(cap_vu, v, u)?;
        if self.edges.len() == self.edges.capacity() {
            self.edges.try_reserve(self.edges.len().max(16))?;
        }
        self.edges.push(NWeight {
            u: u as u32,
            v: v as u32,
            cap_uv,
            cap_vu,
        });
        Ok(())
    }

    /// Replaces the t-weight of `node`. Hard-wired nodes keep their sentinel weights.
    pub fn set_tweight(
        &mut self,
        node: NodeId,
        source: Capacity,
        sink: Capacity,
    ) -> GraphCutResult<()> {
        self.check_node(node)?;
        check_terminal_capacity(source, node)?;
        check_terminal_capacity(sink, node)?;
        if self.hardwired[node] == Hardwire::None {
            self.tweights[node] = (source, sink);
        }
        Ok(())
    }

    /// Adds to the t-weight of `node`. Hard-wired nodes keep their sentinel weights.
    pub fn add_tweight(
        &mut self,
        node: NodeId,
        source: Capacity,
        sink: Capacity,
    ) -> GraphCutResult<()> {
        self.check_node(node)?;
        check_terminal_capacity(source, node)?;
        check_terminal_capacity(sink, node)?;
        if self.hardwired[node] == Hardwire::None {
            let (s, t) = self.tweights[node];
            self.tweights[node] = (s + source, t + sink);
        }
        Ok(())
    }

    /// Sets the t-weights of all nodes at once, one pair per node in node order.
    pub fn set_tweights_all<I>(&mut self, tweights: I) -> GraphCutResult<()>
    where
        I: IntoIterator<Item = (Capacity, Capacity)>,
    {
        let mut count = 0usize;
        for (node, (source, sink)) in tweights.into_iter().enumerate() {
            self.set_tweight(node, source, sink)?;
            count += 1;
        }
        if count != self.node_count {
            return Err(GraphCutError::shape_mismatch(&[self.node_count], &[count]));
        }
        Ok(())
    }

    /// `(cap(SOURCE->node), cap(node->SINK))`, `(0, 0)` unless set.
    ///
    /// # Panics
    ///
    /// If `node` is not smaller than [`Graph::node_count`].
    pub fn tweight(&self, node: NodeId) -> (Capacity, Capacity) {
        debug_assert!(node < self.node_count);
        self.tweights[node]
    }

    /// `(cap(u->v), cap(v->u))` summed over all n-weights between `u` and `v`, `None` if there
    /// is none. Scans the whole edge list.
    pub fn nweight(&self, u: NodeId, v: NodeId) -> Option<(Capacity, Capacity)> {
        self.edges
            .iter()
            .filter_map(|e| {
                let (a, b) = e.nodes();
                if (a, b) == (u, v) {
                    Some((e.cap_uv, e.cap_vu))
                } else if (a, b) == (v, u) {
                    Some((e.cap_vu, e.cap_uv))
                } else {
                    None
                }
            })
            .reduce(|acc, c| (acc.0 + c.0, acc.1 + c.1))
    }

    pub fn nweights(&self) -> impl Iterator<Item = &NWeight> + '_ {
        self.edges.iter()
    }

    pub fn source_nodes(&self) -> Vec<NodeId> {
        self.hardwired_nodes(Hardwire::Source)
    }

    pub fn sink_nodes(&self) -> Vec<NodeId> {
        self.hardwired_nodes(Hardwire::Sink)
    }

    fn hardwired_nodes(&self, which: Hardwire) -> Vec<NodeId> {
        self.hardwired
            .iter()
            .enumerate()
            .filter(|(_, h)| **h == which)
            .map(|(node, _)| node)
            .collect()
    }

    pub(crate) fn edges(&self) -> &[NWeight] {
        &self.edges
    }

    pub(crate) fn tweights(&self) -> &[(Capacity, Capacity)] {
        &self.tweights
    }

    /// Consistency check: every referenced id is a node, no undirected pair appears twice, no
    /// capacity is negative. Returns the list of problems, `None` for a consistent graph.
    ///
    /// Expensive on large graphs, meant for tests and debugging.
    pub fn inconsistent(&self) -> Option<Vec<String>> {
        let mut messages = Vec::new();
        let mut pairs = HashSet::with_capacity(self.edges.len());
        for e in &self.edges {
            let (u, v) = e.nodes();
            if u >= self.node_count {
                messages.push(format!("Node {u} in edge ({u}, {v}) but not in nodes."));
            }
            if v >= self.node_count {
                messages.push(format!("Node {v} in edge ({u}, {v}) but not in nodes."));
            }
            if u == v {
                messages.push(format!("Edge ({u}, {v}) is a self edge."));
            }
            if !pairs.insert((u.min(v), u.max(v))) {
                messages.push(format!("The undirected edge ({u}, {v}) appears more than once."));
            }
            if !(e.cap_uv >= 0.0 && e.cap_vu >= 0.0) {
                messages.push(format!("Edge ({u}, {v}) has a negative capacity."));
            }
        }
        for (node, (s, t)) in self.tweights.iter().enumerate() {
            if !(*s >= 0.0 && *t >= 0.0) {
                messages.push(format!("Node {node} has a negative t-weight."));
            }
        }
        if messages.is_empty() {
            None
        } else {
            Some(messages)
        }
    }
}
