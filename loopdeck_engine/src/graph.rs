use std::collections::HashMap;

use petgraph::Direction::{Incoming, Outgoing};
use petgraph::algo::has_path_connecting;
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::visit::{EdgeRef, Topo};

use crate::nodes::{AudioNode, DestinationNode, RenderInfo, StereoBlock};

/// Directed signal graph. Indices stay valid across removals so callers can hold them.
pub struct AudioGraph {
    graph: StableDiGraph<Box<dyn AudioNode>, ()>,
    outputs: HashMap<NodeIndex, StereoBlock>,
    scratch: StereoBlock,
    destination: NodeIndex,
}

impl AudioGraph {
    pub fn new() -> Self {
        let mut graph: StableDiGraph<Box<dyn AudioNode>, ()> = StableDiGraph::new();
        let destination = graph.add_node(Box::new(DestinationNode));
        Self {
            graph,
            outputs: HashMap::new(),
            scratch: StereoBlock::default(),
            destination,
        }
    }

    pub fn destination(&self) -> NodeIndex {
        self.destination
    }

    pub fn add_node(&mut self, node: Box<dyn AudioNode>) -> NodeIndex {
        self.graph.add_node(node)
    }

    /// Connects `from -> to`. Duplicate edges and edges that would close a cycle are ignored.
    pub fn connect(&mut self, from: NodeIndex, to: NodeIndex) -> bool {
        if !self.contains(from) || !self.contains(to) || from == to {
            return false;
        }
        if self.graph.find_edge(from, to).is_some() {
            return true;
        }
        if has_path_connecting(&self.graph, to, from, None) {
            log::warn!("[AudioGraph] Refusing edge {:?} -> {:?}: would create a cycle", from, to);
            return false;
        }
        self.graph.add_edge(from, to, ());
        true
    }

    /// Removes every outgoing edge of `node`.
    pub fn disconnect(&mut self, node: NodeIndex) {
        let edges: Vec<_> = self.graph.edges_directed(node, Outgoing).map(|e| e.id()).collect();
        for e in edges {
            self.graph.remove_edge(e);
        }
    }

    /// Disconnects and drops a node. The destination cannot be removed.
    pub fn remove_node(&mut self, node: NodeIndex) -> Option<Box<dyn AudioNode>> {
        if node == self.destination {
            return None;
        }
        self.outputs.remove(&node);
        self.graph.remove_node(node)
    }

    pub fn contains(&self, node: NodeIndex) -> bool {
        self.graph.contains_node(node)
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn successors(&self, node: NodeIndex) -> Vec<NodeIndex> {
        self.graph.neighbors_directed(node, Outgoing).collect()
    }

    pub fn predecessors(&self, node: NodeIndex) -> Vec<NodeIndex> {
        self.graph.neighbors_directed(node, Incoming).collect()
    }

    pub fn node(&self, idx: NodeIndex) -> Option<&dyn AudioNode> {
        self.graph.node_weight(idx).map(|n| &**n)
    }

    pub fn node_mut(&mut self, idx: NodeIndex) -> Option<&mut Box<dyn AudioNode>> {
        self.graph.node_weight_mut(idx)
    }

    /// Process the whole graph for one block and return the destination's output.
    pub fn process(&mut self, frames: usize, info: &RenderInfo) -> &StereoBlock {
        let mut topo = Topo::new(&self.graph);

        while let Some(idx) = topo.next(&self.graph) {
            self.scratch.prepare(frames);
            for pred in self.graph.neighbors_directed(idx, Incoming) {
                if let Some(upstream) = self.outputs.get(&pred) {
                    self.scratch.accumulate(upstream);
                }
            }

            let out = self.outputs.entry(idx).or_default();
            out.prepare(frames);
            if let Some(node) = self.graph.node_weight_mut(idx) {
                node.process(&self.scratch, out, info);
            }
        }

        self.outputs.entry(self.destination).or_default()
    }
}

impl Default for AudioGraph {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::AudioBuffer;
    use crate::nodes::{BufferSourceNode, GainNode};
    use std::sync::Arc;

    #[test]
    fn chain_sums_into_destination() {
        let mut g = AudioGraph::new();
        let gain = g.add_node(Box::new(GainNode::new(0.5)));
        g.connect(gain, g.destination());

        for v in [0.2, 0.4] {
            let buf = Arc::new(AudioBuffer::new(vec![vec![v; 4]], 10));
            let mut src = BufferSourceNode::new(buf, false);
            src.start(0);
            let idx = g.add_node(Box::new(src));
            assert!(g.connect(idx, gain));
        }

        let info = RenderInfo {
            start_frame: 0,
            sample_rate: 10.0,
        };
        let out = g.process(4, &info);
        for s in &out.left {
            assert!((s - 0.3).abs() < 1e-6);
        }
    }

    #[test]
    fn cycles_and_duplicates_are_rejected() {
        let mut g = AudioGraph::new();
        let a = g.add_node(Box::new(GainNode::new(1.0)));
        let b = g.add_node(Box::new(GainNode::new(1.0)));
        assert!(g.connect(a, b));
        assert!(g.connect(a, b));
        assert_eq!(g.successors(a), vec![b]);
        assert!(!g.connect(b, a));
    }

    #[test]
    fn removing_node_drops_its_edges() {
        let mut g = AudioGraph::new();
        let a = g.add_node(Box::new(GainNode::new(1.0)));
        g.connect(a, g.destination());
        assert_eq!(g.predecessors(g.destination()), vec![a]);
        assert!(g.remove_node(a).is_some());
        assert!(g.predecessors(g.destination()).is_empty());
        assert!(g.remove_node(g.destination()).is_none());
    }
}
