//! Topological ordering of cells from variable declare/use edges.

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::VecDeque;

use super::types::{CellId, VariableEdge};

/// Directed graph of cells: edges go from declaring cell to using cell.
pub struct DependencyGraph {
    /// Node weight is the cell's position in the input list.
    graph: DiGraph<usize, ()>,
    /// Input cells, deduplicated, in their original order.
    cells: Vec<CellId>,
}

impl DependencyGraph {
    /// Build the graph for `cell_ids` from the variable edges.
    ///
    /// Edges naming cells outside `cell_ids` are ignored, as are self-loops
    /// (a cell that both declares and uses a variable).
    pub fn new(cell_ids: &[CellId], edges: &[VariableEdge]) -> Self {
        let mut graph = DiGraph::with_capacity(cell_ids.len(), edges.len());
        let mut cells = Vec::with_capacity(cell_ids.len());
        let mut node_indices: FxHashMap<&CellId, NodeIndex> = FxHashMap::default();

        for id in cell_ids {
            if node_indices.contains_key(id) {
                continue;
            }
            node_indices.insert(id, graph.add_node(cells.len()));
            cells.push(id.clone());
        }

        let mut seen = FxHashSet::default();
        for edge in edges {
            for producer in &edge.declared_by {
                let Some(&from) = node_indices.get(producer) else {
                    continue;
                };
                for consumer in &edge.used_by {
                    let Some(&to) = node_indices.get(consumer) else {
                        continue;
                    };
                    if from != to && seen.insert((from, to)) {
                        graph.add_edge(from, to, ());
                    }
                }
            }
        }

        Self { graph, cells }
    }

    /// Number of cells in the graph.
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Check if the graph has no cells.
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Whether the cell has at least one incoming or outgoing edge.
    fn is_connected(&self, node: NodeIndex) -> bool {
        self.graph.neighbors_undirected(node).next().is_some()
    }

    /// Outgoing neighbors in the order their edges were added.
    fn successors(&self, node: NodeIndex) -> Vec<NodeIndex> {
        // petgraph lists neighbors most-recent-first.
        let mut successors: Vec<_> = self.graph.neighbors(node).collect();
        successors.reverse();
        successors
    }

    /// Kahn's algorithm over the connected cells.
    ///
    /// Returns the nodes that reached in-degree zero, FIFO order. Cells on a
    /// cycle (and everything downstream of one) never do and are left out.
    fn kahn(&self) -> Vec<NodeIndex> {
        let mut in_degree: Vec<usize> = self
            .graph
            .node_indices()
            .map(|node| {
                self.graph
                    .neighbors_directed(node, Direction::Incoming)
                    .count()
            })
            .collect();

        let mut queue: VecDeque<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|&node| self.is_connected(node) && in_degree[node.index()] == 0)
            .collect();

        let mut sorted = Vec::with_capacity(self.cells.len());
        while let Some(node) = queue.pop_front() {
            sorted.push(node);
            for next in self.successors(node) {
                let degree = &mut in_degree[next.index()];
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(next);
                }
            }
        }

        sorted
    }

    /// Total order of all cells.
    ///
    /// Connected cells come first in dependency order; every remaining cell
    /// (isolated, or stuck on a cycle) follows in its original relative order.
    pub fn topological_order(&self) -> Vec<CellId> {
        let sorted = self.kahn();
        let mut placed = vec![false; self.cells.len()];
        let mut order = Vec::with_capacity(self.cells.len());

        for node in sorted {
            let position = self.graph[node];
            placed[position] = true;
            order.push(self.cells[position].clone());
        }

        let mut demoted = Vec::new();
        for (position, cell) in self.cells.iter().enumerate() {
            if placed[position] {
                continue;
            }
            if self.is_connected(NodeIndex::new(position)) {
                demoted.push(cell.as_str());
            }
            order.push(cell.clone());
        }

        if !demoted.is_empty() {
            // Cyclic dependencies fall back to document order without a diagnostic.
            tracing::debug!("Cells left in document order due to cycles: {}", demoted.join(", "));
        }

        order
    }
}

/// Sort cells so that declaring cells precede the cells using their variables.
///
/// Pure and deterministic: ties are broken by the order cells are discovered,
/// never alphabetically.
pub fn sort_cells(cell_ids: &[CellId], edges: &[VariableEdge]) -> Vec<CellId> {
    DependencyGraph::new(cell_ids, edges).topological_order()
}
