//! A small, typed wrapper around `petgraph` used to represent the resolved
//! package dependency graph: nodes are packages, edges carry the dependency
//! kind (runtime / build / dev) that connected them.

use std::fmt;

use petgraph::{
    Direction,
    prelude::DiGraph,
    visit::{Dfs, EdgeRef, Topo, Walker},
};

pub type NodeIndex = petgraph::prelude::NodeIndex<u32>;

/// A directed acyclic graph over nodes `N` connected by typed edges `E`.
///
/// Mirrors the petgraph-backed `Dag` used for package transactions, but
/// edges carry a payload (here, the dependency kind) instead of being unit
/// edges, and cycle-forming inserts are rejected with an error that carries
/// the discovery chain rather than silently returning `false`.
#[derive(Debug, Clone)]
pub struct Dag<N, E = ()>(DiGraph<N, E, u32>);

impl<N, E> Default for Dag<N, E> {
    fn default() -> Self {
        Self(DiGraph::default())
    }
}

impl<N, E> AsRef<DiGraph<N, E, u32>> for Dag<N, E> {
    fn as_ref(&self) -> &DiGraph<N, E, u32> {
        &self.0
    }
}

#[derive(Debug, thiserror::Error)]
#[error("cyclic dependency: {}", chain.iter().map(ToString::to_string).collect::<Vec<_>>().join(" -> "))]
pub struct CyclicDependency<N: fmt::Display> {
    pub chain: Vec<N>,
}

impl<N, E> Dag<N, E>
where
    N: Clone + PartialEq,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds node `N` to the graph and returns its index.
    ///
    /// If `N` already exists, returns the index of the existing node.
    pub fn add_node_or_get_index(&mut self, node: &N) -> NodeIndex {
        if let Some(index) = self.get_index(node) {
            index
        } else {
            self.0.add_node(node.clone())
        }
    }

    pub fn node_exists(&self, node: &N) -> bool {
        self.get_index(node).is_some()
    }

    pub fn remove_node(&mut self, node: &N) -> Option<N> {
        let index = self.get_index(node)?;
        self.0.remove_node(index)
    }

    /// Add an edge `a -> b` carrying `weight`, rejecting it if it would
    /// close a cycle.
    pub fn try_add_edge(&mut self, a: NodeIndex, b: NodeIndex, weight: E) -> Result<(), CyclicDependency<N>>
    where
        N: fmt::Display,
    {
        if a == b || self.dfs(b).any(|n| *n == self.0[a]) {
            let mut chain: Vec<N> = self.dfs(b).cloned().collect();
            chain.insert(0, self.0[a].clone());
            return Err(CyclicDependency { chain });
        }

        self.0.add_edge(a, b, weight);
        Ok(())
    }

    pub fn iter_nodes(&self) -> impl Iterator<Item = &'_ N> {
        self.0.node_weights()
    }

    /// Edges leaving `node`, as `(weight, target)` pairs.
    pub fn edges_from(&self, index: NodeIndex) -> impl Iterator<Item = (&'_ E, &'_ N)> {
        self.0
            .edges_directed(index, Direction::Outgoing)
            .map(move |e| (e.weight(), &self.0[e.target()]))
    }

    pub fn dfs(&self, start: NodeIndex) -> impl Iterator<Item = &'_ N> {
        Dfs::new(&self.0, start).iter(&self.0).map(|i| &self.0[i])
    }

    pub fn topo(&self) -> impl Iterator<Item = &'_ N> {
        Topo::new(&self.0).iter(&self.0).map(|i| &self.0[i])
    }

    /// A copy of the graph with every edge's direction reversed.
    pub fn transpose(&self) -> Self
    where
        E: Clone,
    {
        let mut transposed = self.0.clone();
        transposed.reverse();
        Self(transposed)
    }

    /// Returns batches of nodes that can be executed in parallel: each batch
    /// only depends on nodes in strictly earlier batches.
    pub fn batched_topo(&self) -> Vec<Vec<N>>
    where
        N: Ord,
        E: Clone,
    {
        let mut g = self.0.clone();
        let mut batches = Vec::new();

        while g.node_count() > 0 {
            let mut sources: Vec<_> = g.externals(Direction::Incoming).collect();
            if sources.is_empty() {
                // Cycle detected; should be unreachable given try_add_edge's checks.
                break;
            }

            let mut batch_nodes: Vec<_> = sources.iter().map(|&i| g[i].clone()).collect();
            batch_nodes.sort();
            batches.push(batch_nodes);

            sources.sort_by_key(|&idx| std::cmp::Reverse(idx.index()));
            for ix in sources {
                g.remove_node(ix);
            }
        }

        batches
    }

    pub fn get_index(&self, node: &N) -> Option<NodeIndex> {
        self.0.node_indices().find(|i| self.0[*i] == *node)
    }

    pub fn node_count(&self) -> usize {
        self.0.node_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
    enum Kind {
        Dependency,
    }

    #[test]
    fn batches_respect_dependency_order() {
        let mut graph: Dag<i32, Kind> = Dag::new();

        let a = graph.add_node_or_get_index(&1);
        let b = graph.add_node_or_get_index(&2);
        let c = graph.add_node_or_get_index(&3);

        graph.try_add_edge(a, b, Kind::Dependency).unwrap();
        graph.try_add_edge(b, c, Kind::Dependency).unwrap();

        let batches = graph.batched_topo();
        assert_eq!(batches, vec![vec![1], vec![2], vec![3]]);
    }

    #[test]
    fn fully_independent_nodes_batch_together() {
        let mut graph: Dag<char, Kind> = Dag::new();
        graph.add_node_or_get_index(&'A');
        graph.add_node_or_get_index(&'B');
        graph.add_node_or_get_index(&'C');

        let batches = graph.batched_topo();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 3);
    }

    #[test]
    fn transpose_reverses_batch_order() {
        let mut graph: Dag<i32, Kind> = Dag::new();
        let a = graph.add_node_or_get_index(&1);
        let b = graph.add_node_or_get_index(&2);
        graph.try_add_edge(a, b, Kind::Dependency).unwrap();

        assert_eq!(graph.batched_topo(), vec![vec![1], vec![2]]);
        assert_eq!(graph.transpose().batched_topo(), vec![vec![2], vec![1]]);
    }

    #[test]
    fn rejects_cycle() {
        let mut graph: Dag<i32, Kind> = Dag::new();
        let a = graph.add_node_or_get_index(&1);
        let b = graph.add_node_or_get_index(&2);

        graph.try_add_edge(a, b, Kind::Dependency).unwrap();
        let err = graph.try_add_edge(b, a, Kind::Dependency);
        assert!(err.is_err());
    }
}
