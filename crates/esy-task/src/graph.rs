use std::collections::BTreeMap;

use esy_dag::{CyclicDependency, Dag};

use crate::package::{EdgeKind, Package, PackageId};

/// An in-memory DAG of resolved packages, keyed by [`PackageId`], connected
/// by typed edges (§4.3).
#[derive(Debug, Default)]
pub struct PackageGraph {
    packages: BTreeMap<PackageId, Package>,
    dag: Dag<PackageId, EdgeKind>,
}

#[derive(Debug, thiserror::Error)]
#[error("cyclic dependency: {}", .0.chain.iter().map(ToString::to_string).collect::<Vec<_>>().join(" -> "))]
pub struct CycleError(pub CyclicDependency<PackageId>);

impl PackageGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_package(&mut self, package: Package) {
        self.dag.add_node_or_get_index(&package.id);
        self.packages.insert(package.id.clone(), package);
    }

    pub fn add_edge(&mut self, from: &PackageId, kind: EdgeKind, to: &PackageId) -> Result<(), CycleError> {
        let a = self.dag.add_node_or_get_index(from);
        let b = self.dag.add_node_or_get_index(to);
        self.dag.try_add_edge(a, b, kind).map_err(CycleError)
    }

    pub fn get(&self, id: &PackageId) -> Option<&Package> {
        self.packages.get(id)
    }

    pub fn iter_ids(&self) -> impl Iterator<Item = &PackageId> {
        self.packages.keys()
    }

    /// Every edge in the graph as `(from, kind, to)`, in deterministic
    /// `(from, to)` order.
    pub fn iter_edges(&self) -> Vec<(PackageId, EdgeKind, PackageId)> {
        let mut edges = Vec::new();
        for id in self.packages.keys() {
            for (kind, dep) in self.iter_dependencies(id, &[]) {
                edges.push((id.clone(), kind, dep.id.clone()));
            }
        }
        edges
    }

    /// Dependencies of `id` matching any of `kinds`, in deterministic order:
    /// by `(name, version)` ascending.
    pub fn iter_dependencies(&self, id: &PackageId, kinds: &[EdgeKind]) -> Vec<(EdgeKind, &Package)> {
        let Some(index) = self.dag.get_index(id) else {
            return Vec::new();
        };

        let mut deps: Vec<(EdgeKind, &Package)> = self
            .dag
            .edges_from(index)
            .filter(|(kind, _)| kinds.is_empty() || kinds.contains(kind))
            .filter_map(|(kind, target_id)| self.packages.get(target_id).map(|pkg| (*kind, pkg)))
            .collect();

        deps.sort_by(|(_, a), (_, b)| (&a.id.name, &a.id.version).cmp(&(&b.id.name, &b.id.version)));
        deps
    }

    /// Packages grouped into batches safe to build concurrently: every
    /// package in a batch depends only on packages in strictly earlier
    /// batches. Each batch is sorted by `(name, version)` for determinism.
    ///
    /// Edges point dependent -> dependency, so a plain `batched_topo()` would
    /// put the roots (nothing depends on them) first. Transposing flips that:
    /// nodes with no outgoing edges in the original graph — the leaves with
    /// no dependencies of their own — become the sources of the transposed
    /// graph and land in the first batch.
    pub fn batched_build_order(&self) -> Vec<Vec<PackageId>> {
        self.dag.transpose().batched_topo()
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use esy_manifest::BuildManifest;

    use super::*;
    use crate::package::SourceType;

    fn pkg(name: &str) -> Package {
        Package {
            id: PackageId {
                name: name.to_string(),
                version: "1.0.0".to_string(),
                source_digest: "abc".to_string(),
            },
            source_type: SourceType::Immutable,
            source_path: PathBuf::from("/src"),
            manifest: BuildManifest::default(),
        }
    }

    #[test]
    fn detects_cycle() {
        let mut graph = PackageGraph::new();
        let a = pkg("a");
        let b = pkg("b");
        let (a_id, b_id) = (a.id.clone(), b.id.clone());
        graph.add_package(a);
        graph.add_package(b);

        graph.add_edge(&a_id, EdgeKind::Dependency, &b_id).unwrap();
        let err = graph.add_edge(&b_id, EdgeKind::Dependency, &a_id);
        assert!(err.is_err());
    }

    #[test]
    fn dependencies_are_ordered_by_name() {
        let mut graph = PackageGraph::new();
        let root = pkg("root");
        let zeta = pkg("zeta");
        let alpha = pkg("alpha");
        let (root_id, zeta_id, alpha_id) = (root.id.clone(), zeta.id.clone(), alpha.id.clone());
        graph.add_package(root);
        graph.add_package(zeta);
        graph.add_package(alpha);

        graph.add_edge(&root_id, EdgeKind::Dependency, &zeta_id).unwrap();
        graph.add_edge(&root_id, EdgeKind::Dependency, &alpha_id).unwrap();

        let deps = graph.iter_dependencies(&root_id, &[]);
        let names: Vec<_> = deps.iter().map(|(_, p)| p.id.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }
}
