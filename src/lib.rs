//! Facade crate: wires the manifest loader, package graph, task planner,
//! sandbox-info cache, and scheduler into the three operations an external
//! CLI or build system actually calls: [`Esy::load_sandbox`], [`Esy::plan`],
//! and [`Esy::build_root`].
//!
//! Resolving *which* packages exist and how they depend on each other is the
//! installer/resolver's job (out of scope, §1); callers hand that resolution
//! in as a flat list of [`PackageInput`] and get back an assembled
//! [`PackageGraph`] — reloaded from the sandbox-info cache when every
//! witnessed manifest is unchanged, reloaded from disk otherwise.

use std::collections::BTreeMap;

use esy_cache::SandboxInfo;
use esy_config::Config;
use esy_manifest::Hint;
use esy_task::Planner;

pub use esy_build::{AdapterError, BuildOnly, BuildReport, BuilderAdapter, Force, Mode, Progress, Scheduler, SchedulerError};
pub use esy_cache::Error as CacheError;
pub use esy_config::Error as ConfigError;
pub use esy_manifest::Error as ManifestError;
pub use esy_task::{BuildTask, EdgeKind, EnvCollisionWarning, Package, PackageGraph, PackageId, PlanError, SourceType};

/// One package the caller's resolver has already placed on disk, named and
/// connected to its dependencies by position in the slice passed to
/// [`Esy::load_sandbox`].
pub struct PackageInput {
    pub source_path: std::path::PathBuf,
    pub source_digest: String,
    pub source_type: SourceType,
    pub hint: Option<Hint>,
    pub name_fallback: String,
    /// Indices into the same `&[PackageInput]` slice, naming this package's
    /// dependencies and the kind of each edge.
    pub dependencies: Vec<(EdgeKind, usize)>,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("loading manifest for {path}")]
    Manifest {
        path: std::path::PathBuf,
        #[source]
        source: ManifestError,
    },
    #[error("resolving configuration")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error(transparent)]
    Build(#[from] SchedulerError),
    #[error("writing the sandbox-info cache")]
    Cache(#[from] CacheError),
    #[error("package graph has a dependency cycle: {0}")]
    Cycle(String),
}

/// Renders an error and its full `.source()` chain as a single line, the
/// shape a CLI entry point prints on exit.
pub fn render_error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut parts = vec![err.to_string()];
    let mut cursor = err.source();
    while let Some(source) = cursor {
        parts.push(source.to_string());
        cursor = source.source();
    }
    parts.join(": ")
}

pub struct Esy {
    config: Config,
}

impl Esy {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Assembles the package graph described by `inputs`, rooted at
    /// `inputs[root_index]`. Returns the cached graph verbatim if its
    /// manifest witnesses are all still fresh; otherwise reloads every
    /// manifest from disk and refreshes the cache.
    pub fn load_sandbox(&self, inputs: &[PackageInput], root_index: usize) -> Result<(PackageGraph, PackageId), Error> {
        let cache_path = esy_cache::cache_path(&self.config, &self.config.sandbox_path);

        if let Some(cached) = esy_cache::read(&cache_path) {
            if let Some(graph) = rebuild_graph(&cached, inputs) {
                return Ok((graph, cached.root));
            }
        }

        self.load_fresh(inputs, root_index, &cache_path)
    }

    fn load_fresh(&self, inputs: &[PackageInput], root_index: usize, cache_path: &std::path::Path) -> Result<(PackageGraph, PackageId), Error> {
        let mut graph = PackageGraph::new();
        let mut ids = Vec::with_capacity(inputs.len());
        let mut witness_paths = std::collections::BTreeSet::new();

        for input in inputs {
            let (manifest, witnessed) = esy_manifest::load_from_path(&input.source_path, input.hint.clone()).map_err(|source| Error::Manifest {
                path: input.source_path.clone(),
                source,
            })?;
            witness_paths.extend(witnessed);

            let manifest = manifest.unwrap_or_default();
            let name = manifest.name.clone().unwrap_or_else(|| input.name_fallback.clone());
            let version = manifest.version.as_ref().map(|v| v.as_str().to_string()).unwrap_or_else(|| "0.0.0".to_string());

            let id = PackageId { name, version, source_digest: input.source_digest.clone() };
            ids.push(id.clone());

            graph.add_package(Package {
                id,
                source_type: input.source_type,
                source_path: input.source_path.clone(),
                manifest,
            });
        }

        for (index, input) in inputs.iter().enumerate() {
            for (kind, dep_index) in &input.dependencies {
                graph.add_edge(&ids[index], *kind, &ids[*dep_index]).map_err(|err| Error::Cycle(err.to_string()))?;
            }
        }

        let root = ids[root_index].clone();

        let witnesses = esy_cache::witness_mtimes(&witness_paths)?;
        let info = SandboxInfo {
            root: root.clone(),
            packages: graph.iter_ids().filter_map(|id| graph.get(id).cloned()).collect(),
            edges: graph.iter_edges(),
        };
        esy_cache::write(cache_path, &info, witnesses)?;

        Ok((graph, root))
    }

    /// Plans every package `root` transitively depends on (§4.4).
    pub fn plan(&self, graph: &PackageGraph, root: &PackageId, dev: bool) -> Result<BTreeMap<PackageId, BuildTask>, Error> {
        let planner = Planner::new(&self.config, dev);
        Ok(planner.plan_all(graph, root)?)
    }

    /// Builds every planned task, bounded to `concurrency` concurrent
    /// builds (§4.6), reporting through `adapter`. `force` and `build_only`
    /// steer the rebuild decision and the install phase for `root` itself.
    #[allow(clippy::too_many_arguments)]
    pub async fn build_root<A>(
        &self,
        graph: &PackageGraph,
        tasks: &BTreeMap<PackageId, BuildTask>,
        root: &PackageId,
        adapter: A,
        concurrency: usize,
        force: Force,
        build_only: BuildOnly,
        progress: Option<tokio::sync::mpsc::UnboundedSender<Progress>>,
    ) -> Result<BuildReport, Error>
    where
        A: BuilderAdapter + 'static,
    {
        let scheduler = Scheduler::new(adapter, concurrency);
        Ok(scheduler.build(graph, tasks, root, force, build_only, progress).await?)
    }
}

/// Reconstructs a `PackageGraph` from a cached [`SandboxInfo`], provided
/// every input's source digest is still represented among the cached
/// packages — if the set of inputs has changed shape (a package added or
/// removed) the cache can't be trusted and the caller should reload fresh.
fn rebuild_graph(cached: &SandboxInfo, inputs: &[PackageInput]) -> Option<PackageGraph> {
    if cached.packages.len() != inputs.len() {
        return None;
    }

    let mut graph = PackageGraph::new();
    for package in &cached.packages {
        graph.add_package(package.clone());
    }
    for (from, kind, to) in &cached.edges {
        graph.add_edge(from, *kind, to).ok()?;
    }
    Some(graph)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_chain_joins_every_source() {
        let inner = esy_env::UnknownEnvRef { name: "X".to_string(), binding: "Y".to_string() };
        let mid = PlanError::Env { package: PackageId { name: "p".to_string(), version: "1".to_string(), source_digest: "d".to_string() }, source: inner };
        let rendered = render_error_chain(&mid);
        assert!(rendered.contains("composing the build environment"));
        assert!(rendered.contains("unknown environment reference"));
    }
}
