use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};

use esy_config::Config;
use esy_env::{ClosedEnv, UnknownEnvRef, compose, platform_defaults};
use esy_manifest::{BuildType, Commands, EnvScope, Patch};
use sha2::{Digest, Sha256};

use crate::graph::PackageGraph;
use crate::package::{EdgeKind, Package, PackageId, SourceType};

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("package {0} is referenced by the graph but was never added to it")]
    MissingPackage(PackageId),
    #[error("composing the build environment for {package}")]
    Env {
        package: PackageId,
        #[source]
        source: UnknownEnvRef,
    },
}

/// A non-fatal collision between two packages exporting the same variable
/// name into a dependent's environment (§4.4 step 2). The task carries these
/// rather than silently dropping the loser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvCollisionWarning {
    pub name: String,
    pub winner: PackageId,
    pub loser: PackageId,
}

#[derive(Debug, Clone)]
pub struct BuildTask {
    /// Content-addressed id: a digest of the folded manifest, every
    /// dependency's own id, and the planner's configuration (invariants 1-2).
    pub id: String,
    pub package_id: PackageId,
    pub source_type: SourceType,
    pub build_commands: Vec<Vec<String>>,
    pub install_commands: Vec<Vec<String>>,
    /// The minimal platform environment plus the global-export closure of
    /// the package's entire transitive dependency graph (§4.4 step 3).
    pub sandbox_env: ClosedEnv,
    /// `sandbox_env` layered with this package's own `buildEnv` and every
    /// direct dependency's exports, local and global.
    pub command_env: ClosedEnv,
    /// `command_env` plus the build-only `cur__*` variables, ready to run
    /// `build_commands` in.
    pub build_env: ClosedEnv,
    pub source_path: PathBuf,
    pub build_path: PathBuf,
    pub stage_path: PathBuf,
    pub install_path: PathBuf,
    pub warnings: Vec<EnvCollisionWarning>,
}

pub struct Planner<'a> {
    config: &'a Config,
    dev: bool,
}

impl<'a> Planner<'a> {
    pub fn new(config: &'a Config, dev: bool) -> Self {
        Self { config, dev }
    }

    /// Plans `root` and every package it transitively depends on, memoized
    /// by package id so a diamond-shaped graph folds each package exactly
    /// once.
    pub fn plan_all(&self, graph: &PackageGraph, root: &PackageId) -> Result<BTreeMap<PackageId, BuildTask>, PlanError> {
        let mut cache = BTreeMap::new();
        self.plan(graph, root, root, &mut cache)?;
        Ok(cache)
    }

    fn plan(
        &self,
        graph: &PackageGraph,
        pkg_id: &PackageId,
        root_id: &PackageId,
        cache: &mut BTreeMap<PackageId, BuildTask>,
    ) -> Result<BuildTask, PlanError> {
        if let Some(task) = cache.get(pkg_id) {
            return Ok(task.clone());
        }

        let package = graph.get(pkg_id).ok_or_else(|| PlanError::MissingPackage(pkg_id.clone()))?;

        let mut dep_task_ids = Vec::new();
        for (_, dep) in graph.iter_dependencies(pkg_id, &[EdgeKind::Dependency, EdgeKind::BuildDependency]) {
            let dep_task = self.plan(graph, &dep.id, root_id, cache)?;
            dep_task_ids.push(dep_task.id.clone());
        }
        dep_task_ids.sort();

        let candidates = collect_export_candidates(graph, pkg_id);
        let (global_closure, _) = resolve_candidates(&candidates, |c| c.scope == EnvScope::Global);
        let (exported, warnings) = resolve_candidates(&candidates, |c| c.depth == 1 || c.scope == EnvScope::Global);

        let mut sandbox_bindings = platform_defaults();
        sandbox_bindings.extend(global_closure);
        let sandbox_env = compose(sandbox_bindings).map_err(|source| PlanError::Env {
            package: pkg_id.clone(),
            source,
        })?;

        let mut command_bindings: Vec<(String, String)> = sandbox_env.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        command_bindings.extend(package.manifest.build_env.iter().map(|(k, v)| (k.clone(), v.clone())));
        command_bindings.extend(exported);
        let command_env = compose(command_bindings).map_err(|source| PlanError::Env {
            package: pkg_id.clone(),
            source,
        })?;

        let is_root = pkg_id == root_id;
        let build = if is_root && self.dev {
            package.manifest.build_dev.clone().or_else(|| package.manifest.build.clone())
        } else {
            package.manifest.build.clone()
        };

        let id = task_id(package, &dep_task_ids, self.config, &build);
        let (source_path, build_path, stage_path, install_path) = derive_paths(self.config, package, &id);

        let mut build_bindings: Vec<(String, String)> = command_env.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        build_bindings.extend(cur_vars(package, &dep_task_ids, &source_path, &build_path, &stage_path, &install_path));
        let build_env = compose(build_bindings).map_err(|source| PlanError::Env {
            package: pkg_id.clone(),
            source,
        })?;

        let task = BuildTask {
            id,
            package_id: pkg_id.clone(),
            source_type: package.source_type,
            build_commands: as_lists(&build),
            install_commands: as_lists(&package.manifest.install),
            sandbox_env,
            command_env,
            build_env,
            source_path,
            build_path,
            stage_path,
            install_path,
            warnings,
        };

        cache.insert(pkg_id.clone(), task.clone());
        Ok(task)
    }

    /// The environment a user-facing command run against `package` should
    /// see: the command-env it was built with, plus the package's own
    /// exports layered on top so its just-built binaries are reachable.
    pub fn exec_env(&self, task: &BuildTask, package: &Package) -> Result<ClosedEnv, PlanError> {
        let mut bindings: Vec<(String, String)> = task.command_env.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        for (name, entry) in &package.manifest.exported_env {
            bindings.push((name.clone(), entry.value.clone()));
        }
        compose(bindings).map_err(|source| PlanError::Env {
            package: package.id.clone(),
            source,
        })
    }
}

fn as_lists(commands: &Option<Commands>) -> Vec<Vec<String>> {
    commands.as_ref().map(|c| c.as_lists().to_vec()).unwrap_or_default()
}

struct Candidate {
    value: String,
    depth: usize,
    scope: EnvScope,
    source: PackageId,
}

/// Breadth-first walk of `start`'s dependencies, recording every exported
/// variable reachable from it (at any depth, any scope) tagged with the
/// depth and package it came from. Callers resolve the set of variables they
/// care about with [`resolve_candidates`].
fn collect_export_candidates(graph: &PackageGraph, start: &PackageId) -> BTreeMap<String, Vec<Candidate>> {
    let mut candidates: BTreeMap<String, Vec<Candidate>> = BTreeMap::new();
    let mut visited: BTreeMap<PackageId, usize> = BTreeMap::new();
    let mut queue: VecDeque<(PackageId, usize)> = VecDeque::new();

    for (_, dep) in graph.iter_dependencies(start, &[EdgeKind::Dependency, EdgeKind::BuildDependency]) {
        queue.push_back((dep.id.clone(), 1));
    }

    while let Some((pkg_id, depth)) = queue.pop_front() {
        if visited.contains_key(&pkg_id) {
            continue;
        }
        visited.insert(pkg_id.clone(), depth);

        let Some(pkg) = graph.get(&pkg_id) else { continue };
        for (name, entry) in &pkg.manifest.exported_env {
            candidates.entry(name.clone()).or_default().push(Candidate {
                value: entry.value.clone(),
                depth,
                scope: entry.scope,
                source: pkg.id.clone(),
            });
        }

        for (_, dep) in graph.iter_dependencies(&pkg_id, &[EdgeKind::Dependency, EdgeKind::BuildDependency]) {
            if !visited.contains_key(&dep.id) {
                queue.push_back((dep.id.clone(), depth + 1));
            }
        }
    }

    candidates
}

/// Resolves `candidates` down to one value per name, keeping only entries
/// `eligible` accepts. Collisions resolve to the shallowest depth, ties
/// broken lexicographically by exporting package name.
fn resolve_candidates(
    candidates: &BTreeMap<String, Vec<Candidate>>,
    eligible: impl Fn(&Candidate) -> bool,
) -> (BTreeMap<String, String>, Vec<EnvCollisionWarning>) {
    let mut resolved = BTreeMap::new();
    let mut warnings = Vec::new();

    for (name, entries) in candidates {
        let mut filtered: Vec<&Candidate> = entries.iter().filter(|c| eligible(c)).collect();
        if filtered.is_empty() {
            continue;
        }
        filtered.sort_by(|a, b| a.depth.cmp(&b.depth).then_with(|| a.source.name.cmp(&b.source.name)));
        let winner = filtered[0];
        for loser in &filtered[1..] {
            if loser.source != winner.source {
                warnings.push(EnvCollisionWarning {
                    name: name.clone(),
                    winner: winner.source.clone(),
                    loser: loser.source.clone(),
                });
            }
        }
        resolved.insert(name.clone(), winner.value.clone());
    }

    (resolved, warnings)
}

/// Direct dependents see every export of a direct dependency (local or
/// global scope); indirect dependents see only the global-scoped ones.
fn exported_env_for(graph: &PackageGraph, start: &PackageId) -> (BTreeMap<String, String>, Vec<EnvCollisionWarning>) {
    let candidates = collect_export_candidates(graph, start);
    resolve_candidates(&candidates, |c| c.depth == 1 || c.scope == EnvScope::Global)
}

/// The build-only `cur__*` variables layered onto `command_env` to produce
/// `build_env` (§4.4 step 3).
fn cur_vars(package: &Package, dep_task_ids: &[String], source_path: &Path, build_path: &Path, stage_path: &Path, install_path: &Path) -> Vec<(String, String)> {
    let p = |path: &Path| path.to_string_lossy().into_owned();
    vec![
        ("cur__root".to_string(), p(source_path)),
        ("cur__target_dir".to_string(), p(build_path)),
        ("cur__install".to_string(), p(install_path)),
        ("cur__stage".to_string(), p(stage_path)),
        ("cur__name".to_string(), package.id.name.clone()),
        ("cur__version".to_string(), package.id.version.clone()),
        ("cur__depends".to_string(), dep_task_ids.join(" ")),
        ("cur__toplevel".to_string(), p(install_path)),
        ("cur__bin".to_string(), p(&install_path.join("bin"))),
        ("cur__sbin".to_string(), p(&install_path.join("sbin"))),
        ("cur__lib".to_string(), p(&install_path.join("lib"))),
        ("cur__man".to_string(), p(&install_path.join("man"))),
        ("cur__doc".to_string(), p(&install_path.join("doc"))),
        ("cur__share".to_string(), p(&install_path.join("share"))),
        ("cur__etc".to_string(), p(&install_path.join("etc"))),
    ]
}

fn task_id(package: &Package, dep_task_ids: &[String], config: &Config, build: &Option<Commands>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(package.id.name.as_bytes());
    hasher.update(b"\0");
    hasher.update(package.id.version.as_bytes());
    hasher.update(b"\0");
    hasher.update(package.id.source_digest.as_bytes());
    hasher.update(b"\0");
    hash_build_type(&mut hasher, package.manifest.build_type);
    hash_commands(&mut hasher, build);
    hash_commands(&mut hasher, &package.manifest.install);
    for (name, value) in &package.manifest.build_env {
        hasher.update(name.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
        hasher.update(b"\0");
    }
    for (name, entry) in &package.manifest.exported_env {
        hasher.update(name.as_bytes());
        hasher.update(b"=");
        hasher.update(entry.value.as_bytes());
        hasher.update(if entry.scope == EnvScope::Global { b"g" } else { b"l" });
        hasher.update(b"\0");
    }
    hash_patches(&mut hasher, &package.manifest.patches);
    hash_substs(&mut hasher, &package.manifest.substs);
    for dep_id in dep_task_ids {
        hasher.update(dep_id.as_bytes());
        hasher.update(b"\0");
    }
    hasher.update(config.esy_version.as_bytes());

    hex::encode(hasher.finalize())
}

fn hash_build_type(hasher: &mut Sha256, build_type: BuildType) {
    let tag: &str = match build_type {
        BuildType::InSource => "in-source",
        BuildType::JbuilderLike => "jbuilder-like",
        BuildType::OutOfSource => "out-of-source",
        BuildType::Unsafe => "unsafe",
    };
    hasher.update(tag.as_bytes());
    hasher.update(b"\0");
}

fn hash_commands(hasher: &mut Sha256, commands: &Option<Commands>) {
    for line in commands.as_ref().map(Commands::as_lists).unwrap_or_default() {
        for arg in line {
            hasher.update(arg.as_bytes());
            hasher.update(b"\x1f");
        }
        hasher.update(b"\x1e");
    }
    hasher.update(b"\0");
}

/// Patches are ordered and their content matters to the built artifact, so
/// each one's path and filter fold into the id in listed order.
fn hash_patches(hasher: &mut Sha256, patches: &[Patch]) {
    for patch in patches {
        hasher.update(patch.path.as_os_str().as_encoded_bytes());
        hasher.update(b"\x1f");
        if let Some(filter) = &patch.filter {
            hasher.update(filter.as_bytes());
        }
        hasher.update(b"\x1e");
    }
    hasher.update(b"\0");
}

fn hash_substs(hasher: &mut Sha256, substs: &[PathBuf]) {
    for subst in substs {
        hasher.update(subst.as_os_str().as_encoded_bytes());
        hasher.update(b"\x1f");
    }
    hasher.update(b"\0");
}

fn derive_paths(config: &Config, package: &Package, id: &str) -> (PathBuf, PathBuf, PathBuf, PathBuf) {
    let source_path = package.source_path.clone();
    let build_path = config.store_path.join("b").join(id);
    let stage_path = config.store_path.join("s").join(id);
    let install_path = match package.source_type {
        SourceType::Transient => config.local_store_path.join("i").join(id),
        SourceType::Immutable | SourceType::ImmutableWithTransient => config.store_path.join("i").join(id),
    };
    (source_path, build_path, stage_path, install_path)
}
