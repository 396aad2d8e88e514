//! Builder Adapter contract and bounded-concurrency Scheduler — components
//! 4.6 and 4.8 of the build orchestration core.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use esy_task::{BuildTask, PackageGraph, PackageId, SourceType};
use tokio::sync::{Semaphore, mpsc::UnboundedSender};

/// Which half of a task's commands an adapter invocation runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Build,
    Install,
}

/// Overrides the rebuild-decision rule (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Force {
    /// Defer entirely to each task's own rebuild rule.
    #[default]
    No,
    /// Always rebuild the root, regardless of its rebuild rule.
    ForRoot,
    /// Always rebuild every task.
    Yes,
}

/// Whether the install phase runs for every built task or is skipped for the
/// sandbox root (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BuildOnly {
    /// Run only the build commands for the root; its dependencies still
    /// install normally, since the root's own artifacts are never a
    /// dependency of anything.
    ForRoot,
    #[default]
    No,
}

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("build command exited with status {status}")]
    NonZeroExit { status: i32 },
    #[error("running the sandboxed process")]
    Io(#[source] std::io::Error),
    #[error("could not acquire the build lock at {path}")]
    LockContention { path: PathBuf },
}

impl From<std::io::Error> for AdapterError {
    fn from(source: std::io::Error) -> Self {
        AdapterError::Io(source)
    }
}

/// The black-box interface to whatever actually runs a package's build and
/// install commands, sandboxed or not. Production callers shell out to a
/// real sandboxed process spawner (out of scope here); tests use a fake.
#[async_trait]
pub trait BuilderAdapter: Send + Sync {
    async fn run(&self, task: &BuildTask, mode: Mode) -> Result<(), AdapterError>;
}

#[derive(Debug, Clone)]
pub enum Progress {
    Started(PackageId),
    /// The task's install path already existed and its source type isn't
    /// transient, so the build was skipped outright.
    Cached(PackageId),
    Succeeded(PackageId),
    Failed(PackageId, String),
    /// A dependency failed or was itself skipped, so this package's build
    /// never ran.
    Skipped(PackageId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Outcome {
    Cached,
    Succeeded,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Default)]
pub struct BuildReport {
    pub succeeded: Vec<PackageId>,
    pub cached: Vec<PackageId>,
    pub failed: Vec<(PackageId, String)>,
    pub skipped: Vec<PackageId>,
}

impl BuildReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("build task for {0} panicked")]
    Panicked(PackageId),
}

pub struct Scheduler<A> {
    adapter: Arc<A>,
    concurrency: usize,
}

impl<A> Scheduler<A>
where
    A: BuilderAdapter + 'static,
{
    pub fn new(adapter: A, concurrency: usize) -> Self {
        Self { adapter: Arc::new(adapter), concurrency: concurrency.max(1) }
    }

    /// Builds every task in `tasks`, respecting `graph`'s dependency order.
    /// Failures never stop siblings already in flight: a batch runs to
    /// completion, and only packages depending (directly or transitively,
    /// via the batch structure) on a failure or skip are themselves skipped.
    pub async fn build(
        &self,
        graph: &PackageGraph,
        tasks: &BTreeMap<PackageId, BuildTask>,
        root: &PackageId,
        force: Force,
        build_only: BuildOnly,
        progress: Option<UnboundedSender<Progress>>,
    ) -> Result<BuildReport, SchedulerError> {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut outcomes: BTreeMap<PackageId, Outcome> = BTreeMap::new();

        for batch in graph.batched_build_order() {
            let mut handles = Vec::new();

            for pkg_id in batch {
                let Some(task) = tasks.get(&pkg_id) else { continue };

                let blocked = graph
                    .iter_dependencies(&pkg_id, &[])
                    .into_iter()
                    .any(|(_, dep)| matches!(outcomes.get(&dep.id), Some(Outcome::Failed) | Some(Outcome::Skipped)));

                if blocked {
                    outcomes.insert(pkg_id.clone(), Outcome::Skipped);
                    send(&progress, Progress::Skipped(pkg_id.clone()));
                    continue;
                }

                if !needs_build(task, &pkg_id, root, force) {
                    outcomes.insert(pkg_id.clone(), Outcome::Cached);
                    send(&progress, Progress::Cached(pkg_id.clone()));
                    continue;
                }

                let skip_install = build_only == BuildOnly::ForRoot && pkg_id == *root;
                let task = task.clone();
                let adapter = Arc::clone(&self.adapter);
                let permit = Arc::clone(&semaphore);
                let progress = progress.clone();

                handles.push((
                    pkg_id,
                    tokio::spawn(async move {
                        let _permit = permit.acquire_owned().await.expect("semaphore is never closed");
                        run_one(adapter.as_ref(), &task, skip_install, &progress).await
                    }),
                ));
            }

            for (pkg_id, handle) in handles {
                match handle.await {
                    Ok(Ok(())) => {
                        outcomes.insert(pkg_id, Outcome::Succeeded);
                    }
                    Ok(Err(err)) => {
                        send(&progress, Progress::Failed(pkg_id.clone(), err.to_string()));
                        outcomes.insert(pkg_id, Outcome::Failed);
                    }
                    Err(_) => return Err(SchedulerError::Panicked(pkg_id)),
                }
            }
        }

        Ok(summarize(outcomes))
    }
}

fn summarize(outcomes: BTreeMap<PackageId, Outcome>) -> BuildReport {
    let mut report = BuildReport::default();
    for (pkg_id, outcome) in outcomes {
        match outcome {
            Outcome::Succeeded => report.succeeded.push(pkg_id),
            Outcome::Cached => report.cached.push(pkg_id),
            Outcome::Failed => report.failed.push((pkg_id, "build failed".to_string())),
            Outcome::Skipped => report.skipped.push(pkg_id),
        }
    }
    report
}

/// An immutable package whose install path is already populated never needs
/// rebuilding; a transient one (or one whose immutable sources carry a
/// transient overlay) always does — unless `force` overrides the rule
/// outright (§4.6's rebuild-decision rule).
fn needs_build(task: &BuildTask, pkg_id: &PackageId, root: &PackageId, force: Force) -> bool {
    if force == Force::Yes {
        return true;
    }
    if force == Force::ForRoot && pkg_id == root {
        return true;
    }
    matches!(task.source_type, SourceType::Transient | SourceType::ImmutableWithTransient) || !task.install_path.exists()
}

async fn run_one(adapter: &impl BuilderAdapter, task: &BuildTask, skip_install: bool, progress: &Option<UnboundedSender<Progress>>) -> Result<(), AdapterError> {
    send(progress, Progress::Started(task.package_id.clone()));
    tracing::info!(package = %task.package_id, "build started");

    fs_err::create_dir_all(&task.build_path)?;
    let lock_path = task.build_path.with_extension("lock");
    let _lock = acquire_lock(&lock_path).await?;

    let result = async {
        adapter.run(task, Mode::Build).await?;
        if skip_install {
            return Ok(());
        }
        adapter.run(task, Mode::Install).await
    }
    .await;

    match &result {
        Ok(()) => {
            send(progress, Progress::Succeeded(task.package_id.clone()));
            tracing::info!(package = %task.package_id, "build succeeded");
        }
        Err(err) => {
            tracing::warn!(package = %task.package_id, error = %err, "build failed");
        }
    }

    result
}

/// Acquires an advisory per-task lock with bounded exponential backoff (5
/// attempts), so two concurrent `esy` invocations never race on the same
/// build directory.
async fn acquire_lock(path: &Path) -> Result<fslock::LockFile, AdapterError> {
    let mut lock = fslock::LockFile::open(path)?;
    let mut delay = Duration::from_millis(25);

    for attempt in 0..5 {
        if lock.try_lock()? {
            return Ok(lock);
        }
        if attempt == 4 {
            return Err(AdapterError::LockContention { path: path.to_path_buf() });
        }
        tokio::time::sleep(delay).await;
        delay *= 2;
    }

    unreachable!("loop above always returns by the fifth attempt")
}

fn send(progress: &Option<UnboundedSender<Progress>>, event: Progress) {
    if let Some(sender) = progress {
        let _ = sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Mutex;

    use esy_manifest::BuildManifest;
    use esy_task::{EdgeKind, Package, PackageId};
    use tokio::sync::mpsc;

    use super::*;

    fn task(name: &str, source_type: SourceType) -> BuildTask {
        BuildTask {
            id: format!("{name}-id"),
            package_id: PackageId { name: name.to_string(), version: "1.0.0".to_string(), source_digest: "d".to_string() },
            source_type,
            build_commands: vec![vec!["build".to_string()]],
            install_commands: vec![vec!["install".to_string()]],
            sandbox_env: esy_env::compose([]).unwrap(),
            command_env: esy_env::compose([]).unwrap(),
            build_env: esy_env::compose([]).unwrap(),
            source_path: PathBuf::from(format!("/src/{name}")),
            build_path: PathBuf::from(format!("/tmp/esy-build-test/{name}")),
            stage_path: PathBuf::from(format!("/tmp/esy-stage-test/{name}")),
            install_path: PathBuf::from("/nonexistent/install/path/that/never/exists"),
            warnings: vec![],
        }
    }

    struct ScriptedAdapter {
        fail: Vec<String>,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl BuilderAdapter for ScriptedAdapter {
        async fn run(&self, task: &BuildTask, mode: Mode) -> Result<(), AdapterError> {
            self.calls.lock().unwrap().push(task.package_id.name.clone());
            if mode == Mode::Build && self.fail.contains(&task.package_id.name) {
                return Err(AdapterError::NonZeroExit { status: 1 });
            }
            Ok(())
        }
    }

    fn graph_with(root: &Package, deps: &[(&Package, EdgeKind)]) -> PackageGraph {
        let mut graph = PackageGraph::new();
        graph.add_package(root.clone());
        for (dep, kind) in deps {
            graph.add_package((*dep).clone());
            graph.add_edge(&root.id, *kind, &dep.id).unwrap();
        }
        graph
    }

    fn package(name: &str) -> Package {
        Package {
            id: PackageId { name: name.to_string(), version: "1.0.0".to_string(), source_digest: "d".to_string() },
            source_type: SourceType::Immutable,
            source_path: PathBuf::from(format!("/src/{name}")),
            manifest: BuildManifest::default(),
        }
    }

    #[tokio::test]
    async fn independent_siblings_both_run_even_when_one_fails() {
        let root = package("root");
        let ok_dep = package("ok");
        let bad_dep = package("bad");
        let graph = graph_with(&root, &[(&ok_dep, EdgeKind::Dependency), (&bad_dep, EdgeKind::Dependency)]);

        let mut tasks = BTreeMap::new();
        tasks.insert(root.id.clone(), task("root", SourceType::Transient));
        tasks.insert(ok_dep.id.clone(), task("ok", SourceType::Transient));
        tasks.insert(bad_dep.id.clone(), task("bad", SourceType::Transient));

        let adapter = ScriptedAdapter { fail: vec!["bad".to_string()], calls: Mutex::new(vec![]) };
        let scheduler = Scheduler::new(adapter, 4);
        let report = scheduler.build(&graph, &tasks, &root.id, Force::No, BuildOnly::No, None).await.unwrap();

        assert!(report.succeeded.contains(&ok_dep.id));
        assert!(report.failed.iter().any(|(id, _)| id == &bad_dep.id));
        // root depends on the failed package, so it never gets to build.
        assert!(report.skipped.contains(&root.id));
    }

    #[tokio::test]
    async fn cached_immutable_packages_are_skipped_without_calling_the_adapter() {
        let root = package("root");
        let graph = graph_with(&root, &[]);
        let mut tasks = BTreeMap::new();
        let mut cached_task = task("root", SourceType::Immutable);
        cached_task.install_path = std::env::temp_dir();
        tasks.insert(root.id.clone(), cached_task);

        let adapter = ScriptedAdapter { fail: vec![], calls: Mutex::new(vec![]) };
        let scheduler = Scheduler::new(adapter, 1);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let report = scheduler.build(&graph, &tasks, &root.id, Force::No, BuildOnly::No, Some(tx)).await.unwrap();

        assert!(report.cached.contains(&root.id));
        let mut events = vec![];
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert!(events.iter().any(|e| matches!(e, Progress::Cached(id) if id == &root.id)));
    }

    #[tokio::test]
    async fn force_for_root_rebuilds_an_otherwise_cached_root() {
        let root = package("root");
        let graph = graph_with(&root, &[]);
        let mut tasks = BTreeMap::new();
        let mut cached_task = task("root", SourceType::Immutable);
        cached_task.install_path = std::env::temp_dir();
        tasks.insert(root.id.clone(), cached_task);

        let adapter = ScriptedAdapter { fail: vec![], calls: Mutex::new(vec![]) };
        let scheduler = Scheduler::new(adapter, 1);
        let report = scheduler.build(&graph, &tasks, &root.id, Force::ForRoot, BuildOnly::No, None).await.unwrap();

        assert!(report.succeeded.contains(&root.id));
        assert!(scheduler.adapter.calls.lock().unwrap().contains(&"root".to_string()));
    }

    #[tokio::test]
    async fn build_only_for_root_never_runs_install_for_the_root() {
        let root = package("root");
        let graph = graph_with(&root, &[]);
        let mut tasks = BTreeMap::new();
        tasks.insert(root.id.clone(), task("root", SourceType::Transient));

        struct RecordingAdapter {
            modes: Mutex<Vec<Mode>>,
        }

        #[async_trait]
        impl BuilderAdapter for RecordingAdapter {
            async fn run(&self, _task: &BuildTask, mode: Mode) -> Result<(), AdapterError> {
                self.modes.lock().unwrap().push(mode);
                Ok(())
            }
        }

        let adapter = RecordingAdapter { modes: Mutex::new(vec![]) };
        let scheduler = Scheduler::new(adapter, 1);
        let report = scheduler.build(&graph, &tasks, &root.id, Force::No, BuildOnly::ForRoot, None).await.unwrap();

        assert!(report.succeeded.contains(&root.id));
        assert_eq!(*scheduler.adapter.modes.lock().unwrap(), vec![Mode::Build]);
    }
}
