//! Package graph assembly and per-package build task planning — components
//! 4.3 and 4.4 of the build orchestration core.

pub mod graph;
pub mod package;
pub mod task;

pub use graph::{CycleError, PackageGraph};
pub use package::{EdgeKind, Package, PackageId, SourceType};
pub use task::{BuildTask, EnvCollisionWarning, PlanError, Planner};
