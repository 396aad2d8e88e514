//! Manifest loading, normalization, and override folding — components 4.1
//! and 4.2 of the build orchestration core.

pub mod esy_json;
pub mod loader;
pub mod manifest;
pub mod opam;
pub mod override_fold;

pub use loader::{Error, Hint, ManifestKind, load_from_data, load_from_path};
pub use manifest::{BuildManifest, BuildType, Commands, EnvScope, ExportedEnvEntry, Patch, Version};
pub use override_fold::{BuildOverride, MapDiff, apply, fold_all};
