//! Resolved configuration for a single planning/build invocation.
//!
//! `Config` is deliberately a plain value, constructed once by the caller
//! (the CLI surface, out of scope here) and threaded explicitly through the
//! planner, scheduler, and cache rather than read from process-wide state —
//! see the "global-ish state" design note.

use std::path::{Path, PathBuf};

/// Total length every store path is padded out to, so relocating a prefix
/// later never changes the length of strings already baked into build
/// artefacts (rpaths, shebangs).
const STORE_PATH_TARGET_LEN: usize = 100;

const ENV_PREFIX: &str = "ESY__PREFIX";
const ENV_SANDBOX: &str = "ESY__SANDBOX";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub prefix_path: PathBuf,
    pub store_path: PathBuf,
    pub local_store_path: PathBuf,
    pub sandbox_path: PathBuf,
    pub esy_version: String,
    pub store_padding: String,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("could not determine a home directory to derive a default prefix path")]
    NoHomeDir,
}

impl Config {
    /// Build a `Config` from explicit overrides, falling back to
    /// `ESY__PREFIX` / `ESY__SANDBOX`, and finally to platform defaults.
    ///
    /// `sandbox_path` defaults to the current directory; `prefix_path`
    /// defaults to `~/.esy`.
    pub fn from_env(
        prefix_override: Option<PathBuf>,
        sandbox_override: Option<PathBuf>,
        esy_version: impl Into<String>,
    ) -> Result<Self, Error> {
        let prefix_path = prefix_override
            .or_else(|| std::env::var_os(ENV_PREFIX).map(PathBuf::from))
            .map(Ok)
            .unwrap_or_else(default_prefix_path)?;

        let sandbox_path = sandbox_override
            .or_else(|| std::env::var_os(ENV_SANDBOX).map(PathBuf::from))
            .map(Ok)
            .unwrap_or_else(|| std::env::current_dir().map_err(|_| Error::NoHomeDir))?;

        Ok(Self::new(prefix_path, sandbox_path, esy_version.into()))
    }

    pub fn new(prefix_path: PathBuf, sandbox_path: PathBuf, esy_version: String) -> Self {
        let store_path = prefix_path.join(format!("esy-{esy_version}"));
        let local_store_path = sandbox_path.join("node_modules").join(".cache").join("_esy").join("store");
        let store_padding = padding_for(&store_path);

        Self {
            prefix_path,
            store_path,
            local_store_path,
            sandbox_path,
            esy_version,
            store_padding,
        }
    }

    /// Path under which cached sandbox info lives, without the `sandbox-<H>`
    /// suffix (the cache crate appends that).
    pub fn cache_dir(&self) -> PathBuf {
        self.sandbox_path.join("node_modules").join(".cache").join("_esy")
    }
}

fn default_prefix_path() -> Result<PathBuf, Error> {
    dirs::home_dir().map(|home| home.join(".esy")).ok_or(Error::NoHomeDir)
}

/// A string of padding characters such that `store_path` joined with it is
/// `STORE_PATH_TARGET_LEN` bytes long, or empty if `store_path` is already
/// at or past that length.
fn padding_for(store_path: &Path) -> String {
    let len = store_path.as_os_str().len();
    let remaining = STORE_PATH_TARGET_LEN.saturating_sub(len);
    "_".repeat(remaining)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padding_fills_to_target_length() {
        let config = Config::new(PathBuf::from("/prefix"), PathBuf::from("/sandbox"), "0.1.0".into());
        let total = config.store_path.as_os_str().len() + config.store_padding.len();
        assert_eq!(total, STORE_PATH_TARGET_LEN);
    }

    #[test]
    fn overrides_win_over_env() {
        unsafe {
            std::env::set_var(ENV_PREFIX, "/from-env");
        }
        let config = Config::from_env(Some(PathBuf::from("/explicit")), Some(PathBuf::from("/sandbox")), "0.1.0")
            .unwrap();
        assert_eq!(config.prefix_path, PathBuf::from("/explicit"));
        unsafe {
            std::env::remove_var(ENV_PREFIX);
        }
    }
}
