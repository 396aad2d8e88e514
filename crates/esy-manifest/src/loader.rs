use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use fs_err as fs;

use crate::manifest::BuildManifest;
use crate::{esy_json, opam};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestKind {
    Esy,
    Opam,
}

/// An explicit hint for which file, in which format, to load — as opposed
/// to probing `esy.json` then `package.json` in order.
#[derive(Debug, Clone)]
pub struct Hint {
    pub kind: ManifestKind,
    pub name: String,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("manifest file not found: {0}")]
    ManifestMissing(PathBuf),
    #[error("failed to parse manifest {path}: {message}")]
    ManifestParse { path: PathBuf, message: String },
}

const PROBE_ORDER: &[&str] = &["esy.json", "package.json"];

/// Load a manifest from `dir`, optionally following an explicit `hint`.
///
/// Without a hint, probes `esy.json` then `package.json` in order; the
/// first file that parses to a manifest wins. An absent probe file tries
/// the next; if every probe file is absent, returns `(None, {})`.
pub fn load_from_path(dir: &Path, hint: Option<Hint>) -> Result<(Option<BuildManifest>, BTreeSet<PathBuf>), Error> {
    match hint {
        Some(Hint { kind: ManifestKind::Esy, name }) => {
            let path = dir.join(&name);
            let Ok(bytes) = fs::read(&path) else {
                return Err(Error::ManifestMissing(path));
            };
            let manifest = load_from_data(ManifestKind::Esy, &bytes, None, &path)?;
            if manifest.is_none() {
                return Ok((None, BTreeSet::from([path])));
            }
            Ok((manifest, BTreeSet::from([path])))
        }
        Some(Hint { kind: ManifestKind::Opam, name }) => {
            let path = dir.join(&name);
            let Ok(bytes) = fs::read(&path) else {
                return Err(Error::ManifestMissing(path));
            };
            let manifest = load_from_data(ManifestKind::Opam, &bytes, Some(&name), &path)?;
            Ok((manifest, BTreeSet::from([path])))
        }
        None => {
            for candidate in PROBE_ORDER {
                let path = dir.join(candidate);
                let Ok(bytes) = fs::read(&path) else {
                    continue;
                };
                let manifest = load_from_data(ManifestKind::Esy, &bytes, None, &path)?;
                if manifest.is_some() {
                    return Ok((manifest, BTreeSet::from([path])));
                }
            }
            Ok((None, BTreeSet::new()))
        }
    }
}

/// Parse manifest bytes of the given `kind` into a [`BuildManifest`].
pub fn load_from_data(
    kind: ManifestKind,
    bytes: &[u8],
    name_fallback: Option<&str>,
    path: &Path,
) -> Result<Option<BuildManifest>, Error> {
    match kind {
        ManifestKind::Esy => {
            esy_json::parse(bytes, name_fallback).map_err(|err| Error::ManifestParse {
                path: path.to_path_buf(),
                message: err.to_string(),
            })
        }
        ManifestKind::Opam => {
            let text = std::str::from_utf8(bytes).map_err(|err| Error::ManifestParse {
                path: path.to_path_buf(),
                message: err.to_string(),
            })?;
            let parsed = opam::parse(text).map_err(|err| Error::ManifestParse {
                path: path.to_path_buf(),
                message: err.to_string(),
            })?;
            Ok(Some(opam::to_manifest(parsed).scope_opam_name()))
        }
    }
}
