//! Sandbox-Info Cache (§4.7): a versioned binary blob holding the resolved
//! package graph, witnessed against the mtimes of every manifest file that
//! was read to produce it. A stale witness invalidates the whole cache —
//! there is no partial re-use.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Read as _;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use esy_config::Config;
use esy_task::{EdgeKind, Package, PackageId};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const MAGIC: &[u8; 5] = b"ESYSB";
const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone)]
pub struct SandboxInfo {
    pub root: PackageId,
    pub packages: Vec<Package>,
    pub edges: Vec<(PackageId, EdgeKind, PackageId)>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Payload {
    root: PackageId,
    packages: Vec<Package>,
    edges: Vec<(PackageId, EdgeKind, PackageId)>,
    witnesses: BTreeMap<PathBuf, SystemTime>,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("writing sandbox-info cache to {path}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serializing sandbox-info cache")]
    Encode(#[source] serde_json::Error),
    #[error("stamping manifest witness mtime for {path}")]
    Witness {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Path the cache for a sandbox rooted at `sandbox_path` lives at. The
/// filename carries a short digest of `storePath $$ localStorePath $$
/// sandboxPath $$ esyVersion` (§4.7), so two configurations sharing a
/// sandbox but differing in prefix, local store, or esy version never
/// collide on the same cache file.
pub fn cache_path(config: &Config, sandbox_path: &Path) -> PathBuf {
    let mut hasher = Sha256::new();
    hasher.update(config.store_path.as_os_str().as_encoded_bytes());
    hasher.update(b"$$");
    hasher.update(config.local_store_path.as_os_str().as_encoded_bytes());
    hasher.update(b"$$");
    hasher.update(sandbox_path.as_os_str().as_encoded_bytes());
    hasher.update(b"$$");
    hasher.update(config.esy_version.as_bytes());
    let digest = hex::encode(hasher.finalize());
    config.cache_dir().join(format!("sandbox-{}.bin", &digest[..16]))
}

/// Captures the current mtime of every manifest path read while resolving
/// the sandbox, so a later [`read`] can tell whether any of them changed.
pub fn witness_mtimes(paths: &BTreeSet<PathBuf>) -> Result<BTreeMap<PathBuf, SystemTime>, Error> {
    let mut witnesses = BTreeMap::new();
    for path in paths {
        let metadata = fs_err::metadata(path).map_err(|source| Error::Witness {
            path: path.clone(),
            source: source.into(),
        })?;
        let modified = metadata.modified().map_err(|source| Error::Witness { path: path.clone(), source })?;
        witnesses.insert(path.clone(), modified);
    }
    Ok(witnesses)
}

/// Writes `info` to `path`, witnessed against `witnesses`. Write failures are
/// real errors (the caller decides whether a cold-cache run should still
/// succeed), but a failed write never corrupts a prior, still-valid cache
/// file: the blob is written to a sibling temp file and renamed into place.
pub fn write(path: &Path, info: &SandboxInfo, witnesses: BTreeMap<PathBuf, SystemTime>) -> Result<(), Error> {
    let payload = Payload {
        root: info.root.clone(),
        packages: info.packages.clone(),
        edges: info.edges.clone(),
        witnesses,
    };
    let body = serde_json::to_vec(&payload).map_err(Error::Encode)?;

    let mut blob = Vec::with_capacity(MAGIC.len() + 4 + 4 + body.len());
    blob.extend_from_slice(MAGIC);
    blob.extend_from_slice(&SCHEMA_VERSION.to_le_bytes());
    blob.extend_from_slice(&(body.len() as u32).to_le_bytes());
    blob.extend_from_slice(&body);

    if let Some(parent) = path.parent() {
        fs_err::create_dir_all(parent).map_err(|source| Error::Write { path: path.to_path_buf(), source: source.into() })?;
    }
    let tmp_path = path.with_extension("bin.tmp");
    fs_err::write(&tmp_path, &blob).map_err(|source| Error::Write { path: path.to_path_buf(), source: source.into() })?;
    fs_err::rename(&tmp_path, path).map_err(|source| Error::Write { path: path.to_path_buf(), source: source.into() })?;

    Ok(())
}

/// Reads and validates the cache at `path`. Returns `None` — never an error —
/// on anything short of a successfully parsed, freshly-witnessed blob: a
/// missing file, a corrupt header, a schema mismatch, or a stale witness all
/// just mean "resolve from scratch", logged at `debug`.
pub fn read(path: &Path) -> Option<SandboxInfo> {
    let mut file = match fs_err::File::open(path) {
        Ok(file) => file,
        Err(err) => {
            tracing::debug!(path = %path.display(), error = %err, "no sandbox-info cache to read");
            return None;
        }
    };

    let mut bytes = Vec::new();
    if let Err(err) = file.read_to_end(&mut bytes) {
        tracing::warn!(path = %path.display(), error = %err, "failed reading sandbox-info cache");
        return None;
    }

    let payload = decode(&bytes)?;

    for (witness_path, recorded) in &payload.witnesses {
        let current = match fs_err::metadata(witness_path).and_then(|m| m.modified()) {
            Ok(mtime) => mtime,
            Err(_) => {
                tracing::debug!(path = %witness_path.display(), "witnessed manifest vanished, cache stale");
                return None;
            }
        };
        if current != *recorded {
            tracing::debug!(path = %witness_path.display(), "witnessed manifest changed, cache stale");
            return None;
        }
    }

    Some(SandboxInfo {
        root: payload.root,
        packages: payload.packages,
        edges: payload.edges,
    })
}

fn decode(bytes: &[u8]) -> Option<Payload> {
    if bytes.len() < MAGIC.len() + 8 || &bytes[..MAGIC.len()] != MAGIC {
        tracing::debug!("sandbox-info cache missing or wrong magic bytes");
        return None;
    }
    let mut offset = MAGIC.len();

    let version = u32::from_le_bytes(bytes[offset..offset + 4].try_into().ok()?);
    offset += 4;
    if version != SCHEMA_VERSION {
        tracing::debug!(version, expected = SCHEMA_VERSION, "sandbox-info cache schema mismatch");
        return None;
    }

    let len = u32::from_le_bytes(bytes[offset..offset + 4].try_into().ok()?) as usize;
    offset += 4;
    let body = bytes.get(offset..offset + len)?;

    serde_json::from_slice(body)
        .inspect_err(|err| tracing::warn!(error = %err, "sandbox-info cache payload failed to parse"))
        .ok()
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::thread::sleep;
    use std::time::Duration;

    use esy_manifest::BuildManifest;
    use esy_task::SourceType;

    use super::*;

    fn sandbox_info() -> SandboxInfo {
        let root = PackageId {
            name: "root".to_string(),
            version: "1.0.0".to_string(),
            source_digest: "d".to_string(),
        };
        let package = Package {
            id: root.clone(),
            source_type: SourceType::Transient,
            source_path: PathBuf::from("/sandbox"),
            manifest: BuildManifest::default(),
        };
        SandboxInfo { root, packages: vec![package], edges: vec![] }
    }

    #[test]
    fn round_trips_a_fresh_cache() {
        let dir = tempfile::tempdir().unwrap();
        let manifest_path = dir.path().join("esy.json");
        fs_err::write(&manifest_path, "{}").unwrap();

        let cache_path = dir.path().join("sandbox.bin");
        let witnesses = witness_mtimes(&BTreeSet::from([manifest_path.clone()])).unwrap();
        let info = sandbox_info();
        write(&cache_path, &info, witnesses).unwrap();

        let loaded = read(&cache_path).expect("fresh cache should be valid");
        assert_eq!(loaded.root, info.root);
    }

    #[test]
    fn touching_a_witnessed_manifest_invalidates_the_cache() {
        let dir = tempfile::tempdir().unwrap();
        let manifest_path = dir.path().join("esy.json");
        fs_err::write(&manifest_path, "{}").unwrap();

        let cache_path = dir.path().join("sandbox.bin");
        let witnesses = witness_mtimes(&BTreeSet::from([manifest_path.clone()])).unwrap();
        write(&cache_path, &sandbox_info(), witnesses).unwrap();

        sleep(Duration::from_millis(10));
        fs_err::write(&manifest_path, "{\"name\": \"changed\"}").unwrap();

        assert!(read(&cache_path).is_none());
    }

    #[test]
    fn distinct_esy_versions_never_collide_on_the_same_cache_file() {
        let sandbox_path = PathBuf::from("/sandbox");
        let a = Config::new(PathBuf::from("/prefix"), sandbox_path.clone(), "0.1.0".to_string());
        let b = Config::new(PathBuf::from("/prefix"), sandbox_path.clone(), "0.2.0".to_string());

        assert_ne!(cache_path(&a, &sandbox_path), cache_path(&b, &sandbox_path));
    }

    #[test]
    fn missing_cache_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read(&dir.path().join("nope.bin")).is_none());
    }
}
