use std::collections::BTreeMap;

use crate::manifest::{BuildManifest, BuildType, Commands, EnvScope, ExportedEnvEntry};

/// A three-operation diff applied to a mapping: remove, then add, then
/// update, in that order (§4.2).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MapDiff<V> {
    pub remove: Vec<String>,
    pub add: BTreeMap<String, V>,
    pub update: BTreeMap<String, V>,
}

impl<V> MapDiff<V> {
    fn apply(self, mut map: BTreeMap<String, V>) -> BTreeMap<String, V> {
        for key in self.remove {
            map.remove(&key);
        }
        map.extend(self.add);
        map.extend(self.update);
        map
    }
}

/// A single layer in the override stack. Every field is optional: only the
/// fields the layer sets are folded onto the manifest it's applied to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildOverride {
    pub build_type: Option<BuildType>,
    pub build: Option<Vec<Vec<String>>>,
    pub install: Option<Vec<Vec<String>>>,
    pub exported_env: Option<BTreeMap<String, ExportedEnvEntry>>,
    pub build_env: Option<BTreeMap<String, String>>,
    pub exported_env_override: Option<MapDiff<ExportedEnvEntry>>,
    pub build_env_override: Option<MapDiff<String>>,
}

/// Apply a single override onto a manifest. Total: every field combination
/// produces a manifest, never an error.
pub fn apply(mut manifest: BuildManifest, over: BuildOverride) -> BuildManifest {
    if let Some(build_type) = over.build_type {
        manifest.build_type = build_type;
    }
    if let Some(build) = over.build {
        manifest.build = Some(Commands::Esy(build));
    }
    if let Some(install) = over.install {
        manifest.install = Some(Commands::Esy(install));
    }
    if let Some(exported_env) = over.exported_env {
        manifest.exported_env = exported_env;
    }
    if let Some(build_env) = over.build_env {
        manifest.build_env = build_env;
    }
    if let Some(diff) = over.exported_env_override {
        manifest.exported_env = diff.apply(manifest.exported_env);
    }
    if let Some(diff) = over.build_env_override {
        manifest.build_env = diff.apply(manifest.build_env);
    }
    manifest
}

/// Fold a stack of overrides onto a manifest, left to right. Per the data
/// model, overrides are stored outermost-last, so applying them in list
/// order makes the outermost override win.
pub fn fold_all(manifest: BuildManifest, overrides: impl IntoIterator<Item = BuildOverride>) -> BuildManifest {
    overrides.into_iter().fold(manifest, apply)
}

pub fn local(value: impl Into<String>) -> ExportedEnvEntry {
    ExportedEnvEntry {
        value: value.into(),
        scope: EnvScope::Local,
    }
}

pub fn global(value: impl Into<String>) -> ExportedEnvEntry {
    ExportedEnvEntry {
        value: value.into(),
        scope: EnvScope::Global,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest_with_build_env(pairs: &[(&str, &str)]) -> BuildManifest {
        BuildManifest {
            build_env: pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn build_env_override_diff_semantics() {
        // Scenario 3: starting {A: "1", B: "2"}, remove B, add C, update A.
        let manifest = manifest_with_build_env(&[("A", "1"), ("B", "2")]);

        let over = BuildOverride {
            build_env_override: Some(MapDiff {
                remove: vec!["B".to_string()],
                add: BTreeMap::from([("C".to_string(), "3".to_string())]),
                update: BTreeMap::from([("A".to_string(), "1b".to_string())]),
            }),
            ..Default::default()
        };

        let result = apply(manifest, over);

        assert_eq!(
            result.build_env,
            BTreeMap::from([("A".to_string(), "1b".to_string()), ("C".to_string(), "3".to_string())])
        );
    }

    #[test]
    fn idempotent_for_disjoint_keys_applied_twice() {
        let manifest = manifest_with_build_env(&[("A", "1")]);
        let over = BuildOverride {
            build_env_override: Some(MapDiff {
                remove: vec![],
                add: BTreeMap::from([("B".to_string(), "2".to_string())]),
                update: BTreeMap::new(),
            }),
            ..Default::default()
        };

        let once = apply(manifest.clone(), over.clone());
        let twice = apply(once.clone(), over);
        assert_eq!(once, twice);
    }

    #[test]
    fn wholesale_replace_wins_over_prior_env() {
        let manifest = manifest_with_build_env(&[("A", "1")]);
        let over = BuildOverride {
            build_env: Some(BTreeMap::from([("Z".to_string(), "9".to_string())])),
            ..Default::default()
        };

        let result = apply(manifest, over);
        assert_eq!(result.build_env, BTreeMap::from([("Z".to_string(), "9".to_string())]));
    }
}
