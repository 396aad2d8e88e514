use std::collections::BTreeMap;

use serde::Deserialize;

use crate::manifest::{BuildManifest, BuildType, Commands, EnvScope, ExportedEnvEntry};

#[derive(Debug, Deserialize)]
struct RawFile {
    name: Option<String>,
    version: Option<String>,
    esy: Option<RawEsySection>,
}

#[derive(Debug, Default, Deserialize)]
struct RawEsySection {
    #[serde(rename = "buildsInSource", default, deserialize_with = "deserialize_build_type_flag")]
    build_type: Option<BuildType>,
    #[serde(default)]
    build: Option<Vec<CommandSpec>>,
    #[serde(default)]
    install: Option<Vec<CommandSpec>>,
    #[serde(rename = "buildDev", default)]
    build_dev: Option<Vec<CommandSpec>>,
    #[serde(rename = "buildEnv", default)]
    build_env: BTreeMap<String, String>,
    #[serde(rename = "exportedEnv", default)]
    exported_env: BTreeMap<String, RawExportedEnv>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CommandSpec {
    Line(String),
    Argv(Vec<String>),
}

impl CommandSpec {
    fn into_argv(self) -> Vec<String> {
        match self {
            CommandSpec::Line(line) => vec![line],
            CommandSpec::Argv(argv) => argv,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawExportedEnv {
    Plain(String),
    Detailed {
        val: String,
        #[serde(default)]
        scope: Option<String>,
    },
}

fn deserialize_build_type_flag<'de, D>(deserializer: D) -> Result<Option<BuildType>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw: Option<serde_json::Value> = Option::deserialize(deserializer)?;
    Ok(raw.map(|v| match v.as_str() {
        Some("unsafe") => BuildType::Unsafe,
        Some("_build") | Some("jbuilder") => BuildType::JbuilderLike,
        _ => BuildType::OutOfSource,
    }))
}

/// Parse an `esy.json`/`package.json` document's `"esy"` section into a
/// [`BuildManifest`]. Returns `None` when the document has no `"esy"` key.
pub fn parse(bytes: &[u8], name_fallback: Option<&str>) -> Result<Option<BuildManifest>, serde_json::Error> {
    let raw: RawFile = serde_json::from_slice(bytes)?;

    let Some(esy) = raw.esy else {
        return Ok(None);
    };

    let name = raw.name.or_else(|| name_fallback.map(str::to_owned));
    let version = raw.version.map(crate::manifest::Version::Npm);

    let exported_env = esy
        .exported_env
        .into_iter()
        .map(|(name, raw)| {
            let entry = match raw {
                RawExportedEnv::Plain(value) => ExportedEnvEntry {
                    value,
                    scope: EnvScope::Local,
                },
                RawExportedEnv::Detailed { val, scope } => ExportedEnvEntry {
                    value: val,
                    scope: match scope.as_deref() {
                        Some("global") => EnvScope::Global,
                        _ => EnvScope::Local,
                    },
                },
            };
            (name, entry)
        })
        .collect();

    Ok(Some(BuildManifest {
        name,
        version,
        // Missing buildType defaults to OutOfSource (§4.1).
        build_type: esy.build_type.unwrap_or(BuildType::OutOfSource),
        build: esy.build.map(|cmds| Commands::Esy(cmds.into_iter().map(CommandSpec::into_argv).collect())),
        install: esy.install.map(|cmds| Commands::Esy(cmds.into_iter().map(CommandSpec::into_argv).collect())),
        build_dev: esy
            .build_dev
            .map(|cmds| Commands::Esy(cmds.into_iter().map(CommandSpec::into_argv).collect())),
        exported_env,
        build_env: esy.build_env,
        patches: Vec::new(),
        substs: Vec::new(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn singleton_esy_manifest() {
        // Scenario 1: {"esy":{"build":["echo hi"]}}
        let manifest = parse(br#"{"esy":{"build":["echo hi"]}}"#, None).unwrap().unwrap();
        assert_eq!(manifest.build, Some(Commands::Esy(vec![vec!["echo hi".to_string()]])));
        assert_eq!(manifest.build_type, BuildType::OutOfSource);
        assert!(manifest.exported_env.is_empty());
        assert!(manifest.build_env.is_empty());
    }

    #[test]
    fn absent_esy_section_yields_none() {
        let manifest = parse(br#"{"name":"foo"}"#, None).unwrap();
        assert!(manifest.is_none());
    }

    #[test]
    fn exported_env_scope_parsing() {
        let manifest = parse(
            br#"{"esy":{"exportedEnv":{"X":{"val":"1","scope":"global"},"Y":"2"}}}"#,
            None,
        )
        .unwrap()
        .unwrap();
        assert_eq!(manifest.exported_env["X"].scope, EnvScope::Global);
        assert_eq!(manifest.exported_env["Y"].scope, EnvScope::Local);
    }
}
