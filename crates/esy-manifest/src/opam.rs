//! A pragmatic subset of the opam file format: enough to read `name`,
//! `version`, `build`, `install`, `patches`, and `substs` fields out of a
//! real-world opam file. Unknown fields are parsed structurally and
//! discarded; this is not a full opam-syntax implementation.

use nom::{
    IResult,
    branch::alt,
    bytes::complete::{is_not, take_till, take_while1},
    character::complete::{char, multispace0},
    combinator::{map, opt, recognize},
    multi::many0,
    sequence::delimited,
};

use crate::manifest::{BuildManifest, BuildType, Commands, Patch, Version};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Value {
    Str(String),
    List(Vec<Value>),
    /// A value with a trailing `{ ... }` filter annotation; the filter text
    /// is preserved verbatim (§4.1's "filter preserved").
    Filtered(Box<Value>, String),
}

impl Value {
    fn as_string(&self) -> Option<String> {
        match self {
            Value::Str(s) => Some(s.clone()),
            Value::Filtered(inner, _) => inner.as_string(),
            Value::List(_) => None,
        }
    }

    fn filter(&self) -> Option<String> {
        match self {
            Value::Filtered(_, f) => Some(f.clone()),
            _ => None,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct OpamFile {
    pub name: Option<String>,
    pub version: Option<String>,
    pub build: Vec<Vec<String>>,
    pub install: Vec<Vec<String>>,
    pub patches: Vec<(String, Option<String>)>,
    pub substs: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
#[error("malformed opam file")]
pub struct ParseError;

pub fn parse(input: &str) -> Result<OpamFile, ParseError> {
    let (_, fields) = file(input).map_err(|_| ParseError)?;

    let mut opam = OpamFile::default();
    for (key, value) in fields {
        match key.as_str() {
            "name" => opam.name = value.as_string(),
            "version" => opam.version = value.as_string(),
            "build" => opam.build = commands(&value),
            "install" => opam.install = commands(&value),
            "patches" => opam.patches = patches(&value),
            "substs" => opam.substs = strings(&value),
            _ => {}
        }
    }
    Ok(opam)
}

fn commands(value: &Value) -> Vec<Vec<String>> {
    let Value::List(items) = unwrap_filter(value) else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| match unwrap_filter(item) {
            Value::List(tokens) => Some(tokens.iter().filter_map(Value::as_string).collect()),
            Value::Str(s) => Some(vec![s.clone()]),
            Value::Filtered(..) => None,
        })
        .collect()
}

fn patches(value: &Value) -> Vec<(String, Option<String>)> {
    let Value::List(items) = unwrap_filter(value) else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| item.as_string().map(|path| (path, item.filter())))
        .collect()
}

fn strings(value: &Value) -> Vec<String> {
    let Value::List(items) = unwrap_filter(value) else {
        return Vec::new();
    };
    items.iter().filter_map(Value::as_string).collect()
}

fn unwrap_filter(value: &Value) -> &Value {
    match value {
        Value::Filtered(inner, _) => unwrap_filter(inner),
        other => other,
    }
}

/// Map a parsed [`OpamFile`] to a normalized [`BuildManifest`] (§4.1).
pub fn to_manifest(opam: OpamFile) -> BuildManifest {
    BuildManifest {
        name: opam.name,
        version: opam.version.map(Version::Opam),
        build_type: BuildType::InSource,
        build: (!opam.build.is_empty()).then(|| Commands::Opam(opam.build)),
        install: (!opam.install.is_empty()).then(|| Commands::Opam(opam.install)),
        build_dev: None,
        exported_env: Default::default(),
        build_env: Default::default(),
        patches: opam
            .patches
            .into_iter()
            .map(|(path, filter)| Patch { path: path.into(), filter })
            .collect(),
        substs: opam.substs.into_iter().map(Into::into).collect(),
    }
}

// --- nom grammar ---

fn surrounded_by_space(input: &str) -> IResult<&str, &str> {
    multispace0(input)
}

fn quoted_string(input: &str) -> IResult<&str, String> {
    let (input, s) = delimited(char('"'), opt(is_not("\"")), char('"'))(input)?;
    Ok((input, s.unwrap_or_default().to_string()))
}

fn ident(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_alphanumeric() || "_-./:+".contains(c))(input)
}

fn filter_annotation(input: &str) -> IResult<&str, String> {
    map(delimited(char('{'), recognize(is_not("}")), char('}')), |s: &str| {
        s.trim().to_string()
    })(input)
}

fn bare_value(input: &str) -> IResult<&str, Value> {
    alt((map(quoted_string, Value::Str), map(ident, |s| Value::Str(s.to_string())), list))(input)
}

fn item(input: &str) -> IResult<&str, Value> {
    let (input, _) = surrounded_by_space(input)?;
    let (input, value) = bare_value(input)?;
    let (input, _) = surrounded_by_space(input)?;
    let (input, filter) = opt(filter_annotation)(input)?;
    let (input, _) = surrounded_by_space(input)?;
    Ok((
        input,
        match filter {
            Some(f) => Value::Filtered(Box::new(value), f),
            None => value,
        },
    ))
}

fn list(input: &str) -> IResult<&str, Value> {
    map(delimited(char('['), many0(item), char(']')), Value::List)(input)
}

fn field(input: &str) -> IResult<&str, (String, Value)> {
    let (input, _) = multispace0(input)?;
    let (input, key) = take_till(|c| c == ':')(input)?;
    let (input, _) = char(':')(input)?;
    let (input, value) = item(input)?;
    Ok((input, (key.trim().to_string(), value)))
}

fn file(input: &str) -> IResult<&str, Vec<(String, Value)>> {
    let (input, fields) = many0(field)(input)?;
    let (input, _) = multispace0(input)?;
    Ok((input, fields))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_fields() {
        let input = r#"
opam-version: "2.0"
name: "foo"
version: "1.0"
build: [
  ["./configure"]
  [make]
]
install: [
  [make "install"]
]
patches: ["fix.patch" {os = "linux"} "other.patch"]
substs: ["foo.ml"]
"#;
        let opam = parse(input).unwrap();
        assert_eq!(opam.name.as_deref(), Some("foo"));
        assert_eq!(opam.version.as_deref(), Some("1.0"));
        assert_eq!(opam.build, vec![vec!["./configure".to_string()], vec!["make".to_string()]]);
        assert_eq!(opam.install, vec![vec!["make".to_string(), "install".to_string()]]);
        assert_eq!(opam.patches[0].0, "fix.patch");
        assert!(opam.patches[0].1.is_some());
        assert_eq!(opam.patches[1].1, None);
        assert_eq!(opam.substs, vec!["foo.ml".to_string()]);
    }

    #[test]
    fn opam_scope_coercion() {
        // Scenario 2
        let mut manifest = to_manifest(OpamFile {
            name: Some("foo".to_string()),
            ..Default::default()
        });
        manifest = manifest.scope_opam_name();
        assert_eq!(manifest.name.as_deref(), Some("@opam/foo"));

        let mut already_scoped = to_manifest(OpamFile {
            name: Some("@opam/foo".to_string()),
            ..Default::default()
        });
        already_scoped = already_scoped.scope_opam_name();
        assert_eq!(already_scoped.name.as_deref(), Some("@opam/foo"));
    }
}
