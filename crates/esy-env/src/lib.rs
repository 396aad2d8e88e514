//! Environment Composer (§4.5): expands `$name`/`${name}` references against
//! earlier bindings in insertion order, producing a closed environment that
//! never points outside itself.

use std::fmt::Write as _;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("unknown environment reference ${name} in binding {binding}")]
pub struct UnknownEnvRef {
    pub name: String,
    pub binding: String,
}

/// An environment whose every value has already been expanded against
/// earlier bindings. Order-preserving: iteration order is insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClosedEnv(Vec<(String, String)>);

impl ClosedEnv {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn set(&mut self, name: String, value: String) {
        if let Some(entry) = self.0.iter_mut().find(|(k, _)| *k == name) {
            entry.1 = value;
        } else {
            self.0.push((name, value));
        }
    }

    fn cons_path(&mut self, name: String, value: String) {
        match self.0.iter_mut().find(|(k, _)| *k == name) {
            Some(entry) => entry.1 = format!("{value}:{}", entry.1),
            None => self.0.push((name, value)),
        }
    }

    /// Render as a sourceable shell script, `export NAME="value"` per line,
    /// preceded by a header comment.
    pub fn render_shell(&self) -> String {
        let mut out = String::from("# Generated by the esy build core. Do not edit by hand.\n");
        for (name, value) in &self.0 {
            let escaped = value.replace('\\', "\\\\").replace('"', "\\\"").replace('$', "\\$");
            let _ = writeln!(out, "export {name}=\"{escaped}\"");
        }
        out
    }

    /// Render as pretty-printed JSON `{name: expanded-value}`.
    pub fn render_json(&self) -> String {
        let map: serde_json::Map<String, serde_json::Value> = self
            .0
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
            .collect();
        serde_json::to_string_pretty(&serde_json::Value::Object(map)).expect("map of strings always serializes")
    }
}

/// The minimal platform environment a sandbox-env is seeded with before any
/// package's exports are layered on top: `PATH`, `SHELL`, `HOME` as supplied
/// by the host process, falling back to conservative defaults when unset.
pub fn platform_defaults() -> Vec<(String, String)> {
    let path = std::env::var("PATH").unwrap_or_else(|_| "/usr/bin:/bin".to_string());
    let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string());
    let home = std::env::var("HOME").unwrap_or_else(|_| "/root".to_string());
    vec![("PATH".to_string(), path), ("SHELL".to_string(), shell), ("HOME".to_string(), home)]
}

/// Compose a closed environment from `bindings`, given in the order later
/// values may reference earlier ones. `PATH` uses cons semantics: each
/// later `PATH` binding is prepended to, not replacing, the one before it.
pub fn compose(bindings: impl IntoIterator<Item = (String, String)>) -> Result<ClosedEnv, UnknownEnvRef> {
    let mut closed = ClosedEnv::default();

    for (name, raw_value) in bindings {
        let expanded = expand(&raw_value, &closed, &name)?;
        if name == "PATH" {
            closed.cons_path(name, expanded);
        } else {
            closed.set(name, expanded);
        }
    }

    Ok(closed)
}

/// Expand `$name`/`${name}` references in `value` against `closed`'s
/// bindings so far. `binding` names the binding being expanded, for error
/// reporting.
fn expand(value: &str, closed: &ClosedEnv, binding: &str) -> Result<String, UnknownEnvRef> {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.char_indices().peekable();

    while let Some((idx, ch)) = chars.next() {
        if ch != '$' {
            out.push(ch);
            continue;
        }

        let rest = &value[idx + 1..];
        let (name, consumed) = if let Some(stripped) = rest.strip_prefix('{') {
            match stripped.find('}') {
                Some(end) => (&stripped[..end], end + 2),
                None => {
                    out.push('$');
                    continue;
                }
            }
        } else {
            let end = rest.find(|c: char| !(c.is_alphanumeric() || c == '_')).unwrap_or(rest.len());
            if end == 0 {
                out.push('$');
                continue;
            }
            (&rest[..end], end)
        };

        let resolved = closed.get(name).ok_or_else(|| UnknownEnvRef {
            name: name.to_string(),
            binding: binding.to_string(),
        })?;
        out.push_str(resolved);

        for _ in 0..consumed {
            chars.next();
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_against_earlier_bindings() {
        let env = compose([("A".to_string(), "1".to_string()), ("B".to_string(), "$A-2".to_string())]).unwrap();
        assert_eq!(env.get("B"), Some("1-2"));
    }

    #[test]
    fn braced_reference() {
        let env = compose([("A".to_string(), "1".to_string()), ("B".to_string(), "${A}x".to_string())]).unwrap();
        assert_eq!(env.get("B"), Some("1x"));
    }

    #[test]
    fn unresolved_reference_is_an_error() {
        let err = compose([("B".to_string(), "$MISSING".to_string())]).unwrap_err();
        assert_eq!(err.name, "MISSING");
        assert_eq!(err.binding, "B");
    }

    #[test]
    fn path_uses_cons_semantics() {
        let env = compose([
            ("PATH".to_string(), "/usr/bin".to_string()),
            ("PATH".to_string(), "/opt/bin".to_string()),
        ])
        .unwrap();
        assert_eq!(env.get("PATH"), Some("/opt/bin:/usr/bin"));
    }

    #[test]
    fn closure_never_references_a_name_not_present() {
        // Invariant 4: every reference that survives closing resolves.
        let env = compose([("A".to_string(), "1".to_string()), ("B".to_string(), "$A".to_string())]).unwrap();
        for (_, value) in env.iter() {
            assert!(!value.contains('$'));
        }
    }

    #[test]
    fn platform_defaults_are_never_empty() {
        let defaults = platform_defaults();
        assert!(defaults.iter().any(|(name, _)| name == "PATH"));
        assert!(defaults.iter().any(|(name, _)| name == "HOME"));
    }

    #[test]
    fn closing_twice_is_idempotent() {
        let once = compose([("A".to_string(), "1".to_string()), ("B".to_string(), "$A".to_string())]).unwrap();
        let twice = compose(once.iter().map(|(k, v)| (k.to_string(), v.to_string()))).unwrap();
        assert_eq!(once, twice);
    }
}
