//! Environment files and variable interpolation

use crate::error::{DeployError, Result};
use regex::{Captures, Regex};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::OnceLock;

/// Variables available for interpolation
pub type EnvMap = BTreeMap<String, String>;

/// Read a `KEY=VALUE` env file
///
/// Blank lines and `#` comments are skipped, an optional `export ` prefix is
/// accepted and surrounding single or double quotes are stripped.
pub fn load_env_file(path: &Path) -> Result<EnvMap> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        DeployError::MalformedDescriptor(format!(
            "Failed to read env file {}: {}",
            path.display(),
            e
        ))
    })?;
    parse_env(&content).map_err(|msg| {
        DeployError::MalformedDescriptor(format!("{}: {}", path.display(), msg))
    })
}

/// Parse env file content
pub fn parse_env(content: &str) -> std::result::Result<EnvMap, String> {
    let mut env = EnvMap::new();

    for (lineno, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, value)) = line.split_once('=') else {
            return Err(format!("line {}: expected KEY=VALUE", lineno + 1));
        };
        let key = key.trim();
        if key.is_empty() {
            return Err(format!("line {}: empty variable name", lineno + 1));
        }
        env.insert(key.to_string(), unquote(value.trim()).to_string());
    }

    Ok(env)
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

fn pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"\$(?:(\$)|\{([A-Za-z_][A-Za-z0-9_]*)(?:(:?[-?])([^}]*))?\}|([A-Za-z_][A-Za-z0-9_]*))",
        )
        .expect("interpolation pattern is valid")
    })
}

/// Substitute `$VAR`, `${VAR}`, `${VAR:-default}`, `${VAR-default}`,
/// `${VAR:?message}` and `${VAR?message}`; `$$` yields a literal `$`
///
/// Unset variables without a default become empty strings.
pub fn interpolate(s: &str, env: &EnvMap) -> Result<String> {
    let mut error = None;

    let result = pattern().replace_all(s, |caps: &Captures| {
        if caps.get(1).is_some() {
            return "$".to_string();
        }

        let (name, op, arg) = match caps.get(2) {
            Some(name) => (
                name.as_str(),
                caps.get(3).map(|m| m.as_str()),
                caps.get(4).map_or("", |m| m.as_str()),
            ),
            None => (caps.get(5).map_or("", |m| m.as_str()), None, ""),
        };
        let value = env.get(name);

        match op {
            Some(":-") => match value {
                Some(v) if !v.is_empty() => v.clone(),
                _ => arg.to_string(),
            },
            Some("-") => value.cloned().unwrap_or_else(|| arg.to_string()),
            Some(":?") | Some("?") => {
                let missing = match value {
                    None => true,
                    Some(v) => op == Some(":?") && v.is_empty(),
                };
                if missing {
                    error.get_or_insert_with(|| {
                        DeployError::MalformedDescriptor(format!(
                            "required variable {} is not set: {}",
                            name, arg
                        ))
                    });
                }
                value.cloned().unwrap_or_default()
            }
            _ => value.cloned().unwrap_or_else(|| {
                tracing::warn!("Variable {} is not set, defaulting to a blank string", name);
                String::new()
            }),
        }
    });

    match error {
        Some(e) => Err(e),
        None => Ok(result.into_owned()),
    }
}

/// Interpolate every string scalar (not mapping keys) in a YAML tree
pub fn interpolate_value(value: &mut serde_yaml::Value, env: &EnvMap) -> Result<()> {
    match value {
        serde_yaml::Value::String(s) => {
            *s = interpolate(s, env)?;
        }
        serde_yaml::Value::Sequence(seq) => {
            for item in seq {
                interpolate_value(item, env)?;
            }
        }
        serde_yaml::Value::Mapping(map) => {
            for (_, item) in map.iter_mut() {
                interpolate_value(item, env)?;
            }
        }
        serde_yaml::Value::Tagged(tagged) => interpolate_value(&mut tagged.value, env)?,
        _ => {}
    }
    Ok(())
}
