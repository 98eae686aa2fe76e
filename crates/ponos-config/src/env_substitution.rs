use once_cell::sync::Lazy;
use ponos_core::{PonosError, Result};
use regex::Regex;
use serde_json::Value;

// ${VAR} and ${VAR:-default}
static ENV_VAR_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}").expect("Invalid regex pattern")
});

/// Recursively substitute environment variables in every string of a value.
pub fn substitute_env_vars(value: &mut Value) -> Result<()> {
    substitute_with(value, &|name| std::env::var(name).ok())
}

/// Same as [`substitute_env_vars`] but resolves names through `lookup`.
pub fn substitute_with(value: &mut Value, lookup: &dyn Fn(&str) -> Option<String>) -> Result<()> {
    let mut missing = Vec::new();
    walk(value, lookup, &mut missing);

    if !missing.is_empty() {
        missing.sort();
        missing.dedup();
        return Err(PonosError::ConfigError(format!(
            "Missing required environment variables: {}",
            missing.join(", ")
        )));
    }
    Ok(())
}

fn walk(value: &mut Value, lookup: &dyn Fn(&str) -> Option<String>, missing: &mut Vec<String>) {
    match value {
        Value::String(s) => {
            *s = substitute_in_string(s, lookup, missing);
        }
        Value::Object(map) => {
            for (_, v) in map.iter_mut() {
                walk(v, lookup, missing);
            }
        }
        Value::Array(arr) => {
            for v in arr.iter_mut() {
                walk(v, lookup, missing);
            }
        }
        _ => {}
    }
}

fn substitute_in_string(
    input: &str,
    lookup: &dyn Fn(&str) -> Option<String>,
    missing: &mut Vec<String>,
) -> String {
    ENV_VAR_REGEX
        .replace_all(input, |caps: &regex::Captures<'_>| {
            let name = &caps[1];
            match lookup(name) {
                Some(value) => value,
                None => match caps.get(2) {
                    Some(default) => default.as_str().to_string(),
                    None => {
                        missing.push(name.to_string());
                        String::new()
                    }
                },
            }
        })
        .into_owned()
}
