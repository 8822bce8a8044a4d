use std::sync::OnceLock;

use regex::{Captures, Regex};

/// Expand `{{ env.VAR }}` and `{{ env.VAR | default("x") }}` placeholders
///
/// Runs on the raw TOML text before deserialization. Comment lines are
/// copied verbatim so commented-out secrets never need to be set.
pub(crate) fn expand_env(input: &str) -> Result<String, String> {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    let placeholder = PLACEHOLDER.get_or_init(|| {
        Regex::new(r#"\{\{\s*([A-Za-z0-9_.]+)\s*(?:\|\s*default\("([^"]*)"\))?\s*\}\}"#).expect("must be valid regex")
    });

    let lines = input
        .split_inclusive('\n')
        .map(|line| {
            if line.trim_start().starts_with('#') {
                Ok(line.to_owned())
            } else {
                expand_line(placeholder, line)
            }
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(lines.concat())
}

fn expand_line(placeholder: &Regex, line: &str) -> Result<String, String> {
    let mut failure = None;

    let expanded = placeholder.replace_all(line, |caps: &Captures<'_>| {
        let reference = &caps[1];
        let fallback = caps.get(2).map(|m| m.as_str());

        match resolve(reference, fallback) {
            Ok(value) => value,
            Err(e) => {
                failure.get_or_insert(e);
                String::new()
            }
        }
    });

    match failure {
        Some(e) => Err(e),
        None => Ok(expanded.into_owned()),
    }
}

fn resolve(reference: &str, fallback: Option<&str>) -> Result<String, String> {
    let Some(var) = reference.strip_prefix("env.").filter(|v| !v.is_empty() && !v.contains('.')) else {
        return Err(format!("only variables scoped with 'env.' are supported: `{reference}`"));
    };

    std::env::var(var)
        .ok()
        .or_else(|| fallback.map(str::to_owned))
        .ok_or_else(|| format!("environment variable not found: `{var}`"))
}
