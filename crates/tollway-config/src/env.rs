use std::sync::OnceLock;

use regex::{Captures, Regex};

/// Matches `{{ env.NAME }}` and `{{ env.NAME | default("value") }}`
fn placeholder() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"\{\{\s*([A-Za-z0-9_.]+)\s*(?:\|\s*default\("([^"]*)"\))?\s*\}\}"#).expect("must be valid regex")
    })
}

/// Substitute environment placeholders in raw config text
///
/// Runs before TOML parsing so secrets such as refresh tokens and the
/// database URL never have to live in the file. Comment lines are left
/// untouched so a commented-out placeholder cannot fail the load.
pub fn expand_env(input: &str) -> Result<String, String> {
    let mut lines = Vec::new();

    for line in input.split('\n') {
        if line.trim_start().starts_with('#') {
            lines.push(line.to_string());
            continue;
        }

        let mut failure = None;
        let expanded = placeholder().replace_all(line, |caps: &Captures<'_>| match resolve(caps) {
            Ok(value) => value,
            Err(e) => {
                failure.get_or_insert(e);
                String::new()
            }
        });

        if let Some(e) = failure {
            return Err(e);
        }

        lines.push(expanded.into_owned());
    }

    Ok(lines.join("\n"))
}

fn resolve(caps: &Captures<'_>) -> Result<String, String> {
    let key = &caps[1];
    let fallback = caps.get(2).map(|m| m.as_str());

    let Some(name) = key.strip_prefix("env.").filter(|name| !name.contains('.')) else {
        return Err(format!("only variables scoped with 'env.' are supported: `{key}`"));
    };

    match (std::env::var(name), fallback) {
        (Ok(value), _) => Ok(value),
        (Err(_), Some(fallback)) => Ok(fallback.to_string()),
        (Err(_), None) => Err(format!("environment variable not found: `{name}`")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_without_placeholders_is_unchanged() {
        let input = "[ledger]\ntimezone = \"UTC\"\n";
        assert_eq!(expand_env(input).unwrap(), input);
    }

    #[test]
    fn substitutes_variables() {
        temp_env::with_vars([("TW_DB", Some("postgres://db")), ("TW_TOKEN", Some("rt-1"))], || {
            let result = expand_env("url = \"{{ env.TW_DB }}\"\ntoken = \"{{env.TW_TOKEN}}\"").unwrap();
            assert_eq!(result, "url = \"postgres://db\"\ntoken = \"rt-1\"");
        });
    }

    #[test]
    fn missing_variable_is_an_error() {
        temp_env::with_var_unset("TW_MISSING", || {
            let err = expand_env("token = \"{{ env.TW_MISSING }}\"").unwrap_err();
            assert!(err.contains("TW_MISSING"));
        });
    }

    #[test]
    fn default_applies_only_when_unset() {
        temp_env::with_var_unset("TW_OPTIONAL", || {
            let result = expand_env("x = \"{{ env.TW_OPTIONAL | default(\"fallback\") }}\"").unwrap();
            assert_eq!(result, "x = \"fallback\"");
        });
        temp_env::with_var("TW_OPTIONAL", Some("set"), || {
            let result = expand_env("x = \"{{ env.TW_OPTIONAL | default(\"fallback\") }}\"").unwrap();
            assert_eq!(result, "x = \"set\"");
        });
    }

    #[test]
    fn rejects_other_scopes() {
        let err = expand_env("x = \"{{ vault.SECRET }}\"").unwrap_err();
        assert!(err.contains("only variables scoped with 'env.'"));
    }

    #[test]
    fn comment_lines_are_not_expanded() {
        temp_env::with_var_unset("TW_MISSING", || {
            let input = "  # token = \"{{ env.TW_MISSING }}\"\nname = \"a\"";
            assert_eq!(expand_env(input).unwrap(), input);
        });
    }
}
