use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::schema::FerryConfig;

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &["ferry.toml"];

/// Load config from the given path.
pub fn load_config(path: &Path) -> anyhow::Result<FerryConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    let raw = substitute_env(&raw);
    let cfg: FerryConfig =
        toml::from_str(&raw).map_err(|e| anyhow::anyhow!("parse {}: {e}", path.display()))?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Discover and load config from standard locations.
///
/// Search order:
/// 1. `./ferry.toml` (project-local)
/// 2. `~/.config/ferry/ferry.toml` (user-global)
///
/// Returns `FerryConfig::default()` if no config file is found.
pub fn discover_and_load(explicit: Option<&Path>) -> anyhow::Result<FerryConfig> {
    if let Some(path) = explicit {
        return load_config(path);
    }
    if let Some(path) = find_config_file() {
        debug!(path = %path.display(), "loading config");
        return load_config(&path);
    }
    debug!("no config file found, using defaults");
    Ok(FerryConfig::default())
}

fn find_config_file() -> Option<PathBuf> {
    for name in CONFIG_FILENAMES {
        let p = PathBuf::from(name);
        if p.exists() {
            return Some(p);
        }
    }

    if let Some(dirs) = directories::ProjectDirs::from("", "", "ferry") {
        let config_dir = dirs.config_dir();
        for name in CONFIG_FILENAMES {
            let p = config_dir.join(name);
            if p.exists() {
                return Some(p);
            }
        }
    }

    None
}

/// Reject configs the gateway cannot start with.
fn validate(cfg: &FerryConfig) -> anyhow::Result<()> {
    let mut seen = std::collections::HashSet::new();
    for account in &cfg.accounts {
        if account.id.is_empty() {
            anyhow::bail!("account with empty id");
        }
        if account.base_url.is_empty() {
            anyhow::bail!("account {}: base_url is required", account.id);
        }
        if !seen.insert(account.id.as_str()) {
            anyhow::bail!("duplicate account id {}", account.id);
        }
    }

    let mut keys = std::collections::HashSet::new();
    for entry in &cfg.api_keys {
        if entry.key.is_empty() || entry.user_id.is_empty() {
            anyhow::bail!("api key entries require both key and user_id");
        }
        if !keys.insert(entry.key.as_str()) {
            warn!(user_id = %entry.user_id, "duplicate api key entry, keeping the first");
        }
    }

    Ok(())
}

/// Replace `${ENV_VAR}` placeholders in config string values.
///
/// Unresolvable variables are left as-is.
#[must_use]
pub fn substitute_env(input: &str) -> String {
    substitute_env_with(input, |name| std::env::var(name).ok())
}

fn substitute_env_with(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            let mut closed = false;
            for c in chars.by_ref() {
                if c == '}' {
                    closed = true;
                    break;
                }
                var_name.push(c);
            }
            if closed && !var_name.is_empty() {
                match lookup(&var_name) {
                    Some(val) => result.push_str(&val),
                    None => {
                        // Leave unresolved placeholder as-is.
                        result.push_str("${");
                        result.push_str(&var_name);
                        result.push('}');
                    },
                }
            } else {
                // Malformed, emit literal.
                result.push_str("${");
                result.push_str(&var_name);
            }
        } else {
            result.push(ch);
        }
    }

    result
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_known_var() {
        let lookup = |name: &str| match name {
            "FERRY_TEST_KEY" => Some("sk-resolved".to_string()),
            _ => None,
        };
        assert_eq!(
            substitute_env_with("api_key = \"${FERRY_TEST_KEY}\"", lookup),
            "api_key = \"sk-resolved\""
        );
    }

    #[test]
    fn leaves_unknown_var_in_place() {
        let lookup = |_: &str| None;
        assert_eq!(
            substitute_env_with("key = \"${NOPE}\"", lookup),
            "key = \"${NOPE}\""
        );
    }

    #[test]
    fn loads_file_with_env_substitution() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ferry.toml");
        std::fs::write(
            &path,
            r#"
            [[accounts]]
            id = "a"
            api_key = "sk-static"
            base_url = "https://upstream.example"
            "#,
        )
        .unwrap();
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.accounts[0].id, "a");
    }

    #[test]
    fn rejects_duplicate_account_ids() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ferry.toml");
        std::fs::write(
            &path,
            r#"
            [[accounts]]
            id = "a"
            api_key = "k1"
            base_url = "https://one.example"

            [[accounts]]
            id = "a"
            api_key = "k2"
            base_url = "https://two.example"
            "#,
        )
        .unwrap();
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn rejects_missing_base_url() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ferry.toml");
        std::fs::write(
            &path,
            r#"
            [[accounts]]
            id = "a"
            api_key = "k1"
            "#,
        )
        .unwrap();
        assert!(load_config(&path).is_err());
    }
}
