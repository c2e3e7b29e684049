//! Database location resolution

use crate::error::{MemoryError, Result};
use std::path::{Path, PathBuf};

/// Override value that selects a private in-memory database.
pub const IN_MEMORY: &str = ":memory:";

const APP_DIR: &str = "magpie";
const DB_FILE: &str = "memory.db";

/// Where the store lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DbLocation {
    InMemory,
    File(PathBuf),
}

impl DbLocation {
    pub fn is_in_memory(&self) -> bool {
        matches!(self, DbLocation::InMemory)
    }
}

impl std::fmt::Display for DbLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DbLocation::InMemory => write!(f, "{IN_MEMORY}"),
            DbLocation::File(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Resolve the database location from an optional override.
///
/// Without an override the XDG data home is used, falling back to
/// `~/.local/share`.
pub fn resolve_db_path(override_path: Option<&str>) -> Result<DbLocation> {
    match override_path.map(str::trim).filter(|p| !p.is_empty()) {
        Some(IN_MEMORY) => Ok(DbLocation::InMemory),
        Some(raw) => Ok(DbLocation::File(absolutize(&expand(raw)?)?)),
        None => Ok(DbLocation::File(default_db_path()?)),
    }
}

fn default_db_path() -> Result<PathBuf> {
    let data_home = match std::env::var("XDG_DATA_HOME") {
        Ok(dir) if !dir.trim().is_empty() => absolutize(&expand(&dir)?)?,
        _ => home_dir()?.join(".local").join("share"),
    };
    Ok(data_home.join(APP_DIR).join(DB_FILE))
}

fn home_dir() -> Result<PathBuf> {
    directories::BaseDirs::new()
        .map(|d| d.home_dir().to_path_buf())
        .ok_or_else(|| MemoryError::Configuration("cannot determine home directory".into()))
}

/// Expand a leading `~` and `$VAR` / `${VAR}` references.
fn expand(raw: &str) -> Result<PathBuf> {
    let substituted = substitute_env(raw);
    if substituted == "~" {
        return home_dir();
    }
    if let Some(rest) = substituted.strip_prefix("~/") {
        return Ok(home_dir()?.join(rest));
    }
    Ok(PathBuf::from(substituted))
}

fn absolutize(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    Ok(std::env::current_dir()?.join(path))
}

/// Replace `$VAR` and `${VAR}` with environment values.
///
/// Unresolvable variables are left as-is.
fn substitute_env(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch != '$' {
            result.push(ch);
            continue;
        }

        let braced = chars.peek() == Some(&'{');
        if braced {
            chars.next();
        }

        let mut name = String::new();
        let mut closed = !braced;
        while let Some(&c) = chars.peek() {
            if braced && c == '}' {
                chars.next();
                closed = true;
                break;
            }
            if !braced && !(c.is_ascii_alphanumeric() || c == '_') {
                break;
            }
            name.push(c);
            chars.next();
        }

        let value = if closed && !name.is_empty() {
            std::env::var(&name).ok()
        } else {
            None
        };

        match value {
            Some(v) => result.push_str(&v),
            None => {
                result.push('$');
                if braced {
                    result.push('{');
                }
                result.push_str(&name);
                if braced && closed {
                    result.push('}');
                }
            }
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_sentinel() {
        assert_eq!(resolve_db_path(Some(":memory:")).unwrap(), DbLocation::InMemory);
        assert!(resolve_db_path(Some(" :memory: ")).unwrap().is_in_memory());
    }

    #[test]
    fn explicit_absolute_path_is_kept() {
        let loc = resolve_db_path(Some("/tmp/magpie-test/mem.db")).unwrap();
        assert_eq!(loc, DbLocation::File(PathBuf::from("/tmp/magpie-test/mem.db")));
    }

    #[test]
    fn relative_path_becomes_absolute() {
        match resolve_db_path(Some("data/mem.db")).unwrap() {
            DbLocation::File(path) => {
                assert!(path.is_absolute());
                assert!(path.ends_with("data/mem.db"));
            }
            other => panic!("unexpected location {other:?}"),
        }
    }

    #[test]
    fn tilde_expands_to_home() {
        let home = home_dir().unwrap();
        let loc = resolve_db_path(Some("~/notes/mem.db")).unwrap();
        assert_eq!(loc, DbLocation::File(home.join("notes/mem.db")));
    }

    #[test]
    fn substitutes_braced_and_bare_vars() {
        std::env::set_var("MAGPIE_TEST_DIR", "/srv/agent");
        assert_eq!(substitute_env("${MAGPIE_TEST_DIR}/mem.db"), "/srv/agent/mem.db");
        assert_eq!(substitute_env("$MAGPIE_TEST_DIR/mem.db"), "/srv/agent/mem.db");
        std::env::remove_var("MAGPIE_TEST_DIR");
    }

    #[test]
    fn leaves_unknown_and_malformed_vars() {
        assert_eq!(substitute_env("${MAGPIE_NONEXISTENT_XYZ}/a"), "${MAGPIE_NONEXISTENT_XYZ}/a");
        assert_eq!(substitute_env("$MAGPIE_NONEXISTENT_XYZ"), "$MAGPIE_NONEXISTENT_XYZ");
        assert_eq!(substitute_env("${unterminated"), "${unterminated");
        assert_eq!(substitute_env("cost $5"), "cost $5");
    }

    #[test]
    fn default_path_ends_with_app_db() {
        let path = default_db_path().unwrap();
        assert!(path.is_absolute());
        assert!(path.ends_with("magpie/memory.db"));
    }
}
