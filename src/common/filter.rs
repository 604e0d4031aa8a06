//! Table and schema filtering for change events
//!
//! A [`FilterRule`] decides whether a single name (table or schema) should be
//! captured. `CaptureConfig` carries one rule per dimension and requires both
//! to pass before an event reaches the record store.
//!
//! # Example
//!
//! ```rust
//! use auditstream::FilterRule;
//!
//! let tables = FilterRule::one_of(["users", "orders"]);
//! assert!(tables.matches("users"));
//! assert!(!tables.matches("logs"));
//!
//! let schemas = FilterRule::pattern("tenant_*").unwrap();
//! assert!(schemas.matches("tenant_42"));
//! ```

use crate::common::error::{AuditStreamError, Result};
use regex::Regex;
use serde::Deserialize;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// Predicate over a table or schema name.
///
/// The default rule is [`FilterRule::Any`], which matches everything.
#[derive(Clone, Default)]
pub enum FilterRule {
    /// No restriction
    #[default]
    Any,
    /// Exact name match
    Exact(String),
    /// Membership in an allow-list
    OneOf(HashSet<String>),
    /// Glob pattern match (`*` and `?` wildcards)
    Pattern(Regex),
    /// Arbitrary predicate function
    Predicate(Arc<dyn Fn(&str) -> bool + Send + Sync>),
}

impl FilterRule {
    pub fn any() -> Self {
        Self::Any
    }

    pub fn exact(name: impl Into<String>) -> Self {
        Self::Exact(name.into())
    }

    pub fn one_of<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::OneOf(names.into_iter().map(Into::into).collect())
    }

    /// Compile a glob pattern (`*` matches any run, `?` a single character).
    pub fn pattern(glob: &str) -> Result<Self> {
        Ok(Self::Pattern(glob_to_regex(glob)?))
    }

    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        Self::Predicate(Arc::new(f))
    }

    /// Whether `name` passes this rule.
    pub fn matches(&self, name: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Exact(expected) => name == expected,
            Self::OneOf(allowed) => allowed.contains(name),
            Self::Pattern(regex) => regex.is_match(name),
            Self::Predicate(f) => f(name),
        }
    }

    /// True when the rule imposes no restriction.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Any)
    }
}

/// Convert a glob pattern to an anchored regex.
fn glob_to_regex(pattern: &str) -> Result<Regex> {
    let escaped = regex::escape(pattern);
    let regex_pattern = escaped.replace(r"\*", ".*").replace(r"\?", ".");
    Regex::new(&format!("^{}$", regex_pattern))
        .map_err(|e| AuditStreamError::configuration(format!("invalid filter pattern: {e}")))
}

impl fmt::Debug for FilterRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => write!(f, "Any"),
            Self::Exact(name) => f.debug_tuple("Exact").field(name).finish(),
            Self::OneOf(names) => f.debug_tuple("OneOf").field(names).finish(),
            Self::Pattern(regex) => f.debug_tuple("Pattern").field(&regex.as_str()).finish(),
            Self::Predicate(_) => write!(f, "Predicate(..)"),
        }
    }
}

/// Declarative form accepted in configuration files: a single string is an
/// exact match (or a glob when it contains `*` / `?`), a list is an
/// allow-list, absence means no restriction.
impl<'de> Deserialize<'de> for FilterRule {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Spec {
            One(String),
            Many(Vec<String>),
        }

        match Spec::deserialize(deserializer)? {
            Spec::One(name) if name.contains('*') || name.contains('?') => {
                FilterRule::pattern(&name).map_err(serde::de::Error::custom)
            }
            Spec::One(name) => Ok(FilterRule::exact(name)),
            Spec::Many(names) => Ok(FilterRule::one_of(names)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_any_matches_everything() {
        let rule = FilterRule::any();
        assert!(rule.matches("users"));
        assert!(rule.matches(""));
        assert!(rule.is_open());
    }

    #[test]
    fn test_exact_match() {
        let rule = FilterRule::exact("users");
        assert!(rule.matches("users"));
        assert!(!rule.matches("orders"));
        assert!(!rule.matches("Users"));
    }

    #[test]
    fn test_one_of_membership() {
        let rule = FilterRule::one_of(["users", "orders"]);
        assert!(rule.matches("users"));
        assert!(rule.matches("orders"));
        assert!(!rule.matches("logs"));
    }

    #[test]
    fn test_glob_pattern() {
        let rule = FilterRule::pattern("audit_*").unwrap();
        assert!(rule.matches("audit_log"));
        assert!(rule.matches("audit_"));
        assert!(!rule.matches("audit"));
        assert!(!rule.matches("my_audit_log"));

        let single = FilterRule::pattern("user?").unwrap();
        assert!(single.matches("users"));
        assert!(!single.matches("user"));
    }

    #[test]
    fn test_pattern_escapes_regex_chars() {
        let rule = FilterRule::pattern("a.b").unwrap();
        assert!(rule.matches("a.b"));
        assert!(!rule.matches("axb"));
    }

    #[test]
    fn test_predicate() {
        let rule = FilterRule::predicate(|schema| schema == "public");
        assert!(rule.matches("public"));
        assert!(!rule.matches("sales"));
    }

    #[test]
    fn test_deserialize_forms() {
        let exact: FilterRule = serde_json::from_str(r#""users""#).unwrap();
        assert!(matches!(exact, FilterRule::Exact(_)));
        assert!(exact.matches("users"));

        let glob: FilterRule = serde_json::from_str(r#""tenant_*""#).unwrap();
        assert!(matches!(glob, FilterRule::Pattern(_)));
        assert!(glob.matches("tenant_7"));

        let list: FilterRule = serde_json::from_str(r#"["users","orders"]"#).unwrap();
        assert!(matches!(list, FilterRule::OneOf(_)));
        assert!(list.matches("orders"));
        assert!(!list.matches("logs"));
    }
}
