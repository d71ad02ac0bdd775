//! Identifier validation for namespaces and keys
//!
//! Namespaces and keys share one grammar: they must start with an
//! alphanumeric character and may continue with alphanumerics, periods,
//! underscores, and dashes. Matching is case-insensitive. The grammar is
//! what keeps every stored name path-safe, so it is enforced up front and
//! violations are never absorbed.

use crate::error::{Result, StoreError};
use regex::Regex;

/// Pattern shared by namespaces and keys
const PATTERN: &str = r"(?i)^[a-z0-9][a-z0-9._-]*$";

fn grammar() -> Regex {
    Regex::new(PATTERN).unwrap()
}

/// Returns true when `name` satisfies the identifier grammar
pub fn is_identifier(name: &str) -> bool {
    grammar().is_match(name)
}

/// Validate a namespace, erroring on violation
pub fn validate_namespace(namespace: &str) -> Result<()> {
    if !is_identifier(namespace) {
        return Err(StoreError::InvalidNamespace(namespace.to_string()));
    }
    Ok(())
}

/// Validate a key, erroring on violation
pub fn validate_key(key: &str) -> Result<()> {
    if !is_identifier(key) {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    Ok(())
}
