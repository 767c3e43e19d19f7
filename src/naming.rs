//! Naming helpers shared by schema composition
//!
//! Entity type names become table names, property names become column
//! names, and type-values are stored as `module::Name` strings. All of them
//! must be plain identifiers so they can be quoted safely into SQL.

use std::sync::LazyLock;
use regex::Regex;
use crate::{Error, Result};

static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier pattern compiles"));

/// Check that a name is usable as a table or column identifier
pub fn validate_identifier(kind: &str, name: &str) -> Result<()> {
    if IDENTIFIER.is_match(name) {
        Ok(())
    } else {
        Err(Error::Schema(format!("Invalid {} name: {:?}", kind, name)))
    }
}

/// Convert `PascalCase` to `snake_case`
///
/// Runs of capitals are split per letter (`HTTPServer` -> `h_t_t_p_server`),
/// which keeps the mapping stable and reversible enough for generated names.
pub fn pascal_to_snake(pascal: &str) -> String {
    let mut out = String::with_capacity(pascal.len() + 4);
    for (i, ch) in pascal.chars().enumerate() {
        if ch.is_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.extend(ch.to_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

/// Fully-qualified name used to store type-values
pub fn qualified_name(module: &str, name: &str) -> String {
    if module.is_empty() {
        name.to_string()
    } else {
        format!("{}::{}", module, name)
    }
}

/// Quote an identifier for SQL
pub fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}
