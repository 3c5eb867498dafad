//! Table references.
//!
//! Tables are addressed by a qualified name: `namespace.table` for user
//! tables, a bare underscore-prefixed name for system tables. Names are
//! validated at construction so everything downstream can trust them.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{MeridianError, MeridianResult};

/// A validated reference to a table.
///
/// User tables are fully qualified (`accounts.balances`); system tables
/// (commit records, sweep progress, persistent locks) carry a leading
/// underscore and no namespace. The distinction matters because system
/// tables are never swept and never reachable through the manual sweep
/// trigger.
///
/// # Example
///
/// ```rust
/// use meridian_common::types::TableRef;
///
/// let table = TableRef::from_qualified_name("accounts.balances").unwrap();
/// assert_eq!(table.namespace(), "accounts");
/// assert!(!table.is_system());
/// ```
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TableRef {
    namespace: String,
    name: String,
}

fn is_valid_component(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl TableRef {
    /// Creates a user table reference from namespace and table name.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTableName` if either component is empty, starts with
    /// a non-letter, or contains characters outside `[A-Za-z0-9_]`.
    pub fn create(namespace: &str, name: &str) -> MeridianResult<Self> {
        if !is_valid_component(namespace) {
            return Err(MeridianError::invalid_table_name(
                format!("{namespace}.{name}"),
                "namespace must start with a letter and contain only letters, digits, and underscores",
            ));
        }
        if !is_valid_component(name) {
            return Err(MeridianError::invalid_table_name(
                format!("{namespace}.{name}"),
                "table name must start with a letter and contain only letters, digits, and underscores",
            ));
        }
        Ok(Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        })
    }

    /// Parses a fully qualified user table name of the form
    /// `namespace.table`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTableName` unless the name contains exactly one dot
    /// separating two valid components.
    pub fn from_qualified_name(qualified: &str) -> MeridianResult<Self> {
        let mut parts = qualified.splitn(3, '.');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(ns), Some(name), None) => Self::create(ns, name),
            _ => Err(MeridianError::invalid_table_name(
                qualified,
                "expected a fully qualified name of the form namespace.table",
            )),
        }
    }

    /// Creates a system table reference.
    ///
    /// System table names start with an underscore and have no namespace.
    ///
    /// # Panics
    ///
    /// Panics if the name does not follow the system naming convention.
    /// System tables are created from compile-time constants only.
    #[must_use]
    pub fn system(name: &str) -> Self {
        let rest = name
            .strip_prefix('_')
            .unwrap_or_else(|| panic!("system table name must start with '_': {name}"));
        assert!(
            is_valid_component(rest),
            "invalid system table name: {name}"
        );
        Self {
            namespace: String::new(),
            name: name.to_string(),
        }
    }

    /// Returns the namespace. Empty for system tables.
    #[inline]
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Returns the table name without namespace.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns true for system tables.
    #[inline]
    #[must_use]
    pub fn is_system(&self) -> bool {
        self.namespace.is_empty()
    }

    /// Returns the fully qualified name.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.namespace, self.name)
        }
    }
}

impl From<&TableRef> for String {
    fn from(table: &TableRef) -> Self {
        table.qualified_name()
    }
}

impl fmt::Debug for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TableRef({})", self.qualified_name())
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}.{}", self.namespace, self.name)
        }
    }
}
