//! Cell and value types for Meridian.
//!
//! A cell addresses one versioned slot in a table: (row key, column key).
//! Values are opaque byte sequences; the empty value is the delete
//! tombstone.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::cmp::Ordering;
use std::fmt;

fn write_name(f: &mut fmt::Formatter<'_>, bytes: &[u8]) -> fmt::Result {
    // Display as UTF-8 when printable, otherwise hex
    match std::str::from_utf8(bytes) {
        Ok(s) if s.chars().all(|c| !c.is_control()) => write!(f, "{s:?}"),
        _ => {
            write!(f, "0x")?;
            for byte in &bytes[..bytes.len().min(32)] {
                write!(f, "{byte:02x}")?;
            }
            if bytes.len() > 32 {
                write!(f, "...")?;
            }
            Ok(())
        }
    }
}

/// A cell address: row key plus column key.
///
/// Cells are ordered by row first, then column, which is the order the
/// sweeper walks a table in and the order the in-memory store keeps.
///
/// # Example
///
/// ```rust
/// use meridian_common::types::Cell;
///
/// let cell = Cell::new(&b"row1"[..], &b"col1"[..]);
/// assert_eq!(cell.row(), b"row1");
/// ```
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cell {
    row: Bytes,
    column: Bytes,
}

impl Cell {
    /// Creates a cell from row and column keys.
    #[inline]
    #[must_use]
    pub fn new(row: impl Into<Bytes>, column: impl Into<Bytes>) -> Self {
        Self {
            row: row.into(),
            column: column.into(),
        }
    }

    /// Returns the row key.
    #[inline]
    #[must_use]
    pub fn row(&self) -> &[u8] {
        &self.row
    }

    /// Returns the column key.
    #[inline]
    #[must_use]
    pub fn column(&self) -> &[u8] {
        &self.column
    }

    /// Returns the row key as shared bytes.
    #[inline]
    #[must_use]
    pub fn row_bytes(&self) -> Bytes {
        self.row.clone()
    }

    /// Returns the column key as shared bytes.
    #[inline]
    #[must_use]
    pub fn column_bytes(&self) -> Bytes {
        self.column.clone()
    }

    /// Combined size of the row and column names in bytes.
    #[inline]
    #[must_use]
    pub fn name_size(&self) -> usize {
        self.row.len() + self.column.len()
    }

    /// Smallest row key strictly greater than this cell's row.
    ///
    /// Used by the sweeper to resume a table scan after the last fully
    /// processed row.
    #[must_use]
    pub fn row_successor(&self) -> Bytes {
        let mut bytes = self.row.to_vec();
        for i in (0..bytes.len()).rev() {
            if bytes[i] < 0xFF {
                bytes[i] += 1;
                bytes.truncate(i + 1);
                return Bytes::from(bytes);
            }
        }
        // All bytes are 0xFF, append 0x00
        bytes.push(0x00);
        Bytes::from(bytes)
    }
}

impl Ord for Cell {
    #[inline]
    fn cmp(&self, other: &Self) -> Ordering {
        self.row
            .cmp(&other.row)
            .then_with(|| self.column.cmp(&other.column))
    }
}

impl PartialOrd for Cell {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cell(")?;
        write_name(f, &self.row)?;
        write!(f, "/")?;
        write_name(f, &self.column)?;
        write!(f, ")")
    }
}

/// A cell value.
///
/// Values are opaque variable-length byte sequences. The empty value is
/// the delete tombstone: a committed empty version makes the cell read as
/// absent at that snapshot.
///
/// # Example
///
/// ```rust
/// use meridian_common::types::Value;
///
/// let value = Value::from_bytes(b"hello");
/// assert_eq!(value.len(), 5);
/// assert!(Value::tombstone().is_tombstone());
/// ```
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Value(Bytes);

impl Value {
    /// Creates the empty value, the delete tombstone.
    #[inline]
    #[must_use]
    pub const fn tombstone() -> Self {
        Self(Bytes::new())
    }

    /// Creates a value from a byte slice.
    #[inline]
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(Bytes::copy_from_slice(bytes))
    }

    /// Creates a value from owned bytes.
    #[inline]
    #[must_use]
    pub fn from_vec(vec: Vec<u8>) -> Self {
        Self(Bytes::from(vec))
    }

    /// Creates a value from a `Bytes` instance.
    #[inline]
    #[must_use]
    pub const fn from_raw(bytes: Bytes) -> Self {
        Self(bytes)
    }

    /// Returns the length of the value in bytes.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the value is empty.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns true if this value is the delete tombstone.
    #[inline]
    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the value as a byte slice.
    #[inline]
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Returns the underlying `Bytes`.
    #[inline]
    #[must_use]
    pub fn into_bytes(self) -> Bytes {
        self.0
    }

    /// Tries to convert the value to a UTF-8 string.
    #[must_use]
    pub fn to_string_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.0)
    }
}

impl AsRef<[u8]> for Value {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Value({} bytes)", self.0.len())
    }
}

impl From<&[u8]> for Value {
    #[inline]
    fn from(bytes: &[u8]) -> Self {
        Self::from_bytes(bytes)
    }
}

impl From<Vec<u8>> for Value {
    #[inline]
    fn from(vec: Vec<u8>) -> Self {
        Self::from_vec(vec)
    }
}

impl From<&str> for Value {
    #[inline]
    fn from(s: &str) -> Self {
        Self::from_bytes(s.as_bytes())
    }
}

impl From<Bytes> for Value {
    #[inline]
    fn from(bytes: Bytes) -> Self {
        Self::from_raw(bytes)
    }
}
