//! Tablet identity.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// Identifies a tablet: a table and the half-open row range
/// `(prev_end_row, end_row]`. `None` bounds are unbounded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyExtent {
    pub table_id: String,
    pub end_row: Option<Vec<u8>>,
    pub prev_end_row: Option<Vec<u8>>,
}

impl KeyExtent {
    /// # Panics
    ///
    /// Panics if `table_id` is empty or contains a path or row separator.
    pub fn new(table_id: impl Into<String>, end_row: Option<Vec<u8>>, prev_end_row: Option<Vec<u8>>) -> Self {
        let table_id = table_id.into();
        assert!(!table_id.is_empty(), "table id must not be empty");
        assert!(!table_id.contains(['/', ';', '<']), "table id must not contain '/', ';' or '<'");
        Self {
            table_id,
            end_row,
            prev_end_row,
        }
    }

    /// Node name of this tablet's metadata record: `<table>;<hex end row>`,
    /// or `<table><` for the last tablet of the table.
    ///
    /// Names sort in row order within a table.
    pub fn metadata_row(&self) -> String {
        match &self.end_row {
            Some(end) => format!("{};{}", self.table_id, hex::encode(end)),
            None => format!("{}<", self.table_id),
        }
    }

    /// Whether `row` falls inside this extent.
    pub fn contains(&self, row: &[u8]) -> bool {
        let after_prev = self.prev_end_row.as_deref().is_none_or(|prev| row > prev);
        let within_end = self.end_row.as_deref().is_none_or(|end| row <= end);
        after_prev && within_end
    }
}

impl fmt::Display for KeyExtent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |row: &Option<Vec<u8>>| match row {
            Some(r) => String::from_utf8_lossy(r).into_owned(),
            None => "-inf".to_string(),
        };
        match &self.end_row {
            Some(_) => write!(f, "{};{}", self.table_id, show(&self.end_row))?,
            None => write!(f, "{}<", self.table_id)?,
        }
        write!(f, " (prev {})", show(&self.prev_end_row))
    }
}
