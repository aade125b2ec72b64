use std::fmt;

use molt_mysql::BinlogCoordinates;

use crate::sql::ColumnValue;

/// The kind of data modification a binlog row event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmlKind {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for DmlKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DmlKind::Insert => "insert",
            DmlKind::Update => "update",
            DmlKind::Delete => "delete",
        };
        f.write_str(name)
    }
}

/// A decoded row modification.
///
/// `where_values` is the pre-image (update/delete), `new_values` the
/// post-image (insert/update); both are full row images in original-table
/// column order.
#[derive(Debug, Clone, PartialEq)]
pub struct DmlEvent {
    pub database: String,
    pub table: String,
    pub kind: DmlKind,
    pub where_values: Option<Vec<ColumnValue>>,
    pub new_values: Option<Vec<ColumnValue>>,
}

/// An entry in the binary log: a position plus the row modification decoded
/// at that position.
#[derive(Debug, Clone, PartialEq)]
pub struct BinlogEntry {
    pub coordinates: BinlogCoordinates,
    pub end_log_pos: u64,
    pub dml_event: DmlEvent,
}

impl BinlogEntry {
    pub fn new(coordinates: BinlogCoordinates, end_log_pos: u64, dml_event: DmlEvent) -> Self {
        BinlogEntry {
            coordinates,
            end_log_pos,
            dml_event,
        }
    }

    /// Returns a semantically complete copy: coordinates, end position and
    /// the DML event itself.
    pub fn duplicate(&self) -> BinlogEntry {
        self.clone()
    }
}

impl fmt::Display for BinlogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[entry at {}; {} on {}.{}]",
            self.coordinates, self.dml_event.kind, self.dml_event.database, self.dml_event.table
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_copies_the_dml_event() {
        let entry = BinlogEntry::new(
            BinlogCoordinates::file("mysql-bin.000003", 120),
            180,
            DmlEvent {
                database: "shop".into(),
                table: "orders".into(),
                kind: DmlKind::Update,
                where_values: Some(vec![ColumnValue::Int(1)]),
                new_values: Some(vec![ColumnValue::Int(2)]),
            },
        );

        let dup = entry.duplicate();
        assert_eq!(dup, entry);
        assert_eq!(dup.dml_event.new_values, Some(vec![ColumnValue::Int(2)]));
    }
}
