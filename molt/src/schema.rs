use std::collections::HashMap;
use std::fmt;

/// Broad classification of a column's type, driving how values are decoded
/// from result rows and binlog images and re-bound into statements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    SignedInteger,
    UnsignedInteger,
    Float,
    /// Kept as text end to end to preserve precision.
    Decimal,
    Text,
    Binary,
    DateTime,
    /// DATE, TIME, YEAR, ENUM, SET, JSON and friends travel as text.
    Other,
}

impl ColumnKind {
    /// Maps information_schema's DATA_TYPE/COLUMN_TYPE pair onto a kind.
    pub fn from_data_type(data_type: &str, column_type: &str) -> ColumnKind {
        let unsigned = column_type.to_ascii_lowercase().contains("unsigned");
        match data_type.to_ascii_lowercase().as_str() {
            "tinyint" | "smallint" | "mediumint" | "int" | "bigint" => {
                if unsigned {
                    ColumnKind::UnsignedInteger
                } else {
                    ColumnKind::SignedInteger
                }
            }
            "float" | "double" => ColumnKind::Float,
            "decimal" | "numeric" => ColumnKind::Decimal,
            "char" | "varchar" | "tinytext" | "text" | "mediumtext" | "longtext" => {
                ColumnKind::Text
            }
            "binary" | "varbinary" | "tinyblob" | "blob" | "mediumblob" | "longblob" | "bit" => {
                ColumnKind::Binary
            }
            "datetime" | "timestamp" => ColumnKind::DateTime,
            _ => ColumnKind::Other,
        }
    }
}

/// A column as read from information_schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub kind: ColumnKind,
    pub nullable: bool,
}

impl Column {
    pub fn new(name: impl Into<String>, kind: ColumnKind, nullable: bool) -> Self {
        Column {
            name: name.into(),
            kind,
            nullable,
        }
    }
}

/// An ordered list of columns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnList {
    columns: Vec<Column>,
}

impl ColumnList {
    pub fn new(columns: Vec<Column>) -> Self {
        ColumnList { columns }
    }

    /// Convenience constructor for non-nullable text columns, used in tests
    /// and name-only contexts.
    pub fn from_names<S: Into<String>>(names: impl IntoIterator<Item = S>) -> Self {
        ColumnList {
            columns: names
                .into_iter()
                .map(|name| Column::new(name, ColumnKind::Text, false))
                .collect(),
        }
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn has_nullable(&self) -> bool {
        self.columns.iter().any(|c| c.nullable)
    }
}

impl fmt::Display for ColumnList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.names().join(","))
    }
}

/// A unique key chosen as the row-copy iteration axis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniqueKey {
    pub name: String,
    pub columns: ColumnList,
}

impl UniqueKey {
    pub fn new(name: impl Into<String>, columns: ColumnList) -> Self {
        UniqueKey {
            name: name.into(),
            columns,
        }
    }

    pub fn is_primary(&self) -> bool {
        self.name == "PRIMARY"
    }

    pub fn has_nullable(&self) -> bool {
        self.columns.has_nullable()
    }
}

impl fmt::Display for UniqueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.columns)
    }
}

/// Per-column relationship between the original and ghost schemas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnRelation {
    Unchanged,
    Renamed { ghost_name: String },
    DroppedOnGhost,
    AddedOnGhost,
}

/// Mapping between original-table columns and ghost-table columns, derived
/// by diffing the two schemas plus the explicit renames parsed from the
/// ALTER text.
///
/// The shared pairs drive both the chunk-copy column lists and the DML
/// rewrite projection.
#[derive(Debug, Clone, Default)]
pub struct ColumnMapping {
    /// (original column, ghost column, original index) for every column
    /// present on both sides, in original-table order.
    shared: Vec<SharedColumn>,
    /// Original columns with no ghost counterpart.
    dropped: Vec<String>,
    /// Ghost columns with no original counterpart.
    added: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SharedColumn {
    pub original: Column,
    pub ghost_name: String,
    /// Index of the column within the original table's full column list,
    /// which is also the index into binlog row images.
    pub original_index: usize,
}

impl ColumnMapping {
    /// Derives the mapping. `renames` maps original name -> ghost name.
    pub fn derive(
        original: &ColumnList,
        ghost: &ColumnList,
        renames: &HashMap<String, String>,
    ) -> ColumnMapping {
        let mut shared = Vec::new();
        let mut dropped = Vec::new();

        for (index, column) in original.columns().iter().enumerate() {
            let ghost_name = renames
                .get(&column.name)
                .cloned()
                .unwrap_or_else(|| column.name.clone());
            if ghost.contains(&ghost_name) {
                shared.push(SharedColumn {
                    original: column.clone(),
                    ghost_name,
                    original_index: index,
                });
            } else {
                dropped.push(column.name.clone());
            }
        }

        let mapped_ghost_names: Vec<&str> =
            shared.iter().map(|s| s.ghost_name.as_str()).collect();
        let added = ghost
            .columns()
            .iter()
            .filter(|c| !mapped_ghost_names.contains(&c.name.as_str()))
            .map(|c| c.name.clone())
            .collect();

        ColumnMapping {
            shared,
            dropped,
            added,
        }
    }

    pub fn shared(&self) -> &[SharedColumn] {
        &self.shared
    }

    pub fn original_names(&self) -> Vec<&str> {
        self.shared.iter().map(|s| s.original.name.as_str()).collect()
    }

    pub fn ghost_names(&self) -> Vec<&str> {
        self.shared.iter().map(|s| s.ghost_name.as_str()).collect()
    }

    pub fn dropped(&self) -> &[String] {
        &self.dropped
    }

    pub fn added(&self) -> &[String] {
        &self.added
    }

    pub fn relation_of(&self, original_name: &str) -> ColumnRelation {
        if let Some(shared) = self
            .shared
            .iter()
            .find(|s| s.original.name == original_name)
        {
            if shared.ghost_name == original_name {
                ColumnRelation::Unchanged
            } else {
                ColumnRelation::Renamed {
                    ghost_name: shared.ghost_name.clone(),
                }
            }
        } else if self.dropped.iter().any(|d| d == original_name) {
            ColumnRelation::DroppedOnGhost
        } else {
            ColumnRelation::AddedOnGhost
        }
    }
}
