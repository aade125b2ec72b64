use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A position in the server's binary log.
///
/// Two encodings exist: classic file+position pairs, and the server's
/// global transaction identifier form. File coordinates are totally
/// ordered; GTID sets only support equality, so range comparisons on them
/// return `false` rather than guessing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinlogCoordinates {
    File { log_file: String, log_pos: u64 },
    Gtid { gtid_set: String },
}

impl BinlogCoordinates {
    pub fn file(log_file: impl Into<String>, log_pos: u64) -> Self {
        BinlogCoordinates::File {
            log_file: log_file.into(),
            log_pos,
        }
    }

    pub fn gtid(gtid_set: impl Into<String>) -> Self {
        BinlogCoordinates::Gtid {
            gtid_set: gtid_set.into(),
        }
    }

    /// An unset position, used before the streamer has connected.
    pub fn empty() -> Self {
        BinlogCoordinates::File {
            log_file: String::new(),
            log_pos: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            BinlogCoordinates::File { log_file, .. } => log_file.is_empty(),
            BinlogCoordinates::Gtid { gtid_set } => gtid_set.is_empty(),
        }
    }

    /// File-name ordering is lexicographic, which holds for the zero-padded
    /// sequence suffix MySQL uses (`mysql-bin.000123`).
    pub fn smaller_than(&self, other: &BinlogCoordinates) -> bool {
        match (self, other) {
            (
                BinlogCoordinates::File { log_file, log_pos },
                BinlogCoordinates::File {
                    log_file: other_file,
                    log_pos: other_pos,
                },
            ) => match log_file.cmp(other_file) {
                Ordering::Less => true,
                Ordering::Equal => log_pos < other_pos,
                Ordering::Greater => false,
            },
            _ => false,
        }
    }

    pub fn smaller_than_or_equals(&self, other: &BinlogCoordinates) -> bool {
        self == other || self.smaller_than(other)
    }
}

impl fmt::Display for BinlogCoordinates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BinlogCoordinates::File { log_file, log_pos } => {
                write!(f, "{log_file}:{log_pos}")
            }
            BinlogCoordinates::Gtid { gtid_set } => write!(f, "{gtid_set}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_coordinates_order_within_file() {
        let a = BinlogCoordinates::file("mysql-bin.000017", 104);
        let b = BinlogCoordinates::file("mysql-bin.000017", 5000);
        assert!(a.smaller_than(&b));
        assert!(!b.smaller_than(&a));
        assert!(a.smaller_than_or_equals(&b));
    }

    #[test]
    fn file_coordinates_order_across_files() {
        let a = BinlogCoordinates::file("mysql-bin.000017", 9999);
        let b = BinlogCoordinates::file("mysql-bin.000018", 4);
        assert!(a.smaller_than(&b));
        assert!(!b.smaller_than(&a));
    }

    #[test]
    fn equal_coordinates_are_not_smaller() {
        let a = BinlogCoordinates::file("mysql-bin.000001", 42);
        let b = a.clone();
        assert!(!a.smaller_than(&b));
        assert!(a.smaller_than_or_equals(&b));
    }

    #[test]
    fn gtid_coordinates_only_support_equality() {
        let a = BinlogCoordinates::gtid("3e11fa47-71ca-11e1-9e33-c80aa9429562:1-5");
        let b = BinlogCoordinates::gtid("3e11fa47-71ca-11e1-9e33-c80aa9429562:1-9");
        assert!(!a.smaller_than(&b));
        assert!(!b.smaller_than(&a));
        assert!(a.smaller_than_or_equals(&a.clone()));
    }

    #[test]
    fn empty_detection() {
        assert!(BinlogCoordinates::empty().is_empty());
        assert!(!BinlogCoordinates::file("mysql-bin.000001", 0).is_empty());
    }

    #[test]
    fn display_format() {
        let c = BinlogCoordinates::file("mysql-bin.000123", 456);
        assert_eq!(c.to_string(), "mysql-bin.000123:456");
    }
}
