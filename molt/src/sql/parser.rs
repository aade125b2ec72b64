use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;

/// The parts of an ALTER clause the engine needs to understand: explicit
/// column renames (which a schema diff cannot see) and table renames (which
/// are rejected outright).
#[derive(Debug, Clone, Default)]
pub struct AlterStatement {
    /// original column name -> ghost column name
    pub renames: HashMap<String, String>,
    /// The clause attempts `RENAME TO`/`RENAME AS`.
    pub renames_table: bool,
    /// Columns explicitly dropped by the clause.
    pub dropped_columns: Vec<String>,
}

fn change_column_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)^change\s+(?:column\s+)?(?:`([^`]+)`|(\w+))\s+(?:`([^`]+)`|(\w+))\s",
        )
        .expect("static regex")
    })
}

fn drop_column_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^drop\s+(?:column\s+)?(?:`([^`]+)`|(\w+))\s*$").expect("static regex")
    })
}

fn rename_table_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^rename\s+(to|as)\s+").expect("static regex"))
}

/// Splits an ALTER clause on top-level commas, respecting parentheses,
/// quotes and backticks.
fn split_alter_tokens(alter: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;

    for ch in alter.chars() {
        match quote {
            Some(q) => {
                current.push(ch);
                if ch == q {
                    quote = None;
                }
            }
            None => match ch {
                '\'' | '"' | '`' => {
                    quote = Some(ch);
                    current.push(ch);
                }
                '(' => {
                    depth += 1;
                    current.push(ch);
                }
                ')' => {
                    depth = depth.saturating_sub(1);
                    current.push(ch);
                }
                ',' if depth == 0 => {
                    tokens.push(current.trim().to_string());
                    current.clear();
                }
                _ => current.push(ch),
            },
        }
    }
    if !current.trim().is_empty() {
        tokens.push(current.trim().to_string());
    }
    tokens
}

fn captured_name(caps: &regex::Captures<'_>, quoted: usize, bare: usize) -> Option<String> {
    caps.get(quoted)
        .or_else(|| caps.get(bare))
        .map(|m| m.as_str().to_string())
}

/// Parses an ALTER clause (without the `ALTER TABLE <name>` prefix).
pub fn parse_alter_statement(alter: &str) -> AlterStatement {
    let mut statement = AlterStatement::default();

    for token in split_alter_tokens(alter) {
        if rename_table_regex().is_match(&token) {
            statement.renames_table = true;
            continue;
        }
        if let Some(caps) = change_column_regex().captures(&token) {
            let old_name = captured_name(&caps, 1, 2);
            let new_name = captured_name(&caps, 3, 4);
            if let (Some(old_name), Some(new_name)) = (old_name, new_name) {
                if old_name != new_name {
                    statement.renames.insert(old_name, new_name);
                }
            }
            continue;
        }
        if let Some(caps) = drop_column_regex().captures(&token) {
            if let Some(name) = captured_name(&caps, 1, 2) {
                statement.dropped_columns.push(name);
            }
        }
    }

    statement
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_change_column_rename() {
        let parsed = parse_alter_statement("CHANGE COLUMN old_name new_name varchar(64) NOT NULL");
        assert_eq!(
            parsed.renames.get("old_name"),
            Some(&"new_name".to_string())
        );
        assert!(!parsed.renames_table);
    }

    #[test]
    fn detects_backticked_rename() {
        let parsed = parse_alter_statement("change `from col` `to col` int");
        assert_eq!(parsed.renames.get("from col"), Some(&"to col".to_string()));
    }

    #[test]
    fn change_to_same_name_is_not_a_rename() {
        let parsed = parse_alter_statement("CHANGE id id bigint unsigned");
        assert!(parsed.renames.is_empty());
    }

    #[test]
    fn splits_on_top_level_commas_only() {
        let parsed = parse_alter_statement(
            "ADD COLUMN tags SET('a','b,c'), CHANGE old_col new_col DECIMAL(10,2)",
        );
        assert_eq!(parsed.renames.get("old_col"), Some(&"new_col".to_string()));
    }

    #[test]
    fn detects_table_rename() {
        assert!(parse_alter_statement("rename to other_table").renames_table);
        assert!(parse_alter_statement("RENAME AS other_table").renames_table);
        assert!(!parse_alter_statement("add column renamed int").renames_table);
    }

    #[test]
    fn detects_dropped_columns() {
        let parsed = parse_alter_statement("DROP COLUMN legacy, ADD COLUMN fresh int");
        assert_eq!(parsed.dropped_columns, vec!["legacy".to_string()]);
    }

    #[test]
    fn drop_key_is_not_a_dropped_column() {
        let parsed = parse_alter_statement("DROP KEY name_uidx");
        assert!(parsed.dropped_columns.is_empty());
    }
}
