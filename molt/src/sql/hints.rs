use std::fmt::Write;

/// Optimizer hints attached to copy and replay statements.
///
/// Rendered as an explicit list of (name, value) entries; entries with no
/// value are skipped.
#[derive(Debug, Clone, Default)]
pub struct OptimizerHints {
    /// `RESOURCE_GROUP(<name>)`
    pub resource_group: Option<String>,
    /// `MAX_EXECUTION_TIME(<millis>)`
    pub max_execution_time_ms: Option<u64>,
}

impl OptimizerHints {
    /// Renders the `/*+ ... */` comment, or an empty string when no hint is
    /// set.
    pub fn comment(&self) -> String {
        let mut entries: Vec<String> = Vec::new();

        if let Some(group) = &self.resource_group {
            if !group.is_empty() {
                entries.push(format!("RESOURCE_GROUP({group})"));
            }
        }
        if let Some(millis) = self.max_execution_time_ms {
            if millis > 0 {
                entries.push(format!("MAX_EXECUTION_TIME({millis})"));
            }
        }

        if entries.is_empty() {
            return String::new();
        }

        let mut comment = String::from("/*+");
        for entry in entries {
            let _ = write!(comment, " {entry}");
        }
        comment.push_str(" */");
        comment
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_hints_render_nothing() {
        assert_eq!(OptimizerHints::default().comment(), "");
    }

    #[test]
    fn zero_values_are_skipped() {
        let hints = OptimizerHints {
            resource_group: Some(String::new()),
            max_execution_time_ms: Some(0),
        };
        assert_eq!(hints.comment(), "");
    }

    #[test]
    fn single_hint() {
        let hints = OptimizerHints {
            resource_group: None,
            max_execution_time_ms: Some(1500),
        };
        assert_eq!(hints.comment(), "/*+ MAX_EXECUTION_TIME(1500) */");
    }

    #[test]
    fn multiple_hints_keep_declaration_order() {
        let hints = OptimizerHints {
            resource_group: Some("batch".to_string()),
            max_execution_time_ms: Some(2000),
        };
        assert_eq!(
            hints.comment(),
            "/*+ RESOURCE_GROUP(batch) MAX_EXECUTION_TIME(2000) */"
        );
    }
}
