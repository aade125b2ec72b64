use crate::schema::{Column, ColumnMapping, UniqueKey};
use crate::sql::hints::OptimizerHints;
use crate::sql::value::ColumnValue;

/// Marker comment carried by every statement the engine issues, so they are
/// recognizable in processlists and slow logs.
pub const QUERY_MARKER: &str = "/* molt */";

/// Name of the ghost table for a migrated table.
pub fn ghost_table_name(table: &str) -> String {
    format!("_{table}_gho")
}

/// Name the original table is renamed to at cut-over.
pub fn old_table_name(table: &str) -> String {
    format!("_{table}_del")
}

/// Name of the changelog table for a migrated table.
pub fn changelog_table_name(table: &str) -> String {
    format!("_{table}_ghc")
}

/// Quotes an identifier, doubling embedded backticks.
pub fn quote_name(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// Quotes a database-qualified table name.
pub fn quote_table(database: &str, table: &str) -> String {
    format!("{}.{}", quote_name(database), quote_name(table))
}

fn quoted_list(names: &[&str]) -> String {
    names
        .iter()
        .map(|n| quote_name(n))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Builds the expanded lexicographic tuple comparison
/// `((c1 > ?) or (c1 = ? and c2 > ?) or ...)`, appending bind values in
/// evaluation order. `include_equal` turns the final term's comparison into
/// `>=`/`<=`.
///
/// NULL sorts first, matching MySQL index order. A plain operator against a
/// NULL operand is UNKNOWN for every row, so for nullable key columns the
/// comparison is rewritten: equality conjuncts use `<=>`, NULL cursor
/// values become IS NULL / IS NOT NULL forms, and non-NULL upper bounds
/// keep NULL rows in range. Non-nullable columns render the plain forms.
fn build_tuple_comparison(
    columns: &[Column],
    values: &[ColumnValue],
    greater: bool,
    include_equal: bool,
    params: &mut Vec<ColumnValue>,
) -> String {
    debug_assert_eq!(columns.len(), values.len());

    let mut terms: Vec<(String, Vec<ColumnValue>)> = Vec::with_capacity(columns.len());

    'term: for (i, column) in columns.iter().enumerate() {
        let include = i == columns.len() - 1 && include_equal;
        let quoted = quote_name(&column.name);

        let mut conjuncts = Vec::with_capacity(i + 1);
        let mut term_params = Vec::with_capacity(i + 1);
        for (equal_column, value) in columns[..i].iter().zip(&values[..i]) {
            let eq_op = if equal_column.nullable { "<=>" } else { "=" };
            conjuncts.push(format!("{} {eq_op} ?", quote_name(&equal_column.name)));
            term_params.push(value.clone());
        }

        let value = &values[i];
        match (greater, value.is_null(), include) {
            // col > NULL: any non-NULL value qualifies.
            (true, true, false) => conjuncts.push(format!("{quoted} is not null")),
            // col >= NULL: every value qualifies; no comparison needed.
            (true, true, true) => {}
            // col < NULL: no value qualifies; the term vanishes.
            (false, true, false) => continue 'term,
            // col <= NULL: only the NULL rows qualify.
            (false, true, true) => conjuncts.push(format!("{quoted} is null")),
            (true, false, _) => {
                let op = if include { ">=" } else { ">" };
                conjuncts.push(format!("{quoted} {op} ?"));
                term_params.push(value.clone());
            }
            (false, false, _) => {
                let op = if include { "<=" } else { "<" };
                if column.nullable {
                    // NULL rows sort below any non-NULL bound.
                    conjuncts.push(format!("({quoted} {op} ? or {quoted} is null)"));
                } else {
                    conjuncts.push(format!("{quoted} {op} ?"));
                }
                term_params.push(value.clone());
            }
        }

        if conjuncts.is_empty() {
            // An unconditionally true term makes the whole disjunction true;
            // nothing is bound.
            return "(1 = 1)".to_string();
        }
        terms.push((format!("({})", conjuncts.join(" and ")), term_params));
    }

    if terms.is_empty() {
        return "(1 = 0)".to_string();
    }

    let rendered = terms
        .iter()
        .map(|(term, _)| term.as_str())
        .collect::<Vec<_>>()
        .join(" or ");
    for (_, term_params) in terms {
        params.extend(term_params);
    }
    format!("({rendered})")
}

/// SELECT of the unique-key columns at one extreme of the table, used to
/// establish the migration range.
pub fn build_range_extremes_query(
    database: &str,
    table: &str,
    unique_key: &UniqueKey,
    ascending: bool,
) -> String {
    let direction = if ascending { "asc" } else { "desc" };
    let order_by = unique_key
        .columns
        .names()
        .iter()
        .map(|n| format!("{} {direction}", quote_name(n)))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "select {QUERY_MARKER} {} from {} order by {} limit 1",
        quoted_list(&unique_key.columns.names()),
        quote_table(database, table),
        order_by,
    )
}

/// SELECT locating the next chunk's upper boundary: the unique-key tuple of
/// the chunk-size-th row past `from_values`.
pub fn build_next_chunk_boundary_query(
    database: &str,
    table: &str,
    unique_key: &UniqueKey,
    from_values: &[ColumnValue],
    include_from: bool,
    chunk_size: i64,
) -> (String, Vec<ColumnValue>) {
    let names = unique_key.columns.names();
    let mut params = Vec::new();
    let range = build_tuple_comparison(
        unique_key.columns.columns(),
        from_values,
        true,
        include_from,
        &mut params,
    );
    let order_by = names
        .iter()
        .map(|n| format!("{} asc", quote_name(n)))
        .collect::<Vec<_>>()
        .join(", ");

    let query = format!(
        "select {QUERY_MARKER} {} from {} force index ({}) where {} order by {} limit 1 offset {}",
        quoted_list(&names),
        quote_table(database, table),
        quote_name(&unique_key.name),
        range,
        order_by,
        chunk_size - 1,
    );

    (query, params)
}

/// The chunk copy statement: one transaction's worth of back-fill.
///
/// `insert ignore` absorbs rows the DML replay stream already wrote; the
/// shared lock on the source range pins the committed image being copied.
pub fn build_chunk_insert_query(
    database: &str,
    original_table: &str,
    ghost_table: &str,
    mapping: &ColumnMapping,
    unique_key: &UniqueKey,
    from_values: &[ColumnValue],
    to_values: &[ColumnValue],
    include_from: bool,
    hints: &OptimizerHints,
) -> (String, Vec<ColumnValue>) {
    let mut params = Vec::new();
    let lower = build_tuple_comparison(
        unique_key.columns.columns(),
        from_values,
        true,
        include_from,
        &mut params,
    );
    let upper = build_tuple_comparison(
        unique_key.columns.columns(),
        to_values,
        false,
        true,
        &mut params,
    );

    let hint_comment = hints.comment();
    let hint_comment = if hint_comment.is_empty() {
        String::new()
    } else {
        format!("{hint_comment} ")
    };

    let query = format!(
        "insert {QUERY_MARKER} {hint_comment}ignore into {} ({}) \
         (select {} from {} force index ({}) where {} and {} lock in share mode)",
        quote_table(database, ghost_table),
        quoted_list(&mapping.ghost_names()),
        quoted_list(&mapping.original_names()),
        quote_table(database, original_table),
        quote_name(&unique_key.name),
        lower,
        upper,
    );

    (query, params)
}

/// Projects a binlog row image onto the ghost's shared columns.
fn project_row(mapping: &ColumnMapping, row: &[ColumnValue]) -> Vec<ColumnValue> {
    mapping
        .shared()
        .iter()
        .map(|shared| {
            row.get(shared.original_index)
                .cloned()
                .unwrap_or(ColumnValue::Null)
        })
        .collect()
}

/// Extracts the unique-key tuple out of a binlog row image.
pub fn unique_key_values(
    unique_key: &UniqueKey,
    original_index_of: impl Fn(&str) -> Option<usize>,
    row: &[ColumnValue],
) -> Vec<ColumnValue> {
    unique_key
        .columns
        .names()
        .iter()
        .map(|name| {
            original_index_of(name)
                .and_then(|i| row.get(i).cloned())
                .unwrap_or(ColumnValue::Null)
        })
        .collect()
}

/// Replay of a binlog insert. `replace` rather than `insert`: the row may
/// already exist on the ghost via an earlier chunk copy, in which case the
/// binlog image wins.
pub fn build_dml_insert_query(
    database: &str,
    ghost_table: &str,
    mapping: &ColumnMapping,
    new_row: &[ColumnValue],
) -> (String, Vec<ColumnValue>) {
    let params = project_row(mapping, new_row);
    let placeholders = vec!["?"; params.len()].join(", ");

    let query = format!(
        "replace {QUERY_MARKER} into {} ({}) values ({})",
        quote_table(database, ghost_table),
        quoted_list(&mapping.ghost_names()),
        placeholders,
    );

    (query, params)
}

fn build_unique_key_where(
    unique_key: &UniqueKey,
    mapping: &ColumnMapping,
    key_values: &[ColumnValue],
    params: &mut Vec<ColumnValue>,
) -> String {
    let clauses: Vec<String> = unique_key
        .columns
        .names()
        .iter()
        .map(|name| {
            // The ghost may have renamed the key column.
            let ghost_name = mapping
                .shared()
                .iter()
                .find(|s| s.original.name == *name)
                .map(|s| s.ghost_name.as_str())
                .unwrap_or(name);
            format!("{} <=> ?", quote_name(ghost_name))
        })
        .collect();
    params.extend(key_values.iter().cloned());
    clauses.join(" and ")
}

/// Replay of a binlog update, keyed on the pre-image's unique-key values.
pub fn build_dml_update_query(
    database: &str,
    ghost_table: &str,
    mapping: &ColumnMapping,
    unique_key: &UniqueKey,
    where_key_values: &[ColumnValue],
    new_row: &[ColumnValue],
) -> (String, Vec<ColumnValue>) {
    let mut params = project_row(mapping, new_row);
    let assignments = mapping
        .ghost_names()
        .iter()
        .map(|name| format!("{} = ?", quote_name(name)))
        .collect::<Vec<_>>()
        .join(", ");

    let where_clause = build_unique_key_where(unique_key, mapping, where_key_values, &mut params);

    let query = format!(
        "update {QUERY_MARKER} {} set {} where {}",
        quote_table(database, ghost_table),
        assignments,
        where_clause,
    );

    (query, params)
}

/// Replay of a binlog delete, keyed on the pre-image's unique-key values.
pub fn build_dml_delete_query(
    database: &str,
    ghost_table: &str,
    mapping: &ColumnMapping,
    unique_key: &UniqueKey,
    where_key_values: &[ColumnValue],
) -> (String, Vec<ColumnValue>) {
    let mut params = Vec::new();
    let where_clause = build_unique_key_where(unique_key, mapping, where_key_values, &mut params);

    let query = format!(
        "delete {QUERY_MARKER} from {} where {}",
        quote_table(database, ghost_table),
        where_clause,
    );

    (query, params)
}

/// DDL: the ghost starts as a structural clone of the original.
pub fn build_create_ghost_table_query(
    database: &str,
    original_table: &str,
    ghost_table: &str,
) -> String {
    format!(
        "create {QUERY_MARKER} table {} like {}",
        quote_table(database, ghost_table),
        quote_table(database, original_table),
    )
}

/// DDL: applies the migration's ALTER clause to the ghost.
pub fn build_alter_ghost_table_query(database: &str, ghost_table: &str, alter: &str) -> String {
    format!(
        "alter {QUERY_MARKER} table {} {}",
        quote_table(database, ghost_table),
        alter,
    )
}

/// DDL: the changelog table used as heartbeat and cut-over rendezvous
/// channel. The `hint` unique key makes writes upserts, so the table stays
/// tiny while every write is still captured by the binlog.
pub fn build_create_changelog_table_query(database: &str, changelog_table: &str) -> String {
    format!(
        "create {QUERY_MARKER} table {} (\
         id bigint auto_increment, \
         last_update timestamp not null default current_timestamp on update current_timestamp, \
         hint varchar(64) character set ascii not null, \
         value varchar(4096) character set ascii not null, \
         primary key(id), \
         unique key hint_uidx(hint)\
         ) auto_increment=256",
        quote_table(database, changelog_table),
    )
}

pub fn build_drop_table_query(database: &str, table: &str) -> String {
    format!(
        "drop {QUERY_MARKER} table if exists {}",
        quote_table(database, table),
    )
}

/// Upsert of a changelog row.
pub fn build_changelog_write_query(
    database: &str,
    changelog_table: &str,
) -> String {
    format!(
        "insert {QUERY_MARKER} into {} (hint, value) values (?, ?) \
         on duplicate key update last_update=current_timestamp, value=values(value)",
        quote_table(database, changelog_table),
    )
}

/// The atomic swap. Under the cut-over lock discipline this is observed by
/// all clients as a single instant.
pub fn build_swap_tables_query(
    database: &str,
    original_table: &str,
    old_table: &str,
    ghost_table: &str,
) -> String {
    format!(
        "rename {QUERY_MARKER} table {} to {}, {} to {}",
        quote_table(database, original_table),
        quote_table(database, old_table),
        quote_table(database, ghost_table),
        quote_table(database, original_table),
    )
}

/// Locks taken by the cut-over locker session: the original table and the
/// sentry table whose existence blocks a premature rename.
pub fn build_cut_over_lock_query(
    database: &str,
    original_table: &str,
    sentry_table: &str,
) -> String {
    format!(
        "lock {QUERY_MARKER} tables {} write, {} write",
        quote_table(database, original_table),
        quote_table(database, sentry_table),
    )
}

/// The sentry table blocking the rename until the locker session drops it.
pub fn build_create_sentry_table_query(database: &str, sentry_table: &str) -> String {
    format!(
        "create {QUERY_MARKER} table {} (id int auto_increment primary key) comment='ghost-cut-over-sentry'",
        quote_table(database, sentry_table),
    )
}

/// Finds a rename statement queued behind the cut-over lock. The caller
/// binds a LIKE pattern matching the swap statement's prefix.
pub fn build_find_blocked_rename_query() -> &'static str {
    "select id from information_schema.processlist \
     where state like 'Waiting for table metadata lock%' and info like ?"
}

/// The LIKE pattern identifying this migration's blocked swap statement.
pub fn blocked_rename_pattern(database: &str, original_table: &str) -> String {
    format!(
        "rename {QUERY_MARKER} table {} to %",
        quote_table(database, original_table)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Column, ColumnKind, ColumnList};
    use std::collections::HashMap;

    fn unique_key(names: &[&str]) -> UniqueKey {
        UniqueKey::new("PRIMARY", ColumnList::from_names(names.iter().copied()))
    }

    fn identity_mapping(names: &[&str]) -> ColumnMapping {
        let list = ColumnList::from_names(names.iter().copied());
        ColumnMapping::derive(&list, &list, &HashMap::new())
    }

    #[test]
    fn table_name_conventions() {
        assert_eq!(ghost_table_name("orders"), "_orders_gho");
        assert_eq!(old_table_name("orders"), "_orders_del");
        assert_eq!(changelog_table_name("orders"), "_orders_ghc");
    }

    #[test]
    fn quoting_escapes_backticks() {
        assert_eq!(quote_name("weird`name"), "`weird``name`");
        assert_eq!(quote_table("shop", "orders"), "`shop`.`orders`");
    }

    #[test]
    fn range_extremes_query() {
        let uk = unique_key(&["id"]);
        let query = build_range_extremes_query("shop", "orders", &uk, true);
        assert_eq!(
            query,
            "select /* molt */ `id` from `shop`.`orders` order by `id` asc limit 1"
        );
    }

    #[test]
    fn next_chunk_boundary_single_column() {
        let uk = unique_key(&["id"]);
        let (query, params) = build_next_chunk_boundary_query(
            "shop",
            "orders",
            &uk,
            &[ColumnValue::Int(100)],
            false,
            1000,
        );
        assert_eq!(
            query,
            "select /* molt */ `id` from `shop`.`orders` force index (`PRIMARY`) \
             where ((`id` > ?)) order by `id` asc limit 1 offset 999"
        );
        assert_eq!(params, vec![ColumnValue::Int(100)]);
    }

    #[test]
    fn next_chunk_boundary_composite_key() {
        let uk = unique_key(&["a", "b"]);
        let (query, params) = build_next_chunk_boundary_query(
            "shop",
            "orders",
            &uk,
            &[ColumnValue::Int(1), ColumnValue::Int(2)],
            true,
            500,
        );
        assert!(query.contains("((`a` > ?) or (`a` = ? and `b` >= ?))"));
        assert!(query.ends_with("limit 1 offset 499"));
        assert_eq!(
            params,
            vec![
                ColumnValue::Int(1),
                ColumnValue::Int(1),
                ColumnValue::Int(2)
            ]
        );
    }

    #[test]
    fn chunk_insert_uses_insert_ignore_and_share_lock() {
        let uk = unique_key(&["id"]);
        let mapping = identity_mapping(&["id", "name"]);
        let (query, params) = build_chunk_insert_query(
            "shop",
            "orders",
            "_orders_gho",
            &mapping,
            &uk,
            &[ColumnValue::Int(1)],
            &[ColumnValue::Int(1000)],
            true,
            &OptimizerHints::default(),
        );

        assert_eq!(
            query,
            "insert /* molt */ ignore into `shop`.`_orders_gho` (`id`, `name`) \
             (select `id`, `name` from `shop`.`orders` force index (`PRIMARY`) \
             where ((`id` >= ?)) and ((`id` <= ?)) lock in share mode)"
        );
        assert_eq!(params, vec![ColumnValue::Int(1), ColumnValue::Int(1000)]);
    }

    #[test]
    fn chunk_insert_carries_optimizer_hints() {
        let uk = unique_key(&["id"]);
        let mapping = identity_mapping(&["id"]);
        let hints = OptimizerHints {
            resource_group: Some("migration".to_string()),
            max_execution_time_ms: Some(1000),
        };
        let (query, _) = build_chunk_insert_query(
            "shop",
            "orders",
            "_orders_gho",
            &mapping,
            &uk,
            &[ColumnValue::Int(1)],
            &[ColumnValue::Int(2)],
            false,
            &hints,
        );
        assert!(query.starts_with(
            "insert /* molt */ /*+ RESOURCE_GROUP(migration) MAX_EXECUTION_TIME(1000) */ ignore"
        ));
    }

    fn nullable_key(name: &str) -> UniqueKey {
        UniqueKey::new(
            format!("{name}_uidx"),
            ColumnList::new(vec![Column::new(name, ColumnKind::Text, true)]),
        )
    }

    #[test]
    fn null_cursor_renders_null_safe_lower_bounds() {
        let uk = nullable_key("code");

        // First chunk starting at a NULL minimum: everything is in range.
        let (query, params) = build_next_chunk_boundary_query(
            "shop",
            "orders",
            &uk,
            &[ColumnValue::Null],
            true,
            100,
        );
        assert!(query.contains("where (1 = 1)"), "{query}");
        assert!(params.is_empty());

        // Subsequent chunks start just past the NULL rows.
        let (query, params) = build_next_chunk_boundary_query(
            "shop",
            "orders",
            &uk,
            &[ColumnValue::Null],
            false,
            100,
        );
        assert!(query.contains("where ((`code` is not null))"), "{query}");
        assert!(params.is_empty());
    }

    #[test]
    fn null_upper_bound_matches_only_the_null_rows() {
        let uk = nullable_key("code");
        let mapping = identity_mapping(&["code"]);
        let (query, params) = build_chunk_insert_query(
            "shop",
            "orders",
            "_orders_gho",
            &mapping,
            &uk,
            &[ColumnValue::Null],
            &[ColumnValue::Null],
            true,
            &OptimizerHints::default(),
        );
        assert!(query.contains("where (1 = 1) and ((`code` is null))"), "{query}");
        assert!(params.is_empty());
    }

    #[test]
    fn nullable_upper_bound_keeps_null_rows_in_range() {
        let uk = nullable_key("code");
        let mapping = identity_mapping(&["code"]);
        let (query, params) = build_chunk_insert_query(
            "shop",
            "orders",
            "_orders_gho",
            &mapping,
            &uk,
            &[ColumnValue::Null],
            &[ColumnValue::Text("m".into())],
            true,
            &OptimizerHints::default(),
        );
        assert!(
            query.contains("(`code` <= ? or `code` is null)"),
            "{query}"
        );
        assert_eq!(params, vec![ColumnValue::Text("m".into())]);
    }

    #[test]
    fn nullable_equality_conjuncts_use_null_safe_operator() {
        let uk = UniqueKey::new(
            "code_seq_uidx",
            ColumnList::new(vec![
                Column::new("code", ColumnKind::Text, true),
                Column::new("seq", ColumnKind::SignedInteger, false),
            ]),
        );
        let (query, params) = build_next_chunk_boundary_query(
            "shop",
            "orders",
            &uk,
            &[ColumnValue::Null, ColumnValue::Int(5)],
            false,
            100,
        );
        assert!(
            query.contains("((`code` is not null) or (`code` <=> ? and `seq` > ?))"),
            "{query}"
        );
        assert_eq!(params, vec![ColumnValue::Null, ColumnValue::Int(5)]);
    }

    #[test]
    fn dml_insert_becomes_replace() {
        let mapping = identity_mapping(&["id", "name"]);
        let (query, params) = build_dml_insert_query(
            "shop",
            "_orders_gho",
            &mapping,
            &[ColumnValue::Int(7), ColumnValue::Text("x".into())],
        );
        assert_eq!(
            query,
            "replace /* molt */ into `shop`.`_orders_gho` (`id`, `name`) values (?, ?)"
        );
        assert_eq!(
            params,
            vec![ColumnValue::Int(7), ColumnValue::Text("x".into())]
        );
    }

    #[test]
    fn dml_insert_projects_dropped_columns_away() {
        let original = ColumnList::from_names(["id", "legacy", "name"]);
        let ghost = ColumnList::from_names(["id", "name"]);
        let mapping = ColumnMapping::derive(&original, &ghost, &HashMap::new());

        let (query, params) = build_dml_insert_query(
            "shop",
            "_orders_gho",
            &mapping,
            &[
                ColumnValue::Int(7),
                ColumnValue::Text("dropme".into()),
                ColumnValue::Text("x".into()),
            ],
        );
        assert!(query.contains("(`id`, `name`)"));
        assert_eq!(
            params,
            vec![ColumnValue::Int(7), ColumnValue::Text("x".into())]
        );
    }

    #[test]
    fn dml_update_keys_on_old_unique_key_values() {
        let mapping = identity_mapping(&["id", "name"]);
        let uk = unique_key(&["id"]);
        let (query, params) = build_dml_update_query(
            "shop",
            "_orders_gho",
            &mapping,
            &uk,
            &[ColumnValue::Int(7)],
            &[ColumnValue::Int(8), ColumnValue::Text("y".into())],
        );
        assert_eq!(
            query,
            "update /* molt */ `shop`.`_orders_gho` set `id` = ?, `name` = ? where `id` <=> ?"
        );
        assert_eq!(
            params,
            vec![
                ColumnValue::Int(8),
                ColumnValue::Text("y".into()),
                ColumnValue::Int(7)
            ]
        );
    }

    #[test]
    fn dml_delete_keys_on_old_unique_key_values() {
        let mapping = identity_mapping(&["id", "name"]);
        let uk = unique_key(&["id"]);
        let (query, params) =
            build_dml_delete_query("shop", "_orders_gho", &mapping, &uk, &[ColumnValue::Int(7)]);
        assert_eq!(
            query,
            "delete /* molt */ from `shop`.`_orders_gho` where `id` <=> ?"
        );
        assert_eq!(params, vec![ColumnValue::Int(7)]);
    }

    #[test]
    fn dml_queries_follow_renamed_key_columns() {
        let original = ColumnList::new(vec![
            Column::new("uuid", ColumnKind::Text, false),
            Column::new("name", ColumnKind::Text, false),
        ]);
        let ghost = ColumnList::from_names(["guid", "name"]);
        let mut renames = HashMap::new();
        renames.insert("uuid".to_string(), "guid".to_string());
        let mapping = ColumnMapping::derive(&original, &ghost, &renames);
        let uk = UniqueKey::new("uuid_uidx", ColumnList::from_names(["uuid"]));

        let (query, _) = build_dml_delete_query(
            "shop",
            "_orders_gho",
            &mapping,
            &uk,
            &[ColumnValue::Text("k".into())],
        );
        assert!(query.contains("`guid` <=> ?"));
    }

    #[test]
    fn swap_query_renames_both_tables_in_one_statement() {
        let query = build_swap_tables_query("shop", "orders", "_orders_del", "_orders_gho");
        assert_eq!(
            query,
            "rename /* molt */ table `shop`.`orders` to `shop`.`_orders_del`, \
             `shop`.`_orders_gho` to `shop`.`orders`"
        );
    }

    #[test]
    fn changelog_ddl_has_hint_unique_key() {
        let query = build_create_changelog_table_query("shop", "_orders_ghc");
        assert!(query.contains("unique key hint_uidx(hint)"));
        assert!(query.contains("auto_increment=256"));
    }

    #[test]
    fn cut_over_lock_covers_original_and_sentry() {
        let query = build_cut_over_lock_query("shop", "orders", "_orders_del");
        assert_eq!(
            query,
            "lock /* molt */ tables `shop`.`orders` write, `shop`.`_orders_del` write"
        );
    }
}
