//! The semantic table differ (C4): given two versions of a table's DDL dump,
//! produce a minimal forward `ALTER TABLE` plus a passthrough region for any
//! other statement that changed.

use regex::Regex;

struct Statement {
    /// Original-case text exactly as split out of the source file.
    original: String,
    /// Same text with all `\n`/`\r` removed, case preserved. Used for
    /// matching the `create table` keyword (which may span lines in a
    /// pg_dump-style column list) and for building normalized keys.
    flattened: String,
}

fn strip_line_comments(text: &str) -> String {
    let comment_re = Regex::new(r"^\s*--").unwrap();
    text.lines()
        .filter(|line| !comment_re.is_match(line))
        .collect::<Vec<_>>()
        .join("\n")
}

fn split_statements(text: &str) -> Vec<Statement> {
    strip_line_comments(text)
        .split(';')
        .map(|piece| Statement {
            original: piece.to_string(),
            flattened: piece.chars().filter(|c| *c != '\n' && *c != '\r').collect(),
        })
        .collect()
}

/// Whitespace is removed entirely (not case-folded) to build a comparison key.
fn normalized_key(text: &str) -> String {
    text.chars().filter(|c| !c.is_whitespace()).collect()
}

struct ClassifiedStatements {
    /// Column-list region of the first matching `create table`, flattened
    /// (no newlines), case preserved.
    create_table_columns: Option<String>,
    remaining: Vec<Statement>,
}

fn classify(statements: Vec<Statement>, qualified_table: &str) -> ClassifiedStatements {
    let pattern = format!(
        r"(?i)create\s+table\s*{}\s*\((.*)\)",
        regex::escape(qualified_table),
    );
    let create_re = Regex::new(&pattern).expect("qualified table name produces a valid regex");

    let mut create_table_columns = None;
    let mut remaining = Vec::new();
    let mut found = false;

    for statement in statements {
        if !found {
            if let Some(captures) = create_re.captures(&statement.flattened) {
                create_table_columns = Some(captures.get(1).unwrap().as_str().to_string());
                found = true;
                continue;
            }
        }
        remaining.push(statement);
    }

    ClassifiedStatements { create_table_columns, remaining }
}

struct Column {
    key: String,
    definition: String,
}

fn split_columns(column_region: &str) -> Vec<Column> {
    column_region
        .split(',')
        .map(|piece| Column { key: normalized_key(piece), definition: piece.to_string() })
        .collect()
}

/// Produces the `DROP COLUMN`/`ADD COLUMN` clauses, drops first, in the
/// enumeration order of their respective side. Returns the empty vec if the
/// column sets are identical.
fn diff_columns(target_region: &str, current_region: &str) -> Vec<String> {
    let target_columns = split_columns(target_region);
    let current_columns = split_columns(current_region);

    let current_keys: std::collections::HashSet<&str> =
        current_columns.iter().map(|c| c.key.as_str()).filter(|k| !k.is_empty()).collect();
    let target_keys: std::collections::HashSet<&str> =
        target_columns.iter().map(|c| c.key.as_str()).filter(|k| !k.is_empty()).collect();

    let mut clauses = Vec::new();

    for column in &target_columns {
        if column.key.is_empty() {
            continue;
        }
        if !current_keys.contains(column.key.as_str()) {
            let name = column.definition.trim_start().split_whitespace().next().unwrap_or("");
            clauses.push(format!("DROP COLUMN IF EXISTS {name}"));
        }
    }
    for column in &current_columns {
        if column.key.is_empty() {
            continue;
        }
        if !target_keys.contains(column.key.as_str()) {
            clauses.push(format!("ADD COLUMN IF NOT EXISTS {}", column.definition.trim_start()));
        }
    }

    clauses
}

fn diff_passthrough(target_remaining: &[Statement], current_remaining: &[Statement]) -> String {
    let target_keys: std::collections::HashSet<String> = target_remaining
        .iter()
        .map(|s| normalized_key(&s.flattened))
        .filter(|k| !k.is_empty())
        .collect();

    let mut out = String::new();
    for statement in current_remaining {
        let key = normalized_key(&statement.flattened);
        if key.is_empty() {
            continue;
        }
        if !target_keys.contains(key.as_str()) {
            out.push_str(statement.original.trim());
            out.push_str(";\n");
        }
    }
    out
}

/// Compares `target` (baseline) against `current` (working tree) for one
/// qualified table name (e.g. `"public.users"`) and returns the forward
/// migration fragment, or the empty string if nothing changed.
pub fn diff_table(target: &str, current: &str, qualified_table: &str) -> String {
    let target_classified = classify(split_statements(target), qualified_table);
    let current_classified = classify(split_statements(current), qualified_table);

    let mut alter_envelope = String::new();
    if let (Some(target_region), Some(current_region)) =
        (&target_classified.create_table_columns, &current_classified.create_table_columns)
    {
        let clauses = diff_columns(target_region, current_region);
        if !clauses.is_empty() {
            alter_envelope.push_str(&format!("ALTER TABLE {qualified_table}\n\t"));
            alter_envelope.push_str(&clauses.join(",\n\t"));
            alter_envelope.push_str(";\n\n");
        }
    }

    let passthrough = diff_passthrough(&target_classified.remaining, &current_classified.remaining);

    format!("{alter_envelope}{passthrough}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_is_empty() {
        let ddl = "CREATE TABLE s.t (id int, name text);";
        assert_eq!(diff_table(ddl, ddl, "s.t"), "");
    }

    #[test]
    fn add_column() {
        let target = "CREATE TABLE s.t (id int);";
        let current = "CREATE TABLE s.t (id int, name text);";
        assert_eq!(
            diff_table(target, current, "s.t"),
            "ALTER TABLE s.t\n\tADD COLUMN IF NOT EXISTS name text;\n\n",
        );
    }

    #[test]
    fn drop_column() {
        let target = "CREATE TABLE s.t (id int, name text);";
        let current = "CREATE TABLE s.t (id int);";
        assert_eq!(
            diff_table(target, current, "s.t"),
            "ALTER TABLE s.t\n\tDROP COLUMN IF EXISTS name;\n\n",
        );
    }

    #[test]
    fn type_change_is_drop_then_add() {
        let target = "CREATE TABLE s.t (id int);";
        let current = "CREATE TABLE s.t (id bigint);";
        assert_eq!(
            diff_table(target, current, "s.t"),
            "ALTER TABLE s.t\n\tDROP COLUMN IF EXISTS id,\n\tADD COLUMN IF NOT EXISTS id bigint;\n\n",
        );
    }

    #[test]
    fn no_create_table_on_either_side_only_passthrough_runs() {
        let target = "GRANT SELECT ON s.t TO reader;";
        let current = "GRANT SELECT ON s.t TO reader;\nGRANT INSERT ON s.t TO writer;";
        let out = diff_table(target, current, "s.t");
        assert_eq!(out, "GRANT INSERT ON s.t TO writer;\n");
    }

    #[test]
    fn passthrough_statement_appears_verbatim() {
        let target = "CREATE TABLE s.t (id int);";
        let current = "CREATE TABLE s.t (id int);\nCOMMENT ON TABLE s.t IS 'a note';";
        let out = diff_table(target, current, "s.t");
        assert_eq!(out, "COMMENT ON TABLE s.t IS 'a note';\n");
    }

    #[test]
    fn identical_passthrough_statement_after_whitespace_normalization_is_dropped() {
        let target = "CREATE TABLE s.t (id int);\nCOMMENT ON TABLE s.t IS 'a note';";
        let current = "CREATE TABLE s.t (id int);\nCOMMENT   ON TABLE s.t\nIS 'a note';";
        assert_eq!(diff_table(target, current, "s.t"), "");
    }

    #[test]
    fn blank_statements_from_trailing_semicolon_are_ignored() {
        let ddl = "CREATE TABLE s.t (id int);\n";
        assert_eq!(diff_table(ddl, ddl, "s.t"), "");
    }

    #[test]
    fn multiline_column_list_is_supported() {
        let target = "CREATE TABLE s.t (\n\tid int,\n\tname text\n);";
        let current = "CREATE TABLE s.t (\n\tid int\n);";
        assert_eq!(
            diff_table(target, current, "s.t"),
            "ALTER TABLE s.t\n\tDROP COLUMN IF EXISTS name;\n\n",
        );
    }

    #[test]
    fn dot_in_qualified_name_is_literal() {
        // "sXt" would satisfy the pattern "s.t" if `.` matched any character;
        // since it's escaped to a literal dot, neither side is recognized as
        // the create-table statement, so the whole statement falls through
        // to passthrough instead of being parsed into columns.
        let target = "CREATE TABLE sXt (id int);";
        let current = "CREATE TABLE sXt (id int, extra int);";
        let out = diff_table(target, current, "s.t");
        assert_eq!(out, "CREATE TABLE sXt (id int, extra int);\n");
    }
}
