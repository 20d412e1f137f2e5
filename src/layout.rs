//! On-disk tree layout (§3.1): pure path construction and parsing, shared by
//! the Materializer, Assembler, and Applier. No I/O happens here.

use std::path::PathBuf;

pub const PATCHES_DIR: &str = "patches";
pub const QUERIES_DIR: &str = "queries";
pub const STRUCTURE_DIR: &str = "structure";
pub const TABLES_DIR: &str = "tables";

pub fn table_dir(db: &str, schema: &str) -> PathBuf {
    PathBuf::from(db).join(STRUCTURE_DIR).join(schema).join(TABLES_DIR)
}

pub fn table_file(db: &str, schema: &str, table: &str) -> PathBuf {
    table_dir(db, schema).join(format!("{table}.sql"))
}

pub fn queries_dir(db: &str) -> PathBuf {
    PathBuf::from(db).join(QUERIES_DIR)
}

pub fn patch_dir_name(n: u32) -> String {
    format!("patch_{n}")
}

pub fn patch_dir(n: u32) -> PathBuf {
    PathBuf::from(PATCHES_DIR).join(patch_dir_name(n))
}

pub fn patch_bundle_file(n: u32, db: &str) -> PathBuf {
    patch_dir(n).join(format!("{db}.sql"))
}

/// The three path components a managed table file is built from:
/// `<db>/structure/<schema>/tables/<table>.sql`.
#[derive(Debug, PartialEq, Eq)]
pub struct TablePathParts {
    pub db: String,
    pub schema: String,
    pub table: String,
}

/// Parses a slash-separated repo path (as produced by the VCS diff, not an
/// OS path) into its table components, or `None` if it doesn't have the
/// table-file shape.
pub fn parse_table_path(path: &str) -> Option<TablePathParts> {
    let parts: Vec<&str> = path.split('/').collect();
    if parts.len() != 5 {
        return None;
    }
    if parts[1] != STRUCTURE_DIR || parts[3] != TABLES_DIR {
        return None;
    }
    let table = parts[4].strip_suffix(".sql")?;
    if table.is_empty() || parts[0].is_empty() || parts[2].is_empty() {
        return None;
    }
    Some(TablePathParts { db: parts[0].to_string(), schema: parts[2].to_string(), table: table.to_string() })
}

/// The top-level directory name of any path under a managed database, or
/// `None` for a path with no directory component (shouldn't occur for
/// repo-tracked files, but keeps this total).
pub fn managed_database_name(path: &str) -> Option<String> {
    path.split('/').next().filter(|s| !s.is_empty() && *s != PATCHES_DIR).map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_well_formed_table_path() {
        assert_eq!(
            parse_table_path("app/structure/public/tables/users.sql"),
            Some(TablePathParts { db: "app".into(), schema: "public".into(), table: "users".into() }),
        );
    }

    #[test]
    fn rejects_non_table_paths() {
        assert_eq!(parse_table_path("app/queries/adhoc.sql"), None);
        assert_eq!(parse_table_path("app/structure/public/tables/nested/users.sql"), None);
        assert_eq!(parse_table_path("app/structure/public/views/users.sql"), None);
    }

    #[test]
    fn builds_the_expected_directories() {
        assert_eq!(table_dir("app", "public"), PathBuf::from("app/structure/public/tables"));
        assert_eq!(table_file("app", "public", "users"), PathBuf::from("app/structure/public/tables/users.sql"));
        assert_eq!(patch_bundle_file(3, "app"), PathBuf::from("patches/patch_3/app.sql"));
    }

    #[test]
    fn managed_database_name_skips_patches() {
        assert_eq!(managed_database_name("app/queries/a.sql"), Some("app".to_string()));
        assert_eq!(managed_database_name("patches/patch_1/app.sql"), None);
    }
}
