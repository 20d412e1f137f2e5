//! The Patch Assembler (C5): turns a branch diff plus pending ledger queries
//! into numbered, per-database `.sql` bundles (§4.5).

use std::collections::BTreeMap;
use std::fs;

use anyhow::{Context, Result};
use log::{info, warn};
use regex::Regex;

use crate::config::GitDbConfig;
use crate::db::DbAdapter;
use crate::differ;
use crate::layout;
use crate::ledger;
use crate::vcs::{ChangeKind, Vcs};

#[derive(Debug, Clone)]
pub struct PatchEntry {
    pub file_path: String,
    pub content: String,
}

#[derive(Debug, Clone, Default)]
pub struct PatchData {
    pub new: Vec<PatchEntry>,
    pub update: Vec<PatchEntry>,
    pub delete: Vec<PatchEntry>,
}

impl PatchData {
    fn is_empty(&self) -> bool {
        self.new.is_empty() && self.update.is_empty() && self.delete.is_empty()
    }
}

type PatchMap = BTreeMap<String, PatchData>;

pub struct AssembleOptions {
    pub overwrite: bool,
    /// Accepted per §6.1's `patch create [name]` signature, but numbering
    /// is always `simple` (§4.5) and the ledger's `patch.name` is always
    /// `patch_<N>` — see DESIGN.md for why this is a no-op placeholder
    /// rather than wired to an alternate naming scheme.
    pub name: Option<String>,
}

/// Returns the patch number that was written, or `None` if there was
/// nothing to patch (§4.5 step 9).
pub fn assemble(
    vcs: &Vcs,
    cfg: &GitDbConfig,
    db_adapter: &DbAdapter,
    options: &AssembleOptions,
) -> Result<Option<u32>> {
    let active_branch = vcs.active_branch()?;
    let mut branch_cfg = cfg.load_branch(vcs, &active_branch)?;

    let database = match branch_cfg.database.clone() {
        Some(d) => d,
        None => match &cfg.default_database {
            Some(default) => {
                cfg.set_branch_database(vcs, &active_branch, default)?;
                branch_cfg.database = Some(default.clone());
                default.clone()
            }
            None => return Err(anyhow::anyhow!("branch \"{active_branch}\" is not tracking any database")),
        },
    };
    let patch_target = cfg.database_branch(&database);

    let mut patch_map: PatchMap = BTreeMap::new();
    stage_file_diffs(vcs, &patch_target, &active_branch, &mut patch_map)?;

    let managed_databases = vcs.list_top_level_dirs(&patch_target)?;
    for db in &managed_databases {
        patch_map.entry(db.clone()).or_default();
    }

    let candidate_number = if options.overwrite { branch_cfg.current.max(1) } else { branch_cfg.current + 1 };
    // The ledger's `patch.name` always mirrors the directory name
    // (`patch_<N>`, §3.2's uniqueness invariant) — `options.name` is accepted
    // for forward compatibility with the CLI surface in §6.1 but does not
    // yet feed an alternate naming scheme. See DESIGN.md.
    let patch_name = layout::patch_dir_name(candidate_number);
    if let Some(requested) = &options.name {
        info!("ignoring requested patch name \"{requested}\"; patches are always numbered \"{patch_name}\"");
    }

    let workdir = vcs.workdir()?;
    stage_pending_queries(db_adapter, &managed_databases, &patch_name, &workdir, &mut patch_map)?;

    if patch_map.values().all(PatchData::is_empty) {
        info!("Nothing to patch");
        return Ok(None);
    }

    let number = if options.overwrite { branch_cfg.current.max(1) } else { candidate_number };
    let dir = workdir.join(layout::patch_dir(number));
    if options.overwrite && dir.is_dir() {
        fs::remove_dir_all(&dir)?;
    }
    fs::create_dir_all(&dir)?;

    for (db, data) in &patch_map {
        if data.is_empty() {
            continue;
        }
        let rendered = render_bundle(data);
        let bundle_path = workdir.join(layout::patch_bundle_file(number, db));
        fs::write(&bundle_path, rendered).with_context(|| format!("writing {}", bundle_path.display()))?;
        info!("wrote patch bundle for database \"{db}\" to {}", bundle_path.display());
    }

    if !options.overwrite {
        cfg.set_branch_current(vcs, &active_branch, number)?;
    }

    Ok(Some(number))
}

fn stage_file_diffs(vcs: &Vcs, patch_target: &str, active_branch: &str, patch_map: &mut PatchMap) -> Result<()> {
    for entry in vcs.diff(patch_target, active_branch)? {
        match entry.change_kind {
            ChangeKind::Added => {
                if let Some(path) = &entry.path_b {
                    if let Some(parts) = layout::parse_table_path(path) {
                        let content = entry.blob_b.clone().unwrap_or_default();
                        patch_map.entry(parts.db).or_default().new.push(PatchEntry { file_path: path.clone(), content });
                    }
                }
            }
            ChangeKind::Deleted => {
                if let Some(path) = &entry.path_a {
                    if let Some(parts) = layout::parse_table_path(path) {
                        let content = format!("DROP TABLE IF EXISTS {}.{};\n\n", parts.schema, parts.table);
                        patch_map.entry(parts.db).or_default().delete.push(PatchEntry { file_path: path.clone(), content });
                    }
                }
            }
            ChangeKind::Modified => match (&entry.path_a, &entry.path_b) {
                (Some(a), Some(b)) if a == b => {
                    if let Some(parts) = layout::parse_table_path(b) {
                        let qualified = format!("{}.{}", parts.schema, parts.table);
                        let target_blob = entry.blob_a.clone().unwrap_or_default();
                        let current_blob = entry.blob_b.clone().unwrap_or_default();
                        let diffed = differ::diff_table(&target_blob, &current_blob, &qualified);
                        if !diffed.is_empty() {
                            patch_map.entry(parts.db).or_default().update.push(PatchEntry { file_path: b.clone(), content: diffed });
                        }
                    } else if let Some(db) = layout::managed_database_name(b) {
                        // Only tables are diffed structurally (§9 Design Notes,
                        // Open Questions); anything else is shipped whole.
                        let content = entry.blob_b.clone().unwrap_or_default();
                        patch_map.entry(db).or_default().update.push(PatchEntry { file_path: b.clone(), content });
                    }
                }
                _ => {
                    // A rename: ship the new side as a plain addition (§4.5 step 6).
                    if let Some(b) = &entry.path_b {
                        if let Some(db) = layout::managed_database_name(b) {
                            let content = entry.blob_b.clone().unwrap_or_default();
                            patch_map.entry(db).or_default().new.push(PatchEntry { file_path: b.clone(), content });
                        }
                    }
                }
            },
        }
    }
    Ok(())
}

/// Registers `patch_name` in every managed database's ledger that is about
/// to receive a bundle — either because file diffs already staged content
/// for it, or because it has pending query files to fold in — and folds
/// those pending queries into the patch map. A database with neither is
/// left untouched: nothing will be written for it, so no ledger row should
/// be registered either (§3.2's "one row per patch bundle ever registered"
/// means ever-*emitted* bundle, not every database that merely exists).
fn stage_pending_queries(
    db_adapter: &DbAdapter,
    managed_databases: &[String],
    patch_name: &str,
    workdir: &std::path::Path,
    patch_map: &mut PatchMap,
) -> Result<()> {
    for db in managed_databases {
        let mut client = match db_adapter.connect(Some(db)) {
            Ok(client) => client,
            Err(e) => {
                warn!("LedgerBootstrap: could not connect to \"{db}\" to check for pending queries: {e}");
                continue;
            }
        };
        if let Err(e) = ledger::ensure_schema(&mut client) {
            warn!("LedgerBootstrap: could not initialize ledger in \"{db}\": {e}");
            continue;
        }

        let existing_patch_id = ledger::find_patch_id(&mut client, patch_name)?;
        let pending = ledger::pending_queries(&mut client, existing_patch_id)?;
        let has_staged_content = patch_map.get(db).map(|data| !data.is_empty()).unwrap_or(false);
        if pending.is_empty() && !has_staged_content {
            continue;
        }

        let patch_id = ledger::ensure_patch(&mut client, patch_name)?;
        for query in pending {
            let abs = workdir.join(&query.path);
            let content = fs::read_to_string(&abs).with_context(|| format!("reading query file {}", abs.display()))?;
            patch_map.entry(db.clone()).or_default().new.push(PatchEntry { file_path: query.path.clone(), content });
            ledger::attach_query_to_patch(&mut client, query.id, patch_id)?;
        }
    }
    Ok(())
}

/// Emission order is delete → new → update (§3.3): drops free up names
/// before creates, alterations apply last. Each entry is preceded by a
/// `-- <path>` comment, and runs of ≥2 blank lines are collapsed to one.
fn render_bundle(data: &PatchData) -> String {
    let mut out = String::new();
    for entry in data.delete.iter().chain(data.new.iter()).chain(data.update.iter()) {
        out.push_str("-- ");
        out.push_str(&entry.file_path);
        out.push('\n');
        out.push_str(&entry.content);
        if !entry.content.ends_with('\n') {
            out.push('\n');
        }
    }
    collapse_blank_lines(&out)
}

fn collapse_blank_lines(text: &str) -> String {
    let re = Regex::new(r"\n{3,}").unwrap();
    re.replace_all(text, "\n\n").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emission_order_is_delete_then_new_then_update() {
        let data = PatchData {
            new: vec![PatchEntry { file_path: "app/structure/s/tables/new.sql".into(), content: "CREATE TABLE s.new (id int);\n".into() }],
            update: vec![PatchEntry { file_path: "app/structure/s/tables/t.sql".into(), content: "ALTER TABLE s.t\n\tADD COLUMN IF NOT EXISTS x int;\n\n".into() }],
            delete: vec![PatchEntry { file_path: "app/structure/s/tables/old.sql".into(), content: "DROP TABLE IF EXISTS s.old;\n\n".into() }],
        };
        let rendered = render_bundle(&data);
        let drop_pos = rendered.find("DROP TABLE").unwrap();
        let create_pos = rendered.find("CREATE TABLE").unwrap();
        let alter_pos = rendered.find("ALTER TABLE").unwrap();
        assert!(drop_pos < create_pos);
        assert!(create_pos < alter_pos);
    }

    #[test]
    fn every_entry_is_preceded_by_its_path_comment() {
        let data = PatchData {
            new: vec![PatchEntry { file_path: "app/structure/s/tables/new.sql".into(), content: "CREATE TABLE s.new (id int);\n".into() }],
            ..Default::default()
        };
        let rendered = render_bundle(&data);
        assert_eq!(rendered, "-- app/structure/s/tables/new.sql\nCREATE TABLE s.new (id int);\n");
    }

    #[test]
    fn collapses_long_runs_of_blank_lines() {
        let data = PatchData {
            delete: vec![PatchEntry { file_path: "a".into(), content: "DROP TABLE IF EXISTS s.old;\n\n\n\n".into() }],
            ..Default::default()
        };
        let rendered = render_bundle(&data);
        assert!(!rendered.contains("\n\n\n"));
    }
}
