//! The Patch Applier (C6): replays a staged patch bundle against its target
//! databases, one `BEGIN; ... COMMIT;` statement per database (§4.6).

use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use log::{info, warn};

use crate::db::DbAdapter;
use crate::ledger;
use crate::vcs::Vcs;

/// Applies `patch_name` to every database it has a bundle for. Failures on
/// one database are logged and isolated — they never stop the remaining
/// databases from being attempted (§4.6 step 5, §7 isolation).
pub fn apply_patch(vcs: &Vcs, db_adapter: &DbAdapter, patch_name: &str) -> Result<()> {
    let workdir = vcs.workdir()?;
    let patch_dir = workdir.join(crate::layout::PATCHES_DIR).join(patch_name);
    if !patch_dir.is_dir() {
        return Err(anyhow!("no such patch \"{patch_name}\" (expected {})", patch_dir.display()));
    }

    let mut bundles: Vec<(String, std::path::PathBuf)> = Vec::new();
    for entry in fs::read_dir(&patch_dir).with_context(|| format!("reading {}", patch_dir.display()))? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("sql") {
            continue;
        }
        let db = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default().to_string();
        if db.is_empty() {
            continue;
        }
        bundles.push((db, path));
    }
    bundles.sort_by(|a, b| a.0.cmp(&b.0));

    for (db, bundle_path) in bundles {
        info!("applying patch \"{patch_name}\" to database \"{db}\"");
        if let Err(e) = apply_one(vcs, db_adapter, &db, &bundle_path, patch_name) {
            warn!("DDLApplyFailure: patch \"{patch_name}\" failed against database \"{db}\": {e:#}");
        }
    }

    Ok(())
}

fn apply_one(vcs: &Vcs, db_adapter: &DbAdapter, db: &str, bundle_path: &Path, patch_name: &str) -> Result<()> {
    let existed = db_adapter.database_exists(db)?;
    if !existed {
        info!("creating missing database \"{db}\"");
        db_adapter.create_database(db)?;
        bootstrap_ledger(vcs, db_adapter, db)?;
    }

    let mut client = db_adapter.connect(Some(db)).with_context(|| format!("connecting to database {db}"))?;

    let sql = fs::read_to_string(bundle_path).with_context(|| format!("reading {}", bundle_path.display()))?;
    let wrapped = format!("BEGIN;\n{sql}\nCOMMIT;\n");

    match client.batch_execute(&wrapped) {
        Ok(()) => {
            info!("applied patch \"{patch_name}\" to \"{db}\"");
            if let Err(e) = ledger::ensure_schema(&mut client) {
                warn!("LedgerBootstrap: could not confirm ledger schema in \"{db}\" after apply: {e}");
                return Ok(());
            }
            // A schema-only bundle (no pending query files) never passed
            // through the Assembler's query phase, so nothing may have
            // registered this patch yet — ensure the row exists before
            // marking it applied, rather than let the UPDATE below no-op
            // against zero matching rows.
            ledger::ensure_patch(&mut client, patch_name)?;
            ledger::mark_patch_applied(&mut client, patch_name)?;
            ledger::mark_queries_applied_for_patch(&mut client, patch_name)?;
            Ok(())
        }
        Err(e) => {
            let _ = client.batch_execute("ROLLBACK;");
            Err(anyhow!(e)).context("executing patch bundle")
        }
    }
}

/// A freshly created database has no ledger yet. Initializes it, then
/// back-registers every query file already present under `<db>/queries/`
/// in the working tree so a later `patch create` doesn't re-stage history
/// that predates this database's own existence (§4.6 step 1).
fn bootstrap_ledger(vcs: &Vcs, db_adapter: &DbAdapter, db: &str) -> Result<()> {
    let mut client = match db_adapter.connect(Some(db)) {
        Ok(client) => client,
        Err(e) => {
            warn!("LedgerBootstrap: could not connect to newly created database \"{db}\": {e}");
            return Ok(());
        }
    };
    if let Err(e) = ledger::ensure_schema(&mut client) {
        warn!("LedgerBootstrap: could not initialize ledger in \"{db}\": {e}");
        return Ok(());
    }

    let workdir = vcs.workdir()?;
    let queries_root = workdir.join(crate::layout::queries_dir(db));
    if !queries_root.is_dir() {
        return Ok(());
    }

    for entry in walkdir::WalkDir::new(&queries_root).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        if entry.path().extension().and_then(|e| e.to_str()) != Some("sql") {
            continue;
        }
        let rel = entry.path().strip_prefix(&workdir).unwrap_or(entry.path());
        let rel_str = rel.to_string_lossy().replace('\\', "/");
        let name = entry.path().file_stem().and_then(|s| s.to_str()).unwrap_or_default();
        let namespace = entry
            .path()
            .parent()
            .and_then(|p| p.strip_prefix(&queries_root).ok())
            .map(|p| p.to_string_lossy().replace('\\', "/"))
            .unwrap_or_default();
        ledger::register_query(&mut client, name, &namespace, &rel_str)?;
    }
    Ok(())
}

#[cfg(test)]
mod integration {
    use super::*;
    use postgres::config::Host;

    fn test_db_adapter() -> DbAdapter {
        let url = std::env::var("PG_URL").expect("PG_URL must be set for ignored integration tests");
        let cfg: postgres::Config = url.parse().expect("PG_URL must be a valid postgres connection string");
        let host = cfg
            .get_hosts()
            .first()
            .and_then(|h| match h {
                Host::Tcp(s) => Some(s.clone()),
                #[allow(unreachable_patterns)]
                _ => None,
            })
            .unwrap_or_else(|| "localhost".to_string());
        let port = cfg.get_ports().first().copied().unwrap_or(5432);
        let user = cfg.get_user().unwrap_or("postgres").to_string();
        let password = cfg.get_password().map(|p| String::from_utf8_lossy(p).into_owned()).unwrap_or_default();
        DbAdapter::new(host, port, user, password)
    }

    /// Ledger coherence (§8 property 7): after a successful apply, the patch
    /// row and every query row attached to it are both marked applied.
    #[test]
    #[ignore]
    #[serial_test::serial]
    fn apply_marks_patch_and_bundle_applied() -> Result<()> {
        let adapter = test_db_adapter();
        let repo_path = std::path::PathBuf::from("git_db_test_apply_repo");
        if repo_path.exists() {
            fs::remove_dir_all(&repo_path)?;
        }
        fs::create_dir_all(&repo_path)?;
        let vcs = Vcs::init(&repo_path)?;

        let db_name = "git_db_apply_test";
        let mut admin = adapter.connect(None)?;
        let _ = admin.execute(&format!("DROP DATABASE IF EXISTS \"{db_name}\""), &[]);
        admin.execute(&format!("CREATE DATABASE \"{db_name}\""), &[])?;

        let bundle_dir = repo_path.join("patches").join("patch_1");
        fs::create_dir_all(&bundle_dir)?;
        fs::write(bundle_dir.join(format!("{db_name}.sql")), "CREATE TABLE public.widgets (id int);\n")?;

        let mut setup_client = adapter.connect(Some(db_name))?;
        ledger::ensure_schema(&mut setup_client)?;
        let patch_id = ledger::ensure_patch(&mut setup_client, "patch_1")?;
        let query_id = ledger::register_query(&mut setup_client, "adhoc", "main", "git_db_apply_test/queries/adhoc.sql")?;
        ledger::attach_query_to_patch(&mut setup_client, query_id, patch_id)?;

        apply_patch(&vcs, &adapter, "patch_1")?;

        let mut client = adapter.connect(Some(db_name))?;
        let row = client.query_one("SELECT applied FROM git_db.patch WHERE name = $1", &[&"patch_1"])?;
        let applied: bool = row.get(0);
        pretty_assertions::assert_eq!(applied, true);

        let query_row = client.query_one(
            "SELECT applied, applied_timestamp IS NOT NULL FROM git_db.query WHERE id = $1",
            &[&query_id],
        )?;
        let query_applied: bool = query_row.get(0);
        let query_applied_timestamp_set: bool = query_row.get(1);
        pretty_assertions::assert_eq!(query_applied, true);
        assert!(query_applied_timestamp_set);

        admin.execute(&format!("DROP DATABASE IF EXISTS \"{db_name}\""), &[])?;
        fs::remove_dir_all(&repo_path)?;
        Ok(())
    }
}
