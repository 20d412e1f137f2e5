//! The Materializer (C3): walks a live database and re-emits the working
//! tree's directory layout (§4.3).

use std::fs;

use anyhow::{anyhow, Result};
use log::info;

use crate::config::GitDbConfig;
use crate::db::DbAdapter;
use crate::layout;
use crate::vcs::Vcs;

pub fn materialize(vcs: &Vcs, cfg: &GitDbConfig, remote_name: &str, db_adapter: &DbAdapter) -> Result<()> {
    if vcs.has_uncommitted_changes()? {
        return Err(anyhow!(
            "DirtyTree: your working tree has uncommitted changes; commit or stash before pulling"
        ));
    }

    let branch_name = cfg.database_branch(remote_name);
    let message = if vcs.branch_exists(&branch_name)? {
        info!("pulling to existing database branch \"{branch_name}\"");
        vcs.checkout_branch(&branch_name)?;
        vcs.remove_all_tracked()?;
        "[GIT DB] pulled from remote"
    } else {
        info!("creating database branch \"{branch_name}\" for database \"{remote_name}\"");
        vcs.checkout_orphan(&branch_name)?;
        "[GIT DB] initial commit"
    };

    let workdir = vcs.workdir()?;

    let mut databases = db_adapter.list_databases()?;
    databases.retain(|db| !cfg.ignore_databases.iter().any(|ignored| ignored == db));
    databases.sort();

    for db in &databases {
        fs::create_dir_all(workdir.join(db))?;

        let mut schemas = db_adapter.list_schemas(db)?;
        schemas.retain(|schema| !cfg.ignore_schemas.iter().any(|ignored| ignored == schema));
        schemas.sort();

        for schema in &schemas {
            let tables_dir = workdir.join(layout::table_dir(db, schema));
            fs::create_dir_all(&tables_dir)?;

            info!("fetching table structure for \"{db}.{schema}\"");
            let mut tables = db_adapter.list_tables(db, schema)?;
            tables.sort();

            for table in &tables {
                let dest = workdir.join(layout::table_file(db, schema, table));
                db_adapter.dump_table_ddl(db, schema, table, &dest)?;
            }
        }
    }

    if vcs.add_all_and_commit(message)? {
        info!("committed materialized tree for \"{remote_name}\"");
    } else {
        info!("nothing to commit — tree already matches \"{remote_name}\"");
    }

    Ok(())
}
