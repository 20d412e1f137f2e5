//! Command handlers (§6.1): one function per CLI verb, threading an explicit
//! `Vcs`/`GitDbConfig` context through each call rather than keeping any of
//! it as process-wide state (§9 Design Notes).

use std::fs;
use std::io::{self, Write};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use log::info;

use crate::assemble::{self, AssembleOptions};
use crate::apply;
use crate::config::{self, GitDbConfig};
use crate::db::DbAdapter;
use crate::layout;
use crate::ledger;
use crate::materialize;
use crate::vcs::Vcs;

pub fn init(vcs: &Vcs, path: &Path) -> Result<()> {
    GitDbConfig::write_defaults(vcs)?;
    // Touching the config once, through the validated loader, surfaces a
    // bad `ignore_schema` key immediately rather than on the first real use.
    GitDbConfig::load(vcs)?;
    info!("initialized git-db repository at {}", path.display());
    Ok(())
}

fn remote_db_adapter(vcs: &Vcs, cfg: &GitDbConfig, name: &str) -> Result<DbAdapter> {
    let remote = cfg.load_remote(vcs, name)?;
    Ok(DbAdapter::new(remote.url, remote.port, remote.user, remote.password))
}

pub fn database_add(
    vcs: &Vcs,
    cfg: &GitDbConfig,
    name: &str,
    host_arg: &str,
    user: Option<&str>,
    password: Option<&str>,
    set_default: bool,
) -> Result<()> {
    let (host, port) = match host_arg.split_once(':') {
        Some((host, port)) => (host, Some(port.parse::<u16>().context("invalid port")?)),
        None => (host_arg, None),
    };
    cfg.add_remote(vcs, name, host, port, user, password)?;
    if set_default {
        vcs.config_set(config::GIT_DB_SECTION, "defaultdatabase", name)?;
    }
    info!("registered database \"{name}\" ({host_arg})");
    Ok(())
}

pub fn database_check(vcs: &Vcs, cfg: &GitDbConfig, name: &str) -> Result<()> {
    let adapter = remote_db_adapter(vcs, cfg, name)?;
    let mut client = adapter.connect(None).with_context(|| format!("connecting to \"{name}\""))?;
    let row = client.query_one("SELECT version()", &[])?;
    let version: String = row.get(0);
    println!("{name}: {version}");
    Ok(())
}

pub fn database_pull(vcs: &Vcs, cfg: &GitDbConfig, name: &str) -> Result<()> {
    let adapter = remote_db_adapter(vcs, cfg, name)?;
    materialize::materialize(vcs, cfg, name, &adapter)
}

pub fn remote_add(vcs: &Vcs, cfg: &GitDbConfig, name: &str) -> Result<()> {
    // Validates that `name` was registered with `database add` first.
    cfg.load_remote(vcs, name)?;
    let branch = vcs.active_branch()?;
    cfg.set_branch_database(vcs, &branch, name)?;
    info!("branch \"{branch}\" now tracks database \"{name}\"");
    Ok(())
}

pub fn patch_create(vcs: &Vcs, cfg: &GitDbConfig, name: Option<String>, overwrite: bool) -> Result<()> {
    let branch = vcs.active_branch()?;
    let branch_cfg = cfg.load_branch(vcs, &branch)?;
    let database = branch_cfg
        .database
        .or_else(|| cfg.default_database.clone())
        .ok_or_else(|| anyhow!("branch \"{branch}\" is not tracking any database; run `remote add <name>` first"))?;
    let adapter = remote_db_adapter(vcs, cfg, &database)?;

    let options = AssembleOptions { overwrite, name };
    match assemble::assemble(vcs, cfg, &adapter, &options)? {
        Some(number) => println!("created {}", layout::patch_dir_name(number)),
        None => println!("nothing to patch"),
    }
    Ok(())
}

pub fn patch_apply(vcs: &Vcs, cfg: &GitDbConfig, remote: Option<String>, patch: Option<String>) -> Result<()> {
    let branch = vcs.active_branch()?;
    let branch_cfg = cfg.load_branch(vcs, &branch)?;

    let database = match remote {
        Some(r) => r,
        None => branch_cfg
            .database
            .clone()
            .ok_or_else(|| anyhow!("branch \"{branch}\" is not tracking any database; pass <remote> explicitly"))?,
    };
    let patch_name = patch.unwrap_or_else(|| layout::patch_dir_name(branch_cfg.current));

    if !confirm(&format!("apply \"{patch_name}\" to \"{database}\"? [y/n] "))? {
        println!("aborted");
        return Ok(());
    }

    let adapter = remote_db_adapter(vcs, cfg, &database)?;
    apply::apply_patch(vcs, &adapter, &patch_name)
}

pub fn query(vcs: &Vcs, cfg: &GitDbConfig, database: &str) -> Result<()> {
    let branch = vcs.active_branch()?;
    let timestamp = Utc::now().timestamp();
    let rendered = config::render_query_name(&cfg.query_name_template, &branch, timestamp);

    let relative = layout::queries_dir(database).join(&rendered);
    let workdir = vcs.workdir()?;
    let absolute = workdir.join(&relative);
    if let Some(parent) = absolute.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&absolute, "-- write your query here\n")?;

    let relative_str = relative.to_string_lossy().replace('\\', "/");
    let name = absolute.file_stem().and_then(|s| s.to_str()).unwrap_or(&rendered).to_string();
    // Derived the same way `apply::bootstrap_ledger` derives it for a
    // back-registered row: the file's parent directory relative to
    // `queries_dir(database)`, not the raw (unslugified) branch name.
    let queries_root = workdir.join(layout::queries_dir(database));
    let namespace = absolute
        .parent()
        .and_then(|p| p.strip_prefix(&queries_root).ok())
        .map(|p| p.to_string_lossy().replace('\\', "/"))
        .unwrap_or_default();

    let adapter = remote_db_adapter(vcs, cfg, database)?;
    let mut client = adapter.connect(Some(database)).with_context(|| format!("connecting to \"{database}\""))?;
    ledger::ensure_schema(&mut client)?;
    ledger::register_query(&mut client, &name, &namespace, &relative_str)?;

    info!("created query file {}", relative.display());
    println!("{}", relative.display());
    Ok(())
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{prompt}");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    let answer = line.trim().to_lowercase();
    Ok(answer == "y" || answer == "yes")
}
