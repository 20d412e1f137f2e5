mod apply;
mod assemble;
mod command;
mod config;
mod db;
mod differ;
mod layout;
mod ledger;
mod materialize;
mod vcs;

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use config::GitDbConfig;
use vcs::Vcs;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Version-control bridge for Postgres schemas")]
struct Args {
    /// working directory the repository lives in
    #[clap(long, default_value = ".")]
    path: PathBuf,

    #[clap(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// initialize the VCS repo if missing and write default git-db config keys
    Init,

    /// manage remote database registrations
    Database {
        #[clap(subcommand)]
        action: DatabaseAction,
    },

    /// set the active branch's tracked database
    Remote {
        #[clap(subcommand)]
        action: RemoteAction,
    },

    /// manage patch bundles
    Patch {
        #[clap(subcommand)]
        action: PatchAction,
    },

    /// create a new query file and register it in the ledger
    Query {
        database: String,
    },
}

#[derive(clap::Subcommand, Debug)]
enum DatabaseAction {
    /// register a database's connection info
    Add {
        name: String,
        /// `host` or `host:port`
        host: String,
        user: Option<String>,
        password: Option<String>,
        #[clap(long)]
        default: bool,
    },
    /// connect and report the server version
    Check { name: String },
    /// materialize a database's structure into the working tree
    Pull { name: String },
}

#[derive(clap::Subcommand, Debug)]
enum RemoteAction {
    Add { name: String },
}

#[derive(clap::Subcommand, Debug)]
enum PatchAction {
    /// assemble a patch bundle from the current branch's diff
    Create {
        name: Option<String>,
        #[clap(long)]
        overwrite: bool,
    },
    /// apply a patch bundle to its target database
    Apply {
        remote: Option<String>,
        patch: Option<String>,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    if let Command::Init = args.command {
        let vcs = Vcs::init(&args.path)?;
        return command::init(&vcs, &args.path);
    }

    let vcs = Vcs::open(&args.path)?;
    let cfg = GitDbConfig::load(&vcs)?;

    match args.command {
        Command::Init => unreachable!("handled above"),
        Command::Database { action } => match action {
            DatabaseAction::Add { name, host, user, password, default } => {
                command::database_add(&vcs, &cfg, &name, &host, user.as_deref(), password.as_deref(), default)
            }
            DatabaseAction::Check { name } => command::database_check(&vcs, &cfg, &name),
            DatabaseAction::Pull { name } => command::database_pull(&vcs, &cfg, &name),
        },
        Command::Remote { action } => match action {
            RemoteAction::Add { name } => command::remote_add(&vcs, &cfg, &name),
        },
        Command::Patch { action } => match action {
            PatchAction::Create { name, overwrite } => command::patch_create(&vcs, &cfg, name, overwrite),
            PatchAction::Apply { remote, patch } => command::patch_apply(&vcs, &cfg, remote, patch),
        },
        Command::Query { database } => command::query(&vcs, &cfg, &database),
    }
}
