//! A thin, validated wrapper over the VCS Adapter's config store (§6.2,
//! §10.3). This module never parses or writes the git config file itself —
//! every read/write goes through [`Vcs::config_get`]/[`Vcs::config_set`].

use anyhow::{anyhow, Context, Result};
use std::io::{self, Write};

use crate::vcs::Vcs;

pub const GIT_DB_SECTION: &str = "git-db";
pub const DEFAULT_CONFIG_SECTION_PREFIX: &str = "database";
pub const DEFAULT_DATABASE_BRANCH_PREFIX: &str = "database";
pub const DEFAULT_PORT: u16 = 5432;
pub const DEFAULT_NUMBERING: &str = "simple";
pub const DEFAULT_QUERY_NAME_TEMPLATE: &str = "{branch}/{timestamp}.sql";
pub const DEFAULT_STOREMIGRATIONS: &str = "true";

/// Every `git-db.*` key §6.2 documents, in the order `init` writes them.
/// Keys with no natural default (`database`, `defaultdatabase`, `ignoredb`,
/// `ignoreschema`) are written as empty strings — present and inspectable,
/// but not yet pointing anywhere.
const DOCUMENTED_DEFAULTS: &[(&str, &str)] = &[
    ("configsectionprefix", DEFAULT_CONFIG_SECTION_PREFIX),
    ("databasebranchprefix", DEFAULT_DATABASE_BRANCH_PREFIX),
    ("database", ""),
    ("defaultdatabase", ""),
    ("storemigrations", DEFAULT_STOREMIGRATIONS),
    ("ignoredb", ""),
    ("ignoreschema", ""),
    ("query_name", DEFAULT_QUERY_NAME_TEMPLATE),
];

/// The key name the source read as a copy-paste bug (§9/Open Questions).
/// Rejected outright rather than silently treated as an alias for
/// `ignoreschema`.
const FORBIDDEN_KEY: &str = "ignore_schema";

#[derive(Debug, Clone)]
pub struct GitDbConfig {
    pub config_section_prefix: String,
    pub database_branch_prefix: String,
    pub default_database: Option<String>,
    pub query_name_template: String,
    /// Database names the Materializer skips entirely (§4.1/§6.2 `ignoredb`).
    pub ignore_databases: Vec<String>,
    /// Schema names the Materializer skips in every database, on top of the
    /// always-excluded system schemas (§4.1/§6.2 `ignoreschema`).
    pub ignore_schemas: Vec<String>,
}

impl GitDbConfig {
    /// `git-db init` (§6.1): writes every documented `git-db.*` key that
    /// isn't already present, so `.git/config` carries a visible, complete
    /// `[git-db]` section immediately after init rather than relying on
    /// in-memory fallback defaults the user can't inspect.
    pub fn write_defaults(vcs: &Vcs) -> Result<()> {
        for (key, default) in DOCUMENTED_DEFAULTS {
            if !vcs.config_has(GIT_DB_SECTION, key)? {
                vcs.config_set(GIT_DB_SECTION, key, default)?;
            }
        }
        Ok(())
    }

    pub fn load(vcs: &Vcs) -> Result<GitDbConfig> {
        validate_no_forbidden_keys(vcs)?;

        let config_section_prefix =
            vcs.config_get(GIT_DB_SECTION, "configsectionprefix", DEFAULT_CONFIG_SECTION_PREFIX)?;
        let database_branch_prefix =
            vcs.config_get(GIT_DB_SECTION, "databasebranchprefix", DEFAULT_DATABASE_BRANCH_PREFIX)?;
        let default_database = if vcs.config_has(GIT_DB_SECTION, "defaultdatabase")? {
            Some(vcs.config_get(GIT_DB_SECTION, "defaultdatabase", "")?)
        } else {
            None
        };
        let query_name_template = vcs.config_get(GIT_DB_SECTION, "query_name", DEFAULT_QUERY_NAME_TEMPLATE)?;
        let ignore_databases = parse_csv_list(&vcs.config_get(GIT_DB_SECTION, "ignoredb", "")?);
        let ignore_schemas = parse_csv_list(&vcs.config_get(GIT_DB_SECTION, "ignoreschema", "")?);

        Ok(GitDbConfig {
            config_section_prefix,
            database_branch_prefix,
            default_database,
            query_name_template,
            ignore_databases,
            ignore_schemas,
        })
    }

    pub fn database_branch(&self, remote_name: &str) -> String {
        format!("{}/{}", self.database_branch_prefix, remote_name)
    }

    fn remote_section(&self, remote_name: &str) -> String {
        format!("{}.{}", self.config_section_prefix, remote_name)
    }

    pub fn load_remote(&self, vcs: &Vcs, remote_name: &str) -> Result<RemoteConfig> {
        let section = self.remote_section(remote_name);
        let url = vcs.config_get(&section, "url", "")?;
        if url.is_empty() {
            return Err(anyhow!("database \"{remote_name}\" does not exist (no remote configured)"));
        }
        let port: u16 = vcs
            .config_get(&section, "port", &DEFAULT_PORT.to_string())?
            .parse()
            .context("invalid port in config")?;
        let mut user = vcs.config_get(&section, "user", "")?;
        if user.is_empty() {
            user = prompt("username: ")?;
        }
        let mut password = vcs.config_get(&section, "password", "")?;
        if password.is_empty() {
            password = rpassword::prompt_password("password: ").context("reading password")?;
        }
        Ok(RemoteConfig { url, port, user, password })
    }

    /// `database add`: register a remote's connection info. Returns an
    /// error if the name is already registered (matches the source's
    /// refusal to silently overwrite).
    pub fn add_remote(
        &self,
        vcs: &Vcs,
        remote_name: &str,
        host: &str,
        port: Option<u16>,
        user: Option<&str>,
        password: Option<&str>,
    ) -> Result<()> {
        let section = self.remote_section(remote_name);
        if vcs.config_has(&section, "url")? {
            return Err(anyhow!("database \"{remote_name}\" already exists"));
        }
        vcs.config_set(&section, "url", host)?;
        if let Some(port) = port {
            vcs.config_set(&section, "port", &port.to_string())?;
        }
        if let Some(user) = user {
            vcs.config_set(&section, "user", user)?;
        }
        if let Some(password) = password {
            vcs.config_set(&section, "password", password)?;
        }
        Ok(())
    }

    pub fn load_branch(&self, vcs: &Vcs, branch: &str) -> Result<BranchConfig> {
        let section = format!("branch.{branch}");
        let database =
            if vcs.config_has(&section, "database")? { Some(vcs.config_get(&section, "database", "")?) } else { None };
        let numbering = vcs.config_get(&section, "numbering", DEFAULT_NUMBERING)?;
        let current: u32 = vcs.config_get(&section, "current", "0")?.parse().unwrap_or(0);
        Ok(BranchConfig { database, numbering, current })
    }

    pub fn set_branch_database(&self, vcs: &Vcs, branch: &str, database: &str) -> Result<()> {
        vcs.config_set(&format!("branch.{branch}"), "database", database)
    }

    pub fn set_branch_current(&self, vcs: &Vcs, branch: &str, current: u32) -> Result<()> {
        vcs.config_set(&format!("branch.{branch}"), "current", &current.to_string())
    }
}

/// `ignoredb`/`ignoreschema` are comma-separated lists of names; blank
/// entries (from a trailing comma or an unset key) are dropped.
fn parse_csv_list(raw: &str) -> Vec<String> {
    raw.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect()
}

fn validate_no_forbidden_keys(vcs: &Vcs) -> Result<()> {
    if vcs.config_has(GIT_DB_SECTION, FORBIDDEN_KEY)? {
        return Err(anyhow!(
            "config key '{GIT_DB_SECTION}.{FORBIDDEN_KEY}' is not recognized; did you mean 'ignoreschema'?"
        ));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub url: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct BranchConfig {
    pub database: Option<String>,
    pub numbering: String,
    pub current: u32,
}

fn prompt(label: &str) -> Result<String> {
    print!("{label}");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    Ok(line.trim_end_matches(['\n', '\r']).to_string())
}

/// Renders the `query_name` template (§6.2): `{branch}` is the active
/// branch name with `/` replaced by `_`; `{timestamp}` is Unix seconds.
pub fn render_query_name(template: &str, branch: &str, timestamp_secs: i64) -> String {
    let branch_slug = branch.replace('/', "_");
    template.replace("{branch}", &branch_slug).replace("{timestamp}", &timestamp_secs.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_query_name_template() {
        assert_eq!(
            render_query_name(DEFAULT_QUERY_NAME_TEMPLATE, "feature/x", 1_700_000_000),
            "feature_x/1700000000.sql",
        );
    }

    #[test]
    fn renders_a_custom_template_without_wildcards() {
        assert_eq!(render_query_name("adhoc.sql", "main", 42), "adhoc.sql");
    }

    #[test]
    fn parses_a_comma_separated_ignore_list() {
        assert_eq!(parse_csv_list("analytics, temp_db ,reporting"), vec!["analytics", "temp_db", "reporting"]);
    }

    #[test]
    fn empty_ignore_list_parses_to_nothing() {
        assert_eq!(parse_csv_list(""), Vec::<String>::new());
        assert_eq!(parse_csv_list(" , "), Vec::<String>::new());
    }

    fn fresh_repo(dir_name: &str) -> Result<Vcs> {
        let repo_path = std::path::PathBuf::from(dir_name);
        if repo_path.exists() {
            std::fs::remove_dir_all(&repo_path)?;
        }
        std::fs::create_dir_all(&repo_path)?;
        Vcs::init(&repo_path)
    }

    #[test]
    #[serial_test::serial]
    fn write_defaults_populates_every_documented_key() -> Result<()> {
        let vcs = fresh_repo("git_db_test_config_repo_defaults")?;

        GitDbConfig::write_defaults(&vcs)?;

        for (key, _) in DOCUMENTED_DEFAULTS {
            assert!(vcs.config_has(GIT_DB_SECTION, key)?, "missing key {key}");
        }
        assert_eq!(vcs.config_get(GIT_DB_SECTION, "configsectionprefix", "")?, DEFAULT_CONFIG_SECTION_PREFIX);
        assert_eq!(vcs.config_get(GIT_DB_SECTION, "query_name", "")?, DEFAULT_QUERY_NAME_TEMPLATE);

        std::fs::remove_dir_all("git_db_test_config_repo_defaults")?;
        Ok(())
    }

    #[test]
    #[serial_test::serial]
    fn write_defaults_does_not_overwrite_an_existing_key() -> Result<()> {
        let vcs = fresh_repo("git_db_test_config_repo_existing")?;
        vcs.config_set(GIT_DB_SECTION, "defaultdatabase", "prod")?;

        GitDbConfig::write_defaults(&vcs)?;

        assert_eq!(vcs.config_get(GIT_DB_SECTION, "defaultdatabase", "")?, "prod");

        std::fs::remove_dir_all("git_db_test_config_repo_existing")?;
        Ok(())
    }

    #[test]
    #[serial_test::serial]
    fn load_rejects_the_ignore_schema_key() -> Result<()> {
        let vcs = fresh_repo("git_db_test_config_repo_forbidden_key")?;
        vcs.config_set(GIT_DB_SECTION, FORBIDDEN_KEY, "analytics")?;

        let err = GitDbConfig::load(&vcs).expect_err("ignore_schema should be rejected");
        assert!(err.to_string().contains("ignoreschema"));

        std::fs::remove_dir_all("git_db_test_config_repo_forbidden_key")?;
        Ok(())
    }

    #[test]
    #[serial_test::serial]
    fn load_accepts_the_ignoreschema_key() -> Result<()> {
        let vcs = fresh_repo("git_db_test_config_repo_accepted_key")?;
        vcs.config_set(GIT_DB_SECTION, "ignoreschema", "analytics,temp")?;

        let cfg = GitDbConfig::load(&vcs)?;
        assert_eq!(cfg.ignore_schemas, vec!["analytics".to_string(), "temp".to_string()]);

        std::fs::remove_dir_all("git_db_test_config_repo_accepted_key")?;
        Ok(())
    }
}
