//! The DB Adapter (C2): connections, enumeration, and the external dumper
//! invocation, over the synchronous `postgres` crate (matching the
//! single-threaded scheduling model of §5).

use std::path::Path;
use std::process::Command;

use anyhow::{anyhow, Context, Result};
use native_tls::TlsConnector;
use postgres::Config;
use postgres_native_tls::MakeTlsConnector;

const EXCLUDED_SCHEMAS: &[&str] = &["information_schema", "pg_catalog", "pg_toast", "pg_temp_1", "pg_toast_temp_1"];

/// The administrative database used for server-wide operations (listing/
/// creating databases) when no specific database is being targeted —
/// `template1` always exists and is never the user's own data.
const ADMIN_DATABASE: &str = "template1";

fn make_tls_connector() -> Result<MakeTlsConnector> {
    // Accept self-signed certificates: cloud providers (RDS, etc.) commonly
    // terminate TLS with certs that don't chain to a public root, and this
    // tool has no certificate-pinning story of its own yet.
    let connector =
        TlsConnector::builder().danger_accept_invalid_certs(true).danger_accept_invalid_hostnames(true).build()?;
    Ok(MakeTlsConnector::new(connector))
}

fn connect_with_fallback(config: &Config) -> Result<postgres::Client> {
    match make_tls_connector() {
        Ok(tls) => match config.connect(tls) {
            Ok(client) => Ok(client),
            Err(_) => config.connect(postgres::NoTls).context("connecting to database"),
        },
        Err(_) => config.connect(postgres::NoTls).context("connecting to database"),
    }
}

#[derive(Debug, Clone)]
pub struct DbAdapter {
    host: String,
    port: u16,
    user: String,
    password: String,
}

impl DbAdapter {
    pub fn new(host: impl Into<String>, port: u16, user: impl Into<String>, password: impl Into<String>) -> Self {
        DbAdapter { host: host.into(), port, user: user.into(), password: password.into() }
    }

    fn config(&self, database: Option<&str>) -> Config {
        let mut cfg = Config::new();
        cfg.host(&self.host).port(self.port).user(&self.user).password(&self.password);
        cfg.dbname(database.unwrap_or(ADMIN_DATABASE));
        cfg
    }

    pub fn connect(&self, database: Option<&str>) -> Result<postgres::Client> {
        connect_with_fallback(&self.config(database))
    }

    /// List all non-template databases, name-sorted (§4.3 determinism).
    pub fn list_databases(&self) -> Result<Vec<String>> {
        let mut client = self.connect(None)?;
        let rows = client.query("SELECT datname FROM pg_database WHERE datistemplate = false ORDER BY datname", &[])?;
        Ok(rows.into_iter().map(|r| r.get("datname")).collect())
    }

    pub fn database_exists(&self, db: &str) -> Result<bool> {
        Ok(self.list_databases()?.iter().any(|d| d == db))
    }

    /// `CREATE DATABASE` cannot run inside a transaction block; issued as a
    /// standalone statement against the admin connection (autocommit).
    pub fn create_database(&self, db: &str) -> Result<()> {
        let mut client = self.connect(None)?;
        client.execute(&format!("CREATE DATABASE \"{db}\""), &[]).with_context(|| format!("creating database {db}"))?;
        Ok(())
    }

    /// Schemas visible in `db`, excluding the always-present system schemas,
    /// name-sorted.
    pub fn list_schemas(&self, db: &str) -> Result<Vec<String>> {
        let mut client = self.connect(Some(db))?;
        let placeholders: Vec<String> = (1..=EXCLUDED_SCHEMAS.len()).map(|i| format!("${i}")).collect();
        let query = format!(
            "SELECT schema_name FROM information_schema.schemata WHERE schema_name NOT IN ({}) ORDER BY schema_name",
            placeholders.join(", "),
        );
        let params: Vec<&(dyn postgres::types::ToSql + Sync)> =
            EXCLUDED_SCHEMAS.iter().map(|s| s as &(dyn postgres::types::ToSql + Sync)).collect();
        let rows = client.query(&query, &params)?;
        Ok(rows.into_iter().map(|r| r.get("schema_name")).collect())
    }

    pub fn list_tables(&self, db: &str, schema: &str) -> Result<Vec<String>> {
        let mut client = self.connect(Some(db))?;
        let rows = client.query(
            "SELECT table_name FROM information_schema.tables WHERE table_schema = $1 ORDER BY table_name",
            &[&schema],
        )?;
        Ok(rows.into_iter().map(|r| r.get("table_name")).collect())
    }

    /// Invokes `pg_dump --schema-only --table` for one table, writing the
    /// result to `dest`. The dumper is treated as a narrow external
    /// interface (§1) — this crate does not reimplement it.
    pub fn dump_table_ddl(&self, db: &str, schema: &str, table: &str, dest: &Path) -> Result<()> {
        let status = Command::new("pg_dump")
            .env("PGPASSWORD", &self.password)
            .arg("--host").arg(&self.host)
            .arg("--port").arg(self.port.to_string())
            .arg("--user").arg(&self.user)
            .arg("--schema-only")
            .arg("--table").arg(format!("{schema}.{table}"))
            .arg("--file").arg(dest)
            .arg(format!("--dbname={db}"))
            .status()
            .with_context(|| format!("invoking pg_dump for {db}.{schema}.{table}"))?;

        if !status.success() {
            return Err(anyhow!("pg_dump exited with {status} while dumping {db}.{schema}.{table}"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_config_defaults_to_template1() {
        let adapter = DbAdapter::new("localhost", 5432, "postgres", "");
        let cfg = adapter.config(None);
        assert_eq!(cfg.get_dbname(), Some("template1"));
    }

    #[test]
    fn config_targets_the_named_database() {
        let adapter = DbAdapter::new("localhost", 5432, "postgres", "");
        let cfg = adapter.config(Some("app"));
        assert_eq!(cfg.get_dbname(), Some("app"));
    }
}
