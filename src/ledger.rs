//! The ledger schema (§3.2, §6.3): `git_db.patch` and `git_db.query` inside
//! each managed database. All statements here use the driver's parameter
//! binding — the original tool's `%`-interpolated SQL is exactly the
//! injection risk §9's design notes call out.

use anyhow::Result;
use postgres::Client;

pub const LEDGER_DDL: &str = "
CREATE SCHEMA IF NOT EXISTS git_db;
CREATE TABLE IF NOT EXISTS git_db.query (
  id SERIAL NOT NULL, name VARCHAR(128) NOT NULL,
  namespace VARCHAR(128) NOT NULL, path VARCHAR(256) NOT NULL,
  timestamp timestamp DEFAULT CURRENT_TIMESTAMP,
  applied BOOLEAN DEFAULT FALSE, applied_timestamp timestamp,
  applied_patch_id INT);
CREATE TABLE IF NOT EXISTS git_db.patch (
  id SERIAL NOT NULL, name VARCHAR(128) NOT NULL,
  timestamp timestamp DEFAULT CURRENT_TIMESTAMP,
  applied BOOLEAN DEFAULT FALSE, applied_timestamp timestamp);
";

pub fn ensure_schema(client: &mut Client) -> Result<()> {
    client.batch_execute(LEDGER_DDL)?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct QueryRow {
    pub id: i32,
    pub name: String,
    pub namespace: String,
    pub path: String,
}

/// Finds the `id` of a registered patch by name, or `None` if it hasn't
/// been registered in this database's ledger yet.
pub fn find_patch_id(client: &mut Client, name: &str) -> Result<Option<i32>> {
    let row = client.query_opt("SELECT id FROM git_db.patch WHERE name = $1", &[&name])?;
    Ok(row.map(|r| r.get("id")))
}

/// Finds the patch by name, inserting a fresh row if it doesn't exist yet.
/// `patch.name` is unique per database (§3.2), so this is safe to call
/// repeatedly for the same patch.
pub fn ensure_patch(client: &mut Client, name: &str) -> Result<i32> {
    if let Some(id) = find_patch_id(client, name)? {
        return Ok(id);
    }
    let row = client.query_one("INSERT INTO git_db.patch (name) VALUES ($1) RETURNING id", &[&name])?;
    Ok(row.get("id"))
}

/// Rows not yet applied, and either never attached to a patch or attached
/// to `patch_id` (re-running an `--overwrite`'d assembly picks its own
/// previously-attached queries back up), oldest first (§4.5 step 8).
pub fn pending_queries(client: &mut Client, patch_id: Option<i32>) -> Result<Vec<QueryRow>> {
    let rows = match patch_id {
        Some(id) => client.query(
            "SELECT id, name, namespace, path FROM git_db.query \
             WHERE applied = false AND (applied_patch_id IS NULL OR applied_patch_id = $1) \
             ORDER BY timestamp ASC",
            &[&id],
        )?,
        None => client.query(
            "SELECT id, name, namespace, path FROM git_db.query \
             WHERE applied = false AND applied_patch_id IS NULL \
             ORDER BY timestamp ASC",
            &[],
        )?,
    };
    Ok(rows.into_iter().map(|r| QueryRow { id: r.get("id"), name: r.get("name"), namespace: r.get("namespace"), path: r.get("path") }).collect())
}

pub fn attach_query_to_patch(client: &mut Client, query_id: i32, patch_id: i32) -> Result<()> {
    client.execute("UPDATE git_db.query SET applied_patch_id = $1 WHERE id = $2", &[&patch_id, &query_id])?;
    Ok(())
}

pub fn register_query(client: &mut Client, name: &str, namespace: &str, path: &str) -> Result<i32> {
    let row = client.query_one(
        "INSERT INTO git_db.query (name, namespace, path) VALUES ($1, $2, $3) RETURNING id",
        &[&name, &namespace, &path],
    )?;
    Ok(row.get("id"))
}

pub fn mark_patch_applied(client: &mut Client, name: &str) -> Result<()> {
    client.execute(
        "UPDATE git_db.patch SET applied = true, applied_timestamp = now() WHERE name = $1",
        &[&name],
    )?;
    Ok(())
}

/// Every query row attached to the named patch is also marked applied —
/// the coherence invariant of §3.2/§8 property 7.
pub fn mark_queries_applied_for_patch(client: &mut Client, patch_name: &str) -> Result<()> {
    client.execute(
        "UPDATE git_db.query SET applied = true, applied_timestamp = now() \
         WHERE applied_patch_id = (SELECT id FROM git_db.patch WHERE name = $1)",
        &[&patch_name],
    )?;
    Ok(())
}
