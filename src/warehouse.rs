use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use chrono::Utc;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use tracing::{debug, info, warn};

use crate::frame::{Frame, Value};

/// A named SQL script applied after the core tables are loaded.
#[derive(Debug, Clone)]
pub struct ViewDefinition {
    pub name: String,
    pub sql: String,
}

/// Outcome of a finished (or failed) pipeline run, as stored in
/// `pipeline_runs`.
#[derive(Debug, Clone, Default)]
pub struct RunRecord {
    pub status: String,
    pub failed_step: Option<String>,
    pub matches_rated: usize,
    pub upsets_found: usize,
    pub errors: Vec<String>,
}

pub fn open_warehouse(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("create warehouse dir {}", parent.display()))?;
    }
    let conn = Connection::open(path)
        .with_context(|| format!("open sqlite warehouse {}", path.display()))?;
    init_schema(&conn)?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        CREATE TABLE IF NOT EXISTS pipeline_runs (
            run_id INTEGER PRIMARY KEY AUTOINCREMENT,
            started_at TEXT NOT NULL,
            finished_at TEXT NULL,
            status TEXT NOT NULL,
            failed_step TEXT NULL,
            matches_rated INTEGER NOT NULL DEFAULT 0,
            upsets_found INTEGER NOT NULL DEFAULT 0,
            errors_json TEXT NOT NULL DEFAULT '[]'
        );
        "#,
    )
    .context("create warehouse schema")?;
    Ok(())
}

pub fn begin_run(conn: &Connection) -> Result<i64> {
    conn.execute(
        "INSERT INTO pipeline_runs(started_at, status) VALUES (?1, 'running')",
        params![Utc::now().to_rfc3339()],
    )
    .context("insert pipeline run")?;
    Ok(conn.last_insert_rowid())
}

pub fn finish_run(conn: &Connection, run_id: i64, record: &RunRecord) -> Result<()> {
    let errors_json = serde_json::to_string(&record.errors).unwrap_or_else(|_| "[]".to_string());
    conn.execute(
        "UPDATE pipeline_runs
         SET finished_at = ?1, status = ?2, failed_step = ?3,
             matches_rated = ?4, upsets_found = ?5, errors_json = ?6
         WHERE run_id = ?7",
        params![
            Utc::now().to_rfc3339(),
            record.status,
            record.failed_step,
            record.matches_rated as i64,
            record.upsets_found as i64,
            errors_json,
            run_id
        ],
    )
    .context("update pipeline run")?;
    Ok(())
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub fn table_exists(conn: &Connection, name: &str) -> Result<bool> {
    let found = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![name],
            |_| Ok(()),
        )
        .optional()
        .with_context(|| format!("look up table {name}"))?;
    Ok(found.is_some())
}

pub fn table_columns(conn: &Connection, name: &str) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({})", quote_ident(name)))
        .with_context(|| format!("prepare table_info for {name}"))?;
    let rows = stmt
        .query_map([], |row| row.get::<_, String>(1))
        .with_context(|| format!("query table_info for {name}"))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("decode table_info row")?);
    }
    Ok(out)
}

pub fn row_count(conn: &Connection, name: &str) -> Result<i64> {
    conn.query_row(
        &format!("SELECT COUNT(*) FROM {}", quote_ident(name)),
        [],
        |row| row.get(0),
    )
    .with_context(|| format!("count rows of {name}"))
}

/// Drops and recreates `name` from `frame` in one transaction. With a
/// primary key, a supporting index is built. An empty frame changes nothing.
pub fn create_table(
    conn: &mut Connection,
    name: &str,
    frame: &Frame,
    primary_key: Option<&[&str]>,
) -> Result<usize> {
    if frame.is_empty() {
        warn!(table = name, "empty frame, table left unchanged");
        return Ok(0);
    }
    let tx = conn.transaction().context("begin create transaction")?;
    let inserted = create_table_in(&tx, name, frame, primary_key)?;
    tx.commit()
        .with_context(|| format!("commit create of {name}"))?;
    info!(table = name, rows = inserted, "created table");
    Ok(inserted)
}

/// Like [`create_table`], but an empty frame still leaves an empty table
/// with the frame's schema. Used for outputs recomputed in full each run.
pub fn replace_table(
    conn: &mut Connection,
    name: &str,
    frame: &Frame,
    primary_key: Option<&[&str]>,
) -> Result<usize> {
    if frame.columns().is_empty() {
        bail!("cannot replace {name} from a frame without columns");
    }
    let tx = conn.transaction().context("begin replace transaction")?;
    let inserted = create_table_in(&tx, name, frame, primary_key)?;
    tx.commit()
        .with_context(|| format!("commit replace of {name}"))?;
    info!(table = name, rows = inserted, "replaced table");
    Ok(inserted)
}

/// Replaces the rows of `name` whose key appears in `frame` and inserts the
/// rest. The delete and the insert commit together or not at all.
pub fn upsert_table(
    conn: &mut Connection,
    name: &str,
    frame: &Frame,
    primary_key: &[&str],
) -> Result<usize> {
    if primary_key.is_empty() {
        bail!("upsert into {name} needs a primary key");
    }
    if frame.is_empty() {
        warn!(table = name, "empty frame, upsert skipped");
        return Ok(0);
    }
    frame
        .key_indices(primary_key)
        .with_context(|| format!("upsert into {name}"))?;
    if !table_exists(conn, name)? {
        return create_table(conn, name, frame, Some(primary_key));
    }

    let tx = conn.transaction().context("begin upsert transaction")?;
    let (deleted, inserted) = upsert_in(&tx, name, frame, primary_key)?;
    tx.commit()
        .with_context(|| format!("commit upsert of {name}"))?;
    info!(table = name, deleted, inserted, "upserted table");
    Ok(inserted)
}

fn create_table_in(
    conn: &Connection,
    name: &str,
    frame: &Frame,
    primary_key: Option<&[&str]>,
) -> Result<usize> {
    let table = quote_ident(name);
    conn.execute_batch(&format!("DROP TABLE IF EXISTS {table};"))
        .with_context(|| format!("drop {name}"))?;
    conn.execute_batch(&format!("CREATE TABLE {table} ({});", column_defs(frame)))
        .with_context(|| format!("create {name}"))?;
    let inserted = insert_rows(conn, &table, frame)?;
    if let Some(key) = primary_key.filter(|k| !k.is_empty()) {
        frame
            .key_indices(key)
            .with_context(|| format!("index {name}"))?;
        let cols = key.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ");
        let index = quote_ident(&format!("idx_{name}_pk"));
        conn.execute_batch(&format!("CREATE INDEX {index} ON {table} ({cols});"))
            .with_context(|| format!("create key index on {name}"))?;
    }
    Ok(inserted)
}

fn upsert_in(
    conn: &Connection,
    name: &str,
    frame: &Frame,
    primary_key: &[&str],
) -> Result<(usize, usize)> {
    let table = quote_ident(name);
    let existing = table_columns(conn, name)?;
    for col in frame.columns() {
        if !existing.iter().any(|c| c == &col.name) {
            debug!(table = name, column = %col.name, "adding column");
            conn.execute_batch(&format!(
                "ALTER TABLE {table} ADD COLUMN {} {};",
                quote_ident(&col.name),
                col.kind.sql_type()
            ))
            .with_context(|| format!("add column {} to {name}", col.name))?;
        }
    }

    let scratch = quote_ident(&format!("scratch_{name}"));
    conn.execute_batch(&format!(
        "DROP TABLE IF EXISTS temp.{scratch}; CREATE TEMP TABLE {scratch} ({});",
        column_defs(frame)
    ))
    .with_context(|| format!("create scratch table for {name}"))?;
    insert_rows(conn, &format!("temp.{scratch}"), frame)?;

    let matches_key = primary_key
        .iter()
        .map(|k| {
            let k = quote_ident(k);
            // `IS` so that a null key replaces the stored null-key row.
            format!("s.{k} IS {table}.{k}")
        })
        .collect::<Vec<_>>()
        .join(" AND ");
    let deleted = conn
        .execute(
            &format!(
                "DELETE FROM {table} WHERE EXISTS (SELECT 1 FROM temp.{scratch} AS s WHERE {matches_key})"
            ),
            [],
        )
        .with_context(|| format!("delete replaced rows of {name}"))?;

    let cols = frame
        .columns()
        .iter()
        .map(|c| quote_ident(&c.name))
        .collect::<Vec<_>>()
        .join(", ");
    let inserted = conn
        .execute(
            &format!("INSERT INTO {table} ({cols}) SELECT {cols} FROM temp.{scratch}"),
            [],
        )
        .with_context(|| format!("insert upserted rows into {name}"))?;
    conn.execute_batch(&format!("DROP TABLE temp.{scratch};"))
        .with_context(|| format!("drop scratch table for {name}"))?;
    Ok((deleted, inserted))
}

fn column_defs(frame: &Frame) -> String {
    frame
        .columns()
        .iter()
        .map(|c| format!("{} {}", quote_ident(&c.name), c.kind.sql_type()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn insert_rows(conn: &Connection, qualified_table: &str, frame: &Frame) -> Result<usize> {
    let cols = frame
        .columns()
        .iter()
        .map(|c| quote_ident(&c.name))
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = (1..=frame.columns().len())
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ");
    let mut stmt = conn
        .prepare(&format!(
            "INSERT INTO {qualified_table} ({cols}) VALUES ({placeholders})"
        ))
        .with_context(|| format!("prepare insert into {qualified_table}"))?;
    for row in frame.rows() {
        stmt.execute(params_from_iter(row.iter().map(to_sql)))
            .with_context(|| format!("insert row into {qualified_table}"))?;
    }
    Ok(frame.len())
}

fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Int(v) => SqlValue::Integer(*v),
        Value::Float(v) => SqlValue::Real(*v),
        Value::Text(s) => SqlValue::Text(s.clone()),
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
    }
}

fn from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(v) => Value::Int(v),
        ValueRef::Real(v) => Value::Float(v),
        ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::Text(String::from_utf8_lossy(b).into_owned()),
    }
}

/// Reads a whole table back as a frame. Column types are inferred from the
/// stored values.
pub fn read_table(conn: &Connection, name: &str) -> Result<Frame> {
    let mut stmt = conn
        .prepare(&format!("SELECT * FROM {}", quote_ident(name)))
        .with_context(|| format!("prepare read of {name}"))?;
    let names = stmt
        .column_names()
        .into_iter()
        .map(str::to_string)
        .collect::<Vec<_>>();
    let width = names.len();
    let rows = stmt
        .query_map([], |row| {
            (0..width)
                .map(|i| row.get_ref(i).map(from_sql))
                .collect::<rusqlite::Result<Vec<_>>>()
        })
        .with_context(|| format!("query {name}"))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.with_context(|| format!("decode row of {name}"))?);
    }
    Frame::from_rows(names, out)
}

/// Applies each definition in order; the first failure stops the rest.
pub fn execute_derived_views(conn: &Connection, definitions: &[ViewDefinition]) -> Result<usize> {
    for (idx, def) in definitions.iter().enumerate() {
        conn.execute_batch(&def.sql).with_context(|| {
            format!(
                "derived view `{}` failed ({} of {}, {} not applied)",
                def.name,
                idx + 1,
                definitions.len(),
                definitions.len() - idx - 1
            )
        })?;
        debug!(view = %def.name, "applied derived view");
    }
    Ok(definitions.len())
}

/// Loads `*.sql` files from `dir` in lexical file-name order.
pub fn load_view_definitions(dir: &Path) -> Result<Vec<ViewDefinition>> {
    let mut paths = fs::read_dir(dir)
        .with_context(|| format!("list views dir {}", dir.display()))?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<Vec<PathBuf>>>()
        .with_context(|| format!("list views dir {}", dir.display()))?;
    paths.retain(|p| p.extension().is_some_and(|ext| ext == "sql"));
    paths.sort();
    paths
        .into_iter()
        .map(|path| {
            let name = path
                .file_stem()
                .and_then(|s| s.to_str())
                .ok_or_else(|| anyhow!("invalid view file name {}", path.display()))?
                .to_string();
            let sql = fs::read_to_string(&path)
                .with_context(|| format!("read view {}", path.display()))?;
            Ok(ViewDefinition { name, sql })
        })
        .collect()
}
