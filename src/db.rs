use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};

use crate::batch::{BatchItemResult, BatchResult, BatchSummary};

pub fn connect(path: &Path) -> Result<Connection> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating {}", dir.display()))?;
    }
    let conn = Connection::open(path).with_context(|| format!("opening {}", path.display()))?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS runs (
            id          INTEGER PRIMARY KEY,
            total       INTEGER NOT NULL,
            succeeded   INTEGER NOT NULL,
            failed      INTEGER NOT NULL,
            finished_at TEXT NOT NULL,
            created_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS run_items (
            id          INTEGER PRIMARY KEY,
            run_id      INTEGER NOT NULL REFERENCES runs(id),
            idx         INTEGER NOT NULL,
            input       TEXT NOT NULL,
            asin        TEXT,
            success     BOOLEAN NOT NULL,
            stage       TEXT,
            title       TEXT,
            price       TEXT,
            rating      TEXT,
            error       TEXT,
            payload     TEXT NOT NULL,
            UNIQUE(run_id, idx)
        );
        CREATE INDEX IF NOT EXISTS idx_run_items_run ON run_items(run_id);
        CREATE INDEX IF NOT EXISTS idx_run_items_asin ON run_items(asin);
        ",
    )?;
    Ok(())
}

/// Store a finished batch and its items in one transaction. Returns the run id.
pub fn save_run(conn: &Connection, result: &BatchResult) -> Result<i64> {
    let s = &result.summary;
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "INSERT INTO runs (total, succeeded, failed, finished_at) VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![s.total, s.succeeded, s.failed, s.finished_at.to_rfc3339()],
    )?;
    let run_id = tx.last_insert_rowid();
    {
        let mut stmt = tx.prepare(
            "INSERT INTO run_items
             (run_id, idx, input, asin, success, stage, title, price, rating, error, payload)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        )?;
        for item in &result.items {
            let payload = serde_json::to_string(item)?;
            let (stage, title, price, rating, error) = match item {
                BatchItemResult::Succeeded(s) => (
                    None,
                    Some(s.extracted.title.as_str()),
                    Some(s.extracted.price.as_str()),
                    Some(s.extracted.rating.as_str()),
                    None,
                ),
                BatchItemResult::Failed(f) => (
                    Some(format!("{:?}", f.stage).to_lowercase()),
                    None,
                    None,
                    None,
                    Some(f.error.as_str()),
                ),
            };
            stmt.execute(rusqlite::params![
                run_id,
                item.index(),
                item.input(),
                item.identifier().map(|i| i.as_str()),
                item.is_success(),
                stage,
                title,
                price,
                rating,
                error,
                payload,
            ])?;
        }
    }
    tx.commit()?;
    Ok(run_id)
}

pub struct RunRow {
    pub id: i64,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub finished_at: String,
}

/// Most recent runs first.
pub fn list_runs(conn: &Connection, limit: usize) -> Result<Vec<RunRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, total, succeeded, failed, finished_at FROM runs ORDER BY id DESC LIMIT ?1",
    )?;
    let rows = stmt
        .query_map([limit], |row| {
            Ok(RunRow {
                id: row.get(0)?,
                total: row.get(1)?,
                succeeded: row.get(2)?,
                failed: row.get(3)?,
                finished_at: row.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn latest_run_id(conn: &Connection) -> Result<Option<i64>> {
    let id = conn
        .query_row("SELECT MAX(id) FROM runs", [], |row| row.get::<_, Option<i64>>(0))?;
    Ok(id)
}

/// Rebuild a stored batch, items in input order.
pub fn load_run(conn: &Connection, run_id: i64) -> Result<Option<BatchResult>> {
    let run = conn
        .query_row(
            "SELECT total, succeeded, failed, finished_at FROM runs WHERE id = ?1",
            [run_id],
            |row| {
                Ok((
                    row.get::<_, usize>(0)?,
                    row.get::<_, usize>(1)?,
                    row.get::<_, usize>(2)?,
                    row.get::<_, String>(3)?,
                ))
            },
        )
        .optional()?;
    let Some((total, succeeded, failed, finished_at)) = run else {
        return Ok(None);
    };

    let mut stmt = conn.prepare("SELECT payload FROM run_items WHERE run_id = ?1 ORDER BY idx")?;
    let payloads = stmt
        .query_map([run_id], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    let items = payloads
        .iter()
        .enumerate()
        .map(|(i, p)| {
            serde_json::from_str::<BatchItemResult>(p)
                .with_context(|| format!("decoding item {} of run {}", i, run_id))
        })
        .collect::<Result<Vec<_>>>()?;

    let finished_at = DateTime::parse_from_rfc3339(&finished_at)
        .with_context(|| format!("bad finished_at on run {}", run_id))?
        .with_timezone(&Utc);

    Ok(Some(BatchResult {
        items,
        summary: BatchSummary {
            total,
            succeeded,
            failed,
            finished_at,
        },
    }))
}
