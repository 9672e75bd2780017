use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior};
use serde::Serialize;

pub fn connect(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    // Parallel batch sessions each hold their own connection to the same file.
    conn.busy_timeout(Duration::from_secs(10))?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS classes (
            id                 TEXT PRIMARY KEY,
            title              TEXT NOT NULL,
            instructor         TEXT NOT NULL,
            duration_minutes   INTEGER NOT NULL,
            difficulty_rating  REAL NOT NULL,
            class_type         TEXT NOT NULL,
            original_air_date  TEXT NOT NULL,
            url                TEXT NOT NULL,
            first_seen_at      TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at         TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_classes_air_date ON classes(original_air_date);
        CREATE INDEX IF NOT EXISTS idx_classes_instructor ON classes(instructor);
        ",
    )?;
    Ok(())
}

// ── Records ──

/// One fully extracted class. `identifier` is the primary key and never changes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassRecord {
    pub identifier: String,
    pub title: String,
    pub instructor: String,
    pub duration_minutes: i64,
    pub difficulty_rating: f64,
    pub class_type: String,
    pub original_air_date: NaiveDate,
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[cfg(test)]
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Keyed, deduplicating persistence for class records.
pub trait ClassStore {
    /// Insert, or overwrite every non-key field of an existing record. Atomic per call.
    fn upsert(&mut self, record: &ClassRecord) -> Result<UpsertOutcome, StoreError>;

    fn exists(&self, identifier: &str) -> Result<bool, StoreError>;
}

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = connect(path)?;
        init_schema(&conn)?;
        Ok(Self { conn })
    }

    #[cfg(test)]
    pub fn in_memory() -> Self {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        Self { conn }
    }

    #[cfg(test)]
    pub fn conn(&self) -> &Connection {
        &self.conn
    }
}

impl ClassStore for SqliteStore {
    fn upsert(&mut self, r: &ClassRecord) -> Result<UpsertOutcome, StoreError> {
        // IMMEDIATE takes the write lock up front so the existence check and the
        // write can't interleave with another session's upsert.
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let existed = tx
            .query_row("SELECT 1 FROM classes WHERE id = ?1", [&r.identifier], |_| Ok(()))
            .optional()?
            .is_some();
        tx.execute(
            "INSERT INTO classes
             (id, title, instructor, duration_minutes, difficulty_rating, class_type, original_air_date, url)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                instructor = excluded.instructor,
                duration_minutes = excluded.duration_minutes,
                difficulty_rating = excluded.difficulty_rating,
                class_type = excluded.class_type,
                original_air_date = excluded.original_air_date,
                url = excluded.url,
                updated_at = datetime('now')",
            rusqlite::params![
                r.identifier,
                r.title,
                r.instructor,
                r.duration_minutes,
                r.difficulty_rating,
                r.class_type,
                r.original_air_date,
                r.url,
            ],
        )?;
        tx.commit()?;
        Ok(if existed {
            UpsertOutcome::Updated
        } else {
            UpsertOutcome::Inserted
        })
    }

    fn exists(&self, identifier: &str) -> Result<bool, StoreError> {
        let found = self
            .conn
            .query_row("SELECT 1 FROM classes WHERE id = ?1", [identifier], |_| Ok(()))
            .optional()?;
        Ok(found.is_some())
    }
}

// ── Listing ──

pub struct ListFilter<'a> {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
    pub instructor: Option<&'a str>,
    pub limit: usize,
}

pub fn fetch_classes(conn: &Connection, filter: &ListFilter) -> Result<Vec<ClassRecord>> {
    let mut conditions = Vec::new();
    let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

    if let Some(start) = filter.start {
        conditions.push(format!("original_air_date >= ?{}", params.len() + 1));
        params.push(Box::new(start));
    }
    if let Some(end) = filter.end {
        conditions.push(format!("original_air_date <= ?{}", params.len() + 1));
        params.push(Box::new(end));
    }
    if let Some(name) = filter.instructor {
        conditions.push(format!("instructor = ?{}", params.len() + 1));
        params.push(Box::new(name.to_string()));
    }

    let where_clause = if conditions.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", conditions.join(" AND "))
    };

    let sql = format!(
        "SELECT id, title, instructor, duration_minutes, difficulty_rating, class_type,
                original_air_date, url
         FROM classes{}
         ORDER BY original_air_date DESC, id
         LIMIT {}",
        where_clause, filter.limit
    );

    let mut stmt = conn.prepare(&sql)?;
    let param_refs: Vec<&dyn rusqlite::types::ToSql> = params.iter().map(|p| p.as_ref()).collect();
    let rows = stmt
        .query_map(param_refs.as_slice(), |row| {
            Ok(ClassRecord {
                identifier: row.get(0)?,
                title: row.get(1)?,
                instructor: row.get(2)?,
                duration_minutes: row.get(3)?,
                difficulty_rating: row.get(4)?,
                class_type: row.get(5)?,
                original_air_date: row.get(6)?,
                url: row.get(7)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ── Stats ──

pub struct Stats {
    pub total: usize,
    pub earliest: Option<NaiveDate>,
    pub latest: Option<NaiveDate>,
    pub by_class_type: Vec<(String, usize)>,
    pub top_instructors: Vec<(String, usize)>,
}

pub fn get_stats(conn: &Connection) -> Result<Stats> {
    let total: usize = conn.query_row("SELECT COUNT(*) FROM classes", [], |r| r.get(0))?;
    let (earliest, latest): (Option<NaiveDate>, Option<NaiveDate>) = conn.query_row(
        "SELECT MIN(original_air_date), MAX(original_air_date) FROM classes",
        [],
        |r| Ok((r.get(0)?, r.get(1)?)),
    )?;

    let by_class_type = grouped_counts(
        conn,
        "SELECT class_type, COUNT(*) FROM classes GROUP BY class_type ORDER BY 2 DESC, 1",
    )?;
    let top_instructors = grouped_counts(
        conn,
        "SELECT instructor, COUNT(*) FROM classes GROUP BY instructor ORDER BY 2 DESC, 1 LIMIT 10",
    )?;

    Ok(Stats {
        total,
        earliest,
        latest,
        by_class_type,
        top_instructors,
    })
}

fn grouped_counts(conn: &Connection, sql: &str) -> Result<Vec<(String, usize)>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}
