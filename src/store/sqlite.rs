//! SQLite backend: one table per day partition, plus `apis` (the source
//! registry) and `processed_data`.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};

use super::{
    check_partition_name, ContentQuery, ProcessedRecord, ResultStore, SourceRegistry,
    StoredResult,
};
use crate::fetch::types::{FetchResult, SourceDefinition};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS apis (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    source TEXT NOT NULL,
    category TEXT NOT NULL,
    enabled INTEGER NOT NULL,
    definition TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS apis_enabled_idx ON apis(enabled);
CREATE INDEX IF NOT EXISTS apis_source_idx ON apis(source);
CREATE INDEX IF NOT EXISTS apis_category_idx ON apis(category);

CREATE TABLE IF NOT EXISTS processed_data (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source TEXT NOT NULL,
    category TEXT NOT NULL,
    info_type TEXT NOT NULL,
    date TEXT NOT NULL,
    processed_at TEXT NOT NULL,
    data TEXT NOT NULL,
    raw_partition TEXT NOT NULL,
    raw_id INTEGER NOT NULL
);
";

/// Shared handle; clones point at the same connection.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create the database file (parent directories included).
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database: {}", path.display()))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })
        .context("enabling WAL")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory().context("opening in-memory sqlite")?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)
            .context("failed to create base tables")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| anyhow!("sqlite connection mutex poisoned"))?;
            f(&mut guard)
        })
        .await
        .context("sqlite task panicked")?
    }

    /// Insert or replace a source definition, keyed by name.
    pub async fn upsert_source(&self, def: &SourceDefinition) -> Result<()> {
        let def = def.clone();
        let json = serde_json::to_string(&def).context("serializing source definition")?;
        self.with_conn(move |c| {
            c.execute(
                "INSERT INTO apis (name, source, category, enabled, definition)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(name) DO UPDATE SET
                    source = excluded.source,
                    category = excluded.category,
                    enabled = excluded.enabled,
                    definition = excluded.definition",
                params![def.name, def.source, def.category, def.enabled, json],
            )
            .with_context(|| format!("upserting source {}", def.name))?;
            Ok(())
        })
        .await
    }

    async fn load_sources(&self, enabled_only: bool) -> Result<Vec<SourceDefinition>> {
        self.with_conn(move |c| {
            let sql = if enabled_only {
                "SELECT name, definition FROM apis WHERE enabled = 1 ORDER BY id"
            } else {
                "SELECT name, definition FROM apis ORDER BY id"
            };
            let mut stmt = c.prepare(sql)?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            let mut out = Vec::with_capacity(rows.len());
            for (name, json) in rows {
                match serde_json::from_str::<SourceDefinition>(&json) {
                    Ok(def) => out.push(def),
                    Err(e) => {
                        tracing::error!(target: "store", source_name = %name, error = %e, "Failed to decode API config");
                    }
                }
            }
            Ok(out)
        })
        .await
    }
}

fn table_exists(c: &Connection, name: &str) -> Result<bool> {
    let found: Option<i64> = c
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![name],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("bad timestamp {raw:?}"))?
        .with_timezone(&Utc))
}

struct Row {
    id: i64,
    date: String,
    source: String,
    category: String,
    info_type: String,
    data: String,
    processed: bool,
    created_at: String,
    processed_at: Option<String>,
}

impl Row {
    fn into_stored(self) -> Result<StoredResult> {
        Ok(StoredResult {
            id: self.id,
            result: FetchResult {
                date: self.date,
                source: self.source,
                category: self.category,
                info_type: self.info_type,
                data: serde_json::from_str(&self.data)
                    .with_context(|| format!("decoding data of row {}", self.id))?,
                processed: self.processed,
                created_at: parse_ts(&self.created_at)?,
            },
            processed_at: self.processed_at.as_deref().map(parse_ts).transpose()?,
        })
    }
}

#[async_trait]
impl SourceRegistry for SqliteStore {
    async fn enabled_sources(&self) -> Result<Vec<SourceDefinition>> {
        self.load_sources(true).await
    }

    async fn all_sources(&self) -> Result<Vec<SourceDefinition>> {
        self.load_sources(false).await
    }
}

#[async_trait]
impl ResultStore for SqliteStore {
    async fn ensure_partition(&self, partition: &str) -> Result<()> {
        check_partition_name(partition)?;
        let t = partition.to_string();
        self.with_conn(move |c| {
            c.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {t} (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    date TEXT NOT NULL,
                    source TEXT NOT NULL,
                    category TEXT NOT NULL,
                    info_type TEXT NOT NULL,
                    data TEXT NOT NULL,
                    processed INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL,
                    processed_at TEXT
                );
                CREATE INDEX IF NOT EXISTS {t}_source_idx ON {t}(source);
                CREATE INDEX IF NOT EXISTS {t}_category_idx ON {t}(category);
                CREATE INDEX IF NOT EXISTS {t}_created_at_idx ON {t}(created_at);"
            ))
            .with_context(|| format!("ensuring partition {t}"))?;
            Ok(())
        })
        .await
    }

    async fn insert(&self, partition: &str, result: &FetchResult) -> Result<i64> {
        check_partition_name(partition)?;
        let t = partition.to_string();
        let r = result.clone();
        let data = serde_json::to_string(&r.data).context("serializing payload")?;
        self.with_conn(move |c| {
            c.execute(
                &format!(
                    "INSERT INTO {t} (date, source, category, info_type, data, processed, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"
                ),
                params![
                    r.date,
                    r.source,
                    r.category,
                    r.info_type,
                    data,
                    r.processed,
                    ts(r.created_at)
                ],
            )
            .with_context(|| format!("inserting into {t}"))?;
            Ok(c.last_insert_rowid())
        })
        .await
    }

    async fn find(
        &self,
        partition: &str,
        query: &ContentQuery,
    ) -> Result<(u64, Vec<StoredResult>)> {
        check_partition_name(partition)?;
        let t = partition.to_string();
        let q = query.clone();
        self.with_conn(move |c| {
            if !table_exists(c, &t)? {
                return Ok((0, vec![]));
            }

            let mut clauses: Vec<&str> = Vec::new();
            let mut args: Vec<String> = Vec::new();
            for (col, val) in [
                ("source = ?", &q.source),
                ("category = ?", &q.category),
                ("info_type = ?", &q.info_type),
            ] {
                if let Some(v) = val {
                    clauses.push(col);
                    args.push(v.clone());
                }
            }
            match q.processed {
                Some(true) => clauses.push("processed = 1"),
                Some(false) => clauses.push("processed = 0"),
                None => {}
            }
            let where_sql = if clauses.is_empty() {
                String::new()
            } else {
                format!(" WHERE {}", clauses.join(" AND "))
            };

            let total: i64 = c.query_row(
                &format!("SELECT COUNT(*) FROM {t}{where_sql}"),
                params_from_iter(args.iter()),
                |row| row.get(0),
            )?;

            let mut sql = format!(
                "SELECT id, date, source, category, info_type, data, processed, created_at, processed_at
                 FROM {t}{where_sql} ORDER BY created_at, id"
            );
            if let Some(p) = q.page {
                sql.push_str(&format!(" LIMIT {} OFFSET {}", p.limit, p.offset()));
            }
            let mut stmt = c.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(args.iter()), |row| {
                    Ok(Row {
                        id: row.get(0)?,
                        date: row.get(1)?,
                        source: row.get(2)?,
                        category: row.get(3)?,
                        info_type: row.get(4)?,
                        data: row.get(5)?,
                        processed: row.get(6)?,
                        created_at: row.get(7)?,
                        processed_at: row.get(8)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            let docs = rows
                .into_iter()
                .map(Row::into_stored)
                .collect::<Result<Vec<_>>>()?;
            Ok((total.max(0) as u64, docs))
        })
        .await
    }

    async fn mark_processed(&self, partition: &str, id: i64, at: DateTime<Utc>) -> Result<()> {
        check_partition_name(partition)?;
        let t = partition.to_string();
        self.with_conn(move |c| {
            let n = c.execute(
                &format!("UPDATE {t} SET processed = 1, processed_at = ?1 WHERE id = ?2"),
                params![ts(at), id],
            )?;
            if n == 0 {
                return Err(anyhow!("document {id} not found in {t}"));
            }
            Ok(())
        })
        .await
    }

    async fn save_processed(&self, record: &ProcessedRecord) -> Result<i64> {
        let r = record.clone();
        let data = serde_json::to_string(&r.data).context("serializing processed data")?;
        self.with_conn(move |c| {
            c.execute(
                "INSERT INTO processed_data
                    (source, category, info_type, date, processed_at, data, raw_partition, raw_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    r.source,
                    r.category,
                    r.info_type,
                    r.date,
                    ts(r.processed_at),
                    data,
                    r.raw_partition,
                    r.raw_id
                ],
            )
            .context("inserting processed data")?;
            Ok(c.last_insert_rowid())
        })
        .await
    }
}
