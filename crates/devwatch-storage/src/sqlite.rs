//! Persistent project, collection-run and geocode-cache tables.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use devwatch_core::{
    CollectionRun, Coordinates, GeocodeEntry, ProjectRecord, ProjectStatus, RunStatus, RunTally,
    StoredProject, UpsertOutcome,
};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::Row;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("creating database directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("collection run {0} is not open")]
    RunNotOpen(Uuid),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Handle to the SQLite dataset. Cloning shares the underlying pool.
#[derive(Debug, Clone)]
pub struct ProjectStore {
    pool: SqlitePool,
}

impl ProjectStore {
    /// Opens (creating if needed) the database at `database_url` and applies the schema.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        if let Some(parent) = options.get_filename().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Opens an existing database without write access (dashboard side).
    pub async fn connect_read_only(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .read_only(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    /// Single-connection in-memory database, used by tests.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Creates tables and indexes. Idempotent.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS projects (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source TEXT NOT NULL,
                project_id TEXT NOT NULL,
                name TEXT NOT NULL DEFAULT '',
                description TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL DEFAULT 'Unknown',
                source_status TEXT NOT NULL DEFAULT '',
                address TEXT NOT NULL DEFAULT '',
                application_date TEXT NOT NULL,
                application_date_is_fallback INTEGER NOT NULL DEFAULT 0,
                collection_date TEXT NOT NULL,
                latitude REAL,
                longitude REAL,
                location_approximate INTEGER NOT NULL DEFAULT 0,
                url TEXT,
                raw_data TEXT NOT NULL DEFAULT '{}',
                first_seen_at TEXT NOT NULL,
                last_seen_at TEXT NOT NULL,
                UNIQUE(source, project_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS collection_runs (
                run_id TEXT PRIMARY KEY,
                source TEXT NOT NULL,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                status TEXT NOT NULL,
                records_seen INTEGER NOT NULL DEFAULT 0,
                records_written INTEGER NOT NULL DEFAULT 0,
                records_inserted INTEGER NOT NULL DEFAULT 0,
                records_updated INTEGER NOT NULL DEFAULT 0,
                records_excluded INTEGER NOT NULL DEFAULT 0,
                normalize_failures INTEGER NOT NULL DEFAULT 0,
                store_failures INTEGER NOT NULL DEFAULT 0,
                geocode_failures INTEGER NOT NULL DEFAULT 0,
                error_message TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS geocode_cache (
                query_key TEXT PRIMARY KEY,
                latitude REAL NOT NULL,
                longitude REAL NOT NULL,
                resolved_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        for ddl in [
            "CREATE INDEX IF NOT EXISTS idx_projects_source ON projects(source)",
            "CREATE INDEX IF NOT EXISTS idx_projects_coords ON projects(latitude, longitude)",
            "CREATE INDEX IF NOT EXISTS idx_projects_date ON projects(application_date)",
            "CREATE INDEX IF NOT EXISTS idx_runs_source_started ON collection_runs(source, started_at)",
        ] {
            sqlx::query(ddl).execute(&self.pool).await?;
        }

        Ok(())
    }

    /// Merges one record by `(source, project_id)` in its own transaction.
    pub async fn upsert_project(&self, record: &ProjectRecord) -> Result<UpsertOutcome, StoreError> {
        let raw_data = serde_json::to_string(&record.raw_data)?;
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO projects (
                source, project_id, name, description, status, source_status, address,
                application_date, application_date_is_fallback, collection_date,
                latitude, longitude, location_approximate, url, raw_data,
                first_seen_at, last_seen_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?16)
            ON CONFLICT(source, project_id) DO NOTHING
            "#,
        )
        .bind(&record.source)
        .bind(&record.project_id)
        .bind(&record.name)
        .bind(&record.description)
        .bind(record.status.as_str())
        .bind(&record.source_status)
        .bind(&record.address)
        .bind(record.application_date)
        .bind(record.date_is_fallback)
        .bind(record.collection_date)
        .bind(record.latitude)
        .bind(record.longitude)
        .bind(record.location_approximate)
        .bind(&record.url)
        .bind(&raw_data)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 1 {
            tx.commit().await?;
            return Ok(UpsertOutcome::Inserted);
        }

        let stored: (NaiveDate, bool) = sqlx::query_as(
            "SELECT application_date, application_date_is_fallback FROM projects WHERE source = ?1 AND project_id = ?2",
        )
        .bind(&record.source)
        .bind(&record.project_id)
        .fetch_one(&mut *tx)
        .await?;
        let (application_date, is_fallback) = merge_application_date(record, stored);

        sqlx::query(
            r#"
            UPDATE projects
               SET name = ?3,
                   description = ?4,
                   status = ?5,
                   source_status = ?6,
                   address = ?7,
                   application_date = ?8,
                   application_date_is_fallback = ?9,
                   collection_date = ?10,
                   latitude = ?11,
                   longitude = ?12,
                   location_approximate = ?13,
                   url = ?14,
                   raw_data = ?15,
                   last_seen_at = ?16
             WHERE source = ?1 AND project_id = ?2
            "#,
        )
        .bind(&record.source)
        .bind(&record.project_id)
        .bind(&record.name)
        .bind(&record.description)
        .bind(record.status.as_str())
        .bind(&record.source_status)
        .bind(&record.address)
        .bind(application_date)
        .bind(is_fallback)
        .bind(record.collection_date)
        .bind(record.latitude)
        .bind(record.longitude)
        .bind(record.location_approximate)
        .bind(&record.url)
        .bind(&raw_data)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(UpsertOutcome::Updated)
    }

    pub async fn get_project(
        &self,
        source: &str,
        project_id: &str,
    ) -> Result<Option<StoredProject>, StoreError> {
        let row = sqlx::query("SELECT * FROM projects WHERE source = ?1 AND project_id = ?2")
            .bind(source)
            .bind(project_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(project_from_row).transpose()
    }

    /// All projects, newest application first.
    pub async fn list_projects(&self) -> Result<Vec<StoredProject>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM projects ORDER BY application_date DESC, first_seen_at DESC, id DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(project_from_row).collect()
    }

    pub async fn count_projects_by_source(&self) -> Result<BTreeMap<String, u64>, StoreError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT source, COUNT(*) FROM projects GROUP BY source ORDER BY source")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows
            .into_iter()
            .map(|(source, n)| (source, u64::try_from(n).unwrap_or(0)))
            .collect())
    }

    /// Opens a run record in the `Running` state.
    pub async fn begin_run(
        &self,
        source: &str,
        started_at: DateTime<Utc>,
    ) -> Result<CollectionRun, StoreError> {
        let run = CollectionRun {
            run_id: Uuid::new_v4(),
            source: source.to_string(),
            started_at,
            finished_at: None,
            status: RunStatus::Running,
            tally: RunTally::default(),
            error_message: None,
        };
        sqlx::query(
            "INSERT INTO collection_runs (run_id, source, started_at, status) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(run.run_id.to_string())
        .bind(&run.source)
        .bind(run.started_at)
        .bind(run.status.as_str())
        .execute(&self.pool)
        .await?;
        debug!(run_id = %run.run_id, source, "opened collection run");
        Ok(run)
    }

    /// Writes the terminal state of a run. Fails if the run was already finalized.
    pub async fn finish_run(&self, run: &CollectionRun) -> Result<(), StoreError> {
        let tally = &run.tally;
        let affected = sqlx::query(
            r#"
            UPDATE collection_runs
               SET finished_at = ?2,
                   status = ?3,
                   records_seen = ?4,
                   records_written = ?5,
                   records_inserted = ?6,
                   records_updated = ?7,
                   records_excluded = ?8,
                   normalize_failures = ?9,
                   store_failures = ?10,
                   geocode_failures = ?11,
                   error_message = ?12
             WHERE run_id = ?1 AND status = 'Running'
            "#,
        )
        .bind(run.run_id.to_string())
        .bind(run.finished_at.unwrap_or_else(Utc::now))
        .bind(run.status.as_str())
        .bind(i64::from(tally.records_seen))
        .bind(i64::from(tally.records_written))
        .bind(i64::from(tally.records_inserted))
        .bind(i64::from(tally.records_updated))
        .bind(i64::from(tally.records_excluded))
        .bind(i64::from(tally.normalize_failures))
        .bind(i64::from(tally.store_failures))
        .bind(i64::from(tally.geocode_failures))
        .bind(&run.error_message)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if affected != 1 {
            return Err(StoreError::RunNotOpen(run.run_id));
        }
        Ok(())
    }

    pub async fn get_run(&self, run_id: Uuid) -> Result<Option<CollectionRun>, StoreError> {
        let row = sqlx::query("SELECT * FROM collection_runs WHERE run_id = ?1")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    /// Most recent run per source, ordered by source id.
    pub async fn latest_runs(&self) -> Result<Vec<CollectionRun>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM (
                SELECT r.*,
                       ROW_NUMBER() OVER (
                           PARTITION BY r.source
                           ORDER BY r.started_at DESC, r.rowid DESC
                       ) AS rn
                  FROM collection_runs r
            )
             WHERE rn = 1
             ORDER BY source
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(run_from_row).collect()
    }

    pub async fn recent_runs(&self, limit: u32) -> Result<Vec<CollectionRun>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM collection_runs ORDER BY started_at DESC, rowid DESC LIMIT ?1",
        )
        .bind(i64::from(limit.max(1)))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(run_from_row).collect()
    }

    pub async fn cached_coordinates(&self, query_key: &str) -> Result<Option<GeocodeEntry>, StoreError> {
        let row: Option<(f64, f64, DateTime<Utc>)> = sqlx::query_as(
            "SELECT latitude, longitude, resolved_at FROM geocode_cache WHERE query_key = ?1",
        )
        .bind(query_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(latitude, longitude, resolved_at)| GeocodeEntry {
            query_key: query_key.to_string(),
            coordinates: Coordinates::new(latitude, longitude),
            resolved_at,
        }))
    }

    /// Stores a resolved key unless another writer got there first; returns the winning entry.
    pub async fn cache_coordinates(
        &self,
        query_key: &str,
        coordinates: Coordinates,
        resolved_at: DateTime<Utc>,
    ) -> Result<GeocodeEntry, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO geocode_cache (query_key, latitude, longitude, resolved_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(query_key) DO NOTHING
            "#,
        )
        .bind(query_key)
        .bind(coordinates.latitude)
        .bind(coordinates.longitude)
        .bind(resolved_at)
        .execute(&mut *tx)
        .await?;
        let (latitude, longitude, resolved_at): (f64, f64, DateTime<Utc>) = sqlx::query_as(
            "SELECT latitude, longitude, resolved_at FROM geocode_cache WHERE query_key = ?1",
        )
        .bind(query_key)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(GeocodeEntry {
            query_key: query_key.to_string(),
            coordinates: Coordinates::new(latitude, longitude),
            resolved_at,
        })
    }
}

/// A recorded real date is kept; a fallback date only yields to a real one.
fn merge_application_date(incoming: &ProjectRecord, stored: (NaiveDate, bool)) -> (NaiveDate, bool) {
    let (stored_date, stored_is_fallback) = stored;
    match (stored_is_fallback, incoming.date_is_fallback) {
        (true, false) => (incoming.application_date, false),
        (false, false) if stored_date != incoming.application_date => {
            warn!(
                source = %incoming.source,
                project_id = %incoming.project_id,
                stored = %stored_date,
                incoming = %incoming.application_date,
                "source reports a different application date; keeping the recorded one"
            );
            (stored_date, false)
        }
        _ => (stored_date, stored_is_fallback),
    }
}

fn count(row: &SqliteRow, column: &str) -> Result<u32, StoreError> {
    let value: i64 = row.try_get(column)?;
    u32::try_from(value).map_err(|_| StoreError::Corrupt(format!("{column}={value}")))
}

fn project_from_row(row: &SqliteRow) -> Result<StoredProject, StoreError> {
    let status: String = row.try_get("status")?;
    let raw_data: String = row.try_get("raw_data")?;
    Ok(StoredProject {
        record: ProjectRecord {
            source: row.try_get("source")?,
            project_id: row.try_get("project_id")?,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            status: ProjectStatus::from_stored(&status),
            source_status: row.try_get("source_status")?,
            address: row.try_get("address")?,
            application_date: row.try_get("application_date")?,
            collection_date: row.try_get("collection_date")?,
            date_is_fallback: row.try_get("application_date_is_fallback")?,
            latitude: row.try_get("latitude")?,
            longitude: row.try_get("longitude")?,
            location_approximate: row.try_get("location_approximate")?,
            url: row.try_get("url")?,
            raw_data: serde_json::from_str(&raw_data)?,
        },
        first_seen_at: row.try_get("first_seen_at")?,
        last_seen_at: row.try_get("last_seen_at")?,
    })
}

fn run_from_row(row: &SqliteRow) -> Result<CollectionRun, StoreError> {
    let run_id: String = row.try_get("run_id")?;
    let status: String = row.try_get("status")?;
    Ok(CollectionRun {
        run_id: Uuid::parse_str(&run_id)
            .map_err(|e| StoreError::Corrupt(format!("run_id {run_id}: {e}")))?,
        source: row.try_get("source")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        status: RunStatus::from_stored(&status)
            .ok_or_else(|| StoreError::Corrupt(format!("run status {status}")))?,
        tally: RunTally {
            records_seen: count(row, "records_seen")?,
            records_written: count(row, "records_written")?,
            records_inserted: count(row, "records_inserted")?,
            records_updated: count(row, "records_updated")?,
            records_excluded: count(row, "records_excluded")?,
            normalize_failures: count(row, "normalize_failures")?,
            store_failures: count(row, "store_failures")?,
            geocode_failures: count(row, "geocode_failures")?,
        },
        error_message: row.try_get("error_message")?,
    })
}
