use super::{quote, Dialect, RecordStore, StoreResult, UpsertPlan};
use crate::constants::{CREDITS_TABLE, MOVIES_TABLE};
use crate::types::{CastMember, CreditRecord, JsonPayload, MovieMetrics};
use async_trait::async_trait;
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection};
use serde_json::Value;
use std::path::Path;
use tracing::{debug, info};

/// Record store backed by a local SQLite database file.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let conn = Connection::open(path.as_ref())?;
        info!("Opened SQLite store at {}", path.as_ref().display());
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Ok(Self {
            conn: Connection::open_in_memory()?,
        })
    }

    /// Wrap a connection that already holds the source tables.
    pub fn from_connection(conn: Connection) -> Self {
        Self { conn }
    }
}

impl Drop for SqliteStore {
    fn drop(&mut self) {
        info!("SQLite connection closed");
    }
}

/// Text columns are still encoded; anything else is taken as already decoded.
fn payload_from_sql(value: ValueRef<'_>) -> JsonPayload {
    match value {
        ValueRef::Null => JsonPayload::Decoded(Value::Null),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
            JsonPayload::Encoded(String::from_utf8_lossy(bytes).into_owned())
        }
        ValueRef::Integer(i) => JsonPayload::Decoded(Value::from(i)),
        ValueRef::Real(f) => JsonPayload::Decoded(Value::from(f)),
    }
}

#[async_trait]
impl RecordStore for SqliteStore {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    async fn fetch_credits(&mut self) -> StoreResult<Vec<CreditRecord>> {
        let sql = format!(
            "SELECT movie_id, title, {}, crew FROM {}",
            quote("cast"),
            CREDITS_TABLE
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| {
            Ok(CreditRecord {
                movie_id: row.get(0)?,
                title: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                cast: payload_from_sql(row.get_ref(2)?),
                crew: payload_from_sql(row.get_ref(3)?),
            })
        })?;
        let credits = rows.collect::<Result<Vec<_>, _>>()?;
        debug!("Read {} credit rows", credits.len());
        Ok(credits)
    }

    async fn fetch_movie_metrics(&mut self) -> StoreResult<Vec<MovieMetrics>> {
        let sql = format!(
            "SELECT id, budget, popularity, revenue, vote_average, vote_count FROM {}",
            MOVIES_TABLE
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| {
            Ok(MovieMetrics {
                movie_id: row.get(0)?,
                budget: row.get(1)?,
                popularity: row.get(2)?,
                revenue: row.get(3)?,
                vote_average: row.get(4)?,
                vote_count: row.get(5)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    async fn fetch_cast_members(&mut self, plan: &UpsertPlan) -> StoreResult<Vec<CastMember>> {
        let mut stmt = self.conn.prepare(&plan.select_sql())?;
        let rows = stmt.query_map([], |row| {
            Ok(CastMember {
                movie_id: row.get(0)?,
                title: row.get(1)?,
                id: row.get(2)?,
                name: row.get(3)?,
                order_number: row.get(4)?,
                gender: row.get(5)?,
                cast_id: row.get(6)?,
                character: row.get(7)?,
                credit_id: row.get(8)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    async fn ensure_cast_table(&mut self, plan: &UpsertPlan) -> StoreResult<()> {
        self.conn.execute_batch(&plan.create_table_sql(Dialect::Sqlite))?;
        Ok(())
    }

    async fn begin(&mut self) -> StoreResult<()> {
        self.conn.execute_batch("BEGIN")?;
        Ok(())
    }

    async fn upsert_cast_batch(&mut self, plan: &UpsertPlan, rows: &[CastMember]) -> StoreResult<u64> {
        let batch = serde_json::to_string(rows)?;
        let mut stmt = self.conn.prepare_cached(&plan.upsert_sql(Dialect::Sqlite))?;
        let changed = stmt.execute(params![batch])?;
        Ok(changed as u64)
    }

    async fn commit(&mut self) -> StoreResult<()> {
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    async fn rollback(&mut self) -> StoreResult<()> {
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }
}
