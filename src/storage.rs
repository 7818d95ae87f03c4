use crate::config::DbConfig;
use crate::constants::{CAST_COLUMNS, CAST_KEY_COLUMN};
use crate::error::{PipelineError, Result, StoreError};
use crate::types::{CastMember, CreditRecord, MovieMetrics};
use async_trait::async_trait;
use std::path::PathBuf;

pub mod sqlite;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use sqlite::SqliteStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// A relational store holding the `credits` and `movies` source tables and
/// the warehouse cast table.
///
/// One handle is one connection; it is released when the handle is dropped.
/// Transactions are explicit so the writer decides the commit granularity.
#[async_trait]
pub trait RecordStore: Send {
    fn backend(&self) -> &'static str;

    /// Full scan of the `credits` table.
    async fn fetch_credits(&mut self) -> StoreResult<Vec<CreditRecord>>;

    /// Full scan of the numeric columns of the `movies` table.
    async fn fetch_movie_metrics(&mut self) -> StoreResult<Vec<MovieMetrics>>;

    /// Full scan of a warehouse cast table.
    async fn fetch_cast_members(&mut self, plan: &UpsertPlan) -> StoreResult<Vec<CastMember>>;

    async fn ensure_cast_table(&mut self, plan: &UpsertPlan) -> StoreResult<()>;

    async fn begin(&mut self) -> StoreResult<()>;

    /// One multi-row upsert statement. Rows must have distinct keys.
    async fn upsert_cast_batch(&mut self, plan: &UpsertPlan, rows: &[CastMember]) -> StoreResult<u64>;

    async fn commit(&mut self) -> StoreResult<()>;

    async fn rollback(&mut self) -> StoreResult<()>;
}

/// SQL flavour of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    Postgres,
}

/// Target table of the cast upsert, with the statements each dialect needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertPlan {
    table: String,
}

impl UpsertPlan {
    pub fn for_cast(table: &str) -> StoreResult<Self> {
        validate_identifier(table)?;
        Ok(Self {
            table: table.to_string(),
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    fn column_list() -> String {
        CAST_COLUMNS
            .iter()
            .map(|c| quote(c))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn conflict_clause(&self) -> String {
        let assignments = CAST_COLUMNS
            .iter()
            .filter(|c| **c != CAST_KEY_COLUMN)
            .map(|c| format!("{col} = excluded.{col}", col = quote(c)))
            .collect::<Vec<_>>()
            .join(", ");
        format!("ON CONFLICT ({}) DO UPDATE SET {}", quote(CAST_KEY_COLUMN), assignments)
    }

    /// Multi-row upsert taking the whole batch as bound parameters.
    ///
    /// SQLite receives the batch as one JSON array (`?1`) expanded with
    /// `json_each`; PostgreSQL receives one array per column expanded with
    /// `UNNEST`. Either way the statement size does not grow with the batch.
    pub fn upsert_sql(&self, dialect: Dialect) -> String {
        let source = match dialect {
            Dialect::Sqlite => {
                let fields = CAST_COLUMNS
                    .iter()
                    .map(|c| format!("json_extract(value, '$.{c}')"))
                    .collect::<Vec<_>>()
                    .join(", ");
                // `WHERE true` keeps SQLite from parsing ON CONFLICT as a join constraint.
                format!("SELECT {fields} FROM json_each(?1) WHERE true")
            }
            Dialect::Postgres => {
                let arrays = CAST_COLUMNS
                    .iter()
                    .enumerate()
                    .map(|(i, c)| format!("${}::{}[]", i + 1, postgres_type(c)))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("SELECT * FROM UNNEST({arrays})")
            }
        };
        format!(
            "INSERT INTO {} ({}) {} {}",
            quote(&self.table),
            Self::column_list(),
            source,
            self.conflict_clause()
        )
    }

    pub fn create_table_sql(&self, dialect: Dialect) -> String {
        let columns = CAST_COLUMNS
            .iter()
            .map(|c| {
                let ty = match dialect {
                    Dialect::Sqlite => sqlite_type(c),
                    Dialect::Postgres => postgres_type(c),
                };
                let constraint = if *c == CAST_KEY_COLUMN {
                    " PRIMARY KEY"
                } else if *c == "character" {
                    ""
                } else {
                    " NOT NULL"
                };
                format!("{} {}{}", quote(c), ty, constraint)
            })
            .collect::<Vec<_>>()
            .join(", ");
        format!("CREATE TABLE IF NOT EXISTS {} ({})", quote(&self.table), columns)
    }

    pub fn select_sql(&self) -> String {
        format!("SELECT {} FROM {}", Self::column_list(), quote(&self.table))
    }
}

fn postgres_type(column: &str) -> &'static str {
    match column {
        "movie_id" | "id" | "cast_id" => "int8",
        "order_number" | "gender" => "int4",
        _ => "text",
    }
}

fn sqlite_type(column: &str) -> &'static str {
    match column {
        "movie_id" | "id" | "cast_id" | "order_number" | "gender" => "INTEGER",
        _ => "TEXT",
    }
}

pub(crate) fn quote(identifier: &str) -> String {
    format!("\"{identifier}\"")
}

fn validate_identifier(name: &str) -> StoreResult<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    };
    if valid && name.len() <= 63 {
        Ok(())
    } else {
        Err(StoreError::InvalidIdentifier(name.to_string()))
    }
}

/// Which store a run talks to.
#[derive(Debug, Clone)]
pub enum StoreTarget {
    #[cfg(feature = "postgres")]
    Postgres(DbConfig),
    Sqlite(PathBuf),
}

impl StoreTarget {
    /// `--sqlite PATH` wins; otherwise the PostgreSQL settings from the environment.
    pub fn resolve(sqlite: Option<PathBuf>) -> Result<Self> {
        if let Some(path) = sqlite {
            return Ok(StoreTarget::Sqlite(path));
        }
        #[cfg(feature = "postgres")]
        {
            Ok(StoreTarget::Postgres(DbConfig::from_env()?))
        }
        #[cfg(not(feature = "postgres"))]
        {
            Err(PipelineError::Config(
                "built without the `postgres` feature; pass --sqlite PATH".to_string(),
            ))
        }
    }
}

/// Open the single connection used for a run.
pub async fn connect(target: &StoreTarget) -> Result<Box<dyn RecordStore>> {
    match target {
        #[cfg(feature = "postgres")]
        StoreTarget::Postgres(config) => {
            let store = PostgresStore::connect(config)
                .await
                .map_err(|source| PipelineError::Connection {
                    backend: "postgres",
                    source,
                })?;
            Ok(Box::new(store))
        }
        StoreTarget::Sqlite(path) => {
            let store = SqliteStore::open(path).map_err(|source| PipelineError::Connection {
                backend: "sqlite",
                source,
            })?;
            Ok(Box::new(store))
        }
    }
}
