use super::{quote, Dialect, RecordStore, StoreResult, UpsertPlan};
use crate::config::DbConfig;
use crate::constants::{CREDITS_TABLE, MOVIES_TABLE};
use crate::types::{CastMember, CreditRecord, JsonPayload, MovieMetrics};
use async_trait::async_trait;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_postgres::types::Type;
use tokio_postgres::{Client, NoTls, Row};
use tracing::{debug, error, info};

/// Record store backed by the PostgreSQL warehouse.
pub struct PostgresStore {
    client: Client,
    driver: JoinHandle<()>,
}

impl PostgresStore {
    pub async fn connect(config: &DbConfig) -> StoreResult<Self> {
        info!(
            "Connecting to PostgreSQL at {}:{}/{}",
            config.host, config.port, config.database
        );

        let (client, connection) = tokio_postgres::Config::new()
            .host(&config.host)
            .port(config.port)
            .dbname(&config.database)
            .user(&config.user)
            .password(&config.password)
            .connect(NoTls)
            .await?;

        // The connection future drives the socket; it resolves once the client is dropped.
        let driver = tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("PostgreSQL connection error: {}", e);
            }
        });

        info!("Connection to PostgreSQL successful");
        Ok(Self { client, driver })
    }
}

impl Drop for PostgresStore {
    fn drop(&mut self) {
        if self.driver.is_finished() {
            debug!("PostgreSQL connection driver already stopped");
        }
        info!("PostgreSQL connection closed");
    }
}

/// json/jsonb columns come back decoded; text columns are handed over as is.
fn payload_column(row: &Row, idx: usize) -> Result<JsonPayload, tokio_postgres::Error> {
    let ty = row.columns()[idx].type_();
    if *ty == Type::JSON || *ty == Type::JSONB {
        let value: Option<Value> = row.try_get(idx)?;
        Ok(JsonPayload::Decoded(value.unwrap_or(Value::Null)))
    } else {
        let text: Option<String> = row.try_get(idx)?;
        Ok(JsonPayload::from(text))
    }
}

#[async_trait]
impl RecordStore for PostgresStore {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn fetch_credits(&mut self) -> StoreResult<Vec<CreditRecord>> {
        let sql = format!(
            "SELECT movie_id::int8, title, {}, crew FROM {}",
            quote("cast"),
            CREDITS_TABLE
        );
        let rows = self.client.query(sql.as_str(), &[]).await?;
        let mut credits = Vec::with_capacity(rows.len());
        for row in &rows {
            let title: Option<String> = row.try_get(1)?;
            credits.push(CreditRecord {
                movie_id: row.try_get(0)?,
                title: title.unwrap_or_default(),
                cast: payload_column(row, 2)?,
                crew: payload_column(row, 3)?,
            });
        }
        debug!("Read {} credit rows", credits.len());
        Ok(credits)
    }

    async fn fetch_movie_metrics(&mut self) -> StoreResult<Vec<MovieMetrics>> {
        let sql = format!(
            "SELECT id::int8, budget::float8, popularity::float8, revenue::float8, \
             vote_average::float8, vote_count::float8 FROM {}",
            MOVIES_TABLE
        );
        let rows = self.client.query(sql.as_str(), &[]).await?;
        rows.iter()
            .map(|row| -> StoreResult<MovieMetrics> {
                Ok(MovieMetrics {
                    movie_id: row.try_get(0)?,
                    budget: row.try_get(1)?,
                    popularity: row.try_get(2)?,
                    revenue: row.try_get(3)?,
                    vote_average: row.try_get(4)?,
                    vote_count: row.try_get(5)?,
                })
            })
            .collect()
    }

    async fn fetch_cast_members(&mut self, plan: &UpsertPlan) -> StoreResult<Vec<CastMember>> {
        let rows = self.client.query(plan.select_sql().as_str(), &[]).await?;
        rows.iter()
            .map(|row| -> StoreResult<CastMember> {
                Ok(CastMember {
                    movie_id: row.try_get(0)?,
                    title: row.try_get(1)?,
                    id: row.try_get(2)?,
                    name: row.try_get(3)?,
                    order_number: row.try_get(4)?,
                    gender: row.try_get(5)?,
                    cast_id: row.try_get(6)?,
                    character: row.try_get(7)?,
                    credit_id: row.try_get(8)?,
                })
            })
            .collect()
    }

    async fn ensure_cast_table(&mut self, plan: &UpsertPlan) -> StoreResult<()> {
        self.client
            .batch_execute(&plan.create_table_sql(Dialect::Postgres))
            .await?;
        Ok(())
    }

    async fn begin(&mut self) -> StoreResult<()> {
        self.client.batch_execute("BEGIN").await?;
        Ok(())
    }

    async fn upsert_cast_batch(&mut self, plan: &UpsertPlan, rows: &[CastMember]) -> StoreResult<u64> {
        let movie_ids: Vec<i64> = rows.iter().map(|r| r.movie_id).collect();
        let titles: Vec<&str> = rows.iter().map(|r| r.title.as_str()).collect();
        let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
        let names: Vec<&str> = rows.iter().map(|r| r.name.as_str()).collect();
        let orders: Vec<i32> = rows.iter().map(|r| r.order_number).collect();
        let genders: Vec<i32> = rows.iter().map(|r| r.gender).collect();
        let cast_ids: Vec<i64> = rows.iter().map(|r| r.cast_id).collect();
        let characters: Vec<Option<&str>> = rows.iter().map(|r| r.character.as_deref()).collect();
        let credit_ids: Vec<&str> = rows.iter().map(|r| r.credit_id.as_str()).collect();

        let statement = self.client.prepare(&plan.upsert_sql(Dialect::Postgres)).await?;
        let changed = self
            .client
            .execute(
                &statement,
                &[
                    &movie_ids,
                    &titles,
                    &ids,
                    &names,
                    &orders,
                    &genders,
                    &cast_ids,
                    &characters,
                    &credit_ids,
                ],
            )
            .await?;
        Ok(changed)
    }

    async fn commit(&mut self) -> StoreResult<()> {
        self.client.batch_execute("COMMIT").await?;
        Ok(())
    }

    async fn rollback(&mut self) -> StoreResult<()> {
        self.client.batch_execute("ROLLBACK").await?;
        Ok(())
    }
}
