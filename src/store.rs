// Persistence layer: connection pool, schema bootstrap, and the row types
// shared by the river consumer and the aggregator.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool};
use tracing::info;

use crate::error::PipelineError;

const SCHEMA: &str = include_str!("../schema.sql");

/// One persisted jewel listing. `item_id` is unique; rows for a stash are
/// the snapshot from the most recent change event seen for that stash.
#[derive(Debug, Clone, FromRow)]
pub struct JewelRow {
    pub id: i64,
    pub jewel_type: String,
    pub jewel_class: String,
    pub allocated_node: String,
    pub item_id: String,
    pub stash_id: String,
    pub league: String,
    pub list_price_amount: f64,
    pub list_price_currency: String,
    pub last_change_id: String,
    pub recorded_at: DateTime<Utc>,
}

/// Append-only processing log; the newest row doubles as the durable cursor
/// the consumer resumes from after a restart.
#[derive(Debug, Clone, FromRow)]
pub struct ChangesetRow {
    pub id: i64,
    pub change_id: String,
    pub next_change_id: String,
    pub stash_count: i32,
    pub processed_at: DateTime<Utc>,
    pub time_taken_ms: i64,
    pub drift_from_head: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct NewChangeset {
    pub change_id: String,
    pub next_change_id: String,
    pub stash_count: i32,
    pub processed_at: DateTime<Utc>,
    pub time_taken_ms: i64,
    pub drift_from_head: Option<i64>,
}

#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    /// Connect to Postgres and bootstrap the schema.
    pub async fn connect(connstr: &str) -> Result<Self, PipelineError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(connstr)
            .await?;

        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        info!("database connected, schema ready");

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// The newest processed changeset, if any.
    pub async fn latest_changeset(&self) -> Result<Option<ChangesetRow>, PipelineError> {
        sqlx::query_as(
            "SELECT id, change_id, next_change_id, stash_count, processed_at, time_taken_ms, \
             drift_from_head \
             FROM changesets ORDER BY id DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(Into::into)
    }

    pub async fn insert_changeset(&self, changeset: &NewChangeset) -> Result<(), PipelineError> {
        sqlx::query(
            "INSERT INTO changesets \
             (change_id, next_change_id, stash_count, processed_at, time_taken_ms, drift_from_head) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&changeset.change_id)
        .bind(&changeset.next_change_id)
        .bind(changeset.stash_count)
        .bind(changeset.processed_at)
        .bind(changeset.time_taken_ms)
        .bind(changeset.drift_from_head)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
