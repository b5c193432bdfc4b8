use async_trait::async_trait;
use chrono::NaiveDate;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use lotto_core::{DrawNumbers, DrawRecord, EvaluationResult};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("stored draw {id} is unreadable: {reason}")]
    CorruptDraw { id: i64, reason: String },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    AlreadyPresent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Recorded,
    AlreadyRecorded,
}

/// Append-only corpus of draws keyed by draw id.
///
/// `upsert_if_absent` must be safe to call concurrently for the same id: the losing
/// writer observes [`UpsertOutcome::AlreadyPresent`], never an error.
#[async_trait]
pub trait DrawStore: Send + Sync {
    async fn ensure_schema(&self) -> Result<(), StoreError>;
    async fn upsert_if_absent(&self, record: &DrawRecord) -> Result<UpsertOutcome, StoreError>;
    async fn exists(&self, id: u32) -> Result<bool, StoreError>;
    async fn get(&self, id: u32) -> Result<Option<DrawRecord>, StoreError>;
    async fn count(&self) -> Result<u64, StoreError>;
}

/// Evaluation results, unique on `(selection_key, evaluation_date)`.
#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn ensure_schema(&self) -> Result<(), StoreError>;
    async fn record_if_new(&self, result: &EvaluationResult) -> Result<RecordOutcome, StoreError>;
    async fn is_recorded(
        &self,
        selection_key: &str,
        evaluation_date: NaiveDate,
    ) -> Result<bool, StoreError>;
    async fn count(&self) -> Result<u64, StoreError>;
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn row_to_draw(row: &sqlx::postgres::PgRow) -> Result<DrawRecord, StoreError> {
        let id: i64 = row.try_get("id")?;
        let date: NaiveDate = row.try_get("draw_date")?;
        let numbers: String = row.try_get("numbers")?;
        let numbers = DrawNumbers::parse_storage_text(&numbers).map_err(|e| {
            StoreError::CorruptDraw {
                id,
                reason: e.to_string(),
            }
        })?;
        let id = u32::try_from(id).map_err(|_| StoreError::CorruptDraw {
            id,
            reason: "id out of range".to_string(),
        })?;
        Ok(DrawRecord { id, date, numbers })
    }
}

#[async_trait]
impl DrawStore for PgStore {
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS draws (
                id BIGINT PRIMARY KEY,
                draw_date DATE NOT NULL,
                numbers TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        info!("table 'draws' ensured");
        Ok(())
    }

    async fn upsert_if_absent(&self, record: &DrawRecord) -> Result<UpsertOutcome, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO draws (id, draw_date, numbers)
            VALUES ($1, $2, $3)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(i64::from(record.id))
        .bind(record.date)
        .bind(record.numbers.to_storage_text())
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) if done.rows_affected() > 0 => Ok(UpsertOutcome::Inserted),
            Ok(_) => Ok(UpsertOutcome::AlreadyPresent),
            Err(err) if is_unique_violation(&err) => Ok(UpsertOutcome::AlreadyPresent),
            Err(err) => Err(err.into()),
        }
    }

    async fn exists(&self, id: u32) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT EXISTS (SELECT 1 FROM draws WHERE id = $1) AS present")
            .bind(i64::from(id))
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("present")?)
    }

    async fn get(&self, id: u32) -> Result<Option<DrawRecord>, StoreError> {
        let row = sqlx::query("SELECT id, draw_date, numbers FROM draws WHERE id = $1")
            .bind(i64::from(id))
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_draw).transpose()
    }

    async fn count(&self) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM draws")
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n.max(0) as u64)
    }
}

#[async_trait]
impl ResultStore for PgStore {
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS results (
                id BIGSERIAL PRIMARY KEY,
                selection_key TEXT NOT NULL,
                hit_count SMALLINT NOT NULL,
                evaluation_date DATE NOT NULL,
                recorded_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                UNIQUE (selection_key, evaluation_date)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        info!("table 'results' ensured");
        Ok(())
    }

    async fn record_if_new(&self, result: &EvaluationResult) -> Result<RecordOutcome, StoreError> {
        let outcome = sqlx::query(
            r#"
            INSERT INTO results (selection_key, hit_count, evaluation_date)
            VALUES ($1, $2, $3)
            ON CONFLICT (selection_key, evaluation_date) DO NOTHING
            "#,
        )
        .bind(&result.selection_key)
        .bind(i16::from(result.hit_count))
        .bind(result.evaluation_date)
        .execute(&self.pool)
        .await;

        match outcome {
            Ok(done) if done.rows_affected() > 0 => Ok(RecordOutcome::Recorded),
            Ok(_) => Ok(RecordOutcome::AlreadyRecorded),
            Err(err) if is_unique_violation(&err) => Ok(RecordOutcome::AlreadyRecorded),
            Err(err) => Err(err.into()),
        }
    }

    async fn is_recorded(
        &self,
        selection_key: &str,
        evaluation_date: NaiveDate,
    ) -> Result<bool, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM results
                 WHERE selection_key = $1
                   AND evaluation_date = $2
            ) AS present
            "#,
        )
        .bind(selection_key)
        .bind(evaluation_date)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("present")?)
    }

    async fn count(&self) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM results")
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n.max(0) as u64)
    }
}

/// In-process store for tests and dry runs. Each key is claimed through the
/// map's entry API, so same-key writers serialize on one shard only.
#[derive(Debug, Default)]
pub struct MemoryStore {
    draws: DashMap<u32, DrawRecord>,
    results: DashMap<(String, NaiveDate), EvaluationResult>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn draw_ids(&self) -> Vec<u32> {
        let mut ids = self.draws.iter().map(|e| *e.key()).collect::<Vec<_>>();
        ids.sort_unstable();
        ids
    }

    pub fn draws(&self) -> Vec<DrawRecord> {
        let mut draws = self
            .draws
            .iter()
            .map(|e| e.value().clone())
            .collect::<Vec<_>>();
        draws.sort_by_key(|d| d.id);
        draws
    }

    pub fn results(&self) -> Vec<EvaluationResult> {
        let mut results = self
            .results
            .iter()
            .map(|e| e.value().clone())
            .collect::<Vec<_>>();
        results.sort_by(|a, b| {
            (a.evaluation_date, &a.selection_key).cmp(&(b.evaluation_date, &b.selection_key))
        });
        results
    }
}

#[async_trait]
impl DrawStore for MemoryStore {
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn upsert_if_absent(&self, record: &DrawRecord) -> Result<UpsertOutcome, StoreError> {
        match self.draws.entry(record.id) {
            Entry::Occupied(_) => Ok(UpsertOutcome::AlreadyPresent),
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok(UpsertOutcome::Inserted)
            }
        }
    }

    async fn exists(&self, id: u32) -> Result<bool, StoreError> {
        Ok(self.draws.contains_key(&id))
    }

    async fn get(&self, id: u32) -> Result<Option<DrawRecord>, StoreError> {
        Ok(self.draws.get(&id).map(|e| e.value().clone()))
    }

    async fn count(&self) -> Result<u64, StoreError> {
        Ok(self.draws.len() as u64)
    }
}

#[async_trait]
impl ResultStore for MemoryStore {
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn record_if_new(&self, result: &EvaluationResult) -> Result<RecordOutcome, StoreError> {
        let key = (result.selection_key.clone(), result.evaluation_date);
        match self.results.entry(key) {
            Entry::Occupied(_) => Ok(RecordOutcome::AlreadyRecorded),
            Entry::Vacant(slot) => {
                slot.insert(result.clone());
                Ok(RecordOutcome::Recorded)
            }
        }
    }

    async fn is_recorded(
        &self,
        selection_key: &str,
        evaluation_date: NaiveDate,
    ) -> Result<bool, StoreError> {
        Ok(self
            .results
            .contains_key(&(selection_key.to_string(), evaluation_date)))
    }

    async fn count(&self) -> Result<u64, StoreError> {
        Ok(self.results.len() as u64)
    }
}
