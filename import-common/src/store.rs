use sqlx::postgres::{PgPool, PgPoolOptions};
use thiserror::Error;
use uuid::Uuid;

use crate::filter::{JobExecutionFilter, SortField};
use crate::journal::JournalRecord;
use crate::model::{DataType, JobErrorStatus, JobExecution, JobExecutionSourceChunk};

/// Enumeration of errors for operations against the job/chunk state store.
/// Errors can originate from sqlx and are wrapped by us to provide additional context.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("connection failed with: {error}")]
    Connection { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    Query {
        command: String,
        error: sqlx::Error,
    },
    #[error("job execution {0} was not found")]
    JobNotFound(Uuid),
    #[error("source chunk {0} was not found")]
    ChunkNotFound(Uuid),
}

pub type StoreResult<T> = Result<T, StoreError>;

fn query_error(command: &str) -> impl FnOnce(sqlx::Error) -> StoreError + '_ {
    move |error| StoreError::Query {
        command: command.to_owned(),
        error,
    }
}

/// A new import run to register. Jobs are submitted outside the pipeline;
/// this insert exists for that surface and for tests.
pub struct NewJobExecution {
    pub id: Uuid,
    pub hrid: String,
    pub file_name: String,
    pub data_type: DataType,
    pub job_profile_id: Option<Uuid>,
    pub job_profile_name: Option<String>,
}

/// A source chunk on first contact, before any parsing has happened.
pub struct NewSourceChunk {
    pub id: Uuid,
    pub job_execution_id: Uuid,
    pub is_last: bool,
    pub chunk_size: i32,
}

/// Row store for job executions, their source chunks and the journal.
///
/// Job and chunk rows are mutated by whichever consumer instance owns the
/// triggering event, so every update here is a conditional read-modify-write
/// against the persisted state, never a blind overwrite.
#[derive(Clone)]
pub struct JobExecutionStore {
    pool: PgPool,
}

impl JobExecutionStore {
    pub async fn new(url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|error| StoreError::Connection { error })?;

        Ok(Self { pool })
    }

    pub fn new_from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create_job_execution(&self, new: &NewJobExecution) -> StoreResult<()> {
        sqlx::query(
            r#"
INSERT INTO job_executions (id, hrid, file_name, status, data_type, job_profile_id, job_profile_name)
VALUES ($1, $2, $3, 'NEW', $4, $5, $6)
            "#,
        )
        .bind(new.id)
        .bind(&new.hrid)
        .bind(&new.file_name)
        .bind(new.data_type.as_str())
        .bind(new.job_profile_id)
        .bind(&new.job_profile_name)
        .execute(&self.pool)
        .await
        .map_err(query_error("INSERT"))?;

        Ok(())
    }

    pub async fn get_job_execution(&self, id: Uuid) -> StoreResult<JobExecution> {
        sqlx::query_as::<_, JobExecution>("SELECT * FROM job_executions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_error("SELECT"))?
            .ok_or(StoreError::JobNotFound(id))
    }

    /// Persists a chunk in IN_PROGRESS state. Returns false when a chunk with
    /// this id already exists; that conflict is the duplicate-delivery signal
    /// for redelivered events, and nothing is mutated in that case.
    /// A chunk referencing a job that does not exist fails with JobNotFound.
    pub async fn save_source_chunk(&self, new: &NewSourceChunk) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
INSERT INTO job_execution_source_chunks (id, job_execution_id, is_last, state, chunk_size)
VALUES ($1, $2, $3, 'IN_PROGRESS', $4)
ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(new.id)
        .bind(new.job_execution_id)
        .bind(new.is_last)
        .bind(new.chunk_size)
        .execute(&self.pool)
        .await
        .map_err(|error| match &error {
            sqlx::Error::Database(db_error) if db_error.is_foreign_key_violation() => {
                StoreError::JobNotFound(new.job_execution_id)
            }
            _ => StoreError::Query {
                command: "INSERT".to_owned(),
                error,
            },
        })?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn get_source_chunk(&self, id: Uuid) -> StoreResult<JobExecutionSourceChunk> {
        sqlx::query_as::<_, JobExecutionSourceChunk>(
            "SELECT * FROM job_execution_source_chunks WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(query_error("SELECT"))?
        .ok_or(StoreError::ChunkNotFound(id))
    }

    /// Moves a chunk out of IN_PROGRESS exactly once. A chunk already in a
    /// terminal state stays untouched.
    pub async fn mark_chunk_terminal(
        &self,
        chunk_id: Uuid,
        completed: bool,
    ) -> StoreResult<()> {
        let state = if completed { "COMPLETED" } else { "ERROR" };
        let result = sqlx::query(&format!(
            r#"
UPDATE job_execution_source_chunks
SET state = '{state}', completed_date = NOW()
WHERE id = $1 AND state = 'IN_PROGRESS'
            "#
        ))
        .bind(chunk_id)
        .execute(&self.pool)
        .await
        .map_err(query_error("UPDATE"))?;

        if result.rows_affected() == 1 {
            return Ok(());
        }
        // 0 rows either means the chunk is gone or it is already terminal.
        self.get_source_chunk(chunk_id).await.map(|_| ())
    }

    pub async fn increment_chunk_progress(&self, chunk_id: Uuid, delta: i32) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
UPDATE job_execution_source_chunks
SET processed_amount = processed_amount + $2
WHERE id = $1
            "#,
        )
        .bind(chunk_id)
        .bind(delta)
        .execute(&self.pool)
        .await
        .map_err(query_error("UPDATE"))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::ChunkNotFound(chunk_id));
        }
        Ok(())
    }

    pub async fn increment_job_progress(&self, job_execution_id: Uuid, delta: i32) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
UPDATE job_executions
SET progress_current = progress_current + $2
WHERE id = $1
            "#,
        )
        .bind(job_execution_id)
        .bind(delta)
        .execute(&self.pool)
        .await
        .map_err(query_error("UPDATE"))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::JobNotFound(job_execution_id));
        }
        Ok(())
    }

    /// Advances a NEW job to PARSING_IN_PROGRESS, idempotently: a job already
    /// in that status or later is left as-is. Returns the current row.
    pub async fn ensure_status_parsing(&self, job_execution_id: Uuid) -> StoreResult<JobExecution> {
        sqlx::query(
            r#"
UPDATE job_executions
SET status = 'PARSING_IN_PROGRESS'
WHERE id = $1 AND status = 'NEW'
            "#,
        )
        .bind(job_execution_id)
        .execute(&self.pool)
        .await
        .map_err(query_error("UPDATE"))?;

        self.get_job_execution(job_execution_id).await
    }

    /// Populates actor, progress total and start time exactly once per job;
    /// the `started_date IS NULL` predicate makes later calls no-ops.
    pub async fn ensure_job_started(
        &self,
        job_execution_id: Uuid,
        run_by_first_name: &str,
        run_by_last_name: &str,
        progress_total: i32,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
UPDATE job_executions
SET run_by_first_name = $2, run_by_last_name = $3, progress_total = $4, started_date = NOW()
WHERE id = $1 AND started_date IS NULL
            "#,
        )
        .bind(job_execution_id)
        .bind(run_by_first_name)
        .bind(run_by_last_name)
        .bind(progress_total)
        .execute(&self.pool)
        .await
        .map_err(query_error("UPDATE"))?;

        Ok(())
    }

    /// Drives a job to ERROR with the given classification. A job that already
    /// committed is never flipped back.
    pub async fn mark_job_error(
        &self,
        job_execution_id: Uuid,
        error_status: JobErrorStatus,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
UPDATE job_executions
SET status = 'ERROR', error_status = $2, completed_date = NOW()
WHERE id = $1 AND status <> 'COMMITTED'
            "#,
        )
        .bind(job_execution_id)
        .bind(error_status)
        .execute(&self.pool)
        .await
        .map_err(query_error("UPDATE"))?;

        Ok(())
    }

    /// True once a chunk flagged as the terminal marker has been recorded.
    pub async fn has_last_chunk(&self, job_execution_id: Uuid) -> StoreResult<bool> {
        sqlx::query_scalar::<_, bool>(
            r#"
SELECT EXISTS (
    SELECT 1 FROM job_execution_source_chunks
    WHERE job_execution_id = $1 AND is_last
)
            "#,
        )
        .bind(job_execution_id)
        .fetch_one(&self.pool)
        .await
        .map_err(query_error("SELECT"))
    }

    /// True when no chunk of the job is still IN_PROGRESS. ERROR chunks count
    /// as finished here so a partial failure cannot hang the job forever.
    pub async fn all_chunks_finished(&self, job_execution_id: Uuid) -> StoreResult<bool> {
        sqlx::query_scalar::<_, bool>(
            r#"
SELECT NOT EXISTS (
    SELECT 1 FROM job_execution_source_chunks
    WHERE job_execution_id = $1 AND state = 'IN_PROGRESS'
)
            "#,
        )
        .bind(job_execution_id)
        .fetch_one(&self.pool)
        .await
        .map_err(query_error("SELECT"))
    }

    /// Compare-and-set finalization: only the caller that observes the job
    /// still PARSING_IN_PROGRESS commits it and stamps the completion time.
    /// Concurrent attempts racing near the tail of a job see false here.
    pub async fn finalize_job_execution(&self, job_execution_id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
UPDATE job_executions
SET status = 'COMMITTED', completed_date = NOW()
WHERE id = $1 AND status = 'PARSING_IN_PROGRESS'
            "#,
        )
        .bind(job_execution_id)
        .execute(&self.pool)
        .await
        .map_err(query_error("UPDATE"))?;

        Ok(result.rows_affected() == 1)
    }

    /// Filtered, sorted job listing for the audit query surface. The filter
    /// and sort field are validated/constructed upstream (`crate::filter`).
    pub async fn list_job_executions(
        &self,
        filter: &JobExecutionFilter,
        sort: &SortField,
        offset: i64,
        limit: i64,
    ) -> StoreResult<Vec<JobExecution>> {
        let query = format!(
            "SELECT * FROM job_executions WHERE {} ORDER BY {} OFFSET $1 LIMIT $2",
            filter.build_where_clause(),
            sort
        );

        sqlx::query_as::<_, JobExecution>(&query)
            .bind(offset)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(query_error("SELECT"))
    }

    pub async fn save_journal_record(&self, record: &JournalRecord) -> StoreResult<()> {
        sqlx::query(
            r#"
INSERT INTO journal_records
    (id, job_execution_id, source_id, source_record_order, entity_type, action_type,
     action_status, action_date, entity_id, entity_hrid, instance_id, holdings_id, error)
VALUES
    ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(record.id)
        .bind(record.job_execution_id)
        .bind(record.source_id)
        .bind(record.source_record_order)
        .bind(record.entity_type)
        .bind(record.action_type)
        .bind(record.action_status)
        .bind(record.action_date)
        .bind(&record.entity_id)
        .bind(&record.entity_hrid)
        .bind(&record.instance_id)
        .bind(&record.holdings_id)
        .bind(&record.error)
        .execute(&self.pool)
        .await
        .map_err(query_error("INSERT"))?;

        Ok(())
    }

    /// Journal entries for one job, oldest first.
    pub async fn journal_records_by_job(
        &self,
        job_execution_id: Uuid,
        offset: i64,
        limit: i64,
    ) -> StoreResult<Vec<JournalRecord>> {
        sqlx::query_as::<_, JournalRecord>(
            r#"
SELECT * FROM journal_records
WHERE job_execution_id = $1
ORDER BY action_date, source_record_order
OFFSET $2 LIMIT $3
            "#,
        )
        .bind(job_execution_id)
        .bind(offset)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(query_error("SELECT"))
    }

    /// Processing log of a single source record within a job.
    pub async fn record_processing_log(
        &self,
        job_execution_id: Uuid,
        source_id: Uuid,
    ) -> StoreResult<Vec<JournalRecord>> {
        sqlx::query_as::<_, JournalRecord>(
            r#"
SELECT * FROM journal_records
WHERE job_execution_id = $1 AND source_id = $2
ORDER BY action_date
            "#,
        )
        .bind(job_execution_id)
        .bind(source_id)
        .fetch_all(&self.pool)
        .await
        .map_err(query_error("SELECT"))
    }
}

#[cfg(test)]
mod tests {
    use sqlx::PgPool;

    use super::*;
    use crate::filter::SortOrder;
    use crate::journal::{ActionStatus, ActionType, EntityType};
    use crate::model::{ChunkState, JobStatus};

    async fn new_job(store: &JobExecutionStore, hrid: &str) -> Uuid {
        let id = Uuid::new_v4();
        store
            .create_job_execution(&NewJobExecution {
                id,
                hrid: hrid.to_owned(),
                file_name: format!("{hrid}.mrc"),
                data_type: DataType::Marc,
                job_profile_id: None,
                job_profile_name: Some("Default job profile".to_owned()),
            })
            .await
            .expect("failed to create job execution");
        id
    }

    async fn new_chunk(store: &JobExecutionStore, job_id: Uuid, is_last: bool) -> Uuid {
        let id = Uuid::new_v4();
        let inserted = store
            .save_source_chunk(&NewSourceChunk {
                id,
                job_execution_id: job_id,
                is_last,
                chunk_size: 2,
            })
            .await
            .expect("failed to save chunk");
        assert!(inserted);
        id
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn duplicate_chunk_insert_is_signalled_and_harmless(db: PgPool) {
        let store = JobExecutionStore::new_from_pool(db);
        let job_id = new_job(&store, "1000001").await;
        let chunk_id = new_chunk(&store, job_id, false).await;

        store.mark_chunk_terminal(chunk_id, true).await.unwrap();

        let inserted = store
            .save_source_chunk(&NewSourceChunk {
                id: chunk_id,
                job_execution_id: job_id,
                is_last: false,
                chunk_size: 2,
            })
            .await
            .unwrap();
        assert!(!inserted);

        // The redelivered insert must not have touched the completed chunk.
        let chunk = store.get_source_chunk(chunk_id).await.unwrap();
        assert_eq!(chunk.state, ChunkState::Completed);
        assert!(chunk.completed_date.is_some());
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn chunk_for_unknown_job_is_not_found(db: PgPool) {
        let store = JobExecutionStore::new_from_pool(db);
        let job_id = Uuid::new_v4();

        let result = store
            .save_source_chunk(&NewSourceChunk {
                id: Uuid::new_v4(),
                job_execution_id: job_id,
                is_last: false,
                chunk_size: 2,
            })
            .await;

        assert!(matches!(result, Err(StoreError::JobNotFound(id)) if id == job_id));
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn status_advance_is_idempotent(db: PgPool) {
        let store = JobExecutionStore::new_from_pool(db);
        let job_id = new_job(&store, "1000002").await;

        let job = store.ensure_status_parsing(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::ParsingInProgress);

        let job = store.ensure_status_parsing(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::ParsingInProgress);

        let missing = store.ensure_status_parsing(Uuid::new_v4()).await;
        assert!(matches!(missing, Err(StoreError::JobNotFound(_))));
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn job_metadata_is_populated_exactly_once(db: PgPool) {
        let store = JobExecutionStore::new_from_pool(db);
        let job_id = new_job(&store, "1000003").await;

        store
            .ensure_job_started(job_id, "DIKU", "ADMINISTRATOR", 500)
            .await
            .unwrap();
        store
            .ensure_job_started(job_id, "OTHER", "ACTOR", 9000)
            .await
            .unwrap();

        let job = store.get_job_execution(job_id).await.unwrap();
        assert_eq!(job.run_by_first_name.as_deref(), Some("DIKU"));
        assert_eq!(job.progress_total, 500);
        assert!(job.started_date.is_some());
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn completion_requires_the_terminal_marker_chunk(db: PgPool) {
        let store = JobExecutionStore::new_from_pool(db);
        let job_id = new_job(&store, "1000004").await;

        let first = new_chunk(&store, job_id, false).await;
        let second = new_chunk(&store, job_id, false).await;
        store.mark_chunk_terminal(first, true).await.unwrap();
        store.mark_chunk_terminal(second, true).await.unwrap();

        // Any number of finished non-last chunks is not completion.
        assert!(!store.has_last_chunk(job_id).await.unwrap());
        assert!(store.all_chunks_finished(job_id).await.unwrap());

        let last = new_chunk(&store, job_id, true).await;
        assert!(store.has_last_chunk(job_id).await.unwrap());
        assert!(!store.all_chunks_finished(job_id).await.unwrap());

        // An ERROR chunk still counts as finished for the completion check.
        store.mark_chunk_terminal(last, false).await.unwrap();
        assert!(store.all_chunks_finished(job_id).await.unwrap());
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn finalization_fires_at_most_once(db: PgPool) {
        let store = JobExecutionStore::new_from_pool(db);
        let job_id = new_job(&store, "1000005").await;
        store.ensure_status_parsing(job_id).await.unwrap();

        let (first, second) = tokio::join!(
            store.finalize_job_execution(job_id),
            store.finalize_job_execution(job_id),
        );
        let wins = [first.unwrap(), second.unwrap()];
        assert_eq!(wins.iter().filter(|won| **won).count(), 1);

        let job = store.get_job_execution(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Committed);
        assert!(job.completed_date.is_some());
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn errored_job_is_never_committed(db: PgPool) {
        let store = JobExecutionStore::new_from_pool(db);
        let job_id = new_job(&store, "1000006").await;
        store.ensure_status_parsing(job_id).await.unwrap();
        store
            .mark_job_error(job_id, JobErrorStatus::RecordUpdateError)
            .await
            .unwrap();

        assert!(!store.finalize_job_execution(job_id).await.unwrap());

        let job = store.get_job_execution(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(job.error_status, Some(JobErrorStatus::RecordUpdateError));
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn listing_applies_filter_and_sort(db: PgPool) {
        let store = JobExecutionStore::new_from_pool(db);
        let committed = new_job(&store, "1000123").await;
        store.ensure_status_parsing(committed).await.unwrap();
        store.finalize_job_execution(committed).await.unwrap();
        let _other = new_job(&store, "2000456").await;

        let filter = JobExecutionFilter::default()
            .with_status_any(vec![JobStatus::Committed])
            .with_hrid_pattern("1000*");
        let sort = SortField::new("completed_date", SortOrder::Desc).unwrap();

        let jobs = store
            .list_job_executions(&filter, &sort, 0, 10)
            .await
            .unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, committed);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn journal_records_round_trip(db: PgPool) {
        let store = JobExecutionStore::new_from_pool(db);
        let job_id = new_job(&store, "1000007").await;
        let source_id = Uuid::new_v4();

        let record = JournalRecord {
            id: Uuid::new_v4(),
            job_execution_id: job_id,
            source_id,
            source_record_order: 4,
            entity_type: EntityType::MarcBibliographic,
            action_type: ActionType::Parse,
            action_status: ActionStatus::Error,
            action_date: chrono::Utc::now(),
            entity_id: None,
            entity_hrid: None,
            instance_id: None,
            holdings_id: None,
            error: Some("bad leader".to_owned()),
        };
        store.save_journal_record(&record).await.unwrap();

        let by_job = store.journal_records_by_job(job_id, 0, 10).await.unwrap();
        assert_eq!(by_job.len(), 1);
        assert_eq!(by_job[0].error.as_deref(), Some("bad leader"));

        let by_record = store.record_processing_log(job_id, source_id).await.unwrap();
        assert_eq!(by_record.len(), 1);
        assert_eq!(by_record[0].source_record_order, 4);
    }
}
