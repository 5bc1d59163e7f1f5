use std::sync::Arc;

use async_trait::async_trait;
use metrics::counter;
use tracing::{error, info, warn};
use uuid::Uuid;

use import_common::event::{RawRecordsChunk, JOB_EXECUTION_ID_HEADER};
use import_common::model::{DataType, JobErrorStatus, Record};
use import_common::store::{JobExecutionStore, NewSourceChunk, StoreResult};

use crate::consumer::{EventContext, EventHandler};
use crate::error::HandlerError;
use crate::parser::{add_back_reference_fields, parse_records};
use crate::sink::RecordSink;

pub const CHUNKS_PROCESSED: &str = "import_chunks_processed_total";
pub const RECORDS_PARSED: &str = "import_records_parsed_total";
pub const RECORD_PARSE_FAILURES: &str = "import_record_parse_failures_total";
pub const JOBS_COMMITTED: &str = "import_jobs_committed_total";

/// Drives one raw-records chunk through the pipeline: registers the chunk,
/// advances the owning job, parses and enriches the records, publishes them
/// to storage, then settles the chunk and checks the job for completion.
pub struct ChunkOrchestrator {
    store: JobExecutionStore,
    sink: Arc<dyn RecordSink>,
    run_by_first_name: String,
    run_by_last_name: String,
    progress_threshold: usize,
}

impl ChunkOrchestrator {
    pub fn new(
        store: JobExecutionStore,
        sink: Arc<dyn RecordSink>,
        run_by_first_name: String,
        run_by_last_name: String,
        progress_threshold: usize,
    ) -> Self {
        Self {
            store,
            sink,
            run_by_first_name,
            run_by_last_name,
            progress_threshold,
        }
    }

    pub async fn process_chunk(
        &self,
        chunk: RawRecordsChunk,
        job_execution_id: Uuid,
        chunk_id: Uuid,
        tenant: &str,
        token: &str,
    ) -> Result<(), HandlerError> {
        let inserted = self
            .store
            .save_source_chunk(&NewSourceChunk {
                id: chunk_id,
                job_execution_id,
                is_last: chunk.last,
                chunk_size: chunk.records.len() as i32,
            })
            .await?;
        if !inserted {
            return Err(HandlerError::DuplicateEvent {
                job_execution_id,
                chunk_id,
            });
        }

        let job = self.store.ensure_status_parsing(job_execution_id).await?;
        self.store
            .ensure_job_started(
                job_execution_id,
                &self.run_by_first_name,
                &self.run_by_last_name,
                chunk.total_records,
            )
            .await?;

        let data_type = job.data_type().unwrap_or_else(|invalid| {
            warn!(%job_execution_id, "job has invalid data type ({invalid}), assuming MARC");
            DataType::Marc
        });
        let mut records = parse_records(&chunk.records, job_execution_id, data_type);
        add_back_reference_fields(&mut records);

        let parse_failures = records
            .iter()
            .filter(|record| record.error_record.is_some())
            .count();
        counter!(RECORDS_PARSED).increment(records.len() as u64);
        counter!(RECORD_PARSE_FAILURES).increment(parse_failures as u64);

        if let Err(publish_error) = self
            .publish_records(&records, job_execution_id, chunk_id, tenant, token)
            .await
        {
            if matches!(publish_error, HandlerError::RecordsPublishing { .. }) {
                self.store
                    .mark_job_error(job_execution_id, JobErrorStatus::RecordUpdateError)
                    .await?;
                self.store.mark_chunk_terminal(chunk_id, false).await?;
                counter!(CHUNKS_PROCESSED, "outcome" => "error").increment(1);
            }
            return Err(publish_error);
        }

        self.store.mark_chunk_terminal(chunk_id, true).await?;
        counter!(CHUNKS_PROCESSED, "outcome" => "completed").increment(1);

        if self.processing_completed(job_execution_id).await?
            && self.store.finalize_job_execution(job_execution_id).await?
        {
            info!(%job_execution_id, "job execution committed");
            counter!(JOBS_COMMITTED).increment(1);
        }
        Ok(())
    }

    /// A job is complete once its terminal-marker chunk has been seen and no
    /// chunk is still in progress. Until the marker arrives the job stays
    /// open no matter how many chunks have finished.
    async fn processing_completed(&self, job_execution_id: Uuid) -> StoreResult<bool> {
        if !self.store.has_last_chunk(job_execution_id).await? {
            return Ok(false);
        }
        self.store.all_chunks_finished(job_execution_id).await
    }

    /// Publishes the batch and persists progress after each durable write,
    /// never ahead of it. Batches above the threshold go out in five slices
    /// so progress stays visible during a long chunk; smaller batches publish
    /// once. On a sink failure, everything not yet durably sunk is returned
    /// as the failed remainder.
    async fn publish_records(
        &self,
        records: &[Record],
        job_execution_id: Uuid,
        chunk_id: Uuid,
        tenant: &str,
        token: &str,
    ) -> Result<(), HandlerError> {
        if records.is_empty() {
            return Ok(());
        }
        let partition = if records.len() > self.progress_threshold {
            (records.len() / 5).max(1)
        } else {
            records.len()
        };

        let mut published = 0;
        for batch in records.chunks(partition) {
            if let Err(sink_error) = self.sink.publish(batch, tenant, token).await {
                error!(%job_execution_id, %chunk_id, "failed to publish records to storage: {sink_error}");
                return Err(HandlerError::RecordsPublishing {
                    message: sink_error.to_string(),
                    failed_records: records[published..].to_vec(),
                });
            }
            published += batch.len();
            self.store
                .increment_chunk_progress(chunk_id, batch.len() as i32)
                .await?;
            self.store
                .increment_job_progress(job_execution_id, batch.len() as i32)
                .await?;
        }
        Ok(())
    }
}

/// Adapter feeding consumed chunk events into the orchestrator.
pub struct RawChunksHandler {
    orchestrator: Arc<ChunkOrchestrator>,
}

impl RawChunksHandler {
    pub fn new(orchestrator: Arc<ChunkOrchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl EventHandler for RawChunksHandler {
    async fn handle(&self, payload: Vec<u8>, ctx: EventContext) -> Result<(), HandlerError> {
        let job_execution_id = ctx
            .job_execution_id
            .ok_or(HandlerError::MissingHeader(JOB_EXECUTION_ID_HEADER))?;
        let chunk: RawRecordsChunk = serde_json::from_slice(&payload)?;

        self.orchestrator
            .process_chunk(chunk, job_execution_id, ctx.chunk_id, &ctx.tenant, &ctx.token)
            .await
    }
}
