use thiserror::Error;
use uuid::Uuid;

use import_common::journal::JournalError;
use import_common::model::Record;
use import_common::store::StoreError;

/// Enumeration of errors surfaced by the HTTP record sink.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("failed to reach record storage: {0}")]
    Request(#[from] reqwest::Error),
    #[error("record storage responded with status {0}, expected 201 Created")]
    UnexpectedStatus(http::StatusCode),
}

/// Enumeration of failures an event handler can resolve with. Everything here
/// is an explicitly handled outcome: the triggering event is still committed
/// after the duplicate/error handler has seen it.
#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("a state store error occurred while processing the event")]
    Store(#[from] StoreError),
    #[error("duplicate event received for chunk {chunk_id} of job execution {job_execution_id}")]
    DuplicateEvent {
        job_execution_id: Uuid,
        chunk_id: Uuid,
    },
    #[error("failed to publish {} records to storage: {message}", failed_records.len())]
    RecordsPublishing {
        message: String,
        failed_records: Vec<Record>,
    },
    #[error("malformed event payload")]
    Payload(#[from] serde_json::Error),
    #[error(transparent)]
    Journal(#[from] JournalError),
    #[error("required event header {0} is missing")]
    MissingHeader(&'static str),
}
