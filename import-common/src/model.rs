use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Overall status of one import run.
/// New: the job was submitted but no chunk has arrived yet.
/// ParsingInProgress: at least one chunk is being parsed.
/// Committed: the terminal chunk and all other chunks reached a finished state.
/// Error: a durable failure stopped the run; `error_status` carries the classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "job_execution_status")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    New,
    ParsingInProgress,
    Committed,
    Error,
}

impl FromStr for JobStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NEW" => Ok(JobStatus::New),
            "PARSING_IN_PROGRESS" => Ok(JobStatus::ParsingInProgress),
            "COMMITTED" => Ok(JobStatus::Committed),
            "ERROR" => Ok(JobStatus::Error),
            invalid => Err(ParseStatusError(invalid.to_owned())),
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::New => "NEW",
            JobStatus::ParsingInProgress => "PARSING_IN_PROGRESS",
            JobStatus::Committed => "COMMITTED",
            JobStatus::Error => "ERROR",
        };
        f.write_str(s)
    }
}

#[derive(Debug, PartialEq, Eq, Error)]
#[error("{0} is not a valid status")]
pub struct ParseStatusError(pub String);

/// Classification attached to a job that ended in `JobStatus::Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "job_execution_error_status")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobErrorStatus {
    RecordUpdateError,
    FileProcessingError,
}

/// Processing state of one source chunk. A chunk leaves InProgress exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "chunk_state")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChunkState {
    InProgress,
    Completed,
    Error,
}

/// Declared data type of the records a job carries, from its job profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataType {
    Marc,
    Edifact,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Marc => "MARC",
            DataType::Edifact => "EDIFACT",
        }
    }
}

impl FromStr for DataType {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MARC" => Ok(DataType::Marc),
            "EDIFACT" => Ok(DataType::Edifact),
            invalid => Err(ParseStatusError(invalid.to_owned())),
        }
    }
}

/// One bulk-import run and its progress, as persisted.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JobExecution {
    pub id: Uuid,
    pub hrid: String,
    pub file_name: String,
    pub status: JobStatus,
    pub error_status: Option<JobErrorStatus>,
    pub job_profile_id: Option<Uuid>,
    pub job_profile_name: Option<String>,
    pub data_type: String,
    pub run_by_first_name: Option<String>,
    pub run_by_last_name: Option<String>,
    pub progress_current: i32,
    pub progress_total: i32,
    pub started_date: Option<DateTime<Utc>>,
    pub completed_date: Option<DateTime<Utc>>,
}

impl JobExecution {
    pub fn data_type(&self) -> Result<DataType, ParseStatusError> {
        self.data_type.parse()
    }
}

/// One unit of raw records belonging to a job, tracked independently.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JobExecutionSourceChunk {
    pub id: Uuid,
    pub job_execution_id: Uuid,
    pub is_last: bool,
    pub state: ChunkState,
    pub chunk_size: i32,
    pub processed_amount: i32,
    pub created_date: DateTime<Utc>,
    pub completed_date: Option<DateTime<Utc>>,
}

/// Type of a structured record as understood by the downstream storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordType {
    MarcBib,
    MarcAuthority,
    MarcHolding,
    Edifact,
}

impl From<DataType> for RecordType {
    fn from(data_type: DataType) -> Self {
        match data_type {
            DataType::Marc => RecordType::MarcBib,
            DataType::Edifact => RecordType::Edifact,
        }
    }
}

/// The untouched input unit, retained verbatim next to its parsed form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawRecord {
    pub id: Uuid,
    pub content: String,
}

/// Production-ready structured content produced by the parser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedRecord {
    pub id: Uuid,
    pub content: serde_json::Value,
}

/// Original payload plus a failure description for a record that did not parse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    pub content: String,
    pub description: String,
}

/// One source record with exactly one of a parsed or an error payload attached.
/// `snapshot_id` references the owning job execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub id: Uuid,
    pub snapshot_id: Uuid,
    pub matched_id: Uuid,
    pub record_type: RecordType,
    #[serde(default)]
    pub order: i32,
    pub raw_record: RawRecord,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parsed_record: Option<ParsedRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_record: Option<ErrorRecord>,
}

/// Envelope posted to the record-storage collection-create endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordCollection {
    pub records: Vec<Record>,
    pub total_records: usize,
}
