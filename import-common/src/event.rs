use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Reserved context keys carried in a `DataImportEvent` context map.
pub const ERROR_KEY: &str = "ERROR";
pub const MARC_BIBLIOGRAPHIC_KEY: &str = "MARC_BIBLIOGRAPHIC";
pub const MARC_AUTHORITY_KEY: &str = "MARC_AUTHORITY";
pub const MARC_HOLDINGS_KEY: &str = "MARC_HOLDINGS";
pub const INSTANCE_KEY: &str = "INSTANCE";
pub const HOLDINGS_KEY: &str = "HOLDINGS";
pub const ITEM_KEY: &str = "ITEM";

/// Transport header names on consumed and produced events.
pub const JOB_EXECUTION_ID_HEADER: &str = "jobExecutionId";
pub const CHUNK_ID_HEADER: &str = "chunkId";
pub const RECORD_ID_HEADER: &str = "recordId";
pub const TENANT_HEADER: &str = "x-okapi-tenant";
pub const TOKEN_HEADER: &str = "x-okapi-token";

/// Event-type feeds this pipeline consumes or produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataImportEventType {
    DiRawRecordsChunkRead,
    DiError,
}

impl DataImportEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataImportEventType::DiRawRecordsChunkRead => "DI_RAW_RECORDS_CHUNK_READ",
            DataImportEventType::DiError => "DI_ERROR",
        }
    }
}

impl std::fmt::Display for DataImportEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The transport envelope: a flat string-keyed context map carries serialized
/// entities relevant to the action, under the reserved keys above.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataImportEvent {
    pub event_type: String,
    pub job_execution_id: Uuid,
    pub tenant: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub context: HashMap<String, String>,
}

/// Payload of one ingestion event: an ordered slice of raw record strings,
/// the terminal-marker flag and the total original record count of the batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawRecordsChunk {
    pub records: Vec<String>,
    pub last: bool,
    pub total_records: i32,
}
