use std::time::Duration;

use async_trait::async_trait;
use http::StatusCode;
use reqwest::header;

use import_common::event::{TENANT_HEADER, TOKEN_HEADER};
use import_common::model::{Record, RecordCollection};

use crate::error::SinkError;

pub const RECORDS_COLLECTION_PATH: &str = "/source-storage/records/collection";

/// Destination the parsed records of a chunk are written to, one call per
/// chunk. The call either durably stores the whole batch or fails it.
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn publish(&self, records: &[Record], tenant: &str, token: &str) -> Result<(), SinkError>;
}

pub struct HttpRecordSink {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRecordSink {
    pub fn new(base_url: &str, request_timeout: Duration) -> Self {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent("import-consumer")
            .timeout(request_timeout)
            .build()
            .expect("failed to construct reqwest client for the record sink");
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
        }
    }
}

#[async_trait]
impl RecordSink for HttpRecordSink {
    async fn publish(&self, records: &[Record], tenant: &str, token: &str) -> Result<(), SinkError> {
        let collection = RecordCollection {
            records: records.to_vec(),
            total_records: records.len(),
        };
        let response = self
            .client
            .post(format!("{}{}", self.base_url, RECORDS_COLLECTION_PATH))
            .header(TENANT_HEADER, tenant)
            .header(TOKEN_HEADER, token)
            .json(&collection)
            .send()
            .await?;

        // Only a creation status counts as a durable write. A 2xx like 200 or
        // 204 means the storage did something other than create the batch.
        match response.status() {
            StatusCode::CREATED => Ok(()),
            status => Err(SinkError::UnexpectedStatus(status)),
        }
    }
}
