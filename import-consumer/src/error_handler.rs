use std::collections::HashMap;

use async_trait::async_trait;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::FutureProducer;
use tracing::{error, info, warn};
use uuid::Uuid;

use import_common::event::{
    DataImportEvent, DataImportEventType, CHUNK_ID_HEADER, ERROR_KEY, JOB_EXECUTION_ID_HEADER,
    MARC_BIBLIOGRAPHIC_KEY, RECORD_ID_HEADER, TENANT_HEADER,
};
use import_common::model::{Record, RecordType};

use crate::consumer::{ConsumeErrorHandler, EventContext};
use crate::error::HandlerError;
use crate::kafka::send_event;

/// Builds the error-event context for failed records of a type it
/// understands. Builders are consulted in order; the first eligible one wins.
pub trait ErrorPayloadBuilder: Send + Sync {
    fn is_eligible(&self, record_type: RecordType) -> bool;
    fn build_event_context(
        &self,
        message: &str,
        record: &Record,
    ) -> Result<HashMap<String, String>, serde_json::Error>;
}

pub struct MarcBibErrorPayloadBuilder;

impl ErrorPayloadBuilder for MarcBibErrorPayloadBuilder {
    fn is_eligible(&self, record_type: RecordType) -> bool {
        record_type == RecordType::MarcBib
    }

    fn build_event_context(
        &self,
        message: &str,
        record: &Record,
    ) -> Result<HashMap<String, String>, serde_json::Error> {
        let mut context = HashMap::new();
        context.insert(
            MARC_BIBLIOGRAPHIC_KEY.to_owned(),
            serde_json::to_string(record)?,
        );
        context.insert(ERROR_KEY.to_owned(), message.to_owned());
        Ok(context)
    }
}

pub fn default_payload_builders() -> Vec<Box<dyn ErrorPayloadBuilder>> {
    vec![Box::new(MarcBibErrorPayloadBuilder)]
}

/// One error event ready to produce, plus the record it concerns when the
/// failure was record-scoped.
pub struct ErrorEvent {
    pub payload: DataImportEvent,
    pub record_id: Option<Uuid>,
}

fn minimal_context(message: &str) -> HashMap<String, String> {
    HashMap::from([(ERROR_KEY.to_owned(), message.to_owned())])
}

fn record_error_context(
    message: &str,
    record: &Record,
    builders: &[Box<dyn ErrorPayloadBuilder>],
) -> HashMap<String, String> {
    let Some(builder) = builders
        .iter()
        .find(|builder| builder.is_eligible(record.record_type))
    else {
        warn!(
            record_id = %record.id,
            "no eligible error payload builder for {:?}, sending a minimal error event",
            record.record_type
        );
        return minimal_context(message);
    };
    match builder.build_event_context(message, record) {
        Ok(context) => context,
        Err(serialize_error) => {
            warn!(record_id = %record.id, "failed to serialize record for the error event: {serialize_error}");
            minimal_context(message)
        }
    }
}

/// Classifies a handler failure into the error events to emit. Duplicate
/// deliveries produce nothing; a batch publication failure produces one event
/// per failed record; anything else produces a single job-scoped event.
pub fn build_error_events(
    error: &HandlerError,
    ctx: &EventContext,
    builders: &[Box<dyn ErrorPayloadBuilder>],
) -> Vec<ErrorEvent> {
    let job_execution_id = match (error, ctx.job_execution_id) {
        (HandlerError::DuplicateEvent { .. }, _) => return Vec::new(),
        (_, None) => return Vec::new(),
        (_, Some(id)) => id,
    };
    let event = |context, record_id| ErrorEvent {
        payload: DataImportEvent {
            event_type: DataImportEventType::DiError.as_str().to_owned(),
            job_execution_id,
            tenant: ctx.tenant.clone(),
            token: ctx.token.clone(),
            context,
        },
        record_id,
    };

    match error {
        HandlerError::RecordsPublishing {
            message,
            failed_records,
        } => failed_records
            .iter()
            .map(|record| {
                event(
                    record_error_context(message, record, builders),
                    Some(record.id),
                )
            })
            .collect(),
        other => vec![event(minimal_context(&other.to_string()), None)],
    }
}

/// Terminal stop of the failure path for chunk events: duplicates are logged
/// and skipped, everything else becomes error events on the error topic so
/// the journal still gets an audit fact for the failure.
pub struct ImportErrorHandler {
    producer: FutureProducer,
    error_topic: String,
    builders: Vec<Box<dyn ErrorPayloadBuilder>>,
}

impl ImportErrorHandler {
    pub fn new(producer: FutureProducer, error_topic: String) -> Self {
        Self {
            producer,
            error_topic,
            builders: default_payload_builders(),
        }
    }

    async fn produce(&self, event: ErrorEvent, ctx: &EventContext) {
        let key = event.payload.job_execution_id.to_string();
        let payload = match serde_json::to_string(&event.payload) {
            Ok(payload) => payload,
            Err(serialize_error) => {
                error!(job_execution_id = %key, "failed to serialize error event: {serialize_error}");
                return;
            }
        };

        let mut headers = OwnedHeaders::new()
            .insert(Header {
                key: JOB_EXECUTION_ID_HEADER,
                value: Some(&key),
            })
            .insert(Header {
                key: CHUNK_ID_HEADER,
                value: Some(&ctx.chunk_id.to_string()),
            })
            .insert(Header {
                key: TENANT_HEADER,
                value: Some(&ctx.tenant),
            });
        if let Some(record_id) = event.record_id {
            headers = headers.insert(Header {
                key: RECORD_ID_HEADER,
                value: Some(&record_id.to_string()),
            });
        }

        if let Err(produce_error) =
            send_event(&self.producer, &self.error_topic, &key, headers, &payload).await
        {
            error!(job_execution_id = %key, "failed to produce error event: {produce_error}");
        }
    }
}

#[async_trait]
impl ConsumeErrorHandler for ImportErrorHandler {
    async fn handle(&self, handling_error: HandlerError, ctx: &EventContext) {
        if let HandlerError::DuplicateEvent {
            job_execution_id,
            chunk_id,
        } = &handling_error
        {
            info!(%job_execution_id, %chunk_id, "duplicate chunk event received, skipping");
            return;
        }

        let events = build_error_events(&handling_error, ctx, &self.builders);
        if events.is_empty() {
            error!("event processing failed without an emittable error event: {handling_error}");
            return;
        }
        for event in events {
            self.produce(event, ctx).await;
        }
    }
}
