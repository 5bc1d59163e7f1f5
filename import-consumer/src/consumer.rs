use std::sync::Arc;
use std::time;

use async_trait::async_trait;
use metrics::gauge;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{Headers, Message, OwnedMessage};
use rdkafka::types::RDKafkaErrorCode;
use tokio::sync::watch;
use tracing::{debug, error, info};
use uuid::Uuid;

use import_common::event::{
    DataImportEventType, CHUNK_ID_HEADER, JOB_EXECUTION_ID_HEADER, TENANT_HEADER, TOKEN_HEADER,
};
use import_common::health::HealthHandle;

use crate::config::KafkaConfig;
use crate::error::HandlerError;
use crate::sensor::GlobalLoadSensor;

pub const IN_FLIGHT_EVENTS: &str = "import_in_flight_events";

/// Values carried on the transport headers of one consumed event.
///
/// The chunk id doubles as the idempotency key of chunk events; when the
/// producer did not set one, the consumer assigns a fresh id so the event
/// still flows (it then cannot be deduplicated against redeliveries).
#[derive(Debug, Clone)]
pub struct EventContext {
    pub job_execution_id: Option<Uuid>,
    pub chunk_id: Uuid,
    pub tenant: String,
    pub token: String,
}

/// Processes one consumed event. Returning an error hands the event to the
/// consumer's error handler; either way the event is considered resolved and
/// its offset is stored.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle(&self, payload: Vec<u8>, ctx: EventContext) -> Result<(), HandlerError>;
}

/// Resolves a failed event, typically by logging or producing error events.
#[async_trait]
pub trait ConsumeErrorHandler: Send + Sync + 'static {
    async fn handle(&self, error: HandlerError, ctx: &EventContext);
}

/// Topics are namespaced by deployment environment.
pub fn topic_name(env_id: &str, event_type: DataImportEventType) -> String {
    format!("{env_id}.Default.{event_type}")
}

/// Creates the topics this service consumes and produces, tolerating topics
/// that already exist.
pub async fn ensure_topics(
    config: &KafkaConfig,
    env_id: &str,
    event_types: &[DataImportEventType],
) -> Result<(), KafkaError> {
    let admin: AdminClient<DefaultClientContext> = ClientConfig::new()
        .set("bootstrap.servers", &config.kafka_hosts)
        .create()?;

    let names: Vec<String> = event_types
        .iter()
        .map(|event_type| topic_name(env_id, *event_type))
        .collect();
    let topics: Vec<NewTopic> = names
        .iter()
        .map(|name| {
            NewTopic::new(
                name,
                config.kafka_num_partitions,
                TopicReplication::Fixed(config.kafka_replication_factor),
            )
        })
        .collect();

    for result in admin.create_topics(&topics, &AdminOptions::new()).await? {
        match result {
            Ok(topic) => info!("created topic {topic}"),
            Err((topic, RDKafkaErrorCode::TopicAlreadyExists)) => {
                debug!("topic {topic} already exists")
            }
            Err((_, code)) => return Err(KafkaError::AdminOp(code)),
        }
    }
    Ok(())
}

/// One consumer loop bound to a single event-type topic.
///
/// Offsets are stored only after the handler future resolves (successfully or
/// through the error handler), so a crash mid-handling leads to redelivery
/// rather than a lost event. Intake stops while the load sensor is at its
/// ceiling.
pub struct EventConsumer {
    consumer: Arc<StreamConsumer>,
    topic: String,
    handler: Arc<dyn EventHandler>,
    error_handler: Option<Arc<dyn ConsumeErrorHandler>>,
    sensor: GlobalLoadSensor,
    liveness: HealthHandle,
    shutdown: watch::Receiver<bool>,
}

impl EventConsumer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &KafkaConfig,
        env_id: &str,
        event_type: DataImportEventType,
        handler: Arc<dyn EventHandler>,
        error_handler: Option<Arc<dyn ConsumeErrorHandler>>,
        sensor: GlobalLoadSensor,
        liveness: HealthHandle,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, KafkaError> {
        let topic = topic_name(env_id, event_type);

        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.kafka_hosts)
            .set("group.id", &config.kafka_consumer_group)
            .set("auto.offset.reset", "earliest")
            .set("enable.partition.eof", "false")
            // Offsets are stored manually once a handler resolves; the
            // background auto-commit then only persists processed positions.
            .set("enable.auto.offset.store", "false")
            .set("enable.auto.commit", "true");
        if config.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        }
        let consumer: StreamConsumer = client_config.create()?;
        consumer.subscribe(&[&topic])?;

        Ok(Self {
            consumer: Arc::new(consumer),
            topic,
            handler,
            error_handler,
            sensor,
            liveness,
            shutdown,
        })
    }

    pub async fn run(mut self) {
        info!(topic = %self.topic, "consumer starting");
        let mut report_interval = tokio::time::interval(time::Duration::from_secs(15));
        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    // A dropped sender also means the process is going away.
                    if changed.is_err() || *self.shutdown.borrow() {
                        info!(topic = %self.topic, "consumer shutting down");
                        break;
                    }
                }
                _ = report_interval.tick() => {
                    self.liveness.report_healthy();
                }
                message = self.consumer.recv() => {
                    match message {
                        Err(receive_error) => {
                            error!(topic = %self.topic, "failed to receive message: {receive_error}");
                        }
                        Ok(message) => {
                            self.liveness.report_healthy();
                            let partition = message.partition();
                            let offset = message.offset();
                            let message = message.detach();

                            let permit = self.sensor.acquire().await;
                            gauge!(IN_FLIGHT_EVENTS).set(self.sensor.current() as f64);

                            let consumer = self.consumer.clone();
                            let topic = self.topic.clone();
                            let handler = self.handler.clone();
                            let error_handler = self.error_handler.clone();
                            tokio::spawn(async move {
                                dispatch(message, handler, error_handler).await;
                                if let Err(store_error) =
                                    consumer.store_offset(&topic, partition, offset)
                                {
                                    error!(%topic, partition, offset, "failed to store offset: {store_error}");
                                }
                                drop(permit);
                            });
                        }
                    }
                }
            }
        }

        // Wait for in-flight handlers, then flush their stored offsets.
        self.sensor.drain().await;
        match self.consumer.commit_consumer_state(CommitMode::Sync) {
            Ok(()) | Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => {}
            Err(commit_error) => {
                error!(topic = %self.topic, "failed to commit consumer state: {commit_error}")
            }
        }
    }
}

async fn dispatch(
    message: OwnedMessage,
    handler: Arc<dyn EventHandler>,
    error_handler: Option<Arc<dyn ConsumeErrorHandler>>,
) {
    let ctx = parse_context(&message);
    let payload = message.payload().map(<[u8]>::to_vec).unwrap_or_default();
    if let Err(handling_error) = handler.handle(payload, ctx.clone()).await {
        match &error_handler {
            Some(error_handler) => error_handler.handle(handling_error, &ctx).await,
            None => error!("event processing failed, dropping the event: {handling_error}"),
        }
    }
}

fn parse_context(message: &OwnedMessage) -> EventContext {
    let mut ctx = EventContext {
        job_execution_id: None,
        chunk_id: Uuid::new_v4(),
        tenant: String::new(),
        token: String::new(),
    };
    let Some(headers) = message.headers() else {
        return ctx;
    };
    for header in headers.iter() {
        let Some(value) = header.value.and_then(|v| std::str::from_utf8(v).ok()) else {
            continue;
        };
        match header.key {
            JOB_EXECUTION_ID_HEADER => ctx.job_execution_id = value.parse().ok(),
            CHUNK_ID_HEADER => {
                if let Ok(chunk_id) = value.parse() {
                    ctx.chunk_id = chunk_id;
                }
            }
            TENANT_HEADER => ctx.tenant = value.to_owned(),
            TOKEN_HEADER => ctx.token = value.to_owned(),
            _ => {}
        }
    }
    ctx
}

#[cfg(test)]
mod tests {
    use rdkafka::message::{Header, OwnedHeaders};
    use rdkafka::Timestamp;

    use super::*;

    fn message_with_headers(headers: OwnedHeaders) -> OwnedMessage {
        OwnedMessage::new(
            Some(b"{}".to_vec()),
            None,
            "folio.Default.DI_RAW_RECORDS_CHUNK_READ".to_owned(),
            Timestamp::NotAvailable,
            0,
            0,
            Some(headers),
        )
    }

    #[test]
    fn topic_names_are_environment_scoped() {
        assert_eq!(
            topic_name("folio", DataImportEventType::DiRawRecordsChunkRead),
            "folio.Default.DI_RAW_RECORDS_CHUNK_READ"
        );
        assert_eq!(
            topic_name("staging", DataImportEventType::DiError),
            "staging.Default.DI_ERROR"
        );
    }

    #[test]
    fn context_reads_all_known_headers() {
        let job_execution_id = Uuid::new_v4();
        let chunk_id = Uuid::new_v4();
        let headers = OwnedHeaders::new()
            .insert(Header {
                key: JOB_EXECUTION_ID_HEADER,
                value: Some(&job_execution_id.to_string()),
            })
            .insert(Header {
                key: CHUNK_ID_HEADER,
                value: Some(&chunk_id.to_string()),
            })
            .insert(Header {
                key: TENANT_HEADER,
                value: Some("diku"),
            })
            .insert(Header {
                key: TOKEN_HEADER,
                value: Some("token-1"),
            });

        let ctx = parse_context(&message_with_headers(headers));

        assert_eq!(ctx.job_execution_id, Some(job_execution_id));
        assert_eq!(ctx.chunk_id, chunk_id);
        assert_eq!(ctx.tenant, "diku");
        assert_eq!(ctx.token, "token-1");
    }

    #[test]
    fn missing_chunk_id_gets_a_fresh_one() {
        let first = parse_context(&message_with_headers(OwnedHeaders::new()));
        let second = parse_context(&message_with_headers(OwnedHeaders::new()));

        assert!(first.job_execution_id.is_none());
        assert_ne!(first.chunk_id, second.chunk_id);
        assert!(first.tenant.is_empty());
    }

    #[test]
    fn unparseable_header_values_are_ignored() {
        let headers = OwnedHeaders::new().insert(Header {
            key: JOB_EXECUTION_ID_HEADER,
            value: Some("not-a-uuid"),
        });

        let ctx = parse_context(&message_with_headers(headers));

        assert!(ctx.job_execution_id.is_none());
    }
}
