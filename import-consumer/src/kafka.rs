use rdkafka::config::ClientConfig;
use rdkafka::error::KafkaError;
use rdkafka::message::OwnedHeaders;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;

use crate::config::KafkaConfig;

pub fn create_kafka_producer(config: &KafkaConfig) -> Result<FutureProducer, KafkaError> {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", &config.kafka_hosts)
        .set("statistics.interval.ms", "10000")
        .set("linger.ms", config.kafka_producer_linger_ms.to_string())
        .set(
            "message.timeout.ms",
            config.kafka_message_timeout_ms.to_string(),
        )
        .set("compression.codec", &config.kafka_compression_codec)
        .set("message.max.bytes", config.kafka_max_request_size.to_string());
    if config.kafka_tls {
        client_config
            .set("security.protocol", "ssl")
            .set("enable.ssl.certificate.verification", "false");
    }

    client_config.create()
}

/// Produces one event and waits for broker acknowledgement. Delivery retries
/// up to `message.timeout.ms` happen inside librdkafka.
pub async fn send_event(
    producer: &FutureProducer,
    topic: &str,
    key: &str,
    headers: OwnedHeaders,
    payload: &str,
) -> Result<(), KafkaError> {
    let record = FutureRecord::to(topic)
        .key(key)
        .headers(headers)
        .payload(payload);

    match producer.send(record, Timeout::Never).await {
        Ok(_) => Ok(()),
        Err((error, _)) => Err(error),
    }
}
