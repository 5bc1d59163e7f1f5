//! Consumes raw-records chunk events, parses and publishes their records to
//! storage, and tracks the owning job executions to completion.

use std::sync::Arc;

use axum::routing::get;
use envconfig::Envconfig;
use tokio::sync::watch;
use tracing::{error, info};

use import_common::event::DataImportEventType;
use import_common::health::HealthRegistry;
use import_common::metrics::{serve, setup_metrics_router};
use import_common::store::JobExecutionStore;

use import_consumer::config::Config;
use import_consumer::consumer::{ensure_topics, topic_name, ConsumeErrorHandler, EventConsumer};
use import_consumer::error_handler::ImportErrorHandler;
use import_consumer::journal_handler::JournalEventHandler;
use import_consumer::kafka::create_kafka_producer;
use import_consumer::orchestrator::{ChunkOrchestrator, RawChunksHandler};
use import_consumer::sensor::GlobalLoadSensor;
use import_consumer::sink::{HttpRecordSink, RecordSink};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("invalid configuration:");

    let store = JobExecutionStore::new(&config.database_url, config.max_pg_connections).await?;
    let sink: Arc<dyn RecordSink> = Arc::new(HttpRecordSink::new(
        &config.sink_base_url,
        config.sink_request_timeout.0,
    ));
    let orchestrator = Arc::new(ChunkOrchestrator::new(
        store.clone(),
        sink,
        config.run_by_first_name.clone(),
        config.run_by_last_name.clone(),
        config.chunk_progress_threshold,
    ));

    ensure_topics(
        &config.kafka,
        &config.env_id,
        &[
            DataImportEventType::DiRawRecordsChunkRead,
            DataImportEventType::DiError,
        ],
    )
    .await?;

    let producer = create_kafka_producer(&config.kafka)?;
    let error_handler: Arc<dyn ConsumeErrorHandler> = Arc::new(ImportErrorHandler::new(
        producer,
        topic_name(&config.env_id, DataImportEventType::DiError),
    ));

    // The in-flight ceiling is scoped per handler group: consumer instances
    // of one group share a sensor, distinct groups do not compete.
    let chunk_sensor = GlobalLoadSensor::new(config.load_limit);
    let journal_sensor = GlobalLoadSensor::new(config.load_limit);
    let liveness = HealthRegistry::new("liveness");
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let chunk_consumer = EventConsumer::new(
        &config.kafka,
        &config.env_id,
        DataImportEventType::DiRawRecordsChunkRead,
        Arc::new(RawChunksHandler::new(orchestrator)),
        Some(error_handler),
        chunk_sensor,
        liveness.register("raw-chunks-consumer", chrono::Duration::seconds(60)),
        shutdown_rx.clone(),
    )?;
    let journal_consumer = EventConsumer::new(
        &config.kafka,
        &config.env_id,
        DataImportEventType::DiError,
        Arc::new(JournalEventHandler::new(store.clone())),
        None,
        journal_sensor,
        liveness.register("journal-consumer", chrono::Duration::seconds(60)),
        shutdown_rx,
    )?;

    let health = liveness.clone();
    let router = setup_metrics_router().route(
        "/health",
        get(move || std::future::ready(health.get_status())),
    );
    let bind = config.bind();
    tokio::spawn(async move {
        if let Err(serve_error) = serve(router, &bind).await {
            error!("http server failed: {serve_error}");
        }
    });

    let chunk_task = tokio::spawn(chunk_consumer.run());
    let journal_task = tokio::spawn(journal_consumer.run());

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    shutdown_tx.send(true)?;
    let (chunk_result, journal_result) = tokio::join!(chunk_task, journal_task);
    chunk_result?;
    journal_result?;

    Ok(())
}
