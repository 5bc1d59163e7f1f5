use async_trait::async_trait;
use tracing::warn;

use import_common::event::{
    DataImportEvent, MARC_AUTHORITY_KEY, MARC_BIBLIOGRAPHIC_KEY, MARC_HOLDINGS_KEY,
};
use import_common::journal::{build_journal_record, ActionStatus, ActionType, EntityType};
use import_common::store::JobExecutionStore;

use crate::consumer::{EventContext, EventHandler};
use crate::error::HandlerError;

/// Consumes error events and persists one audit fact per event, so the
/// processing log of a job also covers its failed records.
pub struct JournalEventHandler {
    store: JobExecutionStore,
}

impl JournalEventHandler {
    pub fn new(store: JobExecutionStore) -> Self {
        Self { store }
    }
}

/// The recorded entity type follows which serialized record the context
/// carries, bibliographic taking precedence.
fn entity_type_for(event: &DataImportEvent) -> EntityType {
    if event.context.contains_key(MARC_BIBLIOGRAPHIC_KEY) {
        EntityType::MarcBibliographic
    } else if event.context.contains_key(MARC_AUTHORITY_KEY) {
        EntityType::MarcAuthority
    } else if event.context.contains_key(MARC_HOLDINGS_KEY) {
        EntityType::MarcHoldings
    } else {
        EntityType::MarcBibliographic
    }
}

#[async_trait]
impl EventHandler for JournalEventHandler {
    async fn handle(&self, payload: Vec<u8>, _ctx: EventContext) -> Result<(), HandlerError> {
        let event: DataImportEvent = serde_json::from_slice(&payload)?;

        let entity_type = entity_type_for(&event);
        let journal_record = match build_journal_record(
            &event,
            ActionType::Create,
            entity_type,
            ActionStatus::Error,
        ) {
            Ok(record) => record,
            Err(mapping_error) => {
                // An unmappable error event carries no attributable record;
                // retrying cannot fix it, so it is dropped after logging.
                warn!(
                    job_execution_id = %event.job_execution_id,
                    "dropping unmappable error event: {mapping_error}"
                );
                return Ok(());
            }
        };

        self.store.save_journal_record(&journal_record).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use sqlx::PgPool;
    use uuid::Uuid;

    use import_common::event::{DataImportEventType, ERROR_KEY};
    use import_common::model::DataType;
    use import_common::store::NewJobExecution;

    use crate::parser::parse_records;

    use super::*;

    fn ctx() -> EventContext {
        EventContext {
            job_execution_id: None,
            chunk_id: Uuid::new_v4(),
            tenant: "diku".to_owned(),
            token: String::new(),
        }
    }

    async fn new_job(store: &JobExecutionStore) -> Uuid {
        let id = Uuid::new_v4();
        store
            .create_job_execution(&NewJobExecution {
                id,
                hrid: "1000010".to_owned(),
                file_name: "records.json".to_owned(),
                data_type: DataType::Marc,
                job_profile_id: None,
                job_profile_name: None,
            })
            .await
            .unwrap();
        id
    }

    fn error_event(job_execution_id: Uuid) -> (DataImportEvent, Uuid) {
        let raw = vec![r#"{"leader":"01240cas a2200397   4500","fields":[]}"#.to_owned()];
        let record = parse_records(&raw, job_execution_id, DataType::Marc).remove(0);
        let record_id = record.id;

        let mut event = DataImportEvent {
            event_type: DataImportEventType::DiError.as_str().to_owned(),
            job_execution_id,
            tenant: "diku".to_owned(),
            token: String::new(),
            context: Default::default(),
        };
        event.context.insert(
            MARC_BIBLIOGRAPHIC_KEY.to_owned(),
            serde_json::to_string(&record).unwrap(),
        );
        event
            .context
            .insert(ERROR_KEY.to_owned(), "sink rejected records".to_owned());
        (event, record_id)
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn error_event_lands_in_the_journal(db: PgPool) {
        let store = JobExecutionStore::new_from_pool(db);
        let handler = JournalEventHandler::new(store.clone());
        let job_id = new_job(&store).await;
        let (event, record_id) = error_event(job_id);

        handler
            .handle(serde_json::to_vec(&event).unwrap(), ctx())
            .await
            .unwrap();

        let journal = store.journal_records_by_job(job_id, 0, 10).await.unwrap();
        assert_eq!(journal.len(), 1);
        assert_eq!(journal[0].source_id, record_id);
        assert_eq!(journal[0].entity_type, EntityType::MarcBibliographic);
        assert_eq!(journal[0].action_status, ActionStatus::Error);
        assert_eq!(journal[0].error.as_deref(), Some("sink rejected records"));

        let log = store.record_processing_log(job_id, record_id).await.unwrap();
        assert_eq!(log.len(), 1);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn unmappable_event_is_dropped_without_failing(db: PgPool) {
        let store = JobExecutionStore::new_from_pool(db);
        let handler = JournalEventHandler::new(store.clone());
        let job_id = new_job(&store).await;

        let event = DataImportEvent {
            event_type: DataImportEventType::DiError.as_str().to_owned(),
            job_execution_id: job_id,
            tenant: "diku".to_owned(),
            token: String::new(),
            context: [(ERROR_KEY.to_owned(), "boom".to_owned())].into(),
        };

        handler
            .handle(serde_json::to_vec(&event).unwrap(), ctx())
            .await
            .unwrap();

        assert!(store
            .journal_records_by_job(job_id, 0, 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn malformed_payload_is_a_handler_error(db: PgPool) {
        let store = JobExecutionStore::new_from_pool(db);
        let handler = JournalEventHandler::new(store);

        let result = handler.handle(b"not json".to_vec(), ctx()).await;

        assert!(matches!(result, Err(HandlerError::Payload(_))));
    }
}
