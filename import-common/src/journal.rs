use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::event::{
    DataImportEvent, ERROR_KEY, HOLDINGS_KEY, INSTANCE_KEY, ITEM_KEY, MARC_AUTHORITY_KEY,
    MARC_BIBLIOGRAPHIC_KEY, MARC_HOLDINGS_KEY,
};
use crate::model::Record;

/// Domain entity a journal action concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "journal_entity_type")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityType {
    MarcBibliographic,
    MarcAuthority,
    MarcHoldings,
    Instance,
    Holdings,
    Item,
}

impl EntityType {
    /// The context-map key a serialized entity of this type lives under.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::MarcBibliographic => MARC_BIBLIOGRAPHIC_KEY,
            EntityType::MarcAuthority => MARC_AUTHORITY_KEY,
            EntityType::MarcHoldings => MARC_HOLDINGS_KEY,
            EntityType::Instance => INSTANCE_KEY,
            EntityType::Holdings => HOLDINGS_KEY,
            EntityType::Item => ITEM_KEY,
        }
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "journal_action_type")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
    Create,
    Update,
    Delete,
    NonMatch,
    Parse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "journal_action_status")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionStatus {
    Completed,
    Error,
}

/// An immutable audit fact: one domain action observed while processing a
/// source record, keyed by record and job. Created once, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct JournalRecord {
    pub id: Uuid,
    pub job_execution_id: Uuid,
    pub source_id: Uuid,
    pub source_record_order: i32,
    pub entity_type: EntityType,
    pub action_type: ActionType,
    pub action_status: ActionStatus,
    pub action_date: DateTime<Utc>,
    pub entity_id: Option<String>,
    pub entity_hrid: Option<String>,
    pub instance_id: Option<String>,
    pub holdings_id: Option<String>,
    pub error: Option<String>,
}

#[derive(Error, Debug)]
pub enum JournalError {
    #[error("failed to handle {event_type} event, payload context does not contain {entity_type} and/or record data")]
    MissingData {
        event_type: String,
        entity_type: EntityType,
    },
    #[error("could not map record or {entity_type} entity to a journal record")]
    Mapping {
        entity_type: EntityType,
        #[source]
        source: serde_json::Error,
    },
}

/// Picks the serialized source record out of the context, checking the three
/// MARC-family keys in priority order.
fn extract_record(event: &DataImportEvent) -> Option<&String> {
    [MARC_BIBLIOGRAPHIC_KEY, MARC_AUTHORITY_KEY, MARC_HOLDINGS_KEY]
        .iter()
        .find_map(|key| event.context.get(*key).filter(|s| !s.is_empty()))
}

fn json_str(value: &serde_json::Value, key: &str) -> Option<String> {
    value.get(key).and_then(|v| v.as_str()).map(str::to_owned)
}

/// Translates one event payload into a journal record.
///
/// For the `INSTANCE` entity type both the entity payload and the record
/// payload must be present, otherwise the audit fact would be partial and the
/// translation fails instead.
pub fn build_journal_record(
    event: &DataImportEvent,
    action_type: ActionType,
    entity_type: EntityType,
    action_status: ActionStatus,
) -> Result<JournalRecord, JournalError> {
    let entity_as_str = event.context.get(entity_type.as_str()).filter(|s| !s.is_empty());
    let record_as_str = extract_record(event);

    if entity_type == EntityType::Instance && (entity_as_str.is_none() || record_as_str.is_none()) {
        return Err(JournalError::MissingData {
            event_type: event.event_type.clone(),
            entity_type,
        });
    }

    let record: Record = serde_json::from_str(record_as_str.map(String::as_str).unwrap_or(""))
        .map_err(|source| JournalError::Mapping {
            entity_type,
            source,
        })?;

    let mut journal_record = JournalRecord {
        id: Uuid::new_v4(),
        job_execution_id: record.snapshot_id,
        source_id: record.id,
        source_record_order: record.order,
        entity_type,
        action_type,
        action_status,
        action_date: Utc::now(),
        entity_id: None,
        entity_hrid: None,
        instance_id: None,
        holdings_id: None,
        error: None,
    };

    if let Some(entity_as_str) = entity_as_str {
        let entity: serde_json::Value =
            serde_json::from_str(entity_as_str).map_err(|source| JournalError::Mapping {
                entity_type,
                source,
            })?;
        journal_record.entity_id = json_str(&entity, "id");

        if matches!(
            entity_type,
            EntityType::Instance | EntityType::Holdings | EntityType::Item
        ) {
            if entity_type == EntityType::Holdings {
                journal_record.instance_id = json_str(&entity, "instanceId");
            }
            if entity_type == EntityType::Item {
                journal_record.instance_id = cross_referenced_instance_id(event, entity_type)?;
                journal_record.holdings_id = json_str(&entity, "holdingsRecordId");
            }
            journal_record.entity_hrid = json_str(&entity, "hrid");
        }
    }

    if action_status == ActionStatus::Error {
        journal_record.error = event.context.get(ERROR_KEY).cloned();
    }

    Ok(journal_record)
}

/// An item's instance id is not on the item itself; it is taken from the
/// instance payload when present, or through the holdings payload otherwise.
fn cross_referenced_instance_id(
    event: &DataImportEvent,
    entity_type: EntityType,
) -> Result<Option<String>, JournalError> {
    let (key, field) = if event.context.contains_key(INSTANCE_KEY) {
        (INSTANCE_KEY, "id")
    } else if event.context.contains_key(HOLDINGS_KEY) {
        (HOLDINGS_KEY, "instanceId")
    } else {
        return Ok(None);
    };

    let entity: serde_json::Value = serde_json::from_str(&event.context[key]).map_err(|source| {
        JournalError::Mapping {
            entity_type,
            source,
        }
    })?;
    Ok(json_str(&entity, field))
}
