use serde_json::{json, Value};
use uuid::Uuid;

use import_common::model::{DataType, ErrorRecord, ParsedRecord, RawRecord, Record, RecordType};

/// Field tag carrying the back-reference from the parsed content to the
/// record's generated id.
const TAG_999: &str = "999";

/// Outcome of parsing one raw record: structured content, or a description of
/// why the payload could not be parsed.
pub enum ParsedResult {
    Parsed(Value),
    Error(String),
}

pub trait RecordParser: Send + Sync {
    fn parse(&self, raw_record: &str) -> ParsedResult;
}

/// Parser for MARC records serialized as MARC-in-JSON. A record must carry a
/// string `leader` and an array of `fields` to count as parsed.
pub struct MarcJsonParser;

impl RecordParser for MarcJsonParser {
    fn parse(&self, raw_record: &str) -> ParsedResult {
        match serde_json::from_str::<Value>(raw_record) {
            Ok(content)
                if content.get("leader").is_some_and(Value::is_string)
                    && content.get("fields").is_some_and(Value::is_array) =>
            {
                ParsedResult::Parsed(content)
            }
            Ok(_) => ParsedResult::Error("record is missing a leader and/or fields".to_owned()),
            Err(error) => ParsedResult::Error(error.to_string()),
        }
    }
}

/// Fallback for declared type/encoding combinations no available parser
/// understands. Every record comes back as an error record, the batch still
/// flows through the pipeline.
struct UnsupportedFormatParser {
    data_type: DataType,
}

impl RecordParser for UnsupportedFormatParser {
    fn parse(&self, _raw_record: &str) -> ParsedResult {
        ParsedResult::Error(format!(
            "unsupported record format for data type {}",
            self.data_type.as_str()
        ))
    }
}

/// Selects a parser from the job's declared data type and the detected
/// encoding of the first record in the batch.
pub fn select_parser(data_type: DataType, first_record: &str) -> Box<dyn RecordParser> {
    match data_type {
        DataType::Marc if first_record.trim_start().starts_with('{') => Box::new(MarcJsonParser),
        _ => Box::new(UnsupportedFormatParser { data_type }),
    }
}

/// Turns a batch of raw record strings into `Record`s, preserving input order.
/// Each record gets fresh identifiers; `snapshot_id` ties it to its job
/// execution. A record that fails to parse keeps its original content next to
/// the failure description instead of halting the batch.
pub fn parse_records(raw_records: &[String], job_execution_id: Uuid, data_type: DataType) -> Vec<Record> {
    if raw_records.is_empty() {
        return Vec::new();
    }
    let parser = select_parser(data_type, &raw_records[0]);
    let record_type = RecordType::from(data_type);

    raw_records
        .iter()
        .enumerate()
        .map(|(order, raw)| {
            let mut record = Record {
                id: Uuid::new_v4(),
                snapshot_id: job_execution_id,
                matched_id: Uuid::new_v4(),
                record_type,
                order: order as i32,
                raw_record: RawRecord {
                    id: Uuid::new_v4(),
                    content: raw.clone(),
                },
                parsed_record: None,
                error_record: None,
            };
            match parser.parse(raw) {
                ParsedResult::Parsed(content) => {
                    record.parsed_record = Some(ParsedRecord {
                        id: Uuid::new_v4(),
                        content,
                    });
                }
                ParsedResult::Error(description) => {
                    record.error_record = Some(ErrorRecord {
                        content: raw.clone(),
                        description,
                    });
                }
            }
            record
        })
        .collect()
}

/// Enriches successfully parsed MARC bibliographic content with an `s`
/// subfield in a repeatable `999` field (indicators `f`/`f`) holding the
/// record's own generated id, so downstream storage can link the content back.
pub fn add_back_reference_fields(records: &mut [Record]) {
    for record in records {
        if record.record_type == RecordType::MarcBib {
            add_back_reference(record);
        }
    }
}

fn add_back_reference(record: &mut Record) {
    let Some(parsed) = record.parsed_record.as_mut() else {
        return;
    };
    let Some(fields) = parsed.content.get_mut("fields").and_then(Value::as_array_mut) else {
        return;
    };

    let subfield = json!({ "s": record.id });
    let existing = fields
        .iter_mut()
        .filter_map(|field| field.get_mut(TAG_999))
        .find(|field| field.get("ind1") == Some(&json!("f")) && field.get("ind2") == Some(&json!("f")));

    match existing {
        Some(field) => {
            if let Some(subfields) = field.get_mut("subfields").and_then(Value::as_array_mut) {
                subfields.push(subfield);
            }
        }
        None => {
            fields.push(json!({
                TAG_999: { "ind1": "f", "ind2": "f", "subfields": [subfield] }
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MARC_JSON: &str =
        r#"{"leader":"01240cas a2200397   4500","fields":[{"001":"in00001"},{"008":"750907c19509999"}]}"#;

    fn subfield_s(record: &Record) -> Option<String> {
        let fields = record.parsed_record.as_ref()?.content.get("fields")?.as_array()?;
        let field = fields.iter().find_map(|field| field.get(TAG_999))?;
        let subfields = field.get("subfields")?.as_array()?;
        subfields
            .iter()
            .find_map(|sf| sf.get("s"))
            .and_then(Value::as_str)
            .map(str::to_owned)
    }

    #[test]
    fn parses_a_batch_in_order_with_fresh_ids() {
        let job_execution_id = Uuid::new_v4();
        let raw = vec![MARC_JSON.to_owned(), MARC_JSON.to_owned()];

        let records = parse_records(&raw, job_execution_id, DataType::Marc);

        assert_eq!(records.len(), 2);
        for (order, record) in records.iter().enumerate() {
            assert_eq!(record.order, order as i32);
            assert_eq!(record.snapshot_id, job_execution_id);
            assert_eq!(record.record_type, RecordType::MarcBib);
            assert!(record.parsed_record.is_some());
            assert!(record.error_record.is_none());
        }
        assert_ne!(records[0].id, records[1].id);
    }

    #[test]
    fn malformed_record_keeps_original_content() {
        let raw = vec![MARC_JSON.to_owned(), "{\"leader\": 42}".to_owned(), "not json".to_owned()];

        let records = parse_records(&raw, Uuid::new_v4(), DataType::Marc);

        assert!(records[0].error_record.is_none());
        let missing_fields = records[1].error_record.as_ref().unwrap();
        assert_eq!(missing_fields.content, raw[1]);
        assert!(missing_fields.description.contains("leader"));
        let unparseable = records[2].error_record.as_ref().unwrap();
        assert_eq!(unparseable.content, raw[2]);
        assert!(records[2].parsed_record.is_none());
    }

    #[test]
    fn undetected_encoding_errors_the_whole_batch() {
        let raw = vec!["00024nam a2200037".to_owned()];

        let records = parse_records(&raw, Uuid::new_v4(), DataType::Marc);

        let error = records[0].error_record.as_ref().unwrap();
        assert!(error.description.contains("unsupported record format"));
    }

    #[test]
    fn back_reference_lands_in_a_new_999_field() {
        let mut records = parse_records(&[MARC_JSON.to_owned()], Uuid::new_v4(), DataType::Marc);

        add_back_reference_fields(&mut records);

        assert_eq!(subfield_s(&records[0]), Some(records[0].id.to_string()));
    }

    #[test]
    fn back_reference_joins_an_existing_999ff_field() {
        let raw = r#"{"leader":"01240cas a2200397   4500","fields":[{"999":{"ind1":"f","ind2":"f","subfields":[{"i":"existing"}]}}]}"#;
        let mut records = parse_records(&[raw.to_owned()], Uuid::new_v4(), DataType::Marc);

        add_back_reference_fields(&mut records);

        let fields = records[0].parsed_record.as_ref().unwrap().content["fields"]
            .as_array()
            .unwrap();
        assert_eq!(fields.len(), 1);
        let subfields = fields[0][TAG_999]["subfields"].as_array().unwrap();
        assert_eq!(subfields.len(), 2);
        assert_eq!(subfields[1]["s"], json!(records[0].id));
    }

    #[test]
    fn error_records_are_not_enriched() {
        let mut records = parse_records(&["not json".to_owned()], Uuid::new_v4(), DataType::Marc);

        add_back_reference_fields(&mut records);

        assert!(records[0].parsed_record.is_none());
        assert_eq!(records[0].error_record.as_ref().unwrap().content, "not json");
    }

    #[test]
    fn empty_batch_yields_no_records() {
        assert!(parse_records(&[], Uuid::new_v4(), DataType::Marc).is_empty());
    }
}
