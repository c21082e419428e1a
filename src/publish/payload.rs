// src/publish/payload.rs
//
// Northbound payload assembly. One record becomes one flat JSON object:
//
//   { "device_id": "D4A5F1", "timestamp": 1700000000123,
//     "<register_name>": <numeric>, ... }
//
// Registers that failed or went stale in the batch are carried as null so
// the server sees every configured point.

use serde_json::{json, Map, Value};

use crate::poll::{Quality, TelemetryRecord};

/// Build the default-mode JSON object for one record.
pub fn record_payload(record: &TelemetryRecord) -> Value {
    build(record, None)
}

/// Build a customize-mode object carrying only the listed registers.
/// Returns `None` when the record holds none of them.
pub fn record_payload_filtered(record: &TelemetryRecord, register_ids: &[String]) -> Option<Value> {
    let any = record
        .registers
        .keys()
        .any(|id| register_ids.iter().any(|want| want == id));
    if !any {
        return None;
    }
    Some(build(record, Some(register_ids)))
}

fn build(record: &TelemetryRecord, filter: Option<&[String]>) -> Value {
    let mut object = Map::new();
    object.insert("device_id".to_string(), json!(record.device_id));
    object.insert("timestamp".to_string(), json!(record.timestamp));

    for (register_id, reading) in &record.registers {
        if let Some(wanted) = filter {
            if !wanted.iter().any(|id| id == register_id) {
                continue;
            }
        }
        let value = match reading.quality {
            Quality::Ok => json!(reading.value),
            Quality::Fail | Quality::Stale => Value::Null,
        };
        object.insert(reading.name.clone(), value);
    }
    Value::Object(object)
}

/// Flatten a record into form fields for HTTP form bodies.
pub fn form_fields(record: &TelemetryRecord) -> Vec<(String, String)> {
    let mut fields = vec![
        ("device_id".to_string(), record.device_id.clone()),
        ("timestamp".to_string(), record.timestamp.to_string()),
    ];
    for reading in record.registers.values() {
        if reading.quality == Quality::Ok {
            fields.push((reading.name.clone(), reading.value.to_string()));
        }
    }
    fields
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poll::RegisterReading;
    use std::collections::BTreeMap;

    fn record() -> TelemetryRecord {
        let mut registers = BTreeMap::new();
        registers.insert(
            "R1".to_string(),
            RegisterReading {
                value: 21.5,
                quality: Quality::Ok,
                unit: "C".to_string(),
                name: "temperature".to_string(),
                raw: Some("00d7".to_string()),
            },
        );
        registers.insert(
            "R2".to_string(),
            RegisterReading {
                value: 0.0,
                quality: Quality::Fail,
                unit: "bar".to_string(),
                name: "pressure".to_string(),
                raw: None,
            },
        );
        TelemetryRecord {
            device_id: "D4A5F1".to_string(),
            device_name: "boiler".to_string(),
            timestamp: 1_700_000_000_123,
            registers,
        }
    }

    #[test]
    fn test_default_payload_shape() {
        let payload = record_payload(&record());
        assert_eq!(payload["device_id"], "D4A5F1");
        assert_eq!(payload["timestamp"], 1_700_000_000_123i64);
        assert_eq!(payload["temperature"], 21.5);
        assert_eq!(payload["pressure"], Value::Null);
    }

    #[test]
    fn test_filtered_payload() {
        let payload =
            record_payload_filtered(&record(), &["R1".to_string()]).unwrap();
        assert_eq!(payload["temperature"], 21.5);
        assert!(payload.get("pressure").is_none());

        // No overlap: nothing to publish on this topic
        assert!(record_payload_filtered(&record(), &["R9".to_string()]).is_none());
    }

    #[test]
    fn test_form_fields_skip_failed() {
        let fields = form_fields(&record());
        assert!(fields.contains(&("temperature".to_string(), "21.5".to_string())));
        assert!(!fields.iter().any(|(k, _)| k == "pressure"));
    }
}
