//! Payload upgrades between schema versions. Each step takes a payload at version `n` and returns
//! it at version `n + 1`. Decoding runs every step from the stored version up to current.

use crate::action::CURRENT_SCHEMA_VERSION;
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("{type_name} payload at schema version {version} is malformed: {reason}")]
    MalformedPayload {
        type_name: String,
        version: u32,
        reason: &'static str,
    },
    #[error("Unsupported schema version {0}")]
    UnsupportedVersion(u32),
}

pub(crate) fn upgrade_payload(type_name: &str, mut payload: Value, from_version: u32) -> Result<Value, MigrationError> {
    if from_version == 0 {
        return Err(MigrationError::UnsupportedVersion(from_version));
    }

    let mut version = from_version;
    while version < CURRENT_SCHEMA_VERSION {
        payload = match version {
            1 => v1_to_v2(type_name, payload)?,
            other => return Err(MigrationError::UnsupportedVersion(other)),
        };
        version += 1;
    }

    Ok(payload)
}

/// v2 renamed `RECORD_SCORE.runs` to `points`. Nothing else changed.
fn v1_to_v2(type_name: &str, payload: Value) -> Result<Value, MigrationError> {
    if type_name != "RECORD_SCORE" {
        return Ok(payload);
    }

    let mut object = match payload {
        Value::Object(object) => object,
        _ => {
            return Err(MigrationError::MalformedPayload {
                type_name: type_name.to_string(),
                version: 1,
                reason: "expected an object",
            })
        }
    };

    if let Some(runs) = object.remove("runs") {
        object.entry("points").or_insert(runs);
    }

    Ok(Value::Object(object))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{Action, ActionKind, RecordScore, Side};

    #[test]
    fn v1_record_score_decodes_as_points() {
        let json = serde_json::json!({
            "id": "0b1e7c9a-1d3f-4a55-9f0e-5d2f6b9a8c01",
            "type": "RECORD_SCORE",
            "payload": {"side": "away", "runs": 2},
            "timestamp": "2023-09-14T18:30:00Z",
            "userId": "scorer",
            "schemaVersion": 1
        });

        let action: Action = serde_json::from_value(json).unwrap();
        assert_eq!(
            action.kind,
            ActionKind::RecordScore(RecordScore {
                side: Side::Away,
                points: 2,
                player: None,
            })
        );
        assert_eq!(action.schema_version, CURRENT_SCHEMA_VERSION);

        let reencoded = serde_json::to_value(&action).unwrap();
        assert_eq!(reencoded["payload"]["points"], 2);
        assert!(reencoded["payload"].get("runs").is_none());
    }

    #[test]
    fn missing_schema_version_is_treated_as_v1() {
        let json = serde_json::json!({
            "id": "0b1e7c9a-1d3f-4a55-9f0e-5d2f6b9a8c02",
            "type": "RECORD_SCORE",
            "payload": {"side": "home", "runs": 1},
            "timestamp": "2023-09-14T18:31:00Z",
            "userId": "scorer"
        });

        let action: Action = serde_json::from_value(json).unwrap();
        match action.kind {
            ActionKind::RecordScore(score) => assert_eq!(score.points, 1),
            other => panic!("Unexpected kind {:?}", other),
        }
    }

    #[test]
    fn other_types_pass_through_v1_unchanged() {
        let payload = serde_json::json!({"text": "hello"});
        let upgraded = upgrade_payload("RECORD_NOTE", payload.clone(), 1).unwrap();
        assert_eq!(upgraded, payload);
    }

    #[test]
    fn version_zero_is_rejected() {
        assert!(upgrade_payload("RECORD_NOTE", serde_json::json!({}), 0).is_err());
    }
}
