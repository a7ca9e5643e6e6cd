use crate::action::migrate;
use chrono::{DateTime, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use uuid::Uuid;

/// Schema version of payloads written by this build. Older payloads are upgraded on decode.
pub const CURRENT_SCHEMA_VERSION: u32 = 2;

/// ActionId is the identity of an action. Two actions with the same id are the same action.
#[derive(Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionId(Uuid);

impl ActionId {
    pub fn new_random() -> Self {
        ActionId(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        ActionId(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Uuid::parse_str(s).map(ActionId)
    }
}

impl fmt::Debug for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The principal that produced an action. Opaque to this crate.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new<S: Into<String>>(id: S) -> Self {
        UserId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Home,
    Away,
}

/// Action is an immutable record of one discrete state change.
#[derive(Clone, Debug, PartialEq)]
pub struct Action {
    pub id: ActionId,
    pub kind: ActionKind,
    pub timestamp: DateTime<Utc>,
    pub user_id: UserId,
    pub schema_version: u32,
}

impl Action {
    pub fn new(kind: ActionKind, user_id: UserId, timestamp: DateTime<Utc>) -> Self {
        Action {
            id: ActionId::new_random(),
            kind,
            timestamp,
            user_id,
            schema_version: CURRENT_SCHEMA_VERSION,
        }
    }

    /// Returns the target if this action is an UNDO.
    pub fn undo_target(&self) -> Option<ActionId> {
        match &self.kind {
            ActionKind::Undo(undo) => Some(undo.target),
            _ => None,
        }
    }

    pub fn to_json_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// ActionKind is the closed set of action types this build understands. Anything else decodes as
/// `Unknown` and is carried verbatim so that newer clients and older nodes can coexist.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionKind {
    CreateGame(CreateGame),
    StartPeriod(StartPeriod),
    EndPeriod(EndPeriod),
    RecordScore(RecordScore),
    AdjustScore(AdjustScore),
    SetLineup(SetLineup),
    Substitution(Substitution),
    RecordNote(RecordNote),
    EndGame(EndGame),
    CreateTeam(CreateTeam),
    UpdateRoster(UpdateRoster),
    Undo(Undo),
    #[serde(skip)]
    Unknown(UnknownAction),
}

impl ActionKind {
    const KNOWN_TYPES: &'static [&'static str] = &[
        "CREATE_GAME",
        "START_PERIOD",
        "END_PERIOD",
        "RECORD_SCORE",
        "ADJUST_SCORE",
        "SET_LINEUP",
        "SUBSTITUTION",
        "RECORD_NOTE",
        "END_GAME",
        "CREATE_TEAM",
        "UPDATE_ROSTER",
        "UNDO",
    ];

    pub fn is_known_type(type_name: &str) -> bool {
        Self::KNOWN_TYPES.contains(&type_name)
    }

    pub fn is_undo(&self) -> bool {
        matches!(self, ActionKind::Undo(_))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CreateGame {
    pub home_name: String,
    pub away_name: String,
    pub periods: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StartPeriod {
    pub period: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EndPeriod {}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecordScore {
    pub side: Side,
    pub points: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AdjustScore {
    pub side: Side,
    pub delta: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Lineups are moved around as opaque data.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SetLineup {
    pub side: Side,
    pub lineup: serde_json::Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Substitution {
    pub side: Side,
    pub player_out: String,
    pub player_in: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecordNote {
    pub text: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EndGame {}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CreateTeam {
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UpdateRoster {
    pub roster: serde_json::Value,
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Undo {
    pub target: ActionId,
}

#[derive(Clone, Debug, PartialEq)]
pub struct UnknownAction {
    pub type_name: String,
    pub payload: serde_json::Value,
}

// ------- Wire form --------

/// The on-disk and on-wire shape of an action: `type` discriminant plus a `payload` object.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawAction {
    id: ActionId,
    #[serde(rename = "type")]
    type_name: String,
    #[serde(default)]
    payload: serde_json::Value,
    timestamp: DateTime<Utc>,
    user_id: UserId,
    #[serde(default = "legacy_schema_version")]
    schema_version: u32,
}

fn legacy_schema_version() -> u32 {
    1
}

impl Serialize for Action {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let (type_name, payload) = match &self.kind {
            ActionKind::Unknown(unknown) => (unknown.type_name.clone(), unknown.payload.clone()),
            known => {
                let mut tagged = serde_json::to_value(known).map_err(serde::ser::Error::custom)?;
                let type_name = match tagged.get("type").and_then(|t| t.as_str()) {
                    Some(t) => t.to_string(),
                    None => return Err(serde::ser::Error::custom("action kind serialized without a type tag")),
                };
                let payload = tagged
                    .get_mut("payload")
                    .map(serde_json::Value::take)
                    .unwrap_or_else(|| serde_json::Value::Object(Default::default()));
                (type_name, payload)
            }
        };

        RawAction {
            id: self.id,
            type_name,
            payload,
            timestamp: self.timestamp,
            user_id: self.user_id.clone(),
            schema_version: self.schema_version,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Action {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = RawAction::deserialize(deserializer)?;

        // A newer build may have changed the payload of a type we know. Either way this build
        // can't interpret it, so the record is carried verbatim like an unknown type.
        if !ActionKind::is_known_type(&raw.type_name) || raw.schema_version > CURRENT_SCHEMA_VERSION {
            return Ok(Action {
                id: raw.id,
                kind: ActionKind::Unknown(UnknownAction {
                    type_name: raw.type_name,
                    payload: raw.payload,
                }),
                timestamp: raw.timestamp,
                user_id: raw.user_id,
                schema_version: raw.schema_version,
            });
        }

        let payload = migrate::upgrade_payload(&raw.type_name, raw.payload, raw.schema_version)
            .map_err(D::Error::custom)?;
        let payload = match payload {
            serde_json::Value::Null => serde_json::Value::Object(Default::default()),
            p => p,
        };

        let tagged = serde_json::json!({ "type": raw.type_name, "payload": payload });
        let kind = serde_json::from_value(tagged).map_err(D::Error::custom)?;

        // Payload is now in current form, so the record is re-encoded at the current version.
        Ok(Action {
            id: raw.id,
            kind,
            timestamp: raw.timestamp,
            user_id: raw.user_id,
            schema_version: CURRENT_SCHEMA_VERSION,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn known_action_wire_shape() {
        let action = Action::new(
            ActionKind::RecordScore(RecordScore {
                side: Side::Home,
                points: 3,
                player: None,
            }),
            UserId::new("scorer"),
            ts(),
        );

        let value = serde_json::to_value(&action).unwrap();
        assert_eq!(value["type"], "RECORD_SCORE");
        assert_eq!(value["payload"]["side"], "home");
        assert_eq!(value["payload"]["points"], 3);
        assert_eq!(value["userId"], "scorer");
        assert_eq!(value["schemaVersion"], CURRENT_SCHEMA_VERSION);

        let decoded: Action = serde_json::from_value(value).unwrap();
        assert_eq!(decoded, action);
    }

    #[test]
    fn unknown_action_type_is_preserved_verbatim() {
        let json = serde_json::json!({
            "id": "3f1a4b7e-9a55-4b7e-8f64-8f7c3e2c1a10",
            "type": "REVIEW_REQUESTED",
            "payload": {"camera": 4},
            "timestamp": "2024-05-01T12:00:00Z",
            "userId": "ref",
            "schemaVersion": 7
        });

        let decoded: Action = serde_json::from_value(json.clone()).unwrap();
        match &decoded.kind {
            ActionKind::Unknown(unknown) => {
                assert_eq!(unknown.type_name, "REVIEW_REQUESTED");
                assert_eq!(unknown.payload["camera"], 4);
            }
            other => panic!("Expected unknown action, got {:?}", other),
        }

        assert_eq!(serde_json::to_value(&decoded).unwrap(), json);
    }

    #[test]
    fn unit_payload_may_be_omitted() {
        let json = serde_json::json!({
            "id": "3f1a4b7e-9a55-4b7e-8f64-8f7c3e2c1a11",
            "type": "END_PERIOD",
            "timestamp": "2024-05-01T12:00:00Z",
            "userId": "scorer",
            "schemaVersion": 2
        });

        let decoded: Action = serde_json::from_value(json).unwrap();
        assert_eq!(decoded.kind, ActionKind::EndPeriod(EndPeriod {}));
    }

    #[test]
    fn malformed_known_payload_is_rejected() {
        let json = serde_json::json!({
            "id": "3f1a4b7e-9a55-4b7e-8f64-8f7c3e2c1a12",
            "type": "RECORD_SCORE",
            "payload": {"side": "middle", "points": 1},
            "timestamp": "2024-05-01T12:00:00Z",
            "userId": "scorer",
            "schemaVersion": 2
        });

        assert!(serde_json::from_value::<Action>(json).is_err());
    }

    #[test]
    fn future_schema_version_of_known_type_is_preserved_verbatim() {
        let json = serde_json::json!({
            "id": "3f1a4b7e-9a55-4b7e-8f64-8f7c3e2c1a13",
            "type": "RECORD_SCORE",
            "payload": {"side": "home", "points": 2, "shotClock": 14},
            "timestamp": "2024-05-01T12:00:00Z",
            "userId": "scorer",
            "schemaVersion": 99
        });

        let decoded: Action = serde_json::from_value(json.clone()).unwrap();
        assert_eq!(decoded.schema_version, 99);
        match &decoded.kind {
            ActionKind::Unknown(unknown) => {
                assert_eq!(unknown.type_name, "RECORD_SCORE");
                assert_eq!(unknown.payload["shotClock"], 14);
            }
            other => panic!("Expected the action to be kept opaque, got {:?}", other),
        }

        assert_eq!(serde_json::to_value(&decoded).unwrap(), json);
    }
}
