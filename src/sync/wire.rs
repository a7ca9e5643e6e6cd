use crate::action::{Action, Revision, UserId};
use tonic::metadata::{MetadataMap, MetadataValue};
use tonic::Status;

/// The end user a sync request acts for. Followers forward it unchanged to the leader.
pub(crate) const USER_ID_HEADER: &str = "x-user-id";

pub(crate) fn encode_actions(actions: &[Action]) -> Result<Vec<Vec<u8>>, serde_json::Error> {
    actions.iter().map(Action::to_json_bytes).collect()
}

pub(crate) fn decode_actions(actions: &[Vec<u8>]) -> Result<Vec<Action>, serde_json::Error> {
    actions.iter().map(|bytes| Action::from_json_bytes(bytes)).collect()
}

pub(crate) fn parse_revision(s: &str) -> Result<Revision, Status> {
    Revision::parse(s).map_err(|e| Status::invalid_argument(format!("Invalid revision {:?}: {}", s, e)))
}

pub(crate) fn attach_user_id(metadata: &mut MetadataMap, user_id: &UserId) -> Result<(), Status> {
    let value = MetadataValue::from_str(user_id.as_str())
        .map_err(|_| Status::invalid_argument("User id is not a valid header value"))?;
    metadata.insert(USER_ID_HEADER, value);
    Ok(())
}

pub(crate) fn user_id_from_metadata(metadata: &MetadataMap) -> Result<UserId, Status> {
    metadata
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(UserId::new)
        .ok_or_else(|| Status::unauthenticated("Missing x-user-id header"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_id_header() {
        let mut metadata = MetadataMap::new();
        assert_eq!(
            user_id_from_metadata(&metadata).unwrap_err().code(),
            tonic::Code::Unauthenticated
        );
        attach_user_id(&mut metadata, &UserId::new("scorer-7")).unwrap();
        assert_eq!(user_id_from_metadata(&metadata).unwrap(), UserId::new("scorer-7"));
    }

    #[test]
    fn bad_revision_is_invalid_argument() {
        assert!(parse_revision("").unwrap().is_empty());
        assert_eq!(parse_revision("nope").unwrap_err().code(), tonic::Code::InvalidArgument);
    }
}
