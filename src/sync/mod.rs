//! Client side of the sync protocol: a local copy of an entity, the session that keeps it in
//! step with the cluster, and conflict resolution.
mod backoff;
mod local;
mod resolver;
mod session;
mod transport;
mod wire;

pub use backoff::Backoff;
pub use local::LocalEntity;
pub use resolver::fork_of;
pub use resolver::reconcile;
pub use resolver::remint_actions;
pub use resolver::ConflictChoice;
pub use resolver::ConflictResolver;
pub use resolver::Divergence;
pub use resolver::Reconciliation;
pub use session::SessionError;
pub use session::SessionEvent;
pub use session::SessionState;
pub use session::SyncOutcome;
pub use session::SyncSession;
pub use transport::FetchResponse;
pub use transport::GrpcTransport;
pub use transport::Subscription;
pub use transport::SyncMessage;
pub use transport::SyncTransport;
pub use transport::TransportError;
pub use transport::WriteMode;
pub use transport::WriteRequest;
pub use transport::WriteResponse;

pub(crate) use wire::decode_actions;
pub(crate) use wire::encode_actions;
pub(crate) use wire::parse_revision;
pub(crate) use wire::user_id_from_metadata;
pub(crate) use wire::USER_ID_HEADER;
