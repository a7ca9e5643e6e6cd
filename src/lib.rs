mod action;
mod actor;
mod api;
mod commitlog;
mod crypto;
mod fsm;
mod membership;
mod reducer;
mod replica;
mod server;
mod snapshot;
mod storage;
mod sync;
mod grpc {
    include!("../generated/scorebook.rs");
}

// Learning 1: `create::{root_mod}` should not have any code. Just `mod` and `pub use` statements.
// Learning 2: All `mod` statements, anywhere, should not be `pub`. Only export `pub` via individual
//             use statements.

// Data model
pub use action::effective_actions;
pub use action::next_redo_candidate;
pub use action::next_undo_candidate;
pub use action::Action;
pub use action::ActionId;
pub use action::ActionKind;
pub use action::ActionLog;
pub use action::AdjustScore;
pub use action::CreateGame;
pub use action::CreateTeam;
pub use action::EndGame;
pub use action::EndPeriod;
pub use action::EntityId;
pub use action::EntityKind;
pub use action::EntityMetadata;
pub use action::EntityRecord;
pub use action::RecordNote;
pub use action::RecordScore;
pub use action::Resolution;
pub use action::Revision;
pub use action::SetLineup;
pub use action::Side;
pub use action::StartPeriod;
pub use action::Substitution;
pub use action::Undo;
pub use action::UnknownAction;
pub use action::UpdateRoster;
pub use action::UserId;
pub use action::WriteOutcome;
pub use action::CURRENT_SCHEMA_VERSION;

// Reducer
pub use reducer::ConsistencyReport;
pub use reducer::GameReducer;
pub use reducer::GameState;
pub use reducer::GameStatus;
pub use reducer::MaterializedView;
pub use reducer::Reducer;
pub use reducer::Replay;
pub use reducer::ScoreEvent;
pub use reducer::TeamReducer;
pub use reducer::TeamState;
pub use reducer::ViewMismatch;

// Replicated state machine
pub use fsm::ApplyOutcome;
pub use fsm::EntityEvent;
pub use fsm::FsmCommand;
pub use fsm::InvalidCommand;
pub use fsm::RequestId;

// Node
pub use api::start_node;
pub use api::ConfigError;
pub use api::ElectionEvent;
pub use api::FollowerEventData;
pub use api::LeaderInfo;
pub use api::NodeConfig;
pub use api::NodeEvent;
pub use api::NodeEventListener;
pub use api::RaftOptions;
pub use api::RaftSection;
pub use api::ScorebookNode;
pub use api::ScorebookNodeConfig;
pub use api::StartNodeError;
pub use api::SubmitCommandError;
pub use api::TlsSection;
pub use api::WriteHandle;
pub use api::IDENTITY_FILE;
pub use membership::MemberRecord;
pub use membership::MembershipClient;
pub use membership::MembershipClientError;
pub use membership::NodeIdentity;

// Encryption at rest
pub use crypto::IntegrityError;
pub use crypto::KeyFile;
pub use crypto::KeyId;
pub use crypto::KeyRing;
pub use crypto::KeyRingHandle;
pub use crypto::RotationReport;
pub use crypto::SecretFileError;

// Transport security
pub use server::node_certificate_names;
pub use server::peer_server_name;
pub use server::ClusterTls;
pub use server::NodeTls;
pub use server::CLUSTER_SERVER_NAME;

// Client sync
pub use sync::fork_of;
pub use sync::reconcile;
pub use sync::remint_actions;
pub use sync::Backoff;
pub use sync::ConflictChoice;
pub use sync::ConflictResolver;
pub use sync::Divergence;
pub use sync::FetchResponse;
pub use sync::GrpcTransport;
pub use sync::LocalEntity;
pub use sync::Reconciliation;
pub use sync::SessionError;
pub use sync::SessionEvent;
pub use sync::SessionState;
pub use sync::Subscription;
pub use sync::SyncMessage;
pub use sync::SyncOutcome;
pub use sync::SyncSession;
pub use sync::SyncTransport;
pub use sync::TransportError;
pub use sync::WriteMode;
pub use sync::WriteRequest;
pub use sync::WriteResponse;
