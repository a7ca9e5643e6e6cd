//! This mod holds the node-facing API: configuration, starting a node, and the handles a running
//! node hands out.
mod config;
mod event_bus;
mod node;
mod options;
mod types;
mod write_handle;

pub use config::ConfigError;
pub use config::NodeConfig;
pub use config::RaftSection;
pub use config::TlsSection;
pub use event_bus::ElectionEvent;
pub use event_bus::FollowerEventData;
pub use event_bus::NodeEvent;
pub use event_bus::NodeEventListener;
pub use node::start_node;
pub use node::IDENTITY_FILE;
pub use node::ScorebookNode;
pub use node::ScorebookNodeConfig;
pub use node::StartNodeError;
pub use options::RaftOptions;
pub use types::LeaderInfo;
pub use write_handle::SubmitCommandError;
pub use write_handle::WriteHandle;
