mod client_services;
mod membership_server;
mod peer_auth;
mod raft_server;
mod shutdown;
mod sync_server;
mod tls;

pub(crate) use client_services::ClientServices;
pub(crate) use membership_server::MembershipServer;
pub(crate) use peer_auth::PeerAuthenticator;
pub(crate) use raft_server::RaftServer;
pub(crate) use shutdown::shutdown_handle;
pub(crate) use shutdown::RpcServerShutdownHandle;
pub(crate) use shutdown::RpcServerShutdownSignal;
pub(crate) use sync_server::SyncServer;
pub use tls::node_certificate_names;
pub use tls::peer_server_name;
pub use tls::ClusterTls;
pub use tls::NodeTls;
pub use tls::CLUSTER_SERVER_NAME;

#[cfg(test)]
pub(crate) use tls::test_support;
