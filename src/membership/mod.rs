mod client;
mod formation;
mod identity;
mod member;
mod trust_store;

pub use client::MembershipClient;
pub use client::MembershipClientError;
pub use identity::node_id_for_key;
pub use identity::parse_public_key;
pub use identity::verify_node_id;
pub use identity::IdentityError;
pub use identity::NodeIdentity;
pub use member::InvalidNodeInfo;
pub use member::MemberRecord;
pub use member::Membership;
pub use member::MembershipStore;
pub use trust_store::TrustError;
pub use trust_store::TrustStore;

pub(crate) use client::CLUSTER_SECRET_HEADER;
pub(crate) use formation::discover_bootstrap_members;
pub(crate) use formation::DiscoveryError;
pub(crate) use formation::spawn_cluster_formation;
pub(crate) use identity::PeerCredentials;

#[cfg(test)]
pub(crate) use member::test_support;
