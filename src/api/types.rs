use crate::replica;
use std::net::{Ipv4Addr, SocketAddr};

/// Where to send writes instead: the leader's client-facing address.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LeaderInfo {
    pub node_id: String,
    pub ip_addr: Ipv4Addr,
    pub sync_port: u16,
}

impl LeaderInfo {
    pub fn sync_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip_addr.into(), self.sync_port)
    }
}

impl From<replica::LeaderRedirectInfo> for LeaderInfo {
    fn from(internal_leader: replica::LeaderRedirectInfo) -> Self {
        Self {
            node_id: internal_leader.replica_id.into_inner(),
            ip_addr: internal_leader.ip_addr,
            sync_port: internal_leader.sync_port,
        }
    }
}
