use crate::fsm::{ApplyOutcome, FsmCommand, Proposer, RequestId};
use crate::membership::client::{MembershipClient, MembershipClientError};
use crate::membership::member::MemberRecord;
use crate::membership::trust_store::TrustStore;
use crate::replica::{ElectionStateChangeListener, ElectionStateSnapshot};
use crate::server::ClusterTls;
use crate::sync::Backoff;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;

#[derive(Debug, thiserror::Error)]
pub(crate) enum DiscoveryError {
    #[error("Bootstrap member {addr} unreachable after {attempts} attempts: {source}")]
    Unreachable {
        addr: SocketAddr,
        attempts: u32,
        source: MembershipClientError,
    },
    #[error("Failed to pin bootstrap member key: {0}")]
    Pin(#[from] io::Error),
}

/// Asks every bootstrap address who it is and pins the returned keys. Addresses are sync-port
/// addresses; our own is skipped. The result always contains `me`.
pub(crate) async fn discover_bootstrap_members(
    logger: &slog::Logger,
    bootstrap_addrs: &[SocketAddr],
    me: &MemberRecord,
    cluster_secret: &str,
    tls: &ClusterTls,
    trust: &TrustStore,
    max_attempts: u32,
) -> Result<Vec<MemberRecord>, DiscoveryError> {
    let my_addr = SocketAddr::new(me.ip_addr.into(), me.sync_port);
    let mut members = vec![me.clone()];

    for addr in bootstrap_addrs.iter().copied().filter(|addr| *addr != my_addr) {
        let member = describe_with_backoff(logger, addr, cluster_secret, tls, max_attempts).await?;
        slog::info!(logger, "Discovered bootstrap member {} at {}", member.node_id, addr);
        trust.pin(&member.node_id, &member.public_key)?;
        if member.node_id != me.node_id {
            members.push(member);
        }
    }

    Ok(members)
}

async fn describe_with_backoff(
    logger: &slog::Logger,
    addr: SocketAddr,
    cluster_secret: &str,
    tls: &ClusterTls,
    max_attempts: u32,
) -> Result<MemberRecord, DiscoveryError> {
    let mut backoff = Backoff::default();
    loop {
        let described = match MembershipClient::connect(addr, cluster_secret, tls).await {
            Ok(mut client) => client.describe_node().await,
            Err(e) => Err(e),
        };
        match described {
            Ok(member) => return Ok(member),
            Err(e) if backoff.attempts() + 1 >= max_attempts => {
                return Err(DiscoveryError::Unreachable {
                    addr,
                    attempts: max_attempts,
                    source: e,
                })
            }
            Err(e) => {
                let delay = backoff.next_delay();
                slog::debug!(logger, "DescribeNode {} failed, retrying in {:?}: {}", addr, delay, e);
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Watches the election state and, the first time this node leads a cluster that has no
/// authoritative membership yet, commits the founding members. Exits once trust is enforced.
pub(crate) fn spawn_cluster_formation(
    logger: slog::Logger,
    mut election: ElectionStateChangeListener,
    trust: Arc<TrustStore>,
    proposer: Proposer,
    members: Vec<MemberRecord>,
) -> JoinHandle<()> {
    let logger = logger.new(slog::o!("Task" => "ClusterFormation"));
    tokio::spawn(async move {
        let mut backoff = Backoff::default();
        let mut state = election.current();
        loop {
            if trust.is_enforcing() {
                slog::debug!(logger, "Membership is authoritative. Nothing to form.");
                return;
            }

            if state == ElectionStateSnapshot::Leader {
                let command = FsmCommand::FormCluster {
                    request_id: RequestId::new_random(),
                    members: members.clone(),
                };
                match proposer.propose(command).await {
                    Ok(ApplyOutcome::MembershipChanged { added }) => {
                        slog::info!(logger, "Formed cluster. {} members added.", added.len());
                        return;
                    }
                    Ok(outcome) => {
                        slog::warn!(logger, "Cluster formation not applied: {:?}", outcome);
                        return;
                    }
                    Err(e) => {
                        let delay = backoff.next_delay();
                        slog::warn!(logger, "Failed to form cluster, retrying in {:?}: {}", delay, e);
                        tokio::time::sleep(delay).await;
                        state = election.current();
                        continue;
                    }
                }
            }

            state = match election.next().await {
                Some(state) => state,
                None => return,
            };
        }
    })
}
