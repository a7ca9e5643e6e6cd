use crate::grpc::grpc_membership_server::GrpcMembershipServer;
use crate::grpc::grpc_sync_server::GrpcSyncServer;
use crate::server::{MembershipServer, RpcServerShutdownSignal, SyncServer};
use std::net::SocketAddr;
use tonic::transport::{Server, ServerTlsConfig};

/// The services served on a node's sync port: client sync and cluster membership. They come up
/// before the replica so bootstrapping peers can describe this node.
pub(crate) struct ClientServices {
    logger: slog::Logger,
    membership: MembershipServer,
    sync: SyncServer,
}

impl ClientServices {
    pub(crate) fn new(logger: slog::Logger, membership: MembershipServer, sync: SyncServer) -> Self {
        ClientServices {
            logger,
            membership,
            sync,
        }
    }

    pub(crate) async fn run(
        self,
        socket_addr: SocketAddr,
        tls: ServerTlsConfig,
        shutdown_signal: RpcServerShutdownSignal,
    ) {
        let logger = self.logger;
        let mut builder = match Server::builder().tls_config(tls) {
            Ok(builder) => builder,
            Err(e) => {
                slog::error!(logger, "Sync server TLS setup failed: {:?}", e);
                return;
            }
        };
        slog::info!(logger, "Sync server listening on '{:?}' over TLS", socket_addr);

        let result = builder
            .add_service(GrpcMembershipServer::new(self.membership))
            .add_service(GrpcSyncServer::new(self.sync))
            .serve_with_shutdown(socket_addr, shutdown_signal)
            .await;

        slog::info!(logger, "Sync server run() has exited: {:?}", result);
    }
}
