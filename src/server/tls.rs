use std::fs;
use std::io;
use std::path::Path;
use tonic::transport::{Certificate, ClientTlsConfig, Identity, ServerTlsConfig};

/// DNS name every node certificate carries, so clients that only know an address can verify the
/// sync port.
pub const CLUSTER_SERVER_NAME: &str = "scorebook";

/// Name a peer's certificate must carry for its Raft port to be trusted as `node_id`. Node ids
/// are derived from the Ed25519 identity key, so the CA binds the certificate to that key.
pub fn peer_server_name(node_id: &str) -> String {
    format!("{}.{}", node_id, CLUSTER_SERVER_NAME)
}

/// DNS subject alternative names the cluster CA must put in `node_id`'s certificate.
pub fn node_certificate_names(node_id: &str) -> Vec<String> {
    vec![peer_server_name(node_id), CLUSTER_SERVER_NAME.to_string()]
}

/// The cluster CA. Enough for a client to reach any node's sync port over TLS.
#[derive(Clone, Debug)]
pub struct ClusterTls {
    ca: Certificate,
}

impl ClusterTls {
    pub fn from_pem(ca: impl AsRef<[u8]>) -> Self {
        ClusterTls {
            ca: Certificate::from_pem(ca),
        }
    }

    pub fn load(ca_path: &Path) -> Result<Self, io::Error> {
        Ok(Self::from_pem(read_pem(ca_path)?))
    }

    pub(crate) fn sync_client(&self) -> ClientTlsConfig {
        ClientTlsConfig::new()
            .ca_certificate(self.ca.clone())
            .domain_name(CLUSTER_SERVER_NAME)
    }
}

/// A node's own certificate and key, plus the CA that signed every member's certificate.
///
/// The Raft port is mutually authenticated: peers must present a certificate from the cluster CA,
/// and each side checks the other's against the node id it expects. The sync port only
/// authenticates the server, since end-user clients carry no certificate.
#[derive(Clone, Debug)]
pub struct NodeTls {
    identity: Identity,
    cluster: ClusterTls,
}

impl NodeTls {
    pub fn from_pem(cert: impl AsRef<[u8]>, key: impl AsRef<[u8]>, ca: impl AsRef<[u8]>) -> Self {
        NodeTls {
            identity: Identity::from_pem(cert, key),
            cluster: ClusterTls::from_pem(ca),
        }
    }

    pub fn load(cert_path: &Path, key_path: &Path, ca_path: &Path) -> Result<Self, io::Error> {
        Ok(Self::from_pem(
            read_pem(cert_path)?,
            read_pem(key_path)?,
            read_pem(ca_path)?,
        ))
    }

    pub fn cluster(&self) -> &ClusterTls {
        &self.cluster
    }

    pub(crate) fn raft_server(&self) -> ServerTlsConfig {
        ServerTlsConfig::new()
            .identity(self.identity.clone())
            .client_ca_root(self.cluster.ca.clone())
    }

    pub(crate) fn sync_server(&self) -> ServerTlsConfig {
        ServerTlsConfig::new().identity(self.identity.clone())
    }

    pub(crate) fn peer_client(&self, peer_node_id: &str) -> ClientTlsConfig {
        ClientTlsConfig::new()
            .ca_certificate(self.cluster.ca.clone())
            .identity(self.identity.clone())
            .domain_name(peer_server_name(peer_node_id))
    }

    /// For forwarding client writes to the leader's sync port.
    pub(crate) fn sync_client(&self) -> ClientTlsConfig {
        self.cluster.sync_client().identity(self.identity.clone())
    }
}

fn read_pem(path: &Path) -> Result<Vec<u8>, io::Error> {
    fs::read(path).map_err(|e| io::Error::new(e.kind(), format!("Failed to read {:?}: {}", path, e)))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use rcgen::{BasicConstraints, CertificateParams, IsCa, KeyPair};

    /// A throwaway CA that issues node certificates the way an operator would.
    pub(crate) struct TestCa {
        cert: rcgen::Certificate,
        key: KeyPair,
    }

    impl TestCa {
        pub(crate) fn new() -> Self {
            let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
            params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
            let key = KeyPair::generate().unwrap();
            let cert = params.self_signed(&key).unwrap();
            TestCa { cert, key }
        }

        pub(crate) fn cluster(&self) -> ClusterTls {
            ClusterTls::from_pem(self.cert.pem())
        }

        pub(crate) fn issue(&self, node_id: &str) -> NodeTls {
            let params = CertificateParams::new(node_certificate_names(node_id)).unwrap();
            let key = KeyPair::generate().unwrap();
            let cert = params.signed_by(&key, &self.cert, &self.key).unwrap();
            NodeTls::from_pem(cert.pem(), key.serialize_pem(), self.cert.pem())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn certificate_names_bind_the_node_id() {
        assert_eq!(
            node_certificate_names("3fa2c1"),
            vec!["3fa2c1.scorebook".to_string(), "scorebook".to_string()]
        );
    }

    #[test]
    fn load_reports_the_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("node.pem");
        let err = NodeTls::load(&missing, &missing, &missing).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        assert!(err.to_string().contains("node.pem"));
    }
}
