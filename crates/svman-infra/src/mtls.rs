//! mTLS trust for master and slave
//!
//! Both roles present a leaf signed by the fleet CA and verify the peer
//! against the same CA. Only TLS 1.3 is negotiated.
//!
//! Servers go one step past chain validation: the client leaf must carry the
//! configured organizational unit ([`OrgUnitVerifier`]). Clients pin the
//! server identity by using it as the TLS server name, independent of the
//! address they dial.
//!
//! Failing to load any of the material is fatal: callers build both configs
//! before binding a listener or dialing.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::client::danger::HandshakeSignatureValid;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::WebPkiClientVerifier;
use rustls::{
    CertificateError, ClientConfig, DigitallySignedStruct, DistinguishedName, RootCertStore,
    ServerConfig, SignatureScheme,
};
use thiserror::Error;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::auth::SharedSecret;
use crate::pki::CertificateInfo;

/// ALPN identifier for HTTP/2, required by gRPC
const ALPN_H2: &[u8] = b"h2";

/// mTLS configuration errors
#[derive(Debug, Error)]
pub enum MtlsError {
    /// Trust material could not be read from disk
    #[error("failed to read {path}: {source}")]
    Read {
        /// File that could not be read
        path: PathBuf,
        /// Underlying IO error
        source: std::io::Error,
    },

    /// Certificate parsing error
    #[error("certificate parsing error: {0}")]
    CertificateParseError(String),

    /// Key parsing error
    #[error("key parsing error: {0}")]
    KeyParseError(String),

    /// TLS configuration error
    #[error("TLS configuration error: {0}")]
    TlsConfigError(String),

    /// A PEM bundle held no certificate
    #[error("missing certificate: {0}")]
    MissingCertificate(String),
}

/// The crypto provider used for every TLS config built here
pub fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}

/// File locations and policy for a node's transport trust
#[derive(Clone, Debug)]
pub struct TrustConfig {
    /// PEM leaf certificate (may include intermediates)
    pub cert_path: PathBuf,
    /// PEM private key for the leaf
    pub key_path: PathBuf,
    /// PEM CA bundle that peers must chain to
    pub ca_path: PathBuf,
    /// Organizational unit a client leaf must carry
    pub required_org_unit: String,
    /// Identity (DNS SAN) expected on the server we dial
    pub peer_identity: String,
    /// Second-factor secret attached to every RPC
    pub shared_secret: SharedSecret,
}

impl TrustConfig {
    /// Read and parse every file, failing on the first problem
    pub fn load(&self) -> Result<MtlsConfig, MtlsError> {
        let cert_pem = read_file(&self.cert_path)?;
        let key_pem = Zeroizing::new(read_file(&self.key_path)?);
        let ca_pem = read_file(&self.ca_path)?;

        MtlsConfig::from_pem(
            &cert_pem,
            &key_pem,
            &ca_pem,
            &self.required_org_unit,
            &self.peer_identity,
        )
    }
}

fn read_file(path: &Path) -> Result<String, MtlsError> {
    std::fs::read_to_string(path).map_err(|source| MtlsError::Read {
        path: path.to_path_buf(),
        source,
    })
}

/// Parsed trust material, ready to build rustls configs for either role
pub struct MtlsConfig {
    cert_chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    roots: Arc<RootCertStore>,
    required_org_unit: String,
    peer_identity: String,
}

impl std::fmt::Debug for MtlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MtlsConfig")
            .field("cert_chain_len", &self.cert_chain.len())
            .field("roots", &self.roots.len())
            .field("required_org_unit", &self.required_org_unit)
            .field("peer_identity", &self.peer_identity)
            .finish_non_exhaustive()
    }
}

impl MtlsConfig {
    /// Parse PEM material
    pub fn from_pem(
        cert_pem: &str,
        key_pem: &str,
        ca_pem: &str,
        required_org_unit: &str,
        peer_identity: &str,
    ) -> Result<Self, MtlsError> {
        if required_org_unit.trim().is_empty() {
            return Err(MtlsError::TlsConfigError(
                "required organizational unit must not be empty".to_string(),
            ));
        }

        let cert_chain = parse_certs(cert_pem, "node certificate")?;
        let key = rustls_pemfile::private_key(&mut key_pem.as_bytes())
            .map_err(|e| MtlsError::KeyParseError(e.to_string()))?
            .ok_or_else(|| MtlsError::KeyParseError("no private key found".to_string()))?;

        let mut roots = RootCertStore::empty();
        for ca in parse_certs(ca_pem, "CA bundle")? {
            roots
                .add(ca)
                .map_err(|e| MtlsError::CertificateParseError(format!("CA bundle: {}", e)))?;
        }

        Ok(Self {
            cert_chain,
            key,
            roots: Arc::new(roots),
            required_org_unit: required_org_unit.to_string(),
            peer_identity: peer_identity.to_string(),
        })
    }

    /// Organizational unit required of client leaves
    pub fn required_org_unit(&self) -> &str {
        &self.required_org_unit
    }

    /// Server name pinned when dialing
    pub fn server_name(&self) -> Result<ServerName<'static>, MtlsError> {
        ServerName::try_from(self.peer_identity.clone()).map_err(|e| {
            MtlsError::TlsConfigError(format!(
                "invalid peer identity '{}': {}",
                self.peer_identity, e
            ))
        })
    }

    /// Build the server-side config: TLS 1.3, mandatory client certs, OU check
    pub fn server_config(&self) -> Result<Arc<ServerConfig>, MtlsError> {
        let provider = crypto_provider();

        let inner = WebPkiClientVerifier::builder_with_provider(self.roots.clone(), provider.clone())
            .build()
            .map_err(|e| MtlsError::TlsConfigError(e.to_string()))?;
        let verifier = Arc::new(OrgUnitVerifier::new(inner, &self.required_org_unit));

        let mut config = ServerConfig::builder_with_provider(provider)
            .with_protocol_versions(&[&rustls::version::TLS13])
            .map_err(|e| MtlsError::TlsConfigError(e.to_string()))?
            .with_client_cert_verifier(verifier)
            .with_single_cert(self.cert_chain.clone(), self.key.clone_key())
            .map_err(|e| MtlsError::TlsConfigError(e.to_string()))?;
        config.alpn_protocols = vec![ALPN_H2.to_vec()];

        Ok(Arc::new(config))
    }

    /// Build the client-side config: TLS 1.3, our leaf as client identity
    pub fn client_config(&self) -> Result<Arc<ClientConfig>, MtlsError> {
        let mut config = ClientConfig::builder_with_provider(crypto_provider())
            .with_protocol_versions(&[&rustls::version::TLS13])
            .map_err(|e| MtlsError::TlsConfigError(e.to_string()))?
            .with_root_certificates(self.roots.clone())
            .with_client_auth_cert(self.cert_chain.clone(), self.key.clone_key())
            .map_err(|e| MtlsError::TlsConfigError(e.to_string()))?;
        config.alpn_protocols = vec![ALPN_H2.to_vec()];

        Ok(Arc::new(config))
    }
}

fn parse_certs(pem: &str, what: &str) -> Result<Vec<CertificateDer<'static>>, MtlsError> {
    let certs = rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| MtlsError::CertificateParseError(format!("{}: {}", what, e)))?;
    if certs.is_empty() {
        return Err(MtlsError::MissingCertificate(what.to_string()));
    }
    Ok(certs)
}

/// Client certificate verifier that requires an organizational unit
///
/// Delegates chain validation to webpki, then rejects the handshake unless
/// the leaf subject holds `required_org_unit`.
#[derive(Debug)]
pub struct OrgUnitVerifier {
    inner: Arc<dyn ClientCertVerifier>,
    required_org_unit: String,
}

impl OrgUnitVerifier {
    /// Wrap a chain-validating verifier
    pub fn new(inner: Arc<dyn ClientCertVerifier>, required_org_unit: &str) -> Self {
        Self {
            inner,
            required_org_unit: required_org_unit.to_string(),
        }
    }
}

impl ClientCertVerifier for OrgUnitVerifier {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        self.inner.root_hint_subjects()
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        let verified = self
            .inner
            .verify_client_cert(end_entity, intermediates, now)?;

        let info = CertificateInfo::from_der(end_entity.as_ref()).map_err(|e| {
            warn!(error = %e, "client certificate could not be parsed");
            rustls::Error::InvalidCertificate(CertificateError::BadEncoding)
        })?;

        if info.org_units.iter().any(|ou| *ou == self.required_org_unit) {
            debug!(peer = %info.common_name, "client certificate accepted");
            Ok(verified)
        } else {
            warn!(
                peer = %info.common_name,
                org_units = ?info.org_units,
                required = %self.required_org_unit,
                "client certificate rejected: organizational unit mismatch"
            );
            Err(rustls::Error::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure,
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pki::{CertificateAuthority, NodeCertificate};
    use tokio_rustls::{TlsAcceptor, TlsConnector};

    const OU: &str = "hypervisors";
    const IDENTITY: &str = "svman-node";

    fn issue(ca: &CertificateAuthority, ou: &str) -> NodeCertificate {
        ca.issue_node_cert("worker-1", ou, &[IDENTITY])
            .expect("issuing should succeed")
    }

    fn config_for(ca: &CertificateAuthority, node: &NodeCertificate) -> MtlsConfig {
        MtlsConfig::from_pem(&node.cert_pem, &node.key_pem, ca.ca_cert_pem(), OU, IDENTITY)
            .expect("material should parse")
    }

    /// Run a handshake over an in-memory pipe; returns whether the server accepted
    async fn handshake(server: &MtlsConfig, client: &MtlsConfig) -> bool {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let acceptor = TlsAcceptor::from(server.server_config().expect("server config"));
        let connector = TlsConnector::from(client.client_config().expect("client config"));
        let name = client.server_name().expect("server name");

        let (server_result, _client_result) = tokio::join!(
            acceptor.accept(server_io),
            connector.connect(name, client_io)
        );
        server_result.is_ok()
    }

    #[tokio::test]
    async fn matching_org_unit_is_accepted() {
        let ca = CertificateAuthority::new("Test CA").expect("CA creation should succeed");
        let server = config_for(&ca, &issue(&ca, OU));
        let client = config_for(&ca, &issue(&ca, OU));

        assert!(handshake(&server, &client).await);
    }

    #[tokio::test]
    async fn missing_org_unit_is_rejected() {
        let ca = CertificateAuthority::new("Test CA").expect("CA creation should succeed");
        let server = config_for(&ca, &issue(&ca, OU));
        let client = config_for(&ca, &issue(&ca, ""));

        assert!(!handshake(&server, &client).await);
    }

    #[tokio::test]
    async fn wrong_org_unit_is_rejected() {
        let ca = CertificateAuthority::new("Test CA").expect("CA creation should succeed");
        let server = config_for(&ca, &issue(&ca, OU));
        let client = config_for(&ca, &issue(&ca, "workstations"));

        assert!(!handshake(&server, &client).await);
    }

    #[tokio::test]
    async fn foreign_ca_is_rejected() {
        let ca = CertificateAuthority::new("Test CA").expect("CA creation should succeed");
        let rogue_ca = CertificateAuthority::new("Rogue CA").expect("CA creation should succeed");
        let server = config_for(&ca, &issue(&ca, OU));
        // Rogue leaf that trusts the real CA so the client side completes
        let rogue_leaf = issue(&rogue_ca, OU);
        let client = MtlsConfig::from_pem(
            &rogue_leaf.cert_pem,
            &rogue_leaf.key_pem,
            ca.ca_cert_pem(),
            OU,
            IDENTITY,
        )
        .expect("material should parse");

        assert!(!handshake(&server, &client).await);
    }

    #[test]
    fn empty_required_org_unit_rejected() {
        let ca = CertificateAuthority::new("Test CA").expect("CA creation should succeed");
        let node = issue(&ca, OU);
        let result = MtlsConfig::from_pem(&node.cert_pem, &node.key_pem, ca.ca_cert_pem(), "", IDENTITY);
        assert!(matches!(result, Err(MtlsError::TlsConfigError(_))));
    }

    #[test]
    fn garbage_key_rejected() {
        let ca = CertificateAuthority::new("Test CA").expect("CA creation should succeed");
        let node = issue(&ca, OU);
        let result = MtlsConfig::from_pem(&node.cert_pem, "garbage", ca.ca_cert_pem(), OU, IDENTITY);
        assert!(matches!(result, Err(MtlsError::KeyParseError(_))));
    }

    #[test]
    fn empty_ca_bundle_rejected() {
        let ca = CertificateAuthority::new("Test CA").expect("CA creation should succeed");
        let node = issue(&ca, OU);
        let result = MtlsConfig::from_pem(&node.cert_pem, &node.key_pem, "", OU, IDENTITY);
        assert!(matches!(result, Err(MtlsError::MissingCertificate(_))));
    }

    #[test]
    fn invalid_peer_identity_rejected() {
        let ca = CertificateAuthority::new("Test CA").expect("CA creation should succeed");
        let node = issue(&ca, OU);
        let config = MtlsConfig::from_pem(&node.cert_pem, &node.key_pem, ca.ca_cert_pem(), OU, "")
            .expect("material should parse");
        assert!(config.server_name().is_err());
    }

    #[test]
    fn trust_config_loads_from_disk() {
        let ca = CertificateAuthority::new("Test CA").expect("CA creation should succeed");
        let node = issue(&ca, OU);
        let dir = tempfile::tempdir().expect("tempdir");
        let write = |name: &str, contents: &str| {
            let path = dir.path().join(name);
            std::fs::write(&path, contents).expect("write should succeed");
            path
        };

        let trust = TrustConfig {
            cert_path: write("node.crt", &node.cert_pem),
            key_path: write("node.key", node.key_pem.as_str()),
            ca_path: write("ca.crt", ca.ca_cert_pem()),
            required_org_unit: OU.to_string(),
            peer_identity: IDENTITY.to_string(),
            shared_secret: SharedSecret::new("s3cret"),
        };

        let config = trust.load().expect("trust should load");
        assert_eq!(config.required_org_unit(), OU);
        assert!(config.server_config().is_ok());
        assert!(config.client_config().is_ok());
    }

    #[test]
    fn trust_config_reports_missing_file() {
        let trust = TrustConfig {
            cert_path: PathBuf::from("/nonexistent/node.crt"),
            key_path: PathBuf::from("/nonexistent/node.key"),
            ca_path: PathBuf::from("/nonexistent/ca.crt"),
            required_org_unit: OU.to_string(),
            peer_identity: IDENTITY.to_string(),
            shared_secret: SharedSecret::new("s3cret"),
        };

        match trust.load() {
            Err(MtlsError::Read { path, .. }) => {
                assert_eq!(path, PathBuf::from("/nonexistent/node.crt"))
            }
            other => panic!("expected read error, got {:?}", other),
        }
    }
}
