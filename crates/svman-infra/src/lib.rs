//! Transport trust and node channels for svman
//!
//! - [`pki`]: fleet CA and node certificate issuance
//! - [`mtls`]: TLS 1.3 mutual auth with an organizational-unit check
//! - [`auth`]: shared-secret second factor on every RPC
//! - [`transport`]: outbound channels with observable connectivity
//! - [`server`]: inbound handshakes feeding tonic servers

#![deny(missing_docs)]

pub mod auth;
pub mod mtls;
pub mod pki;
pub mod server;
pub mod transport;

pub use auth::{require_secret, AttachSecret, RequireSecret, SharedSecret};
pub use mtls::{MtlsConfig, MtlsError, OrgUnitVerifier, TrustConfig};
pub use pki::{CertificateAuthority, CertificateInfo, NodeCertificate, PkiError};
pub use server::{server_builder, tls_incoming, TlsIncoming};
pub use transport::{
    AuthenticatedChannel, ConnectivityState, Dialer, NodeChannel, TransportError,
};
