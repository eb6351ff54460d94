//! Certificate authority and node certificate issuance
//!
//! Every node in a fleet, master and slaves alike, presents a leaf issued by
//! one shared CA. The leaf carries:
//!
//! - the fleet's organizational unit, checked by every server after chain
//!   validation
//! - both `clientAuth` and `serverAuth` EKUs, because slaves dial the master
//!   and the master dials back to slaves
//! - the node identity as a DNS SAN, which peers pin as the TLS server name

use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use thiserror::Error;
use x509_parser::prelude::*;

/// Lifetime of a fleet CA
pub const CA_LIFETIME_DAYS: i64 = 3650;

/// Lifetime of a node certificate
pub const NODE_LIFETIME_DAYS: i64 = 365;

/// Organization name stamped on generated certificates
const ORGANIZATION: &str = "svman";

fn stamp_validity(params: &mut CertificateParams, days: i64) {
    let now = ::time::OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + ::time::Duration::days(days);
}

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    /// Building or signing a certificate failed
    #[error("cannot issue certificate: {0}")]
    CertificateGenerationFailed(String),

    /// A key pair could not be generated
    #[error("cannot generate key: {0}")]
    KeyGenerationFailed(String),

    /// PEM, DER or key material was malformed
    #[error("malformed certificate material: {0}")]
    ParseError(String),
}

/// PKI result
pub type Result<T> = std::result::Result<T, PkiError>;

/// DER bytes of the first PEM block in `pem_data`
pub fn parse_pem(pem_data: &str) -> Result<Vec<u8>> {
    ::pem::parse(pem_data.as_bytes())
        .map(|block| block.into_contents())
        .map_err(|e| PkiError::ParseError(format!("PEM: {}", e)))
}

/// Subject details of a certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateInfo {
    /// Subject common name (empty when absent)
    pub common_name: String,
    /// Every organizational unit in the subject
    pub org_units: Vec<String>,
    /// Expiry as a Unix timestamp
    pub not_after: i64,
}

impl CertificateInfo {
    /// Read subject details from a PEM certificate
    pub fn from_pem(pem_data: &str) -> Result<Self> {
        Self::from_der(&parse_pem(pem_data)?)
    }

    /// Read subject details from a DER certificate, e.g. a TLS peer's leaf
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| PkiError::ParseError(format!("X.509: {}", e)))?;

        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap_or("")
            .to_string();

        let org_units = cert
            .subject()
            .iter_organizational_unit()
            .filter_map(|ou| ou.as_str().ok())
            .map(str::to_string)
            .collect();

        Ok(Self {
            common_name,
            org_units,
            not_after: cert.validity().not_after.timestamp(),
        })
    }
}

/// A node certificate and its private key, both PEM-encoded
#[derive(Clone)]
pub struct NodeCertificate {
    /// Leaf certificate
    pub cert_pem: String,
    /// Private key for the leaf
    pub key_pem: zeroize::Zeroizing<String>,
}

impl std::fmt::Debug for NodeCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeCertificate")
            .field("cert_pem", &self.cert_pem)
            .field("key_pem", &"[redacted]")
            .finish()
    }
}

/// Fleet CA
#[derive(Clone)]
pub struct CertificateAuthority {
    /// CA key pair serialized as PEM (KeyPair isn't Clone)
    ca_key_pem: zeroize::Zeroizing<String>,
    /// Trust bundle handed to every node
    ca_cert_pem: String,
}

impl CertificateAuthority {
    /// Generate a fresh self-signed fleet CA
    pub fn new(common_name: &str) -> Result<Self> {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(common_name.to_string()),
        );
        dn.push(
            DnType::OrganizationName,
            DnValue::Utf8String(ORGANIZATION.to_string()),
        );
        params.distinguished_name = dn;

        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        stamp_validity(&mut params, CA_LIFETIME_DAYS);

        let key_pair = KeyPair::generate().map_err(|e| {
            PkiError::KeyGenerationFailed(format!("CA key: {}", e))
        })?;

        let ca_key_pem = zeroize::Zeroizing::new(key_pair.serialize_pem());

        let cert = params.self_signed(&key_pair).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("self-signing CA: {}", e))
        })?;

        Ok(Self {
            ca_key_pem,
            ca_cert_pem: cert.pem(),
        })
    }

    /// Load a CA from PEM strings
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        KeyPair::from_pem(key_pem)
            .map_err(|e| PkiError::ParseError(format!("CA key: {}", e)))?;
        parse_pem(cert_pem)?;

        Ok(Self {
            ca_key_pem: zeroize::Zeroizing::new(key_pem.to_string()),
            ca_cert_pem: cert_pem.to_string(),
        })
    }

    /// The CA certificate in PEM format (the trust bundle for every node)
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// The CA private key in PEM format
    pub fn ca_key_pem(&self) -> &str {
        &self.ca_key_pem
    }

    fn load_key_pair(&self) -> Result<KeyPair> {
        KeyPair::from_pem(&self.ca_key_pem)
            .map_err(|e| PkiError::ParseError(format!("stored CA key: {}", e)))
    }

    /// Issue a node certificate
    ///
    /// `org_unit` may be empty to produce a leaf without any OU, which
    /// servers will refuse.
    pub fn issue_node_cert(
        &self,
        common_name: &str,
        org_unit: &str,
        sans: &[&str],
    ) -> Result<NodeCertificate> {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(common_name.to_string()),
        );
        dn.push(
            DnType::OrganizationName,
            DnValue::Utf8String(ORGANIZATION.to_string()),
        );
        if !org_unit.is_empty() {
            dn.push(
                DnType::OrganizationalUnitName,
                DnValue::Utf8String(org_unit.to_string()),
            );
        }
        params.distinguished_name = dn;

        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ClientAuth,
            ExtendedKeyUsagePurpose::ServerAuth,
        ];

        stamp_validity(&mut params, NODE_LIFETIME_DAYS);

        params.subject_alt_names = sans
            .iter()
            .map(|san| san_entry(san))
            .collect::<Result<Vec<_>>>()?;

        let node_key = KeyPair::generate()
            .map_err(|e| PkiError::KeyGenerationFailed(format!("node key: {}", e)))?;

        let ca_key = self.load_key_pair()?;
        let issuer = Issuer::from_ca_cert_pem(&self.ca_cert_pem, &ca_key)
            .map_err(|e| PkiError::ParseError(format!("CA certificate: {}", e)))?;

        let cert = params.signed_by(&node_key, &issuer).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("signing {}: {}", common_name, e))
        })?;

        Ok(NodeCertificate {
            cert_pem: cert.pem(),
            key_pem: zeroize::Zeroizing::new(node_key.serialize_pem()),
        })
    }
}

/// IP literals become IP SANs, everything else a DNS SAN
fn san_entry(san: &str) -> Result<SanType> {
    if let Ok(ip) = san.parse::<std::net::IpAddr>() {
        return Ok(SanType::IpAddress(ip));
    }
    Ia5String::try_from(san.to_string())
        .map(SanType::DnsName)
        .map_err(|e| PkiError::CertificateGenerationFailed(format!("SAN '{}': {}", san, e)))
}
