//! Certificate authority for the daemon's mTLS API.
//!
//! The root is generated once and is long-lived; server and client leaves are
//! short-lived and reissuable without touching the root. Serial numbers are
//! fixed per artifact kind (root=1, server=2, clients=N from 3) so chains
//! built in one invocation never collide.

use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair,
    KeyUsagePurpose, SerialNumber, SigningKey,
};
use time::{Duration, OffsetDateTime};

/// Root validity: 10 years.
const ROOT_VALIDITY_DAYS: i64 = 3650;
/// Leaf validity: 1 year.
const LEAF_VALIDITY_DAYS: i64 = 365;

pub const ROOT_SERIAL: u64 = 1;
pub const SERVER_SERIAL: u64 = 2;
pub const FIRST_CLIENT_SERIAL: u64 = 3;

/// In-memory CA material, able to sign leaf certificates.
pub struct CaBundle {
    /// CA certificate parameters (needed for signing).
    pub params: CertificateParams,
    /// CA key pair.
    pub key_pair: KeyPair,
    /// PEM-encoded CA certificate.
    pub ca_cert_pem: String,
}

impl CaBundle {
    /// PEM-encoded CA private key.
    pub fn key_pem(&self) -> String {
        self.key_pair.serialize_pem()
    }
}

/// A leaf certificate and its private key, PEM-encoded.
pub struct LeafPair {
    pub cert_pem: String,
    pub key_pem: String,
}

/// Certificate generation errors.
#[derive(Debug, thiserror::Error)]
pub enum CertError {
    #[error("Certificate generation error: {0}")]
    Generation(String),

    #[error("Certificate parse error: {0}")]
    Parse(String),
}

fn validity(days: i64) -> (OffsetDateTime, OffsetDateTime) {
    let not_before = OffsetDateTime::now_utc();
    (not_before, not_before + Duration::days(days))
}

/// Generate a self-signed root CA for one daemon instance.
pub fn generate_root() -> Result<CaBundle, CertError> {
    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params
        .distinguished_name
        .push(DnType::CommonName, "tfarmd CA");
    params.key_usages.push(KeyUsagePurpose::KeyCertSign);
    params.key_usages.push(KeyUsagePurpose::CrlSign);
    params.serial_number = Some(SerialNumber::from(ROOT_SERIAL));
    (params.not_before, params.not_after) = validity(ROOT_VALIDITY_DAYS);

    let key_pair = KeyPair::generate().map_err(|e| CertError::Generation(e.to_string()))?;
    let ca_cert = params
        .self_signed(&key_pair)
        .map_err(|e| CertError::Generation(e.to_string()))?;

    Ok(CaBundle {
        ca_cert_pem: ca_cert.pem(),
        params,
        key_pair,
    })
}

/// Reconstruct a signing issuer from persisted root PEM material.
pub fn load_issuer(
    ca_cert_pem: &str,
    ca_key_pem: &str,
) -> Result<Issuer<'static, KeyPair>, CertError> {
    let key_pair = KeyPair::from_pem(ca_key_pem).map_err(|e| CertError::Parse(e.to_string()))?;
    Issuer::from_ca_cert_pem(ca_cert_pem, key_pair).map_err(|e| CertError::Parse(e.to_string()))
}

/// Issue the API server's leaf, bound to loopback names.
pub fn issue_server_cert(ca: &CaBundle, subject_names: &[&str]) -> Result<LeafPair, CertError> {
    let issuer = Issuer::from_params(&ca.params, &ca.key_pair);

    let mut params = CertificateParams::new(
        subject_names
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>(),
    )
    .map_err(|e| CertError::Generation(e.to_string()))?;
    params
        .distinguished_name
        .push(DnType::CommonName, "localhost");
    params.key_usages.push(KeyUsagePurpose::DigitalSignature);
    params.key_usages.push(KeyUsagePurpose::KeyEncipherment);
    params
        .extended_key_usages
        .push(ExtendedKeyUsagePurpose::ServerAuth);
    params.serial_number = Some(SerialNumber::from(SERVER_SERIAL));
    (params.not_before, params.not_after) = validity(LEAF_VALIDITY_DAYS);

    let server_key = KeyPair::generate().map_err(|e| CertError::Generation(e.to_string()))?;
    let server_cert = params
        .signed_by(&server_key, &issuer)
        .map_err(|e| CertError::Generation(e.to_string()))?;

    Ok(LeafPair {
        cert_pem: server_cert.pem(),
        key_pem: server_key.serialize_pem(),
    })
}

/// Issue a client leaf for a named caller.
///
/// The common name identifies the caller; the serial must be unique among the
/// leaves signed by this root.
pub fn issue_client_cert(
    issuer: &Issuer<'_, impl SigningKey>,
    common_name: &str,
    serial: u64,
) -> Result<LeafPair, CertError> {
    let mut params = CertificateParams::default();
    params
        .distinguished_name
        .push(DnType::CommonName, common_name);
    params.key_usages.push(KeyUsagePurpose::DigitalSignature);
    params.key_usages.push(KeyUsagePurpose::KeyEncipherment);
    params
        .extended_key_usages
        .push(ExtendedKeyUsagePurpose::ClientAuth);
    params.serial_number = Some(SerialNumber::from(serial));
    (params.not_before, params.not_after) = validity(LEAF_VALIDITY_DAYS);

    let client_key = KeyPair::generate().map_err(|e| CertError::Generation(e.to_string()))?;
    let client_cert = params
        .signed_by(&client_key, issuer)
        .map_err(|e| CertError::Generation(e.to_string()))?;

    Ok(LeafPair {
        cert_pem: client_cert.pem(),
        key_pem: client_key.serialize_pem(),
    })
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use x509_parser::pem::parse_x509_pem;

    fn subject_and_issuer(pem: &str) -> (String, String) {
        let (_, der) = parse_x509_pem(pem.as_bytes()).unwrap();
        let cert = der.parse_x509().unwrap();
        (cert.subject().to_string(), cert.issuer().to_string())
    }

    #[test]
    fn generate_root_produces_ca_pem() {
        let ca = generate_root().unwrap();
        assert!(ca.ca_cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(ca.key_pem().contains("BEGIN PRIVATE KEY"));

        let (subject, issuer) = subject_and_issuer(&ca.ca_cert_pem);
        assert_eq!(subject, issuer);
        assert!(subject.contains("tfarmd CA"));
    }

    #[test]
    fn server_cert_chains_to_root() {
        let ca = generate_root().unwrap();
        let leaf = issue_server_cert(&ca, &["localhost", "127.0.0.1"]).unwrap();

        let (root_subject, _) = subject_and_issuer(&ca.ca_cert_pem);
        let (_, leaf_issuer) = subject_and_issuer(&leaf.cert_pem);
        assert_eq!(leaf_issuer, root_subject);
    }

    #[test]
    fn client_cert_chains_and_verifies_against_root() {
        let ca = generate_root().unwrap();
        let issuer = Issuer::from_params(&ca.params, &ca.key_pair);
        let leaf = issue_client_cert(&issuer, "admin", FIRST_CLIENT_SERIAL).unwrap();

        let (_, root_pem) = parse_x509_pem(ca.ca_cert_pem.as_bytes()).unwrap();
        let root = root_pem.parse_x509().unwrap();
        let (_, leaf_pem) = parse_x509_pem(leaf.cert_pem.as_bytes()).unwrap();
        let client = leaf_pem.parse_x509().unwrap();

        assert_eq!(client.issuer(), root.subject());
        client
            .verify_signature(Some(root.public_key()))
            .expect("client leaf must chain-verify against the root");
    }

    #[test]
    fn serials_are_distinct_per_artifact() {
        let ca = generate_root().unwrap();
        let issuer = Issuer::from_params(&ca.params, &ca.key_pair);
        let server = issue_server_cert(&ca, &["localhost"]).unwrap();
        let client = issue_client_cert(&issuer, "admin", FIRST_CLIENT_SERIAL).unwrap();

        let serial = |pem: &str| {
            let (_, der) = parse_x509_pem(pem.as_bytes()).unwrap();
            der.parse_x509().unwrap().raw_serial().to_vec()
        };
        let serials = [
            serial(&ca.ca_cert_pem),
            serial(&server.cert_pem),
            serial(&client.cert_pem),
        ];
        assert_ne!(serials[0], serials[1]);
        assert_ne!(serials[1], serials[2]);
        assert_ne!(serials[0], serials[2]);
    }

    #[test]
    fn load_issuer_can_sign_after_reload() {
        let ca = generate_root().unwrap();
        let issuer = load_issuer(&ca.ca_cert_pem, &ca.key_pem()).unwrap();
        let leaf = issue_client_cert(&issuer, "reloaded", 7).unwrap();

        let (root_subject, _) = subject_and_issuer(&ca.ca_cert_pem);
        let (_, leaf_issuer) = subject_and_issuer(&leaf.cert_pem);
        assert_eq!(leaf_issuer, root_subject);
    }
}
