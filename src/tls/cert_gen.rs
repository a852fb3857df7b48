//! Leaf certificate issuance for intercepted hostnames.

use crate::tls::ca::{random_serial, CertificateAuthority};
use anyhow::{anyhow, Result};
use rcgen::{
    Certificate, CertificateParams, DistinguishedName, IsCa, KeyPair, PKCS_ECDSA_P256_SHA256,
};
use std::net::IpAddr;
use std::time::{Duration, SystemTime};
use tracing::debug;

/// Key and certificate material for one hostname, in both PEM and DER form.
#[derive(Debug, Clone)]
pub struct CertificateData {
    pub cert_pem: String,
    pub key_pem: String,
    pub cert_der: Vec<u8>,
    pub key_der: Vec<u8>,
}

/// Issue a leaf certificate for `hostname`, signed by the CA.
///
/// The SAN always carries the DNS name; literal IP hostnames additionally
/// get an IP entry so clients validating either form succeed.
pub fn issue_leaf(ca: &CertificateAuthority, hostname: &str, validity_days: u32) -> Result<CertificateData> {
    debug!("Issuing leaf certificate for {}", hostname);

    let key_pair = KeyPair::generate(&PKCS_ECDSA_P256_SHA256)
        .map_err(|e| anyhow!("Failed to generate leaf key pair: {}", e))?;

    let mut params = CertificateParams::default();
    params.alg = &PKCS_ECDSA_P256_SHA256;

    let mut distinguished_name = DistinguishedName::new();
    distinguished_name.push(rcgen::DnType::CommonName, hostname);
    params.distinguished_name = distinguished_name;

    let now = SystemTime::now();
    params.not_before = now.into();
    params.not_after = (now + Duration::from_secs(validity_days as u64 * 24 * 60 * 60)).into();

    params.subject_alt_names = vec![rcgen::SanType::DnsName(hostname.to_string())];
    if let Ok(addr) = hostname.parse::<IpAddr>() {
        params.subject_alt_names.push(rcgen::SanType::IpAddress(addr));
    }

    params.is_ca = IsCa::ExplicitNoCa;
    params.key_usages = vec![
        rcgen::KeyUsagePurpose::DigitalSignature,
        rcgen::KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ServerAuth];

    params.serial_number = Some(rcgen::SerialNumber::from(random_serial().to_vec()));
    params.key_pair = Some(key_pair);

    let cert = Certificate::from_params(params)
        .map_err(|e| anyhow!("Failed to build leaf certificate: {}", e))?;

    let cert_pem = cert
        .serialize_pem_with_signer(ca.signer())
        .map_err(|e| anyhow!("Failed to sign leaf certificate: {}", e))?;
    let cert_der = cert
        .serialize_der_with_signer(ca.signer())
        .map_err(|e| anyhow!("Failed to sign leaf certificate: {}", e))?;
    let key_pem = cert.serialize_private_key_pem();
    let key_der = cert.serialize_private_key_der();

    Ok(CertificateData {
        cert_pem,
        key_pem,
        cert_der,
        key_der,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use x509_parser::extensions::{GeneralName, ParsedExtension};

    fn test_ca() -> (tempfile::TempDir, CertificateAuthority) {
        let dir = tempfile::tempdir().unwrap();
        let ca =
            CertificateAuthority::load_or_generate(dir.path(), "cmux", "cmux Test CA", 3650)
                .unwrap();
        (dir, ca)
    }

    #[test]
    fn leaf_is_signed_by_ca_and_not_a_ca() {
        let (_dir, ca) = test_ca();
        let leaf = issue_leaf(&ca, "cmux-abc-base-3000.cmux.app", 365).unwrap();

        let (_, ca_pem) = x509_parser::pem::parse_x509_pem(ca.certificate_pem().as_bytes()).unwrap();
        let (_, ca_cert) = x509_parser::parse_x509_certificate(&ca_pem.contents).unwrap();
        let (_, leaf_cert) = x509_parser::parse_x509_certificate(&leaf.cert_der).unwrap();

        assert_eq!(
            leaf_cert.issuer().to_string(),
            ca_cert.subject().to_string()
        );

        for ext in leaf_cert.extensions() {
            if let ParsedExtension::BasicConstraints(bc) = ext.parsed_extension() {
                assert!(!bc.ca);
            }
        }
    }

    #[test]
    fn ip_hostname_gets_ip_san() {
        let (_dir, ca) = test_ca();
        let leaf = issue_leaf(&ca, "192.168.1.5", 365).unwrap();

        let (_, cert) = x509_parser::parse_x509_certificate(&leaf.cert_der).unwrap();
        let mut saw_ip = false;
        for ext in cert.extensions() {
            if let ParsedExtension::SubjectAlternativeName(san) = ext.parsed_extension() {
                for name in &san.general_names {
                    if let GeneralName::IPAddress(bytes) = name {
                        assert_eq!(*bytes, &[192, 168, 1, 5][..]);
                        saw_ip = true;
                    }
                }
            }
        }
        assert!(saw_ip);
    }

    #[test]
    fn dns_hostname_gets_dns_san_only() {
        let (_dir, ca) = test_ca();
        let leaf = issue_leaf(&ca, "example.cmux.app", 365).unwrap();

        let (_, cert) = x509_parser::parse_x509_certificate(&leaf.cert_der).unwrap();
        for ext in cert.extensions() {
            if let ParsedExtension::SubjectAlternativeName(san) = ext.parsed_extension() {
                for name in &san.general_names {
                    match name {
                        GeneralName::DNSName(dns) => assert_eq!(*dns, "example.cmux.app"),
                        GeneralName::IPAddress(_) => panic!("unexpected IP SAN"),
                        _ => {}
                    }
                }
            }
        }
    }
}
