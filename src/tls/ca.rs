//! Persistent certificate authority for preview-host interception.

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose, Engine as _};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, IsCa, KeyPair,
    PKCS_ECDSA_P256_SHA256,
};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info};

const CA_CERT_FILE: &str = "ca-cert.pem";
const CA_KEY_FILE: &str = "ca-key.pem";

/// A loaded or freshly generated signing CA.
///
/// Holds the rcgen signer used for leaf issuance plus the PEM text handed
/// out to operators for trust-store installation.
pub struct CertificateAuthority {
    signer: Certificate,
    cert_pem: String,
    spki_fingerprint: String,
}

impl CertificateAuthority {
    /// Load the CA from `dir`, generating and persisting a new one when the
    /// files are absent. Any filesystem or parse error is fatal; there is no
    /// plaintext fallback.
    pub fn load_or_generate(dir: &Path, organization: &str, common_name: &str, validity_days: u32) -> Result<Self> {
        let cert_path = dir.join(CA_CERT_FILE);
        let key_path = dir.join(CA_KEY_FILE);

        if cert_path.exists() && key_path.exists() {
            debug!("Loading existing CA from {}", dir.display());
            return Self::load(&cert_path, &key_path);
        }

        info!("📜 Generating new preview proxy CA in {}", dir.display());
        let ca = Self::generate(organization, common_name, validity_days)?;
        ca.persist(dir, &cert_path, &key_path)?;
        info!("✅ CA generated and persisted");
        Ok(ca)
    }

    fn load(cert_path: &Path, key_path: &Path) -> Result<Self> {
        let cert_pem = fs::read_to_string(cert_path)
            .with_context(|| format!("Failed to read CA certificate: {}", cert_path.display()))?;
        let key_pem = fs::read_to_string(key_path)
            .with_context(|| format!("Failed to read CA private key: {}", key_path.display()))?;

        let key_pair = KeyPair::from_pem(&key_pem)
            .map_err(|e| anyhow!("Failed to parse CA private key: {}", e))?;
        let params = CertificateParams::from_ca_cert_pem(&cert_pem, key_pair)
            .map_err(|e| anyhow!("Failed to parse CA certificate: {}", e))?;
        let signer = Certificate::from_params(params)
            .map_err(|e| anyhow!("Failed to reconstruct CA signer: {}", e))?;

        let spki_fingerprint = spki_fingerprint_from_pem(&cert_pem)?;

        Ok(Self {
            signer,
            cert_pem,
            spki_fingerprint,
        })
    }

    fn generate(organization: &str, common_name: &str, validity_days: u32) -> Result<Self> {
        let key_pair = KeyPair::generate(&PKCS_ECDSA_P256_SHA256)
            .map_err(|e| anyhow!("Failed to generate CA key pair: {}", e))?;

        let mut params = CertificateParams::default();
        params.alg = &PKCS_ECDSA_P256_SHA256;

        let mut distinguished_name = DistinguishedName::new();
        distinguished_name.push(rcgen::DnType::OrganizationName, organization);
        distinguished_name.push(rcgen::DnType::CommonName, common_name);
        params.distinguished_name = distinguished_name;

        let now = SystemTime::now();
        params.not_before = now.into();
        params.not_after =
            (now + Duration::from_secs(validity_days as u64 * 24 * 60 * 60)).into();

        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            rcgen::KeyUsagePurpose::KeyCertSign,
            rcgen::KeyUsagePurpose::DigitalSignature,
            rcgen::KeyUsagePurpose::ContentCommitment,
            rcgen::KeyUsagePurpose::KeyEncipherment,
            rcgen::KeyUsagePurpose::DataEncipherment,
        ];

        params.serial_number = Some(rcgen::SerialNumber::from(random_serial().to_vec()));
        params.key_pair = Some(key_pair);

        let signer = Certificate::from_params(params)
            .map_err(|e| anyhow!("Failed to generate CA certificate: {}", e))?;
        let cert_pem = signer
            .serialize_pem()
            .map_err(|e| anyhow!("Failed to serialize CA certificate: {}", e))?;
        let spki_fingerprint = spki_fingerprint_from_pem(&cert_pem)?;

        Ok(Self {
            signer,
            cert_pem,
            spki_fingerprint,
        })
    }

    fn persist(&self, dir: &Path, cert_path: &PathBuf, key_path: &PathBuf) -> Result<()> {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create CA directory: {}", dir.display()))?;

        fs::write(cert_path, &self.cert_pem)
            .with_context(|| format!("Failed to write CA certificate: {}", cert_path.display()))?;

        let key_pem = self.signer.serialize_private_key_pem();
        fs::write(key_path, key_pem)
            .with_context(|| format!("Failed to write CA private key: {}", key_path.display()))?;

        // The key file must never be group/world readable.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(key_path, fs::Permissions::from_mode(0o600)).with_context(
                || format!("Failed to restrict CA key permissions: {}", key_path.display()),
            )?;
        }

        Ok(())
    }

    /// rcgen signer for leaf issuance.
    pub fn signer(&self) -> &Certificate {
        &self.signer
    }

    /// PEM text of the CA certificate, for trust-store installation.
    pub fn certificate_pem(&self) -> &str {
        &self.cert_pem
    }

    /// Base64 SHA-256 digest of the CA's SubjectPublicKeyInfo.
    pub fn spki_fingerprint(&self) -> &str {
        &self.spki_fingerprint
    }
}

/// 16 random bytes, high bit cleared so the serial stays positive.
pub fn random_serial() -> [u8; 16] {
    use rand::RngCore;
    let mut serial = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut serial);
    serial[0] &= 0x7f;
    serial
}

fn spki_fingerprint_from_pem(cert_pem: &str) -> Result<String> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(cert_pem.as_bytes())
        .map_err(|e| anyhow!("Failed to parse CA PEM: {}", e))?;
    let (_, cert) = x509_parser::parse_x509_certificate(&pem.contents)
        .map_err(|e| anyhow!("Failed to parse CA certificate DER: {}", e))?;
    let digest = Sha256::digest(cert.public_key().raw);
    Ok(general_purpose::STANDARD.encode(digest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use x509_parser::extensions::ParsedExtension;

    #[test]
    fn generates_and_reloads_ca() {
        let dir = tempfile::tempdir().unwrap();
        let ca = CertificateAuthority::load_or_generate(dir.path(), "cmux", "cmux Test CA", 3650)
            .unwrap();
        let pem = ca.certificate_pem().to_string();
        let fingerprint = ca.spki_fingerprint().to_string();

        // Second load picks up the persisted files instead of regenerating.
        let reloaded =
            CertificateAuthority::load_or_generate(dir.path(), "cmux", "cmux Test CA", 3650)
                .unwrap();
        assert_eq!(reloaded.certificate_pem(), pem);
        assert_eq!(reloaded.spki_fingerprint(), fingerprint);
    }

    #[test]
    fn ca_certificate_is_a_ca() {
        let dir = tempfile::tempdir().unwrap();
        let ca = CertificateAuthority::load_or_generate(dir.path(), "cmux", "cmux Test CA", 3650)
            .unwrap();

        let (_, pem) = x509_parser::pem::parse_x509_pem(ca.certificate_pem().as_bytes()).unwrap();
        let (_, cert) = x509_parser::parse_x509_certificate(&pem.contents).unwrap();

        let mut saw_basic_constraints = false;
        for ext in cert.extensions() {
            if let ParsedExtension::BasicConstraints(bc) = ext.parsed_extension() {
                assert!(bc.ca);
                saw_basic_constraints = true;
            }
        }
        assert!(saw_basic_constraints);
    }

    #[test]
    fn fingerprint_matches_certificate_public_key() {
        let dir = tempfile::tempdir().unwrap();
        let ca = CertificateAuthority::load_or_generate(dir.path(), "cmux", "cmux Test CA", 3650)
            .unwrap();

        let (_, pem) = x509_parser::pem::parse_x509_pem(ca.certificate_pem().as_bytes()).unwrap();
        let (_, cert) = x509_parser::parse_x509_certificate(&pem.contents).unwrap();
        let digest = Sha256::digest(cert.public_key().raw);
        let expected = general_purpose::STANDARD.encode(digest);
        assert_eq!(ca.spki_fingerprint(), expected);
    }

    #[cfg(unix)]
    #[test]
    fn key_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        CertificateAuthority::load_or_generate(dir.path(), "cmux", "cmux Test CA", 3650).unwrap();
        let mode = fs::metadata(dir.path().join(CA_KEY_FILE))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
