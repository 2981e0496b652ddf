use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::x509::extension::{
    AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage, KeyUsage, SubjectAlternativeName,
    SubjectKeyIdentifier,
};
use openssl::x509::{X509Builder, X509NameBuilder, X509};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::{Error, Result};

/// A certificate chain plus its private key, used as a TLS server identity.
pub struct Identity {
    pub cert: X509,
    pub chain: Vec<X509>,
    pub key: PKey<Private>,
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("subject", &self.cert.subject_name())
            .finish()
    }
}

impl Identity {
    /// Load a PEM certificate (optionally followed by its chain) and PEM private key.
    pub fn load<P: AsRef<Path>, Q: AsRef<Path>>(cert_path: P, key_path: Q) -> Result<Self> {
        let cert_path = cert_path.as_ref();
        let key_path = key_path.as_ref();

        let cert_pem = fs::read(cert_path).map_err(|e| {
            Error::certificate(format!("reading {}: {}", cert_path.display(), e))
        })?;
        let key_pem = fs::read(key_path).map_err(|e| {
            Error::certificate(format!("reading {}: {}", key_path.display(), e))
        })?;

        let mut certs = X509::stack_from_pem(&cert_pem)?.into_iter();
        let cert = certs.next().ok_or_else(|| {
            Error::certificate(format!("no certificate in {}", cert_path.display()))
        })?;
        let key = PKey::private_key_from_pem(&key_pem)?;

        Ok(Self {
            cert,
            chain: certs.collect(),
            key,
        })
    }

    pub fn cert_pem(&self) -> Result<Vec<u8>> {
        Ok(self.cert.to_pem()?)
    }

    pub fn key_pem(&self) -> Result<Vec<u8>> {
        Ok(self.key.private_key_to_pem_pkcs8()?)
    }

    pub fn fingerprint(&self) -> Result<String> {
        fingerprint(&self.cert)
    }
}

/// Read every certificate from a PEM bundle; an empty bundle is an error.
pub fn load_root_certificates<P: AsRef<Path>>(path: P) -> Result<Vec<X509>> {
    let path = path.as_ref();
    let pem = fs::read(path)
        .map_err(|e| Error::certificate(format!("reading {}: {}", path.display(), e)))?;
    let certs = X509::stack_from_pem(&pem)?;
    if certs.is_empty() {
        return Err(Error::certificate(format!(
            "no certificates in {}",
            path.display()
        )));
    }
    Ok(certs)
}

/// SHA-256 fingerprint of the DER encoding, lowercase hex.
pub fn fingerprint(cert: &X509) -> Result<String> {
    use sha2::{Digest, Sha256};

    let der = cert.to_der()?;
    let mut hasher = Sha256::new();
    hasher.update(&der);
    Ok(format!("{:x}", hasher.finalize()))
}

/// Self-signed CA used to issue server identities for private deployments.
pub struct CertificateAuthority {
    cert: X509,
    key: PKey<Private>,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("subject", &self.cert.subject_name())
            .finish()
    }
}

impl CertificateAuthority {
    pub fn generate(common_name: &str) -> Result<Self> {
        let rsa = Rsa::generate(2048)?;
        let key = PKey::from_rsa(rsa)?;

        let mut cert_builder = X509Builder::new()?;
        cert_builder.set_version(2)?;
        let serial = random_serial()?;
        cert_builder.set_serial_number(&serial)?;

        // 10 years
        let not_before = Asn1Time::days_from_now(0)?;
        let not_after = Asn1Time::days_from_now(365 * 10)?;
        cert_builder.set_not_before(&not_before)?;
        cert_builder.set_not_after(&not_after)?;

        let mut name_builder = X509NameBuilder::new()?;
        name_builder.append_entry_by_nid(Nid::COMMONNAME, common_name)?;
        name_builder.append_entry_by_nid(Nid::ORGANIZATIONNAME, "mino")?;
        let name = name_builder.build();

        cert_builder.set_subject_name(&name)?;
        cert_builder.set_issuer_name(&name)?;
        cert_builder.set_pubkey(&key)?;

        cert_builder.append_extension(BasicConstraints::new().critical().ca().build()?)?;
        cert_builder.append_extension(
            KeyUsage::new()
                .critical()
                .key_cert_sign()
                .crl_sign()
                .build()?,
        )?;

        let subject_key_identifier =
            SubjectKeyIdentifier::new().build(&cert_builder.x509v3_context(None, None))?;
        cert_builder.append_extension(subject_key_identifier)?;

        cert_builder.sign(&key, MessageDigest::sha256())?;

        Ok(Self {
            cert: cert_builder.build(),
            key,
        })
    }

    pub fn cert(&self) -> &X509 {
        &self.cert
    }

    pub fn cert_pem(&self) -> Result<Vec<u8>> {
        Ok(self.cert.to_pem()?)
    }

    /// Issue a server identity for `hostname` (a DNS name or an IP literal).
    pub fn issue(&self, hostname: &str) -> Result<Identity> {
        let rsa = Rsa::generate(2048)?;
        let key = PKey::from_rsa(rsa)?;

        let mut cert_builder = X509Builder::new()?;
        cert_builder.set_version(2)?;
        let serial = random_serial()?;
        cert_builder.set_serial_number(&serial)?;

        let not_before = Asn1Time::days_from_now(0)?;
        let not_after = Asn1Time::days_from_now(365)?;
        cert_builder.set_not_before(&not_before)?;
        cert_builder.set_not_after(&not_after)?;

        let mut name_builder = X509NameBuilder::new()?;
        name_builder.append_entry_by_nid(Nid::COMMONNAME, hostname)?;
        let subject_name = name_builder.build();
        cert_builder.set_subject_name(&subject_name)?;
        cert_builder.set_issuer_name(self.cert.subject_name())?;
        cert_builder.set_pubkey(&key)?;

        cert_builder.append_extension(BasicConstraints::new().build()?)?;
        cert_builder.append_extension(
            KeyUsage::new()
                .critical()
                .digital_signature()
                .key_encipherment()
                .build()?,
        )?;
        cert_builder.append_extension(ExtendedKeyUsage::new().server_auth().build()?)?;

        let subject_key_identifier = SubjectKeyIdentifier::new()
            .build(&cert_builder.x509v3_context(Some(&self.cert), None))?;
        cert_builder.append_extension(subject_key_identifier)?;

        let authority_key_identifier = AuthorityKeyIdentifier::new()
            .keyid(false)
            .issuer(false)
            .build(&cert_builder.x509v3_context(Some(&self.cert), None))?;
        cert_builder.append_extension(authority_key_identifier)?;

        let mut san_builder = SubjectAlternativeName::new();
        if hostname.parse::<IpAddr>().is_ok() {
            san_builder.ip(hostname);
        } else {
            san_builder.dns(hostname);
        }
        let san = san_builder.build(&cert_builder.x509v3_context(Some(&self.cert), None))?;
        cert_builder.append_extension(san)?;

        cert_builder.sign(&self.key, MessageDigest::sha256())?;

        Ok(Identity {
            cert: cert_builder.build(),
            chain: Vec::new(),
            key,
        })
    }
}

fn random_serial() -> Result<openssl::asn1::Asn1Integer> {
    let mut serial = BigNum::new()?;
    serial.rand(159, MsbOption::MAYBE_ZERO, false)?;
    Ok(serial.to_asn1_integer()?)
}

/// Files written by [`generate_deployment`]
#[derive(Debug, Clone)]
pub struct DeploymentFiles {
    pub ca: PathBuf,
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Write `ca.pem`, `cert.pem` and `key.pem` for a server reachable as `hostname`.
///
/// Clients verify the server by pointing their `root_ca` at `ca.pem`.
pub fn generate_deployment<P: AsRef<Path>>(dir: P, hostname: &str) -> Result<DeploymentFiles> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir)?;

    let ca = CertificateAuthority::generate("mino")?;
    let identity = ca.issue(hostname)?;

    let files = DeploymentFiles {
        ca: dir.join("ca.pem"),
        cert: dir.join("cert.pem"),
        key: dir.join("key.pem"),
    };
    fs::write(&files.ca, ca.cert_pem()?)?;
    fs::write(&files.cert, identity.cert_pem()?)?;
    fs::write(&files.key, identity.key_pem()?)?;

    info!(
        "generated certificate for {} (sha256 {})",
        hostname,
        identity.fingerprint()?
    );
    Ok(files)
}
