//! Certificate authority management
//!
//! Loads or generates the persisted root used to sign per-host leaf
//! certificates, and mints those leaves on demand. The root lives in
//! `<home>/.mozzy` so that the operator installs it once; regenerating it
//! on every run would invalidate every existing trust decision.

use crate::errors::{Error, Result};
use rand::Rng;
use rcgen::{
  BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
  Issuer, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use time::format_description::well_known::Rfc3339;
use time::{Duration, OffsetDateTime};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};

const CA_CERT_FILE: &str = "ca-cert.pem";
const CA_KEY_FILE: &str = "ca-key.pem";

const CA_COMMON_NAME: &str = "Mozzy Proxy CA";
const CA_ORGANIZATION: &str = "Mozzy";
const LEAF_ORGANIZATION: &str = "Mozzy Proxy";

/// Root validity (10 years)
const CA_TTL_DAYS: i64 = 3650;
/// Leaf validity (1 year)
const LEAF_TTL_DAYS: i64 = 365;
/// Offset for leaf not_before to absorb clock skew (60 seconds)
const NOT_BEFORE_OFFSET: i64 = 60;

/// A freshly minted per-host certificate, ready for a server-side TLS config.
///
/// The chain is `[leaf, root]` so that clients without the root installed
/// still see a complete chain when inspecting.
pub struct MintedLeaf {
  /// Certificate chain presented to the client: leaf first, then the root.
  pub chain: Vec<CertificateDer<'static>>,
  /// The leaf private key.
  pub key: PrivateKeyDer<'static>,
}

/// The persisted signing root.
///
/// Loaded (or generated) once at engine start and read-only thereafter.
pub struct CertificateAuthority {
  issuer: Issuer<'static, KeyPair>,
  ca_cert_der: CertificateDer<'static>,
  cert_path: PathBuf,
  key_path: PathBuf,
}

impl CertificateAuthority {
  /// Load the root from the default `<home>/.mozzy` directory, generating
  /// and persisting a fresh one if it does not exist yet.
  pub fn load_or_generate() -> Result<Self> {
    Self::open(default_ca_dir()?)
  }

  /// Load or generate the root against an explicit directory.
  ///
  /// Both PEM files must be present to load; otherwise a new root is
  /// generated and written. A present-but-unparseable file is an error,
  /// never a silent regeneration.
  pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
    let dir = dir.as_ref();
    let cert_path = dir.join(CA_CERT_FILE);
    let key_path = dir.join(CA_KEY_FILE);

    let (issuer, ca_cert_der) = if cert_path.exists() && key_path.exists() {
      Self::load(&cert_path, &key_path)?
    } else {
      Self::generate(&cert_path, &key_path)?
    };

    Ok(Self {
      issuer,
      ca_cert_der,
      cert_path,
      key_path,
    })
  }

  fn load(
    cert_path: &Path,
    key_path: &Path,
  ) -> Result<(Issuer<'static, KeyPair>, CertificateDer<'static>)> {
    let cert_pem = fs::read_to_string(cert_path)?;
    let key_pem = fs::read_to_string(key_path)?;

    let key_pair = KeyPair::from_pem(&key_pem)
      .map_err(|e| Error::certificate(format!("failed to parse CA key: {}", e)))?;

    let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
      .map_err(|e| Error::certificate(format!("failed to parse CA cert: {}", e)))?;

    let cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
      .next()
      .ok_or_else(|| Error::certificate("no certificate found in CA PEM"))?
      .map_err(|e| Error::certificate(format!("failed to decode CA PEM: {}", e)))?;

    tracing::debug!("loaded CA certificate from {}", cert_path.display());
    Ok((issuer, cert_der))
  }

  fn generate(
    cert_path: &Path,
    key_path: &Path,
  ) -> Result<(Issuer<'static, KeyPair>, CertificateDer<'static>)> {
    let mut params = CertificateParams::default();
    params.serial_number = Some(random_serial());

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, CA_COMMON_NAME);
    dn.push(DnType::OrganizationName, CA_ORGANIZATION);
    params.distinguished_name = dn;

    // Root constraints: CA with path length zero, so it can sign leaves
    // but no intermediates.
    params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + Duration::days(CA_TTL_DAYS);

    let key_pair = generate_key_pair()?;
    let cert = params
      .self_signed(&key_pair)
      .map_err(|e| Error::certificate(format!("failed to self-sign CA: {}", e)))?;

    let cert_pem = cert.pem();
    let key_pem = key_pair.serialize_pem();

    if let Some(parent) = cert_path.parent() {
      fs::create_dir_all(parent)?;
    }
    write_certificate(cert_path, cert_pem.as_bytes())?;
    write_private_key(key_path, key_pem.as_bytes())?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
      .map_err(|e| Error::certificate(format!("failed to build issuer: {}", e)))?;

    tracing::info!("generated new CA certificate at {}", cert_path.display());
    Ok((issuer, cert_der))
  }

  /// Mint a fresh leaf for the given host key.
  ///
  /// The host key is taken verbatim from the CONNECT authority; a trailing
  /// port is stripped for the CN and SAN only, never for the caller's
  /// cache key.
  pub fn mint_leaf(&self, host_key: &str) -> Result<MintedLeaf> {
    let host = strip_port(host_key);

    let mut params = CertificateParams::default();
    params.serial_number = Some(random_serial());

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, host);
    dn.push(DnType::OrganizationName, LEAF_ORGANIZATION);
    params.distinguished_name = dn;

    params.key_usages = vec![
      KeyUsagePurpose::DigitalSignature,
      KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    // IP literals get an iPAddress SAN; everything else a dNSName.
    params.subject_alt_names = if let Ok(ip) = host.parse::<IpAddr>() {
      vec![SanType::IpAddress(ip)]
    } else {
      vec![SanType::DnsName(host.try_into().map_err(|_| {
        Error::certificate(format!("invalid host name: {}", host))
      })?)]
    };

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET);
    params.not_after = now + Duration::days(LEAF_TTL_DAYS);

    let key_pair = generate_key_pair()?;
    let cert = params
      .signed_by(&key_pair, &self.issuer)
      .map_err(|e| Error::certificate(format!("failed to sign leaf for {}: {}", host, e)))?;

    let key = PrivateKeyDer::try_from(key_pair.serialize_der())
      .map_err(|_| Error::certificate("failed to serialize leaf key"))?;

    Ok(MintedLeaf {
      chain: vec![
        CertificateDer::from(cert.der().to_vec()),
        self.ca_cert_der.clone(),
      ],
      key,
    })
  }

  /// The root certificate as PEM, for installation into trust stores.
  pub fn export_pem(&self) -> Result<String> {
    fs::read_to_string(&self.cert_path)
      .map_err(|e| Error::certificate(format!("failed to read CA cert: {}", e)))
  }

  /// Human-readable summary of the root: subject, issuer, serial, validity
  /// window and on-disk paths.
  pub fn describe(&self) -> Result<String> {
    let (_, cert) = x509_parser::parse_x509_certificate(&self.ca_cert_der)
      .map_err(|e| Error::certificate(format!("failed to parse CA cert: {}", e)))?;

    let not_before = cert
      .validity()
      .not_before
      .to_datetime()
      .format(&Rfc3339)
      .unwrap_or_default();
    let not_after = cert
      .validity()
      .not_after
      .to_datetime()
      .format(&Rfc3339)
      .unwrap_or_default();

    Ok(format!(
      "Mozzy Proxy Certificate Authority\n\n\
       Subject: {}\n\
       Issuer:  {}\n\
       Serial:  {}\n\n\
       Valid From: {}\n\
       Valid To:   {}\n\n\
       Certificate: {}\n\
       Private Key: {}",
      cert.subject(),
      cert.issuer(),
      cert.raw_serial_as_string(),
      not_before,
      not_after,
      self.cert_path.display(),
      self.key_path.display(),
    ))
  }

  /// The root certificate in DER form.
  pub fn cert_der(&self) -> &CertificateDer<'static> {
    &self.ca_cert_der
  }

  /// Path of the persisted root certificate.
  pub fn cert_path(&self) -> &Path {
    &self.cert_path
  }

  /// Path of the persisted root key.
  pub fn key_path(&self) -> &Path {
    &self.key_path
  }
}

fn default_ca_dir() -> Result<PathBuf> {
  let dirs = directories::BaseDirs::new()
    .ok_or_else(|| Error::certificate("could not resolve the home directory"))?;
  Ok(dirs.home_dir().join(".mozzy"))
}

/// Generate an RSA-2048 key pair, as the stock of deployed clients accepts.
fn generate_key_pair() -> Result<KeyPair> {
  KeyPair::generate_for(&rcgen::PKCS_RSA_SHA256)
    .map_err(|e| Error::certificate(format!("failed to generate key pair: {}", e)))
}

/// Uniformly random 128-bit serial. Clients may reject duplicate serials,
/// so these must come from a real RNG, never a clock.
fn random_serial() -> SerialNumber {
  let mut bytes = [0u8; 16];
  rand::thread_rng().fill(&mut bytes[..]);
  SerialNumber::from(bytes.to_vec())
}

/// Write the certificate world-readable, regardless of the umask.
fn write_certificate(path: &Path, pem: &[u8]) -> Result<()> {
  fs::write(path, pem)?;
  #[cfg(unix)]
  {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o644))?;
  }
  Ok(())
}

/// Write the key readable by the owner only.
fn write_private_key(path: &Path, pem: &[u8]) -> Result<()> {
  fs::write(path, pem)?;
  #[cfg(unix)]
  {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
  }
  Ok(())
}

/// Strip a trailing `:port` (and IPv6 brackets) from a CONNECT authority.
pub(crate) fn strip_port(host: &str) -> &str {
  if let Some(rest) = host.strip_prefix('[') {
    if let Some(end) = rest.find(']') {
      return &rest[..end];
    }
  }
  if let Some((name, port)) = host.rsplit_once(':') {
    if !name.contains(':') && port.parse::<u16>().is_ok() {
      return name;
    }
  }
  host
}
