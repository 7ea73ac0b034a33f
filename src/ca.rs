//! Certificate authority and per-host leaf certificate cache.
//!
//! MITM'd tunnels are terminated with a certificate minted on the fly for
//! the target host and signed by the proxy's CA; clients that trust the CA
//! certificate accept the forged chain.

use crate::errors::{Error, Result};
use async_trait::async_trait;
use moka::future::Cache;
use rand::Rng;
use rcgen::{
  BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
  KeyUsagePurpose, SanType,
};
use std::net::IpAddr;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;

/// Leaf certificate validity period in seconds (1 year)
const TTL_SECS: i64 = 365 * 24 * 60 * 60;
/// Offset for not_before timestamp to handle clock skew (60 seconds)
const NOT_BEFORE_OFFSET: i64 = 60;

/// A freshly minted leaf certificate: the chain presented to the client
/// (leaf first, CA second) and the matching private key.
#[derive(Debug)]
pub struct CertifiedLeaf {
  /// certificate chain in DER form, leaf first
  pub chain: Vec<CertificateDer<'static>>,
  /// private key matching the leaf
  pub key: PrivateKeyDer<'static>,
}

impl Clone for CertifiedLeaf {
  fn clone(&self) -> Self {
    Self {
      chain: self.chain.clone(),
      key: self.key.clone_key(),
    }
  }
}

/// Certificate authority used to sign per-host leaf certificates.
pub struct CertificateAuthority {
  /// Root CA issuer
  issuer: Issuer<'static, KeyPair>,
  /// Root CA certificate in DER format
  ca_cert_der: CertificateDer<'static>,
  /// Root CA certificate in PEM format, for client installation
  ca_cert_pem: String,
  /// Root CA private key in PEM format, for persistence
  ca_key_pem: String,
}

impl CertificateAuthority {
  /// Generate a fresh self-signed CA valid for ten years.
  ///
  /// The CA lives only as long as the process; export
  /// [`ca_cert_pem`](Self::ca_cert_pem) and install it in the client trust
  /// store to make interception work.
  pub fn generate() -> Result<Self> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "Wiretap Proxy CA");
    dn.push(DnType::OrganizationName, "Wiretap");
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + Duration::days(3650);

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::Certificate(format!("failed to generate CA key pair: {}", e)))?;
    let cert = params
      .self_signed(&key_pair)
      .map_err(|e| Error::Certificate(format!("failed to self-sign CA: {}", e)))?;

    let cert_pem = cert.pem();
    let key_pem = key_pair.serialize_pem();
    let cert_der = CertificateDer::from(cert.der().to_vec());
    let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
      .map_err(|e| Error::Certificate(format!("failed to create issuer: {}", e)))?;

    Ok(Self {
      issuer,
      ca_cert_der: cert_der,
      ca_cert_pem: cert_pem,
      ca_key_pem: key_pem,
    })
  }

  /// Load an existing CA from PEM-encoded certificate and private key.
  pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
    let key_pair = KeyPair::from_pem(key_pem)
      .map_err(|e| Error::Certificate(format!("failed to parse CA key: {}", e)))?;
    let issuer = Issuer::from_ca_cert_pem(cert_pem, key_pair)
      .map_err(|e| Error::Certificate(format!("failed to create issuer from CA cert: {}", e)))?;
    let cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
      .next()
      .ok_or_else(|| Error::Certificate("no certificate found in PEM".to_string()))?
      .map_err(|e| Error::Certificate(format!("failed to parse PEM: {}", e)))?;
    Ok(Self {
      issuer,
      ca_cert_der: cert_der,
      ca_cert_pem: cert_pem.to_string(),
      ca_key_pem: key_pem.to_string(),
    })
  }

  /// The CA certificate in DER form, e.g. for adding to a rustls root store.
  pub fn ca_cert_der(&self) -> &CertificateDer<'static> {
    &self.ca_cert_der
  }

  /// The CA certificate in PEM form, for client installation.
  pub fn ca_cert_pem(&self) -> &str {
    &self.ca_cert_pem
  }

  /// The CA private key in PEM form, for persisting the CA across runs.
  pub fn ca_key_pem(&self) -> &str {
    &self.ca_key_pem
  }

  /// Sign a leaf certificate whose subject alternative names cover the
  /// supplied hostnames.
  ///
  /// Serial numbers are randomized per process; the validity window
  /// envelops the current time with a little slack against clock skew.
  pub fn sign_host(&self, hostnames: &[&str]) -> Result<CertifiedLeaf> {
    let mut params = CertificateParams::default();
    params.serial_number = Some(rand::thread_rng().gen::<u64>().into());

    let mut dn = DistinguishedName::new();
    dn.push(
      DnType::CommonName,
      hostnames.first().copied().unwrap_or_default(),
    );
    params.distinguished_name = dn;

    let mut sans = Vec::new();
    for hostname in hostnames {
      if let Ok(ip) = hostname.parse::<IpAddr>() {
        // strict clients check the iPAddress SAN for IP targets, others
        // accept a dNSName carrying the textual form
        sans.push(SanType::IpAddress(ip));
        if let Ok(dns_name) = (*hostname).try_into() {
          sans.push(SanType::DnsName(dns_name));
        }
      } else {
        sans.push(SanType::DnsName((*hostname).try_into().map_err(|_| {
          Error::Certificate(format!("invalid hostname: {}", hostname))
        })?));
      }
    }
    params.subject_alt_names = sans;

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET);
    params.not_after = now + Duration::seconds(TTL_SECS);

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::Certificate(format!("failed to generate key pair: {}", e)))?;
    let cert = params
      .signed_by(&key_pair, &self.issuer)
      .map_err(|e| Error::Certificate(format!("failed to sign host cert: {}", e)))?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
      .map_err(|_| Error::Certificate("failed to serialize host key".to_string()))?;

    Ok(CertifiedLeaf {
      chain: vec![cert_der, self.ca_cert_der.clone()],
      key: key_der,
    })
  }
}

/// A concurrent cache of minted host certificates.
///
/// `fetch` memoizes by hostname: absent entries are filled by calling `gen`,
/// and a `gen` error is propagated to that caller without poisoning the
/// cache. Implement this to persist certificates outside the process.
#[async_trait]
pub trait CertStore: Send + Sync {
  /// Return the certificate for `hostname`, minting it with `gen` on a miss.
  async fn fetch(
    &self,
    hostname: &str,
    gen: &(dyn Fn() -> Result<CertifiedLeaf> + Send + Sync),
  ) -> Result<Arc<CertifiedLeaf>>;
}

/// The default in-memory store.
pub struct MokaCertStore {
  cache: Cache<String, Arc<CertifiedLeaf>>,
}

impl MokaCertStore {
  /// An empty store holding at most `capacity` certificates.
  pub fn new(capacity: u64) -> Self {
    Self {
      cache: Cache::builder().max_capacity(capacity).build(),
    }
  }
}

impl Default for MokaCertStore {
  fn default() -> Self {
    Self::new(1000)
  }
}

#[async_trait]
impl CertStore for MokaCertStore {
  async fn fetch(
    &self,
    hostname: &str,
    gen: &(dyn Fn() -> Result<CertifiedLeaf> + Send + Sync),
  ) -> Result<Arc<CertifiedLeaf>> {
    self
      .cache
      .try_get_with(hostname.to_string(), async { gen().map(Arc::new) })
      .await
      .map_err(|e| Error::Certificate(e.to_string()))
  }
}

/// A rustls server configuration presenting `leaf` to the client.
pub(crate) fn server_config(leaf: &CertifiedLeaf) -> Result<ServerConfig> {
  ServerConfig::builder()
    .with_no_client_auth()
    .with_single_cert(leaf.chain.clone(), leaf.key.clone_key())
    .map_err(Error::Tls)
}

/// Strip a trailing `:port`, accounting for bracketed IPv6 literals.
pub(crate) fn strip_port(host: &str) -> &str {
  if let Some(end) = host.rfind(']') {
    match host[end..].find(':') {
      Some(ix) => &host[..end + ix],
      None => host,
    }
  } else {
    match host.find(':') {
      Some(ix) => &host[..ix],
      None => host,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};

  #[test]
  fn strip_port_variants() {
    assert_eq!(strip_port("example.com:443"), "example.com");
    assert_eq!(strip_port("example.com"), "example.com");
    assert_eq!(strip_port("[::1]:443"), "[::1]");
    assert_eq!(strip_port("[::1]"), "[::1]");
  }

  #[test]
  fn signs_leaf_for_hostname() {
    let ca = CertificateAuthority::generate().unwrap();
    let leaf = ca.sign_host(&["www.example.com"]).unwrap();
    assert_eq!(leaf.chain.len(), 2);
    assert_eq!(leaf.chain[1], *ca.ca_cert_der());
  }

  #[test]
  fn signs_leaf_for_ip_literal() {
    let ca = CertificateAuthority::generate().unwrap();
    let leaf = ca.sign_host(&["127.0.0.1"]).unwrap();
    assert_eq!(leaf.chain.len(), 2);
  }

  #[test]
  fn ca_round_trips_through_pem() {
    let ca = CertificateAuthority::generate().unwrap();
    let reloaded =
      CertificateAuthority::from_pem(ca.ca_cert_pem(), ca.ca_key_pem()).unwrap();
    assert_eq!(reloaded.ca_cert_der(), ca.ca_cert_der());
    assert!(reloaded.sign_host(&["www.example.com"]).is_ok());
  }

  #[tokio::test]
  async fn fetch_memoizes_by_hostname() {
    let ca = CertificateAuthority::generate().unwrap();
    let store = MokaCertStore::default();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let gen = move || {
      counter.fetch_add(1, Ordering::SeqCst);
      ca.sign_host(&["www.example.com"])
    };

    let first = store.fetch("www.example.com", &gen).await.unwrap();
    let second = store.fetch("www.example.com", &gen).await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn fetch_error_does_not_poison_cache() {
    let ca = CertificateAuthority::generate().unwrap();
    let store = MokaCertStore::default();
    let fail = || -> Result<CertifiedLeaf> { Err(Error::Certificate("boom".to_string())) };
    assert!(store.fetch("www.example.com", &fail).await.is_err());

    let ok = move || ca.sign_host(&["www.example.com"]);
    assert!(store.fetch("www.example.com", &ok).await.is_ok());
  }
}
