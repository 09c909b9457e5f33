//! Single-flight cache of minted leaf certificates
//!
//! Keyed by the exact CONNECT authority (port included) so that port
//! variations of the same name do not split the cache.

use crate::ca::CertificateAuthority;
use crate::errors::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_rustls::rustls::pki_types::CertificateDer;
use tokio_rustls::rustls::ServerConfig;

/// A cached leaf: the presented chain plus a ready server-side TLS config.
pub struct ServerLeaf {
  /// Chain presented to clients: leaf first, then the root.
  pub chain: Vec<CertificateDer<'static>>,
  /// TLS server configuration holding the chain and the leaf key.
  pub server_config: Arc<ServerConfig>,
}

/// Memoizes minted leaves per host key.
///
/// Entries are never evicted for the process lifetime.
pub struct LeafCache {
  authority: Arc<CertificateAuthority>,
  leaves: Mutex<HashMap<String, Arc<ServerLeaf>>>,
}

impl LeafCache {
  /// Create an empty cache backed by the given authority.
  pub fn new(authority: Arc<CertificateAuthority>) -> Self {
    Self {
      authority,
      leaves: Mutex::new(HashMap::new()),
    }
  }

  /// Return the leaf for `host_key`, minting it on first use.
  ///
  /// The cache lock is held across the mint: concurrent first lookups for
  /// the same host wait on the lock instead of minting twice, so at most
  /// one mint ever happens per host key.
  pub async fn lease(&self, host_key: &str) -> Result<Arc<ServerLeaf>> {
    let mut leaves = self.leaves.lock().await;
    if let Some(leaf) = leaves.get(host_key) {
      return Ok(leaf.clone());
    }

    tracing::debug!("minting certificate for {}", host_key);
    let minted = self.authority.mint_leaf(host_key)?;
    let server_config = ServerConfig::builder()
      .with_no_client_auth()
      .with_single_cert(minted.chain.clone(), minted.key)
      .map_err(|e| Error::tls(format!("failed to build TLS config for {}: {}", host_key, e)))?;

    let leaf = Arc::new(ServerLeaf {
      chain: minted.chain,
      server_config: Arc::new(server_config),
    });
    leaves.insert(host_key.to_string(), leaf.clone());
    Ok(leaf)
  }

  /// Number of distinct host keys with a minted leaf.
  pub async fn len(&self) -> usize {
    self.leaves.lock().await.len()
  }

  /// True when no leaf has been minted yet.
  pub async fn is_empty(&self) -> bool {
    self.leaves.lock().await.is_empty()
  }
}
