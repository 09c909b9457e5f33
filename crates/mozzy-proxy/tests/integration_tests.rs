//! Integration tests for mozzy-proxy

use mozzy_proxy::{
  CaptureFilter, CaptureLog, CertificateAuthority, LeafCache, ProxyConfig, ProxyServer,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use x509_parser::prelude::*;

#[test]
fn ca_generation_and_persistence() {
  let dir = tempfile::tempdir().unwrap();
  let ca = CertificateAuthority::open(dir.path()).unwrap();

  assert!(ca.cert_path().exists(), "CA certificate file not created");
  assert!(ca.key_path().exists(), "CA key file not created");

  let pem = ca.export_pem().unwrap();
  assert!(pem.contains("BEGIN CERTIFICATE"), "invalid PEM format");
  assert!(pem.contains("END CERTIFICATE"), "invalid PEM format");

  #[cfg(unix)]
  {
    use std::os::unix::fs::PermissionsExt;
    let mode = std::fs::metadata(ca.key_path()).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o600, "CA key must be owner-only");
    let mode = std::fs::metadata(ca.cert_path()).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o644, "CA certificate must be world-readable");
  }
}

#[test]
fn ca_export_reparse_round_trip() {
  let dir = tempfile::tempdir().unwrap();
  let first = CertificateAuthority::open(dir.path()).unwrap();
  let first_pem = first.export_pem().unwrap();

  let (_, pem) = parse_x509_pem(first_pem.as_bytes()).unwrap();
  let (_, cert) = parse_x509_certificate(&pem.contents).unwrap();

  let cn = cert
    .subject()
    .iter_common_name()
    .next()
    .and_then(|cn| cn.as_str().ok())
    .unwrap();
  assert_eq!(cn, "Mozzy Proxy CA");
  let constraints = cert.basic_constraints().unwrap().unwrap();
  assert!(constraints.value.ca);

  let serial = cert.raw_serial().to_vec();
  let not_before = cert.validity().not_before;
  let not_after = cert.validity().not_after;

  // A second open loads the persisted root instead of regenerating it.
  let reloaded = CertificateAuthority::open(dir.path()).unwrap();
  let reloaded_pem = reloaded.export_pem().unwrap();
  let (_, pem) = parse_x509_pem(reloaded_pem.as_bytes()).unwrap();
  let (_, cert) = parse_x509_certificate(&pem.contents).unwrap();

  assert_eq!(cert.raw_serial(), serial.as_slice());
  assert_eq!(cert.validity().not_before, not_before);
  assert_eq!(cert.validity().not_after, not_after);

  let info = reloaded.describe().unwrap();
  assert!(info.contains("Mozzy Proxy CA"));
  assert!(info.contains("ca-cert.pem"));
}

#[test]
fn minted_leaf_has_host_names_and_chain() {
  let dir = tempfile::tempdir().unwrap();
  let ca = CertificateAuthority::open(dir.path()).unwrap();

  let leaf = ca.mint_leaf("example.test:443").unwrap();
  assert_eq!(leaf.chain.len(), 2, "expected [leaf, root] chain");

  let (_, cert) = parse_x509_certificate(&leaf.chain[0]).unwrap();
  let cn = cert
    .subject()
    .iter_common_name()
    .next()
    .and_then(|cn| cn.as_str().ok())
    .unwrap();
  assert_eq!(cn, "example.test", "port must be stripped from the CN");

  let san = cert.subject_alternative_name().unwrap().unwrap();
  let dns_names: Vec<_> = san
    .value
    .general_names
    .iter()
    .filter_map(|name| match name {
      GeneralName::DNSName(name) => Some(*name),
      _ => None,
    })
    .collect();
  assert_eq!(dns_names, vec!["example.test"]);

  // Serials must never repeat across mints.
  let second = ca.mint_leaf("other.test:443").unwrap();
  let (_, other) = parse_x509_certificate(&second.chain[0]).unwrap();
  assert_ne!(cert.raw_serial(), other.raw_serial());
}

#[tokio::test]
async fn leaf_cache_is_single_flight() {
  let dir = tempfile::tempdir().unwrap();
  let ca = Arc::new(CertificateAuthority::open(dir.path()).unwrap());
  let cache = Arc::new(LeafCache::new(ca));

  let mut handles = Vec::new();
  for _ in 0..10 {
    let cache = cache.clone();
    handles.push(tokio::spawn(
      async move { cache.lease("api.test:443").await },
    ));
  }

  let mut leaves = Vec::new();
  for handle in handles {
    leaves.push(handle.await.unwrap().unwrap());
  }

  // All ten tunnels got the same certificate, so only one mint happened.
  let first = leaves[0].chain[0].as_ref().to_vec();
  for leaf in &leaves {
    assert_eq!(leaf.chain[0].as_ref(), first.as_slice());
  }
  assert_eq!(cache.len().await, 1);
}

#[tokio::test]
async fn leaf_cache_keys_include_the_port() {
  let dir = tempfile::tempdir().unwrap();
  let ca = Arc::new(CertificateAuthority::open(dir.path()).unwrap());
  let cache = LeafCache::new(ca);

  let default_port = cache.lease("example.test:443").await.unwrap();
  let alt_port = cache.lease("example.test:8443").await.unwrap();
  assert_ne!(
    default_port.chain[0].as_ref(),
    alt_port.chain[0].as_ref(),
    "port variants must not share a cache slot"
  );
  assert_eq!(cache.len().await, 2);
}

/// A one-shot origin that captures each request head and answers with the
/// next canned response.
async fn spawn_backend(responses: Vec<&'static [u8]>) -> (SocketAddr, Arc<Mutex<Vec<Vec<u8>>>>) {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let seen = Arc::new(Mutex::new(Vec::new()));
  let captured = seen.clone();

  tokio::spawn(async move {
    for response in responses {
      let Ok((mut stream, _)) = listener.accept().await else {
        return;
      };
      let mut head = Vec::new();
      let mut byte = [0u8; 1];
      while !head.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte).await {
          Ok(0) => break,
          Ok(_) => head.push(byte[0]),
          Err(_) => return,
        }
      }
      captured.lock().await.push(head);
      stream.write_all(response).await.ok();
    }
  });

  (addr, seen)
}

async fn spawn_proxy(config: ProxyConfig, log: Arc<CaptureLog>) -> SocketAddr {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let server = ProxyServer::new(config, log).unwrap();
  tokio::spawn(async move {
    server.serve(listener).await.ok();
  });
  addr
}

async fn wait_for_log(log: &CaptureLog, entries: usize) {
  for _ in 0..100 {
    if log.len() >= entries {
      return;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
  }
  panic!("capture log never reached {} entries", entries);
}

#[tokio::test]
async fn forward_strips_hops_injects_headers_and_records() {
  let (backend, seen) =
    spawn_backend(vec![b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello".as_slice()]).await;

  let log = Arc::new(CaptureLog::new());
  let config = ProxyConfig {
    inject_headers: vec![("x-added".parse().unwrap(), "1".parse().unwrap())],
    ..Default::default()
  };
  let proxy = spawn_proxy(config, log.clone()).await;

  let mut client = TcpStream::connect(proxy).await.unwrap();
  let request = format!(
    "GET http://{}/x HTTP/1.1\r\nHost: {}\r\nX-Keep: yes\r\nConnection: X-Keep\r\n\r\n",
    backend, backend
  );
  client.write_all(request.as_bytes()).await.unwrap();

  let mut reply = Vec::new();
  client.read_to_end(&mut reply).await.unwrap();
  let reply = String::from_utf8_lossy(&reply);
  assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"), "reply: {}", reply);
  assert!(reply.ends_with("hello"), "reply: {}", reply);

  let seen = seen.lock().await;
  let upstream = String::from_utf8_lossy(&seen[0]).to_ascii_lowercase();
  assert!(upstream.starts_with("get /x http/1.1\r\n"), "upstream: {}", upstream);
  assert!(upstream.contains("x-added: 1\r\n"));
  assert!(upstream.contains("x-keep: yes\r\n"));
  assert!(
    !upstream.contains("\r\nconnection:"),
    "hop-by-hop header leaked upstream: {}",
    upstream
  );

  wait_for_log(&log, 1).await;
  let snapshot = log.snapshot();
  assert_eq!(snapshot.len(), 1);
  assert_eq!(snapshot[0].status, 200);
  assert_eq!(snapshot[0].response_size, 5);
  assert_eq!(snapshot[0].url, format!("http://{}/x", backend));
  assert!(snapshot[0].error.is_empty());
}

#[tokio::test]
async fn errors_only_filter_logs_failures_only() {
  let (backend, _) = spawn_backend(vec![
    b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok".as_slice(),
    b"HTTP/1.1 500 Internal Server Error\r\nContent-Length: 4\r\n\r\nboom".as_slice(),
  ])
  .await;

  let log = Arc::new(CaptureLog::new());
  let config = ProxyConfig {
    filter: CaptureFilter {
      errors_only: true,
      ..Default::default()
    },
    ..Default::default()
  };
  let proxy = spawn_proxy(config, log.clone()).await;

  for path in ["/a", "/b"] {
    let mut client = TcpStream::connect(proxy).await.unwrap();
    let request = format!(
      "GET http://{}{} HTTP/1.1\r\nHost: {}\r\n\r\n",
      backend, path, backend
    );
    client.write_all(request.as_bytes()).await.unwrap();
    let mut reply = Vec::new();
    client.read_to_end(&mut reply).await.unwrap();
    assert!(reply.starts_with(b"HTTP/1.1"), "request was not forwarded");
  }

  wait_for_log(&log, 1).await;
  let snapshot = log.snapshot();
  assert_eq!(snapshot.len(), 1, "only the 500 should be logged");
  assert_eq!(snapshot[0].status, 500);
}

#[tokio::test]
async fn connect_without_authority_is_rejected() {
  let dir = tempfile::tempdir().unwrap();
  let authority = Arc::new(CertificateAuthority::open(dir.path()).unwrap());
  let log = Arc::new(CaptureLog::new());

  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let config = ProxyConfig {
    https: true,
    ..Default::default()
  };
  let server = ProxyServer::with_authority(config, log.clone(), authority).unwrap();
  tokio::spawn(async move {
    server.serve(listener).await.ok();
  });

  let mut client = TcpStream::connect(addr).await.unwrap();
  client
    .write_all(b"CONNECT / HTTP/1.1\r\n\r\n")
    .await
    .unwrap();
  let mut reply = Vec::new();
  client.read_to_end(&mut reply).await.unwrap();
  assert!(
    reply.starts_with(b"HTTP/1.1 400 Bad Request"),
    "reply: {}",
    String::from_utf8_lossy(&reply)
  );

  wait_for_log(&log, 1).await;
  let snapshot = log.snapshot();
  assert_eq!(snapshot[0].status, 0);
  assert!(!snapshot[0].error.is_empty());
}

/// CONNECT to an unresolvable origin: the tunnel is established, the
/// handshake presents a leaf for the authority, the upstream dial fails,
/// and the failure lands in the log with status 0.
#[tokio::test]
async fn mitm_tunnel_records_upstream_failure() {
  use tokio_rustls::rustls::pki_types::ServerName;
  use tokio_rustls::rustls::{ClientConfig, RootCertStore};
  use tokio_rustls::TlsConnector;

  let dir = tempfile::tempdir().unwrap();
  let authority = Arc::new(CertificateAuthority::open(dir.path()).unwrap());
  let log = Arc::new(CaptureLog::new());

  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let config = ProxyConfig {
    https: true,
    ..Default::default()
  };
  let server = ProxyServer::with_authority(config, log.clone(), authority.clone()).unwrap();
  tokio::spawn(async move {
    server.serve(listener).await.ok();
  });

  let mut client = TcpStream::connect(addr).await.unwrap();
  client
    .write_all(b"CONNECT badhost.invalid:443 HTTP/1.1\r\nHost: badhost.invalid:443\r\n\r\n")
    .await
    .unwrap();

  // The acknowledgment is the literal line, before any TLS bytes.
  let mut ack = Vec::new();
  let mut byte = [0u8; 1];
  while !ack.ends_with(b"\r\n\r\n") {
    let n = client.read(&mut byte).await.unwrap();
    assert!(n > 0, "connection closed before tunnel acknowledgment");
    ack.push(byte[0]);
  }
  assert_eq!(ack, b"HTTP/1.1 200 Connection Established\r\n\r\n");

  // Complete the handshake trusting only the proxy's root.
  let mut roots = RootCertStore::empty();
  roots.add(authority.cert_der().clone()).unwrap();
  let tls_config = ClientConfig::builder()
    .with_root_certificates(roots)
    .with_no_client_auth();
  let connector = TlsConnector::from(Arc::new(tls_config));
  let server_name = ServerName::try_from("badhost.invalid").unwrap();
  let mut tls = connector.connect(server_name, client).await.unwrap();

  // The presented leaf names the CONNECT authority with the port stripped.
  {
    let (_, session) = tls.get_ref();
    let peer = session.peer_certificates().unwrap();
    let (_, leaf) = parse_x509_certificate(&peer[0]).unwrap();
    let cn = leaf
      .subject()
      .iter_common_name()
      .next()
      .and_then(|cn| cn.as_str().ok())
      .unwrap();
    assert_eq!(cn, "badhost.invalid");
  }

  tls
    .write_all(b"GET /y HTTP/1.1\r\nHost: badhost.invalid\r\n\r\n")
    .await
    .unwrap();

  // No response body: the tunnel closes once the upstream dial fails.
  let mut reply = Vec::new();
  tls.read_to_end(&mut reply).await.ok();
  assert!(reply.is_empty(), "unexpected bytes: {:?}", reply);

  wait_for_log(&log, 1).await;
  let snapshot = log.snapshot();
  assert_eq!(snapshot.len(), 1);
  assert_eq!(snapshot[0].status, 0);
  assert!(!snapshot[0].error.is_empty());
  assert_eq!(snapshot[0].url, "https://badhost.invalid/y");
}

// The full MITM happy path needs an origin whose certificate validates
// against the platform trust store, which a local test server cannot
// provide. Its pieces are covered separately: the acknowledgment bytes,
// the handshake and the presented names above, the leaf and cache
// contracts, and the forward-path relay.

#[tokio::test]
async fn har_export_reflects_log_state() {
  let (backend, _) =
    spawn_backend(vec![b"HTTP/1.1 204 No Content\r\nContent-Length: 0\r\n\r\n".as_slice()]).await;

  let log = Arc::new(CaptureLog::new());
  let proxy = spawn_proxy(ProxyConfig::default(), log.clone()).await;

  let mut client = TcpStream::connect(proxy).await.unwrap();
  let request = format!(
    "GET http://{}/gone HTTP/1.1\r\nHost: {}\r\n\r\n",
    backend, backend
  );
  client.write_all(request.as_bytes()).await.unwrap();
  let mut reply = Vec::new();
  client.read_to_end(&mut reply).await.unwrap();

  wait_for_log(&log, 1).await;

  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("session.har");
  mozzy_proxy::export_har(&log, &path).unwrap();

  let data = std::fs::read_to_string(&path).unwrap();
  let har: mozzy_proxy::Har = serde_json::from_str(&data).unwrap();
  assert_eq!(har.log.version, "1.2");
  assert_eq!(har.log.entries.len(), 1);
  assert_eq!(har.log.entries[0].response.status, 204);
  assert_eq!(har.log.entries[0].response.status_text, "No Content");
}
