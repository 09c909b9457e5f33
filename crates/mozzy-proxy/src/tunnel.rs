//! HTTPS interception tunnel
//!
//! Handles CONNECT: acknowledges the tunnel, terminates TLS against the
//! client with a minted leaf, reads one inner request, dispatches it to
//! the real origin over verified TLS and relays the response back.

use crate::capture::Transaction;
use crate::errors::{Error, Result};
use crate::http1;
use crate::origin::{OutboundRequest, RequestBody};
use crate::server::{error_transaction, Engine};
use bytes::Bytes;
use colored::Colorize;
use http::{StatusCode, Uri};
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;

const CONNECTION_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// Intercept one CONNECT tunnel.
///
/// Failure semantics: a missing authority answers 400 without touching the
/// CA; a mint failure answers 500; handshake and inner-parse failures
/// close silently (the client may have rejected the untrusted CA); an
/// upstream transport failure closes silently but leaves a status-0
/// record.
pub(crate) async fn intercept(
  engine: Arc<Engine>,
  mut client: BufReader<TcpStream>,
  head: http1::RequestHead,
) -> Result<()> {
  let host_key = head.target.clone();

  if parse_authority(&host_key).is_err() {
    let id = engine.log.next_id();
    let mut transaction = error_transaction(
      id,
      OffsetDateTime::now_utc(),
      &head.method,
      &host_key,
      &host_key,
      "",
      &Error::invalid_request("missing CONNECT host"),
    );
    transaction.headers = head.headers.clone();
    engine.record(transaction);
    http1::write_simple_response(&mut client, StatusCode::BAD_REQUEST, "Missing host\n").await?;
    return Ok(());
  }

  if engine.config.verbose {
    println!("{}", format!("→ CONNECT {}", host_key).cyan());
  }

  let interception = engine
    .interception
    .as_ref()
    .ok_or_else(|| Error::tls("interception is not enabled"))?;

  // The exact CONNECT authority is the cache key; the mint strips the
  // port for the certificate names only.
  let leaf = match interception.leaves.lease(&host_key).await {
    Ok(leaf) => leaf,
    Err(e) => {
      let id = engine.log.next_id();
      let mut transaction = error_transaction(
        id,
        OffsetDateTime::now_utc(),
        &head.method,
        &host_key,
        &host_key,
        "",
        &e,
      );
      transaction.headers = head.headers.clone();
      engine.record(transaction);
      http1::write_simple_response(
        &mut client,
        StatusCode::INTERNAL_SERVER_ERROR,
        "Certificate generation failed\n",
      )
      .await?;
      return Ok(());
    }
  };

  // The acknowledgment goes out on the raw socket before any TLS bytes.
  client.write_all(CONNECTION_ESTABLISHED).await?;
  client.flush().await?;

  let acceptor = TlsAcceptor::from(leaf.server_config.clone());
  let tls = match acceptor.accept(client).await {
    Ok(tls) => tls,
    Err(e) => {
      // No record: the client aborted, most likely over an uninstalled CA.
      tracing::debug!("TLS handshake with client failed for {}: {}", host_key, e);
      return Ok(());
    }
  };
  let mut tls = BufReader::new(tls);

  let inner = match http1::read_request_head(&mut tls).await {
    Ok(inner) => inner,
    Err(e) => {
      tracing::debug!("failed to read tunneled request for {}: {}", host_key, e);
      return Ok(());
    }
  };

  let id = engine.log.next_id();
  let started_at = OffsetDateTime::now_utc();
  let start = Instant::now();

  // Rewrite to an absolute https URL on the CONNECT authority, eliding
  // the default port.
  let url_host = host_key.strip_suffix(":443").unwrap_or(&host_key).to_string();
  let uri: Uri = match resolve_inner_target(&url_host, &inner.target) {
    Ok(uri) => uri,
    Err(e) => {
      tracing::debug!("invalid tunneled target for {}: {}", host_key, e);
      return Ok(());
    }
  };
  let url = uri.to_string();
  let path = uri.path().to_string();
  let request_size = http1::content_length(&inner.headers).unwrap_or(0) as i64;

  let outbound = OutboundRequest {
    method: inner.method.clone(),
    uri,
    headers: engine.outbound_headers(&inner.headers),
  };

  let response = if http1::is_chunked(&inner.headers) {
    let body = http1::read_chunked_body(&mut tls).await?;
    engine
      .origin
      .send(&outbound, RequestBody::Buffered(Bytes::from(body)))
      .await
  } else if let Some(length) = http1::content_length(&inner.headers) {
    engine
      .origin
      .send(
        &outbound,
        RequestBody::Streamed {
          reader: &mut tls,
          length,
        },
      )
      .await
  } else {
    engine.origin.send(&outbound, RequestBody::Empty).await
  };

  let response = match response {
    Ok(response) => response,
    Err(e) => {
      // Silent close toward the client, but the failure is recorded.
      let mut transaction =
        error_transaction(id, started_at, &inner.method, &url, &url_host, &path, &e);
      transaction.duration = start.elapsed();
      transaction.request_size = request_size;
      transaction.headers = inner.headers.clone();
      engine.record(transaction);
      return Ok(());
    }
  };

  let duration = start.elapsed();
  let status = response.status;

  // Hop-by-hop headers apply to the origin leg only, and chunked bodies
  // are decoded while relaying, so none of that set survives onto the
  // tunnel.
  let mut response_headers = response.headers.clone();
  http1::remove_hop_headers(&mut response_headers);
  tls
    .write_all(&http1::serialize_response_head(status, &response_headers))
    .await?;
  let response_size = response.copy_body_to(&mut tls).await.unwrap_or(0);
  tls.flush().await?;
  tls.shutdown().await.ok();

  engine.record(Transaction {
    id,
    started_at,
    method: inner.method.to_string(),
    url,
    host: url_host,
    path,
    status: status.as_u16(),
    duration,
    request_size,
    response_size: response_size as i64,
    headers: inner.headers,
    error: String::new(),
  });
  Ok(())
}

/// Relay a CONNECT tunnel without interception: acknowledge, then copy
/// bytes both ways until either side closes.
pub(crate) async fn blind_tunnel(
  mut client: BufReader<TcpStream>,
  target: &str,
) -> Result<()> {
  let (host, port) = match parse_authority(target) {
    Ok(authority) => authority,
    Err(e) => {
      http1::write_simple_response(&mut client, StatusCode::BAD_REQUEST, "Missing host\n").await?;
      return Err(e);
    }
  };

  let mut upstream = match TcpStream::connect((host.as_str(), port)).await {
    Ok(upstream) => upstream,
    Err(e) => {
      http1::write_simple_response(
        &mut client,
        StatusCode::BAD_GATEWAY,
        "Failed to reach target\n",
      )
      .await?;
      return Err(Error::upstream(format!(
        "failed to connect to {}:{}: {}",
        host, port, e
      )));
    }
  };

  client.write_all(CONNECTION_ESTABLISHED).await?;
  client.flush().await?;
  tokio::io::copy_bidirectional(&mut client, &mut upstream)
    .await
    .ok();
  Ok(())
}

fn parse_authority(target: &str) -> Result<(String, u16)> {
  let authority: http::uri::Authority = target
    .parse()
    .map_err(|_| Error::invalid_request(format!("invalid CONNECT authority: {}", target)))?;
  if authority.host().is_empty() {
    return Err(Error::invalid_request("missing CONNECT host"));
  }
  Ok((authority.host().to_string(), authority.port_u16().unwrap_or(443)))
}

fn resolve_inner_target(url_host: &str, target: &str) -> Result<Uri> {
  let absolute = if target.starts_with('/') {
    format!("https://{}{}", url_host, target)
  } else if target.starts_with("https://") || target.starts_with("http://") {
    target.to_string()
  } else {
    return Err(Error::invalid_request(format!(
      "invalid tunneled target: {}",
      target
    )));
  };
  absolute
    .parse()
    .map_err(|_| Error::invalid_request(format!("invalid tunneled target: {}", target)))
}
