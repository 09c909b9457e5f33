//! HAR 1.2 export of the capture log
//!
//! Layout per <http://www.softwareishard.com/blog/har-12-spec/>. Failed
//! transactions (non-empty error) are omitted.

use crate::capture::{CaptureLog, Transaction};
use crate::errors::{Error, Result};
use http::StatusCode;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use time::format_description::well_known::Rfc3339;

const CREATOR_NAME: &str = "Mozzy Proxy";
const CREATOR_VERSION: &str = env!("CARGO_PKG_VERSION");
const HTTP_VERSION: &str = "HTTP/1.1";

/// Top-level HAR document.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct Har {
  /// The single `log` object.
  pub log: HarLog,
}

/// The `log` object: version, creator and entries.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct HarLog {
  /// Always "1.2".
  pub version: String,
  /// Tool identification.
  pub creator: HarCreator,
  /// One entry per captured transaction.
  pub entries: Vec<HarEntry>,
}

/// Tool that produced the archive.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct HarCreator {
  pub name: String,
  pub version: String,
}

/// One recorded transaction.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct HarEntry {
  #[serde(rename = "startedDateTime")]
  pub started_date_time: String,
  /// Total time in milliseconds.
  pub time: f64,
  pub request: HarRequest,
  pub response: HarResponse,
  pub cache: HarCache,
  pub timings: HarTimings,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct HarRequest {
  pub method: String,
  pub url: String,
  #[serde(rename = "httpVersion")]
  pub http_version: String,
  pub headers: Vec<HarHeader>,
  #[serde(rename = "queryString")]
  pub query_string: Vec<HarQuery>,
  #[serde(rename = "headersSize")]
  pub headers_size: i64,
  #[serde(rename = "bodySize")]
  pub body_size: i64,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct HarResponse {
  pub status: u16,
  #[serde(rename = "statusText")]
  pub status_text: String,
  #[serde(rename = "httpVersion")]
  pub http_version: String,
  pub headers: Vec<HarHeader>,
  pub content: HarContent,
  #[serde(rename = "redirectURL")]
  pub redirect_url: String,
  #[serde(rename = "headersSize")]
  pub headers_size: i64,
  #[serde(rename = "bodySize")]
  pub body_size: i64,
}

/// One name/value pair; multi-valued headers produce one entry per value.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct HarHeader {
  pub name: String,
  pub value: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct HarQuery {
  pub name: String,
  pub value: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct HarContent {
  pub size: i64,
  #[serde(rename = "mimeType")]
  pub mime_type: String,
}

/// Reserved; serializes as `{}`.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct HarCache {}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct HarTimings {
  pub send: f64,
  pub wait: f64,
  pub receive: f64,
}

/// Serialize the capture log as HAR 1.2 and write it to `path` in a single
/// call, pretty-printed with two-space indentation.
pub fn export_har(log: &CaptureLog, path: impl AsRef<Path>) -> Result<()> {
  let har = build_har(log);
  let data = serde_json::to_string_pretty(&har)
    .map_err(|e| Error::export(format!("failed to serialize HAR: {}", e)))?;
  fs::write(path, data)?;
  Ok(())
}

/// Build the HAR document from the log's current snapshot.
pub fn build_har(log: &CaptureLog) -> Har {
  let entries = log
    .snapshot()
    .iter()
    .filter(|t| t.error.is_empty())
    .map(entry_from)
    .collect();

  Har {
    log: HarLog {
      version: "1.2".to_string(),
      creator: HarCreator {
        name: CREATOR_NAME.to_string(),
        version: CREATOR_VERSION.to_string(),
      },
      entries,
    },
  }
}

fn entry_from(transaction: &Transaction) -> HarEntry {
  let headers = transaction
    .headers
    .iter()
    .map(|(name, value)| HarHeader {
      name: name.as_str().to_string(),
      value: String::from_utf8_lossy(value.as_bytes()).to_string(),
    })
    .collect();

  let millis = transaction.duration.as_millis() as f64;

  HarEntry {
    started_date_time: transaction
      .started_at
      .format(&Rfc3339)
      .unwrap_or_default(),
    time: millis,
    request: HarRequest {
      method: transaction.method.clone(),
      url: transaction.url.clone(),
      http_version: HTTP_VERSION.to_string(),
      headers,
      query_string: Vec::new(),
      headers_size: -1,
      body_size: transaction.request_size,
    },
    response: HarResponse {
      status: transaction.status,
      status_text: status_text(transaction.status).to_string(),
      http_version: HTTP_VERSION.to_string(),
      headers: Vec::new(),
      content: HarContent {
        size: transaction.response_size,
        mime_type: "application/octet-stream".to_string(),
      },
      redirect_url: String::new(),
      headers_size: -1,
      body_size: transaction.response_size,
    },
    cache: HarCache {},
    timings: HarTimings {
      send: -1.0,
      wait: millis,
      receive: -1.0,
    },
  }
}

/// Canonical reason phrase for a status code, "Unknown" when there is none.
pub fn status_text(status: u16) -> &'static str {
  StatusCode::from_u16(status)
    .ok()
    .and_then(|s| s.canonical_reason())
    .unwrap_or("Unknown")
}
