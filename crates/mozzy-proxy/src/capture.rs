//! Capture log for observed transactions
//!
//! Append-only, bounded, with copy-on-read snapshots so readers never
//! iterate under the lock.

use http::HeaderMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use time::OffsetDateTime;

/// Maximum number of retained records; the oldest are dropped FIFO.
pub const CAPTURE_CAPACITY: usize = 10_000;

/// One observed request/response pair, or a failed dispatch.
#[derive(Debug, Clone)]
pub struct Transaction {
  /// Monotonic id, assigned at dispatch start.
  pub id: u64,
  /// Wall clock at dispatch start.
  pub started_at: OffsetDateTime,
  /// Request method.
  pub method: String,
  /// Absolute request URL.
  pub url: String,
  /// Request host (as presented by the client).
  pub host: String,
  /// Request path.
  pub path: String,
  /// Response status, or 0 when the request failed before a response.
  pub status: u16,
  /// Dispatch-to-response time.
  pub duration: Duration,
  /// Request size from `Content-Length`.
  pub request_size: i64,
  /// Response size as measured while relaying the body.
  pub response_size: i64,
  /// Request headers as observed (owned copy).
  pub headers: HeaderMap,
  /// Failure message; empty on success.
  pub error: String,
}

#[derive(Default)]
struct LogInner {
  next_id: u64,
  entries: VecDeque<Transaction>,
}

/// Thread-safe transaction log.
///
/// One mutex covers both the entries and the id counter; appends are short
/// and readers copy out, so contention stays negligible at proxy rates.
#[derive(Default)]
pub struct CaptureLog {
  inner: Mutex<LogInner>,
}

impl CaptureLog {
  /// Create an empty log.
  pub fn new() -> Self {
    Self::default()
  }

  /// Assign the next transaction id.
  pub fn next_id(&self) -> u64 {
    let mut inner = self.inner.lock();
    inner.next_id += 1;
    inner.next_id
  }

  /// Append a record, dropping the oldest when the cap is reached.
  pub fn append(&self, transaction: Transaction) {
    let mut inner = self.inner.lock();
    if inner.entries.len() == CAPTURE_CAPACITY {
      inner.entries.pop_front();
    }
    inner.entries.push_back(transaction);
  }

  /// A defensive copy of the current entries, in insertion order.
  pub fn snapshot(&self) -> Vec<Transaction> {
    self.inner.lock().entries.iter().cloned().collect()
  }

  /// Drop all entries. The id counter keeps running.
  pub fn clear(&self) {
    self.inner.lock().entries.clear();
  }

  /// Number of retained entries.
  pub fn len(&self) -> usize {
    self.inner.lock().entries.len()
  }

  /// True when no entries are retained.
  pub fn is_empty(&self) -> bool {
    self.inner.lock().entries.is_empty()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn transaction(id: u64) -> Transaction {
    Transaction {
      id,
      started_at: OffsetDateTime::now_utc(),
      method: "GET".to_string(),
      url: format!("http://example.test/{}", id),
      host: "example.test".to_string(),
      path: format!("/{}", id),
      status: 200,
      duration: Duration::from_millis(5),
      request_size: 0,
      response_size: 0,
      headers: HeaderMap::new(),
      error: String::new(),
    }
  }

  #[test]
  fn ids_are_monotonic() {
    let log = CaptureLog::new();
    let a = log.next_id();
    let b = log.next_id();
    let c = log.next_id();
    assert!(a < b && b < c);
  }

  #[test]
  fn snapshot_is_a_copy() {
    let log = CaptureLog::new();
    log.append(transaction(1));
    let snapshot = log.snapshot();
    log.clear();
    assert_eq!(snapshot.len(), 1);
    assert!(log.is_empty());
  }

  #[test]
  fn capacity_drops_oldest_first() {
    let log = CaptureLog::new();
    for id in 1..=(CAPTURE_CAPACITY as u64) {
      log.append(transaction(id));
    }
    assert_eq!(log.len(), CAPTURE_CAPACITY);

    log.append(transaction(CAPTURE_CAPACITY as u64 + 1));
    let snapshot = log.snapshot();
    assert_eq!(snapshot.len(), CAPTURE_CAPACITY);
    assert_eq!(snapshot.first().map(|t| t.id), Some(2));
    assert_eq!(
      snapshot.last().map(|t| t.id),
      Some(CAPTURE_CAPACITY as u64 + 1)
    );
  }

  #[test]
  fn clear_resets_entries() {
    let log = CaptureLog::new();
    log.append(transaction(1));
    log.append(transaction(2));
    log.clear();
    assert!(log.is_empty());
    // The counter does not restart.
    assert!(log.next_id() > 0);
  }
}
