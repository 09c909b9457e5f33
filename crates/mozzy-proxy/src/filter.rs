//! Capture filter predicates
//!
//! Filtering suppresses logging and display only; suppressed requests are
//! still forwarded.

/// Three AND-composed predicates over a finished transaction.
#[derive(Debug, Clone, Default)]
pub struct CaptureFilter {
  /// Substring match against the request host; `None` matches all hosts.
  pub domain: Option<String>,
  /// Allowed methods; empty allows all.
  pub methods: Vec<String>,
  /// Keep only error responses (status >= 400) and failed dispatches.
  pub errors_only: bool,
}

impl CaptureFilter {
  /// True when the transaction must be kept out of the log and the
  /// terminal output.
  ///
  /// A status of 0 marks a failed dispatch and counts as an error for the
  /// errors-only predicate.
  pub fn suppresses(&self, method: &str, host: &str, status: u16) -> bool {
    if let Some(domain) = &self.domain {
      if !host.contains(domain.as_str()) {
        return true;
      }
    }
    if !self.methods.is_empty()
      && !self
        .methods
        .iter()
        .any(|m| m.eq_ignore_ascii_case(method))
    {
      return true;
    }
    if self.errors_only && status != 0 && status < 400 {
      return true;
    }
    false
  }

  /// True when no predicate is configured.
  pub fn is_empty(&self) -> bool {
    self.domain.is_none() && self.methods.is_empty() && !self.errors_only
  }
}
