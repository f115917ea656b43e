//! Validation-message bookkeeping.
//!
//! Drivers and validation layers repeat themselves; a [`Diagnostics`] value
//! logs each message id a bounded number of times and then just counts.
//! One instance belongs to one device wrapper, so two devices in one process
//! never share counters.

use hashbrown::HashMap;
use tracing::{debug, error, info, warn};

/// How often a message id is logged before it is suppressed.
pub const DEFAULT_REPORT_LIMIT: u32 = 10;

/// Severity of a reported message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticLevel {
    Info,
    Warning,
    Error,
}

/// Per-message-id suppression counters.
pub struct Diagnostics {
    limit: u32,
    counts: HashMap<String, u32>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_REPORT_LIMIT)
    }

    pub fn with_limit(limit: u32) -> Self {
        Self {
            limit,
            counts: HashMap::new(),
        }
    }

    /// Record a message. Returns `true` if it was logged, `false` once the
    /// id's limit is exhausted.
    pub fn report(&mut self, level: DiagnosticLevel, message_id: &str, message: &str) -> bool {
        let count = self.counts.entry_ref(message_id).or_insert(0);
        *count += 1;
        if *count > self.limit {
            return false;
        }
        match level {
            DiagnosticLevel::Info => debug!(id = message_id, "{message}"),
            DiagnosticLevel::Warning => warn!(id = message_id, "{message}"),
            DiagnosticLevel::Error => error!(id = message_id, "{message}"),
        }
        if *count == self.limit {
            debug!(id = message_id, "further reports suppressed");
        }
        true
    }

    /// Total number of reports that were swallowed across all ids.
    pub fn suppressed_total(&self) -> u64 {
        self.counts
            .values()
            .map(|&count| u64::from(count.saturating_sub(self.limit)))
            .sum()
    }

    /// How many distinct message ids have been seen.
    pub fn unique_messages(&self) -> usize {
        self.counts.len()
    }
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Diagnostics {
    fn drop(&mut self) {
        let suppressed = self.suppressed_total();
        if suppressed > 0 {
            info!(
                suppressed,
                unique = self.counts.len(),
                "suppressed validation reports"
            );
        }
    }
}
