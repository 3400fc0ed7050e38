//! Error reporting: bounded in-memory ring plus escalation decisions.
//!
//! Every error record in the process funnels through [`Reporter`]. The
//! reporter never publishes or restarts anything itself; it returns a
//! [`ReportOutcome`] and the lifecycle controller acts on it, keeping a
//! single owner for both the broker session and the restart decision.

use std::collections::VecDeque;

use tracing::{error, info, warn};

use crate::config::ErrorPolicy;
use crate::model::{ErrorRecord, Severity};

/// What the caller should do with a just-recorded error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportOutcome {
    /// Forward the record to the system errors channel.
    pub publish: bool,
    /// Fatal severity: the lifecycle controller escalates per policy.
    pub fatal: bool,
}

pub struct Reporter {
    policy: ErrorPolicy,
    ring: VecDeque<ErrorRecord>,
}

impl Reporter {
    pub fn new(policy: ErrorPolicy) -> Self {
        let capacity = policy.ring_capacity;
        Self {
            policy,
            ring: VecDeque::with_capacity(capacity),
        }
    }

    pub fn policy(&self) -> &ErrorPolicy {
        &self.policy
    }

    /// Record one error event. The ring keeps the most recent
    /// `ring_capacity` records; older ones fall off the front.
    pub fn record(&mut self, record: ErrorRecord) -> ReportOutcome {
        match record.severity {
            Severity::Info => {
                info!(source = %record.source, "{}", record.message);
            }
            Severity::Warning => {
                warn!(source = %record.source, "{}", record.message);
            }
            Severity::Error | Severity::Fatal => {
                error!(source = %record.source, severity = %record.severity, "{}", record.message);
            }
        }

        let outcome = ReportOutcome {
            publish: self.policy.post_global_errors && record.severity >= Severity::Warning,
            fatal: record.severity == Severity::Fatal,
        };

        if self.ring.len() >= self.policy.ring_capacity {
            self.ring.pop_front();
        }
        self.ring.push_back(record);

        outcome
    }

    /// Most recent records, oldest first.
    pub fn recent(&self) -> impl Iterator<Item = &ErrorRecord> {
        self.ring.iter()
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn policy(post_global: bool, capacity: usize) -> ErrorPolicy {
        ErrorPolicy {
            post_global_errors: post_global,
            auto_restart_on_error: true,
            ring_capacity: capacity,
        }
    }

    #[test]
    fn ring_is_bounded_and_keeps_newest() {
        let mut reporter = Reporter::new(policy(false, 3));

        for i in 0..5 {
            reporter.record(ErrorRecord::error("test", format!("e{i}")));
        }

        assert_eq!(reporter.len(), 3);
        let messages: Vec<_> = reporter.recent().map(|r| r.message.as_str()).collect();
        assert_eq!(messages, vec!["e2", "e3", "e4"]);
    }

    #[test]
    fn zero_capacity_ring_stays_bounded() {
        // Config validation enforces a floor of 1, but a hand-built
        // policy does not pass through it.
        let mut reporter = Reporter::new(policy(false, 0));

        for i in 0..5 {
            reporter.record(ErrorRecord::error("test", format!("e{i}")));
        }

        assert_eq!(reporter.len(), 1);
        assert_eq!(reporter.recent().next().map(|r| r.message.as_str()), Some("e4"));
    }

    #[test]
    fn publish_gated_by_policy_and_severity() {
        let mut on = Reporter::new(policy(true, 8));
        assert!(!on.record(ErrorRecord::new("t", Severity::Info, "i")).publish);
        assert!(on.record(ErrorRecord::warning("t", "w")).publish);
        assert!(on.record(ErrorRecord::error("t", "e")).publish);

        let mut off = Reporter::new(policy(false, 8));
        assert!(!off.record(ErrorRecord::error("t", "e")).publish);
    }

    #[test]
    fn fatal_flag_is_independent_of_publish_gate() {
        let mut reporter = Reporter::new(policy(false, 8));
        let outcome = reporter.record(ErrorRecord::fatal("link", "retries exhausted"));
        assert!(outcome.fatal);
        assert!(!outcome.publish);

        let outcome = reporter.record(ErrorRecord::error("sensor:s1", "read failed"));
        assert!(!outcome.fatal);
    }
}
