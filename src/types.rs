use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Result of checking a request against a compiled rule set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockResult {
    pub should_block: bool,
    pub decision: MatchDecision,
    /// `url-filter` of the rule that decided the outcome.
    pub filter_matched: Option<String>,
    /// Position of that rule in the compiled rule set.
    pub rule_index: Option<usize>,
}

impl BlockResult {
    pub(crate) fn clean() -> Self {
        Self {
            should_block: false,
            decision: MatchDecision::Clean,
            filter_matched: None,
            rule_index: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchDecision {
    /// A block rule matched and no allow rule did.
    Blocked,
    /// An allow rule matched; it overrides any block rule.
    Excepted,
    /// Nothing matched.
    Clean,
}

/// The merged, host-consumable encoding of all active rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledRuleSet {
    pub identifier: String,
    /// JSON content-rule-list document.
    pub encoded_form: String,
    pub rule_count: usize,
}

/// Blocking statistics for one page origin
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageStats {
    pub page_url: String,
    pub blocked_count: u64,
    pub total_requests_seen: u64,
    /// Most recent blocked resource URLs, oldest first.
    pub blocked_resource_urls: VecDeque<String>,
}

impl PageStats {
    pub fn new(page_url: impl Into<String>) -> Self {
        Self {
            page_url: page_url.into(),
            ..Self::default()
        }
    }

    pub fn block_percentage(&self) -> f64 {
        if self.total_requests_seen == 0 {
            0.0
        } else {
            (self.blocked_count as f64 / self.total_requests_seen as f64) * 100.0
        }
    }
}

/// Process-wide counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalStats {
    /// Persists across restarts.
    pub total_blocked: u64,
    /// Reset to zero on every process start.
    pub blocked_this_session: u64,
}
