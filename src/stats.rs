use std::collections::HashMap;
use tracing::debug;
use url::Url;

use crate::types::{GlobalStats, PageStats};

pub const DEFAULT_MAX_BLOCKED_URLS: usize = 500;

/// Reduces a page URL to its origin (`scheme://host[:port]`). Unparsable
/// input is used as-is.
pub fn page_key(page_url: &str) -> String {
    match Url::parse(page_url) {
        Ok(url) if url.has_host() => url.origin().ascii_serialization(),
        _ => page_url.trim().to_lowercase(),
    }
}

/// Per-page and global block counters.
///
/// Mutation takes `&mut self`, so a single owner serializes every update and
/// no increment can be lost.
#[derive(Debug)]
pub struct StatisticsLedger {
    pages: HashMap<String, PageStats>,
    global: GlobalStats,
    max_blocked_urls: usize,
}

impl Default for StatisticsLedger {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BLOCKED_URLS)
    }
}

impl StatisticsLedger {
    pub fn new(max_blocked_urls: usize) -> Self {
        Self {
            pages: HashMap::new(),
            global: GlobalStats::default(),
            max_blocked_urls: max_blocked_urls.max(1),
        }
    }

    /// Seeds the persisted total; the session counter starts from zero.
    pub fn restore_total(&mut self, total_blocked: u64) {
        self.global = GlobalStats {
            total_blocked,
            blocked_this_session: 0,
        };
    }

    pub fn record_blocked(&mut self, request_url: &str, page_url: &str) {
        self.global.total_blocked += 1;
        self.global.blocked_this_session += 1;

        let max = self.max_blocked_urls;
        let page = self.page_mut(page_url);
        page.blocked_count += 1;
        page.blocked_resource_urls.push_back(request_url.to_string());
        while page.blocked_resource_urls.len() > max {
            page.blocked_resource_urls.pop_front();
        }

        debug!("Blocked {} on {} ({} on page)", request_url, page.page_url, page.blocked_count);
    }

    /// Creates the page row if absent. Counts are untouched.
    pub fn record_seen(&mut self, page_url: &str) {
        self.page_mut(page_url);
    }

    /// Counts one evaluated request against the page.
    pub fn record_evaluated(&mut self, page_url: &str) {
        self.page_mut(page_url).total_requests_seen += 1;
    }

    /// Empty record when the page was never observed.
    pub fn page_stats(&self, page_url: &str) -> PageStats {
        self.pages
            .get(&page_key(page_url))
            .cloned()
            .unwrap_or_else(|| PageStats::new(page_url))
    }

    pub fn global_stats(&self) -> GlobalStats {
        self.global
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Drops every page row; global counters are kept.
    pub fn clear_history(&mut self) {
        self.pages.clear();
    }

    fn page_mut(&mut self, page_url: &str) -> &mut PageStats {
        self.pages
            .entry(page_key(page_url))
            .or_insert_with(|| PageStats::new(page_url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocked_request_is_attributed_to_page() {
        let mut ledger = StatisticsLedger::default();
        ledger.record_blocked("https://t.ads.example/p.js", "https://news.example/article");

        let stats = ledger.page_stats("https://news.example/article");
        assert_eq!(stats.blocked_count, 1);
        assert!(stats.blocked_resource_urls.contains(&"https://t.ads.example/p.js".to_string()));

        let global = ledger.global_stats();
        assert_eq!(global.total_blocked, 1);
        assert_eq!(global.blocked_this_session, 1);
    }

    #[test]
    fn test_pages_are_keyed_by_origin() {
        let mut ledger = StatisticsLedger::default();
        ledger.record_blocked("https://t.example/a.js", "https://News.Example/one");
        ledger.record_blocked("https://t.example/b.js", "https://news.example/two?x=1");
        assert_eq!(ledger.page_count(), 1);
        assert_eq!(ledger.page_stats("https://news.example/").blocked_count, 2);
    }

    #[test]
    fn test_seen_creates_row_without_counting() {
        let mut ledger = StatisticsLedger::default();
        ledger.record_seen("https://quiet.example/");
        assert_eq!(ledger.page_count(), 1);
        let stats = ledger.page_stats("https://quiet.example/");
        assert_eq!(stats.blocked_count, 0);
        assert_eq!(stats.total_requests_seen, 0);

        ledger.record_evaluated("https://quiet.example/");
        assert_eq!(ledger.page_stats("https://quiet.example/").total_requests_seen, 1);
    }

    #[test]
    fn test_unknown_page_is_empty() {
        let ledger = StatisticsLedger::default();
        let stats = ledger.page_stats("https://never.example/");
        assert_eq!(stats.page_url, "https://never.example/");
        assert_eq!(stats.blocked_count, 0);
        assert!(stats.blocked_resource_urls.is_empty());
    }

    #[test]
    fn test_blocked_urls_are_bounded() {
        let mut ledger = StatisticsLedger::new(3);
        for i in 0..5 {
            ledger.record_blocked(&format!("https://t.example/{i}.js"), "https://page.example/");
        }
        let stats = ledger.page_stats("https://page.example/");
        assert_eq!(stats.blocked_count, 5);
        assert_eq!(
            Vec::from(stats.blocked_resource_urls),
            vec!["https://t.example/2.js", "https://t.example/3.js", "https://t.example/4.js"]
        );
    }

    #[test]
    fn test_restore_total_resets_session() {
        let mut ledger = StatisticsLedger::default();
        ledger.restore_total(41);
        ledger.record_blocked("https://t.example/a.js", "https://page.example/");
        let global = ledger.global_stats();
        assert_eq!(global.total_blocked, 42);
        assert_eq!(global.blocked_this_session, 1);
        assert!(global.blocked_this_session <= global.total_blocked);

        ledger.clear_history();
        assert_eq!(ledger.page_count(), 0);
        assert_eq!(ledger.global_stats(), global);
    }
}
