use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, info, warn};

use crate::error::{AdBlockError, Result, RuleParseError};
use crate::rules::{RuleRecord, parse_rule};

/// Where a filter list comes from
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FilterSource {
    pub id: String,
    pub source_uri: String,
    pub display_name: String,
}

impl FilterSource {
    pub fn new(
        id: impl Into<String>,
        source_uri: impl Into<String>,
        display_name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            source_uri: source_uri.into(),
            display_name: display_name.into(),
        }
    }

    pub fn easylist() -> Self {
        Self::new("easylist", "https://easylist.to/easylist/easylist.txt", "EasyList")
    }

    pub fn easyprivacy() -> Self {
        Self::new("easyprivacy", "https://easylist.to/easylist/easyprivacy.txt", "EasyPrivacy")
    }
}

/// Raw list text as delivered by a fetch collaborator
#[derive(Debug, Clone)]
pub struct FetchedList {
    pub raw_text: String,
    pub last_updated: SystemTime,
}

/// Fetch collaborator. Implementations live outside the core.
#[async_trait]
pub trait FilterListFetcher: Send + Sync {
    /// Fails with `AdBlockError::SourceUnreachable` when the source cannot be read.
    async fn fetch(&self, source: &FilterSource) -> Result<FetchedList>;
}

/// A registered filter list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterList {
    pub id: String,
    pub source_uri: String,
    pub display_name: String,
    pub enabled: bool,
    pub raw_text: Arc<str>,
    pub last_updated: SystemTime,
}

impl FilterList {
    pub fn source(&self) -> FilterSource {
        FilterSource::new(&self.id, &self.source_uri, &self.display_name)
    }
}

/// Rules parsed out of one list's text, plus the lines that were skipped.
#[derive(Debug, Default)]
pub struct ParsedList {
    records: Vec<RuleRecord>,
    errors: Vec<RuleParseError>,
}

impl ParsedList {
    pub fn parse(text: &str) -> Self {
        let mut parsed = Self::default();
        for (idx, line) in text.lines().enumerate() {
            match parse_rule(line) {
                Ok(Some(record)) => parsed.records.push(record),
                Ok(None) => {}
                Err(e) => parsed.errors.push(e.at_line(idx + 1)),
            }
        }
        parsed
    }

    pub fn records(&self) -> &[RuleRecord] {
        &self.records
    }

    pub fn errors(&self) -> &[RuleParseError] {
        &self.errors
    }

    /// Content was present but none of it was a rule.
    fn is_unrecognized(&self) -> bool {
        self.records.is_empty() && !self.errors.is_empty()
    }
}

struct Entry {
    list: FilterList,
    seq: u64,
    parsed: Arc<ParsedList>,
}

/// Owns raw list sources and their parsed records.
///
/// Records are parsed when text arrives and cached until the text changes.
#[derive(Default)]
pub struct FilterListStore {
    entries: HashMap<String, Entry>,
    next_seq: u64,
}

impl FilterListStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_list(
        &mut self,
        source: FilterSource,
        raw_text: impl Into<String>,
        last_updated: SystemTime,
    ) -> Result<FilterList> {
        if self.entries.contains_key(&source.id) {
            return Err(AdBlockError::DuplicateList(source.id));
        }

        let raw_text: String = raw_text.into();
        let raw_text: Arc<str> = raw_text.into();
        let parsed = Self::parse_checked(&source.id, &raw_text)?;

        let list = FilterList {
            id: source.id,
            source_uri: source.source_uri,
            display_name: source.display_name,
            enabled: true,
            raw_text,
            last_updated,
        };

        info!(
            "Registered filter list '{}' with {} rules ({} lines skipped)",
            list.id,
            parsed.records.len(),
            parsed.errors.len()
        );

        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(
            list.id.clone(),
            Entry {
                list: list.clone(),
                seq,
                parsed,
            },
        );
        Ok(list)
    }

    /// Replaces a list's text. Returns whether the text changed; unchanged
    /// text only refreshes the timestamp and keeps the cached records.
    pub fn ingest(
        &mut self,
        id: &str,
        raw_text: impl Into<String>,
        last_updated: SystemTime,
    ) -> Result<bool> {
        let entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| AdBlockError::UnknownList(id.to_string()))?;

        let raw_text: String = raw_text.into();
        if *entry.list.raw_text == *raw_text {
            debug!("Filter list '{}' unchanged", id);
            entry.list.last_updated = last_updated;
            return Ok(false);
        }

        // On failure the previous text, records and timestamp stay in place.
        let parsed = Self::parse_checked(id, &raw_text)?;
        info!(
            "Filter list '{}' updated: {} rules ({} lines skipped)",
            id,
            parsed.records.len(),
            parsed.errors.len()
        );
        entry.list.raw_text = raw_text.into();
        entry.list.last_updated = last_updated;
        entry.parsed = parsed;
        Ok(true)
    }

    pub fn remove_list(&mut self, id: &str) -> Result<FilterList> {
        self.entries
            .remove(id)
            .map(|entry| entry.list)
            .ok_or_else(|| AdBlockError::UnknownList(id.to_string()))
    }

    /// Returns whether the flag changed.
    pub fn set_enabled(&mut self, id: &str, enabled: bool) -> Result<bool> {
        let entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| AdBlockError::UnknownList(id.to_string()))?;
        let changed = entry.list.enabled != enabled;
        entry.list.enabled = enabled;
        Ok(changed)
    }

    pub fn get(&self, id: &str) -> Option<&FilterList> {
        self.entries.get(id).map(|entry| &entry.list)
    }

    pub fn parsed(&self, id: &str) -> Option<Arc<ParsedList>> {
        self.entries.get(id).map(|entry| entry.parsed.clone())
    }

    /// All lists in registration order.
    pub fn lists(&self) -> Vec<FilterList> {
        self.ordered().map(|entry| entry.list.clone()).collect()
    }

    /// Records of every enabled list, in registration order. The snapshot
    /// owns its data and can be iterated any number of times.
    pub fn all_enabled_records(&self) -> RecordSnapshot {
        RecordSnapshot {
            lists: self
                .ordered()
                .filter(|entry| entry.list.enabled)
                .map(|entry| entry.parsed.clone())
                .collect(),
        }
    }

    fn ordered(&self) -> impl Iterator<Item = &Entry> {
        let mut entries: Vec<&Entry> = self.entries.values().collect();
        entries.sort_by(|a, b| a.seq.cmp(&b.seq).then_with(|| a.list.id.cmp(&b.list.id)));
        entries.into_iter()
    }

    fn parse_checked(id: &str, raw_text: &str) -> Result<Arc<ParsedList>> {
        let parsed = ParsedList::parse(raw_text);
        if parsed.is_unrecognized() {
            warn!("Filter list '{}' contains no recognizable rules", id);
            return Err(AdBlockError::Parse {
                list: id.to_string(),
                source: parsed.errors[0].clone(),
            });
        }
        for error in parsed.errors.iter().take(5) {
            debug!("Skipping line in '{}': {}", id, error);
        }
        Ok(Arc::new(parsed))
    }
}

/// Owned, restartable view over the records of the enabled lists
#[derive(Debug, Clone, Default)]
pub struct RecordSnapshot {
    lists: Vec<Arc<ParsedList>>,
}

impl RecordSnapshot {
    pub fn iter(&self) -> impl Iterator<Item = &RuleRecord> {
        self.lists.iter().flat_map(|list| list.records.iter())
    }

    pub fn len(&self) -> usize {
        self.lists.iter().map(|list| list.records.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<'a> IntoIterator for &'a RecordSnapshot {
    type Item = &'a RuleRecord;
    type IntoIter = Box<dyn Iterator<Item = &'a RuleRecord> + 'a>;

    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.iter())
    }
}

/// Bumped whenever the bundled rules below change.
pub const MINIMAL_RULES_VERSION: u32 = 1;

/// Bundled fallback rules covering the most common ad and tracker hosts
pub struct MinimalRules;

impl MinimalRules {
    const LINES: &'static [&'static str] = &[
        // Google Analytics & Ads
        "||google-analytics.com^",
        "||googletagmanager.com^",
        "||googlesyndication.com^",
        "||doubleclick.net^",
        "||googleadservices.com^",
        // Facebook
        "||facebook.com/tr^",
        "||connect.facebook.net^",
        // Amazon
        "||amazon-adsystem.com^",
        // Other major trackers
        "||scorecardresearch.com^",
        "||quantserve.com^",
        "||outbrain.com^",
        "||taboola.com^",
        "||adsystem.com^",
        "||ads.yahoo.com^",
        "||advertising.com^",
        // Analytics
        "||hotjar.com^",
        "||mixpanel.com^",
        "||segment.com^",
        "||amplitude.com^",
    ];

    pub fn lines() -> &'static [&'static str] {
        Self::LINES
    }

    pub fn records() -> Vec<RuleRecord> {
        ParsedList::parse(&Self::LINES.join("\n")).records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn source(id: &str) -> FilterSource {
        FilterSource::new(id, format!("https://lists.example/{id}.txt"), id)
    }

    #[test]
    fn test_malformed_line_is_skipped() {
        let mut text: Vec<String> = (0..100).map(|i| format!("||ads{i}.example^")).collect();
        text.insert(50, "example.com##.banner".to_string());

        let mut store = FilterListStore::new();
        store.add_list(source("l1"), text.join("\n"), SystemTime::now()).unwrap();

        let parsed = store.parsed("l1").unwrap();
        assert_eq!(parsed.records().len(), 100);
        assert_eq!(parsed.errors().len(), 1);
        assert_eq!(parsed.errors()[0].line, 51);
    }

    #[test]
    fn test_unrecognizable_list_is_rejected() {
        let mut store = FilterListStore::new();
        let err = store
            .add_list(source("html"), "<html>\n<body>oops</body>", SystemTime::now())
            .unwrap_err();
        assert!(matches!(err, AdBlockError::Parse { .. }));
        assert!(store.get("html").is_none());

        store.add_list(source("empty"), "! only a comment", SystemTime::now()).unwrap();
        assert!(store.all_enabled_records().is_empty());
    }

    #[test]
    fn test_registration_order_and_enablement() {
        let mut store = FilterListStore::new();
        store.add_list(source("zeta"), "||first.example^", SystemTime::now()).unwrap();
        store.add_list(source("alpha"), "||second.example^", SystemTime::now()).unwrap();

        let hosts: Vec<_> = store
            .all_enabled_records()
            .iter()
            .filter_map(|r| r.anchor_host().map(str::to_string))
            .collect();
        assert_eq!(hosts, vec!["first.example", "second.example"]);

        assert!(store.set_enabled("zeta", false).unwrap());
        assert!(!store.set_enabled("zeta", false).unwrap());
        let snapshot = store.all_enabled_records();
        assert_eq!(snapshot.len(), 1);
        // restartable
        assert_eq!(snapshot.iter().count(), snapshot.iter().count());
    }

    #[test]
    fn test_ingest_invalidates_cache_only_on_change() {
        let at = |secs| SystemTime::UNIX_EPOCH + Duration::from_secs(secs);
        let mut store = FilterListStore::new();
        store.add_list(source("l1"), "||a.example^", at(1)).unwrap();
        let before = store.parsed("l1").unwrap();

        assert!(!store.ingest("l1", "||a.example^", at(2)).unwrap());
        assert!(Arc::ptr_eq(&before, &store.parsed("l1").unwrap()));
        assert_eq!(store.get("l1").unwrap().last_updated, at(2));

        assert!(store.ingest("l1", "||a.example^\n||b.example^", at(3)).unwrap());
        assert_eq!(store.parsed("l1").unwrap().records().len(), 2);
        assert_eq!(store.get("l1").unwrap().last_updated, at(3));

        // unusable text keeps the stale list and its timestamp
        assert!(store.ingest("l1", "garbage here", at(4)).is_err());
        assert_eq!(store.parsed("l1").unwrap().records().len(), 2);
        assert_eq!(store.get("l1").unwrap().last_updated, at(3));

        assert!(matches!(
            store.ingest("missing", "", at(5)),
            Err(AdBlockError::UnknownList(_))
        ));
    }

    #[test]
    fn test_duplicate_and_remove() {
        let mut store = FilterListStore::new();
        store.add_list(source("l1"), "", SystemTime::now()).unwrap();
        assert!(matches!(
            store.add_list(source("l1"), "", SystemTime::now()),
            Err(AdBlockError::DuplicateList(_))
        ));
        assert_eq!(store.remove_list("l1").unwrap().id, "l1");
        assert!(store.remove_list("l1").is_err());
    }

    #[test]
    fn test_minimal_rules_all_parse() {
        assert_eq!(MinimalRules::records().len(), MinimalRules::lines().len());
    }
}
