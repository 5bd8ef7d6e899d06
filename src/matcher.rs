//! Host-side matching subsystem: the encoded content-rule-list format and the
//! matcher built from it.
//!
//! An encoded rule set is a JSON array of trigger/action objects:
//!
//! ```json
//! [{"trigger": {"url-filter": "^https?://([^/?#]*\\.)?ads\\.example",
//!               "if-domain": ["news.example"]},
//!   "action": {"type": "block"}}]
//! ```
//!
//! Precedence: any matching `ignore-previous-rules` (allow) rule overrides all
//! matching block rules. Among block rules, the one whose matching
//! `if-domain` entry is longest wins; ties go to the earliest rule.

use regex::{RegexSet, RegexSetBuilder};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use url::Url;

use crate::error::{AdBlockError, Result};
use crate::rules::ResourceTypeMask;
use crate::types::{BlockResult, MatchDecision};
use crate::whitelist::{apex_domain, host_matches};

pub(crate) const SCHEME: &str = r"^[a-z][a-z0-9+.\-]*://";
pub(crate) const SUBDOMAINS: &str = r"(?:[^/?#]*\.)?";
pub(crate) const SEPARATOR: &str = r"(?:[^a-z0-9_.%\-]|$)";

/// `url-filter` matching `host` and its subdomains.
pub fn host_anchor_filter(host: &str) -> String {
    format!("{SCHEME}{SUBDOMAINS}{}{SEPARATOR}", regex::escape(host))
}

/// The host of a filter produced by [`host_anchor_filter`], if it has
/// exactly that shape.
fn anchored_host(filter: &str) -> Option<String> {
    let escaped = filter
        .strip_prefix(SCHEME)?
        .strip_prefix(SUBDOMAINS)?
        .strip_suffix(SEPARATOR)?;

    let mut host = String::with_capacity(escaped.len());
    let mut chars = escaped.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next()? {
                c @ ('.' | '-') => host.push(c),
                _ => return None,
            },
            c if c.is_ascii_alphanumeric() || c == '_' => host.push(c.to_ascii_lowercase()),
            _ => return None,
        }
    }
    (!host.is_empty()).then_some(host)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedRule {
    pub trigger: Trigger,
    pub action: RuleAction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Trigger {
    pub url_filter: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resource_type: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub if_domain: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unless_domain: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub load_type: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RuleAction {
    Block,
    IgnorePreviousRules,
}

/// Limits the matching subsystem enforces when accepting a rule set.
///
/// Plain host-anchor rules are looked up by host and never enter the regex
/// set, so `regex_size_limit` only bounds the remaining pattern rules. A set
/// made mostly of path or wildcard patterns can hit the size limit well
/// before `max_rules`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatcherLimits {
    pub max_rules: usize,
    /// Compiled regex size limit in bytes.
    pub regex_size_limit: usize,
}

impl Default for MatcherLimits {
    fn default() -> Self {
        Self {
            max_rules: 150_000,
            regex_size_limit: 256 * 1024 * 1024,
        }
    }
}

/// A network request as seen by the matcher
#[derive(Debug, Clone)]
pub struct Request {
    url: String,
    host: String,
    page_host: Option<String>,
    resource_type: ResourceTypeMask,
    third_party: bool,
}

impl Request {
    /// `source_url` is the page that issued the request; empty when unknown.
    /// Unknown request types are treated as `other`.
    pub fn new(url: &str, source_url: &str, request_type: &str) -> Result<Self> {
        let parsed = Url::parse(url)?;
        let host = parsed.host_str().unwrap_or_default().to_lowercase();
        let page_host = Url::parse(source_url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_lowercase));

        let third_party = page_host
            .as_deref()
            .map(|page| apex_domain(page) != apex_domain(&host))
            .unwrap_or(false);

        Ok(Self {
            url: parsed.to_string(),
            host,
            page_host,
            resource_type: ResourceTypeMask::from_type_name(request_type)
                .unwrap_or(ResourceTypeMask::OTHER),
            third_party,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn is_third_party(&self) -> bool {
        self.third_party
    }
}

#[derive(Debug)]
struct RuleConditions {
    url_filter: String,
    allow: bool,
    resource_types: ResourceTypeMask,
    if_domain: Vec<String>,
    unless_domain: Vec<String>,
    third_party_only: bool,
}

impl RuleConditions {
    /// Specificity of the match, or `None` when the request is out of scope.
    fn applies_to(&self, request: &Request) -> Option<usize> {
        if !self.resource_types.contains(request.resource_type) {
            return None;
        }
        if self.third_party_only && !request.third_party {
            return None;
        }

        let page = request.page_host.as_deref();
        if let Some(page) = page {
            if self.unless_domain.iter().any(|d| host_matches(page, d)) {
                return None;
            }
        }

        if self.if_domain.is_empty() {
            return Some(0);
        }
        let page = page?;
        self.if_domain
            .iter()
            .filter(|d| host_matches(page, d))
            .map(|d| d.len())
            .max()
    }
}

/// Matcher over one encoded rule set.
#[derive(Debug)]
pub struct RuleMatcher {
    filters: RegexSet,
    /// Rule index of each pattern in `filters`.
    pattern_rules: Vec<usize>,
    /// Host-anchor rules keyed by host, indices ascending.
    host_rules: HashMap<String, Vec<usize>>,
    conditions: Vec<RuleConditions>,
}

impl RuleMatcher {
    /// Decodes and validates an encoded rule set. This is the only place a
    /// rule set can be rejected.
    pub fn from_encoded(identifier: &str, encoded: &str, limits: &MatcherLimits) -> Result<Self> {
        let rules: Vec<EncodedRule> = serde_json::from_str(encoded)
            .map_err(|e| {
                AdBlockError::compilation(identifier, format!("malformed rule list: {e}"))
            })?;

        if rules.len() > limits.max_rules {
            return Err(AdBlockError::compilation(
                identifier,
                format!("{} rules exceed the limit of {}", rules.len(), limits.max_rules),
            ));
        }

        let mut conditions = Vec::with_capacity(rules.len());
        for (idx, rule) in rules.iter().enumerate() {
            let mut resource_types = ResourceTypeMask::empty();
            for name in &rule.trigger.resource_type {
                resource_types |= ResourceTypeMask::from_type_name(name).ok_or_else(|| {
                    AdBlockError::compilation(
                        identifier,
                        format!("rule {idx}: unknown resource type '{name}'"),
                    )
                })?;
            }
            if resource_types.is_empty() {
                resource_types = ResourceTypeMask::all();
            }

            let third_party_only = match rule.trigger.load_type.as_slice() {
                [] => false,
                [kind] if kind == "third-party" => true,
                other => {
                    return Err(AdBlockError::compilation(
                        identifier,
                        format!("rule {idx}: unsupported load-type {other:?}"),
                    ));
                }
            };

            conditions.push(RuleConditions {
                url_filter: rule.trigger.url_filter.clone(),
                allow: rule.action == RuleAction::IgnorePreviousRules,
                resource_types,
                if_domain: rule.trigger.if_domain.clone(),
                unless_domain: rule.trigger.unless_domain.clone(),
                third_party_only,
            });
        }

        let mut host_rules: HashMap<String, Vec<usize>> = HashMap::new();
        let mut pattern_rules = Vec::new();
        for (idx, rule) in rules.iter().enumerate() {
            match anchored_host(&rule.trigger.url_filter) {
                Some(host) => host_rules.entry(host).or_default().push(idx),
                None => pattern_rules.push(idx),
            }
        }

        let patterns = pattern_rules.iter().map(|&idx| rules[idx].trigger.url_filter.as_str());
        let filters = RegexSetBuilder::new(patterns)
            .case_insensitive(true)
            .size_limit(limits.regex_size_limit)
            .build()
            .map_err(|e| AdBlockError::compilation(identifier, e))?;

        Ok(Self {
            filters,
            pattern_rules,
            host_rules,
            conditions,
        })
    }

    pub fn rule_count(&self) -> usize {
        self.conditions.len()
    }

    /// Rules evaluated through the regex set rather than the host index.
    pub fn pattern_rule_count(&self) -> usize {
        self.pattern_rules.len()
    }

    /// Indices of every rule whose filter matches the request, ascending.
    fn candidates(&self, request: &Request) -> Vec<usize> {
        let mut found: Vec<usize> = self
            .filters
            .matches(&request.url)
            .into_iter()
            .map(|i| self.pattern_rules[i])
            .collect();

        let mut suffix = request.host.as_str();
        loop {
            if let Some(rules) = self.host_rules.get(suffix) {
                found.extend_from_slice(rules);
            }
            match suffix.find('.') {
                Some(dot) => suffix = &suffix[dot + 1..],
                None => break,
            }
        }

        found.sort_unstable();
        found
    }

    /// Check a request against the rule set
    pub fn check(&self, request: &Request) -> BlockResult {
        let mut best_block: Option<(usize, usize)> = None;

        for idx in self.candidates(request) {
            let rule = &self.conditions[idx];
            let Some(specificity) = rule.applies_to(request) else {
                continue;
            };

            if rule.allow {
                return BlockResult {
                    should_block: false,
                    decision: MatchDecision::Excepted,
                    filter_matched: Some(rule.url_filter.clone()),
                    rule_index: Some(idx),
                };
            }

            // Indices arrive in ascending order, so strict comparison keeps the earliest.
            if best_block.is_none_or(|(_, best)| specificity > best) {
                best_block = Some((idx, specificity));
            }
        }

        match best_block {
            Some((idx, _)) => BlockResult {
                should_block: true,
                decision: MatchDecision::Blocked,
                filter_matched: Some(self.conditions[idx].url_filter.clone()),
                rule_index: Some(idx),
            },
            None => BlockResult::clean(),
        }
    }

    /// Convenience wrapper parsing the request first.
    pub fn check_url(
        &self,
        url: &str,
        source_url: &str,
        request_type: &str,
    ) -> Result<BlockResult> {
        let request = Request::new(url, source_url, request_type)?;
        Ok(self.check(&request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(rules: serde_json::Value) -> String {
        rules.to_string()
    }

    fn matcher(rules: serde_json::Value) -> RuleMatcher {
        RuleMatcher::from_encoded("test", &encoded(rules), &MatcherLimits::default()).unwrap()
    }

    #[test]
    fn test_block_and_clean() {
        let m = matcher(serde_json::json!([
            {"trigger": {"url-filter": "ads\\.example"}, "action": {"type": "block"}}
        ]));
        assert!(m.check_url("https://ads.example/x.js", "", "script").unwrap().should_block);
        let clean = m.check_url("https://news.example/", "", "other").unwrap();
        assert_eq!(clean.decision, MatchDecision::Clean);
    }

    #[test]
    fn test_allow_overrides_block_regardless_of_order() {
        let m = matcher(serde_json::json!([
            {"trigger": {"url-filter": "tracker"}, "action": {"type": "ignore-previous-rules"}},
            {"trigger": {"url-filter": "tracker\\.example"}, "action": {"type": "block"}}
        ]));
        let result = m.check_url("https://tracker.example/p.js", "", "script").unwrap();
        assert!(!result.should_block);
        assert_eq!(result.decision, MatchDecision::Excepted);
        assert_eq!(result.rule_index, Some(0));
    }

    #[test]
    fn test_most_specific_domain_scope_wins_attribution() {
        let m = matcher(serde_json::json!([
            {"trigger": {"url-filter": "banner"}, "action": {"type": "block"}},
            {"trigger": {"url-filter": "banner", "if-domain": ["example.com"]},
             "action": {"type": "block"}},
            {"trigger": {"url-filter": "banner", "if-domain": ["news.example.com"]},
             "action": {"type": "block"}}
        ]));
        let result = m
            .check_url("https://cdn.example.net/banner.png", "https://news.example.com/a", "image")
            .unwrap();
        assert_eq!(result.rule_index, Some(2));

        let result = m
            .check_url("https://cdn.example.net/banner.png", "https://other.example/", "image")
            .unwrap();
        assert_eq!(result.rule_index, Some(0));
    }

    #[test]
    fn test_first_registered_block_wins_without_scope() {
        let m = matcher(serde_json::json!([
            {"trigger": {"url-filter": "ads"}, "action": {"type": "block"}},
            {"trigger": {"url-filter": "ads\\.js"}, "action": {"type": "block"}}
        ]));
        let result = m.check_url("https://x.example/ads.js", "", "script").unwrap();
        assert_eq!(result.rule_index, Some(0));
    }

    #[test]
    fn test_conditions() {
        let m = matcher(serde_json::json!([
            {"trigger": {"url-filter": "pixel", "resource-type": ["image"],
                         "load-type": ["third-party"], "unless-domain": ["shop.example"]},
             "action": {"type": "block"}}
        ]));
        let check = |url: &str, page: &str, request_type: &str| {
            m.check_url(url, page, request_type).unwrap()
        };
        let pixel = "https://t.example/pixel.gif";
        assert!(check(pixel, "https://news.example/", "image").should_block);
        assert!(!check(pixel, "https://news.example/", "script").should_block);
        let first_party = check("https://cdn.t.example/pixel.gif", "https://t.example/", "image");
        assert!(!first_party.should_block);
        assert!(!check(pixel, "https://shop.example/", "image").should_block);
    }

    #[test]
    fn test_third_party_under_multi_label_suffix() {
        let m = matcher(serde_json::json!([
            {"trigger": {"url-filter": "ads\\.other\\.co\\.uk", "load-type": ["third-party"]},
             "action": {"type": "block"}}
        ]));
        let request =
            Request::new("https://ads.other.co.uk/x.js", "https://shop.example.co.uk/", "script")
                .unwrap();
        assert!(request.is_third_party());
        assert!(m.check(&request).should_block);

        let same_site = m
            .check_url("https://ads.other.co.uk/x.js", "https://www.other.co.uk/", "script")
            .unwrap();
        assert!(!same_site.should_block);
    }

    fn rule(url_filter: String, action: RuleAction) -> EncodedRule {
        EncodedRule {
            trigger: Trigger {
                url_filter,
                resource_type: vec![],
                if_domain: vec![],
                unless_domain: vec![],
                load_type: vec![],
            },
            action,
        }
    }

    #[test]
    fn test_anchored_host_shape() {
        let filter = host_anchor_filter("a-b.example.com");
        assert_eq!(anchored_host(&filter).as_deref(), Some("a-b.example.com"));
        assert_eq!(anchored_host(&format!("{filter}/x")), None);
        assert_eq!(anchored_host("ads"), None);
        assert_eq!(anchored_host(&host_anchor_filter("a*b.com")), None);
    }

    #[test]
    fn test_full_size_rule_set_within_limits() {
        let limits = MatcherLimits::default();
        let mut rules: Vec<EncodedRule> = (0..limits.max_rules - 1)
            .map(|i| rule(host_anchor_filter(&format!("ads{i}.example.com")), RuleAction::Block))
            .collect();
        rules.push(rule(r"/banner\.gif".to_string(), RuleAction::Block));

        let encoded = serde_json::to_string(&rules).unwrap();
        let m = RuleMatcher::from_encoded("full", &encoded, &limits).unwrap();
        assert_eq!(m.rule_count(), limits.max_rules);
        assert_eq!(m.pattern_rule_count(), 1);

        let hit = m.check_url("https://cdn.ads123.example.com/x.js", "", "script").unwrap();
        assert!(hit.should_block);
        assert_eq!(hit.rule_index, Some(123));
        let lookalike = m.check_url("https://ads123.example.com.evil/x.js", "", "script").unwrap();
        assert!(!lookalike.should_block);
        assert!(m.check_url("https://news.example/banner.gif", "", "image").unwrap().should_block);

        rules.push(rule(host_anchor_filter("one-too-many.example"), RuleAction::Block));
        let encoded = serde_json::to_string(&rules).unwrap();
        assert!(matches!(
            RuleMatcher::from_encoded("full", &encoded, &limits),
            Err(AdBlockError::Compilation { .. })
        ));
    }

    #[test]
    fn test_rejections() {
        let limits = MatcherLimits {
            max_rules: 1,
            ..MatcherLimits::default()
        };
        let two = encoded(serde_json::json!([
            {"trigger": {"url-filter": "a"}, "action": {"type": "block"}},
            {"trigger": {"url-filter": "b"}, "action": {"type": "block"}}
        ]));
        assert!(matches!(
            RuleMatcher::from_encoded("x", &two, &limits),
            Err(AdBlockError::Compilation { .. })
        ));
        assert!(RuleMatcher::from_encoded("x", "not json", &MatcherLimits::default()).is_err());
        let bad_regex = encoded(serde_json::json!([
            {"trigger": {"url-filter": "(unclosed"}, "action": {"type": "block"}}
        ]));
        assert!(RuleMatcher::from_encoded("x", &bad_regex, &MatcherLimits::default()).is_err());
    }
}
