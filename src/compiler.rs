//! Merges rule records and the whitelist into one compiled rule set.

use std::borrow::Borrow;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{AdBlockError, Result};
use crate::filters::MinimalRules;
use crate::matcher::{
    EncodedRule, MatcherLimits, RuleAction, RuleMatcher, SCHEME, SEPARATOR, SUBDOMAINS, Trigger,
};
use crate::rules::{ActionKind, DomainScope, PatternKind, RuleRecord};
use crate::types::CompiledRuleSet;
use crate::whitelist::WhitelistSet;

pub const DEFAULT_IDENTIFIER: &str = "ad-blocker-rules";
pub const MINIMAL_IDENTIFIER: &str = "ad-blocker-rules-minimal";


/// The host's rule-list compiler. Accepting a document returns its rule
/// count; this is the only step of compilation allowed to fail.
pub trait RuleListBackend: Send + Sync {
    fn compile(&self, identifier: &str, encoded: &str) -> Result<usize>;
}

/// Backend that validates documents by building a [`RuleMatcher`].
#[derive(Debug, Clone, Default)]
pub struct RegexBackend {
    limits: MatcherLimits,
}

impl RegexBackend {
    pub fn new(limits: MatcherLimits) -> Self {
        Self { limits }
    }
}

impl RuleListBackend for RegexBackend {
    fn compile(&self, identifier: &str, encoded: &str) -> Result<usize> {
        RuleMatcher::from_encoded(identifier, encoded, &self.limits).map(|m| m.rule_count())
    }
}

pub struct RuleCompiler {
    backend: Arc<dyn RuleListBackend>,
    identifier: String,
    minimal_identifier: String,
}

impl RuleCompiler {
    pub fn new(backend: Arc<dyn RuleListBackend>) -> Self {
        Self {
            backend,
            identifier: DEFAULT_IDENTIFIER.to_string(),
            minimal_identifier: MINIMAL_IDENTIFIER.to_string(),
        }
    }

    pub fn with_identifiers(
        mut self,
        identifier: impl Into<String>,
        minimal: impl Into<String>,
    ) -> Self {
        self.identifier = identifier.into();
        self.minimal_identifier = minimal.into();
        self
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn minimal_identifier(&self) -> &str {
        &self.minimal_identifier
    }

    /// Compiles records (already in registration order) minus the whitelist.
    pub fn compile<I>(&self, records: I, excluding: &WhitelistSet) -> Result<CompiledRuleSet>
    where
        I: IntoIterator,
        I::Item: Borrow<RuleRecord>,
    {
        self.compile_as(&self.identifier, records, excluding)
    }

    /// Compiles the bundled minimal rules under their own identifier.
    pub fn compile_minimal(&self, excluding: &WhitelistSet) -> Result<CompiledRuleSet> {
        self.compile_as(&self.minimal_identifier, MinimalRules::records(), excluding)
    }

    fn compile_as<I>(
        &self,
        identifier: &str,
        records: I,
        excluding: &WhitelistSet,
    ) -> Result<CompiledRuleSet>
    where
        I: IntoIterator,
        I::Item: Borrow<RuleRecord>,
    {
        let merged = merge(records, excluding);
        let encoded_form = encode(identifier, &merged)?;
        info!(
            "Compiling rule set '{}': {} rules, {} characters",
            identifier,
            merged.len(),
            encoded_form.len()
        );

        let rule_count = self.backend.compile(identifier, &encoded_form)?;
        Ok(CompiledRuleSet {
            identifier: identifier.to_string(),
            encoded_form,
            rule_count,
        })
    }
}

/// Applies the whitelist to an ordered record sequence.
///
/// Block rules pinned to a whitelisted host become allow rules. Block rules
/// scoped to whitelisted pages keep blocking on their other pages and gain an
/// allow rule for the whitelisted ones. Every whitelisted domain then gets
/// trailing allow rules for requests to it and for requests made by its
/// pages. No record is dropped.
pub fn merge<I>(records: I, excluding: &WhitelistSet) -> Vec<RuleRecord>
where
    I: IntoIterator,
    I::Item: Borrow<RuleRecord>,
{
    let mut merged = Vec::new();

    for record in records {
        let record = record.borrow();
        if !record.is_block() || excluding.is_empty() {
            merged.push(record.clone());
            continue;
        }

        if record.anchor_host().is_some_and(|host| excluding.covers(host)) {
            debug!("Demoting '{}' to allow", record.pattern);
            merged.push(record.with_action(ActionKind::Allow));
            continue;
        }

        if let Some(scope) = &record.domain_scope {
            let (whitelisted, remaining): (BTreeSet<String>, BTreeSet<String>) =
                scope.include.iter().cloned().partition(|d| excluding.covers(d));

            if !whitelisted.is_empty() {
                if !remaining.is_empty() {
                    let mut kept = record.clone();
                    kept.domain_scope = Some(DomainScope {
                        include: remaining,
                        exclude: scope.exclude.clone(),
                    });
                    merged.push(kept);
                }
                let mut demoted = record.with_action(ActionKind::Allow);
                demoted.domain_scope = Some(DomainScope {
                    include: whitelisted,
                    exclude: scope.exclude.clone(),
                });
                merged.push(demoted);
                continue;
            }
        }

        merged.push(record.clone());
    }

    for domain in excluding.iter() {
        merged.push(RuleRecord::allow_host(domain));
        merged.push(RuleRecord::allow_on_page(domain));
    }

    merged
}

/// Encodes records as a JSON content-rule-list document.
pub fn encode(identifier: &str, records: &[RuleRecord]) -> Result<String> {
    let rules: Vec<EncodedRule> = records.iter().map(encode_record).collect();
    serde_json::to_string(&rules).map_err(|e| AdBlockError::compilation(identifier, e))
}

fn encode_record(record: &RuleRecord) -> EncodedRule {
    let (if_domain, unless_domain) = match &record.domain_scope {
        Some(scope) => (
            scope.include.iter().cloned().collect(),
            scope.exclude.iter().cloned().collect(),
        ),
        None => (Vec::new(), Vec::new()),
    };

    EncodedRule {
        trigger: Trigger {
            url_filter: url_filter(record),
            resource_type: record.resource_types.encoded_names(),
            if_domain,
            unless_domain,
            load_type: if record.third_party_only {
                vec!["third-party".to_string()]
            } else {
                Vec::new()
            },
        },
        action: match record.action {
            ActionKind::Block => RuleAction::Block,
            ActionKind::Allow => RuleAction::IgnorePreviousRules,
        },
    }
}

/// Translates a rule pattern into the regex dialect of `url-filter`.
pub fn url_filter(record: &RuleRecord) -> String {
    match record.kind {
        PatternKind::Regex => record.pattern.clone(),
        PatternKind::HostAnchor => {
            format!("{SCHEME}{SUBDOMAINS}{}", translate_wildcards(&record.pattern))
        }
        PatternKind::HostGlob => host_glob_filter(&record.pattern),
        PatternKind::Wildcard => {
            let mut pattern = record.pattern.as_str();
            let mut filter = String::new();
            if let Some(rest) = pattern.strip_prefix('|') {
                filter.push('^');
                pattern = rest;
            }
            filter.push_str(&translate_wildcards(pattern));
            filter
        }
    }
}

fn translate_wildcards(pattern: &str) -> String {
    let (body, anchored_end) = match pattern.strip_suffix('|') {
        Some(body) => (body, true),
        None => (pattern, false),
    };

    let mut out = String::with_capacity(body.len() * 2);
    let mut buf = [0u8; 4];
    for c in body.chars() {
        match c {
            '*' => out.push_str(".*"),
            '^' => out.push_str(SEPARATOR),
            _ => out.push_str(&regex::escape(c.encode_utf8(&mut buf))),
        }
    }
    if anchored_end {
        out.push('$');
    }
    out
}

// `*.name.*`: leading `*.` is any subdomain or none, trailing `.*` is any
// suffix labels, and the match ends at the host boundary.
fn host_glob_filter(pattern: &str) -> String {
    let mut body = pattern;
    let mut filter = String::from(SCHEME);

    if let Some(rest) = body.strip_prefix("*.") {
        filter.push_str(SUBDOMAINS);
        body = rest;
    }
    let suffix = body.strip_suffix(".*");
    if let Some(rest) = suffix {
        body = rest;
    }

    for (idx, part) in body.split('*').enumerate() {
        if idx > 0 {
            filter.push_str("[^/?#:]*");
        }
        filter.push_str(&regex::escape(part));
    }

    if suffix.is_some() {
        filter.push_str(r"\.[^/?#:]+");
    }
    filter.push_str("(?:[:/?#]|$)");
    filter
}
