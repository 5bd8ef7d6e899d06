//! Parsed representation of filter-list lines.
//!
//! The recognized grammar is the common adblock subset:
//!
//! - `!`, `[` and `#` lines are comments
//! - `@@` turns a rule into an exception (allow)
//! - `||host^` anchors on a host and its subdomains
//! - `*.name.*` host globs match any (or no) subdomain and any suffix labels
//! - `|` anchors, `*` wildcards and `^` separators in plain patterns
//! - `/.../` is a regular expression
//! - bare domains ending in a known public suffix, and hosts-file lines
//!   (`0.0.0.0 host`), block that host; other dotted words such as
//!   `banner.gif` stay substring patterns
//! - `$` options: resource types (optionally negated with `~`),
//!   `third-party`, `domain=a.com|~b.com`, `important`
//!
//! Anything else, including cosmetic (`##`) rules, is a parse error for that
//! line only.

use bitflags::bitflags;
use std::collections::BTreeSet;

use crate::error::RuleParseError;

bitflags! {
    /// Request types a rule applies to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ResourceTypeMask: u8 {
        const SCRIPT = 1 << 0;
        const IMAGE = 1 << 1;
        const STYLESHEET = 1 << 2;
        const MEDIA = 1 << 3;
        const XHR = 1 << 4;
        const FONT = 1 << 5;
        const OTHER = 1 << 6;
    }
}

const TYPE_NAMES: &[(&str, ResourceTypeMask)] = &[
    ("script", ResourceTypeMask::SCRIPT),
    ("image", ResourceTypeMask::IMAGE),
    ("stylesheet", ResourceTypeMask::STYLESHEET),
    ("style-sheet", ResourceTypeMask::STYLESHEET),
    ("media", ResourceTypeMask::MEDIA),
    ("xmlhttprequest", ResourceTypeMask::XHR),
    ("xhr", ResourceTypeMask::XHR),
    ("raw", ResourceTypeMask::XHR),
    ("font", ResourceTypeMask::FONT),
    ("other", ResourceTypeMask::OTHER),
];

/// Names used in the encoded rule format, one per flag.
const ENCODED_NAMES: &[(&str, ResourceTypeMask)] = &[
    ("script", ResourceTypeMask::SCRIPT),
    ("image", ResourceTypeMask::IMAGE),
    ("style-sheet", ResourceTypeMask::STYLESHEET),
    ("media", ResourceTypeMask::MEDIA),
    ("raw", ResourceTypeMask::XHR),
    ("font", ResourceTypeMask::FONT),
    ("other", ResourceTypeMask::OTHER),
];

impl ResourceTypeMask {
    /// Accepts filter option names, request type names and encoded names.
    pub fn from_type_name(name: &str) -> Option<Self> {
        let name = name.trim().to_ascii_lowercase();
        TYPE_NAMES
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, mask)| *mask)
    }

    /// Encoded names of the set flags; empty when every type is set.
    pub fn encoded_names(self) -> Vec<String> {
        if self == Self::all() {
            return Vec::new();
        }
        ENCODED_NAMES
            .iter()
            .filter(|(_, mask)| self.contains(*mask))
            .map(|(name, _)| name.to_string())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Block,
    Allow,
}

/// Page domains a rule is restricted to (`include`) or excluded from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DomainScope {
    pub include: BTreeSet<String>,
    pub exclude: BTreeSet<String>,
}

impl DomainScope {
    pub fn including<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            include: domains.into_iter().map(Into::into).collect(),
            exclude: BTreeSet::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.include.is_empty() && self.exclude.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PatternKind {
    /// `||host^...`; the pattern holds the text after `||`.
    HostAnchor,
    /// `*.name.*`; matched against the request host only.
    HostGlob,
    /// Plain pattern with `*`, `^` and `|` anchors.
    Wildcard,
    /// Body of a `/.../` rule.
    Regex,
}

/// One parsed filter rule. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleRecord {
    pub pattern: String,
    pub kind: PatternKind,
    pub action: ActionKind,
    pub resource_types: ResourceTypeMask,
    pub domain_scope: Option<DomainScope>,
    pub third_party_only: bool,
}

impl RuleRecord {
    fn new(pattern: impl Into<String>, kind: PatternKind, action: ActionKind) -> Self {
        Self {
            pattern: pattern.into(),
            kind,
            action,
            resource_types: ResourceTypeMask::all(),
            domain_scope: None,
            third_party_only: false,
        }
    }

    /// Blocks every request to `host` and its subdomains.
    pub fn block_host(host: &str) -> Self {
        Self::new(format!("{host}^"), PatternKind::HostAnchor, ActionKind::Block)
    }

    /// Allows every request to `host` and its subdomains.
    pub fn allow_host(host: &str) -> Self {
        Self::new(format!("{host}^"), PatternKind::HostAnchor, ActionKind::Allow)
    }

    /// Allows every request issued by a page on `domain`.
    pub fn allow_on_page(domain: &str) -> Self {
        let mut record = Self::new("*", PatternKind::Wildcard, ActionKind::Allow);
        record.domain_scope = Some(DomainScope::including([domain]));
        record
    }

    pub fn is_block(&self) -> bool {
        self.action == ActionKind::Block
    }

    /// Same rule with a different action.
    pub fn with_action(&self, action: ActionKind) -> Self {
        Self {
            action,
            ..self.clone()
        }
    }

    /// Host a host-anchored rule is pinned to.
    pub fn anchor_host(&self) -> Option<&str> {
        if self.kind != PatternKind::HostAnchor {
            return None;
        }
        let end = self
            .pattern
            .find(|c: char| matches!(c, '^' | '/' | '*' | '|' | ':' | '?'))
            .unwrap_or(self.pattern.len());
        let host = &self.pattern[..end];
        (!host.is_empty()).then_some(host)
    }
}

/// Parses one line. `Ok(None)` means a comment, blank line or a hosts-file
/// entry for a local name.
pub fn parse_rule(line: &str) -> Result<Option<RuleRecord>, RuleParseError> {
    let line = line.trim();

    if line.is_empty() || line.starts_with('!') || line.starts_with('[') {
        return Ok(None);
    }

    if ["##", "#@#", "#?#", "#$#"].iter().any(|m| line.contains(m)) {
        return Err(RuleParseError::new("cosmetic rules are not supported"));
    }

    if line.starts_with('#') {
        return Ok(None);
    }

    if line.contains(char::is_whitespace) {
        return parse_hosts_line(line);
    }

    let (action, body) = match line.strip_prefix("@@") {
        Some(rest) => (ActionKind::Allow, rest),
        None => (ActionKind::Block, line),
    };

    let (pattern, options) = split_options(body);
    let (kind, pattern) = classify_pattern(pattern)?;

    let mut record = RuleRecord::new(pattern, kind, action);
    if let Some(options) = options {
        apply_options(&mut record, options)?;
    }

    Ok(Some(record))
}

// Hosts file format: "0.0.0.0 domain.com [# comment]"
fn parse_hosts_line(line: &str) -> Result<Option<RuleRecord>, RuleParseError> {
    let line = line.split('#').next().unwrap_or_default();
    let parts: Vec<&str> = line.split_whitespace().collect();

    let [ip, domain] = parts.as_slice() else {
        return Err(RuleParseError::new("unexpected whitespace in rule"));
    };

    if !matches!(*ip, "0.0.0.0" | "127.0.0.1" | "::" | "::1") {
        return Err(RuleParseError::new(format!(
            "hosts entry does not point to a null address: {ip}"
        )));
    }

    let domain = domain.to_lowercase();
    if matches!(
        domain.as_str(),
        "localhost" | "localhost.localdomain" | "local" | "broadcasthost" | "0.0.0.0"
    ) {
        return Ok(None);
    }

    if !is_bare_domain(&domain) {
        return Err(RuleParseError::new(format!("invalid hosts domain: {domain}")));
    }

    Ok(Some(RuleRecord::block_host(&domain)))
}

fn split_options(body: &str) -> (&str, Option<&str>) {
    if let Some(idx) = body.rfind('$') {
        let options = &body[idx + 1..];
        let looks_like_options = !options.is_empty()
            && options
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || "~=|,._-".contains(c));
        if looks_like_options {
            return (&body[..idx], Some(options));
        }
    }
    (body, None)
}

fn classify_pattern(pattern: &str) -> Result<(PatternKind, String), RuleParseError> {
    if pattern.is_empty() || pattern == "*" {
        return Ok((PatternKind::Wildcard, "*".to_string()));
    }

    if pattern.len() > 2 && pattern.starts_with('/') && pattern.ends_with('/') {
        let inner = &pattern[1..pattern.len() - 1];
        regex::Regex::new(inner)
            .map_err(|e| RuleParseError::new(format!("invalid regex: {e}")))?;
        return Ok((PatternKind::Regex, inner.to_string()));
    }

    if let Some(rest) = pattern.strip_prefix("||") {
        let rest = rest.to_lowercase();
        let host_end = rest
            .find(|c: char| matches!(c, '^' | '/' | '*' | '|' | ':' | '?'))
            .unwrap_or(rest.len());
        if host_end == 0 || !is_host_fragment(&rest[..host_end]) {
            return Err(RuleParseError::new("host anchor without a host"));
        }
        return Ok((PatternKind::HostAnchor, rest));
    }

    let lower = pattern.to_lowercase();
    if is_host_glob(&lower) {
        return Ok((PatternKind::HostGlob, lower));
    }
    if is_bare_domain(&lower) && has_known_suffix(&lower) {
        return Ok((PatternKind::HostAnchor, format!("{lower}^")));
    }

    if pattern
        .chars()
        .any(|c| c.is_control() || !c.is_ascii() || "<>\"{}\\`".contains(c))
    {
        return Err(RuleParseError::new("pattern contains characters not valid in a URL"));
    }

    Ok((PatternKind::Wildcard, pattern.to_string()))
}

fn apply_options(record: &mut RuleRecord, options: &str) -> Result<(), RuleParseError> {
    let mut include = ResourceTypeMask::empty();
    let mut exclude = ResourceTypeMask::empty();

    for option in options.split(',') {
        let option = option.trim().to_ascii_lowercase();
        match option.as_str() {
            "third-party" | "3p" => record.third_party_only = true,
            "important" => {}
            _ if option.starts_with("domain=") => {
                record.domain_scope = Some(parse_domain_option(&option["domain=".len()..])?);
            }
            _ => {
                let (negated, name) = match option.strip_prefix('~') {
                    Some(name) => (true, name),
                    None => (false, option.as_str()),
                };
                let mask = ResourceTypeMask::from_type_name(name).ok_or_else(|| {
                    RuleParseError::new(format!("unsupported option: {option}"))
                })?;
                if negated {
                    exclude |= mask;
                } else {
                    include |= mask;
                }
            }
        }
    }

    let base = if include.is_empty() {
        ResourceTypeMask::all()
    } else {
        include
    };
    record.resource_types = base - exclude;
    if record.resource_types.is_empty() {
        return Err(RuleParseError::new("rule matches no resource type"));
    }
    Ok(())
}

fn parse_domain_option(value: &str) -> Result<DomainScope, RuleParseError> {
    let mut scope = DomainScope::default();
    for entry in value.split('|') {
        let (negated, domain) = match entry.strip_prefix('~') {
            Some(domain) => (true, domain),
            None => (false, entry),
        };
        let domain = domain.trim().trim_end_matches('.');
        if !is_bare_domain(domain) {
            return Err(RuleParseError::new(format!("invalid domain option: {entry}")));
        }
        if negated {
            scope.exclude.insert(domain.to_string());
        } else {
            scope.include.insert(domain.to_string());
        }
    }
    Ok(scope)
}

fn is_host_fragment(s: &str) -> bool {
    s.chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_')
}

fn is_bare_domain(s: &str) -> bool {
    s.contains('.')
        && !s.starts_with('.')
        && !s.ends_with('.')
        && !s.contains("..")
        && is_host_fragment(s)
}

/// The last labels form a listed public suffix and there is a label in
/// front of it.
fn has_known_suffix(s: &str) -> bool {
    psl::suffix(s.as_bytes())
        .is_some_and(|suffix| suffix.is_known() && suffix.as_bytes().len() < s.len())
}

fn is_host_glob(s: &str) -> bool {
    let leading = s.starts_with("*.");
    let trailing = s.ends_with(".*");
    let core = s.trim_matches(|c| c == '*' || c == '.');
    (leading || trailing)
        && core.chars().any(|c| c.is_ascii_alphanumeric())
        && (core.contains('.') || (leading && trailing))
        && s.chars().all(|c| c == '*' || c == '.' || c == '-' || c.is_ascii_alphanumeric())
}
