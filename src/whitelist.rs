//! User-chosen domains exempted from blocking.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use url::Url;

use crate::error::{AdBlockError, Result};

/// Normalizes user input to a bare domain: lowercase, no scheme or path,
/// no trailing dot, no leading `www.`.
pub fn normalize_domain(input: &str) -> Result<String> {
    let trimmed = input.trim();

    let host = if trimmed.contains("://") {
        Url::parse(trimmed)?
            .host_str()
            .map(str::to_string)
            .ok_or_else(|| AdBlockError::InvalidDomain(input.to_string()))?
    } else {
        trimmed
            .split(['/', '?', '#'])
            .next()
            .unwrap_or_default()
            .to_string()
    };

    let mut domain = host.to_lowercase();
    while domain.ends_with('.') {
        domain.pop();
    }
    if let Some(stripped) = domain.strip_prefix("www.") {
        domain = stripped.to_string();
    }

    let valid = !domain.is_empty()
        && !domain.starts_with('.')
        && domain
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_');
    if !valid {
        return Err(AdBlockError::InvalidDomain(input.to_string()));
    }
    Ok(domain)
}

/// True when `host` is `domain` or one of its subdomains.
pub fn host_matches(host: &str, domain: &str) -> bool {
    host == domain
        || (host.len() > domain.len()
            && host.ends_with(domain)
            && host.as_bytes()[host.len() - domain.len() - 1] == b'.')
}

/// Registrable domain (eTLD+1) of a host per the Public Suffix List.
/// IP literals and hosts that are themselves a public suffix come back as is.
pub fn apex_domain(host: &str) -> &str {
    if host.starts_with('[') || host.parse::<Ipv4Addr>().is_ok() {
        return host;
    }
    psl::domain_str(host).unwrap_or(host)
}

/// Normalized, ordered whitelist. Ordering keeps compilation deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WhitelistSet {
    domains: BTreeSet<String>,
}

impl WhitelistSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts the normalized form; returns it and whether it was new.
    pub fn insert(&mut self, domain: &str) -> Result<(String, bool)> {
        let domain = normalize_domain(domain)?;
        let added = self.domains.insert(domain.clone());
        Ok((domain, added))
    }

    pub fn remove(&mut self, domain: &str) -> Result<(String, bool)> {
        let domain = normalize_domain(domain)?;
        let removed = self.domains.remove(&domain);
        Ok((domain, removed))
    }

    /// Exact membership of the normalized domain.
    pub fn contains(&self, domain: &str) -> bool {
        normalize_domain(domain)
            .map(|d| self.domains.contains(&d))
            .unwrap_or(false)
    }

    /// True when `host` or one of its parent domains is whitelisted.
    pub fn covers(&self, host: &str) -> bool {
        let host = host.trim_end_matches('.').to_lowercase();
        let host = host.strip_prefix("www.").unwrap_or(&host);
        self.domains.iter().any(|d| host_matches(host, d))
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.domains.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }
}

impl FromIterator<String> for WhitelistSet {
    /// Entries that fail to normalize are dropped.
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        let domains = iter
            .into_iter()
            .filter_map(|d| normalize_domain(&d).ok())
            .collect();
        Self { domains }
    }
}
