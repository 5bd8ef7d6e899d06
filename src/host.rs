//! Boundary to the browsing-surface host.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

use crate::error::{AdBlockError, Result};
use crate::matcher::{MatcherLimits, RuleMatcher};
use crate::types::{BlockResult, CompiledRuleSet};

/// Identifies one browsing surface (a tab, a web view, a frame tree).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SurfaceId(pub u64);

impl fmt::Display for SurfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "surface#{}", self.0)
    }
}

/// Installs compiled rule sets into browsing surfaces. The core never
/// manages a surface's lifecycle.
pub trait SurfaceHost: Send + Sync {
    /// Fails with `AdBlockError::Surface` when the host refuses the set.
    fn install_rule_set(&self, surface: SurfaceId, rules: &Arc<CompiledRuleSet>) -> Result<()>;

    fn uninstall_rule_set(&self, surface: SurfaceId);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    Installed { surface: SurfaceId, identifier: String },
    Uninstalled { surface: SurfaceId },
}

struct Installed {
    identifier: String,
    matcher: Arc<RuleMatcher>,
}

/// Host that decodes installed sets into matchers and keeps them in memory.
/// Records every install/uninstall so call ordering can be inspected.
///
/// One matcher is built per rule set and shared by every surface it is
/// installed on.
pub struct InMemoryHost {
    limits: MatcherLimits,
    /// Latest decoded set per identifier.
    matchers: Mutex<HashMap<String, (Arc<CompiledRuleSet>, Arc<RuleMatcher>)>>,
    matcher_builds: AtomicUsize,
    installed: Mutex<HashMap<SurfaceId, Installed>>,
    failing: Mutex<HashSet<SurfaceId>>,
    events: Mutex<Vec<HostEvent>>,
}

impl Default for InMemoryHost {
    fn default() -> Self {
        Self::new(MatcherLimits::default())
    }
}

impl InMemoryHost {
    pub fn new(limits: MatcherLimits) -> Self {
        Self {
            limits,
            matchers: Mutex::new(HashMap::new()),
            matcher_builds: AtomicUsize::new(0),
            installed: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            events: Mutex::new(Vec::new()),
        }
    }

    /// Makes every later install on `surface` fail.
    pub fn fail_installs_on(&self, surface: SurfaceId) {
        self.failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(surface);
    }

    pub fn installed_identifier(&self, surface: SurfaceId) -> Option<String> {
        self.installed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&surface)
            .map(|installed| installed.identifier.clone())
    }

    /// Evaluates a request on a surface; `None` when no rules are installed.
    pub fn check(
        &self,
        surface: SurfaceId,
        url: &str,
        page_url: &str,
        request_type: &str,
    ) -> Option<BlockResult> {
        let matcher = self
            .installed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&surface)
            .map(|installed| installed.matcher.clone())?;
        matcher.check_url(url, page_url, request_type).ok()
    }

    /// Number of rule sets decoded so far.
    pub fn matcher_builds(&self) -> usize {
        self.matcher_builds.load(Ordering::Relaxed)
    }

    pub fn events(&self) -> Vec<HostEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn matcher_for(&self, rules: &Arc<CompiledRuleSet>) -> Result<Arc<RuleMatcher>> {
        let mut matchers = self.matchers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((set, matcher)) = matchers.get(&rules.identifier) {
            if Arc::ptr_eq(set, rules) || set.encoded_form == rules.encoded_form {
                return Ok(matcher.clone());
            }
        }

        let matcher = Arc::new(RuleMatcher::from_encoded(
            &rules.identifier,
            &rules.encoded_form,
            &self.limits,
        )?);
        self.matcher_builds.fetch_add(1, Ordering::Relaxed);
        matchers.insert(rules.identifier.clone(), (rules.clone(), matcher.clone()));
        Ok(matcher)
    }

    fn push_event(&self, event: HostEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

impl SurfaceHost for InMemoryHost {
    fn install_rule_set(&self, surface: SurfaceId, rules: &Arc<CompiledRuleSet>) -> Result<()> {
        let refused = self
            .failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&surface);
        if refused {
            return Err(AdBlockError::Surface {
                surface,
                reason: "host refused rule set".to_string(),
            });
        }

        let matcher = self.matcher_for(rules).map_err(|e| AdBlockError::Surface {
            surface,
            reason: e.to_string(),
        })?;

        self.installed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                surface,
                Installed {
                    identifier: rules.identifier.clone(),
                    matcher,
                },
            );
        self.push_event(HostEvent::Installed {
            surface,
            identifier: rules.identifier.clone(),
        });
        debug!("Installed '{}' on {}", rules.identifier, surface);
        Ok(())
    }

    fn uninstall_rule_set(&self, surface: SurfaceId) {
        self.installed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&surface);
        self.push_event(HostEvent::Uninstalled { surface });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule_set(identifier: &str, host: &str) -> Arc<CompiledRuleSet> {
        let encoded = serde_json::json!([
            {"trigger": {"url-filter": crate::matcher::host_anchor_filter(host)},
             "action": {"type": "block"}}
        ]);
        Arc::new(CompiledRuleSet {
            identifier: identifier.to_string(),
            encoded_form: encoded.to_string(),
            rule_count: 1,
        })
    }

    #[test]
    fn test_one_matcher_per_rule_set() {
        let host = InMemoryHost::default();
        let first = rule_set("rules", "tracker.example");
        for surface in 1..=3 {
            host.install_rule_set(SurfaceId(surface), &first).unwrap();
        }
        assert_eq!(host.matcher_builds(), 1);

        // same identifier, new content
        let second = rule_set("rules", "ads.example");
        host.install_rule_set(SurfaceId(1), &second).unwrap();
        host.install_rule_set(SurfaceId(2), &second).unwrap();
        assert_eq!(host.matcher_builds(), 2);

        let page = "https://news.example/";
        let blocked = |surface, url| {
            host.check(SurfaceId(surface), url, page, "script")
                .unwrap()
                .should_block
        };
        assert!(blocked(1, "https://ads.example/a.js"));
        assert!(!blocked(1, "https://tracker.example/t.js"));
        assert!(blocked(3, "https://tracker.example/t.js"));
    }

    #[test]
    fn test_refused_and_undecodable_sets() {
        let host = InMemoryHost::default();
        host.fail_installs_on(SurfaceId(9));
        let set = rule_set("rules", "tracker.example");
        assert!(matches!(
            host.install_rule_set(SurfaceId(9), &set),
            Err(AdBlockError::Surface { .. })
        ));

        let broken = Arc::new(CompiledRuleSet {
            identifier: "broken".to_string(),
            encoded_form: "not json".to_string(),
            rule_count: 0,
        });
        assert!(host.install_rule_set(SurfaceId(1), &broken).is_err());
        assert!(host.installed_identifier(SurfaceId(1)).is_none());
        assert!(host.events().is_empty());
    }
}
