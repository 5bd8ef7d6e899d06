//! Holds the active compiled rule set and installs it on browsing surfaces.
//!
//! Surfaces move `Pending -> Applied` (or `Failed`) and are forgotten on
//! removal. Every install is preceded by an uninstall on the same surface,
//! so a surface never carries two rule sets. A failed compilation falls back
//! to the minimal rules here and nowhere else; if those fail too the engine
//! stays degraded until a later compilation succeeds.

use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::compiler::RuleCompiler;
use crate::error::{AdBlockError, Result};
use crate::rules::RuleRecord;
use crate::types::CompiledRuleSet;
use crate::whitelist::WhitelistSet;

pub use crate::host::{SurfaceHost, SurfaceId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceState {
    /// Tracked, but nothing installed (disabled, no rule set or degraded).
    Pending,
    Applied,
    /// The host refused the last install.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Installed,
    Disabled,
    NoRuleSet,
    /// Blocking is unavailable; nothing was installed.
    Degraded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineStatus {
    /// Nothing compiled yet.
    Inactive,
    Active {
        identifier: String,
        rule_count: usize,
        /// The minimal rules stand in for a rejected full set.
        fallback: bool,
    },
    Degraded {
        reason: String,
    },
}

pub struct BlockingEngine {
    compiler: Arc<RuleCompiler>,
    host: Arc<dyn SurfaceHost>,
    enabled: bool,
    active: Option<Arc<CompiledRuleSet>>,
    fallback: bool,
    degraded: Option<String>,
    surfaces: BTreeMap<SurfaceId, SurfaceState>,
}

impl BlockingEngine {
    pub fn new(compiler: Arc<RuleCompiler>, host: Arc<dyn SurfaceHost>, enabled: bool) -> Self {
        Self {
            compiler,
            host,
            enabled,
            active: None,
            fallback: false,
            degraded: None,
            surfaces: BTreeMap::new(),
        }
    }

    pub fn compiler(&self) -> &Arc<RuleCompiler> {
        &self.compiler
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.is_some()
    }

    pub fn active_rule_set(&self) -> Option<Arc<CompiledRuleSet>> {
        self.active.clone()
    }

    pub fn surface_state(&self, surface: SurfaceId) -> Option<SurfaceState> {
        self.surfaces.get(&surface).copied()
    }

    pub fn status(&self) -> EngineStatus {
        if let Some(reason) = &self.degraded {
            return EngineStatus::Degraded {
                reason: reason.clone(),
            };
        }
        match &self.active {
            Some(set) => EngineStatus::Active {
                identifier: set.identifier.clone(),
                rule_count: set.rule_count,
                fallback: self.fallback,
            },
            None => EngineStatus::Inactive,
        }
    }

    /// Installs the active set on `surface`, replacing whatever it had.
    /// The surface is tracked even when nothing can be installed yet.
    pub fn apply_to(&mut self, surface: SurfaceId) -> Result<ApplyOutcome> {
        let outcome = if self.degraded.is_some() {
            ApplyOutcome::Degraded
        } else if !self.enabled {
            ApplyOutcome::Disabled
        } else if self.active.is_none() {
            ApplyOutcome::NoRuleSet
        } else {
            self.install(surface)?;
            return Ok(ApplyOutcome::Installed);
        };

        debug!("Not applying rules to {}: {:?}", surface, outcome);
        self.surfaces.entry(surface).or_insert(SurfaceState::Pending);
        Ok(outcome)
    }

    /// Uninstalls and forgets the surface. Returns whether it was tracked.
    pub fn remove_from(&mut self, surface: SurfaceId) -> bool {
        debug!("Removing content blocking from {}", surface);
        self.host.uninstall_rule_set(surface);
        self.surfaces.remove(&surface).is_some()
    }

    /// Replaces the active set and re-applies it to every tracked surface.
    /// Returns the per-surface failures; one failing surface does not stop
    /// the others.
    pub fn update_rule_set(&mut self, set: CompiledRuleSet) -> Vec<AdBlockError> {
        self.activate(set, false)
    }

    /// `false` uninstalls everywhere; `true` re-applies the active set.
    /// Returns whether a compilation is needed because no set exists.
    pub fn set_global_enabled(&mut self, enabled: bool) -> bool {
        self.enabled = enabled;
        if !enabled {
            info!("Content blocking disabled on {} surfaces", self.surfaces.len());
            self.uninstall_all();
            return false;
        }

        if self.active.is_some() {
            let failures = self.propagate();
            if !failures.is_empty() {
                warn!("{} surfaces refused rules on enable", failures.len());
            }
            false
        } else {
            true
        }
    }

    /// Takes a compilation result, falling back to the minimal rules on error.
    pub fn install_compiled(
        &mut self,
        result: Result<CompiledRuleSet>,
        excluding: &WhitelistSet,
    ) -> EngineStatus {
        match result {
            Ok(set) => {
                info!("Content rules compiled: '{}' ({} rules)", set.identifier, set.rule_count);
                self.activate(set, false);
            }
            Err(e) => {
                error!("Failed to compile content rules: {}", e);
                info!("Attempting fallback with minimal rules...");
                match self.compiler.compile_minimal(excluding) {
                    Ok(set) => {
                        warn!(
                            "Minimal content rules applied as fallback ({} rules)",
                            set.rule_count
                        );
                        self.activate(set, true);
                    }
                    Err(minimal_err) => {
                        self.enter_degraded(format!("{e}; minimal rules: {minimal_err}"));
                    }
                }
            }
        }
        self.status()
    }

    /// Compiles synchronously and installs the result.
    pub fn rebuild<I>(&mut self, records: I, excluding: &WhitelistSet) -> EngineStatus
    where
        I: IntoIterator,
        I::Item: Borrow<RuleRecord>,
    {
        let result = self.compiler.compile(records, excluding);
        self.install_compiled(result, excluding)
    }

    fn activate(&mut self, set: CompiledRuleSet, fallback: bool) -> Vec<AdBlockError> {
        self.active = Some(Arc::new(set));
        self.fallback = fallback;
        if self.degraded.take().is_some() {
            info!("Leaving degraded mode");
        }

        if !self.enabled {
            return Vec::new();
        }
        let failures = self.propagate();
        for failure in &failures {
            warn!("Rule propagation failed: {}", failure);
        }
        failures
    }

    fn propagate(&mut self) -> Vec<AdBlockError> {
        let surfaces: Vec<SurfaceId> = self.surfaces.keys().copied().collect();
        surfaces
            .into_iter()
            .filter_map(|surface| self.install(surface).err())
            .collect()
    }

    fn install(&mut self, surface: SurfaceId) -> Result<()> {
        let Some(set) = self.active.clone() else {
            return Ok(());
        };

        self.host.uninstall_rule_set(surface);
        match self.host.install_rule_set(surface, &set) {
            Ok(()) => {
                debug!("Applied '{}' to {}", set.identifier, surface);
                self.surfaces.insert(surface, SurfaceState::Applied);
                Ok(())
            }
            Err(e) => {
                self.surfaces.insert(surface, SurfaceState::Failed);
                Err(e)
            }
        }
    }

    fn uninstall_all(&mut self) {
        for (surface, state) in self.surfaces.iter_mut() {
            self.host.uninstall_rule_set(*surface);
            *state = SurfaceState::Pending;
        }
    }

    fn enter_degraded(&mut self, reason: String) {
        error!("Even minimal rules failed to compile, ad blocking unavailable: {}", reason);
        self.uninstall_all();
        self.active = None;
        self.fallback = false;
        self.degraded = Some(reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{RegexBackend, RuleListBackend};
    use crate::filters::ParsedList;
    use crate::host::{HostEvent, InMemoryHost};

    /// Rejects everything except the identifiers it is told to accept.
    struct SelectiveBackend {
        accept: Vec<&'static str>,
    }

    impl RuleListBackend for SelectiveBackend {
        fn compile(&self, identifier: &str, encoded: &str) -> Result<usize> {
            if self.accept.iter().any(|accepted| *accepted == identifier) {
                RegexBackend::default().compile(identifier, encoded)
            } else {
                Err(AdBlockError::compilation(identifier, "rejected by host"))
            }
        }
    }

    fn engine_with(backend: Arc<dyn RuleListBackend>) -> (BlockingEngine, Arc<InMemoryHost>) {
        let host = Arc::new(InMemoryHost::default());
        let compiler = Arc::new(RuleCompiler::new(backend));
        (BlockingEngine::new(compiler, host.clone(), true), host)
    }

    fn engine() -> (BlockingEngine, Arc<InMemoryHost>) {
        engine_with(Arc::new(RegexBackend::default()))
    }

    fn records(text: &str) -> Vec<RuleRecord> {
        ParsedList::parse(text).records().to_vec()
    }

    #[test]
    fn test_apply_without_rules_is_noop_until_compiled() {
        let (mut engine, host) = engine();
        let tab = SurfaceId(1);

        assert_eq!(engine.apply_to(tab).unwrap(), ApplyOutcome::NoRuleSet);
        assert!(host.events().is_empty());
        assert_eq!(engine.surface_state(tab), Some(SurfaceState::Pending));

        engine.rebuild(records("||ads.example^"), &WhitelistSet::new());
        assert_eq!(engine.surface_state(tab), Some(SurfaceState::Applied));
        assert!(host.check(tab, "https://ads.example/x.js", "", "script").unwrap().should_block);
    }

    #[test]
    fn test_reapply_uninstalls_first() {
        let (mut engine, host) = engine();
        let tab = SurfaceId(7);
        engine.rebuild(records("||ads.example^"), &WhitelistSet::new());
        engine.apply_to(tab).unwrap();
        engine.apply_to(tab).unwrap();

        let events = host.events();
        assert_eq!(events.len(), 4);
        for pair in events.chunks(2) {
            assert_eq!(pair[0], HostEvent::Uninstalled { surface: tab });
            assert!(matches!(pair[1], HostEvent::Installed { surface, .. } if surface == tab));
        }
    }

    #[test]
    fn test_update_propagates_despite_failing_surface() {
        let (mut engine, host) = engine();
        engine.rebuild(records("||one.example^"), &WhitelistSet::new());
        for id in 1..=3 {
            engine.apply_to(SurfaceId(id)).unwrap();
        }

        host.fail_installs_on(SurfaceId(2));
        let set = engine
            .compiler()
            .compile(records("||two.example^"), &WhitelistSet::new())
            .unwrap();
        let failures = engine.update_rule_set(set);

        assert_eq!(failures.len(), 1);
        assert_eq!(engine.surface_state(SurfaceId(2)), Some(SurfaceState::Failed));
        for id in [1, 3] {
            let result = host.check(SurfaceId(id), "https://two.example/", "", "other").unwrap();
            assert!(result.should_block);
        }
    }

    #[test]
    fn test_rejected_set_falls_back_to_minimal_rules() {
        let (mut engine, host) = engine_with(Arc::new(SelectiveBackend {
            accept: vec![crate::compiler::MINIMAL_IDENTIFIER],
        }));
        let status = engine.rebuild(records("||ads.example^"), &WhitelistSet::new());
        assert!(matches!(status, EngineStatus::Active { fallback: true, .. }));

        let tab = SurfaceId(3);
        assert_eq!(engine.apply_to(tab).unwrap(), ApplyOutcome::Installed);
        assert_eq!(
            host.installed_identifier(tab).as_deref(),
            Some(crate::compiler::MINIMAL_IDENTIFIER)
        );
        let result = host
            .check(tab, "https://stats.g.doubleclick.net/collect", "", "xhr")
            .unwrap();
        assert!(result.should_block);
    }

    #[test]
    fn test_degraded_mode_is_sticky_and_observable() {
        let (mut engine, host) = engine_with(Arc::new(SelectiveBackend { accept: vec![] }));
        let tab = SurfaceId(1);

        let status = engine.rebuild(records("||ads.example^"), &WhitelistSet::new());
        assert!(matches!(status, EngineStatus::Degraded { .. }));
        assert!(engine.is_degraded());
        assert!(engine.active_rule_set().is_none());

        assert_eq!(engine.apply_to(tab).unwrap(), ApplyOutcome::Degraded);
        assert!(host.events().is_empty());
        // still reported to anyone asking later
        assert!(matches!(engine.status(), EngineStatus::Degraded { .. }));
    }

    #[test]
    fn test_degraded_engine_uninstalls_and_recovers() {
        let host = Arc::new(InMemoryHost::default());
        let compiler = Arc::new(RuleCompiler::new(Arc::new(SelectiveBackend { accept: vec![] })));
        let mut engine = BlockingEngine::new(compiler, host.clone(), true);
        let tab = SurfaceId(9);

        engine.update_rule_set(CompiledRuleSet {
            identifier: "preloaded".to_string(),
            encoded_form: "[]".to_string(),
            rule_count: 0,
        });
        engine.apply_to(tab).unwrap();
        assert_eq!(host.installed_identifier(tab).as_deref(), Some("preloaded"));

        engine.install_compiled(
            Err(AdBlockError::compilation("full", "boom")),
            &WhitelistSet::new(),
        );
        assert!(engine.is_degraded());
        assert_eq!(host.installed_identifier(tab), None);
        assert_eq!(engine.surface_state(tab), Some(SurfaceState::Pending));

        engine.update_rule_set(CompiledRuleSet {
            identifier: "recovered".to_string(),
            encoded_form: "[]".to_string(),
            rule_count: 0,
        });
        assert!(!engine.is_degraded());
        assert_eq!(host.installed_identifier(tab).as_deref(), Some("recovered"));
    }

    #[test]
    fn test_global_toggle() {
        let (mut engine, host) = engine();
        let tab = SurfaceId(4);
        assert!(engine.set_global_enabled(true), "needs compilation without a set");

        engine.rebuild(records("||ads.example^"), &WhitelistSet::new());
        engine.apply_to(tab).unwrap();

        assert!(!engine.set_global_enabled(false));
        assert_eq!(host.installed_identifier(tab), None);
        assert_eq!(engine.apply_to(tab).unwrap(), ApplyOutcome::Disabled);

        assert!(!engine.set_global_enabled(true));
        assert!(host.installed_identifier(tab).is_some());
        assert_eq!(engine.surface_state(tab), Some(SurfaceState::Applied));

        assert!(engine.remove_from(tab));
        assert_eq!(host.installed_identifier(tab), None);
        assert_eq!(engine.surface_state(tab), None);
    }
}
