//! Top-level façade over the ad-block state.
//!
//! All mutable state (whitelist, active rule set, settings, statistics) is
//! owned by one task. [`AdBlockCoordinator`] is a cheap cloneable handle that
//! sends it commands. Compilation runs on the blocking pool and list fetches
//! on their own tasks; both post results back to the owner, which installs
//! only the newest compilation and drops superseded ones.

use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::compiler::{RegexBackend, RuleCompiler, RuleListBackend};
use crate::config::AdBlockerConfig;
use crate::engine::{ApplyOutcome, BlockingEngine, EngineStatus, SurfaceHost, SurfaceId};
use crate::error::{AdBlockError, Result};
use crate::filters::{FetchedList, FilterList, FilterListFetcher, FilterListStore, FilterSource};
use crate::settings::{PersistedSettings, SettingsStore};
use crate::stats::StatisticsLedger;
use crate::types::{CompiledRuleSet, GlobalStats, PageStats};
use crate::whitelist::{WhitelistSet, normalize_domain};

/// Snapshot published after every state change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorStatus {
    pub enabled: bool,
    pub engine: EngineStatus,
    pub whitelisted_domains: usize,
    pub global: GlobalStats,
    /// Generation of the most recently requested compilation.
    pub requested_generation: u64,
    /// Generation whose result was last installed.
    pub installed_generation: u64,
    /// Compilations dropped because a newer one had been requested.
    pub discarded_generations: u64,
    pub pending_fetches: usize,
    /// Last settings write failure, cleared by the next successful write.
    pub persistence_error: Option<String>,
}

impl CoordinatorStatus {
    /// No compilation or list fetch is outstanding.
    pub fn is_settled(&self) -> bool {
        self.installed_generation >= self.requested_generation && self.pending_fetches == 0
    }

    /// Ad blocking is unavailable and must not be reported as active.
    pub fn is_degraded(&self) -> bool {
        matches!(self.engine, EngineStatus::Degraded { .. })
    }
}

type Reply<T> = oneshot::Sender<T>;

enum Command {
    SetEnabled(bool, Reply<bool>),
    Toggle(Reply<bool>),
    AddToWhitelist(String, Reply<Result<String>>),
    RemoveFromWhitelist(String, Reply<Result<String>>),
    IsWhitelisted(String, Reply<bool>),
    Whitelist(Reply<Vec<String>>),
    AddList {
        source: FilterSource,
        raw_text: String,
        last_updated: SystemTime,
        reply: Reply<Result<FilterList>>,
    },
    Ingest {
        id: String,
        raw_text: String,
        last_updated: SystemTime,
        reply: Reply<Result<bool>>,
    },
    RemoveList(String, Reply<Result<FilterList>>),
    SetListEnabled(String, bool, Reply<Result<bool>>),
    Lists(Reply<Vec<FilterList>>),
    RefreshLists(Arc<dyn FilterListFetcher>, Reply<usize>),
    ApplyTo(SurfaceId, Reply<Result<ApplyOutcome>>),
    RemoveFrom(SurfaceId, Reply<bool>),
    RequestEvaluated {
        url: String,
        page_url: String,
        was_blocked: bool,
    },
    RecordPageLoad(String),
    PageStats(String, Reply<PageStats>),
    GlobalStats(Reply<GlobalStats>),
    ClearHistory(Reply<()>),
    Recompile(Reply<u64>),
    ActiveRuleSet(Reply<Option<Arc<CompiledRuleSet>>>),
    Shutdown(Reply<()>),
}

enum Completion {
    Compiled {
        generation: u64,
        result: Result<CompiledRuleSet>,
        whitelist: WhitelistSet,
    },
    Fetched {
        id: String,
        result: Result<FetchedList>,
    },
}

/// Handle to the ad-block owner task
#[derive(Clone)]
pub struct AdBlockCoordinator {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<CoordinatorStatus>,
}

impl AdBlockCoordinator {
    /// Loads settings, registers the configured subscriptions, starts the
    /// owner task and kicks off the first compilation.
    pub async fn start(config: AdBlockerConfig, host: Arc<dyn SurfaceHost>) -> Self {
        let backend = Arc::new(RegexBackend::new(config.matcher_limits()));
        Self::start_with_backend(config, host, backend).await
    }

    pub async fn start_with_backend(
        config: AdBlockerConfig,
        host: Arc<dyn SurfaceHost>,
        backend: Arc<dyn RuleListBackend>,
    ) -> Self {
        info!("Ad block coordinator initializing...");

        let settings = SettingsStore::new(&config.settings_path);
        let (persisted, outcome) = settings.load().await;
        debug!("Settings load outcome: {:?}", outcome);

        let compiler = Arc::new(
            RuleCompiler::new(backend)
                .with_identifiers(&config.rule_set_identifier, &config.minimal_rule_set_identifier),
        );
        let engine = BlockingEngine::new(compiler, host, persisted.enabled);

        let mut ledger = StatisticsLedger::new(config.max_blocked_urls_per_page);
        ledger.restore_total(persisted.total_blocked_requests);

        let mut store = FilterListStore::new();
        for source in &config.subscriptions {
            if let Err(e) = store.add_list(source.clone(), "", SystemTime::UNIX_EPOCH) {
                warn!("Skipping subscription '{}': {}", source.id, e);
            }
        }

        let (commands_tx, commands_rx) = mpsc::channel(config.command_buffer.max(1));
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();

        let mut owner = Owner {
            engine,
            store,
            ledger,
            whitelist: persisted.whitelisted_domains.into_iter().collect(),
            settings,
            persistence_error: None,
            requested_generation: 0,
            installed_generation: 0,
            discarded_generations: 0,
            pending_fetches: 0,
            completions_tx,
            status_tx: watch::Sender::new(CoordinatorStatus {
                enabled: persisted.enabled,
                engine: EngineStatus::Inactive,
                whitelisted_domains: 0,
                global: GlobalStats::default(),
                requested_generation: 0,
                installed_generation: 0,
                discarded_generations: 0,
                pending_fetches: 0,
                persistence_error: None,
            }),
        };
        let status = owner.status_tx.subscribe();

        owner.request_recompile();
        tokio::spawn(owner.run(commands_rx, completions_rx));

        Self {
            commands: commands_tx,
            status,
        }
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| AdBlockError::ShutDown)?;
        rx.await.map_err(|_| AdBlockError::ShutDown)
    }

    async fn notify(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| AdBlockError::ShutDown)
    }

    /// Returns the previous value.
    pub async fn set_enabled(&self, enabled: bool) -> Result<bool> {
        self.request(|reply| Command::SetEnabled(enabled, reply)).await
    }

    /// Flips enablement and returns the new value.
    pub async fn toggle(&self) -> Result<bool> {
        self.request(Command::Toggle).await
    }

    pub fn is_enabled(&self) -> bool {
        self.status.borrow().enabled
    }

    /// Returns the normalized domain. Recompilation runs in the background.
    pub async fn add_to_whitelist(&self, domain: &str) -> Result<String> {
        let domain = domain.to_string();
        self.request(|reply| Command::AddToWhitelist(domain, reply)).await?
    }

    pub async fn remove_from_whitelist(&self, domain: &str) -> Result<String> {
        let domain = domain.to_string();
        self.request(|reply| Command::RemoveFromWhitelist(domain, reply)).await?
    }

    pub async fn is_domain_whitelisted(&self, domain: &str) -> Result<bool> {
        let domain = domain.to_string();
        self.request(|reply| Command::IsWhitelisted(domain, reply)).await
    }

    pub async fn whitelist(&self) -> Result<Vec<String>> {
        self.request(Command::Whitelist).await
    }

    pub async fn add_list(
        &self,
        source: FilterSource,
        raw_text: impl Into<String>,
        last_updated: SystemTime,
    ) -> Result<FilterList> {
        let raw_text = raw_text.into();
        self.request(|reply| Command::AddList {
            source,
            raw_text,
            last_updated,
            reply,
        })
        .await?
    }

    /// Entry point for the fetch collaborator. Returns whether the text changed.
    pub async fn ingest(
        &self,
        id: &str,
        raw_text: impl Into<String>,
        last_updated: SystemTime,
    ) -> Result<bool> {
        let id = id.to_string();
        let raw_text = raw_text.into();
        self.request(|reply| Command::Ingest {
            id,
            raw_text,
            last_updated,
            reply,
        })
        .await?
    }

    pub async fn remove_list(&self, id: &str) -> Result<FilterList> {
        let id = id.to_string();
        self.request(|reply| Command::RemoveList(id, reply)).await?
    }

    pub async fn set_list_enabled(&self, id: &str, enabled: bool) -> Result<bool> {
        let id = id.to_string();
        self.request(|reply| Command::SetListEnabled(id, enabled, reply)).await?
    }

    pub async fn lists(&self) -> Result<Vec<FilterList>> {
        self.request(Command::Lists).await
    }

    /// Fetches every registered list in the background. Returns the number
    /// of fetches started; [`settled`](Self::settled) waits for them.
    pub async fn refresh_lists(&self, fetcher: Arc<dyn FilterListFetcher>) -> Result<usize> {
        self.request(|reply| Command::RefreshLists(fetcher, reply)).await
    }

    pub async fn apply_to(&self, surface: SurfaceId) -> Result<ApplyOutcome> {
        self.request(|reply| Command::ApplyTo(surface, reply)).await?
    }

    pub async fn remove_from(&self, surface: SurfaceId) -> Result<bool> {
        self.request(|reply| Command::RemoveFrom(surface, reply)).await
    }

    /// Request-observation hook called by the host for every evaluated request.
    pub async fn request_evaluated(
        &self,
        url: &str,
        page_url: &str,
        was_blocked: bool,
    ) -> Result<()> {
        self.notify(Command::RequestEvaluated {
            url: url.to_string(),
            page_url: page_url.to_string(),
            was_blocked,
        })
        .await
    }

    pub async fn record_page_load(&self, page_url: &str) -> Result<()> {
        self.notify(Command::RecordPageLoad(page_url.to_string())).await
    }

    pub async fn page_stats(&self, page_url: &str) -> Result<PageStats> {
        let page_url = page_url.to_string();
        self.request(|reply| Command::PageStats(page_url, reply)).await
    }

    pub async fn global_stats(&self) -> Result<GlobalStats> {
        self.request(Command::GlobalStats).await
    }

    pub async fn clear_history(&self) -> Result<()> {
        self.request(Command::ClearHistory).await
    }

    /// Requests a compilation and returns its generation.
    pub async fn recompile(&self) -> Result<u64> {
        self.request(Command::Recompile).await
    }

    pub async fn active_rule_set(&self) -> Result<Option<Arc<CompiledRuleSet>>> {
        self.request(Command::ActiveRuleSet).await
    }

    pub fn status(&self) -> CoordinatorStatus {
        self.status.borrow().clone()
    }

    /// Status updates for observers; the current value is always available,
    /// so late subscribers still see degraded mode.
    pub fn subscribe(&self) -> watch::Receiver<CoordinatorStatus> {
        self.status.clone()
    }

    /// Waits until no compilation or fetch is outstanding.
    pub async fn settled(&self) -> Result<CoordinatorStatus> {
        let mut status = self.status.clone();
        let settled = status
            .wait_for(CoordinatorStatus::is_settled)
            .await
            .map_err(|_| AdBlockError::ShutDown)?;
        Ok(settled.clone())
    }

    /// Persists settings one last time and stops the owner task.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(Command::Shutdown).await
    }
}

struct Owner {
    engine: BlockingEngine,
    store: FilterListStore,
    ledger: StatisticsLedger,
    whitelist: WhitelistSet,
    settings: SettingsStore,
    persistence_error: Option<String>,
    requested_generation: u64,
    installed_generation: u64,
    discarded_generations: u64,
    pending_fetches: usize,
    completions_tx: mpsc::UnboundedSender<Completion>,
    status_tx: watch::Sender<CoordinatorStatus>,
}

impl Owner {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut completions: mpsc::UnboundedReceiver<Completion>,
    ) {
        info!("Ad block coordinator running");
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => {
                        if !self.handle(command).await {
                            break;
                        }
                    }
                    None => break,
                },
                Some(completion) = completions.recv() => self.complete(completion),
            }
        }
        info!("Ad block coordinator stopped");
    }

    /// Returns false when the owner should stop.
    async fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::SetEnabled(enabled, reply) => {
                let previous = self.set_enabled(enabled).await;
                let _ = reply.send(previous);
            }
            Command::Toggle(reply) => {
                let enabled = !self.engine.is_enabled();
                self.set_enabled(enabled).await;
                let _ = reply.send(enabled);
            }
            Command::AddToWhitelist(domain, reply) => {
                let result = self.whitelist.insert(&domain).map(|(domain, added)| {
                    info!("Added {} to whitelist", domain);
                    (domain, added)
                });
                let _ = reply.send(self.after_whitelist_change(result).await);
            }
            Command::RemoveFromWhitelist(domain, reply) => {
                let result = self.whitelist.remove(&domain).map(|(domain, removed)| {
                    info!("Removed {} from whitelist", domain);
                    (domain, removed)
                });
                let _ = reply.send(self.after_whitelist_change(result).await);
            }
            Command::IsWhitelisted(domain, reply) => {
                let covered =
                    normalize_domain(&domain).is_ok_and(|domain| self.whitelist.covers(&domain));
                let _ = reply.send(covered);
            }
            Command::Whitelist(reply) => {
                let _ = reply.send(self.whitelist.iter().map(str::to_string).collect());
            }
            Command::AddList {
                source,
                raw_text,
                last_updated,
                reply,
            } => {
                let result = self.store.add_list(source, raw_text, last_updated);
                if result.is_ok() {
                    self.request_recompile();
                }
                let _ = reply.send(result);
            }
            Command::Ingest {
                id,
                raw_text,
                last_updated,
                reply,
            } => {
                let _ = reply.send(self.ingest(&id, raw_text, last_updated));
            }
            Command::RemoveList(id, reply) => {
                let result = self.store.remove_list(&id);
                if result.as_ref().is_ok_and(|list| list.enabled) {
                    self.request_recompile();
                }
                let _ = reply.send(result);
            }
            Command::SetListEnabled(id, enabled, reply) => {
                let result = self.store.set_enabled(&id, enabled);
                if matches!(result, Ok(true)) {
                    self.request_recompile();
                }
                let _ = reply.send(result);
            }
            Command::Lists(reply) => {
                let _ = reply.send(self.store.lists());
            }
            Command::RefreshLists(fetcher, reply) => {
                let _ = reply.send(self.start_refresh(fetcher));
            }
            Command::ApplyTo(surface, reply) => {
                let _ = reply.send(self.engine.apply_to(surface));
            }
            Command::RemoveFrom(surface, reply) => {
                let _ = reply.send(self.engine.remove_from(surface));
            }
            Command::RequestEvaluated {
                url,
                page_url,
                was_blocked,
            } => {
                self.ledger.record_evaluated(&page_url);
                if was_blocked {
                    self.ledger.record_blocked(&url, &page_url);
                    info!("BLOCKED REQUEST: {} on page: {}", url, page_url);
                    self.persist().await;
                    self.publish();
                }
            }
            Command::RecordPageLoad(page_url) => {
                self.ledger.record_seen(&page_url);
                info!("Page load recorded: {}", page_url);
            }
            Command::PageStats(page_url, reply) => {
                let _ = reply.send(self.ledger.page_stats(&page_url));
            }
            Command::GlobalStats(reply) => {
                let _ = reply.send(self.ledger.global_stats());
            }
            Command::ClearHistory(reply) => {
                self.ledger.clear_history();
                info!("Page statistics cleared");
                let _ = reply.send(());
            }
            Command::Recompile(reply) => {
                let _ = reply.send(self.request_recompile());
            }
            Command::ActiveRuleSet(reply) => {
                let _ = reply.send(self.engine.active_rule_set());
            }
            Command::Shutdown(reply) => {
                self.persist().await;
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    fn complete(&mut self, completion: Completion) {
        match completion {
            Completion::Compiled {
                generation,
                result,
                whitelist,
            } => {
                if generation < self.requested_generation {
                    debug!(
                        "Discarding compilation {} superseded by {}",
                        generation, self.requested_generation
                    );
                    self.discarded_generations += 1;
                    self.publish();
                    return;
                }
                self.engine.install_compiled(result, &whitelist);
                self.installed_generation = generation;
                self.publish();
            }
            Completion::Fetched { id, result } => {
                self.pending_fetches = self.pending_fetches.saturating_sub(1);
                match result {
                    Ok(fetched) => {
                        if let Err(e) = self.ingest(&id, fetched.raw_text, fetched.last_updated) {
                            warn!("Keeping previous text of '{}': {}", id, e);
                        }
                    }
                    Err(e) => {
                        warn!("Failed to update filter list '{}', keeping stale copy: {}", id, e)
                    }
                }
                self.publish();
            }
        }
    }

    async fn set_enabled(&mut self, enabled: bool) -> bool {
        let previous = self.engine.is_enabled();
        if previous == enabled {
            return previous;
        }

        if self.engine.set_global_enabled(enabled) {
            self.request_recompile();
        }
        info!("Ad blocking toggled: {}", if enabled { "ON" } else { "OFF" });
        self.persist().await;
        self.publish();
        previous
    }

    async fn after_whitelist_change(&mut self, result: Result<(String, bool)>) -> Result<String> {
        let (domain, changed) = result?;
        if changed {
            self.persist().await;
            self.request_recompile();
        }
        Ok(domain)
    }

    fn ingest(&mut self, id: &str, raw_text: String, last_updated: SystemTime) -> Result<bool> {
        let changed = self.store.ingest(id, raw_text, last_updated)?;
        let enabled = self.store.get(id).is_some_and(|list| list.enabled);
        if changed && enabled {
            self.request_recompile();
        }
        Ok(changed)
    }

    fn start_refresh(&mut self, fetcher: Arc<dyn FilterListFetcher>) -> usize {
        let lists = self.store.lists();
        info!("Updating {} filter lists...", lists.len());

        for list in &lists {
            let source = list.source();
            let fetcher = fetcher.clone();
            let tx = self.completions_tx.clone();
            self.pending_fetches += 1;
            tokio::spawn(async move {
                let result = fetcher.fetch(&source).await;
                let _ = tx.send(Completion::Fetched { id: source.id, result });
            });
        }

        self.publish();
        lists.len()
    }

    /// Starts a compilation off the owner's path and returns its generation.
    fn request_recompile(&mut self) -> u64 {
        self.requested_generation += 1;
        let generation = self.requested_generation;

        let records = self.store.all_enabled_records();
        let whitelist = self.whitelist.clone();
        let compiler = self.engine.compiler().clone();
        let tx = self.completions_tx.clone();

        debug!("Requesting compilation {} over {} records", generation, records.len());
        tokio::task::spawn_blocking(move || {
            let result = compiler.compile(&records, &whitelist);
            let _ = tx.send(Completion::Compiled {
                generation,
                result,
                whitelist,
            });
        });

        self.publish();
        generation
    }

    async fn persist(&mut self) {
        let global = self.ledger.global_stats();
        let settings = PersistedSettings {
            enabled: self.engine.is_enabled(),
            total_blocked_requests: global.total_blocked,
            blocked_requests_this_session: global.blocked_this_session,
            whitelisted_domains: self.whitelist.iter().map(str::to_string).collect(),
        };

        match self.settings.save(&settings).await {
            Ok(()) => self.persistence_error = None,
            Err(e) => {
                error!("Failed to save settings: {}", e);
                self.persistence_error = Some(e.to_string());
            }
        }
    }

    fn publish(&self) {
        self.status_tx.send_replace(CoordinatorStatus {
            enabled: self.engine.is_enabled(),
            engine: self.engine.status(),
            whitelisted_domains: self.whitelist.len(),
            global: self.ledger.global_stats(),
            requested_generation: self.requested_generation,
            installed_generation: self.installed_generation,
            discarded_generations: self.discarded_generations,
            pending_fetches: self.pending_fetches,
            persistence_error: self.persistence_error.clone(),
        });
    }
}
