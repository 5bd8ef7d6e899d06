//! Ad Blocker Core Library
//!
//! Content-filtering engine for an embedded browser: filter-list storage and
//! parsing, whitelist-aware rule compilation, rule-set installation on
//! browsing surfaces, and blocking statistics with persisted settings.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use ad_blocker_core::prelude::*;
//! use std::sync::Arc;
//! use std::time::SystemTime;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let host = Arc::new(InMemoryHost::default());
//!     let config = AdBlockerConfig::in_dir("/tmp/ad-blocker");
//!     let coordinator = AdBlockCoordinator::start(config, host.clone()).await;
//!
//!     let source = FilterSource::new("custom", "file:///custom.txt", "Custom");
//!     coordinator.add_list(source, "||ads.example.com^", SystemTime::now()).await?;
//!     coordinator.settled().await?;
//!     coordinator.apply_to(SurfaceId(1)).await?;
//!
//!     let page = "https://news.example.org/";
//!     let url = "https://ads.example.com/x.js";
//!     if let Some(result) = host.check(SurfaceId(1), url, page, "script") {
//!         println!("Blocked: {}", result.should_block);
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod compiler;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod filters;
pub mod host;
pub mod matcher;
pub mod rules;
pub mod settings;
pub mod stats;
pub mod types;
pub mod whitelist;

pub use compiler::{RegexBackend, RuleCompiler, RuleListBackend};
pub use config::AdBlockerConfig;
pub use coordinator::{AdBlockCoordinator, CoordinatorStatus};
pub use engine::{ApplyOutcome, BlockingEngine, EngineStatus, SurfaceState};
pub use error::{AdBlockError, Result, RuleParseError};
pub use filters::{
    FetchedList, FilterList, FilterListFetcher, FilterListStore, FilterSource, MinimalRules,
};
pub use host::{InMemoryHost, SurfaceHost, SurfaceId};
pub use rules::{ActionKind, DomainScope, PatternKind, ResourceTypeMask, RuleRecord, parse_rule};
pub use stats::StatisticsLedger;
pub use types::{BlockResult, CompiledRuleSet, GlobalStats, MatchDecision, PageStats};
pub use whitelist::WhitelistSet;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::{
        AdBlockCoordinator, AdBlockError, AdBlockerConfig, ApplyOutcome, BlockResult,
        CoordinatorStatus, FilterSource, GlobalStats, InMemoryHost, PageStats, SurfaceHost,
        SurfaceId,
    };
}
