use ad_blocker_core::prelude::*;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::SystemTime;
use tracing_subscriber::EnvFilter;

const DEMO_RULES: &str = "\
! Demo list
||doubleclick.net^
||google-analytics.com^
*.ads.example.*
@@||cdn.example.net/ads/allowed.js
0.0.0.0 tracker.example.org
";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    println!("🛡️  Ad Blocker Core Demo");

    let config = match std::env::var_os("AD_BLOCKER_CONFIG") {
        Some(path) => AdBlockerConfig::load(path).await?,
        None => AdBlockerConfig::in_dir(std::env::temp_dir().join("ad-blocker-demo")),
    };

    let host = Arc::new(InMemoryHost::new(config.matcher_limits()));
    let coordinator = AdBlockCoordinator::start(config, host.clone()).await;

    // Every argument is a filter list file
    let mut paths = std::env::args().skip(1).peekable();
    if paths.peek().is_none() {
        let source = FilterSource::new("demo", "builtin:demo", "Demo rules");
        coordinator.add_list(source, DEMO_RULES, SystemTime::now()).await?;
    }
    for path in paths {
        let text = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read filter list {}", path))?;
        let source = FilterSource::new(path.clone(), format!("file://{}", path), path.clone());
        let list = coordinator.add_list(source, text, SystemTime::now()).await?;
        println!("📥 Loaded list '{}'", list.display_name);
    }

    coordinator.add_to_whitelist("ads.example.com").await?;
    let status = coordinator.settled().await?;
    println!("⚙️  Engine: {:?}", status.engine);

    let surface = SurfaceId(1);
    coordinator.apply_to(surface).await?;

    let page = "https://news.example.org/article";
    coordinator.record_page_load(page).await?;

    let test_requests = [
        ("https://www.example.org/index.html", "document"),
        ("https://stats.g.doubleclick.net/pixel.gif", "image"),
        ("https://www.google-analytics.com/analytics.js", "script"),
        ("https://ads.example.org/banner.png", "image"),
        ("https://ads.example.com/banner.png", "image"),
        ("https://cdn.example.net/ads/allowed.js", "script"),
        ("https://tracker.example.org/t.js", "script"),
    ];

    println!("\n📋 Testing URLs on {}:", page);
    for (url, request_type) in test_requests {
        let blocked = host
            .check(surface, url, page, request_type)
            .is_some_and(|result| result.should_block);
        coordinator.request_evaluated(url, page, blocked).await?;
        let status = if blocked { "🚫 BLOCKED" } else { "✅ ALLOWED" };
        println!("{} - {}", status, url);
    }

    let page_stats = coordinator.page_stats(page).await?;
    let global = coordinator.global_stats().await?;
    println!("\n📈 Statistics:");
    println!("Requests seen on page: {}", page_stats.total_requests_seen);
    println!("Blocked on page: {}", page_stats.blocked_count);
    println!("Block percentage: {:.1}%", page_stats.block_percentage());
    println!("Blocked this session: {}", global.blocked_this_session);
    println!("Blocked all time: {}", global.total_blocked);

    coordinator.shutdown().await?;
    Ok(())
}
