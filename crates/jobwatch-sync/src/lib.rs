//! Watch orchestration: configuration, reporting sinks and the polling scheduler.

mod config;
mod report;
mod scheduler;

use anyhow::{Context, Result};
use jobwatch_search::{FixtureSearchProvider, GoogleConfig, GoogleSearchProvider, SearchProvider};
use jobwatch_storage::DedupCache;
use std::time::Duration;
use tracing::info;

pub use config::{
    resolve_config_path, ConfigError, ProviderKind, QueryPlan, WatchConfig, CONFIG_ENV, DEFAULT_CONFIG_PATH,
    RUN_UNTIL_FORMAT,
};
pub use report::{format_job_listing, FanoutReportSink, JsonLinesReportSink, ReportSink, TracingReportSink};
pub use scheduler::{testing, Clock, CycleSummary, Scheduler, SchedulerSettings, SchedulerState, SystemClock};

pub const CRATE_NAME: &str = "jobwatch-sync";

pub fn build_provider(config: &WatchConfig) -> Result<Box<dyn SearchProvider>> {
    match config.provider {
        ProviderKind::Google => {
            let mut google = GoogleConfig {
                timeout: Duration::from_secs(config.http_timeout_secs),
                ..GoogleConfig::default()
            };
            if config.user_agent.is_some() {
                google.user_agent = config.user_agent.clone();
            }
            Ok(Box::new(GoogleSearchProvider::new(google)?))
        }
        ProviderKind::Fixture => {
            let path = config
                .fixture_path
                .as_ref()
                .context("provider `fixture` requires fixture_path")?;
            Ok(Box::new(FixtureSearchProvider::from_path(path)?))
        }
    }
}

/// Tracing output always; JSON lines too when `report_jsonl` is set.
pub fn build_sink(config: &WatchConfig) -> Box<dyn ReportSink> {
    match &config.report_jsonl {
        Some(path) => Box::new(FanoutReportSink::new(vec![
            Box::new(TracingReportSink),
            Box::new(JsonLinesReportSink::new(path.clone())),
        ])),
        None => Box::new(TracingReportSink),
    }
}

pub async fn load_cache(config: &WatchConfig) -> DedupCache {
    DedupCache::load(&config.cache_path, config.cache_max_size, config.persist_policy).await
}

pub async fn scheduler_from_config(config: &WatchConfig) -> Result<Scheduler> {
    let provider = build_provider(config)?;
    let sink = build_sink(config);
    let cache = load_cache(config).await;
    info!(
        provider = provider.name(),
        titles = config.job_titles.len(),
        time_zone = %config.time_zone,
        cache = %config.cache_path.display(),
        "watcher configured"
    );
    Ok(Scheduler::from_config(config, cache, provider, sink)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = "start_time: \"09:00:00\"\nend_time: \"17:00:00\"\ntime_zone: Europe/Berlin\n";

    fn config(extra: &str) -> WatchConfig {
        serde_yaml::from_str(&format!("{BASE}{extra}")).expect("yaml")
    }

    #[test]
    fn fixture_provider_without_path_is_an_error() {
        let cfg = config("job_titles: [\"Rust Engineer\"]\nprovider: fixture\n");
        assert!(build_provider(&cfg).is_err());
    }

    #[test]
    fn google_provider_builds_from_defaults() {
        let cfg = config("job_titles: [\"Rust Engineer\"]\n");
        let provider = build_provider(&cfg).expect("provider");
        assert_eq!(provider.name(), "google");
    }

    #[tokio::test]
    async fn scheduler_from_config_loads_fixture_and_cache() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fixture = dir.path().join("search.yaml");
        std::fs::write(
            &fixture,
            "queries:\n  - job_title: Rust Engineer\n    results:\n      - title: A\n        url: https://a\n",
        )
        .expect("write fixture");
        let mut cfg = config("job_titles: [\"Rust Engineer\"]\nprovider: fixture\n");
        cfg.fixture_path = Some(fixture);
        cfg.cache_path = dir.path().join("seen.json");

        let sched = scheduler_from_config(&cfg).await.expect("scheduler");
        assert_eq!(sched.state(), SchedulerState::WaitingForWindow);
        assert!(sched.cache().is_empty());
        assert_eq!(sched.schedule().last_run, None);
    }
}
