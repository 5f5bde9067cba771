//! Watcher configuration: YAML (or the older JSON metadata shape) plus env overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, NaiveTime, Utc};
use chrono_tz::Tz;
use jobwatch_core::{localize, time_of_day, OperatingWindow, ScheduleState};
use jobwatch_search::{SearchQuery, DEFAULT_SITES};
use jobwatch_storage::PersistPolicy;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CONFIG_ENV: &str = "JOBWATCH_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "jobwatch.yaml";
pub const RUN_UNTIL_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("unknown time zone {0:?}")]
    UnknownTimeZone(String),
    #[error("invalid run_until {0:?}, expected YYYY-MM-DD HH:MM:SS")]
    InvalidRunUntil(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    #[default]
    Google,
    Fixture,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    pub job_titles: Vec<String>,
    /// Optional qualifiers; each title is searched once per entry.
    #[serde(default)]
    pub experience: Vec<String>,
    #[serde(default = "default_sites")]
    pub sites: Vec<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default = "default_lang")]
    pub lang: String,
    #[serde(default = "default_results_per_query")]
    pub results_per_query: usize,
    #[serde(with = "time_of_day")]
    pub start_time: NaiveTime,
    #[serde(with = "time_of_day")]
    pub end_time: NaiveTime,
    #[serde(alias = "timezone")]
    pub time_zone: String,
    /// Local datetime in `time_zone` after which the watcher stops.
    #[serde(default)]
    pub run_until: Option<String>,
    #[serde(default = "default_cache_path")]
    pub cache_path: PathBuf,
    #[serde(default = "default_cache_max_size")]
    pub cache_max_size: usize,
    #[serde(default)]
    pub persist_policy: PersistPolicy,
    #[serde(default = "default_run_interval_secs")]
    pub run_interval_secs: u64,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_record_delay_ms")]
    pub record_delay_ms: u64,
    #[serde(default = "default_title_delay_ms")]
    pub title_delay_ms: u64,
    #[serde(default)]
    pub provider: ProviderKind,
    #[serde(default)]
    pub fixture_path: Option<PathBuf>,
    #[serde(default)]
    pub report_jsonl: Option<PathBuf>,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
}

fn default_sites() -> Vec<String> {
    DEFAULT_SITES.iter().map(|s| s.to_string()).collect()
}

fn default_lang() -> String {
    "en".to_string()
}

fn default_results_per_query() -> usize {
    10
}

fn default_cache_path() -> PathBuf {
    PathBuf::from("./data/seen_jobs.json")
}

fn default_cache_max_size() -> usize {
    10_000
}

fn default_run_interval_secs() -> u64 {
    3600
}

fn default_poll_interval_secs() -> u64 {
    30
}

fn default_record_delay_ms() -> u64 {
    1000
}

fn default_title_delay_ms() -> u64 {
    2000
}

fn default_http_timeout_secs() -> u64 {
    20
}

/// Config file location: explicit path, then `JOBWATCH_CONFIG`, then `./jobwatch.yaml`.
pub fn resolve_config_path(explicit: Option<PathBuf>) -> PathBuf {
    explicit
        .or_else(|| std::env::var(CONFIG_ENV).ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

impl WatchConfig {
    /// Reads, applies environment overrides and validates.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut config = Self::from_path(path)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// `JOBWATCH_CACHE_PATH` and `JOBWATCH_TIME_ZONE` win over file values.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(path) = lookup("JOBWATCH_CACHE_PATH").filter(|v| !v.trim().is_empty()) {
            self.cache_path = PathBuf::from(path);
        }
        if let Some(tz) = lookup("JOBWATCH_TIME_ZONE").filter(|v| !v.trim().is_empty()) {
            self.time_zone = tz;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.job_titles.is_empty() {
            return Err(ConfigError::Invalid("job_titles must not be empty".into()));
        }
        if self.job_titles.iter().any(|t| t.trim().is_empty()) {
            return Err(ConfigError::Invalid("job_titles must not contain blank entries".into()));
        }
        if self.cache_max_size == 0 {
            return Err(ConfigError::Invalid("cache_max_size must be at least 1".into()));
        }
        if self.run_interval_secs == 0 {
            return Err(ConfigError::Invalid("run_interval_secs must be positive".into()));
        }
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid("poll_interval_secs must be positive".into()));
        }
        if self.results_per_query == 0 {
            return Err(ConfigError::Invalid("results_per_query must be positive".into()));
        }
        if self.provider == ProviderKind::Fixture && self.fixture_path.is_none() {
            return Err(ConfigError::Invalid("provider `fixture` requires fixture_path".into()));
        }
        self.tz()?;
        self.run_until_utc()?;
        Ok(())
    }

    pub fn tz(&self) -> Result<Tz, ConfigError> {
        self.time_zone
            .trim()
            .parse::<Tz>()
            .map_err(|_| ConfigError::UnknownTimeZone(self.time_zone.clone()))
    }

    pub fn run_until_utc(&self) -> Result<Option<DateTime<Utc>>, ConfigError> {
        let Some(raw) = self.run_until.as_deref() else {
            return Ok(None);
        };
        let naive = NaiveDateTime::parse_from_str(raw.trim(), RUN_UNTIL_FORMAT)
            .map_err(|_| ConfigError::InvalidRunUntil(raw.to_string()))?;
        let tz = self.tz()?;
        Ok(Some(localize(tz, naive.date(), naive.time()).with_timezone(&Utc)))
    }

    pub fn window(&self) -> OperatingWindow {
        OperatingWindow::new(self.start_time, self.end_time)
    }

    pub fn run_interval(&self) -> Duration {
        Duration::from_secs(self.run_interval_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn record_delay(&self) -> Duration {
        Duration::from_millis(self.record_delay_ms)
    }

    pub fn title_delay(&self) -> Duration {
        Duration::from_millis(self.title_delay_ms)
    }

    pub fn schedule_state(&self) -> Result<ScheduleState, ConfigError> {
        Ok(ScheduleState::new(self.window(), self.tz()?, self.run_interval()))
    }

    pub fn query_plan(&self) -> QueryPlan {
        QueryPlan {
            job_titles: self.job_titles.iter().map(|t| t.trim().to_string()).collect(),
            experience: self
                .experience
                .iter()
                .map(|e| e.trim().to_string())
                .filter(|e| !e.is_empty())
                .collect(),
            sites: self.sites.clone(),
            results_per_query: self.results_per_query,
            lang: self.lang.clone(),
            region: self.region.clone(),
        }
    }
}

/// Ordered list of searches issued each cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryPlan {
    pub job_titles: Vec<String>,
    pub experience: Vec<String>,
    pub sites: Vec<String>,
    pub results_per_query: usize,
    pub lang: String,
    pub region: Option<String>,
}

impl QueryPlan {
    pub fn titles(job_titles: &[&str]) -> Self {
        Self {
            job_titles: job_titles.iter().map(|t| t.to_string()).collect(),
            experience: Vec::new(),
            sites: default_sites(),
            results_per_query: default_results_per_query(),
            lang: default_lang(),
            region: None,
        }
    }

    /// Titles in configured order; with experience levels, each title expands in place.
    pub fn queries(&self, look_back: DateTime<Utc>) -> Vec<SearchQuery> {
        let levels: Vec<Option<String>> = if self.experience.is_empty() {
            vec![None]
        } else {
            self.experience.iter().cloned().map(Some).collect()
        };
        let mut out = Vec::with_capacity(self.job_titles.len() * levels.len());
        for title in &self.job_titles {
            for level in &levels {
                let mut query = SearchQuery::new(title.clone(), look_back).with_experience(level.clone());
                query.sites = self.sites.clone();
                query.num_results = self.results_per_query;
                query.lang = self.lang.clone();
                query.region = self.region.clone();
                out.push(query);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const YAML: &str = r#"
job_titles: ["Rust Engineer", "Platform Engineer"]
experience: ["Senior", "Staff"]
start_time: "09:00"
end_time: "17:30:00"
time_zone: Europe/Berlin
run_until: "2026-06-01 18:00:00"
cache_path: /tmp/jobwatch/seen.json
cache_max_size: 500
persist_policy: end_of_cycle
run_interval_secs: 1800
"#;

    #[test]
    fn parses_yaml_with_defaults() {
        let config: WatchConfig = serde_yaml::from_str(YAML).expect("yaml");
        config.validate().expect("valid");
        assert_eq!(config.sites, default_sites());
        assert_eq!(config.results_per_query, 10);
        assert_eq!(config.persist_policy, PersistPolicy::EndOfCycle);
        assert_eq!(config.provider, ProviderKind::Google);
        assert_eq!(config.poll_interval(), Duration::from_secs(30));
        assert_eq!(config.tz().expect("tz"), chrono_tz::Europe::Berlin);
        // 18:00 CEST is 16:00 UTC.
        assert_eq!(
            config.run_until_utc().expect("run_until"),
            Some(DateTime::parse_from_rfc3339("2026-06-01T16:00:00Z").expect("ts").with_timezone(&Utc))
        );
    }

    #[test]
    fn accepts_legacy_metadata_json_shape() {
        let json = r#"{
            "job_titles": ["Software Engineer"],
            "experience": ["Entry Level"],
            "region": "us",
            "start_time": "2024-12-10 09:00:00",
            "end_time": "2024-12-10 17:00:00",
            "time_zone": "America/New_York"
        }"#;
        let config: WatchConfig = serde_yaml::from_str(json).expect("json as yaml");
        config.validate().expect("valid");
        assert_eq!(time_of_day::format(&config.start_time), "09:00:00");
        assert_eq!(time_of_day::format(&config.end_time), "17:00:00");
        assert_eq!(config.region.as_deref(), Some("us"));
    }

    #[test]
    fn window_times_survive_a_serialize_cycle() {
        let config: WatchConfig = serde_yaml::from_str(YAML).expect("yaml");
        let text = serde_yaml::to_string(&config).expect("serialize");
        let again: WatchConfig = serde_yaml::from_str(&text).expect("reparse");
        assert_eq!(again.window(), config.window());
    }

    #[test]
    fn rejects_invalid_configs() {
        let base: WatchConfig = serde_yaml::from_str(YAML).expect("yaml");

        let mut c = base.clone();
        c.job_titles.clear();
        assert!(matches!(c.validate(), Err(ConfigError::Invalid(_))));

        let mut c = base.clone();
        c.job_titles.push("  ".into());
        assert!(matches!(c.validate(), Err(ConfigError::Invalid(_))));

        let mut c = base.clone();
        c.cache_max_size = 0;
        assert!(matches!(c.validate(), Err(ConfigError::Invalid(_))));

        let mut c = base.clone();
        c.time_zone = "Mars/Olympus".into();
        assert!(matches!(c.validate(), Err(ConfigError::UnknownTimeZone(_))));

        let mut c = base.clone();
        c.run_until = Some("tomorrow".into());
        assert!(matches!(c.validate(), Err(ConfigError::InvalidRunUntil(_))));

        let mut c = base;
        c.provider = ProviderKind::Fixture;
        assert!(matches!(c.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn missing_file_and_bad_times_are_errors() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = WatchConfig::from_path(dir.path().join("nope.yaml"));
        assert!(matches!(missing, Err(ConfigError::Read { .. })));

        let bad = dir.path().join("bad.yaml");
        std::fs::write(&bad, "job_titles: [a]\nstart_time: '9am'\nend_time: '17:00'\ntime_zone: UTC\n")
            .expect("write");
        assert!(matches!(WatchConfig::from_path(&bad), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn env_overrides_replace_file_values() {
        let mut config: WatchConfig = serde_yaml::from_str(YAML).expect("yaml");
        let env: HashMap<&str, &str> = [
            ("JOBWATCH_CACHE_PATH", "/var/lib/jobwatch/seen.json"),
            ("JOBWATCH_TIME_ZONE", "UTC"),
        ]
        .into_iter()
        .collect();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(config.cache_path, PathBuf::from("/var/lib/jobwatch/seen.json"));
        assert_eq!(config.tz().expect("tz"), Tz::UTC);
    }

    #[test]
    fn query_plan_expands_titles_by_experience_in_order() {
        let config: WatchConfig = serde_yaml::from_str(YAML).expect("yaml");
        let look_back = DateTime::parse_from_rfc3339("2026-03-10T09:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);
        let labels: Vec<_> = config
            .query_plan()
            .queries(look_back)
            .iter()
            .map(|q| q.label())
            .collect();
        assert_eq!(
            labels,
            vec![
                "Rust Engineer (Senior)",
                "Rust Engineer (Staff)",
                "Platform Engineer (Senior)",
                "Platform Engineer (Staff)",
            ]
        );

        let plain = QueryPlan::titles(&["A", "B"]).queries(look_back);
        assert_eq!(plain.len(), 2);
        assert!(plain.iter().all(|q| q.experience.is_none() && q.after == look_back));
    }
}
