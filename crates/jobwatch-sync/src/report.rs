//! Reporting sinks for newly discovered postings.

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use jobwatch_core::NewJobEvent;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::info;

#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn report(&self, event: &NewJobEvent) -> Result<()>;
}

/// Framed, human readable block for one new posting.
pub fn format_job_listing(event: &NewJobEvent) -> String {
    let separator = "=".repeat(80);
    let or_na = |v: &Option<String>| v.as_deref().filter(|s| !s.trim().is_empty()).unwrap_or("N/A").to_string();
    format!(
        "\n{separator}\nJob {}:\nSearch Query: {}\nJob Title: {}\nURL: {}\nDescription: {}\n{separator}\n",
        event.sequence,
        event.job_title,
        or_na(&event.record.title),
        or_na(&event.record.url),
        or_na(&event.record.description),
    )
}

/// Writes each report through `tracing` at info level.
#[derive(Debug, Default)]
pub struct TracingReportSink;

#[async_trait]
impl ReportSink for TracingReportSink {
    async fn report(&self, event: &NewJobEvent) -> Result<()> {
        info!(
            target: "jobwatch::report",
            sequence = event.sequence,
            job_title = %event.job_title,
            url = event.record.url.as_deref().unwrap_or_default(),
            "new job found{}",
            format_job_listing(event)
        );
        Ok(())
    }
}

/// Appends one JSON object per report to a file, creating it on first use.
#[derive(Debug)]
pub struct JsonLinesReportSink {
    path: PathBuf,
    file: Mutex<Option<fs::File>>,
}

impl JsonLinesReportSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Mutex::new(None),
        }
    }
}

#[async_trait]
impl ReportSink for JsonLinesReportSink {
    async fn report(&self, event: &NewJobEvent) -> Result<()> {
        let mut line = serde_json::to_vec(event).context("serializing new job event")?;
        line.push(b'\n');

        let mut guard = self.file.lock().await;
        if guard.is_none() {
            if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
            let file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await
                .with_context(|| format!("opening {}", self.path.display()))?;
            *guard = Some(file);
        }
        if let Some(file) = guard.as_mut() {
            file.write_all(&line)
                .await
                .with_context(|| format!("appending to {}", self.path.display()))?;
            file.flush()
                .await
                .with_context(|| format!("flushing {}", self.path.display()))?;
        }
        Ok(())
    }
}

/// Forwards every report to each inner sink; the first failure is returned after all ran.
#[derive(Default)]
pub struct FanoutReportSink {
    sinks: Vec<Box<dyn ReportSink>>,
}

impl FanoutReportSink {
    pub fn new(sinks: Vec<Box<dyn ReportSink>>) -> Self {
        Self { sinks }
    }

    pub fn push(&mut self, sink: Box<dyn ReportSink>) {
        self.sinks.push(sink);
    }
}

#[async_trait]
impl ReportSink for FanoutReportSink {
    async fn report(&self, event: &NewJobEvent) -> Result<()> {
        let mut first_err = None;
        for sink in &self.sinks {
            if let Err(err) = sink.report(event).await {
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
