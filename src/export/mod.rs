pub mod health;

use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::collector::execution::FunctionExecution;
use crate::collector::series::{Point, Window};
use crate::collector::{Collector, EventAnnotation};
use crate::protocol::sample::{DigestTiming, ModuleExistence};

/// Everything the panel plots, derived at one instant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeriesSnapshot {
    pub taken_at_ms: u64,
    pub digest_timing: Vec<Point>,
    pub digest_rate: Vec<Point>,
    pub digest_time_distribution: Vec<Point>,
    pub watcher_count: Vec<Point>,
    pub watcher_count_distribution: Vec<Point>,
    pub location_map: BTreeMap<String, u64>,
    pub last_digest: Option<DigestTiming>,
    pub digests_last_second: usize,
    /// Events within the digest timing window, newest first.
    pub events: Vec<EventAnnotation>,
    /// Function rankings per module, most impactful first.
    pub modules: BTreeMap<String, Vec<FunctionExecution>>,
    pub module_check: Option<ModuleCheck>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleCheck {
    pub module: String,
    pub services: Option<Vec<String>>,
}

impl From<&ModuleExistence> for ModuleCheck {
    fn from(m: &ModuleExistence) -> Self {
        Self {
            module: m.module_name.clone(),
            services: m.services.clone(),
        }
    }
}

impl SeriesSnapshot {
    /// Derives every series from `collector` with the given geometry.
    pub fn capture(
        collector: &Collector,
        timing: Window,
        rate: Window,
        modules: &[String],
        top: Option<usize>,
    ) -> Self {
        let now = collector.now_ms();
        let digest_timing = collector.digest_timing_series(timing);
        let events_since = digest_timing.first().map_or(0, |p| p.x);

        Self {
            taken_at_ms: now,
            digest_rate: collector.digest_rate_series(rate),
            digest_time_distribution: collector.digest_time_distribution(),
            watcher_count: collector.watcher_count_series(),
            watcher_count_distribution: collector.watcher_count_distribution(),
            location_map: collector.location_map(),
            last_digest: collector.last_digest_timing(),
            digests_last_second: collector.digests_in_last_second(),
            events: collector.event_annotations(events_since),
            modules: modules
                .iter()
                .map(|m| (m.clone(), collector.top_impact(m, top)))
                .collect(),
            module_check: collector.module_check().map(ModuleCheck::from),
            digest_timing,
        }
    }
}

/// Writes snapshots as JSON to a file, or to stdout when no path is set.
#[derive(Debug, Clone, Default)]
pub struct SnapshotWriter {
    output: Option<PathBuf>,
    pretty: bool,
}

impl SnapshotWriter {
    pub fn new(output: Option<PathBuf>) -> Self {
        Self {
            output,
            pretty: true,
        }
    }

    pub fn compact(mut self) -> Self {
        self.pretty = false;
        self
    }

    pub fn write(&self, snapshot: &SeriesSnapshot) -> Result<()> {
        let body = self.render(snapshot)?;
        match &self.output {
            Some(path) => std::fs::write(path, body)
                .with_context(|| format!("writing snapshot to {}", path.display())),
            None => {
                let mut out = std::io::stdout().lock();
                out.write_all(body.as_bytes())
                    .and_then(|_| out.flush())
                    .context("writing snapshot to stdout")
            }
        }
    }

    pub fn render(&self, snapshot: &SeriesSnapshot) -> Result<String> {
        let mut body = if self.pretty {
            serde_json::to_string_pretty(snapshot)
        } else {
            serde_json::to_string(snapshot)
        }
        .context("encoding snapshot")?;
        body.push('\n');
        Ok(body)
    }
}
