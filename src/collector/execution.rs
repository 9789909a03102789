use std::collections::BTreeMap;

use serde::Serialize;

use crate::protocol::sample::{CallPhase, ServiceCallTiming};

/// `(service, function)` within one module.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FunctionKey {
    pub service: String,
    pub func: String,
}

impl FunctionKey {
    fn of(call: &ServiceCallTiming) -> Self {
        Self {
            service: call.service.clone(),
            func: call.func.clone(),
        }
    }
}

/// Aggregate stats of one instrumented function. Times are whole
/// milliseconds.
#[derive(Debug, Clone, PartialEq)]
struct ExecutionStats {
    count: u64,
    sync_ms: u64,
    async_ms: u64,
    async_seen: bool,
    impact_score: f64,
}

impl ExecutionStats {
    fn first_call(time_ms: f64) -> Self {
        let mut stats = Self {
            count: 1,
            sync_ms: round_ms(time_ms),
            async_ms: 0,
            async_seen: false,
            impact_score: 0.0,
        };
        stats.rescore();
        stats
    }

    fn sync_call(&mut self, time_ms: f64) {
        self.count += 1;
        self.sync_ms = round_ms((self.sync_ms as f64 + time_ms) / 2.0);
        self.rescore();
    }

    fn async_completion(&mut self, time_ms: f64) {
        self.async_ms = if self.async_seen {
            round_ms((self.async_ms as f64 + time_ms) / 2.0)
        } else {
            round_ms(time_ms)
        };
        self.async_seen = true;
        self.rescore();
    }

    fn rescore(&mut self) {
        self.impact_score = (self.sync_ms + self.async_ms) as f64 * self.count as f64 / 100.0;
    }
}

/// One row of the execution ranking.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionExecution {
    pub service: String,
    pub func: String,
    pub sync_exec_ms: u64,
    pub async_exec_ms: u64,
    pub count: u64,
    pub impact_score: f64,
}

/// Outcome of registering a service call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Created,
    Updated,
    /// Async completion for a function with no prior sync call.
    MissingRow,
}

/// Execution stats keyed by module, then `(service, function)`. Rows are
/// never evicted.
#[derive(Debug, Default, Clone)]
pub struct ExecutionTable {
    modules: BTreeMap<String, BTreeMap<FunctionKey, ExecutionStats>>,
}

impl ExecutionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, call: &ServiceCallTiming) -> Registration {
        match call.phase {
            CallPhase::Sync => self.register_sync(call),
            CallPhase::Async => self.register_async(call),
        }
    }

    fn register_sync(&mut self, call: &ServiceCallTiming) -> Registration {
        let functions = self.modules.entry(call.module.clone()).or_default();
        let key = FunctionKey::of(call);
        match functions.get_mut(&key) {
            Some(stats) => {
                stats.sync_call(call.time_ms);
                Registration::Updated
            }
            None => {
                functions.insert(key, ExecutionStats::first_call(call.time_ms));
                Registration::Created
            }
        }
    }

    fn register_async(&mut self, call: &ServiceCallTiming) -> Registration {
        let row = self
            .modules
            .get_mut(&call.module)
            .and_then(|functions| functions.get_mut(&FunctionKey::of(call)));
        match row {
            Some(stats) => {
                stats.async_completion(call.time_ms);
                Registration::Updated
            }
            None => Registration::MissingRow,
        }
    }

    /// Rows of `module` sorted by descending impact score, truncated to
    /// `limit` when given. Ties keep `(service, function)` order.
    pub fn top_impact(&self, module: &str, limit: Option<usize>) -> Vec<FunctionExecution> {
        let Some(functions) = self.modules.get(module) else {
            return Vec::new();
        };

        let mut rows: Vec<FunctionExecution> = functions
            .iter()
            .map(|(key, stats)| FunctionExecution {
                service: key.service.clone(),
                func: key.func.clone(),
                sync_exec_ms: stats.sync_ms,
                async_exec_ms: stats.async_ms,
                count: stats.count,
                impact_score: stats.impact_score,
            })
            .collect();

        rows.sort_by(|a, b| b.impact_score.total_cmp(&a.impact_score));
        if let Some(limit) = limit {
            rows.truncate(limit);
        }
        rows
    }

    pub fn function_count(&self, module: &str) -> usize {
        self.modules.get(module).map_or(0, BTreeMap::len)
    }

    pub fn modules(&self) -> impl Iterator<Item = &str> {
        self.modules.keys().map(String::as_str)
    }

    /// Drops every row of `module`. Returns whether anything was removed.
    pub fn clear_module(&mut self, module: &str) -> bool {
        self.modules.remove(module).is_some()
    }

    pub fn clear(&mut self) {
        self.modules.clear();
    }
}

fn round_ms(ms: f64) -> u64 {
    if ms.is_finite() && ms > 0.0 {
        ms.round() as u64
    } else {
        0
    }
}
