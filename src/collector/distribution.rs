use std::collections::{BTreeMap, HashMap};

use super::series::{non_empty, Point};

/// Running frequency table keyed by a value rounded to the nearest integer.
/// Counts only grow; ring eviction does not touch them.
#[derive(Debug, Default, Clone)]
pub struct FrequencyTable {
    counts: BTreeMap<u64, u64>,
}

impl FrequencyTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts one observation. Negative or non-finite values land in 0.
    pub fn observe(&mut self, value: f64) {
        let key = round_key(value);
        *self.counts.entry(key).or_insert(0) += 1;
    }

    pub fn get(&self, key: u64) -> u64 {
        self.counts.get(&key).copied().unwrap_or(0)
    }

    /// `{x: key, y: frequency}` ordered by key; `{0,0}` when empty.
    pub fn points(&self) -> Vec<Point> {
        non_empty(
            self.counts
                .iter()
                .map(|(&k, &n)| Point::new(k, n as f64))
                .collect(),
        )
    }

    pub fn clear(&mut self) {
        self.counts.clear();
    }
}

/// Per-location running average of watcher counts. Locations get ids in
/// first-seen order.
#[derive(Debug, Default, Clone)]
pub struct LocationAverages {
    ids: HashMap<String, u64>,
    /// Indexed by location id.
    entries: Vec<(String, u64)>,
}

impl LocationAverages {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds `count` into the average for `location`:
    /// `round((prev + count) / 2)`, or `count` for a new location.
    pub fn observe(&mut self, location: &str, count: u64) {
        match self.ids.get(location) {
            Some(&id) => {
                if let Some(entry) = self.entries.get_mut(id as usize) {
                    entry.1 = (entry.1 + count + 1) / 2;
                }
            }
            None => {
                let id = self.entries.len() as u64;
                self.ids.insert(location.to_owned(), id);
                self.entries.push((location.to_owned(), count));
            }
        }
    }

    pub fn average(&self, location: &str) -> Option<u64> {
        let id = *self.ids.get(location)?;
        self.entries.get(id as usize).map(|(_, avg)| *avg)
    }

    /// `{x: location id, y: average}` by id; `{0,0}` when empty.
    pub fn points(&self) -> Vec<Point> {
        non_empty(
            self.entries
                .iter()
                .enumerate()
                .map(|(id, (_, avg))| Point::new(id as u64, *avg as f64))
                .collect(),
        )
    }

    /// Location to id, for labelling the distribution's x axis.
    pub fn location_map(&self) -> BTreeMap<String, u64> {
        self.ids.iter().map(|(k, &v)| (k.clone(), v)).collect()
    }

    pub fn clear(&mut self) {
        self.ids.clear();
        self.entries.clear();
    }
}

fn round_key(value: f64) -> u64 {
    if value.is_finite() && value > 0.0 {
        value.round() as u64
    } else {
        0
    }
}
