//! Windowed binning of ring-buffered samples into fixed-length series.

use serde::{Deserialize, Serialize};

use crate::protocol::sample::Timestamped;

/// One plot point. `x` is a bucket start (epoch ms) for windowed series, or
/// a key for distributions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: u64,
    pub y: f64,
}

impl Point {
    pub const ZERO: Point = Point { x: 0, y: 0.0 };

    pub fn new(x: u64, y: f64) -> Self {
        Self { x, y }
    }
}

/// How samples falling in the same bucket are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregation {
    /// Number of samples in the bucket; empty buckets are 0.
    Count,
    /// Running `(existing + sample) / 2` merge. Each bucket starts from the
    /// previous bucket's final value (0 for the oldest).
    Average,
}

/// Geometry of a trailing window: `buckets` buckets of `width_ms` each,
/// ending at the query's `now`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub buckets: usize,
    pub width_ms: u64,
}

impl Window {
    pub const fn new(buckets: usize, width_ms: u64) -> Self {
        Self { buckets, width_ms }
    }

    /// Start of the window (inclusive) for a given `now`.
    pub fn start(&self, now: u64) -> u64 {
        now.saturating_sub(self.span_ms())
    }

    pub fn span_ms(&self) -> u64 {
        self.width_ms.saturating_mul(self.buckets as u64)
    }

    /// Bucket holding `ts`, or `None` outside `[start, now]`. The newest
    /// bucket is closed at `now`.
    fn bucket_of(&self, start: u64, now: u64, ts: u64) -> Option<usize> {
        if ts < start || ts > now || self.width_ms == 0 {
            return None;
        }
        let idx = ((ts - start) / self.width_ms) as usize;
        Some(idx.min(self.buckets.saturating_sub(1)))
    }
}

/// Bins `newest_first` samples into `window.buckets` points ending at `now`.
///
/// Bucket `i` covers `[start + i*w, start + (i+1)*w)` with `x = start + i*w`.
/// The scan stops at the first sample older than the window start, so a
/// late-arriving old sample sitting behind that point is not counted even
/// if it is in range. Samples stamped after `now` are skipped.
///
/// Averaging merges every sample, newest first, into the bucket's initial
/// value, which is the previous bucket's final value. The merge chain is
/// linear in that initial value, so the scan merges from 0 and the carry is
/// folded in afterwards, oldest bucket first: `init / 2^k + merged`.
pub fn windowed<'a, T, I, F>(
    newest_first: I,
    now: u64,
    window: Window,
    aggregation: Aggregation,
    value: F,
) -> Vec<Point>
where
    T: Timestamped + 'a,
    I: IntoIterator<Item = &'a T>,
    F: Fn(&T) -> f64,
{
    let start = window.start(now);
    let mut points: Vec<Point> = (0..window.buckets)
        .map(|i| {
            let offset = (i as u64).saturating_mul(window.width_ms);
            Point::new(start.saturating_add(offset), 0.0)
        })
        .collect();
    if points.is_empty() {
        return points;
    }
    // Samples merged per bucket, for the carry fold.
    let mut merged = vec![0u32; window.buckets];

    for item in newest_first {
        let ts = item.timestamp();
        if ts < start {
            break;
        }
        let Some(idx) = window.bucket_of(start, now, ts) else {
            continue;
        };

        let point = &mut points[idx];
        match aggregation {
            Aggregation::Count => point.y += 1.0,
            Aggregation::Average => point.y = (point.y + value(item)) / 2.0,
        }
        merged[idx] = merged[idx].saturating_add(1);
    }

    if aggregation == Aggregation::Average {
        for i in 1..points.len() {
            let carry = points[i - 1].y;
            let k = i32::try_from(merged[i]).unwrap_or(i32::MAX);
            points[i].y += carry * 0.5f64.powi(k);
        }
    }

    points
}

/// Replaces an empty series with the single `{0,0}` sentinel plot widgets
/// expect.
pub fn non_empty(mut points: Vec<Point>) -> Vec<Point> {
    if points.is_empty() {
        points.push(Point::ZERO);
    }
    points
}

#[cfg(test)]
mod tests {
    use super::*;

    impl Timestamped for (u64, f64) {
        fn timestamp(&self) -> u64 {
            self.0
        }
    }

    fn run(samples: &[(u64, f64)], now: u64, window: Window, agg: Aggregation) -> Vec<Point> {
        windowed(samples.iter().rev(), now, window, agg, |s| s.1)
    }

    fn ys(points: &[Point]) -> Vec<f64> {
        points.iter().map(|p| p.y).collect()
    }

    #[test]
    fn test_bucket_geometry() {
        let t = 10_000;
        let points = run(&[], t, Window::new(5, 100), Aggregation::Count);
        let xs: Vec<u64> = points.iter().map(|p| p.x).collect();
        assert_eq!(xs, vec![t - 500, t - 400, t - 300, t - 200, t - 100]);
        assert_eq!(ys(&points), vec![0.0; 5]);
    }

    #[test]
    fn test_average_scenario() {
        // Window ends at the newest sample.
        let t = 100_000;
        let samples = [(t, 2.0), (t + 50, 3.0), (t + 120, 1.0), (t + 260, 4.0), (t + 400, 2.0)];
        let points = run(&samples, t + 400, Window::new(5, 100), Aggregation::Average);

        let xs: Vec<u64> = points.iter().map(|p| p.x).collect();
        assert_eq!(xs, vec![t - 100, t, t + 100, t + 200, t + 300]);
        // [t, t+100): (0 + 3)/2 = 1.5, then (1.5 + 2)/2 = 1.75.
        // Later buckets start from the previous bucket's value.
        assert_eq!(ys(&points), vec![0.0, 1.75, 1.375, 2.6875, 2.34375]);
    }

    #[test]
    fn test_count_scenario() {
        let t = 100_000;
        let samples = [(t, 2.0), (t + 50, 3.0), (t + 120, 1.0), (t + 260, 4.0), (t + 400, 2.0)];
        let points = run(&samples, t + 400, Window::new(5, 100), Aggregation::Count);
        assert_eq!(ys(&points), vec![0.0, 2.0, 1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_average_carries_forward_over_gaps() {
        let now = 1_000;
        let samples = [(450, 6.0), (820, 2.0)];
        let points = run(&samples, now, Window::new(5, 100), Aggregation::Average);
        // Buckets start at 500: sample 450 is outside the window.
        assert_eq!(ys(&points), vec![0.0, 0.0, 0.0, 1.0, 1.0]);

        let samples = [(520, 6.0), (820, 2.0)];
        let points = run(&samples, now, Window::new(5, 100), Aggregation::Average);
        assert_eq!(ys(&points), vec![3.0, 3.0, 3.0, 2.5, 2.5]);
    }

    #[test]
    fn test_average_merge_order_is_newest_first() {
        let now = 1_000;
        let samples = [(910, 1.0), (920, 3.0), (930, 5.0)];
        let points = run(&samples, now, Window::new(1, 100), Aggregation::Average);
        // (0+5)/2 = 2.5, then (2.5+3)/2 = 2.75, then (2.75+1)/2 = 1.875
        assert_eq!(ys(&points), vec![1.875]);
    }

    #[test]
    fn test_early_exit_skips_out_of_order_sample() {
        let now = 1_000;
        // Arrival order: in-window, old, in-window. The scan stops at the old one.
        let samples = [(950, 1.0), (100, 1.0), (960, 1.0)];
        let points = run(&samples, now, Window::new(2, 100), Aggregation::Count);
        assert_eq!(ys(&points), vec![0.0, 1.0]);
    }

    #[test]
    fn test_future_samples_are_skipped() {
        let now = 1_000;
        let samples = [(950, 1.0), (1_500, 1.0)];
        let points = run(&samples, now, Window::new(2, 100), Aggregation::Count);
        assert_eq!(ys(&points), vec![0.0, 1.0]);
    }

    #[test]
    fn test_sample_at_now_lands_in_newest_bucket() {
        let points = run(&[(1_000, 1.0)], 1_000, Window::new(4, 250), Aggregation::Count);
        assert_eq!(ys(&points), vec![0.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_window_start_sample_lands_in_oldest_bucket() {
        let points = run(&[(0, 1.0)], 1_000, Window::new(4, 250), Aggregation::Count);
        assert_eq!(ys(&points), vec![1.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_window_longer_than_epoch_saturates() {
        let points = run(&[(5, 1.0)], 50, Window::new(10, 100), Aggregation::Count);
        assert_eq!(points.len(), 10);
        assert_eq!(points[0].x, 0);
        assert!((points[0].y - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_deterministic() {
        let samples: Vec<(u64, f64)> = (0..50).map(|i| (i * 37, (i % 7) as f64)).collect();
        let a = run(&samples, 2_000, Window::new(20, 100), Aggregation::Average);
        let b = run(&samples, 2_000, Window::new(20, 100), Aggregation::Average);
        assert_eq!(a, b);
        assert_eq!(a.len(), 20);
    }

    #[test]
    fn test_oversized_geometry_saturates() {
        let points = run(&[], 1_000, Window::new(3, u64::MAX), Aggregation::Count);
        let xs: Vec<u64> = points.iter().map(|p| p.x).collect();
        assert_eq!(xs, vec![0, u64::MAX, u64::MAX]);
    }

    #[test]
    fn test_zero_buckets() {
        assert!(run(&[(1, 1.0)], 10, Window::new(0, 100), Aggregation::Count).is_empty());
    }

    #[test]
    fn test_non_empty_sentinel() {
        assert_eq!(non_empty(Vec::new()), vec![Point::ZERO]);
        let one = vec![Point::new(3, 1.0)];
        assert_eq!(non_empty(one.clone()), one);
    }
}
