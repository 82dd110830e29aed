//! Timestamped sample streams shared between collectors, the server and the analyzer

use crate::ring::RollingBuffer;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// One acquisition frame row: a relative timestamp plus one value per channel.
///
/// `timestamp` is an opaque tag a driver may attach to the row (-1 when the
/// device has none); `t_rel` is always the time since the trial started.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Time since the start of the trial
    pub t_rel: Duration,
    /// Driver-supplied tag, -1 if the device has none
    pub timestamp: i64,
    /// One value per channel, channel count fixed per device
    pub channels: Vec<f64>,
}

/// A rolling stream of [`Sample`]s with two add modes.
///
/// In measured mode each append is stamped with the elapsed time on the
/// internal stopwatch. In fixed-rate mode sample `k` is stamped `k * delta`,
/// counting from the logical start of the buffer, so wall-clock jitter in the
/// collector worker never leaks into the timestamps.
#[derive(Debug, Clone)]
pub struct TimeSeries {
    /// Wall-clock instant of the trial start
    starting_time: SystemTime,
    /// Monotonic reference for measured-mode stamps
    stopwatch: Instant,
    /// Sample period for fixed-rate mode
    delta_time: Option<Duration>,
    data: RollingBuffer<Sample>,
}

impl TimeSeries {
    /// Measured-mode series; `capacity` bounds the retained window
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            starting_time: SystemTime::now(),
            stopwatch: Instant::now(),
            delta_time: None,
            data: match capacity {
                Some(cap) => RollingBuffer::bounded(cap),
                None => RollingBuffer::unbounded(),
            },
        }
    }

    /// Fixed-rate series: sample `k` is stamped `k * delta`
    pub fn fixed_rate(delta: Duration, capacity: Option<usize>) -> Self {
        Self {
            delta_time: Some(delta),
            ..Self::new(capacity)
        }
    }

    pub fn starting_time(&self) -> SystemTime {
        self.starting_time
    }

    pub fn delta_time(&self) -> Option<Duration> {
        self.delta_time
    }

    /// Number of samples appended since the last reset (logical count)
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Append one row of channel data, stamping it per the add mode
    pub fn push(&mut self, channels: Vec<f64>) {
        let t_rel = match self.delta_time {
            Some(delta) => delta * self.data.len() as u32,
            None => self.stopwatch.elapsed(),
        };
        self.data.push(Sample {
            t_rel,
            timestamp: -1,
            channels,
        });
    }

    /// Append a pre-stamped sample (deserialization, snapshots)
    pub fn push_sample(&mut self, sample: Sample) {
        self.data.push(sample);
    }

    /// Get by position in the retained window, oldest first
    pub fn get(&self, index: usize) -> Option<&Sample> {
        self.data.get(index)
    }

    pub fn back(&self) -> Option<&Sample> {
        self.data.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Sample> {
        self.data.iter()
    }

    /// The last `n` retained samples as a new series with the same trial start
    pub fn tail(&self, n: usize) -> TimeSeries {
        let mut out = self.empty_like();
        let skip = self.data.retained().saturating_sub(n);
        for sample in self.iter().skip(skip) {
            out.push_sample(sample.clone());
        }
        out
    }

    /// Retained samples stamped strictly after `t_rel`, as a new series
    pub fn since(&self, t_rel: Duration) -> TimeSeries {
        let mut out = self.empty_like();
        for sample in self.iter().filter(|s| s.t_rel > t_rel) {
            out.push_sample(sample.clone());
        }
        out
    }

    /// Clear the data and restart the trial clock
    pub fn reset(&mut self) {
        self.data.clear();
        self.starting_time = SystemTime::now();
        self.stopwatch = Instant::now();
    }

    fn empty_like(&self) -> TimeSeries {
        TimeSeries {
            starting_time: self.starting_time,
            stopwatch: self.stopwatch,
            delta_time: self.delta_time,
            data: RollingBuffer::unbounded(),
        }
    }

    fn starting_time_micros(&self) -> u64 {
        self.starting_time
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_micros() as u64
    }
}

impl Default for TimeSeries {
    fn default() -> Self {
        Self::new(None)
    }
}

// Wire form, shared with the C# front end:
// {"starting_time": <µs since epoch>, "data": [[<t_rel µs>, {"timestamp": <i64>, "data": [..]}], ..]}

#[derive(Serialize, Deserialize)]
struct WirePoint {
    timestamp: i64,
    data: Vec<f64>,
}

#[derive(Serialize, Deserialize)]
struct WireSeries {
    starting_time: u64,
    data: Vec<(u64, WirePoint)>,
}

impl Serialize for TimeSeries {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        WireSeries {
            starting_time: self.starting_time_micros(),
            data: self
                .iter()
                .map(|s| {
                    (
                        s.t_rel.as_micros() as u64,
                        WirePoint {
                            timestamp: s.timestamp,
                            data: s.channels.clone(),
                        },
                    )
                })
                .collect(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for TimeSeries {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = WireSeries::deserialize(deserializer)?;
        let mut out = TimeSeries::new(None);
        out.starting_time = UNIX_EPOCH + Duration::from_micros(wire.starting_time);
        for (t_rel, point) in wire.data {
            out.push_sample(Sample {
                t_rel: Duration::from_micros(t_rel),
                timestamp: point.timestamp,
                channels: point.data,
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn measured_stamps_are_monotonic() {
        let mut ts = TimeSeries::new(None);
        for i in 0..50 {
            ts.push(vec![i as f64]);
        }
        let stamps: Vec<_> = ts.iter().map(|s| s.t_rel).collect();
        assert!(stamps.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn fixed_rate_ignores_wall_clock() {
        let delta = Duration::from_millis(10);
        let mut ts = TimeSeries::fixed_rate(delta, None);
        for i in 0..20 {
            // Jitter in the worker must not show up in the stamps
            if i % 7 == 0 {
                std::thread::sleep(Duration::from_millis(2));
            }
            ts.push(vec![1.0]);
        }
        for (k, sample) in ts.iter().enumerate() {
            assert_eq!(sample.t_rel, delta * k as u32);
        }
    }

    #[test]
    fn fixed_rate_counts_from_logical_start() {
        // After the ring wraps, stamps keep counting with the logical index
        let delta = Duration::from_millis(5);
        let mut ts = TimeSeries::fixed_rate(delta, Some(4));
        for _ in 0..10 {
            ts.push(vec![0.0]);
        }
        assert_eq!(ts.len(), 10);
        let front = ts.get(0).unwrap();
        assert_eq!(front.t_rel, delta * 6);
        assert_eq!(ts.back().unwrap().t_rel, delta * 9);
    }

    #[test]
    fn reset_restarts_the_trial() {
        let mut ts = TimeSeries::fixed_rate(Duration::from_millis(1), None);
        for _ in 0..5 {
            ts.push(vec![0.0]);
        }
        let before = ts.starting_time();
        std::thread::sleep(Duration::from_millis(5));
        ts.reset();
        assert!(ts.is_empty());
        assert!(ts.starting_time() > before);
        ts.push(vec![0.0]);
        assert_eq!(ts.back().unwrap().t_rel, Duration::ZERO);
    }

    #[test]
    fn since_is_strictly_after() {
        let delta = Duration::from_millis(10);
        let mut ts = TimeSeries::fixed_rate(delta, None);
        for i in 0..10 {
            ts.push(vec![i as f64]);
        }
        let tail = ts.since(delta * 4);
        assert_eq!(tail.len(), 5);
        assert_eq!(tail.get(0).unwrap().t_rel, delta * 5);
        assert_eq!(tail.starting_time(), ts.starting_time());
    }

    #[test]
    fn tail_returns_last_n() {
        let mut ts = TimeSeries::fixed_rate(Duration::from_millis(1), None);
        for i in 0..10 {
            ts.push(vec![i as f64]);
        }
        let tail = ts.tail(3);
        let vals: Vec<f64> = tail.iter().map(|s| s.channels[0]).collect();
        assert_eq!(vals, vec![7.0, 8.0, 9.0]);
    }

    #[test]
    fn wire_round_trip_is_byte_equal() {
        let mut ts = TimeSeries::fixed_rate(Duration::from_micros(500), None);
        for i in 0..16 {
            ts.push(vec![i as f64 * 0.25, -(i as f64)]);
        }
        let first = serde_json::to_string(&ts).unwrap();
        let parsed: TimeSeries = serde_json::from_str(&first).unwrap();
        let second = serde_json::to_string(&parsed).unwrap();
        assert_eq!(first, second);
        assert_eq!(parsed.len(), ts.len());
        assert_eq!(parsed.back().unwrap().channels, ts.back().unwrap().channels);
    }

    #[test]
    fn wire_form_shape() {
        let mut ts = TimeSeries::fixed_rate(Duration::from_millis(1), None);
        ts.push(vec![0.5]);
        let json: serde_json::Value = serde_json::to_value(&ts).unwrap();
        assert!(json["starting_time"].is_u64());
        assert_eq!(json["data"][0][0], 0);
        assert_eq!(json["data"][0][1]["timestamp"], -1);
        assert_eq!(json["data"][0][1]["data"][0], 0.5);
    }
}
