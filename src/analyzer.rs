//! Online gait-phase prediction over a live pressure channel
//!
//! The analyzer walks a cyclic model of phase durations (stance, swing) along
//! the reference device's clock. Each call predicts how far through the full
//! cycle the subject is, as a fraction in [0, 1], and watches one pressure
//! channel for the transitions: heel strike ends phase 0, toe off ends
//! phase 1. Whenever a phase ends, the time it actually took feeds back into
//! the model with a learning rate, so the model tracks the subject's cadence.
//!
//! All model arithmetic is in whole milliseconds with truncation, matching
//! the timing granularity of the phase durations.

use crate::timeseries::TimeSeries;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::{Duration, UNIX_EPOCH};

/// Stance and swing defaults for a one-second step
pub const DEFAULT_PHASE_MODEL_MS: [i64; 2] = [400, 600];

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum AnalyzerError {
    #[error("the reference series time went backward")]
    TimeWentBackward,
    #[error("no data for reference device {0}")]
    MissingDevice(String),
    #[error("the reference series has no samples")]
    EmptySeries,
    #[error("the reference series has no channel {0}")]
    MissingChannel(usize),
}

/// Analyzer construction parameters, loadable from JSON
#[derive(Debug, Clone, Deserialize)]
pub struct AnalyzerConfig {
    /// Name of the device whose series drives the analyzer clock
    pub device: String,
    /// Pressure channel watched for transitions
    pub channel: usize,
    /// Phase 0 ends when the channel rises to this
    pub heel_strike_threshold: f64,
    /// Phase 1 ends when the channel falls to this
    pub toe_off_threshold: f64,
    /// Weight of each observed phase duration in the model update, in (0, 1]
    pub learning_rate: f64,
}

/// One prediction step
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    /// Fraction of the full cycle completed, in [0, 1]
    pub value: f64,
    /// Phase index after this step
    pub phase: usize,
    /// Whether this step crossed a phase transition
    pub phase_changed: bool,
}

/// Cyclic timed-events analyzer over a gait pressure channel
pub struct GaitPhaseAnalyzer {
    config: AnalyzerConfig,
    /// Current phase durations (ms)
    model: Vec<i64>,
    /// Accumulates corrections; becomes the model after each full cycle
    next_model: Vec<i64>,
    phase: usize,
    /// Time spent in the current phase (ms)
    phase_time_ms: i64,
    /// Reference clock of the previous step (µs since epoch), None until the
    /// first step
    last_analyzed_us: Option<i64>,
}

impl GaitPhaseAnalyzer {
    pub fn new(config: AnalyzerConfig) -> Self {
        Self::with_model(config, DEFAULT_PHASE_MODEL_MS.to_vec())
    }

    /// Start from a custom phase-duration model (milliseconds)
    pub fn with_model(config: AnalyzerConfig, model: Vec<i64>) -> Self {
        assert_eq!(model.len(), 2, "the gait model has a stance and a swing phase");
        Self {
            config,
            next_model: model.clone(),
            model,
            phase: 0,
            phase_time_ms: 0,
            last_analyzed_us: None,
        }
    }

    /// Current phase durations in milliseconds
    pub fn model_ms(&self) -> &[i64] {
        &self.model
    }

    pub fn phase(&self) -> usize {
        self.phase
    }

    /// Advance the analyzer to the newest sample of the reference series.
    ///
    /// The reference clock only moves forward; a step whose clock reads
    /// earlier than the previous one fails with `TimeWentBackward` and leaves
    /// the state untouched, so the caller may simply skip it.
    pub fn predict(
        &mut self,
        data: &BTreeMap<String, TimeSeries>,
    ) -> Result<Prediction, AnalyzerError> {
        let series = data
            .get(&self.config.device)
            .ok_or_else(|| AnalyzerError::MissingDevice(self.config.device.clone()))?;
        let back = series.back().ok_or(AnalyzerError::EmptySeries)?;
        let channel = *back
            .channels
            .get(self.config.channel)
            .ok_or(AnalyzerError::MissingChannel(self.config.channel))?;

        let now_us = series
            .starting_time()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_micros() as i64
            + back.t_rel.as_micros() as i64;
        let last_us = *self.last_analyzed_us.get_or_insert(now_us);
        if now_us < last_us {
            return Err(AnalyzerError::TimeWentBackward);
        }
        self.phase_time_ms += (now_us - last_us) / 1000;
        self.last_analyzed_us = Some(now_us);

        // Predict the fraction of the cycle; a phase running long stalls at
        // its boundary instead of overshooting
        let capped = self.phase_time_ms.min(self.model[self.phase]);
        let before: i64 = self.model[..self.phase].iter().sum();
        let total: i64 = self.model.iter().sum();
        let value = (capped + before) as f64 / total as f64;

        let phase_changed = match self.phase {
            0 => channel >= self.config.heel_strike_threshold,
            _ => channel <= self.config.toe_off_threshold,
        };
        if phase_changed {
            self.increment_model();
        }

        Ok(Prediction {
            value,
            phase: self.phase,
            phase_changed,
        })
    }

    /// Fold the observed phase duration into the next model and advance the
    /// phase; a completed cycle promotes the next model
    fn increment_model(&mut self) {
        let error = self.phase_time_ms - self.model[self.phase];
        let correction = (error as f64 * self.config.learning_rate) as i64;
        self.next_model[self.phase] += correction;

        self.phase_time_ms = 0;
        self.phase = (self.phase + 1) % self.model.len();
        if self.phase == 0 {
            self.model.clone_from(&self.next_model);
        }
    }
}
