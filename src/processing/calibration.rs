//! Load cell calibration
//!
//! The operator places a sequence of reference weights on the cell. For each
//! one the raw HX711 counts collected over a fixed wall-clock window are
//! averaged, then a single least-squares line `raw = offset + slope * force`
//! is fitted through all stages. Every stage must sit within a relative
//! tolerance of that line or the whole run is rejected.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;

use crate::error::TensileError;
use crate::protocol::STANDARD_GRAVITY;

/// Reference weights in kg; the first stage captures the zero offset
pub const DEFAULT_WEIGHTS_KG: [f64; 4] = [0.0, 7.9, 15.9, 31.4];

/// Collection window per stage
pub const DEFAULT_STAGE_DURATION: Duration = Duration::from_secs(2);

/// Maximum relative deviation of a stage mean from the fitted line
pub const DEFAULT_TOLERANCE: f64 = 0.05;

/// Linear mapping between raw counts and Newtons
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationResult {
    pub offset: f64,
    pub slope: f64,
}

impl CalibrationResult {
    pub fn new(offset: f64, slope: f64) -> Result<Self, TensileError> {
        let result = Self { offset, slope };
        result.validate()?;
        Ok(result)
    }

    /// Reject values that cannot convert raw counts (zero or non-finite slope)
    pub fn validate(&self) -> Result<(), TensileError> {
        if !self.offset.is_finite() {
            return Err(TensileError::InvalidCalibration(format!(
                "offset {} is not finite",
                self.offset
            )));
        }
        if !self.slope.is_finite() || self.slope == 0.0 {
            return Err(TensileError::InvalidCalibration(format!(
                "slope {} cannot convert raw counts to force",
                self.slope
            )));
        }
        Ok(())
    }

    /// Convert a raw count to Newtons
    pub fn to_newtons(&self, raw: f64) -> f64 {
        (raw - self.offset) / self.slope
    }
}

/// What to do with a stage that collected no samples
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmptyStagePolicy {
    /// Treat the stage mean as 0.0 and carry on
    #[default]
    ZeroFill,
    /// Fail the calibration run
    Reject,
}

/// Averaged reading for one reference weight
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StageReading {
    pub weight_kg: f64,
    pub force_n: f64,
    pub mean_raw: f64,
    pub sample_count: usize,
}

/// Successful calibration plus the data it was fitted from
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationReport {
    pub result: CalibrationResult,
    pub stages: Vec<StageReading>,
    /// Mean of the first (unloaded) stage; diagnostic only
    pub zero_reading: f64,
    /// Largest relative deviation of any stage from the fit, in percent
    pub max_deviation_pct: f64,
}

/// Calibration phase
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CalibrationPhase {
    AwaitingPlacement { stage: usize },
    Collecting { stage: usize, started_at: Instant },
    Finalizing,
    Complete,
}

/// Outcome of feeding the calibrator a sample or a clock tick
#[derive(Debug, Clone, PartialEq)]
pub enum CalibrationEvent {
    /// Nothing changed (not collecting, or the sample was recorded)
    Idle,
    /// A stage's window expired; the samples are handed back for logging
    StageComplete {
        stage: usize,
        reading: StageReading,
        samples: Vec<f64>,
    },
    /// The last stage closed and the fit passed validation
    Finished {
        last_stage: StageReading,
        last_samples: Vec<f64>,
        report: CalibrationReport,
    },
}

/// Stage-by-stage calibration state machine
#[derive(Debug)]
pub struct Calibrator {
    weights_kg: Vec<f64>,
    stage_duration: Duration,
    tolerance: f64,
    empty_stage_policy: EmptyStagePolicy,
    phase: CalibrationPhase,
    stage_samples: Vec<f64>,
    stage_readings: Vec<StageReading>,
}

impl Calibrator {
    pub fn new(weights_kg: Vec<f64>, stage_duration: Duration) -> Result<Self, TensileError> {
        if weights_kg.len() < 2 {
            return Err(TensileError::Config(format!(
                "calibration needs at least 2 reference weights, got {}",
                weights_kg.len()
            )));
        }
        if let Some(w) = weights_kg.iter().find(|w| !w.is_finite() || **w < 0.0) {
            return Err(TensileError::Config(format!(
                "invalid reference weight {} kg",
                w
            )));
        }
        let first = weights_kg[0];
        if weights_kg.iter().all(|w| *w == first) {
            return Err(TensileError::Config(
                "calibration weights must include at least two distinct values".into(),
            ));
        }

        Ok(Self {
            weights_kg,
            stage_duration,
            tolerance: DEFAULT_TOLERANCE,
            empty_stage_policy: EmptyStagePolicy::default(),
            phase: CalibrationPhase::AwaitingPlacement { stage: 0 },
            stage_samples: Vec::new(),
            stage_readings: Vec::new(),
        })
    }

    pub fn with_empty_stage_policy(mut self, policy: EmptyStagePolicy) -> Self {
        self.empty_stage_policy = policy;
        self
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn phase(&self) -> CalibrationPhase {
        self.phase
    }

    pub fn stage_count(&self) -> usize {
        self.weights_kg.len()
    }

    pub fn stage_duration(&self) -> Duration {
        self.stage_duration
    }

    /// Weight the operator should have on the cell right now
    pub fn current_weight_kg(&self) -> Option<f64> {
        match self.phase {
            CalibrationPhase::AwaitingPlacement { stage }
            | CalibrationPhase::Collecting { stage, .. } => Some(self.weights_kg[stage]),
            _ => None,
        }
    }

    /// When the running collection window closes
    pub fn deadline(&self) -> Option<Instant> {
        match self.phase {
            CalibrationPhase::Collecting { started_at, .. } => {
                Some(started_at + self.stage_duration)
            }
            _ => None,
        }
    }

    /// Operator confirmed the weight is in place: start collecting
    ///
    /// Returns false if a collection is already running or calibration is over.
    pub fn confirm_placement(&mut self, now: Instant) -> bool {
        let CalibrationPhase::AwaitingPlacement { stage } = self.phase else {
            return false;
        };
        self.stage_samples.clear();
        self.phase = CalibrationPhase::Collecting {
            stage,
            started_at: now,
        };
        tracing::info!(
            "Collecting stage {} ({} kg) for {:?}",
            stage,
            self.weights_kg[stage],
            self.stage_duration
        );
        true
    }

    /// Feed one raw reading taken at `now`
    pub fn advance(&mut self, raw: f64, now: Instant) -> Result<CalibrationEvent, TensileError> {
        let event = self.poll(now)?;
        if event != CalibrationEvent::Idle {
            // The window had already closed; this reading belongs to no stage
            return Ok(event);
        }
        if let CalibrationPhase::Collecting { .. } = self.phase {
            self.stage_samples.push(raw);
        }
        Ok(CalibrationEvent::Idle)
    }

    /// Close the running stage if its window has expired
    pub fn poll(&mut self, now: Instant) -> Result<CalibrationEvent, TensileError> {
        let CalibrationPhase::Collecting { stage, started_at } = self.phase else {
            return Ok(CalibrationEvent::Idle);
        };
        if now.saturating_duration_since(started_at) < self.stage_duration {
            return Ok(CalibrationEvent::Idle);
        }

        let samples = std::mem::take(&mut self.stage_samples);
        let reading = match self.close_stage(stage, &samples) {
            Ok(reading) => reading,
            Err(e) => {
                self.abort();
                return Err(e);
            }
        };
        self.stage_readings.push(reading);

        tracing::debug!(
            "Stage {} ({} kg): mean raw {:.2} over {} samples",
            stage,
            reading.weight_kg,
            reading.mean_raw,
            reading.sample_count
        );

        let next = stage + 1;
        if next < self.weights_kg.len() {
            self.phase = CalibrationPhase::AwaitingPlacement { stage: next };
            return Ok(CalibrationEvent::StageComplete {
                stage,
                reading,
                samples,
            });
        }

        self.phase = CalibrationPhase::Finalizing;
        match self.finalize() {
            Ok(report) => {
                self.phase = CalibrationPhase::Complete;
                Ok(CalibrationEvent::Finished {
                    last_stage: reading,
                    last_samples: samples,
                    report,
                })
            }
            Err(e) => {
                self.abort();
                Err(e)
            }
        }
    }

    /// Discard every collected stage and start over from the first weight
    pub fn abort(&mut self) {
        self.stage_samples.clear();
        self.stage_readings.clear();
        self.phase = CalibrationPhase::AwaitingPlacement { stage: 0 };
    }

    fn close_stage(&self, stage: usize, samples: &[f64]) -> Result<StageReading, TensileError> {
        let weight_kg = self.weights_kg[stage];
        let mean_raw = if samples.is_empty() {
            match self.empty_stage_policy {
                EmptyStagePolicy::ZeroFill => {
                    tracing::warn!(
                        "Stage {} ({} kg) collected no samples; using 0.0",
                        stage + 1,
                        weight_kg
                    );
                    0.0
                }
                EmptyStagePolicy::Reject => {
                    return Err(TensileError::EmptyCalibrationStage { stage, weight_kg });
                }
            }
        } else {
            samples.mean()
        };

        Ok(StageReading {
            weight_kg,
            force_n: weight_kg * STANDARD_GRAVITY,
            mean_raw,
            sample_count: samples.len(),
        })
    }

    fn finalize(&self) -> Result<CalibrationReport, TensileError> {
        let report = fit_calibration(&self.stage_readings, self.tolerance)?;
        tracing::info!(
            "Calibration fit: offset {:.3}, slope {:.5} counts/N (zero stage {:.3}, worst deviation {:.2}%)",
            report.result.offset,
            report.result.slope,
            report.zero_reading,
            report.max_deviation_pct
        );
        Ok(report)
    }
}

/// Least-squares fit of stage readings against force, with tolerance check
pub fn fit_calibration(
    stages: &[StageReading],
    tolerance: f64,
) -> Result<CalibrationReport, TensileError> {
    if stages.len() < 2 {
        return Err(TensileError::DegenerateCalibration(format!(
            "{} stage(s) collected, at least 2 are required",
            stages.len()
        )));
    }

    let forces: Vec<f64> = stages.iter().map(|s| s.force_n).collect();
    let readings: Vec<f64> = stages.iter().map(|s| s.mean_raw).collect();

    let force_variance = forces.iter().variance();
    if !(force_variance > 0.0) {
        return Err(TensileError::DegenerateCalibration(
            "all stages used the same force".into(),
        ));
    }

    let slope = forces.iter().covariance(readings.iter()) / force_variance;
    let intercept = readings.iter().mean() - slope * forces.iter().mean();

    if !slope.is_finite() || slope == 0.0 {
        return Err(TensileError::DegenerateCalibration(format!(
            "fitted slope {} does not respond to load",
            slope
        )));
    }

    let mut max_deviation_pct: f64 = 0.0;
    for (stage, s) in stages.iter().enumerate() {
        let predicted = intercept + slope * s.force_n;
        let deviation = (s.mean_raw - predicted).abs();
        let limit = tolerance * s.mean_raw.abs();
        let deviation_pct = if s.mean_raw != 0.0 {
            deviation / s.mean_raw.abs() * 100.0
        } else if deviation == 0.0 {
            0.0
        } else {
            f64::INFINITY
        };

        if deviation > limit {
            return Err(TensileError::CalibrationOutOfTolerance {
                stage,
                weight_kg: s.weight_kg,
                reading: s.mean_raw,
                predicted,
                deviation_pct,
                limit_pct: tolerance * 100.0,
            });
        }
        max_deviation_pct = max_deviation_pct.max(deviation_pct);
    }

    Ok(CalibrationReport {
        result: CalibrationResult::new(intercept, slope)?,
        stages: stages.to_vec(),
        zero_reading: stages[0].mean_raw,
        max_deviation_pct,
    })
}
