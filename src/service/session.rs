use std::time::{Duration, Instant};

use statrs::statistics::Statistics;

use crate::error::TensileError;
use crate::processing::trial::{RecorderState, Trial, TrialRecorder};
use crate::protocol::{Axis, MaterialIdentity};

/// Default number of trials per session
pub const DEFAULT_TRIAL_COUNT: usize = 5;

/// Parameters of one test session, fixed for its whole duration
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub material: MaterialIdentity,
    pub axis: Axis,
    pub trial_count: usize,
    pub threshold_n: f64,
    pub cross_section_mm2: f64,
    pub drop_duration: Duration,
    pub notes: String,
}

impl SessionConfig {
    /// Build a config, taking the cross-section from the axis unless overridden
    pub fn new(
        material: MaterialIdentity,
        axis: Axis,
        trial_count: usize,
        threshold_n: f64,
        cross_section_override: Option<f64>,
        drop_duration: Duration,
    ) -> Result<Self, TensileError> {
        if trial_count == 0 {
            return Err(TensileError::Config("trial count must be at least 1".into()));
        }
        if !threshold_n.is_finite() || threshold_n <= 0.0 {
            return Err(TensileError::Config(format!(
                "threshold must be a positive force, got {}",
                threshold_n
            )));
        }
        let cross_section_mm2 =
            cross_section_override.unwrap_or_else(|| axis.default_cross_section_mm2());
        if !cross_section_mm2.is_finite() || cross_section_mm2 <= 0.0 {
            return Err(TensileError::Config(format!(
                "cross-section must be a positive area, got {} mm²",
                cross_section_mm2
            )));
        }

        Ok(Self {
            material,
            axis,
            trial_count,
            threshold_n,
            cross_section_mm2,
            drop_duration,
            notes: String::new(),
        })
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = notes.into();
        self
    }
}

/// Aggregate result of a session, complete or not
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSummary {
    pub peak_forces_n: Vec<f64>,
    pub completed_count: usize,
    pub planned_count: usize,
    pub average_force_n: Option<f64>,
    pub tensile_strength_mpa: Option<f64>,
    pub complete: bool,
}

/// What a single sample did to the session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Idle,
    TrialStarted { index: usize },
    TrialCompleted { index: usize, peak_force_n: f64 },
    SessionComplete,
}

/// Runs the trial recorder for the configured number of trials and owns the results
#[derive(Debug)]
pub struct TestSession {
    config: SessionConfig,
    recorder: TrialRecorder,
    trials: Vec<Trial>,
    terminated_early: bool,
}

impl TestSession {
    pub fn new(config: SessionConfig) -> Self {
        let recorder = TrialRecorder::new(config.threshold_n, config.drop_duration);
        Self {
            config,
            recorder,
            trials: Vec::new(),
            terminated_early: false,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn trials(&self) -> &[Trial] {
        &self.trials
    }

    /// True once all planned trials are recorded or the session was stopped
    pub fn is_finished(&self) -> bool {
        self.terminated_early || self.trials.len() >= self.config.trial_count
    }

    pub fn is_measuring(&self) -> bool {
        self.recorder.state() == RecorderState::Measuring
    }

    /// Index the next (or current) trial will get
    pub fn current_trial(&self) -> usize {
        self.trials.len() + 1
    }

    /// Feed one force sample in Newtons taken at `now`
    pub fn advance(&mut self, force_n: f64, now: Instant) -> SessionEvent {
        if self.is_finished() {
            return SessionEvent::Idle;
        }

        let was_measuring = self.is_measuring();
        let Some(trial) = self.recorder.advance(force_n, now) else {
            if !was_measuring && self.is_measuring() {
                return SessionEvent::TrialStarted {
                    index: self.current_trial(),
                };
            }
            return SessionEvent::Idle;
        };

        let index = trial.index;
        let peak_force_n = trial.peak_force_n;
        tracing::info!(
            "Trial {}/{} complete: peak {:.2} N, loaded {:.1} s of {:.1} s recorded",
            index,
            self.config.trial_count,
            peak_force_n,
            trial.loaded_duration(self.config.threshold_n).as_secs_f64(),
            trial.duration().as_secs_f64()
        );
        self.trials.push(trial);

        if self.trials.len() >= self.config.trial_count {
            tracing::info!("All {} trials recorded", self.config.trial_count);
            return SessionEvent::SessionComplete;
        }
        SessionEvent::TrialCompleted {
            index,
            peak_force_n,
        }
    }

    /// Stop early: drop the trial in progress, keep completed ones
    pub fn abort(&mut self) {
        self.recorder.abort();
        if !self.is_finished() {
            tracing::warn!(
                "Session stopped after {}/{} trials",
                self.trials.len(),
                self.config.trial_count
            );
            self.terminated_early = true;
        }
    }

    pub fn summary(&self) -> SessionSummary {
        let peak_forces_n: Vec<f64> = self.trials.iter().map(|t| t.peak_force_n).collect();
        let average_force_n = if peak_forces_n.is_empty() {
            None
        } else {
            Some(peak_forces_n.iter().mean())
        };
        let tensile_strength_mpa = average_force_n.map(|f| f / self.config.cross_section_mm2);
        let completed_count = peak_forces_n.len();

        SessionSummary {
            peak_forces_n,
            completed_count,
            planned_count: self.config.trial_count,
            average_force_n,
            tensile_strength_mpa,
            complete: completed_count >= self.config.trial_count,
        }
    }
}
