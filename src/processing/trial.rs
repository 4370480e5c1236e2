//! Trial detection on a streaming force signal
//!
//! A trial starts when force reaches the threshold and ends once force has
//! stayed below it for the whole drop duration. Short dips while a specimen
//! chatters before separating restart the drop timer instead of ending the
//! trial.

use std::time::{Duration, Instant};

/// Continuous time below threshold that ends a trial
pub const DEFAULT_DROP_DURATION: Duration = Duration::from_secs(10);

/// Default force that starts a trial, in Newtons
pub const DEFAULT_THRESHOLD_N: f64 = 50.0;

/// One recorded point of a trial
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrialSample {
    pub elapsed_ms: u64,
    pub force_n: f64,
}

/// A completed load-to-break measurement
#[derive(Debug, Clone, PartialEq)]
pub struct Trial {
    /// 1-based position within the session
    pub index: usize,
    pub samples: Vec<TrialSample>,
    pub peak_force_n: f64,
}

impl Trial {
    /// Time between the first and last recorded sample
    pub fn duration(&self) -> Duration {
        match (self.samples.first(), self.samples.last()) {
            (Some(first), Some(last)) => Duration::from_millis(last.elapsed_ms - first.elapsed_ms),
            _ => Duration::ZERO,
        }
    }

    /// Time from the start of the trial to the last sample at or above `threshold_n`
    pub fn loaded_duration(&self, threshold_n: f64) -> Duration {
        self.samples
            .iter()
            .rev()
            .find(|s| s.force_n >= threshold_n)
            .map(|s| Duration::from_millis(s.elapsed_ms))
            .unwrap_or(Duration::ZERO)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderState {
    Waiting,
    Measuring,
}

/// Threshold-crossing state machine producing `Trial`s
#[derive(Debug)]
pub struct TrialRecorder {
    threshold_n: f64,
    drop_duration: Duration,
    state: RecorderState,
    trial_start: Option<Instant>,
    below_since: Option<Instant>,
    samples: Vec<TrialSample>,
    next_index: usize,
}

impl TrialRecorder {
    pub fn new(threshold_n: f64, drop_duration: Duration) -> Self {
        Self {
            threshold_n,
            drop_duration,
            state: RecorderState::Waiting,
            trial_start: None,
            below_since: None,
            samples: Vec::new(),
            next_index: 1,
        }
    }

    pub fn state(&self) -> RecorderState {
        self.state
    }

    /// Feed one smoothed force sample taken at `now`
    ///
    /// Returns the finished trial when this sample completes the drop duration.
    pub fn advance(&mut self, force_n: f64, now: Instant) -> Option<Trial> {
        match self.state {
            RecorderState::Waiting => {
                if force_n >= self.threshold_n {
                    self.state = RecorderState::Measuring;
                    self.trial_start = Some(now);
                    self.below_since = None;
                    self.samples.clear();
                    self.record(force_n, now);
                    tracing::debug!(
                        "Trial {} started at {:.1} N",
                        self.next_index,
                        force_n
                    );
                }
                None
            }
            RecorderState::Measuring => {
                self.record(force_n, now);

                if force_n >= self.threshold_n {
                    self.below_since = None;
                    return None;
                }

                let below_since = *self.below_since.get_or_insert(now);
                if now.saturating_duration_since(below_since) >= self.drop_duration {
                    return Some(self.finish());
                }
                None
            }
        }
    }

    /// Drop the trial in progress without finalizing it
    ///
    /// Returns the number of discarded samples.
    pub fn abort(&mut self) -> usize {
        let discarded = self.samples.len();
        if self.state == RecorderState::Measuring {
            tracing::warn!(
                "Discarding trial {} in progress ({} samples)",
                self.next_index,
                discarded
            );
        }
        self.reset_to_waiting();
        discarded
    }

    fn record(&mut self, force_n: f64, now: Instant) {
        let Some(start) = self.trial_start else {
            return;
        };
        let elapsed_ms = now.saturating_duration_since(start).as_millis() as u64;

        // Keep elapsed time strictly increasing
        if let Some(last) = self.samples.last() {
            if elapsed_ms <= last.elapsed_ms {
                tracing::trace!("Dropping sample at {} ms (not after {} ms)", elapsed_ms, last.elapsed_ms);
                return;
            }
        }
        self.samples.push(TrialSample {
            elapsed_ms,
            force_n,
        });
    }

    fn finish(&mut self) -> Trial {
        let samples = std::mem::take(&mut self.samples);
        let peak_force_n = samples
            .iter()
            .map(|s| s.force_n)
            .fold(f64::NEG_INFINITY, f64::max);

        let trial = Trial {
            index: self.next_index,
            samples,
            peak_force_n,
        };
        self.next_index += 1;
        self.reset_to_waiting();

        tracing::debug!(
            "Trial {} finished: peak {:.2} N over {} samples",
            trial.index,
            trial.peak_force_n,
            trial.samples.len()
        );

        trial
    }

    fn reset_to_waiting(&mut self) {
        self.state = RecorderState::Waiting;
        self.trial_start = None;
        self.below_since = None;
        self.samples.clear();
    }
}
