use std::future::Future;

use chrono::Local;

use crate::data_source::SampleTransport;
use crate::error::TensileError;
use crate::processing::calibration::CalibrationResult;
use crate::processing::smoothing::SmoothedSampleSource;
use crate::protocol::Unit;
use crate::service::session::{SessionConfig, SessionEvent, SessionSummary, TestSession};
use crate::storage::{PersistedSession, ResultsStore};

/// How smoothed device values become Newtons
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ForceConversion {
    /// Device reports raw counts; apply the stored calibration on the host
    Calibrated(CalibrationResult),
    /// Device is calibrated and already reports Newtons
    Passthrough,
}

impl ForceConversion {
    pub fn expected_unit(&self) -> Unit {
        match self {
            ForceConversion::Calibrated(_) => Unit::RawCount,
            ForceConversion::Passthrough => Unit::Force,
        }
    }

    pub fn to_newtons(&self, value: f64) -> f64 {
        match self {
            ForceConversion::Calibrated(calibration) => calibration.to_newtons(value),
            ForceConversion::Passthrough => value,
        }
    }
}

/// Why a test session stopped
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEnd {
    Completed,
    Interrupted,
    StreamEnded,
    TransportLost(String),
}

#[derive(Debug)]
pub struct TestOutcome {
    pub end: SessionEnd,
    pub summary: SessionSummary,
    pub persisted: PersistedSession,
}

/// Drive a test session from the device stream until it completes or is cut short
///
/// Completed trials are always persisted. A unit mismatch still persists them,
/// then surfaces as an error.
pub async fn run_test<T, F>(
    source: &mut SmoothedSampleSource<T>,
    conversion: ForceConversion,
    config: SessionConfig,
    store: &ResultsStore,
    shutdown: F,
) -> Result<TestOutcome, TensileError>
where
    T: SampleTransport,
    F: Future<Output = ()>,
{
    tracing::info!(
        "Testing {} ({} axis): {} trials, threshold {:.1} N, cross-section {:.1} mm²",
        config.material,
        config.axis,
        config.trial_count,
        config.threshold_n,
        config.cross_section_mm2
    );

    let mut session = TestSession::new(config);
    tokio::pin!(shutdown);

    println!(
        "Waiting for trial 1/{} (load above {:.1} N starts a trial)",
        session.config().trial_count,
        session.config().threshold_n
    );

    let result = loop {
        let sample = tokio::select! {
            _ = &mut shutdown => None,
            sample = source.next_smoothed() => Some(sample),
        };
        let Some(sample) = sample else {
            tracing::info!("Received shutdown signal");
            break Ok(SessionEnd::Interrupted);
        };

        let value = match sample {
            Ok(value) => value,
            Err(TensileError::EndOfStream) => {
                tracing::info!("Sample stream ended");
                break Ok(SessionEnd::StreamEnded);
            }
            Err(TensileError::TransportFatal(msg)) => {
                tracing::error!("Transport lost: {}", msg);
                break Ok(SessionEnd::TransportLost(msg));
            }
            Err(e) => break Err(e),
        };

        let force_n = conversion.to_newtons(value);
        let now = tokio::time::Instant::now().into_std();
        tracing::trace!("Force sample {:.3} N", force_n);

        match session.advance(force_n, now) {
            SessionEvent::Idle => {}
            SessionEvent::TrialStarted { index } => {
                println!(
                    "Trial {}/{} started at {:.1} N",
                    index,
                    session.config().trial_count,
                    force_n
                );
            }
            SessionEvent::TrialCompleted {
                index,
                peak_force_n,
            } => {
                println!(
                    "Trial {}/{} finished: peak {:.2} N",
                    index,
                    session.config().trial_count,
                    peak_force_n
                );
                if let Err(e) = source.reset().await {
                    break Err(e);
                }
                println!(
                    "Waiting for trial {}/{}",
                    session.current_trial(),
                    session.config().trial_count
                );
            }
            SessionEvent::SessionComplete => {
                if let Some(trial) = session.trials().last() {
                    println!(
                        "Trial {}/{} finished: peak {:.2} N",
                        trial.index,
                        session.config().trial_count,
                        trial.peak_force_n
                    );
                }
                break Ok(SessionEnd::Completed);
            }
        }
    };

    if !session.is_finished() {
        session.abort();
    }

    let persisted = store.persist_session(&session, Local::now())?;
    let summary = session.summary();
    print_summary(&summary);

    let end = result?;
    Ok(TestOutcome {
        end,
        summary,
        persisted,
    })
}

fn print_summary(summary: &SessionSummary) {
    println!();
    println!(
        "Completed {}/{} trials{}",
        summary.completed_count,
        summary.planned_count,
        if summary.complete { "" } else { " (incomplete)" }
    );
    for (i, peak) in summary.peak_forces_n.iter().enumerate() {
        println!("  Trial {}: {:.2} N", i + 1, peak);
    }
    match (summary.average_force_n, summary.tensile_strength_mpa) {
        (Some(average), Some(strength)) => {
            println!("Average force: {:.2} N", average);
            println!("Tensile strength: {:.3} MPa", strength);
        }
        _ => println!("No trials completed; nothing recorded"),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use approx::assert_relative_eq;
    use tempfile::tempdir;

    use super::*;
    use crate::data_source::memory::MemoryTransport;
    use crate::protocol::{Axis, MaterialIdentity};

    const TICK: Duration = Duration::from_millis(100);

    fn config(trials: usize) -> SessionConfig {
        SessionConfig::new(
            MaterialIdentity::new("Atomic", "PETG", "black"),
            Axis::Xy,
            trials,
            50.0,
            None,
            Duration::from_secs(1),
        )
        .unwrap()
    }

    /// One load-to-break curve followed by enough unloaded samples to end it
    fn trial_curve(peak: f64) -> Vec<f64> {
        let mut values = vec![0.0, 60.0, peak, 80.0];
        values.extend(std::iter::repeat_n(0.0, 15));
        values
    }

    fn force_source(values: &[f64]) -> SmoothedSampleSource<MemoryTransport> {
        let transport = MemoryTransport::forces(values).with_interval(TICK);
        SmoothedSampleSource::new(transport, Unit::Force, 1)
    }

    #[tokio::test(start_paused = true)]
    async fn test_complete_session_is_persisted() {
        let dir = tempdir().unwrap();
        let store = ResultsStore::new(dir.path());
        let values = [trial_curve(100.0), trial_curve(120.0)].concat();
        let mut source = force_source(&values);

        let outcome = run_test(
            &mut source,
            ForceConversion::Passthrough,
            config(2),
            &store,
            std::future::pending(),
        )
        .await
        .unwrap();

        assert_eq!(outcome.end, SessionEnd::Completed);
        assert_eq!(outcome.summary.peak_forces_n, vec![100.0, 120.0]);
        assert_relative_eq!(outcome.summary.tensile_strength_mpa.unwrap(), 5.5);
        assert_eq!(outcome.persisted.trial_logs.len(), 2);
        assert!(outcome.persisted.summary.is_some());
        assert!(store.master_table_path().exists());
        // Reset once between the two trials
        assert_eq!(source.transport().resets, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_raw_counts_use_calibration() {
        let dir = tempdir().unwrap();
        let store = ResultsStore::new(dir.path());
        let calibration = CalibrationResult::new(1000.0, 50.0).unwrap();
        let raw: Vec<f64> = trial_curve(200.0)
            .into_iter()
            .map(|f| 1000.0 + 50.0 * f)
            .collect();
        let transport = MemoryTransport::raw_counts(&raw).with_interval(TICK);
        let mut source = SmoothedSampleSource::new(transport, Unit::RawCount, 1);

        let outcome = run_test(
            &mut source,
            ForceConversion::Calibrated(calibration),
            config(1),
            &store,
            std::future::pending(),
        )
        .await
        .unwrap();

        assert_eq!(outcome.end, SessionEnd::Completed);
        assert_relative_eq!(outcome.summary.peak_forces_n[0], 200.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_end_keeps_completed_trials() {
        let dir = tempdir().unwrap();
        let store = ResultsStore::new(dir.path());
        let mut source = force_source(&trial_curve(90.0));

        let outcome = tokio_test::assert_ok!(
            run_test(
                &mut source,
                ForceConversion::Passthrough,
                config(3),
                &store,
                std::future::pending(),
            )
            .await
        );

        assert_eq!(outcome.end, SessionEnd::StreamEnded);
        assert_eq!(outcome.summary.completed_count, 1);
        assert!(!outcome.summary.complete);

        let summary = std::fs::read_to_string(outcome.persisted.summary.unwrap()).unwrap();
        assert!(summary.contains("INCOMPLETE"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_failure_ends_session() {
        let dir = tempdir().unwrap();
        let store = ResultsStore::new(dir.path());
        let transport = MemoryTransport::forces(&trial_curve(75.0))
            .with_interval(TICK)
            .failing_with("device unplugged");
        let mut source = SmoothedSampleSource::new(transport, Unit::Force, 1);

        let outcome = run_test(
            &mut source,
            ForceConversion::Passthrough,
            config(2),
            &store,
            std::future::pending(),
        )
        .await
        .unwrap();

        assert_eq!(
            outcome.end,
            SessionEnd::TransportLost("device unplugged".into())
        );
        assert_eq!(outcome.summary.completed_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unit_mismatch_persists_then_fails() {
        let dir = tempdir().unwrap();
        let store = ResultsStore::new(dir.path());
        let mut lines: Vec<String> = trial_curve(110.0)
            .iter()
            .map(|v| format!("{} N\n", v))
            .collect();
        lines.push("123456\n".into());
        let transport = MemoryTransport::from_lines(lines).with_interval(TICK);
        let mut source = SmoothedSampleSource::new(transport, Unit::Force, 1);

        let err = run_test(
            &mut source,
            ForceConversion::Passthrough,
            config(2),
            &store,
            std::future::pending(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, TensileError::ProtocolMismatch { .. }));
        assert_eq!(err.exit_code(), 1);
        let trial_log = dir.path().join("Atomic PETG black").join("xy-trial-1.csv");
        assert!(trial_log.exists());
        assert!(store.master_table_path().exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unit_mismatch_mid_trial_discards_partial_trial() {
        let dir = tempdir().unwrap();
        let store = ResultsStore::new(dir.path());
        let transport = MemoryTransport::from_lines(["0 N\n", "60 N\n", "110 N\n", "123456\n"])
            .with_interval(TICK);
        let mut source = SmoothedSampleSource::new(transport, Unit::Force, 1);

        let err = run_test(
            &mut source,
            ForceConversion::Passthrough,
            config(2),
            &store,
            std::future::pending(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, TensileError::ProtocolMismatch { .. }));
        let material_dir = dir.path().join("Atomic PETG black");
        assert!(!material_dir.join("xy-trial-1.csv").exists());
        assert!(!store.master_table_path().exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_without_trials_writes_nothing() {
        let dir = tempdir().unwrap();
        let store = ResultsStore::new(dir.path());
        let mut source = force_source(&[0.0; 50]);

        let outcome = run_test(
            &mut source,
            ForceConversion::Passthrough,
            config(2),
            &store,
            tokio::time::sleep(Duration::from_millis(550)),
        )
        .await
        .unwrap();

        assert_eq!(outcome.end, SessionEnd::Interrupted);
        assert_eq!(outcome.summary.completed_count, 0);
        assert!(!store.master_table_path().exists());
    }

    #[test]
    fn test_conversion_units() {
        let calibration = CalibrationResult::new(0.0, 2.0).unwrap();
        assert_eq!(
            ForceConversion::Calibrated(calibration).expected_unit(),
            Unit::RawCount
        );
        assert_eq!(ForceConversion::Passthrough.expected_unit(), Unit::Force);
        assert_eq!(ForceConversion::Calibrated(calibration).to_newtons(10.0), 5.0);
        assert_eq!(ForceConversion::Passthrough.to_newtons(10.0), 10.0);
    }
}
