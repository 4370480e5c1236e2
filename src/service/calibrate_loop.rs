use std::future::Future;
use std::path::{Path, PathBuf};

use tokio::sync::mpsc;

use crate::data_source::SampleTransport;
use crate::error::TensileError;
use crate::processing::calibration::{
    CalibrationEvent, CalibrationPhase, CalibrationReport, Calibrator,
};
use crate::processing::smoothing::SmoothedSampleSource;
use crate::storage::{CalibrationStore, write_stage_samples};

/// Successful calibration and where it was written
#[derive(Debug)]
pub struct CalibrationOutcome {
    pub report: CalibrationReport,
    pub calibration_file: PathBuf,
    pub stage_logs: Vec<PathBuf>,
}

enum Step {
    Shutdown,
    Deadline,
    Sample(Result<f64, TensileError>),
}

/// Walk the operator through every reference weight and persist the fit
///
/// Each message on `confirmations` means the weight for the current stage is
/// in place. Confirmations sent while a stage is collecting are discarded.
/// Nothing is written unless every stage closes and the fit passes.
pub async fn run_calibration<T, F>(
    source: &mut SmoothedSampleSource<T>,
    mut calibrator: Calibrator,
    store: &CalibrationStore,
    stage_log_dir: &Path,
    confirmations: &mut mpsc::Receiver<()>,
    shutdown: F,
) -> Result<CalibrationOutcome, TensileError>
where
    T: SampleTransport,
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    let mut stage_samples: Vec<(f64, Vec<f64>)> = Vec::with_capacity(calibrator.stage_count());

    tracing::info!(
        "Calibrating with {} stages of {:.1} s",
        calibrator.stage_count(),
        calibrator.stage_duration().as_secs_f64()
    );

    loop {
        match calibrator.phase() {
            CalibrationPhase::AwaitingPlacement { stage } => {
                let weight = calibrator.current_weight_kg().unwrap_or_default();
                let early = discard_pending(confirmations);
                if early > 0 {
                    tracing::debug!("Ignored {} confirmation(s) sent during collection", early);
                }
                println!(
                    "Stage {}/{}: place {} kg on the load cell and press Enter",
                    stage + 1,
                    calibrator.stage_count(),
                    weight
                );

                let confirmed = tokio::select! {
                    _ = &mut shutdown => false,
                    msg = confirmations.recv() => msg.is_some(),
                };
                if !confirmed {
                    tracing::warn!("Calibration aborted at stage {}", stage + 1);
                    calibrator.abort();
                    return Err(TensileError::Aborted);
                }

                source.reset().await?;
                calibrator.confirm_placement(tokio::time::Instant::now().into_std());
                println!("Collecting...");
            }
            CalibrationPhase::Collecting { stage, .. } => {
                let Some(deadline) = calibrator.deadline() else {
                    continue;
                };
                let step = tokio::select! {
                    _ = &mut shutdown => Step::Shutdown,
                    _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => Step::Deadline,
                    sample = source.next_raw() => Step::Sample(sample),
                };

                let now = tokio::time::Instant::now().into_std();
                let event = match step {
                    Step::Shutdown => {
                        tracing::warn!("Calibration aborted during stage {}", stage + 1);
                        calibrator.abort();
                        return Err(TensileError::Aborted);
                    }
                    Step::Deadline => calibrator.poll(now)?,
                    Step::Sample(Ok(raw)) => {
                        tracing::trace!("Stage {} raw {}", stage + 1, raw);
                        calibrator.advance(raw, now)?
                    }
                    Step::Sample(Err(TensileError::EndOfStream)) => {
                        tracing::warn!("Sample stream ended during stage {}", stage + 1);
                        calibrator.abort();
                        return Err(TensileError::Aborted);
                    }
                    Step::Sample(Err(e)) => {
                        calibrator.abort();
                        return Err(e);
                    }
                };

                match event {
                    CalibrationEvent::Idle => {}
                    CalibrationEvent::StageComplete {
                        stage,
                        reading,
                        samples,
                    } => {
                        println!(
                            "Stage {} done: mean raw {:.2} ({} samples)",
                            stage + 1,
                            reading.mean_raw,
                            reading.sample_count
                        );
                        stage_samples.push((reading.weight_kg, samples));
                    }
                    CalibrationEvent::Finished {
                        last_stage,
                        last_samples,
                        report,
                    } => {
                        println!(
                            "Stage {} done: mean raw {:.2} ({} samples)",
                            calibrator.stage_count(),
                            last_stage.mean_raw,
                            last_stage.sample_count
                        );
                        stage_samples.push((last_stage.weight_kg, last_samples));
                        return persist(store, stage_log_dir, report, &stage_samples);
                    }
                }
            }
            CalibrationPhase::Finalizing | CalibrationPhase::Complete => {
                return Err(TensileError::DegenerateCalibration(
                    "calibration ended without a result".into(),
                ));
            }
        }
    }
}

fn discard_pending(confirmations: &mut mpsc::Receiver<()>) -> usize {
    let mut discarded = 0;
    while confirmations.try_recv().is_ok() {
        discarded += 1;
    }
    discarded
}

fn persist(
    store: &CalibrationStore,
    stage_log_dir: &Path,
    report: CalibrationReport,
    stage_samples: &[(f64, Vec<f64>)],
) -> Result<CalibrationOutcome, TensileError> {
    store.save(&report.result)?;

    let mut stage_logs = Vec::with_capacity(stage_samples.len());
    for (weight_kg, samples) in stage_samples {
        stage_logs.push(write_stage_samples(stage_log_dir, *weight_kg, samples)?);
    }

    println!(
        "Calibration complete: offset {:.3}, slope {:.5} (worst deviation {:.2}%)",
        report.result.offset, report.result.slope, report.max_deviation_pct
    );
    println!("Saved to {}", store.path().display());

    Ok(CalibrationOutcome {
        report,
        calibration_file: store.path().to_path_buf(),
        stage_logs,
    })
}
