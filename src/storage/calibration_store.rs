use std::fs;
use std::path::{Path, PathBuf};

use crate::error::TensileError;
use crate::processing::calibration::CalibrationResult;

/// Well-known calibration file shared by `calibrate` and `test`
pub const DEFAULT_CALIBRATION_FILE: &str = "calibration.json";

/// Directory receiving raw per-stage calibration samples
pub const DEFAULT_STAGE_LOG_DIR: &str = "calibration_data";

/// JSON-backed calibration record: `{"offset": .., "slope": ..}`
#[derive(Debug, Clone)]
pub struct CalibrationStore {
    path: PathBuf,
}

impl CalibrationStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<CalibrationResult, TensileError> {
        let text = fs::read_to_string(&self.path).map_err(|e| {
            TensileError::Config(format!(
                "cannot read calibration {}: {} (run `calibrate` first)",
                self.path.display(),
                e
            ))
        })?;
        let result: CalibrationResult = serde_json::from_str(&text)?;
        result.validate()?;

        tracing::info!(
            "Loaded calibration from {}: offset {:.3}, slope {:.5}",
            self.path.display(),
            result.offset,
            result.slope
        );
        Ok(result)
    }

    pub fn save(&self, result: &CalibrationResult) -> Result<(), TensileError> {
        result.validate()?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(result)?;
        fs::write(&self.path, json)?;

        tracing::info!("Calibration saved to {}", self.path.display());
        Ok(())
    }
}

/// Write one stage's raw samples as `index,raw` lines to `calibration-{weight}.csv`
pub fn write_stage_samples(
    dir: &Path,
    weight_kg: f64,
    samples: &[f64],
) -> Result<PathBuf, TensileError> {
    fs::create_dir_all(dir)?;
    let path = dir.join(format!("calibration-{:?}.csv", weight_kg));

    let mut contents = String::with_capacity(samples.len() * 12);
    for (i, sample) in samples.iter().enumerate() {
        contents.push_str(&format!("{},{}\n", i + 1, sample));
    }
    fs::write(&path, contents)?;

    tracing::debug!("Wrote {} stage samples to {}", samples.len(), path.display());
    Ok(path)
}
