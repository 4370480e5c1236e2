use thiserror::Error;

use crate::protocol::Unit;

/// Main error type for the tensile tester
#[derive(Error, Debug)]
pub enum TensileError {
    #[error("Serial port error: {0}")]
    SerialPort(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Transport failed: {0}")]
    TransportFatal(String),

    #[error("Sample stream ended")]
    EndOfStream,

    #[error(
        "Device is sending {received} values but {expected} values were expected; check the firmware mode"
    )]
    ProtocolMismatch { expected: Unit, received: Unit },

    #[error(
        "Calibration error: stage {} ({weight_kg} kg) reading {reading:.2} deviates {deviation_pct:.1}% from fitted value {predicted:.2} (limit {limit_pct:.1}%)",
        .stage + 1
    )]
    CalibrationOutOfTolerance {
        /// Zero-based stage index; shown one-based like the operator prompts
        stage: usize,
        weight_kg: f64,
        reading: f64,
        predicted: f64,
        deviation_pct: f64,
        limit_pct: f64,
    },

    #[error("Calibration stage {} ({weight_kg} kg) collected no samples", .stage + 1)]
    EmptyCalibrationStage { stage: usize, weight_kg: f64 },

    #[error("Degenerate calibration: {0}")]
    DegenerateCalibration(String),

    #[error("Invalid calibration: {0}")]
    InvalidCalibration(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Aborted by operator")]
    Aborted,
}

impl TensileError {
    /// Process exit code reported for this error
    pub fn exit_code(&self) -> u8 {
        match self {
            // A finished stream only ends the session early; results are still valid.
            TensileError::EndOfStream => 0,
            _ => 1,
        }
    }
}

/// Line-level errors from the load cell serial stream
///
/// These never leave the transport: a line that fails to parse is skipped.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("Empty line")]
    Empty,

    #[error("Malformed reading: {0}")]
    Malformed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_mismatch_display() {
        let err = TensileError::ProtocolMismatch {
            expected: Unit::RawCount,
            received: Unit::Force,
        };
        let msg = err.to_string();
        assert!(msg.contains("force"));
        assert!(msg.contains("raw count"));
    }

    #[test]
    fn test_out_of_tolerance_display_names_stage() {
        let err = TensileError::CalibrationOutOfTolerance {
            stage: 2,
            weight_kg: 15.9,
            reading: 9000.0,
            predicted: 8000.0,
            deviation_pct: 11.1,
            limit_pct: 5.0,
        };
        let msg = err.to_string();
        assert!(msg.contains("stage 3"));
        assert!(msg.contains("15.9 kg"));
        assert!(msg.contains("11.1%"));
    }

    #[test]
    fn test_empty_stage_display_is_one_based() {
        let err = TensileError::EmptyCalibrationStage {
            stage: 0,
            weight_kg: 0.0,
        };
        assert_eq!(
            err.to_string(),
            "Calibration stage 1 (0 kg) collected no samples"
        );
    }

    #[test]
    fn test_tensile_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: TensileError = io_err.into();
        assert!(matches!(err, TensileError::Io(_)));
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(TensileError::EndOfStream.exit_code(), 0);
        assert_eq!(TensileError::Config("no port".into()).exit_code(), 1);
        assert_eq!(
            TensileError::ProtocolMismatch {
                expected: Unit::Force,
                received: Unit::RawCount
            }
            .exit_code(),
            1
        );
        assert_eq!(TensileError::TransportFatal("gone".into()).exit_code(), 1);
    }
}
