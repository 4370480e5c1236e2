use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use serde::Deserialize;

use crate::data_source::TransportConfig;
use crate::data_source::serial::DEFAULT_BAUD_RATE;
use crate::error::TensileError;
use crate::processing::calibration::{
    Calibrator, DEFAULT_STAGE_DURATION, DEFAULT_WEIGHTS_KG, EmptyStagePolicy,
};
use crate::processing::smoothing::DEFAULT_WINDOW_SIZE;
use crate::processing::trial::{DEFAULT_DROP_DURATION, DEFAULT_THRESHOLD_N};
use crate::protocol::{Axis, MaterialIdentity};
use crate::service::session::{DEFAULT_TRIAL_COUNT, SessionConfig};
use crate::storage::calibration_store::DEFAULT_CALIBRATION_FILE;
use crate::storage::results::DEFAULT_DATA_DIR;

const SERIAL_READ_TIMEOUT: Duration = Duration::from_millis(100);
const SERIAL_RECONNECT_ATTEMPTS: u32 = 3;
const SERIAL_RECONNECT_DELAY: Duration = Duration::from_millis(500);

#[derive(Parser, Debug)]
#[command(name = "tensile-tester")]
#[command(about = "HX711 load cell tensile tester for 3D printed filament specimens")]
#[command(version)]
pub struct Cli {
    /// Optional JSON file with default settings
    #[arg(long, env = "TENSILE_CONFIG", default_value = "configuration.json")]
    pub config: PathBuf,

    /// List available serial ports and exit
    #[arg(long)]
    pub list_ports: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Fit raw counts to force using reference weights
    Calibrate(CalibrateArgs),

    /// Run a series of break trials for one material and axis
    Test(TestArgs),
}

/// Where samples come from
#[derive(Args, Debug, Clone)]
pub struct DeviceArgs {
    /// Serial port device path (e.g., COM3 on Windows, /dev/ttyUSB0 on Linux); autodetected if omitted
    #[arg(short, long, env = "TENSILE_PORT")]
    pub port: Option<String>,

    /// Baud rate
    #[arg(long)]
    pub baud: Option<u32>,

    /// Moving average window, in readings
    #[arg(long)]
    pub window: Option<usize>,

    /// Replay a recorded log file instead of opening a serial port
    #[arg(long, value_name = "FILE")]
    pub playback: Option<PathBuf>,

    /// Playback speed multiplier (1.0 = real-time, 2.0 = 2x speed)
    #[arg(long, default_value = "1.0")]
    pub speed: f64,

    /// Loop playback when file ends
    #[arg(long, default_value = "false")]
    pub loop_playback: bool,
}

#[derive(Args, Debug, Clone)]
pub struct CalibrateArgs {
    #[command(flatten)]
    pub device: DeviceArgs,

    /// Reference weights in kg, comma separated; the first is normally 0
    #[arg(long, value_delimiter = ',')]
    pub weights: Option<Vec<f64>>,

    /// Collection window per stage in seconds
    #[arg(long, default_value_t = DEFAULT_STAGE_DURATION.as_secs_f64())]
    pub stage_seconds: f64,

    /// Largest allowed deviation of a stage from the fitted line, in percent
    #[arg(long = "tolerance", default_value = "5.0")]
    pub tolerance_pct: f64,

    /// Fail when a stage collects no samples instead of counting it as 0
    #[arg(long, default_value = "false")]
    pub strict_stages: bool,

    /// Where to write the calibration
    #[arg(long, default_value = DEFAULT_CALIBRATION_FILE)]
    pub calibration_file: PathBuf,
}

/// Unit the firmware reports in
#[derive(clap::ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DeviceUnits {
    /// Raw HX711 counts, converted with the stored calibration
    #[default]
    Raw,
    /// Newtons, calibrated on the microcontroller
    Force,
}

#[derive(Args, Debug, Clone)]
pub struct TestArgs {
    #[command(flatten)]
    pub device: DeviceArgs,

    /// Material type (e.g., PLA, PETG)
    #[arg(short = 't', long = "type")]
    pub material_type: String,

    /// Filament manufacturer
    #[arg(short, long)]
    pub manufacturer: String,

    /// Filament color
    #[arg(short, long)]
    pub color: String,

    /// Print axis of the specimen
    #[arg(short, long, value_enum, default_value = "xy")]
    pub axis: Axis,

    /// Number of trials
    #[arg(long)]
    pub trials: Option<usize>,

    /// Force in Newtons that starts a trial
    #[arg(long)]
    pub threshold: Option<f64>,

    /// Specimen cross-section in mm² (default depends on axis)
    #[arg(long)]
    pub cross_section: Option<f64>,

    /// Seconds below threshold that end a trial
    #[arg(long)]
    pub drop_seconds: Option<f64>,

    /// Unit the device reports in
    #[arg(long, value_enum, default_value = "raw")]
    pub device_units: DeviceUnits,

    /// Extrusion width in mm, recorded in notes
    #[arg(long)]
    pub extrusion_width: Option<f64>,

    /// Layer height in mm, recorded in notes
    #[arg(long)]
    pub layer_height: Option<f64>,

    /// Printer name, recorded in notes
    #[arg(long)]
    pub printer: Option<String>,

    /// Free-form notes
    #[arg(long)]
    pub notes: Option<String>,

    /// Results directory
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Calibration used in raw device mode
    #[arg(long, default_value = DEFAULT_CALIBRATION_FILE)]
    pub calibration_file: PathBuf,
}

/// Defaults read from `configuration.json`; every field is optional
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct FileConfig {
    pub port: Option<String>,
    pub baud: Option<u32>,
    pub window: Option<usize>,
    pub trials: Option<usize>,
    pub threshold: Option<f64>,
    pub extrusion_width: Option<f64>,
    pub layer_height: Option<f64>,
    pub printer: Option<String>,
    pub weights: Option<Vec<f64>>,
    pub data_dir: Option<PathBuf>,
}

impl FileConfig {
    /// Load defaults, treating a missing file as empty
    pub fn load(path: &Path) -> Result<Self, TensileError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No configuration file at {}", path.display());
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };
        let config: FileConfig = serde_json::from_str(&text).map_err(|e| {
            TensileError::Config(format!("invalid {}: {}", path.display(), e))
        })?;
        tracing::info!("Loaded defaults from {}", path.display());
        Ok(config)
    }
}

impl DeviceArgs {
    /// Build the transport config; `detect` supplies a port when none is configured
    pub fn transport_config<D>(
        &self,
        file: &FileConfig,
        detect: D,
    ) -> Result<TransportConfig, TensileError>
    where
        D: FnOnce() -> Result<String, TensileError>,
    {
        if let Some(log_file) = &self.playback {
            return Ok(TransportConfig::Playback {
                log_file: log_file.clone(),
                speed_multiplier: self.speed,
                loop_playback: self.loop_playback,
            });
        }

        let port = match self.port.clone().or_else(|| file.port.clone()) {
            Some(port) => port,
            None => detect()?,
        };
        Ok(TransportConfig::Serial {
            port,
            baud_rate: self.baud.or(file.baud).unwrap_or(DEFAULT_BAUD_RATE),
            read_timeout: SERIAL_READ_TIMEOUT,
            max_reconnect_attempts: SERIAL_RECONNECT_ATTEMPTS,
            reconnect_delay: SERIAL_RECONNECT_DELAY,
        })
    }

    pub fn window_size(&self, file: &FileConfig) -> Result<usize, TensileError> {
        let window = self.window.or(file.window).unwrap_or(DEFAULT_WINDOW_SIZE);
        if window == 0 {
            return Err(TensileError::Config("window must be at least 1".into()));
        }
        Ok(window)
    }
}

impl CalibrateArgs {
    pub fn calibrator(&self, file: &FileConfig) -> Result<Calibrator, TensileError> {
        let weights = self
            .weights
            .clone()
            .or_else(|| file.weights.clone())
            .unwrap_or_else(|| DEFAULT_WEIGHTS_KG.to_vec());
        let stage_duration = seconds("stage-seconds", self.stage_seconds)?;
        let policy = if self.strict_stages {
            EmptyStagePolicy::Reject
        } else {
            EmptyStagePolicy::ZeroFill
        };

        if !self.tolerance_pct.is_finite() || self.tolerance_pct <= 0.0 {
            return Err(TensileError::Config(format!(
                "--tolerance must be a positive percentage, got {}",
                self.tolerance_pct
            )));
        }

        Ok(Calibrator::new(weights, stage_duration)?
            .with_empty_stage_policy(policy)
            .with_tolerance(self.tolerance_pct / 100.0))
    }
}

impl TestArgs {
    pub fn material(&self) -> Result<MaterialIdentity, TensileError> {
        for (flag, value) in [
            ("manufacturer", &self.manufacturer),
            ("type", &self.material_type),
            ("color", &self.color),
        ] {
            if value.trim().is_empty() {
                return Err(TensileError::Config(format!("--{} must not be empty", flag)));
            }
        }
        Ok(MaterialIdentity::new(
            self.manufacturer.trim(),
            self.material_type.trim(),
            self.color.trim(),
        ))
    }

    pub fn session_config(&self, file: &FileConfig) -> Result<SessionConfig, TensileError> {
        let drop_duration = match self.drop_seconds {
            Some(secs) => seconds("drop-seconds", secs)?,
            None => DEFAULT_DROP_DURATION,
        };
        let config = SessionConfig::new(
            self.material()?,
            self.axis,
            self.trials.or(file.trials).unwrap_or(DEFAULT_TRIAL_COUNT),
            self.threshold.or(file.threshold).unwrap_or(DEFAULT_THRESHOLD_N),
            self.cross_section,
            drop_duration,
        )?;
        Ok(config.with_notes(self.compose_notes(file)))
    }

    /// Print parameters as `key=value` pairs followed by free-form notes, `;` separated
    pub fn compose_notes(&self, file: &FileConfig) -> String {
        let mut parts = Vec::new();
        if let Some(width) = self.extrusion_width.or(file.extrusion_width) {
            parts.push(format!("extrusion_width={}", width));
        }
        if let Some(height) = self.layer_height.or(file.layer_height) {
            parts.push(format!("layer_height={}", height));
        }
        if let Some(printer) = self.printer.as_ref().or(file.printer.as_ref()) {
            parts.push(format!("printer={}", printer));
        }
        if let Some(notes) = self.notes.as_ref().filter(|n| !n.trim().is_empty()) {
            parts.push(notes.trim().to_string());
        }
        parts.join(";")
    }

    pub fn data_dir(&self, file: &FileConfig) -> PathBuf {
        self.data_dir
            .clone()
            .or_else(|| file.data_dir.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR))
    }
}

fn seconds(flag: &str, value: f64) -> Result<Duration, TensileError> {
    if !value.is_finite() || value <= 0.0 {
        return Err(TensileError::Config(format!(
            "--{} must be a positive number of seconds, got {}",
            flag, value
        )));
    }
    Ok(Duration::from_secs_f64(value))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    fn no_port() -> Result<String, TensileError> {
        Err(TensileError::Config("no serial ports".into()))
    }

    fn test_args(extra: &[&str]) -> TestArgs {
        let mut argv = vec!["tensile-tester", "test", "-t", "PETG", "-m", "Atomic", "-c", "black"];
        argv.extend_from_slice(extra);
        match Cli::parse_from(argv).command {
            Some(Command::Test(args)) => args,
            other => panic!("Expected test command, got {:?}", other),
        }
    }

    #[test]
    fn test_cli_parse_list_ports() {
        let cli = Cli::parse_from(["tensile-tester", "--list-ports"]);

        assert!(cli.list_ports);
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_cli_parse_calibrate() {
        let cli = Cli::parse_from([
            "tensile-tester",
            "calibrate",
            "--port",
            "/dev/ttyUSB0",
            "--weights",
            "0,5,10",
            "--strict-stages",
        ]);

        let Some(Command::Calibrate(args)) = cli.command else {
            panic!("Expected calibrate command");
        };
        assert_eq!(args.device.port.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(args.weights, Some(vec![0.0, 5.0, 10.0]));
        assert!(args.strict_stages);
        assert_eq!(args.calibration_file, PathBuf::from("calibration.json"));

        assert_eq!(args.tolerance_pct, 5.0);
        let calibrator = args.calibrator(&FileConfig::default()).unwrap();
        assert_eq!(calibrator.stage_count(), 3);
        assert_eq!(calibrator.stage_duration(), DEFAULT_STAGE_DURATION);
    }

    #[test]
    fn test_cli_parse_test_defaults() {
        let args = test_args(&[]);

        assert_eq!(args.axis, Axis::Xy);
        assert_eq!(args.device_units, DeviceUnits::Raw);

        let config = args.session_config(&FileConfig::default()).unwrap();
        assert_eq!(config.material, MaterialIdentity::new("Atomic", "PETG", "black"));
        assert_eq!(config.trial_count, 5);
        assert_eq!(config.threshold_n, 50.0);
        assert_eq!(config.cross_section_mm2, 20.0);
        assert_eq!(config.drop_duration, Duration::from_secs(10));
        assert_eq!(config.notes, "");
    }

    #[test]
    fn test_cli_parse_test_overrides() {
        let args = test_args(&[
            "-a",
            "z",
            "--trials",
            "3",
            "--threshold",
            "25",
            "--cross-section",
            "12.5",
            "--drop-seconds",
            "4",
            "--device-units",
            "force",
        ]);

        assert_eq!(args.device_units, DeviceUnits::Force);
        let config = args.session_config(&FileConfig::default()).unwrap();
        assert_eq!(config.axis, Axis::Z);
        assert_eq!(config.trial_count, 3);
        assert_eq!(config.threshold_n, 25.0);
        assert_eq!(config.cross_section_mm2, 12.5);
        assert_eq!(config.drop_duration, Duration::from_secs(4));
    }

    #[test]
    fn test_notes_composition() {
        let args = test_args(&[
            "--extrusion-width",
            "0.45",
            "--layer-height",
            "0.2",
            "--notes",
            "annealed",
        ]);
        let file = FileConfig {
            printer: Some("mk3s".into()),
            ..Default::default()
        };

        assert_eq!(
            args.compose_notes(&file),
            "extrusion_width=0.45;layer_height=0.2;printer=mk3s;annealed"
        );
    }

    #[test]
    fn test_cli_takes_precedence_over_file() {
        let args = test_args(&["--trials", "2", "--port", "COM7"]);
        let file = FileConfig {
            port: Some("/dev/ttyACM0".into()),
            baud: Some(57600),
            trials: Some(8),
            threshold: Some(30.0),
            data_dir: Some(PathBuf::from("results")),
            ..Default::default()
        };

        let config = args.session_config(&file).unwrap();
        assert_eq!(config.trial_count, 2);
        assert_eq!(config.threshold_n, 30.0);
        assert_eq!(args.data_dir(&file), PathBuf::from("results"));

        let Ok(TransportConfig::Serial {
            port, baud_rate, ..
        }) = args.device.transport_config(&file, no_port)
        else {
            panic!("Expected serial transport");
        };
        assert_eq!(port, "COM7");
        assert_eq!(baud_rate, 57600);
    }

    #[test]
    fn test_transport_config_detects_port() {
        let args = test_args(&[]);

        let config = args
            .device
            .transport_config(&FileConfig::default(), || Ok("/dev/ttyUSB3".into()))
            .unwrap();
        let TransportConfig::Serial {
            port, baud_rate, ..
        } = config
        else {
            panic!("Expected serial transport");
        };
        assert_eq!(port, "/dev/ttyUSB3");
        assert_eq!(baud_rate, 115_200);

        let err = args
            .device
            .transport_config(&FileConfig::default(), no_port)
            .unwrap_err();
        assert!(matches!(err, TensileError::Config(_)));
    }

    #[test]
    fn test_transport_config_playback() {
        let args = test_args(&["--playback", "run.log", "--speed", "4", "--loop-playback"]);

        let config = args
            .device
            .transport_config(&FileConfig::default(), no_port)
            .unwrap();
        let TransportConfig::Playback {
            log_file,
            speed_multiplier,
            loop_playback,
        } = config
        else {
            panic!("Expected playback transport");
        };
        assert_eq!(log_file, PathBuf::from("run.log"));
        assert_eq!(speed_multiplier, 4.0);
        assert!(loop_playback);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let file = FileConfig::default();
        assert!(test_args(&["--drop-seconds", "0"]).session_config(&file).is_err());
        assert!(test_args(&["--trials", "0"]).session_config(&file).is_err());
        assert!(test_args(&["--window", "0"]).device.window_size(&file).is_err());

        let mut blank = test_args(&[]);
        blank.color = " ".into();
        assert!(matches!(
            blank.session_config(&file),
            Err(TensileError::Config(_))
        ));
    }

    #[test]
    fn test_file_config_load() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"port": "/dev/ttyUSB1", "window": 5, "weights": [0, 1, 2], "printer": "voron"}}"#
        )
        .unwrap();

        let config = FileConfig::load(file.path()).unwrap();
        assert_eq!(config.port.as_deref(), Some("/dev/ttyUSB1"));
        assert_eq!(config.window, Some(5));
        assert_eq!(config.weights, Some(vec![0.0, 1.0, 2.0]));
        assert_eq!(config.trials, None);
    }

    #[test]
    fn test_file_config_missing_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = FileConfig::load(&dir.path().join("configuration.json")).unwrap();
        assert_eq!(config, FileConfig::default());
    }

    #[test]
    fn test_file_config_invalid_is_config_error() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{{not json").unwrap();

        assert!(matches!(
            FileConfig::load(file.path()),
            Err(TensileError::Config(_))
        ));
    }
}
