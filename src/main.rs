use std::io::BufRead;
use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use tokio::sync::mpsc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod config;
mod data_source;
mod error;
mod processing;
mod protocol;
mod service;
mod storage;

use config::{CalibrateArgs, Cli, Command, DeviceArgs, DeviceUnits, FileConfig, TestArgs};
use data_source::SampleTransport;
use data_source::serial::SerialTransport;
use error::TensileError;
use processing::smoothing::SmoothedSampleSource;
use protocol::Unit;
use service::calibrate_loop::run_calibration;
use service::test_loop::{ForceConversion, SessionEnd, run_test};
use storage::calibration_store::DEFAULT_STAGE_LOG_DIR;
use storage::{CalibrationStore, ResultsStore};

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize tracing with colors and stderr output
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(true)
                .with_writer(std::io::stderr),
        )
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tensile_tester=info".into()),
        )
        .init();

    let cli = Cli::parse();

    if cli.list_ports {
        list_serial_ports();
        return ExitCode::SUCCESS;
    }

    let Some(command) = cli.command else {
        eprintln!("Error: Please specify a command (calibrate or test)");
        eprintln!("Use --help for usage information");
        return ExitCode::from(1);
    };

    match run(&cli.config, command).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{}", e);
            eprintln!("Error: {}", e);
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run(config_path: &Path, command: Command) -> Result<ExitCode, TensileError> {
    let file = FileConfig::load(config_path)?;
    match command {
        Command::Calibrate(args) => calibrate(args, &file).await,
        Command::Test(args) => test(args, &file).await,
    }
}

async fn calibrate(args: CalibrateArgs, file: &FileConfig) -> Result<ExitCode, TensileError> {
    let calibrator = args.calibrator(file)?;
    let store = CalibrationStore::new(&args.calibration_file);
    let stage_log_dir = args
        .calibration_file
        .parent()
        .unwrap_or(Path::new(""))
        .join(DEFAULT_STAGE_LOG_DIR);

    let mut source = open_source(&args.device, file, Unit::RawCount).await?;
    let mut confirmations = spawn_operator_input();

    let result = run_calibration(
        &mut source,
        calibrator,
        &store,
        &stage_log_dir,
        &mut confirmations,
        shutdown_signal(),
    )
    .await;
    close_source(&mut source).await;

    let outcome = result?;
    tracing::info!(
        "Calibration written to {} ({} stage logs, worst deviation {:.2}%)",
        outcome.calibration_file.display(),
        outcome.stage_logs.len(),
        outcome.report.max_deviation_pct
    );
    Ok(ExitCode::SUCCESS)
}

async fn test(args: TestArgs, file: &FileConfig) -> Result<ExitCode, TensileError> {
    let config = args.session_config(file)?;
    let conversion = match args.device_units {
        DeviceUnits::Raw => {
            ForceConversion::Calibrated(CalibrationStore::new(&args.calibration_file).load()?)
        }
        DeviceUnits::Force => ForceConversion::Passthrough,
    };
    let store = ResultsStore::new(args.data_dir(file));

    let mut source = open_source(&args.device, file, conversion.expected_unit()).await?;
    let result = run_test(&mut source, conversion, config, &store, shutdown_signal()).await;
    if source.skipped_lines() > 0 {
        tracing::info!("Skipped {} malformed lines", source.skipped_lines());
    }
    close_source(&mut source).await;

    let outcome = result?;
    tracing::info!(
        "{}/{} trials stored under {} ({} trial logs{})",
        outcome.summary.completed_count,
        outcome.summary.planned_count,
        store.root().display(),
        outcome.persisted.trial_logs.len(),
        match (&outcome.persisted.summary, &outcome.persisted.master_table) {
            (Some(_), Some(_)) => ", summary and master table updated",
            _ => "",
        }
    );
    match outcome.end {
        SessionEnd::TransportLost(msg) => {
            let err = TensileError::TransportFatal(msg);
            eprintln!("Error: {}", err);
            Ok(ExitCode::from(err.exit_code()))
        }
        SessionEnd::Completed | SessionEnd::Interrupted | SessionEnd::StreamEnded => {
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn open_source(
    device: &DeviceArgs,
    file: &FileConfig,
    unit: Unit,
) -> Result<SmoothedSampleSource<Box<dyn SampleTransport>>, TensileError> {
    let window = device.window_size(file)?;
    let transport = device
        .transport_config(file, SerialTransport::detect_port)?
        .open()
        .await?;

    let source = SmoothedSampleSource::new(transport, unit, window);
    tracing::info!(
        "Reading {} values from {} (window {})",
        source.expected_unit(),
        source.transport().name(),
        window
    );
    Ok(source)
}

async fn close_source(source: &mut SmoothedSampleSource<Box<dyn SampleTransport>>) {
    if let Err(e) = source.close().await {
        tracing::warn!("Failed to close {}: {}", source.transport().name(), e);
    }
}

/// Forward every line typed on stdin as one placement confirmation
fn spawn_operator_input() -> mpsc::Receiver<()> {
    let (tx, rx) = mpsc::channel(4);
    // Plain thread: a blocking stdin read would stall runtime shutdown
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            if line.is_err() || tx.blocking_send(()).is_err() {
                break;
            }
        }
    });
    rx
}

/// List available serial ports
fn list_serial_ports() {
    let ports = match SerialTransport::list_available_ports() {
        Ok(ports) => ports,
        Err(e) => {
            eprintln!("Error listing serial ports: {}", e);
            return;
        }
    };
    if ports.is_empty() {
        println!("No serial ports found");
        return;
    }

    println!("Available serial ports:");
    for port in ports {
        let description = match port.port_type {
            serialport::SerialPortType::UsbPort(info) => format!(
                "USB {:04x}:{:04x} {}",
                info.vid,
                info.pid,
                info.product.unwrap_or_else(|| "Unknown".to_string())
            ),
            serialport::SerialPortType::BluetoothPort => "Bluetooth".to_string(),
            serialport::SerialPortType::PciPort => "PCI".to_string(),
            serialport::SerialPortType::Unknown => "Unknown".to_string(),
        };
        println!("  {} - {}", port.port_name, description);
    }
}

/// Wait for Ctrl+C; never resolves if the handler cannot be installed
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to install Ctrl+C handler: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Received shutdown signal");
}
