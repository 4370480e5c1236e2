use std::io::{BufRead, BufReader};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serialport::{ClearBuffer, SerialPort};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::task::JoinHandle;

use super::SampleTransport;
use crate::error::TensileError;
use crate::protocol::{Reading, parse_line};

/// Default baud rate of the load cell firmware
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Connection parameters for the load cell serial port
#[derive(Debug, Clone)]
pub struct SerialSettings {
    pub port_name: String,
    pub baud_rate: u32,
    pub read_timeout: Duration,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay: Duration,
}

/// Event forwarded from the blocking reader thread
///
/// Lines carry the reset epoch they were read under. A line from an older
/// epoch predates the last `reset` and is dropped on receipt.
#[derive(Debug)]
enum LineEvent {
    Line { epoch: u64, text: String },
    Fatal(String),
}

/// Transport for a real serial port connection to the load cell microcontroller
pub struct SerialTransport {
    port_name: String,
    line_rx: mpsc::Receiver<LineEvent>,
    is_active: Arc<AtomicBool>,
    epoch: Arc<AtomicU64>,
    reader_task: Option<JoinHandle<()>>,
}

impl SerialTransport {
    /// Open the port and start the background line reader
    pub fn open(settings: SerialSettings) -> Result<Self, TensileError> {
        let port = open_port(&settings)?;

        tracing::info!(
            "Opened {} at {} baud",
            settings.port_name,
            settings.baud_rate
        );

        let (line_tx, line_rx) = mpsc::channel(256);
        let is_active = Arc::new(AtomicBool::new(true));
        let epoch = Arc::new(AtomicU64::new(0));
        let port_name = settings.port_name.clone();

        let reader_handle = {
            let is_active = is_active.clone();
            let epoch = epoch.clone();
            tokio::task::spawn_blocking(move || {
                reader_loop(port, settings, line_tx, is_active, epoch)
            })
        };

        Ok(Self {
            port_name,
            line_rx,
            is_active,
            epoch,
            reader_task: Some(reader_handle),
        })
    }

    /// List available serial ports (helper for CLI)
    pub fn list_available_ports() -> Result<Vec<serialport::SerialPortInfo>, TensileError> {
        serialport::available_ports().map_err(TensileError::SerialPort)
    }

    /// Pick the first USB serial port, which is where the microcontroller enumerates
    pub fn detect_port() -> Result<String, TensileError> {
        let ports = Self::list_available_ports()?;
        ports
            .into_iter()
            .find(|p| matches!(p.port_type, serialport::SerialPortType::UsbPort(_)))
            .map(|p| p.port_name)
            .ok_or_else(|| {
                TensileError::Config(
                    "Serial port cannot be determined; specify it with --port".into(),
                )
            })
    }
}

fn open_port(settings: &SerialSettings) -> Result<Box<dyn SerialPort>, TensileError> {
    let port = serialport::new(&settings.port_name, settings.baud_rate)
        .timeout(settings.read_timeout)
        .open()?;
    Ok(port)
}

/// Blocking read loop: forwards complete lines and reconnects on I/O failure
fn reader_loop(
    port: Box<dyn SerialPort>,
    settings: SerialSettings,
    line_tx: mpsc::Sender<LineEvent>,
    is_active: Arc<AtomicBool>,
    epoch: Arc<AtomicU64>,
) {
    let mut reader = BufReader::new(port);
    let mut line_buf = Vec::with_capacity(64);
    let mut seen_epoch = epoch.load(Ordering::SeqCst);

    tracing::info!("Serial reader started on {}", settings.port_name);

    while is_active.load(Ordering::SeqCst) {
        let current = epoch.load(Ordering::SeqCst);
        if current != seen_epoch {
            seen_epoch = current;
            if let Err(e) = reader.get_ref().clear(ClearBuffer::Input) {
                tracing::warn!("Failed to clear serial input buffer: {}", e);
            }
            // Drop whatever BufReader had already pulled in as well
            reader = BufReader::new(reader.into_inner());
            line_buf.clear();
        }

        match reader.read_until(b'\n', &mut line_buf) {
            Ok(0) => continue,
            Ok(_) => {
                if line_buf.last() != Some(&b'\n') {
                    continue;
                }
                let text = String::from_utf8_lossy(&line_buf).into_owned();
                line_buf.clear();
                let event = LineEvent::Line {
                    epoch: seen_epoch,
                    text,
                };
                if line_tx.blocking_send(event).is_err() {
                    tracing::warn!("Line receiver dropped, stopping reader");
                    break;
                }
            }
            // Bytes of a partial line stay in line_buf until the rest arrives
            Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::error!("Serial read error on {}: {}", settings.port_name, e);
                line_buf.clear();
                match reconnect(&settings, &is_active) {
                    Some(port) => reader = BufReader::new(port),
                    None => {
                        let _ = line_tx.blocking_send(LineEvent::Fatal(format!(
                            "{}: {} (gave up after {} reconnect attempts)",
                            settings.port_name, e, settings.max_reconnect_attempts
                        )));
                        break;
                    }
                }
            }
        }
    }

    tracing::info!("Serial reader stopped");
}

fn reconnect(settings: &SerialSettings, is_active: &AtomicBool) -> Option<Box<dyn SerialPort>> {
    for attempt in 1..=settings.max_reconnect_attempts {
        if !is_active.load(Ordering::SeqCst) {
            return None;
        }
        std::thread::sleep(settings.reconnect_delay);
        match open_port(settings) {
            Ok(port) => {
                tracing::warn!(
                    "Reconnected to {} (attempt {}/{})",
                    settings.port_name,
                    attempt,
                    settings.max_reconnect_attempts
                );
                return Some(port);
            }
            Err(e) => {
                tracing::warn!(
                    "Reconnect attempt {}/{} to {} failed: {}",
                    attempt,
                    settings.max_reconnect_attempts,
                    settings.port_name,
                    e
                );
            }
        }
    }
    None
}

/// Receive the next event, dropping lines read before the latest reset
///
/// A reader blocked on a full channel during `reset` still delivers the line
/// it was holding once a slot frees up; its epoch marks it as stale.
async fn recv_current(line_rx: &mut mpsc::Receiver<LineEvent>, epoch: u64) -> Option<LineEvent> {
    loop {
        match line_rx.recv().await? {
            LineEvent::Line { epoch: line_epoch, .. } if line_epoch < epoch => {
                tracing::trace!("Dropping line from before reset");
            }
            event => return Some(event),
        }
    }
}

/// Discard every queued event; a queued fatal error is still reported
fn drain_pending(line_rx: &mut mpsc::Receiver<LineEvent>) -> Result<(), TensileError> {
    loop {
        match line_rx.try_recv() {
            Ok(LineEvent::Line { .. }) => continue,
            Ok(LineEvent::Fatal(msg)) => return Err(TensileError::TransportFatal(msg)),
            Err(TryRecvError::Empty) => return Ok(()),
            Err(TryRecvError::Disconnected) => {
                return Err(TensileError::TransportFatal("serial reader stopped".into()));
            }
        }
    }
}

fn line_event_to_reading(event: Option<LineEvent>) -> Result<Option<Reading>, TensileError> {
    match event {
        Some(LineEvent::Line { text, .. }) => match parse_line(&text) {
            Ok(reading) => Ok(Some(reading)),
            Err(e) => {
                tracing::trace!("Skipping line: {}", e);
                Ok(None)
            }
        },
        Some(LineEvent::Fatal(msg)) => Err(TensileError::TransportFatal(msg)),
        None => Err(TensileError::TransportFatal("serial reader stopped".into())),
    }
}

#[async_trait]
impl SampleTransport for SerialTransport {
    async fn read_one(&mut self) -> Result<Option<Reading>, TensileError> {
        let epoch = self.epoch.load(Ordering::SeqCst);
        let event = recv_current(&mut self.line_rx, epoch).await;
        line_event_to_reading(event)
    }

    async fn reset(&mut self) -> Result<(), TensileError> {
        // The reader clears the OS buffer when it sees the new epoch
        self.epoch.fetch_add(1, Ordering::SeqCst);
        drain_pending(&mut self.line_rx)
    }

    async fn close(&mut self) -> Result<(), TensileError> {
        self.is_active.store(false, Ordering::SeqCst);
        self.line_rx.close();

        if let Some(handle) = self.reader_task.take() {
            let _ = handle.await;
        }

        tracing::info!("Serial transport on {} closed", self.port_name);

        Ok(())
    }

    fn name(&self) -> &str {
        &self.port_name
    }
}
