#[cfg(test)]
pub mod memory;
pub mod playback;
pub mod serial;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::TensileError;
use crate::protocol::Reading;

/// Trait for abstracting where load cell readings come from (real hardware vs playback)
#[async_trait]
pub trait SampleTransport: Send {
    /// Wait for the next line from the device
    ///
    /// Returns `Ok(None)` for an empty or malformed line so the caller can skip it.
    /// Returns an error only once the transport cannot recover.
    async fn read_one(&mut self) -> Result<Option<Reading>, TensileError>;

    /// Discard any input buffered since the last read
    async fn reset(&mut self) -> Result<(), TensileError>;

    /// Release the underlying device
    async fn close(&mut self) -> Result<(), TensileError>;

    /// Get the name of this transport for logging
    fn name(&self) -> &str;
}

/// Configuration for creating transports
#[derive(Debug, Clone)]
pub enum TransportConfig {
    /// Real serial port connection
    Serial {
        port: String,
        baud_rate: u32,
        read_timeout: Duration,
        max_reconnect_attempts: u32,
        reconnect_delay: Duration,
    },
    /// Log file playback
    Playback {
        log_file: PathBuf,
        speed_multiplier: f64,
        loop_playback: bool,
    },
}

impl TransportConfig {
    /// Open a transport from this configuration
    pub async fn open(&self) -> Result<Box<dyn SampleTransport>, TensileError> {
        match self {
            TransportConfig::Serial {
                port,
                baud_rate,
                read_timeout,
                max_reconnect_attempts,
                reconnect_delay,
            } => {
                let transport = serial::SerialTransport::open(serial::SerialSettings {
                    port_name: port.clone(),
                    baud_rate: *baud_rate,
                    read_timeout: *read_timeout,
                    max_reconnect_attempts: *max_reconnect_attempts,
                    reconnect_delay: *reconnect_delay,
                })?;
                Ok(Box::new(transport))
            }
            TransportConfig::Playback {
                log_file,
                speed_multiplier,
                loop_playback,
            } => {
                let transport = playback::PlaybackTransport::open(
                    log_file.clone(),
                    *speed_multiplier,
                    *loop_playback,
                )
                .await?;
                Ok(Box::new(transport))
            }
        }
    }
}

#[async_trait]
impl<T: SampleTransport + ?Sized> SampleTransport for Box<T> {
    async fn read_one(&mut self) -> Result<Option<Reading>, TensileError> {
        (**self).read_one().await
    }

    async fn reset(&mut self) -> Result<(), TensileError> {
        (**self).reset().await
    }

    async fn close(&mut self) -> Result<(), TensileError> {
        (**self).close().await
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}
