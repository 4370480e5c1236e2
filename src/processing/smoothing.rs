use std::collections::VecDeque;

use crate::data_source::SampleTransport;
use crate::error::TensileError;
use crate::protocol::{Reading, Unit};

/// Default number of readings averaged by the moving window
pub const DEFAULT_WINDOW_SIZE: usize = 3;

/// Moving-average view over a load cell transport
///
/// Only readings in the expected unit space are accepted. Malformed lines are
/// skipped without touching the window.
pub struct SmoothedSampleSource<T> {
    transport: T,
    expected: Unit,
    window: VecDeque<f64>,
    window_size: usize,
    skipped: u64,
}

impl<T: SampleTransport> SmoothedSampleSource<T> {
    pub fn new(transport: T, expected: Unit, window_size: usize) -> Self {
        let window_size = window_size.max(1);
        Self {
            transport,
            expected,
            window: VecDeque::with_capacity(window_size),
            window_size,
            skipped: 0,
        }
    }

    pub fn expected_unit(&self) -> Unit {
        self.expected
    }

    /// Number of malformed or empty lines skipped so far
    pub fn skipped_lines(&self) -> u64 {
        self.skipped
    }

    /// Next valid reading, unsmoothed
    pub async fn next_raw(&mut self) -> Result<f64, TensileError> {
        loop {
            match self.transport.read_one().await? {
                Some(reading) => return self.check_unit(reading),
                None => {
                    self.skipped += 1;
                    tracing::trace!("Skipped invalid line ({} so far)", self.skipped);
                }
            }
        }
    }

    /// Mean of the window after it has been filled or advanced by one reading
    pub async fn next_smoothed(&mut self) -> Result<f64, TensileError> {
        loop {
            let value = self.next_raw().await?;
            let was_full = self.window.len() == self.window_size;
            if was_full {
                self.window.pop_front();
            }
            self.window.push_back(value);

            if was_full || self.window.len() == self.window_size {
                break;
            }
        }

        Ok(self.window.iter().sum::<f64>() / self.window.len() as f64)
    }

    /// Empty the window and drop input buffered by the transport
    pub async fn reset(&mut self) -> Result<(), TensileError> {
        self.window.clear();
        self.transport.reset().await
    }

    /// Release the transport
    pub async fn close(&mut self) -> Result<(), TensileError> {
        self.transport.close().await
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn check_unit(&self, reading: Reading) -> Result<f64, TensileError> {
        if reading.unit() != self.expected {
            tracing::error!(
                "Unit mismatch on {}: expected {}, received {}",
                self.transport.name(),
                self.expected,
                reading.unit()
            );
            return Err(TensileError::ProtocolMismatch {
                expected: self.expected,
                received: reading.unit(),
            });
        }
        Ok(reading.value())
    }
}
