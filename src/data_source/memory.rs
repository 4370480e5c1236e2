use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;

use super::SampleTransport;
use crate::error::TensileError;
use crate::protocol::{Reading, parse_line};

/// Scripted transport for tests: replays raw device lines, then ends the stream
pub struct MemoryTransport {
    lines: VecDeque<String>,
    pub resets: usize,
    pub closed: bool,
    fail_at_end: Option<String>,
    interval: Option<Duration>,
}

impl MemoryTransport {
    pub fn from_lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            lines: lines.into_iter().map(Into::into).collect(),
            resets: 0,
            closed: false,
            fail_at_end: None,
            interval: None,
        }
    }

    pub fn raw_counts(values: &[f64]) -> Self {
        Self::from_lines(values.iter().map(|v| format!("{}\n", v)))
    }

    pub fn forces(values: &[f64]) -> Self {
        Self::from_lines(values.iter().map(|v| format!("{} N\n", v)))
    }

    /// Report a transport failure instead of end-of-stream once the script runs out
    pub fn failing_with(mut self, message: &str) -> Self {
        self.fail_at_end = Some(message.to_string());
        self
    }

    /// Sleep on the tokio clock before every line, like a device sampling at a fixed rate
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }
}

#[async_trait]
impl SampleTransport for MemoryTransport {
    async fn read_one(&mut self) -> Result<Option<Reading>, TensileError> {
        if let Some(interval) = self.interval {
            tokio::time::sleep(interval).await;
        }
        let Some(line) = self.lines.pop_front() else {
            return Err(match &self.fail_at_end {
                Some(msg) => TensileError::TransportFatal(msg.clone()),
                None => TensileError::EndOfStream,
            });
        };
        Ok(parse_line(&line).ok())
    }

    async fn reset(&mut self) -> Result<(), TensileError> {
        self.resets += 1;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TensileError> {
        self.closed = true;
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}
