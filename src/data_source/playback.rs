use std::path::PathBuf;
use std::sync::LazyLock;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::time::{Duration, Instant, sleep_until};

use super::SampleTransport;
use crate::error::TensileError;
use crate::protocol::{Reading, parse_line};

// ISO8601 timestamp at start of line, with optional timezone (Z or +HH:MM)
static TIMESTAMP_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:\d{2})?)\s+(.*)$")
        .unwrap()
});

/// A log line split into its optional timestamp and its payload
#[derive(Debug, Clone, PartialEq)]
struct LogLine {
    timestamp: Option<DateTime<Utc>>,
    content: String,
}

/// Transport replaying a recorded load cell log
///
/// Lines are either bare device output (`1234`, `12.5 N`) or prefixed with an
/// ISO8601 timestamp, in which case playback is paced to the recorded timing.
pub struct PlaybackTransport {
    log_file: PathBuf,
    speed_multiplier: f64,
    loop_playback: bool,
    lines: Lines<BufReader<File>>,
    pacing: Option<(DateTime<Utc>, Instant)>,
}

impl PlaybackTransport {
    pub async fn open(
        log_file: PathBuf,
        speed_multiplier: f64,
        loop_playback: bool,
    ) -> Result<Self, TensileError> {
        let lines = Self::open_lines(&log_file).await?;

        tracing::info!(
            "Playback started from {:?} at {}x speed",
            log_file,
            speed_multiplier
        );

        Ok(Self {
            log_file,
            speed_multiplier: speed_multiplier.max(0.1), // Minimum 0.1x speed
            loop_playback,
            lines,
            pacing: None,
        })
    }

    async fn open_lines(log_file: &PathBuf) -> Result<Lines<BufReader<File>>, TensileError> {
        let file = File::open(log_file).await?;
        Ok(BufReader::new(file).lines())
    }

    /// Split a log line into timestamp and content
    /// Format: "2025-01-15T10:30:00.123 1234567" or just "1234567"
    fn parse_log_line(line: &str) -> LogLine {
        let trimmed = line.trim();

        let Some(caps) = TIMESTAMP_REGEX.captures(trimmed) else {
            return LogLine {
                timestamp: None,
                content: trimmed.to_string(),
            };
        };

        let timestamp_str = &caps[1];
        let timestamp = DateTime::parse_from_rfc3339(timestamp_str)
            .map(|dt| dt.with_timezone(&Utc))
            .or_else(|_| {
                // Try without timezone, assume UTC
                NaiveDateTime::parse_from_str(timestamp_str, "%Y-%m-%dT%H:%M:%S%.f")
                    .map(|ndt| ndt.and_utc())
            })
            .or_else(|_| {
                // Try without milliseconds
                NaiveDateTime::parse_from_str(timestamp_str, "%Y-%m-%dT%H:%M:%S")
                    .map(|ndt| ndt.and_utc())
            })
            .ok();

        LogLine {
            timestamp,
            content: caps[2].to_string(),
        }
    }

    /// Sleep until the recorded offset of this line, scaled by the speed multiplier
    async fn pace(&mut self, timestamp: DateTime<Utc>) {
        let (log_start, playback_start) = *self.pacing.get_or_insert((timestamp, Instant::now()));

        let log_elapsed_ms = (timestamp - log_start).num_milliseconds().max(0) as f64;
        let target = Duration::from_millis((log_elapsed_ms / self.speed_multiplier) as u64);
        sleep_until(playback_start + target).await;
    }
}

#[async_trait]
impl SampleTransport for PlaybackTransport {
    async fn read_one(&mut self) -> Result<Option<Reading>, TensileError> {
        let line = match self.lines.next_line().await? {
            Some(line) => line,
            None if self.loop_playback => {
                tracing::info!("Looping playback from start");
                self.lines = Self::open_lines(&self.log_file).await?;
                self.pacing = None;
                return Ok(None);
            }
            None => {
                tracing::info!("Playback finished");
                return Err(TensileError::EndOfStream);
            }
        };

        let log_line = Self::parse_log_line(&line);
        if let Some(timestamp) = log_line.timestamp {
            self.pace(timestamp).await;
        }

        match parse_line(&log_line.content) {
            Ok(reading) => Ok(Some(reading)),
            Err(e) => {
                tracing::trace!("Skipping playback line: {}", e);
                Ok(None)
            }
        }
    }

    async fn reset(&mut self) -> Result<(), TensileError> {
        // A recording has no stale input to discard
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TensileError> {
        tracing::info!("Playback transport stopped");
        Ok(())
    }

    fn name(&self) -> &str {
        self.log_file.to_str().unwrap_or("playback")
    }
}
