use std::sync::LazyLock;

use regex::Regex;

use super::types::Reading;
use crate::error::ProtocolError;

// Bare number: raw HX711 count
static RAW_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[-+]?\d+(?:\.\d*)?(?:[eE][-+]?\d+)?$").unwrap());

// Number with an N suffix: force already calibrated on the device
static FORCE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([-+]?\d+(?:\.\d*)?(?:[eE][-+]?\d+)?)\s*N$").unwrap()
});

/// Parse a single line from the load cell serial output
///
/// Accepted forms:
/// - `-123456` or `1234.5` - raw count
/// - `12.5 N` or `12.5N` - force in Newtons
pub fn parse_line(input: &str) -> Result<Reading, ProtocolError> {
    let trimmed = input.trim();

    if trimmed.is_empty() {
        return Err(ProtocolError::Empty);
    }

    if RAW_REGEX.is_match(trimmed) {
        return parse_finite(trimmed).map(Reading::RawCount);
    }

    if let Some(caps) = FORCE_REGEX.captures(trimmed) {
        return parse_finite(&caps[1]).map(Reading::Force);
    }

    Err(ProtocolError::Malformed(trimmed.to_string()))
}

fn parse_finite(text: &str) -> Result<f64, ProtocolError> {
    match text.parse::<f64>() {
        Ok(value) if value.is_finite() => Ok(value),
        _ => Err(ProtocolError::Malformed(text.to_string())),
    }
}
