use std::fmt;

use serde::{Deserialize, Serialize};

/// Standard gravity in m/s²
pub const STANDARD_GRAVITY: f64 = 9.80665;

/// Unit space a device reading is expressed in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Unit {
    /// Unscaled HX711 output
    RawCount,
    /// Newtons, calibrated on the microcontroller
    Force,
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Unit::RawCount => write!(f, "raw count"),
            Unit::Force => write!(f, "force"),
        }
    }
}

/// A single unit-tagged value from the load cell stream
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reading {
    RawCount(f64),
    Force(f64),
}

impl Reading {
    pub fn unit(&self) -> Unit {
        match self {
            Reading::RawCount(_) => Unit::RawCount,
            Reading::Force(_) => Unit::Force,
        }
    }

    pub fn value(&self) -> f64 {
        match self {
            Reading::RawCount(v) | Reading::Force(v) => *v,
        }
    }
}

/// Print axis of the specimen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    Xy,
    Z,
}

impl Axis {
    /// Default specimen cross-section in mm²
    pub fn default_cross_section_mm2(&self) -> f64 {
        match self {
            Axis::Xy => 20.0,
            Axis::Z => 30.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Axis::Xy => "xy",
            Axis::Z => "z",
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Filament identity used to key stored results
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterialIdentity {
    pub brand: String,
    pub material_type: String,
    pub color: String,
}

impl MaterialIdentity {
    pub fn new(
        brand: impl Into<String>,
        material_type: impl Into<String>,
        color: impl Into<String>,
    ) -> Self {
        Self {
            brand: brand.into(),
            material_type: material_type.into(),
            color: color.into(),
        }
    }

    /// Directory name for per-material output: "{brand} {type} {color}"
    pub fn directory_name(&self) -> String {
        format!("{} {} {}", self.brand, self.material_type, self.color)
    }
}

impl fmt::Display for MaterialIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({})", self.brand, self.material_type, self.color)
    }
}
