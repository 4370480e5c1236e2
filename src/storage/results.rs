use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};

use crate::error::TensileError;
use crate::processing::trial::Trial;
use crate::protocol::{Axis, MaterialIdentity};
use crate::service::session::{SessionConfig, SessionSummary, TestSession};

pub const DEFAULT_DATA_DIR: &str = "data";
pub const MASTER_TABLE_FILE: &str = "data.csv";
pub const SUMMARY_FILE: &str = "summary.txt";

const MASTER_HEADER: [&str; 6] = [
    "brand",
    "material type",
    "color",
    "xy strength (Mpa)",
    "z strength (Mpa)",
    "notes",
];

/// Files produced by persisting one session
#[derive(Debug, Default, Clone, PartialEq)]
pub struct PersistedSession {
    pub trial_logs: Vec<PathBuf>,
    pub summary: Option<PathBuf>,
    pub master_table: Option<PathBuf>,
}

/// Test results on disk, rooted at the data directory
#[derive(Debug, Clone)]
pub struct ResultsStore {
    root: PathBuf,
}

impl ResultsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn material_dir(&self, material: &MaterialIdentity) -> PathBuf {
        self.root.join(material.directory_name())
    }

    pub fn master_table_path(&self) -> PathBuf {
        self.root.join(MASTER_TABLE_FILE)
    }

    /// Persist every completed trial, then the summary and master row if any trial completed
    pub fn persist_session(
        &self,
        session: &TestSession,
        recorded_at: DateTime<Local>,
    ) -> Result<PersistedSession, TensileError> {
        let config = session.config();
        let summary = session.summary();
        let mut persisted = PersistedSession::default();

        for trial in session.trials() {
            persisted
                .trial_logs
                .push(self.write_trial(&config.material, config.axis, trial)?);
        }

        let Some(strength) = summary.tensile_strength_mpa else {
            tracing::warn!(
                "No completed trials for {}; summary and master table left untouched",
                config.material
            );
            return Ok(persisted);
        };

        persisted.summary = Some(self.append_summary(config, &summary, recorded_at)?);
        persisted.master_table = Some(self.upsert_master(
            &config.material,
            config.axis,
            strength,
            &config.notes,
        )?);
        Ok(persisted)
    }

    /// Write `{axis}-trial-{n}.csv` with `time_ms,force_N` rows
    pub fn write_trial(
        &self,
        material: &MaterialIdentity,
        axis: Axis,
        trial: &Trial,
    ) -> Result<PathBuf, TensileError> {
        let dir = self.material_dir(material);
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{}-trial-{}.csv", axis.as_str(), trial.index));

        let mut contents = String::from("time_ms,force_N\n");
        for sample in &trial.samples {
            let _ = writeln!(contents, "{},{:.3}", sample.elapsed_ms, sample.force_n);
        }
        fs::write(&path, contents)?;

        tracing::debug!(
            "Trial {} log: {} samples -> {}",
            trial.index,
            trial.samples.len(),
            path.display()
        );
        Ok(path)
    }

    /// Append a human-readable block to the material's `summary.txt`
    pub fn append_summary(
        &self,
        config: &SessionConfig,
        summary: &SessionSummary,
        recorded_at: DateTime<Local>,
    ) -> Result<PathBuf, TensileError> {
        let dir = self.material_dir(&config.material);
        fs::create_dir_all(&dir)?;
        let path = dir.join(SUMMARY_FILE);

        let block = format_summary(config, summary, recorded_at);
        let mut existing = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        if !existing.is_empty() && !existing.ends_with("\n\n") {
            existing.push('\n');
        }
        existing.push_str(&block);
        fs::write(&path, existing)?;

        tracing::info!("Summary appended to {}", path.display());
        Ok(path)
    }

    /// Insert or update the material's row in `data.csv`, touching only this axis' column
    pub fn upsert_master(
        &self,
        material: &MaterialIdentity,
        axis: Axis,
        strength_mpa: f64,
        notes: &str,
    ) -> Result<PathBuf, TensileError> {
        fs::create_dir_all(&self.root)?;
        let path = self.master_table_path();

        let mut rows = match fs::read_to_string(&path) {
            Ok(text) => parse_csv(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        if rows.is_empty() {
            rows.push(MASTER_HEADER.iter().map(|h| h.to_string()).collect());
        }

        let column = match axis {
            Axis::Xy => 3,
            Axis::Z => 4,
        };
        let strength = format!("{:.2}", strength_mpa);

        let existing = rows.iter_mut().skip(1).find(|row| {
            row.first() == Some(&material.brand)
                && row.get(1) == Some(&material.material_type)
                && row.get(2) == Some(&material.color)
        });
        match existing {
            Some(row) => {
                row.resize(MASTER_HEADER.len(), String::new());
                row[column] = strength;
                if !notes.is_empty() {
                    row[5] = notes.to_string();
                }
                tracing::debug!("Updated master row for {}", material);
            }
            None => {
                let mut row = vec![
                    material.brand.clone(),
                    material.material_type.clone(),
                    material.color.clone(),
                    String::new(),
                    String::new(),
                    notes.to_string(),
                ];
                row[column] = strength;
                rows.push(row);
                tracing::debug!("Added master row for {}", material);
            }
        }

        let mut contents = String::new();
        for row in &rows {
            let line: Vec<String> = row.iter().map(|f| quote_field(f)).collect();
            contents.push_str(&line.join(","));
            contents.push('\n');
        }
        fs::write(&path, contents)?;

        Ok(path)
    }
}

fn format_summary(
    config: &SessionConfig,
    summary: &SessionSummary,
    recorded_at: DateTime<Local>,
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "=== Tensile test session ===");
    let _ = writeln!(out, "Recorded: {}", recorded_at.format("%Y-%m-%d %H:%M:%S"));
    let _ = writeln!(out, "Material: {}", config.material);
    let _ = writeln!(out, "Axis: {}", config.axis);
    if summary.complete {
        let _ = writeln!(
            out,
            "Trials: {}/{}",
            summary.completed_count, summary.planned_count
        );
    } else {
        let _ = writeln!(
            out,
            "Trials: {}/{} INCOMPLETE",
            summary.completed_count, summary.planned_count
        );
    }
    let _ = writeln!(out, "Threshold: {:.2} N", config.threshold_n);
    let _ = writeln!(out, "Cross-section: {:.2} mm²", config.cross_section_mm2);
    if !config.notes.is_empty() {
        let _ = writeln!(out, "Notes: {}", config.notes);
    }
    for (i, peak) in summary.peak_forces_n.iter().enumerate() {
        let _ = writeln!(out, "Trial {} peak: {:.2} N", i + 1, peak);
    }
    if let Some(average) = summary.average_force_n {
        let _ = writeln!(out, "Average force: {:.2} N", average);
    }
    if let Some(strength) = summary.tensile_strength_mpa {
        let _ = writeln!(out, "Tensile strength: {:.3} MPa", strength);
    }
    out.push('\n');
    out
}

fn quote_field(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Minimal RFC 4180 reader: quoted fields, doubled quotes, embedded newlines
fn parse_csv(text: &str) -> Vec<Vec<String>> {
    let mut rows = Vec::new();
    let mut row = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    field.push('"');
                    chars.next();
                }
                '"' => in_quotes = false,
                _ => field.push(c),
            }
            continue;
        }
        match c {
            '"' => in_quotes = true,
            ',' => row.push(std::mem::take(&mut field)),
            '\r' => {}
            '\n' => {
                row.push(std::mem::take(&mut field));
                rows.push(std::mem::take(&mut row));
            }
            _ => field.push(c),
        }
    }
    if !field.is_empty() || !row.is_empty() {
        row.push(field);
        rows.push(row);
    }

    rows.retain(|r| !(r.len() == 1 && r[0].is_empty()));
    rows
}
