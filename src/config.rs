use crate::{AlignError, Placement};
use anyhow::{Context, Result};
use chrono::Duration;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Which event survives when several fall inside one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BeepTieBreak {
    #[default]
    Earliest, // first event inside the slot
    Latest,   // event closest to the slot boundary
}

impl FromStr for BeepTieBreak {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "earliest" => Ok(BeepTieBreak::Earliest),
            "latest" => Ok(BeepTieBreak::Latest),
            _ => Err(format!(
                "Invalid tie break: {}. Use earliest (default) or latest",
                s
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlignmentConfig {
    pub event_window_minutes: u32,
    pub feature_window_seconds: u32,
    pub slot_duration_minutes: u32,
    pub day_start_hour: u32,
    pub day_end_hour: u32,
    pub decimation_factor: u32,
    pub base_sample_rate_hz: f64,
    /// Largest accepted gap between a reference time and its anchor sample;
    /// `None` means one slot duration.
    pub admission_tolerance_minutes: Option<u32>,
    pub beep_tie_break: BeepTieBreak,
    /// Walk the three placements on separate threads.
    pub parallel: bool,
}

impl Default for AlignmentConfig {
    fn default() -> Self {
        Self {
            event_window_minutes: 15,
            feature_window_seconds: 60,
            slot_duration_minutes: 30,
            day_start_hour: 6,
            day_end_hour: 24,
            decimation_factor: 4,
            base_sample_rate_hz: 200.0,
            admission_tolerance_minutes: None,
            beep_tie_break: BeepTieBreak::Earliest,
            parallel: false,
        }
    }
}

impl AlignmentConfig {
    /// Post-decimation sample rate in Hz.
    pub fn sample_rate(&self) -> f64 {
        self.base_sample_rate_hz / self.decimation_factor as f64
    }

    /// Samples per trial window.
    pub fn window_length(&self) -> usize {
        (self.event_window_minutes as f64 * self.feature_window_seconds as f64 * self.sample_rate())
            .round() as usize
    }

    pub fn slot_duration(&self) -> Duration {
        Duration::minutes(self.slot_duration_minutes as i64)
    }

    pub fn admission_tolerance(&self) -> Duration {
        Duration::minutes(
            self.admission_tolerance_minutes
                .unwrap_or(self.slot_duration_minutes) as i64,
        )
    }

    pub fn validate(&self) -> Result<(), AlignError> {
        let invalid = |msg: String| -> Result<(), AlignError> { Err(AlignError::InvalidRange(msg)) };

        if self.decimation_factor == 0 {
            return invalid("decimation factor must be at least 1".to_string());
        }
        if !(self.base_sample_rate_hz > 0.0) {
            return invalid(format!(
                "base sample rate must be positive, got {}",
                self.base_sample_rate_hz
            ));
        }
        if self.slot_duration_minutes == 0 {
            return invalid("slot duration must be at least one minute".to_string());
        }
        if self.day_start_hour >= self.day_end_hour || self.day_end_hour > 24 {
            return invalid(format!(
                "daytime interval {}:00-{}:00 is empty or exceeds one day",
                self.day_start_hour, self.day_end_hour
            ));
        }
        if self.window_length() == 0 {
            return invalid("trial window holds no samples".to_string());
        }
        Ok(())
    }
}

/// Sensor identifier (filename prefix) to body placement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SensorMap {
    entries: HashMap<String, Placement>,
}

impl Default for SensorMap {
    fn default() -> Self {
        let mut entries = HashMap::new();
        for id in ["13797", "13799", "13794", "13806"] {
            entries.insert(id.to_string(), Placement::Left);
        }
        for id in ["13805", "13801", "13793", "13795"] {
            entries.insert(id.to_string(), Placement::Right);
        }
        for id in ["13804", "13792", "13803", "13796"] {
            entries.insert(id.to_string(), Placement::Chest);
        }
        Self { entries }
    }
}

impl SensorMap {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    pub fn insert(&mut self, sensor_id: impl Into<String>, placement: Placement) {
        self.entries.insert(sensor_id.into(), placement);
    }

    pub fn placement_of(&self, sensor_id: &str) -> Option<Placement> {
        self.entries.get(sensor_id).copied()
    }

    /// Reads a JSON object such as `{"13797": "left", "13804": "chest"}`.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read sensor map: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse sensor map: {}", path.display()))
    }
}

/// Build the synchronized EMA trial dataset for one subject
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Directory holding the subject's .edf recordings
    #[arg(help = "Directory holding the subject's .edf recordings")]
    pub subject_dir: PathBuf,

    /// CSV file with the self-report events (needs a beep_time_start column)
    #[arg(long)]
    pub events: PathBuf,

    /// Keep only event rows whose ID column equals this value
    #[arg(long)]
    pub subject: Option<String>,

    /// Directory for the generated dataset files
    #[arg(long, env = "EMA_ALIGN_OUTPUT", default_value = "data/preprocessed")]
    pub output_dir: PathBuf,

    /// JSON file mapping sensor identifiers to left/right/chest
    #[arg(long)]
    pub sensor_map: Option<PathBuf>,

    /// Trial window length in minutes
    #[arg(long, default_value = "15")]
    pub event_window_minutes: u32,

    /// Feature window length in seconds
    #[arg(long, default_value = "60")]
    pub feature_window_seconds: u32,

    /// Slot grid spacing in minutes
    #[arg(long, default_value = "30")]
    pub slot_duration_minutes: u32,

    /// First hour of the daytime interval
    #[arg(long, default_value = "6")]
    pub day_start_hour: u32,

    /// Last hour of the daytime interval (24 = midnight)
    #[arg(long, default_value = "24")]
    pub day_end_hour: u32,

    /// Downsampling factor applied to every recording
    #[arg(long, default_value = "4")]
    pub decimation_factor: u32,

    /// Native sample rate of the sensor units in Hz
    #[arg(long, default_value = "200.0")]
    pub base_sample_rate_hz: f64,

    /// Maximum distance in minutes between reference time and anchor sample (defaults to the slot duration)
    #[arg(long)]
    pub admission_tolerance_minutes: Option<u32>,

    /// Event kept when several share a slot (earliest [default] or latest)
    #[arg(long, default_value = "earliest")]
    pub beep_tie_break: BeepTieBreak,

    /// Walk the three placements in parallel
    #[arg(long)]
    pub parallel: bool,

    /// Also extract tremor and bradykinesia features for every kept trial
    #[arg(long)]
    pub features: bool,
}

impl Args {
    pub fn alignment_config(&self) -> AlignmentConfig {
        AlignmentConfig {
            event_window_minutes: self.event_window_minutes,
            feature_window_seconds: self.feature_window_seconds,
            slot_duration_minutes: self.slot_duration_minutes,
            day_start_hour: self.day_start_hour,
            day_end_hour: self.day_end_hour,
            decimation_factor: self.decimation_factor,
            base_sample_rate_hz: self.base_sample_rate_hz,
            admission_tolerance_minutes: self.admission_tolerance_minutes,
            beep_tie_break: self.beep_tie_break,
            parallel: self.parallel,
        }
    }

    pub fn sensor_map(&self) -> Result<SensorMap> {
        match &self.sensor_map {
            Some(path) => SensorMap::from_json_file(path),
            None => Ok(SensorMap::default()),
        }
    }
}
