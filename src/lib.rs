pub mod alignment;
pub mod config;
pub mod cursor;
pub mod data_loading;
pub mod error;
pub mod features;
pub mod output;
pub mod slot_grid;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

pub use alignment::{extract_trials, AlignmentOutcome};
pub use config::AlignmentConfig;
pub use error::AlignError;

/// Channels recorded by every sensor unit: three accelerometer axes followed by
/// three gyroscope axes.
pub const CHANNEL_NAMES: [&str; 6] = ["AccX", "AccY", "AccZ", "GyrX", "GyrY", "GyrZ"];
pub const CHANNELS_PER_PLACEMENT: usize = CHANNEL_NAMES.len();

/// Body location of a sensor unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Placement {
    Left,
    Right,
    Chest,
}

impl Placement {
    /// Channel-block order of the merged trial tensor.
    pub const ALL: [Placement; 3] = [Placement::Left, Placement::Right, Placement::Chest];

    pub fn index(self) -> usize {
        match self {
            Placement::Left => 0,
            Placement::Right => 1,
            Placement::Chest => 2,
        }
    }

    /// Column suffix used for persisted channels and features.
    pub fn suffix(self) -> &'static str {
        match self {
            Placement::Left => "L",
            Placement::Right => "R",
            Placement::Chest => "C",
        }
    }
}

impl fmt::Display for Placement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Placement::Left => "left",
            Placement::Right => "right",
            Placement::Chest => "chest",
        };
        f.write_str(name)
    }
}

impl FromStr for Placement {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "left" | "l" => Ok(Placement::Left),
            "right" | "r" => Ok(Placement::Right),
            "chest" | "c" => Ok(Placement::Chest),
            _ => Err(format!(
                "Invalid placement: {}. Use left, right or chest",
                s
            )),
        }
    }
}

/// Ordered recording files for each placement.
#[derive(Debug, Clone, Default)]
pub struct PlacementFiles {
    files: [Vec<PathBuf>; 3],
}

impl PlacementFiles {
    pub fn new(left: Vec<PathBuf>, right: Vec<PathBuf>, chest: Vec<PathBuf>) -> Self {
        Self {
            files: [left, right, chest],
        }
    }

    pub fn get(&self, placement: Placement) -> &[PathBuf] {
        &self.files[placement.index()]
    }

    pub fn push(&mut self, placement: Placement, path: PathBuf) {
        self.files[placement.index()].push(path);
    }

    /// Lexicographic filename order, which the recorder makes chronological.
    pub fn sort(&mut self) {
        for list in self.files.iter_mut() {
            list.sort();
        }
    }

    pub fn total(&self) -> usize {
        self.files.iter().map(Vec::len).sum()
    }
}

/// One self-report submission.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub beep_time_start: DateTime<Utc>,
    /// Raw questionnaire fields in the column order of [`EventLog::headers`].
    pub fields: Vec<String>,
}

impl EventRecord {
    pub fn new(beep_time_start: DateTime<Utc>) -> Self {
        Self {
            beep_time_start,
            fields: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventLog {
    pub headers: Vec<String>,
    pub records: Vec<EventRecord>,
}

impl EventLog {
    pub fn from_times(times: &[DateTime<Utc>]) -> Self {
        Self {
            headers: Vec::new(),
            records: times.iter().copied().map(EventRecord::new).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn first_time(&self) -> Option<DateTime<Utc>> {
        self.records.first().map(|r| r.beep_time_start)
    }

    pub fn last_time(&self) -> Option<DateTime<Utc>> {
        self.records.last().map(|r| r.beep_time_start)
    }

    /// Fails on the first record that precedes its predecessor; the log is never
    /// re-sorted.
    pub fn ensure_sorted(&self) -> Result<(), AlignError> {
        for (row, pair) in self.records.windows(2).enumerate() {
            if pair[1].beep_time_start < pair[0].beep_time_start {
                return Err(AlignError::InvalidRange(format!(
                    "event log is not sorted: row {} ({}) precedes row {} ({})",
                    row + 1,
                    pair[1].beep_time_start.format("%Y-%m-%d %H:%M:%S"),
                    row,
                    pair[0].beep_time_start.format("%Y-%m-%d %H:%M:%S"),
                )));
            }
        }
        Ok(())
    }
}
