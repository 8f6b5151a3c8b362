use crate::Placement;
use std::path::PathBuf;
use thiserror::Error;

/// Conditions raised while aligning sensor recordings with the event log.
///
/// Only `InvalidRange` aborts a run. The others are recovered where they occur
/// and turn into a skipped file or an empty slot.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AlignError {
    /// File could not be decoded or is too short to hold one window
    #[error("{} is broken: {reason}", path.display())]
    CorruptFile { path: PathBuf, reason: String },

    /// Event log or configuration does not describe a usable time range
    #[error("Invalid range: {0}")]
    InvalidRange(String),

    /// Anchor sample has fewer trailing samples than one window requires
    #[error("Insufficient history at sample {index}: {available} of {required} samples")]
    InsufficientHistory {
        index: usize,
        available: usize,
        required: usize,
    },

    /// Every file of the placement has been consumed
    #[error("No remaining data for {0} sensor")]
    NoRemainingData(Placement),
}
