//! Forward-only view over one placement's recording files.
//!
//! Files are decoded one at a time and released once their samples are
//! consumed. Sample indices are absolute: they count every sample of every
//! decoded file that came before, so a placement's positions form one
//! increasing sequence across file boundaries.

use crate::data_loading::{SensorFile, SensorReader};
use crate::{AlignError, Placement, CHANNELS_PER_PLACEMENT};
use chrono::{DateTime, Duration, Utc};
use log::{debug, warn};
use ndarray::{s, ArrayView2};
use std::path::{Path, PathBuf};

/// Sample picked for a reference time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleHit {
    /// Absolute index into the concatenation of the placement's files
    pub index: usize,
    pub timestamp: DateTime<Utc>,
    /// `reference - timestamp`, never negative
    pub offset: Duration,
}

pub struct SignalCursor<'a, R: SensorReader + ?Sized> {
    placement: Placement,
    reader: &'a R,
    paths: &'a [PathBuf],
    expected_rate: f64,
    next_path: usize,
    current: Option<SensorFile>,
    current_path: Option<&'a PathBuf>,
    // following file, decoded early to decide whether it replaces `current`
    lookahead: Option<(SensorFile, &'a PathBuf)>,
    // absolute index of the current file's first sample
    base: usize,
    // local index of the last sample handed out from the current file
    visited: Option<usize>,
}

impl<'a, R: SensorReader + ?Sized> SignalCursor<'a, R> {
    pub fn new(placement: Placement, paths: &'a [PathBuf], reader: &'a R, expected_rate: f64) -> Self {
        Self {
            placement,
            reader,
            paths,
            expected_rate,
            next_path: 0,
            current: None,
            current_path: None,
            lookahead: None,
            base: 0,
            visited: None,
        }
    }

    pub fn placement(&self) -> Placement {
        self.placement
    }

    /// Absolute index of the last sample handed out, if any.
    pub fn position(&self) -> Option<usize> {
        self.visited.map(|local| self.base + local)
    }

    pub fn current_file(&self) -> Option<&SensorFile> {
        self.current.as_ref()
    }

    fn next_unvisited(&self) -> usize {
        self.visited.map_or(0, |local| local + 1)
    }

    /// Makes sure a decoded file that can serve `reference_time` is open.
    ///
    /// A file with unvisited samples stays open while it reaches
    /// `reference_time`. When it ends earlier, the following file replaces it
    /// only if that file alone holds more than `window_length` samples up to
    /// `reference_time`; otherwise the tail of the open file remains the best
    /// candidate. Exhausted files are released. Files failing to decode or
    /// holding fewer than `window_length` samples are skipped with a warning.
    pub fn advance_to_or_past(
        &mut self,
        reference_time: DateTime<Utc>,
        window_length: usize,
    ) -> Result<(), AlignError> {
        loop {
            if let Some(file) = &self.current {
                let exhausted = self.next_unvisited() >= file.len();
                let behind = file
                    .last_timestamp()
                    .map_or(true, |last| last < reference_time);

                if !exhausted && !behind {
                    return Ok(());
                }
                if !exhausted && !self.next_covers(reference_time, window_length) {
                    return Ok(());
                }
                self.release();
            }

            self.open_next(window_length)?;
        }
    }

    /// Whether the following file can cut a full window ending at `reference_time`.
    fn next_covers(&mut self, reference_time: DateTime<Utc>, window_length: usize) -> bool {
        if self.lookahead.is_none() {
            self.lookahead = self.decode_next(window_length);
        }
        self.lookahead.as_ref().is_some_and(|(file, _)| {
            file.timestamps().partition_point(|t| *t <= reference_time) > window_length
        })
    }

    fn release(&mut self) {
        if let Some(file) = self.current.take() {
            debug!(
                "Released {} after {} samples",
                self.current_path.map_or_else(String::new, |p| p.display().to_string()),
                file.len()
            );
            self.base += file.len();
        }
        self.current_path = None;
        self.visited = None;
    }

    fn open_next(&mut self, window_length: usize) -> Result<(), AlignError> {
        let next = match self.lookahead.take() {
            Some(next) => Some(next),
            None => self.decode_next(window_length),
        };
        let Some((file, path)) = next else {
            return Err(AlignError::NoRemainingData(self.placement));
        };
        self.current = Some(file);
        self.current_path = Some(path);
        self.visited = None;
        Ok(())
    }

    /// Decodes the following paths until one yields a usable file.
    fn decode_next(&mut self, window_length: usize) -> Option<(SensorFile, &'a PathBuf)> {
        let paths = self.paths;
        while let Some(path) = paths.get(self.next_path) {
            self.next_path += 1;
            debug!("Opening {} sensor file {}", self.placement, path.display());

            match self.decode(path, window_length) {
                Ok(file) => return Some((file, path)),
                Err(e) => warn!("{}", e),
            }
        }
        None
    }

    fn decode(&self, path: &Path, window_length: usize) -> Result<SensorFile, AlignError> {
        let corrupt = |reason: String| AlignError::CorruptFile {
            path: path.to_path_buf(),
            reason,
        };

        let file = self
            .reader
            .read(path)
            .map_err(|e| corrupt(format!("{:#}", e)))?;

        if file.channels() != CHANNELS_PER_PLACEMENT {
            return Err(corrupt(format!(
                "{} channels, expected {}",
                file.channels(),
                CHANNELS_PER_PLACEMENT
            )));
        }
        if (file.sample_rate() - self.expected_rate).abs() > 1e-6 {
            return Err(corrupt(format!(
                "sample rate {} Hz, expected {} Hz",
                file.sample_rate(),
                self.expected_rate
            )));
        }
        if file.len() < window_length {
            return Err(corrupt(format!(
                "File too short to proceed ({} of {} samples)",
                file.len(),
                window_length
            )));
        }
        Ok(file)
    }

    /// Latest unvisited sample of the open file at or before `reference_time`.
    ///
    /// Only samples after the last one handed out are candidates, and a hit
    /// becomes the new last one, so successive hits never move backwards.
    pub fn nearest_sample_at_or_before(&mut self, reference_time: DateTime<Utc>) -> Option<SampleHit> {
        let file = self.current.as_ref()?;
        let from = self.next_unvisited();
        let candidates = file.timestamps().get(from..)?;

        let count = candidates.partition_point(|t| *t <= reference_time);
        if count == 0 {
            return None;
        }

        let local = from + count - 1;
        let timestamp = candidates[count - 1];
        self.visited = Some(local);

        Some(SampleHit {
            index: self.base + local,
            timestamp,
            offset: reference_time - timestamp,
        })
    }

    /// The `window_length` samples of the open file before absolute index
    /// `end_index` (exclusive).
    pub fn extract_window(
        &self,
        end_index: usize,
        window_length: usize,
    ) -> Result<ArrayView2<'_, f32>, AlignError> {
        let insufficient = |available: usize| AlignError::InsufficientHistory {
            index: end_index,
            available,
            required: window_length,
        };

        let file = self.current.as_ref().ok_or_else(|| insufficient(0))?;
        let local = end_index
            .checked_sub(self.base)
            .filter(|local| *local <= file.len())
            .ok_or_else(|| insufficient(0))?;

        if local < window_length {
            return Err(insufficient(local));
        }
        Ok(file.samples().slice(s![local - window_length..local, ..]))
    }
}
