//! Canonical time axis: slot-end boundaries tiling each day's daytime interval.

use crate::AlignError;
use chrono::{DateTime, Duration, NaiveTime, Utc};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotGrid {
    origin: DateTime<Utc>,
    boundaries: Vec<DateTime<Utc>>,
}

impl SlotGrid {
    /// Start of the very first slot (the first event time).
    pub fn origin(&self) -> DateTime<Utc> {
        self.origin
    }

    pub fn boundaries(&self) -> &[DateTime<Utc>] {
        &self.boundaries
    }

    pub fn boundary(&self, slot: usize) -> DateTime<Utc> {
        self.boundaries[slot]
    }

    /// Implicit start of `slot`: the previous boundary, or the origin for slot 0.
    pub fn slot_start(&self, slot: usize) -> DateTime<Utc> {
        match slot {
            0 => self.origin,
            _ => self.boundaries[slot - 1],
        }
    }

    pub fn len(&self) -> usize {
        self.boundaries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.boundaries.is_empty()
    }
}

/// Builds the slot-end timestamps for every calendar day from the first to the
/// last event (inclusive). Each day contributes the boundaries in
/// `(day_start, day_end]` spaced `slot_duration` apart; the day start itself
/// closes no slot.
pub fn build_slot_grid(
    first_event_time: DateTime<Utc>,
    last_event_time: DateTime<Utc>,
    day_start_hour: u32,
    day_end_hour: u32,
    slot_duration: Duration,
) -> Result<SlotGrid, AlignError> {
    if last_event_time < first_event_time {
        return Err(AlignError::InvalidRange(format!(
            "last event {} precedes first event {}",
            last_event_time.format("%Y-%m-%d %H:%M:%S"),
            first_event_time.format("%Y-%m-%d %H:%M:%S")
        )));
    }
    if day_start_hour >= day_end_hour || day_end_hour > 24 {
        return Err(AlignError::InvalidRange(format!(
            "daytime interval {}:00-{}:00 is empty",
            day_start_hour, day_end_hour
        )));
    }
    if slot_duration <= Duration::zero() {
        return Err(AlignError::InvalidRange(
            "slot duration must be positive".to_string(),
        ));
    }

    let first_day = first_event_time.date_naive();
    let last_day = last_event_time.date_naive();
    let mut boundaries = Vec::new();

    for day in first_day.iter_days().take_while(|d| *d <= last_day) {
        let midnight = day.and_time(NaiveTime::default()).and_utc();
        let day_start = midnight + Duration::hours(day_start_hour as i64);
        let day_end = midnight + Duration::hours(day_end_hour as i64);

        let mut boundary = day_start + slot_duration;
        while boundary <= day_end {
            boundaries.push(boundary);
            boundary += slot_duration;
        }
    }

    Ok(SlotGrid {
        origin: first_event_time,
        boundaries,
    })
}
