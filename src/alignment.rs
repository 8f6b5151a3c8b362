//! Synchronizes the three placements with the event log on the slot grid.
//!
//! The walk runs in three steps:
//! 1. [`plan_anchors`] decides, per slot, whether an event or the slot
//!    boundary is the reference time. This only depends on the grid and the
//!    events, so every placement sees the same plan.
//! 2. [`walk_placement`] moves one placement's [`SignalCursor`] along the plan
//!    and cuts a window wherever the data admits one.
//! 3. [`merge_placements`] keeps the slots every placement filled and stacks
//!    their windows channel-wise (left, right, chest).

use crate::config::{AlignmentConfig, BeepTieBreak};
use crate::cursor::SignalCursor;
use crate::data_loading::SensorReader;
use crate::slot_grid::{build_slot_grid, SlotGrid};
use crate::{AlignError, EventLog, EventRecord, Placement, PlacementFiles, CHANNELS_PER_PLACEMENT};
use chrono::{DateTime, Duration, Utc};
use log::{debug, info, trace};
use ndarray::{s, Array2, Array3, Axis};

/// Reference time chosen for one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotAnchor {
    pub boundary: DateTime<Utc>,
    /// Event time for beep-anchored slots, otherwise the boundary
    pub reference: DateTime<Utc>,
    /// Index of the anchoring event in the event log
    pub beep: Option<usize>,
}

impl SlotAnchor {
    pub fn is_beep_anchored(&self) -> bool {
        self.beep.is_some()
    }
}

/// Assigns at most one event to every slot.
///
/// An event anchors the slot whose interval `(previous boundary, boundary]`
/// contains it; the first slot starts at the grid origin and includes it.
/// Once a slot is beep-anchored, every event up to its boundary is consumed,
/// so events denser than the grid are thinned to one per slot.
pub fn plan_anchors(grid: &SlotGrid, events: &[EventRecord], tie_break: BeepTieBreak) -> Vec<SlotAnchor> {
    let mut anchors = Vec::with_capacity(grid.len());
    let mut beep_idx = 0;

    for (slot, &boundary) in grid.boundaries().iter().enumerate() {
        let start = grid.slot_start(slot);
        let in_slot = |t: DateTime<Utc>| t <= boundary && (t > start || (slot == 0 && t == start));

        // Events a hand-built grid leaves behind can never anchor anything
        while events
            .get(beep_idx)
            .is_some_and(|e| e.beep_time_start < start || (slot > 0 && e.beep_time_start == start))
        {
            beep_idx += 1;
        }

        let mut chosen = events
            .get(beep_idx)
            .filter(|e| in_slot(e.beep_time_start))
            .map(|_| beep_idx);

        if let Some(first) = chosen {
            if tie_break == BeepTieBreak::Latest {
                let mut last = first;
                while events.get(last + 1).is_some_and(|e| in_slot(e.beep_time_start)) {
                    last += 1;
                }
                chosen = Some(last);
            }
            while events
                .get(beep_idx)
                .is_some_and(|e| e.beep_time_start <= boundary)
            {
                beep_idx += 1;
            }
        }

        anchors.push(SlotAnchor {
            boundary,
            reference: chosen.map_or(boundary, |i| events[i].beep_time_start),
            beep: chosen,
        });
    }

    anchors
}

#[derive(Debug, Clone, PartialEq)]
pub enum SlotResult {
    Empty,
    /// window_length x channels
    Filled(Array2<f32>),
}

impl SlotResult {
    pub fn is_filled(&self) -> bool {
        matches!(self, SlotResult::Filled(_))
    }
}

/// Outcome of walking one placement across the slot plan.
#[derive(Debug, Clone)]
pub struct PlacementWalk {
    pub placement: Placement,
    pub results: Vec<SlotResult>,
    /// Absolute sample index of every anchor sample found, in slot order
    pub anchor_samples: Vec<usize>,
    /// First slot left empty because the placement ran out of files
    pub exhausted_at: Option<usize>,
}

impl PlacementWalk {
    pub fn filled(&self) -> usize {
        self.results.iter().filter(|r| r.is_filled()).count()
    }
}

/// Moves `cursor` through `anchors`, one slot at a time.
///
/// A slot is filled when the anchor sample lies less than `tolerance` before
/// the reference time and at least `window_length` samples precede it in the
/// same file. Anything else leaves the slot empty for this placement only.
pub fn walk_placement<R: SensorReader + ?Sized>(
    cursor: &mut SignalCursor<'_, R>,
    anchors: &[SlotAnchor],
    window_length: usize,
    tolerance: Duration,
) -> PlacementWalk {
    let placement = cursor.placement();
    let mut results = vec![SlotResult::Empty; anchors.len()];
    let mut anchor_samples = Vec::new();
    let mut exhausted_at = None;

    for (slot, anchor) in anchors.iter().enumerate() {
        if let Err(e) = cursor.advance_to_or_past(anchor.reference, window_length) {
            debug!("{}; slots {}..{} stay empty", e, slot, anchors.len());
            exhausted_at = Some(slot);
            break;
        }

        let Some(hit) = cursor.nearest_sample_at_or_before(anchor.reference) else {
            trace!("{} slot {}: no sample before {}", placement, slot, anchor.reference);
            continue;
        };
        anchor_samples.push(hit.index);

        if hit.offset >= tolerance {
            trace!(
                "{} slot {}: nearest sample {} is {}s away",
                placement,
                slot,
                hit.timestamp,
                hit.offset.num_seconds()
            );
            continue;
        }

        match cursor.extract_window(hit.index, window_length) {
            Ok(window) => {
                trace!("{} slot {}: window ends at sample {}", placement, slot, hit.index);
                results[slot] = SlotResult::Filled(window.to_owned());
            }
            Err(e) => trace!("{} slot {}: {}", placement, slot, e),
        }
    }

    let walk = PlacementWalk {
        placement,
        results,
        anchor_samples,
        exhausted_at,
    };
    info!(
        "{} sensor: filled {} of {} slots",
        placement,
        walk.filled(),
        anchors.len()
    );
    walk
}

/// The synchronized trial dataset.
#[derive(Debug, Clone)]
pub struct AlignmentOutcome {
    /// kept slot x window sample x 18 channels (left, right, chest blocks)
    pub trials: Array3<f32>,
    /// Events whose slot was kept, in log order
    pub events: EventLog,
    /// Positions among kept slots that are beep-anchored
    pub beep_slots: Vec<usize>,
    /// Event time for beep-anchored slots, otherwise the slot boundary
    pub slot_times: Vec<DateTime<Utc>>,
    /// Grid index of every kept slot
    pub kept_slots: Vec<usize>,
    /// Slots each placement filled before the merge, in [`Placement::ALL`] order
    pub filled_per_placement: [usize; 3],
    pub total_slots: usize,
}

impl AlignmentOutcome {
    pub fn len(&self) -> usize {
        self.kept_slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kept_slots.is_empty()
    }

    pub fn window_length(&self) -> usize {
        self.trials.len_of(Axis(1))
    }

    pub fn is_beep_slot(&self, kept: usize) -> bool {
        self.beep_slots.binary_search(&kept).is_ok()
    }

    /// Trials of the beep-anchored slots only.
    pub fn beep_trials(&self) -> Array3<f32> {
        self.trials.select(Axis(0), &self.beep_slots)
    }
}

/// Keeps the slots filled by every placement. Walks must come in
/// [`Placement::ALL`] order.
pub fn merge_placements(
    walks: &[PlacementWalk],
    anchors: &[SlotAnchor],
    events: &EventLog,
    window_length: usize,
) -> AlignmentOutcome {
    let kept_slots: Vec<usize> = (0..anchors.len())
        .filter(|&slot| {
            walks.len() == Placement::ALL.len()
                && walks.iter().all(|w| w.results.get(slot).is_some_and(SlotResult::is_filled))
        })
        .collect();

    let channels = CHANNELS_PER_PLACEMENT * Placement::ALL.len();
    let mut trials = Array3::<f32>::zeros((kept_slots.len(), window_length, channels));
    for (k, &slot) in kept_slots.iter().enumerate() {
        for walk in walks {
            if let SlotResult::Filled(window) = &walk.results[slot] {
                let c0 = walk.placement.index() * CHANNELS_PER_PLACEMENT;
                trials
                    .slice_mut(s![k, .., c0..c0 + CHANNELS_PER_PLACEMENT])
                    .assign(window);
            }
        }
    }

    let mut beep_slots = Vec::new();
    let mut records = Vec::new();
    let mut slot_times = Vec::with_capacity(kept_slots.len());
    for (k, &slot) in kept_slots.iter().enumerate() {
        let anchor = &anchors[slot];
        if let Some(beep) = anchor.beep {
            beep_slots.push(k);
            records.push(events.records[beep].clone());
        }
        slot_times.push(anchor.reference);
    }

    let mut filled_per_placement = [0; 3];
    for walk in walks {
        filled_per_placement[walk.placement.index()] = walk.filled();
    }

    AlignmentOutcome {
        trials,
        events: EventLog {
            headers: events.headers.clone(),
            records,
        },
        beep_slots,
        slot_times,
        kept_slots,
        filled_per_placement,
        total_slots: anchors.len(),
    }
}

/// Builds the trial dataset for one subject.
///
/// Configuration and event range are checked before any file is read.
/// Only `InvalidRange` is returned as an error; unreadable files, gaps and
/// early sensor removal just shrink the kept set.
pub fn extract_trials<R: SensorReader + Sync + ?Sized>(
    files: &PlacementFiles,
    events: &EventLog,
    reader: &R,
    config: &AlignmentConfig,
) -> Result<AlignmentOutcome, AlignError> {
    config.validate()?;
    let (Some(first), Some(last)) = (events.first_time(), events.last_time()) else {
        return Err(AlignError::InvalidRange("event log is empty".to_string()));
    };

    let grid = build_slot_grid(
        first,
        last,
        config.day_start_hour,
        config.day_end_hour,
        config.slot_duration(),
    )?;
    events.ensure_sorted()?;

    let anchors = plan_anchors(&grid, &events.records, config.beep_tie_break);
    let window_length = config.window_length();
    let tolerance = config.admission_tolerance();
    info!(
        "Aligning {} events on {} slots ({} samples per window)",
        events.len(),
        anchors.len(),
        window_length
    );

    let walk_one = |placement: Placement| {
        let mut cursor =
            SignalCursor::new(placement, files.get(placement), reader, config.sample_rate());
        walk_placement(&mut cursor, &anchors, window_length, tolerance)
    };

    let walks: Vec<PlacementWalk> = if config.parallel {
        let walk_one = &walk_one;
        std::thread::scope(|scope| {
            let handles: Vec<_> = Placement::ALL
                .iter()
                .map(|&placement| scope.spawn(move || walk_one(placement)))
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap_or_else(|e| std::panic::resume_unwind(e)))
                .collect()
        })
    } else {
        Placement::ALL.iter().map(|&placement| walk_one(placement)).collect()
    };

    let outcome = merge_placements(&walks, &anchors, events, window_length);
    info!(
        "Kept {} of {} slots ({} beep-anchored)",
        outcome.len(),
        outcome.total_slots,
        outcome.beep_slots.len()
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::tests::FakeReader;
    use chrono::TimeZone;
    use std::path::PathBuf;
    use std::sync::atomic::Ordering;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, h, m, 0).unwrap()
    }

    fn morning_grid(first: DateTime<Utc>) -> SlotGrid {
        build_slot_grid(first, first, 6, 8, Duration::minutes(30)).unwrap()
    }

    fn events(times: &[DateTime<Utc>]) -> Vec<EventRecord> {
        times.iter().copied().map(EventRecord::new).collect()
    }

    #[test]
    fn test_first_slot_includes_first_event() {
        let grid = morning_grid(at(6, 5));
        let anchors = plan_anchors(&grid, &events(&[at(6, 5)]), BeepTieBreak::Earliest);
        assert_eq!(anchors.len(), 4);
        assert_eq!(anchors[0].beep, Some(0));
        assert_eq!(anchors[0].reference, at(6, 5));
        assert!(anchors[1..].iter().all(|a| a.beep.is_none() && a.reference == a.boundary));
    }

    #[test]
    fn test_event_on_boundary_does_not_stall() {
        let grid = morning_grid(at(6, 10));
        let anchors = plan_anchors(
            &grid,
            &events(&[at(6, 10), at(7, 0), at(7, 10)]),
            BeepTieBreak::Earliest,
        );
        assert_eq!(anchors[0].beep, Some(0));
        // 07:00 closes (06:30, 07:00]
        assert_eq!(anchors[1].beep, Some(1));
        assert_eq!(anchors[2].beep, Some(2));
        assert_eq!(anchors[3].beep, None);
    }

    #[test]
    fn test_dense_events_are_thinned() {
        let grid = morning_grid(at(6, 0));
        let log = events(&[at(6, 0), at(6, 40), at(6, 50), at(7, 45)]);

        let earliest = plan_anchors(&grid, &log, BeepTieBreak::Earliest);
        let beeps: Vec<_> = earliest.iter().map(|a| a.beep).collect();
        assert_eq!(beeps, vec![Some(0), Some(1), None, Some(3)]);
        assert_eq!(earliest[1].reference, at(6, 40));

        let latest = plan_anchors(&grid, &log, BeepTieBreak::Latest);
        let beeps: Vec<_> = latest.iter().map(|a| a.beep).collect();
        assert_eq!(beeps, vec![Some(0), Some(2), None, Some(3)]);
        assert_eq!(latest[1].reference, at(6, 50));
    }

    #[test]
    fn test_events_after_grid_never_anchor() {
        let grid = morning_grid(at(6, 5));
        let anchors = plan_anchors(&grid, &events(&[at(6, 5), at(9, 0)]), BeepTieBreak::Earliest);
        assert_eq!(anchors.iter().filter(|a| a.is_beep_anchored()).count(), 1);
    }

    fn filled(value: f32) -> SlotResult {
        SlotResult::Filled(Array2::from_elem((2, CHANNELS_PER_PLACEMENT), value))
    }

    fn walk(placement: Placement, results: Vec<SlotResult>) -> PlacementWalk {
        PlacementWalk {
            placement,
            results,
            anchor_samples: Vec::new(),
            exhausted_at: None,
        }
    }

    #[test]
    fn test_merge_requires_every_placement() {
        let grid = morning_grid(at(6, 5));
        let log = EventLog::from_times(&[at(6, 5)]);
        let anchors = plan_anchors(&grid, &log.records, BeepTieBreak::Earliest);

        let walks = vec![
            walk(Placement::Left, vec![filled(1.0), filled(1.0), filled(1.0), SlotResult::Empty]),
            walk(Placement::Right, vec![filled(2.0), filled(2.0), filled(2.0), filled(2.0)]),
            walk(Placement::Chest, vec![filled(3.0), SlotResult::Empty, filled(3.0), filled(3.0)]),
        ];
        let outcome = merge_placements(&walks, &anchors, &log, 2);

        assert_eq!(outcome.kept_slots, vec![0, 2]);
        assert_eq!(outcome.trials.dim(), (2, 2, 18));
        assert_eq!(outcome.trials[[1, 0, 0]], 1.0);
        assert_eq!(outcome.trials[[1, 1, 6]], 2.0);
        assert_eq!(outcome.trials[[1, 1, 17]], 3.0);
        assert_eq!(outcome.beep_slots, vec![0]);
        assert_eq!(outcome.events.len(), 1);
        assert_eq!(outcome.slot_times, vec![at(6, 5), at(7, 30)]);
        assert_eq!(outcome.filled_per_placement, [3, 4, 3]);
        assert_eq!(outcome.beep_trials().dim(), (1, 2, 18));

        // dropping the beep slot for one placement drops its event as well
        let mut walks = walks;
        walks[1].results[0] = SlotResult::Empty;
        let outcome = merge_placements(&walks, &anchors, &log, 2);
        assert_eq!(outcome.kept_slots, vec![2]);
        assert!(outcome.events.is_empty());
        assert!(outcome.beep_slots.is_empty());
    }

    #[test]
    fn test_walk_consumes_samples_forward() {
        let mut reader = FakeReader::new(1.0);
        let paths = vec![
            reader.add("a.edf", at(6, 0), 3600, 0.0),
            reader.add("b.edf", at(7, 10), 3000, 0.0),
        ];
        let grid = morning_grid(at(6, 20));
        let log = events(&[at(6, 20), at(6, 45)]);
        let anchors = plan_anchors(&grid, &log, BeepTieBreak::Earliest);

        let mut cursor = SignalCursor::new(Placement::Left, &paths, &reader, 1.0);
        let walk = walk_placement(&mut cursor, &anchors, 600, Duration::minutes(30));

        assert!(walk.anchor_samples.windows(2).all(|w| w[0] < w[1]));
        // references 06:20 and 06:45 come from a.edf, 07:30 and 08:00 from b.edf
        let filled: Vec<bool> = walk.results.iter().map(SlotResult::is_filled).collect();
        assert_eq!(filled, vec![true, true, true, true]);
        assert_eq!(walk.anchor_samples, vec![1200, 2700, 3600 + 1200, 3600 + 2999]);
        assert_eq!(walk.exhausted_at, None);
    }

    #[test]
    fn test_walk_stops_when_files_run_out() {
        let mut reader = FakeReader::new(1.0);
        let paths = vec![reader.add("a.edf", at(6, 0), 3600, 0.0)];
        let grid = morning_grid(at(6, 5));
        let anchors = plan_anchors(&grid, &events(&[at(6, 5)]), BeepTieBreak::Earliest);

        let mut cursor = SignalCursor::new(Placement::Chest, &paths, &reader, 1.0);
        let walk = walk_placement(&mut cursor, &anchors, 300, Duration::minutes(30));
        let filled: Vec<bool> = walk.results.iter().map(SlotResult::is_filled).collect();
        // 07:00 still takes the last sample at 06:59:59, then the file is used up
        assert_eq!(filled, vec![true, true, false, false]);
        assert_eq!(walk.exhausted_at, Some(2));
    }

    #[test]
    fn test_tolerance_rejects_distant_samples() {
        let mut reader = FakeReader::new(1.0);
        // data ends at 06:34:59
        let paths = vec![reader.add("a.edf", at(6, 0), 2100, 0.0)];
        let grid = morning_grid(at(6, 0));
        let anchors = plan_anchors(&grid, &events(&[at(6, 0)]), BeepTieBreak::Earliest);

        let run = |tolerance: Duration| -> Vec<bool> {
            let mut cursor = SignalCursor::new(Placement::Left, &paths, &reader, 1.0);
            let walk = walk_placement(&mut cursor, &anchors, 60, tolerance);
            walk.results.iter().map(SlotResult::is_filled).collect()
        };

        // the 06:00 anchor has no history; 07:00 is 25 minutes past the data
        assert_eq!(run(Duration::minutes(30)), vec![false, true, false, false]);
        assert_eq!(run(Duration::minutes(5)), vec![false, false, false, false]);
    }

    #[test]
    fn test_empty_event_log_is_invalid() {
        let reader = FakeReader::new(50.0);
        let result = extract_trials(
            &PlacementFiles::default(),
            &EventLog::default(),
            &reader,
            &AlignmentConfig::default(),
        );
        assert!(matches!(result, Err(AlignError::InvalidRange(_))));
        assert_eq!(reader.reads.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let mut reader = FakeReader::new(1.0);
        let mut files = PlacementFiles::default();
        for (i, placement) in Placement::ALL.iter().enumerate() {
            let name = format!("{}.edf", placement);
            files.push(*placement, reader.add(&name, at(6, 0), 7200, i as f32 * 10.0));
        }
        files.push(Placement::Chest, PathBuf::from("missing.edf"));
        let log = EventLog::from_times(&[at(6, 20), at(7, 40)]);
        let config = AlignmentConfig {
            event_window_minutes: 5,
            feature_window_seconds: 60,
            base_sample_rate_hz: 1.0,
            decimation_factor: 1,
            day_end_hour: 8,
            ..AlignmentConfig::default()
        };

        let sequential = extract_trials(&files, &log, &reader, &config).unwrap();
        let parallel = extract_trials(
            &files,
            &log,
            &reader,
            &AlignmentConfig {
                parallel: true,
                ..config
            },
        )
        .unwrap();

        assert_eq!(sequential.trials, parallel.trials);
        assert_eq!(sequential.kept_slots, parallel.kept_slots);
        assert_eq!(sequential.beep_slots, vec![0, 3]);
        assert_eq!(sequential.events.len(), 2);
    }
}
