use crate::alignment::AlignmentOutcome;
use crate::config::AlignmentConfig;
use crate::data_loading::{EVENT_TIME_COLUMN, EVENT_TIME_FORMAT};
use crate::features::FeatureTable;
use crate::{EventLog, Placement, CHANNELS_PER_PLACEMENT, CHANNEL_NAMES};
use anyhow::{Context, Result};
use arrow::array::{ArrayRef, Float32Array, UInt32Array};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::ipc::writer::{FileWriter, IpcWriteOptions};
use arrow::ipc::CompressionType;
use arrow::record_batch::RecordBatch;
use log::info;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Files written for one subject, all prefixed with the subject name.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputPaths {
    pub trials: PathBuf,
    pub slots: PathBuf,
    pub events: PathBuf,
    pub summary: PathBuf,
    pub features: PathBuf,
}

impl OutputPaths {
    pub fn for_subject(dir: &Path, subject: &str) -> Self {
        let file = |name: &str| dir.join(format!("{}_{}", subject, name));
        Self {
            trials: file("trials.arrow"),
            slots: file("slots.csv"),
            events: file("events.csv"),
            summary: file("summary.json"),
            features: file("features.csv"),
        }
    }
}

/// Channel column names in tensor order, e.g. `L_AccX` .. `C_GyrZ`.
pub fn channel_columns() -> Vec<String> {
    Placement::ALL
        .iter()
        .flat_map(|p| CHANNEL_NAMES.iter().map(move |c| format!("{}_{}", p.suffix(), c)))
        .collect()
}

pub fn trial_schema() -> Schema {
    let mut fields = vec![
        Field::new("slot", DataType::UInt32, false),
        Field::new("sample", DataType::UInt32, false),
    ];
    fields.extend(
        channel_columns()
            .into_iter()
            .map(|name| Field::new(name, DataType::Float32, false)),
    );
    Schema::new(fields)
}

/// Writes the trial tensor as a zstd-compressed Arrow IPC file with one record
/// batch per kept slot.
pub fn write_trials_ipc(path: &Path, outcome: &AlignmentOutcome) -> Result<()> {
    let schema = Arc::new(trial_schema());
    let options = IpcWriteOptions::default().try_with_compression(Some(CompressionType::ZSTD))?;
    let file = File::create(path)
        .with_context(|| format!("Failed to create trial file: {}", path.display()))?;
    let mut writer = FileWriter::try_new_with_options(file, &schema, options)?;

    let window_length = outcome.window_length();
    let channels = CHANNELS_PER_PLACEMENT * Placement::ALL.len();
    for (k, trial) in outcome.trials.outer_iter().enumerate() {
        let mut columns: Vec<ArrayRef> = Vec::with_capacity(2 + channels);
        columns.push(Arc::new(UInt32Array::from(vec![k as u32; window_length])));
        columns.push(Arc::new(UInt32Array::from_iter_values(0..window_length as u32)));
        for channel in trial.columns() {
            columns.push(Arc::new(Float32Array::from_iter_values(channel.iter().copied())));
        }
        let batch = RecordBatch::try_new(schema.clone(), columns)?;
        writer.write(&batch)?;
    }

    writer.finish()?;
    info!("Wrote {} trials to {}", outcome.len(), path.display());
    Ok(())
}

/// One line per kept slot: position, grid index, reference time and anchor kind.
pub fn write_slot_index(path: &Path, outcome: &AlignmentOutcome) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create slot index: {}", path.display()))?;
    writer.write_record(["slot", "grid_slot", "timestamp", "beep_anchored"])?;

    for (k, (&grid_slot, time)) in outcome.kept_slots.iter().zip(&outcome.slot_times).enumerate() {
        writer.write_record(&[
            k.to_string(),
            grid_slot.to_string(),
            time.format(EVENT_TIME_FORMAT).to_string(),
            outcome.is_beep_slot(k).to_string(),
        ])?;
    }

    writer.flush()?;
    Ok(())
}

/// Writes the events of the beep-anchored slots with the header row they were
/// read with.
pub fn write_events(path: &Path, events: &EventLog) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create event file: {}", path.display()))?;

    if events.headers.is_empty() {
        writer.write_record([EVENT_TIME_COLUMN])?;
        for record in &events.records {
            writer.write_record([record.beep_time_start.format(EVENT_TIME_FORMAT).to_string()])?;
        }
    } else {
        writer.write_record(&events.headers)?;
        for record in &events.records {
            writer.write_record(&record.fields)?;
        }
    }

    writer.flush()?;
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub subject: String,
    pub total_slots: usize,
    pub kept_slots: usize,
    pub beep_slots: usize,
    pub window_length: usize,
    pub sample_rate_hz: f64,
    pub filled_per_placement: BTreeMap<Placement, usize>,
    pub config: AlignmentConfig,
}

impl RunSummary {
    pub fn new(subject: &str, outcome: &AlignmentOutcome, config: &AlignmentConfig) -> Self {
        Self {
            subject: subject.to_string(),
            total_slots: outcome.total_slots,
            kept_slots: outcome.len(),
            beep_slots: outcome.beep_slots.len(),
            window_length: config.window_length(),
            sample_rate_hz: config.sample_rate(),
            filled_per_placement: Placement::ALL
                .iter()
                .map(|&p| (p, outcome.filled_per_placement[p.index()]))
                .collect(),
            config: config.clone(),
        }
    }
}

pub fn write_summary(path: &Path, summary: &RunSummary) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("Failed to create summary: {}", path.display()))?;
    serde_json::to_writer_pretty(file, summary)?;
    Ok(())
}

pub fn write_features(path: &Path, table: &FeatureTable) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create feature file: {}", path.display()))?;

    let mut header = vec!["slot".to_string(), "window".to_string(), "timestamp".to_string()];
    header.extend(table.names.iter().cloned());
    writer.write_record(&header)?;

    for row in &table.rows {
        let mut record = vec![
            row.slot.to_string(),
            row.window.to_string(),
            row.timestamp.format(EVENT_TIME_FORMAT).to_string(),
        ];
        record.extend(row.values.iter().map(|v| v.to_string()));
        writer.write_record(&record)?;
    }

    writer.flush()?;
    info!("Wrote {} feature rows to {}", table.rows.len(), path.display());
    Ok(())
}
