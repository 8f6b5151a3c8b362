use crate::config::SensorMap;
use crate::{EventLog, EventRecord, PlacementFiles, CHANNELS_PER_PLACEMENT};
use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};
use log::{debug, trace};
use ndarray::Array2;
use sci_rs::signal::filter::design::{
    butter_dyn, DigitalFilter, FilterBandType, FilterOutputType, Sos, SosFormatFilter,
};
use sci_rs::signal::filter::sosfiltfilt_dyn;
use std::path::Path;
use walkdir::WalkDir;

pub const EVENT_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
pub const EVENT_TIME_COLUMN: &str = "beep_time_start";
const FILENAME_TIME_FORMAT: &str = "%Y%m%d_%H%M%S";
const FILENAME_TIME_LEN: usize = 15;
const ANTI_ALIAS_ORDER: usize = 8;

/// One decoded recording on its post-decimation time axis.
#[derive(Debug, Clone)]
pub struct SensorFile {
    labels: Vec<String>,
    start: DateTime<Utc>,
    sample_rate: f64,
    samples: Array2<f32>, // samples x channels
    timestamps: Vec<DateTime<Utc>>,
}

impl SensorFile {
    /// Builds the timestamp axis `start + i / sample_rate` for every row of `samples`.
    pub fn new(
        labels: Vec<String>,
        start: DateTime<Utc>,
        sample_rate: f64,
        samples: Array2<f32>,
    ) -> Result<Self> {
        if !(sample_rate > 0.0) {
            bail!("Sample rate must be positive, got {}", sample_rate);
        }
        if !labels.is_empty() && labels.len() != samples.ncols() {
            bail!(
                "{} channel labels for {} channels",
                labels.len(),
                samples.ncols()
            );
        }

        let period_ns = 1e9 / sample_rate;
        let timestamps = (0..samples.nrows())
            .map(|i| start + Duration::nanoseconds((i as f64 * period_ns).round() as i64))
            .collect();

        Ok(Self {
            labels,
            start,
            sample_rate,
            samples,
            timestamps,
        })
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    pub fn samples(&self) -> &Array2<f32> {
        &self.samples
    }

    pub fn timestamps(&self) -> &[DateTime<Utc>] {
        &self.timestamps
    }

    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamps.last().copied()
    }

    pub fn channels(&self) -> usize {
        self.samples.ncols()
    }

    pub fn len(&self) -> usize {
        self.samples.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Decodes one recording file into a [`SensorFile`].
pub trait SensorReader {
    fn read(&self, path: &Path) -> Result<SensorFile>;
}

/// Reader for European Data Format recordings.
#[derive(Debug, Clone)]
pub struct EdfReader {
    pub decimation_factor: usize,
}

impl EdfReader {
    pub fn new(decimation_factor: usize) -> Self {
        Self {
            decimation_factor: decimation_factor.max(1),
        }
    }
}

impl SensorReader for EdfReader {
    fn read(&self, path: &Path) -> Result<SensorFile> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("Failed to open file: {}", path.display()))?;
        let header = parse_edf_header(&bytes)?;
        let signals = &header.signals[..CHANNELS_PER_PLACEMENT];

        let raw = decode_edf_records(&bytes, &header)?;
        let samples = decimate(&raw, self.decimation_factor);

        // The recorder encodes the start time in the filename; the header is a fallback
        let start = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(parse_filename_start)
            .unwrap_or_else(|| header.start.and_utc());

        let sample_rate = header.sample_rate() / self.decimation_factor as f64;
        debug!(
            "Decoded {} ({} samples at {} Hz from {})",
            path.display(),
            samples.nrows(),
            sample_rate,
            start.format("%Y-%m-%d %H:%M:%S")
        );

        SensorFile::new(
            signals.iter().map(|s| s.label.clone()).collect(),
            start,
            sample_rate,
            samples,
        )
    }
}

#[derive(Debug, Clone)]
pub struct EdfSignal {
    pub label: String,
    pub physical_min: f64,
    pub physical_max: f64,
    pub digital_min: f64,
    pub digital_max: f64,
    pub samples_per_record: usize,
}

impl EdfSignal {
    fn gain(&self) -> f64 {
        (self.physical_max - self.physical_min) / (self.digital_max - self.digital_min)
    }
}

#[derive(Debug, Clone)]
pub struct EdfHeader {
    pub start: NaiveDateTime,
    pub header_bytes: usize,
    pub num_records: usize,
    pub record_duration: f64,
    pub signals: Vec<EdfSignal>,
}

impl EdfHeader {
    pub fn sample_rate(&self) -> f64 {
        self.signals[0].samples_per_record as f64 / self.record_duration
    }

    fn record_bytes(&self) -> usize {
        self.signals.iter().map(|s| s.samples_per_record * 2).sum()
    }
}

fn ascii_field(bytes: &[u8], offset: usize, width: usize) -> Result<&str> {
    let raw = bytes
        .get(offset..offset + width)
        .ok_or_else(|| anyhow!("EDF header truncated at byte {}", offset))?;
    std::str::from_utf8(raw)
        .map(str::trim)
        .map_err(|e| anyhow!("EDF header field at byte {} is not ASCII: {}", offset, e))
}

fn numeric_field<T: std::str::FromStr>(bytes: &[u8], offset: usize, width: usize) -> Result<T> {
    let text = ascii_field(bytes, offset, width)?;
    text.parse::<T>()
        .map_err(|_| anyhow!("EDF header field at byte {} is not numeric: {:?}", offset, text))
}

pub fn parse_edf_header(bytes: &[u8]) -> Result<EdfHeader> {
    let date = ascii_field(bytes, 168, 8)?;
    let time = ascii_field(bytes, 176, 8)?;
    let start = parse_edf_start(date, time)?;

    let header_bytes: usize = numeric_field(bytes, 184, 8)?;
    let declared_records: i64 = numeric_field(bytes, 236, 8)?;
    let record_duration: f64 = numeric_field(bytes, 244, 8)?;
    let ns: usize = numeric_field(bytes, 252, 4)?;

    if ns < CHANNELS_PER_PLACEMENT {
        bail!(
            "EDF holds {} signals, expected at least {}",
            ns,
            CHANNELS_PER_PLACEMENT
        );
    }
    if !(record_duration > 0.0) {
        bail!("EDF data record duration must be positive");
    }

    // Per-signal fields are stored field-major: all labels, then all transducers, ...
    let base = 256;
    let column = |field_offset: usize, width: usize, i: usize| base + field_offset * ns + i * width;
    let mut signals = Vec::with_capacity(ns);
    for i in 0..ns {
        let signal = EdfSignal {
            label: ascii_field(bytes, column(0, 16, i), 16)?.to_string(),
            physical_min: numeric_field(bytes, column(16 + 80 + 8, 8, i), 8)?,
            physical_max: numeric_field(bytes, column(16 + 80 + 16, 8, i), 8)?,
            digital_min: numeric_field(bytes, column(16 + 80 + 24, 8, i), 8)?,
            digital_max: numeric_field(bytes, column(16 + 80 + 32, 8, i), 8)?,
            samples_per_record: numeric_field(bytes, column(16 + 80 + 40 + 80, 8, i), 8)?,
        };
        if signal.digital_max <= signal.digital_min {
            bail!("EDF signal {} has an empty digital range", signal.label);
        }
        signals.push(signal);
    }

    let spr = signals[0].samples_per_record;
    if spr == 0
        || signals[..CHANNELS_PER_PLACEMENT]
            .iter()
            .any(|s| s.samples_per_record != spr)
    {
        bail!("EDF motion signals do not share one sample rate");
    }

    let mut header = EdfHeader {
        start,
        header_bytes,
        num_records: 0,
        record_duration,
        signals,
    };

    let available = bytes.len().saturating_sub(header_bytes) / header.record_bytes();
    header.num_records = if declared_records < 0 {
        available
    } else {
        (declared_records as usize).min(available)
    };
    trace!(
        "EDF header: {} signals, {} records of {}s",
        ns,
        header.num_records,
        record_duration
    );

    Ok(header)
}

fn parse_edf_start(date: &str, time: &str) -> Result<NaiveDateTime> {
    let parts = |s: &str| -> Result<Vec<u32>> {
        s.split('.')
            .map(|p| p.parse::<u32>().map_err(|_| anyhow!("Bad EDF date/time: {}", s)))
            .collect()
    };
    let (d, t) = (parts(date)?, parts(time)?);
    if d.len() != 3 || t.len() != 3 {
        bail!("Bad EDF start: {} {}", date, time);
    }
    // EDF two-digit years pivot at 1985
    let century = if d[2] >= 85 { 1900 } else { 2000 };
    NaiveDate::from_ymd_opt((century + d[2]) as i32, d[1], d[0])
        .and_then(|day| day.and_hms_opt(t[0], t[1], t[2]))
        .ok_or_else(|| anyhow!("Bad EDF start: {} {}", date, time))
}

/// Physical values of the motion signals, one vector per channel.
fn decode_edf_records(bytes: &[u8], header: &EdfHeader) -> Result<Vec<Vec<f32>>> {
    let spr = header.signals[0].samples_per_record;
    let total = spr * header.num_records;
    let mut channels = vec![Vec::with_capacity(total); CHANNELS_PER_PLACEMENT];

    let record_bytes = header.record_bytes();
    for record in 0..header.num_records {
        let mut offset = header.header_bytes + record * record_bytes;
        for (i, signal) in header.signals.iter().enumerate() {
            let width = signal.samples_per_record * 2;
            if i < CHANNELS_PER_PLACEMENT {
                let chunk = bytes
                    .get(offset..offset + width)
                    .ok_or_else(|| anyhow!("EDF data record {} truncated", record))?;
                let gain = signal.gain();
                channels[i].extend(chunk.chunks_exact(2).map(|pair| {
                    let digital = i16::from_le_bytes([pair[0], pair[1]]) as f64;
                    ((digital - signal.digital_min) * gain + signal.physical_min) as f32
                }));
            }
            offset += width;
        }
    }

    Ok(channels)
}

/// Zero-phase Butterworth lowpass at 80% of the decimated Nyquist rate.
fn anti_alias_sections(factor: usize) -> Option<Vec<Sos<f32>>> {
    let filter = butter_dyn(
        ANTI_ALIAS_ORDER,
        vec![0.8 / factor as f32],
        Some(FilterBandType::Lowpass),
        Some(false),
        Some(FilterOutputType::Sos),
        None,
    );
    match filter {
        DigitalFilter::Sos(SosFormatFilter { sos }) => Some(sos),
        _ => None,
    }
}

/// Anti-alias filtering followed by keeping every `factor`-th sample, starting
/// with the first. Channels too short for the filter's edge padding are only
/// subsampled.
pub fn decimate(channels: &[Vec<f32>], factor: usize) -> Array2<f32> {
    let factor = factor.max(1);
    let n = channels.first().map_or(0, Vec::len);
    let n_out = n.div_ceil(factor);
    let mut out = Array2::<f32>::zeros((n_out, channels.len()));
    let sections = if factor > 1 { anti_alias_sections(factor) } else { None };

    for (c, channel) in channels.iter().enumerate() {
        let filtered = match &sections {
            Some(sos) if channel.len() > 3 * (2 * sos.len() + 1) => {
                sosfiltfilt_dyn(channel.iter(), sos)
            }
            _ => channel.clone(),
        };
        for (k, &x) in filtered.iter().step_by(factor).take(n_out).enumerate() {
            out[[k, c]] = x;
        }
    }
    out
}

/// Start time encoded as the `YYYYMMDD_HHMMSS` tail of a file stem.
pub fn parse_filename_start(stem: &str) -> Option<DateTime<Utc>> {
    let tail = stem.get(stem.len().checked_sub(FILENAME_TIME_LEN)?..)?;
    NaiveDateTime::parse_from_str(tail, FILENAME_TIME_FORMAT)
        .ok()
        .map(|dt| dt.and_utc())
}

/// Collects the subject's .edf recordings per placement, sorted by filename.
pub fn scan_subject_dir(dir: &Path, sensors: &SensorMap) -> Result<PlacementFiles> {
    let mut files = PlacementFiles::default();

    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.with_context(|| format!("Failed to scan {}", dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|s| s.to_str()) else {
            continue;
        };
        let is_edf = path
            .extension()
            .and_then(|s| s.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("edf"));
        if name.starts_with('_') || !is_edf {
            continue;
        }

        let sensor_id = name.split('_').next().unwrap_or(name);
        match sensors.placement_of(sensor_id) {
            Some(placement) => files.push(placement, path.to_path_buf()),
            None => debug!("Ignoring {}: unknown sensor {}", name, sensor_id),
        }
    }

    files.sort();
    Ok(files)
}

/// Reads the self-report CSV, optionally keeping one subject's rows.
pub fn read_event_log(path: &Path, subject: Option<&str>) -> Result<EventLog> {
    let mut rdr = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open event log: {}", path.display()))?;
    let headers: Vec<String> = rdr.headers()?.iter().map(String::from).collect();

    let time_idx = headers
        .iter()
        .position(|h| h == EVENT_TIME_COLUMN)
        .ok_or_else(|| anyhow!("Event log has no {} column", EVENT_TIME_COLUMN))?;
    let id_idx = match subject {
        Some(_) => Some(
            headers
                .iter()
                .position(|h| h == "ID")
                .ok_or_else(|| anyhow!("Event log has no ID column to filter on"))?,
        ),
        None => None,
    };

    let mut records = Vec::new();
    for (row, result) in rdr.records().enumerate() {
        let record = result?;

        if let (Some(idx), Some(subject)) = (id_idx, subject) {
            if record.get(idx).map(str::trim) != Some(subject.trim()) {
                continue;
            }
        }

        let raw_time = record.get(time_idx).unwrap_or_default().trim();
        let beep_time_start = NaiveDateTime::parse_from_str(raw_time, EVENT_TIME_FORMAT)
            .with_context(|| format!("Bad {} {:?} in row {}", EVENT_TIME_COLUMN, raw_time, row + 1))?
            .and_utc();

        records.push(EventRecord {
            beep_time_start,
            fields: record.iter().map(String::from).collect(),
        });
    }

    Ok(EventLog { headers, records })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::Placement;
    use chrono::TimeZone;
    use std::path::PathBuf;

    fn field(value: &str, width: usize) -> Vec<u8> {
        let mut bytes = value.as_bytes().to_vec();
        bytes.resize(width, b' ');
        bytes
    }

    /// EDF with unit gain, so physical values equal the stored integers.
    pub(crate) fn build_edf(
        ns: usize,
        samples_per_record: usize,
        records: usize,
        value: impl Fn(usize, usize) -> i16,
    ) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend(field("0", 8));
        out.extend(field("X X X X", 80));
        out.extend(field("Startdate X X X X", 80));
        out.extend(field("01.03.24", 8));
        out.extend(field("10.15.30", 8));
        out.extend(field(&(256 + ns * 256).to_string(), 8));
        out.extend(field("", 44));
        out.extend(field(&records.to_string(), 8));
        out.extend(field("1", 8));
        out.extend(field(&ns.to_string(), 4));

        let per_signal = |width: usize, make: &dyn Fn(usize) -> String| -> Vec<u8> {
            (0..ns).flat_map(|i| field(&make(i), width)).collect()
        };
        let labels = ["AccX", "AccY", "AccZ", "GyrX", "GyrY", "GyrZ", "Temp"];
        out.extend(per_signal(16, &|i| labels[i % labels.len()].to_string()));
        out.extend(per_signal(80, &|_| String::new()));
        out.extend(per_signal(8, &|_| "u".to_string()));
        out.extend(per_signal(8, &|_| "-32768".to_string()));
        out.extend(per_signal(8, &|_| "32767".to_string()));
        out.extend(per_signal(8, &|_| "-32768".to_string()));
        out.extend(per_signal(8, &|_| "32767".to_string()));
        out.extend(per_signal(80, &|_| String::new()));
        out.extend(per_signal(8, &|_| samples_per_record.to_string()));
        out.extend(per_signal(32, &|_| String::new()));

        for record in 0..records {
            for signal in 0..ns {
                for s in 0..samples_per_record {
                    let v = value(signal, record * samples_per_record + s);
                    out.extend(v.to_le_bytes());
                }
            }
        }
        out
    }

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("ema-trial-align-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_edf_decode_and_decimate() {
        let dir = temp_dir("edf");
        let path = dir.join("13797_20240301_101530.edf");
        // 7 signals, 8 samples/s, 2 records; the extra signal must be ignored
        let bytes = build_edf(7, 8, 2, |signal, i| (signal * 100 + i) as i16);
        std::fs::write(&path, bytes).unwrap();

        let file = EdfReader::new(2).read(&path).unwrap();
        assert_eq!(file.channels(), 6);
        assert_eq!(file.len(), 8);
        assert_eq!(file.sample_rate(), 4.0);
        assert_eq!(file.labels()[3], "GyrX");
        assert_eq!(
            file.start(),
            Utc.with_ymd_and_hms(2024, 3, 1, 10, 15, 30).unwrap()
        );
        // too short to filter, so samples 0 and 14 of their signals
        assert_eq!(file.samples()[[0, 2]], 200.0);
        assert_eq!(file.samples()[[7, 0]], 14.0);
        assert_eq!(
            file.timestamps()[1] - file.timestamps()[0],
            Duration::milliseconds(250)
        );
    }

    #[test]
    fn test_edf_start_falls_back_to_header() {
        let dir = temp_dir("edf-header");
        let path = dir.join("recording.edf");
        std::fs::write(&path, build_edf(6, 4, 1, |_, i| i as i16)).unwrap();

        let file = EdfReader::new(1).read(&path).unwrap();
        assert_eq!(
            file.start(),
            Utc.with_ymd_and_hms(2024, 3, 1, 10, 15, 30).unwrap()
        );
        assert_eq!(file.len(), 4);
    }

    #[test]
    fn test_edf_rejects_too_few_signals() {
        let dir = temp_dir("edf-short");
        let path = dir.join("13797_20240301_101530.edf");
        std::fs::write(&path, build_edf(3, 4, 1, |_, _| 0)).unwrap();
        assert!(EdfReader::new(1).read(&path).is_err());
    }

    #[test]
    fn test_truncated_edf_keeps_complete_records() {
        let mut bytes = build_edf(6, 4, 3, |_, i| i as i16);
        bytes.truncate(bytes.len() - 5);
        let header = parse_edf_header(&bytes).unwrap();
        assert_eq!(header.num_records, 2);
    }

    #[test]
    fn test_decimate_partial_block() {
        let out = decimate(&[vec![1.0, 3.0, 5.0, 7.0, 9.0]], 2);
        assert_eq!(out.nrows(), 3);
        assert_eq!(out.column(0).to_vec(), vec![1.0, 5.0, 9.0]);
    }

    #[test]
    fn test_decimate_filters_above_new_nyquist() {
        use std::f32::consts::PI;
        // 0.45 cycles/sample aliases after halving the rate; 0.02 survives
        let fast: Vec<f32> = (0..800)
            .map(|i| 10.0 + (2.0 * PI * 0.45 * i as f32).sin())
            .collect();
        let slow: Vec<f32> = (0..800)
            .map(|i| 10.0 + (2.0 * PI * 0.02 * i as f32).sin())
            .collect();
        let out = decimate(&[fast, slow.clone()], 2);
        assert_eq!(out.nrows(), 400);
        for k in 50..350 {
            assert!((out[[k, 0]] - 10.0).abs() < 0.05, "fast {} at {}", out[[k, 0]], k);
            assert!((out[[k, 1]] - slow[2 * k]).abs() < 0.05, "slow {} at {}", out[[k, 1]], k);
        }
    }

    #[test]
    fn test_decimate_by_one_is_identity() {
        let channel = vec![0.5f32, -1.0, 2.0, 4.0];
        let out = decimate(&[channel.clone()], 1);
        assert_eq!(out.column(0).to_vec(), channel);
    }

    #[test]
    fn test_filename_start() {
        assert_eq!(
            parse_filename_start("13797_20200115_063000"),
            Some(Utc.with_ymd_and_hms(2020, 1, 15, 6, 30, 0).unwrap())
        );
        assert_eq!(parse_filename_start("short"), None);
        assert_eq!(parse_filename_start("13797_notadate_xxxxxx"), None);
    }

    #[test]
    fn test_scan_subject_dir() {
        let dir = temp_dir("scan");
        for name in [
            "13797_20240302_060000.edf",
            "13797_20240301_060000.edf",
            "13805_20240301_060000.edf",
            "13804_20240301_060000.edf",
            "_13804_20240301_070000.edf",
            "13804_20240301_060000.csv",
            "55555_20240301_060000.edf",
        ] {
            std::fs::write(dir.join(name), b"").unwrap();
        }

        let files = scan_subject_dir(&dir, &SensorMap::default()).unwrap();
        let left: Vec<_> = files
            .get(Placement::Left)
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            left,
            vec!["13797_20240301_060000.edf", "13797_20240302_060000.edf"]
        );
        assert_eq!(files.get(Placement::Right).len(), 1);
        assert_eq!(files.get(Placement::Chest).len(), 1);
        assert_eq!(files.total(), 4);
    }

    #[test]
    fn test_read_event_log_with_subject_filter() {
        let dir = temp_dir("events");
        let path = dir.join("EMA_data.csv");
        std::fs::write(
            &path,
            "ID,beep_time_start,mood_well\n\
             110004,2024-03-01 09:13:00,5\n\
             110005,2024-03-01 09:20:00,2\n\
             110004,2024-03-01 11:02:45,6\n",
        )
        .unwrap();

        let log = read_event_log(&path, Some("110004")).unwrap();
        assert_eq!(log.headers, vec!["ID", "beep_time_start", "mood_well"]);
        assert_eq!(log.len(), 2);
        assert_eq!(
            log.records[1].beep_time_start,
            Utc.with_ymd_and_hms(2024, 3, 1, 11, 2, 45).unwrap()
        );
        assert_eq!(log.records[1].fields[2], "6");

        let all = read_event_log(&path, None).unwrap();
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn test_read_event_log_bad_timestamp() {
        let dir = temp_dir("events-bad");
        let path = dir.join("EMA_data.csv");
        std::fs::write(&path, "ID,beep_time_start\n1,yesterday\n").unwrap();
        assert!(read_event_log(&path, None).is_err());
    }
}
