use chrono::{TimeZone, Utc};
use ema_trial_align::config::SensorMap;
use ema_trial_align::data_loading::{read_event_log, scan_subject_dir, EdfReader};
use ema_trial_align::output::{write_trials_ipc, OutputPaths};
use ema_trial_align::{extract_trials, AlignmentConfig, Placement};
use std::path::PathBuf;

fn field(value: &str, width: usize) -> Vec<u8> {
    let mut bytes = value.as_bytes().to_vec();
    bytes.resize(width, b' ');
    bytes
}

/// Six-signal EDF with one-second records, unit gain and a constant value.
fn constant_edf(samples_per_record: usize, records: usize, value: i16) -> Vec<u8> {
    let ns = 6;
    let mut out = Vec::new();
    out.extend(field("0", 8));
    out.extend(field("X X X X", 80));
    out.extend(field("Startdate X X X X", 80));
    out.extend(field("01.03.24", 8));
    out.extend(field("06.00.00", 8));
    out.extend(field(&(256 + ns * 256).to_string(), 8));
    out.extend(field("", 44));
    out.extend(field(&records.to_string(), 8));
    out.extend(field("1", 8));
    out.extend(field(&ns.to_string(), 4));

    let labels = ["AccX", "AccY", "AccZ", "GyrX", "GyrY", "GyrZ"];
    let per_signal = |width: usize, value: &str| -> Vec<u8> {
        (0..ns).flat_map(|_| field(value, width)).collect()
    };
    out.extend(labels.iter().flat_map(|l| field(l, 16)));
    out.extend(per_signal(80, ""));
    out.extend(per_signal(8, "u"));
    out.extend(per_signal(8, "-32768"));
    out.extend(per_signal(8, "32767"));
    out.extend(per_signal(8, "-32768"));
    out.extend(per_signal(8, "32767"));
    out.extend(per_signal(80, ""));
    out.extend(per_signal(8, &samples_per_record.to_string()));
    out.extend(per_signal(32, ""));

    for _ in 0..records * ns * samples_per_record {
        out.extend(value.to_le_bytes());
    }
    out
}

fn temp_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("ema-pipeline-{}-{}", name, std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

#[test]
fn test_edf_directory_to_trial_file() {
    let dir = temp_dir("subject");
    // 4 Hz recordings over two hours, one per placement
    for (sensor, value) in [("13797", 1), ("13805", 2), ("13804", 3)] {
        let name = format!("{}_20240301_060000.edf", sensor);
        std::fs::write(dir.join(name), constant_edf(4, 7200, value)).unwrap();
    }
    std::fs::write(dir.join("_13797_20240301_060000.edf"), b"skipped").unwrap();
    std::fs::write(dir.join("notes.txt"), b"not a recording").unwrap();

    let events_path = dir.join("events.csv");
    std::fs::write(
        &events_path,
        "ID,beep_time_start,mood\nS01,2024-03-01 06:05:00,3\nS02,2024-03-01 06:10:00,5\n",
    )
    .unwrap();

    let files = scan_subject_dir(&dir, &SensorMap::default()).unwrap();
    assert_eq!(files.total(), 3);
    assert_eq!(files.get(Placement::Chest).len(), 1);

    let events = read_event_log(&events_path, Some("S01")).unwrap();
    assert_eq!(events.len(), 1);

    let config = AlignmentConfig {
        event_window_minutes: 1,
        feature_window_seconds: 60,
        decimation_factor: 2,
        base_sample_rate_hz: 4.0,
        day_start_hour: 6,
        day_end_hour: 8,
        ..AlignmentConfig::default()
    };
    let reader = EdfReader::new(config.decimation_factor as usize);
    let outcome = extract_trials(&files, &events, &reader, &config).unwrap();

    assert_eq!(outcome.len(), 4);
    assert_eq!(outcome.window_length(), 120);
    // the anti-alias filter leaves constant recordings at their value
    assert!((outcome.trials[[0, 0, 0]] - 1.0).abs() < 1e-3);
    assert!((outcome.trials[[1, 60, 6]] - 2.0).abs() < 1e-3);
    assert!((outcome.trials[[3, 119, 17]] - 3.0).abs() < 1e-3);
    assert_eq!(outcome.events.records[0].fields, vec!["S01", "2024-03-01 06:05:00", "3"]);
    assert_eq!(
        outcome.slot_times[0],
        Utc.with_ymd_and_hms(2024, 3, 1, 6, 5, 0).unwrap()
    );

    let paths = OutputPaths::for_subject(&dir, "S01");
    write_trials_ipc(&paths.trials, &outcome).unwrap();
    assert!(paths.trials.exists());

    std::fs::remove_dir_all(dir).unwrap();
}
