use anyhow::{Context, Result};
use clap::Parser;
use ema_trial_align::config::Args;
use ema_trial_align::data_loading::{read_event_log, scan_subject_dir, EdfReader};
use ema_trial_align::features::extract_features;
use ema_trial_align::output::{
    write_events, write_features, write_slot_index, write_summary, write_trials_ipc, OutputPaths,
    RunSummary,
};
use ema_trial_align::{extract_trials, Placement};
use log::{info, warn};

fn main() -> Result<()> {
    // Initialize logger
    env_logger::init();

    let args = Args::parse();
    let config = args.alignment_config();
    let sensors = args.sensor_map()?;

    let subject = args
        .subject
        .clone()
        .or_else(|| {
            args.subject_dir
                .file_name()
                .and_then(|s| s.to_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| "subject".to_string());

    let events = read_event_log(&args.events, args.subject.as_deref())?;
    println!("Loaded {} events for {}", events.len(), subject);

    let files = scan_subject_dir(&args.subject_dir, &sensors)?;
    for placement in Placement::ALL {
        println!("{} sensor: {} files", placement, files.get(placement).len());
    }

    let reader = EdfReader::new(config.decimation_factor as usize);
    let outcome = extract_trials(&files, &events, &reader, &config)
        .with_context(|| format!("Alignment failed for {}", subject))?;

    if outcome.is_empty() {
        warn!(
            "No slot of {} is covered by all three sensors; writing an empty dataset",
            subject
        );
    }

    std::fs::create_dir_all(&args.output_dir).with_context(|| {
        format!("Failed to create output directory: {}", args.output_dir.display())
    })?;
    let paths = OutputPaths::for_subject(&args.output_dir, &subject);

    write_trials_ipc(&paths.trials, &outcome)?;
    write_slot_index(&paths.slots, &outcome)?;
    write_events(&paths.events, &outcome.events)?;
    let summary = RunSummary::new(&subject, &outcome, &config);
    write_summary(&paths.summary, &summary)?;

    if args.features {
        let table = extract_features(&outcome, &config);
        write_features(&paths.features, &table)?;
        info!("{} feature columns per row", table.names.len());
    }

    println!(
        "Kept {} of {} slots ({} beep-anchored, {} samples per trial)",
        summary.kept_slots, summary.total_slots, summary.beep_slots, summary.window_length
    );
    for placement in Placement::ALL {
        println!(
            "  {} sensor filled {} slots",
            placement,
            outcome.filled_per_placement[placement.index()]
        );
    }
    println!("Results written to {}", args.output_dir.display());

    Ok(())
}
