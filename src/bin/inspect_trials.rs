use anyhow::Result;
use arrow::ipc::reader::FileReaderBuilder;
use std::fs::File;

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() != 2 {
        println!("Usage: {} <trials.arrow>", args[0]);
        std::process::exit(1);
    }

    let file = File::open(&args[1])?;
    let reader = FileReaderBuilder::new().build(file)?;

    println!("\nSchema:");
    println!("{:#?}", reader.schema());

    let mut batches = 0;
    let mut rows = 0;
    for batch in reader {
        let batch = batch?;
        batches += 1;
        rows += batch.num_rows();
    }

    println!("\n{} trials, {} rows", batches, rows);
    if batches > 0 {
        println!("{} samples per trial", rows / batches);
    }

    Ok(())
}
