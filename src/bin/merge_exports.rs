use std::path::PathBuf;

use storewatch::{
    init_logging, log_app_start, logging_config_from_env, run_ingest, AppConfig,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start("merge_exports", &logging_cfg);

    let cfg = AppConfig::from_env()?;
    // optional positional args: <export_dir> <output_csv>
    let mut args = std::env::args().skip(1);
    let mut ingest_cfg = cfg.ingest.clone();
    if let Some(dir) = args.next() {
        ingest_cfg.export_dir = PathBuf::from(dir);
    }
    let output = args.next().map(PathBuf::from).unwrap_or(cfg.data_path);

    let result = run_ingest(&ingest_cfg, &output)?;
    let report = &result.report;

    println!(
        "Merged exports | dir={} files={}/{} rows={} duplicates_removed={} missing_values={} malformed_columns={}",
        ingest_cfg.export_dir.display(),
        report.files_loaded,
        report.files_discovered,
        report.output_rows,
        report.duplicates_removed,
        report.missing_values,
        report.total_malformed_columns
    );
    if let (Some(first), Some(last)) = (&report.first_time, &report.last_time) {
        println!("Range | {first} -> {last}");
    }
    for skipped in &report.skipped_files {
        println!("Skipped | {} ({})", skipped.path.display(), skipped.reason);
    }
    println!(
        "Wrote {} | sha256={}",
        output.display(),
        report.fingerprint.as_deref().unwrap_or("-")
    );

    Ok(())
}
