//! Integration tests for the command-line entry point.

mod common;

use std::process::Command;

use common::*;

fn scanflow_cli() -> Command {
    Command::new(env!("CARGO_BIN_EXE_scanflow"))
}

#[test]
fn test_cli_matches_in_process_run() -> anyhow::Result<()> {
    let (library_dir, library_patient) = create_patient_dir(&[brain_volume(0, "T1-CE")])?;
    let library_config = write_config(library_dir.path(), &library_patient, REGISTRATION_ONLY)?;
    scanflow::run(&library_config)?;

    let (cli_dir, cli_patient) = create_patient_dir(&[brain_volume(0, "T1-CE")])?;
    let cli_config = write_config(cli_dir.path(), &cli_patient, REGISTRATION_ONLY)?;
    let output = scanflow_cli()
        .arg(&cli_config)
        .args(["--verbose", "debug"])
        .env_remove("RUST_LOG")
        .output()?;
    assert!(
        output.status.success(),
        "CLI failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Pipeline results"));
    assert!(stdout.contains("DEBUG"), "--verbose debug should enable debug logs");

    let library_files = snapshot(&library_dir.path().join("results"))?;
    assert!(!library_files.is_empty());
    assert_eq!(library_files, snapshot(&cli_dir.path().join("results"))?);
    assert!(cli_dir.path().join("results/pipeline_report.json").is_file());
    Ok(())
}

#[test]
fn test_rust_log_overrides_verbose() -> anyhow::Result<()> {
    let (dir, patient_dir) = create_patient_dir(&[brain_volume(0, "T1-CE")])?;
    let config = write_config(dir.path(), &patient_dir, REGISTRATION_ONLY)?;

    let output = scanflow_cli()
        .arg(&config)
        .args(["--verbose", "debug"])
        .env("RUST_LOG", "error")
        .output()?;
    assert!(output.status.success());
    // log lines carry their module target; the results summary does not
    assert!(!String::from_utf8_lossy(&output.stdout).contains("scanflow::"));
    Ok(())
}

#[test]
fn test_cli_dry_run_writes_nothing() -> anyhow::Result<()> {
    let (dir, patient_dir) = create_patient_dir(&[brain_volume(0, "T1-CE")])?;
    let config = write_config(dir.path(), &patient_dir, REGISTRATION_ONLY)?;

    let output = scanflow_cli().arg(&config).arg("--dry-run").output()?;
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("All 2 step(s) can run."));
    assert!(!dir.path().join("results").exists());
    Ok(())
}

#[test]
fn test_cli_reports_failures() -> anyhow::Result<()> {
    let (dir, patient_dir) = create_patient_dir(&[brain_volume(0, "T1-CE")])?;
    let config = write_config(dir.path(), &patient_dir, END_TO_END_PIPELINE)?;

    // no model files in the model folder
    let output = scanflow_cli().arg(&config).output()?;
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("ModelNotFound"));
    Ok(())
}
