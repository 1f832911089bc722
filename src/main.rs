use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use scanflow::{Config, Pipeline, PipelineError};

#[derive(Clone, Copy, ValueEnum)]
enum Verbosity {
    Error,
    Warning,
    Info,
    Debug,
}

impl Verbosity {
    fn level(self) -> tracing::Level {
        match self {
            Verbosity::Error => tracing::Level::ERROR,
            Verbosity::Warning => tracing::Level::WARN,
            Verbosity::Info => tracing::Level::INFO,
            Verbosity::Debug => tracing::Level::DEBUG,
        }
    }
}

#[derive(Parser)]
#[command(name = "scanflow")]
#[command(about = "Run a declarative processing pipeline over a patient's image volumes")]
struct Cli {
    /// Path to the run configuration (INI, YAML or JSON)
    #[arg(value_name = "CONFIG")]
    config: PathBuf,

    /// Logging verbosity
    #[arg(short, long, value_enum, default_value = "info")]
    verbose: Verbosity,

    /// Save slice previews to directory (must be empty)
    #[arg(long, value_name = "DIR")]
    debug_out: Option<PathBuf>,

    /// Check the configuration, patient data and pipeline without running it
    #[arg(long)]
    dry_run: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    // RUST_LOG wins over --verbose when set
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::default().add_directive(args.verbose.level().into()));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let config = Config::from_file(&args.config)?;
    config.validate()?;

    let mut pipeline = Pipeline::from_config(config);
    if let Some(debug_dir) = args.debug_out {
        pipeline = pipeline.with_debug(debug_dir)?;
    }

    if args.dry_run {
        let description = pipeline.check()?;
        println!("\n=== Pipeline check ===");
        for step in description.iter() {
            println!("  {:>3} {:<20} {}", step.index, step.task.kind(), step.description);
        }
        println!("All {} step(s) can run.", description.len());
        return Ok(());
    }

    let result = match pipeline.run() {
        Ok(result) => result,
        Err(e) => {
            if let Some(failure) = e.downcast_ref::<PipelineError>() {
                eprintln!("\nPipeline failed ({}): {}", failure.kind(), failure);
            }
            return Err(e);
        }
    };

    println!("\n=== Pipeline results ===");
    println!("Run id: {}", result.report.run_id);
    for step in &result.report.steps {
        println!("  {:>3} {:<20} {} artifact(s)", step.index, step.task, step.artifacts.len());
    }
    println!(
        "Artifacts written to {}",
        pipeline.config().system.output_folder.display()
    );

    Ok(())
}
