use anyhow::{Context, Result};
use clap::Parser;
use method_tracer::cli::{Cli, OutputFormat};
use method_tracer::config::TraceConfiguration;
use method_tracer::orchestrator::Orchestrator;
use tracing_subscriber::EnvFilter;

/// Initialize the tracing subscriber; `RUST_LOG` wins over the defaults
fn init_tracing(debug: bool) {
    let level = if debug {
        tracing::Level::TRACE
    } else {
        tracing::Level::INFO
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::default().add_directive(level.into()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(cli: &Cli) -> Result<TraceConfiguration> {
    let mut config = match &cli.config {
        Some(path) => TraceConfiguration::from_file(path)?,
        None => TraceConfiguration::default(),
    };
    cli.apply(&mut config);
    Ok(config)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let config = load_config(&cli)?;
    let state_path = config.state_path();
    let orchestrator = Orchestrator::from_config(config)?;
    let summary = orchestrator.run(&cli.inputs)?;

    // A lost snapshot only costs the next run its incremental shortcut
    if let Some(state) = &summary.state {
        if let Err(error) = state.save(&state_path) {
            tracing::warn!(error = %format!("{error:#}"), "cannot save build state");
        }
    }

    match cli.format {
        OutputFormat::Text => summary.print_text(),
        OutputFormat::Json => {
            let json = summary.to_json().context("Failed to serialize summary")?;
            println!("{json}");
        }
    }
    Ok(())
}
