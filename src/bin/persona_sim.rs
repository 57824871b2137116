//! persona-sim command-line entry point.
//!
//! Runs one pipeline stage per subcommand:
//!
//! ```bash
//! persona-sim convert-personas --input data/personas.csv
//! persona-sim convert-instruments --input data/instruments.csv
//! persona-sim render-prompts
//! persona-sim simulate --config sim.yaml --models gpt-4,claude
//! persona-sim export
//! persona-sim format
//! ```
//!
//! # Environment Variables
//!
//! - `OPENAI_API_KEY`, `ANTHROPIC_API_KEY`: provider credentials
//! - `OLLAMA_HOST`: local model endpoint (default: http://localhost:11434)
//! - `RUST_LOG`: tracing filter (default: "info,persona_sim=debug")

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};

use persona_sim::config::{Credentials, SimulationConfig};
use persona_sim::convert::{convert_instruments, convert_personas, ConvertOutcome};
use persona_sim::instrument::InstrumentStore;
use persona_sim::output::{export, format_results};
use persona_sim::persona::PersonaStore;
use persona_sim::prompt::{render_persona_prompts, PromptRenderer};
use persona_sim::results::ResultMap;
use persona_sim::simulation::SimulationDriver;

#[derive(Parser, Debug)]
#[command(name = "persona-sim", version, about = "Simulate questionnaire responses from synthetic personas")]
struct Cli {
    /// Simulation config (YAML, or JSON by extension). Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// personas.json location.
    #[arg(long, global = true)]
    personas: Option<PathBuf>,

    /// instruments.json location.
    #[arg(long, global = true)]
    instruments: Option<PathBuf>,

    /// Result map JSON location.
    #[arg(long, global = true)]
    results: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Persona CSV -> personas.json.
    ConvertPersonas {
        #[arg(long)]
        input: PathBuf,
        /// Overwrite an existing output.
        #[arg(long)]
        force: bool,
    },
    /// Instrument CSV -> instruments.json.
    ConvertInstruments {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        force: bool,
    },
    /// Write one rendered system prompt per persona.
    RenderPrompts {
        #[arg(long)]
        out_dir: Option<PathBuf>,
    },
    /// Run the simulation and write the result map.
    Simulate {
        /// Comma-separated model keys; all configured models when omitted.
        #[arg(long, value_delimiter = ',')]
        models: Vec<String>,
        /// Stop scheduling new cells after this many seconds.
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// Result map -> condition CSVs and summary.
    Export {
        #[arg(long)]
        out_dir: Option<PathBuf>,
    },
    /// Validate and pretty-print the result map in place.
    Format,
}

fn load_config(cli: &Cli) -> anyhow::Result<SimulationConfig> {
    let mut config = match &cli.config {
        Some(path) => SimulationConfig::load(path)?,
        None => SimulationConfig::default(),
    };
    if let Some(path) = &cli.personas {
        config.paths.personas = path.clone();
    }
    if let Some(path) = &cli.instruments {
        config.paths.instruments = path.clone();
    }
    if let Some(path) = &cli.results {
        config.paths.results = path.clone();
    }
    Ok(config)
}

fn report_conversion(stage: &str, outcome: ConvertOutcome) {
    match outcome {
        ConvertOutcome::Written(count) => tracing::info!(stage, count, "conversion complete"),
        ConvertOutcome::Skipped => tracing::info!(stage, "conversion skipped"),
    }
}

async fn simulate(
    mut config: SimulationConfig,
    models: &[String],
    timeout_secs: Option<u64>,
) -> anyhow::Result<()> {
    config.select_models(models)?;
    let results_path = config.paths.results.clone();
    let timeout = timeout_secs.or(config.run_timeout_secs);

    let driver = SimulationDriver::prepare(config, &Credentials::from_env())?;
    let control = driver.control();
    let interrupt = control.cancel_on_ctrl_c();
    let deadline = timeout.map(|secs| control.cancel_after(Duration::from_secs(secs)));

    let outcome = driver.run().await;
    interrupt.abort();
    if let Some(deadline) = deadline {
        deadline.abort();
    }
    let report = outcome?;

    report
        .results
        .save(&results_path)
        .with_context(|| format!("writing results to {}", results_path.display()))?;
    tracing::info!(
        total = report.total_cells,
        completed = report.completed_cells,
        crashed = report.crashed_cells,
        cancelled = report.cancelled,
        path = %results_path.display(),
        "results written"
    );
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,persona_sim=debug".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command {
        Command::ConvertPersonas { input, force } => {
            let outcome = convert_personas(&input, &config.paths.personas, force)?;
            report_conversion("personas", outcome);
        }
        Command::ConvertInstruments { input, force } => {
            let outcome = convert_instruments(&input, &config.paths.instruments, force)?;
            report_conversion("instruments", outcome);
        }
        Command::RenderPrompts { out_dir } => {
            let personas = PersonaStore::load(&config.paths.personas)?;
            let renderer = PromptRenderer::from_path(config.paths.system_template.as_deref())?;
            let out_dir = out_dir.unwrap_or_else(|| config.paths.prompts_dir.clone());
            render_persona_prompts(&renderer, &personas, &out_dir)?;
        }
        Command::Simulate { models, timeout_secs } => {
            simulate(config, &models, timeout_secs).await?;
        }
        Command::Export { out_dir } => {
            let results = ResultMap::load(&config.paths.results)?;
            let instruments = InstrumentStore::load(&config.paths.instruments)?;
            let out_dir = out_dir.unwrap_or_else(|| config.paths.output_dir.clone());
            let report = export(&results, &instruments, &config.conditions, &out_dir)?;
            tracing::info!(files = report.files.len(), dir = %out_dir.display(), "export complete");
        }
        Command::Format => {
            format_results(&config.paths.results)?;
        }
    }
    Ok(())
}
