//! CLI binary for paperlens.
//!
//! A thin shim over the library crate: it bootstraps the local runtime,
//! submits one document, polls the job to completion, and writes the
//! analysis.

use anyhow::{bail, Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use paperlens::{AnalysisConfig, AnalysisService, JobStatus, SetupState};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Analyze a document with the default local model
  paperlens report.pdf

  # Write the analysis to a file
  paperlens report.pdf -o report_analysis.txt

  # Use a specific model (pulled automatically if missing)
  paperlens --model mistral contract.pdf

  # Custom analysis instruction
  paperlens --prompt "List every deadline and obligation." lease.pdf

ENVIRONMENT VARIABLES:
  PAPERLENS_RUNTIME_URL   Override the runtime endpoint (default http://127.0.0.1:11434)
  RUST_LOG                Log filter (e.g. paperlens=debug)

SETUP:
  The runtime (Ollama) must be installed and running: `ollama serve`.
  paperlens pulls the selected model on first use and reports progress.
"#;

/// Analyze PDF documents with a locally hosted LLM — nothing leaves the host.
#[derive(Parser, Debug)]
#[command(
    name = "paperlens",
    version,
    about = "Analyze PDF documents with a locally hosted LLM runtime",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Local PDF file to analyze.
    input: PathBuf,

    /// Write the analysis to this file instead of stdout.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Model to use (allow-listed names only, e.g. llama3.2, mistral).
    #[arg(long)]
    model: Option<String>,

    /// Analysis instruction overriding the stored template.
    #[arg(long)]
    prompt: Option<String>,

    /// Context budget per inference call, in characters.
    #[arg(long, default_value_t = 12_000)]
    context_budget: usize,

    /// Data directory for staged artifacts and settings.
    #[arg(long, default_value = "paperlens-data")]
    data_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = AnalysisConfig::builder()
        .context_budget(cli.context_budget)
        .data_dir(&cli.data_dir)
        .build()
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    let service = AnalysisService::new(config).map_err(|e| anyhow::anyhow!("{e}"))?;

    if let Some(ref prompt) = cli.prompt {
        service
            .set_prompt(prompt, "cli")
            .map_err(|e| anyhow::anyhow!("{e}"))?;
    }
    if let Some(ref model) = cli.model {
        service
            .select_model(model, "cli")
            .map_err(|e| anyhow::anyhow!("{e}"))?;
    } else {
        service.start_setup().map_err(|e| anyhow::anyhow!("{e}"))?;
    }

    wait_for_setup(&service).await?;

    let bytes = std::fs::read(&cli.input)
        .with_context(|| format!("cannot read {}", cli.input.display()))?;
    let declared = cli
        .input
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "document.pdf".to_string());

    let job = service
        .submit(&bytes, &declared, "cli")
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    eprintln!("{} job {} accepted", green("✔"), bold(&job.id.to_string()));

    let job = wait_for_job(&service, job.id).await?;
    let (result, name) = service
        .fetch_result(job.id)
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    match cli.output {
        Some(path) => {
            std::fs::write(&path, &result)
                .with_context(|| format!("cannot write {}", path.display()))?;
            eprintln!("{} analysis written to {}", green("✔"), path.display());
        }
        None => {
            eprintln!("{} analysis ({name}):\n", green("✔"));
            println!("{}", String::from_utf8_lossy(&result));
        }
    }
    Ok(())
}

/// Poll the setup orchestrator until `ModelReady`, rendering progress.
async fn wait_for_setup(service: &AnalysisService) -> Result<()> {
    let bar = ProgressBar::new(100);
    bar.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold} [{bar:42.green/238}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    bar.set_prefix("Setup");
    bar.enable_steady_tick(Duration::from_millis(80));

    loop {
        match service.setup_status() {
            SetupState::ModelReady { model } => {
                bar.finish_and_clear();
                eprintln!("{} model {} ready", green("✔"), bold(&model));
                return Ok(());
            }
            SetupState::Error { message } => {
                bar.finish_and_clear();
                bail!("setup failed: {}", red(&message));
            }
            SetupState::PullingModel { model, progress } => {
                bar.set_position(progress as u64);
                bar.set_message(format!("pulling {model} ({progress}%)"));
            }
            state => {
                bar.set_message(format!("{state:?}"));
            }
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

/// Poll a job until it reaches a terminal status.
async fn wait_for_job(service: &AnalysisService, id: uuid::Uuid) -> Result<paperlens::AnalysisJob> {
    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    bar.set_prefix("Analyzing");
    bar.enable_steady_tick(Duration::from_millis(80));

    loop {
        let Some(job) = service.job(id) else {
            bar.finish_and_clear();
            bail!("job disappeared");
        };
        match job.status {
            JobStatus::Done => {
                bar.finish_and_clear();
                eprintln!(
                    "{} {} inference call(s) over {} chunk(s)",
                    green("✔"),
                    job.inference_calls,
                    job.chunk_count.unwrap_or(0)
                );
                return Ok(job);
            }
            JobStatus::Failed => {
                bar.finish_and_clear();
                let err = job
                    .error
                    .map(|e| format!("{} ({})", e.message, e.kind))
                    .unwrap_or_else(|| "unknown error".into());
                bail!("analysis failed: {}", red(&err));
            }
            status => bar.set_message(status.to_string()),
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}
