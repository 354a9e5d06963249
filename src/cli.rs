/// Command-line front end over the job service.
///
/// Output is JSON on stdout (one document per invocation) so the CLI is
/// scriptable; diagnostics go to stderr via the logger.
use crate::config::Settings;
use crate::jobs::JobService;
use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "sbx", about = "Sandboxed execution of untrusted code", version)]
pub struct Cli {
    /// Settings file (YAML); SBX_* environment variables override it.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Register code as a new job without running it.
    Submit {
        /// Entry file name inside the workspace, e.g. main.py
        entry: String,
        /// Read the code from this file.
        #[arg(long, conflicts_with = "code")]
        file: Option<PathBuf>,
        /// Inline code.
        #[arg(long)]
        code: Option<String>,
        /// Explicit language override (python, node, bash).
        #[arg(long)]
        lang: Option<String>,
    },
    /// Run a previously submitted job to a terminal state.
    Run { job_id: String },
    /// Submit and run in one step.
    Exec {
        entry: String,
        #[arg(long, conflicts_with = "code")]
        file: Option<PathBuf>,
        #[arg(long)]
        code: Option<String>,
        #[arg(long)]
        lang: Option<String>,
    },
    /// Show a job's current state.
    Status { job_id: String },
    /// Print the captured stdout and stderr of a job's last run.
    Logs { job_id: String },
    /// Report what isolation this host can actually deliver.
    Probe,
}

pub fn run(cli: Cli) -> anyhow::Result<()> {
    let settings = Settings::load(cli.config.as_deref())?;

    if let Commands::Probe = cli.command {
        // The probe must work even when engine construction would fail
        // (e.g. cgroups requested but not delegated).
        let probe = crate::isolation::CapabilityProbe::collect(&settings);
        probe.report(&settings);
        println!("{}", serde_json::to_string_pretty(&probe)?);
        return Ok(());
    }

    let service = JobService::new(settings).context("failed to initialize the job service")?;
    service.probe().report(service.settings());

    match cli.command {
        Commands::Submit {
            entry,
            file,
            code,
            lang,
        } => {
            let code = read_code(file, code)?;
            let job = service.submit(&entry, &code, lang.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
        Commands::Run { job_id } => {
            let job = service.run(&job_id)?;
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
        Commands::Exec {
            entry,
            file,
            code,
            lang,
        } => {
            let code = read_code(file, code)?;
            let job = service.exec(&entry, &code, lang.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
        Commands::Status { job_id } => {
            let job = service.status(&job_id)?;
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
        Commands::Logs { job_id } => {
            let (stdout, stderr) = service.logs(&job_id)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "stdout": stdout,
                    "stderr": stderr,
                }))?
            );
        }
        Commands::Probe => unreachable!("handled above"),
    }
    Ok(())
}

fn read_code(file: Option<PathBuf>, code: Option<String>) -> anyhow::Result<Vec<u8>> {
    match (file, code) {
        (Some(path), None) => {
            std::fs::read(&path).with_context(|| format!("failed to read {}", path.display()))
        }
        (None, Some(inline)) => Ok(inline.into_bytes()),
        (None, None) => bail!("provide the code via --file or --code"),
        (Some(_), Some(_)) => unreachable!("clap rejects the combination"),
    }
}
