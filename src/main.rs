use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use sbtet_results::config::Config;
use sbtet_results::fetch::{HttpResultSource, ResultSource};
use sbtet_results::jobs::{JobParams, JobStatus};

#[derive(Parser)]
#[command(
    name = "sbtet-results",
    about = "Batch scraper for SBTET exam results",
    version,
    long_about = None
)]
struct Cli {
    /// Path to a TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API server
    Serve {
        /// Bind address (overrides server.bind)
        #[arg(long)]
        bind: Option<String>,

        /// Listen port, keeping the configured host
        #[arg(long, env = "PORT")]
        port: Option<u16>,
    },

    /// Scrape one PIN range and write the spreadsheet locally
    Scrape {
        /// Admission year, e.g. 22
        #[arg(long)]
        year: String,

        /// College code, e.g. 008
        #[arg(long)]
        college_code: String,

        /// Branch code, e.g. CM
        #[arg(long)]
        branch_code: String,

        /// First PIN number (inclusive)
        #[arg(long)]
        start_pin: u32,

        /// Last PIN number (exclusive)
        #[arg(long)]
        end_pin: u32,

        /// Semester to fetch results for
        #[arg(long)]
        semester: String,

        /// Output file path
        #[arg(long, default_value = "results.xlsx")]
        output: PathBuf,
    },

    /// Check the results site is reachable
    TestConnection {
        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = sbtet_results::load_config(cli.config.as_deref())?;
    sbtet_results::init_tracing(&config.logging);

    match cli.command {
        Commands::Serve { bind, port } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            if let Some(port) = port {
                config.override_port(port);
            }
            tracing::info!(bind = %config.server.bind, "Starting sbtet-results server");
            sbtet_results::serve(config).await?;
        }
        Commands::Scrape {
            year,
            college_code,
            branch_code,
            start_pin,
            end_pin,
            semester,
            output,
        } => {
            let params = JobParams {
                year,
                college_code,
                branch_code: branch_code.to_uppercase(),
                start_pin,
                end_pin,
                semester,
            };
            scrape(&config, params, &output).await?;
        }
        Commands::TestConnection { json } => {
            let source = HttpResultSource::new(&config.scraper)?;
            let probed = source.probe().await;
            if json {
                let value = match &probed {
                    Ok(info) => serde_json::json!({
                        "status": "success",
                        "form_url": info.form_url,
                        "form_fields": info.form_fields,
                    }),
                    Err(failure) => serde_json::json!({
                        "status": "error",
                        "reason": failure.code(),
                        "message": failure.to_string(),
                    }),
                };
                println!("{}", serde_json::to_string_pretty(&value)?);
            } else {
                match &probed {
                    Ok(info) => {
                        println!("Connected to {}", config.scraper.base_url);
                        println!("Form action:   {}", info.form_url);
                        println!("Hidden fields: {}", info.form_fields);
                    }
                    Err(failure) => println!("Connection failed: {failure}"),
                }
            }
            if probed.is_err() {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

/// Run one job in-process and copy its spreadsheet to `output`.
async fn scrape(config: &Config, params: JobParams, output: &std::path::Path) -> Result<()> {
    let runner = sbtet_results::build_runner(config)?;
    let entry = runner.submit(params)?;
    let mut rx = entry.subscribe();

    let state = loop {
        let state = rx.borrow_and_update().clone();
        if !state.status.is_active() {
            break state;
        }
        tracing::info!(
            processed = state.processed_count,
            total = entry.total_count,
            eta_secs = ?state.estimated_time_remaining,
            "{}",
            state.message
        );
        if rx.changed().await.is_err() {
            break entry.state();
        }
    };

    match (state.status, state.artifact_path) {
        (JobStatus::Completed, Some(artifact)) => {
            std::fs::copy(&artifact, output).with_context(|| {
                format!("failed to copy {} to {}", artifact.display(), output.display())
            })?;
            println!("{}", state.message);
            println!("Saved {}", output.display());
            Ok(())
        }
        _ => bail!("{}", state.message),
    }
}
