//! mediajob - Cloud media job orchestration
//!
//! Entry point: parses arguments, loads configuration and dispatches to the
//! workflow or to the individual job, asset and token operations.

use anyhow::Result;
use clap::Parser;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn, Level};
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mediajob::cli::{preset_override, Args, Commands};
use mediajob::config::Config;
use mediajob::error::MediaJobError;
use mediajob::model::StreamingProtocol;
use mediajob::token::TokenIssuer;
use mediajob::workflow::{InputSource, RunNames, Workflow, WorkflowOptions, WorkflowReport};

const DEFAULT_CONFIG_FILE: &str = "mediajob.toml";

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Setup logging to both console and file
    setup_logging(args.verbose)?;

    if let Err(e) = run(args).await {
        match e.downcast_ref::<MediaJobError>() {
            Some(MediaJobError::RemoteService { code, message }) => {
                error!("API call failed with error code '{}' and message '{}'", code, message);
                eprintln!("ERROR: API call failed with error code '{}' and message '{}'.", code, message);
            }
            _ => {
                error!("{:#}", e);
                eprintln!("ERROR: {:#}", e);
            }
        }
        std::process::exit(1);
    }

    Ok(())
}

async fn run(args: Args) -> Result<()> {
    // A .env file next to the working directory is optional
    if dotenvy::dotenv().is_ok() {
        info!("Loaded environment from .env");
    }

    let mut config = load_config(args.config.as_deref())?;
    config.apply_env();

    match args.command {
        Commands::InitConfig { path, force } => {
            if path.exists() && !force {
                return Err(MediaJobError::Config(format!(
                    "{} already exists, pass --force to overwrite it",
                    path.display()
                )).into());
            }
            Config::default().save_to_file(&path)?;
            println!("Wrote default configuration to {}", path.display());
        }
        Commands::Token { key_id } => {
            let issuer = TokenIssuer::from_config(&config.token)?;
            println!("{}", issuer.generate(&key_id)?);
        }
        Commands::Run {
            input_file,
            input_url,
            name_prefix,
            transform,
            preset,
            analyze,
            audio_only,
            output_folder,
            streaming,
            no_download,
            cleanup,
        } => {
            let input = match (input_file, input_url) {
                (Some(path), _) => InputSource::File(path),
                (None, Some(url)) => InputSource::Url(url),
                (None, None) => {
                    return Err(MediaJobError::Config("Either --input-file or --input-url is required".to_string()).into())
                }
            };

            let options = WorkflowOptions {
                input,
                streaming: match streaming {
                    Some(mode) => mode.policy(),
                    None => Some(config.workflow.streaming_policy),
                },
                download: !no_download,
                output_folder: output_folder.unwrap_or_else(|| config.workflow.output_folder.clone()),
                cleanup,
            };

            if let Some(transform) = transform {
                config.workflow.transform_name = transform;
            }
            if let Some(preset) = preset_override(preset, analyze, audio_only) {
                config.workflow.preset = preset;
            }

            let workflow = Workflow::new(config)?;
            let names = RunNames::new(&name_prefix);
            info!("Starting job {}", names.job);

            tokio::select! {
                result = workflow.run(&options, &names) => {
                    print_report(&result?);
                }
                _ = tokio::signal::ctrl_c() => {
                    warn!("Interrupted, canceling job {}", names.job);
                    if let Err(e) = workflow.orchestrator().cancel_job(workflow.transform_name(), &names.job).await {
                        warn!("Could not cancel job {}: {}", names.job, e);
                    }
                    println!("Interrupted. Remove leftovers with: {}", workflow.cleanup_hint(&options, &names));
                }
            }
        }
        Commands::Wait { job } => {
            let poll_interval = config.workflow.poll_interval();
            let workflow = Workflow::new(config)?;
            let done = workflow
                .orchestrator()
                .wait_for_completion(workflow.transform_name(), &job, poll_interval)
                .await?;
            println!("Job {} is '{}'", done.name, done.state);
        }
        Commands::Cancel { job } => {
            let workflow = Workflow::new(config)?;
            workflow.orchestrator().cancel_job(workflow.transform_name(), &job).await?;
            println!("Cancel requested for job {}", job);
        }
        Commands::Jobs => {
            let workflow = Workflow::new(config)?;
            let jobs = workflow.orchestrator().list_jobs(workflow.transform_name()).await?;

            if jobs.is_empty() {
                println!("No jobs found for transform {}.", workflow.transform_name());
            } else {
                println!("{:<50} {:<12} {:<40}", "Job", "State", "Outputs");
                println!("{}", "-".repeat(102));
                for job in jobs {
                    let outputs = job.outputs
                        .iter()
                        .map(|o| o.asset_name.as_str())
                        .collect::<Vec<_>>()
                        .join(", ");
                    println!("{:<50} {:<12} {:<40}", job.name, job.state.to_string(), outputs);
                }
            }
        }
        Commands::Download { asset, output_folder } => {
            let folder = output_folder.unwrap_or_else(|| config.workflow.output_folder.clone());
            let workflow = Workflow::new(config)?;
            let dir = workflow.orchestrator().download_output_asset(&asset, &folder).await?;
            println!("Downloaded asset {} to {}", asset, dir.display());
        }
        Commands::Cleanup { job, asset, key_policy } => {
            let workflow = Workflow::new(config)?;
            workflow
                .orchestrator()
                .cleanup(workflow.transform_name(), &job, &asset, key_policy.as_deref())
                .await?;
            println!("Cleanup completed");
        }
    }

    info!("mediajob completed successfully");
    Ok(())
}

/// Load the configuration from the given file, `./mediajob.toml`, or defaults
fn load_config(path: Option<&Path>) -> Result<Config> {
    let config = match path {
        Some(config_path) => Config::from_file(config_path)?,
        None => {
            if Path::new(DEFAULT_CONFIG_FILE).exists() {
                info!("Found {} in current directory, loading...", DEFAULT_CONFIG_FILE);
                Config::from_file(DEFAULT_CONFIG_FILE)?
            } else {
                Config::default()
            }
        }
    };
    Ok(config)
}

fn print_report(report: &WorkflowReport) {
    println!("Job {} ended in state '{}'", report.job.name, report.job.state);
    println!("Output asset: {}", report.output_asset);

    if let Some(dir) = &report.download_dir {
        println!("Downloaded results to {}", dir.display());
    }

    if let Some(grant) = &report.streaming {
        println!("\nStreaming URLs for locator {}:", grant.name);
        for path in &grant.paths {
            println!("  {:<16} {}", path.protocol.to_string(), path.url);
        }

        if let (Some(token), Some(dash)) = (&report.token, grant.path_for(StreamingProtocol::Dash)) {
            println!("\nPlay back with the AES token in the Azure Media Player:");
            println!("https://ampdemo.azureedge.net/?url={}&aes=true&aestoken=Bearer%3D{}", dash, token);
        }
    }
}

/// Setup logging to both console and file
fn setup_logging(verbose: bool) -> Result<()> {
    let log_dir: PathBuf = std::env::current_dir()?.join(".mediajob").join("log");
    std::fs::create_dir_all(&log_dir)?;

    // Set up file appender with daily rotation
    let file_appender = rolling::daily(&log_dir, "mediajob.log");
    let (non_blocking_file, guard) = non_blocking(file_appender);
    // Keep the guard alive for the duration of the program
    std::mem::forget(guard);

    let log_level = if verbose { Level::DEBUG } else { Level::INFO };

    let console_layer = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    let file_layer = fmt::layer()
        .with_writer(non_blocking_file)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false); // No ANSI colors in file

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    info!("Logging initialized - console: {}, file: {}",
          log_level, log_dir.join("mediajob.log").display());

    Ok(())
}
