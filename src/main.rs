//! transcribed — orchestrator entry point.
//!
//! All stdout is JSON only. Tracing logs go to stderr, following the
//! teacher's `agent-exec` convention.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use transcribe_orchestrator::config::Config;
use transcribe_orchestrator::service::{EngineBackend, Service};
use transcribe_orchestrator::tool_surface::{
    self, BatchTranscribeRequest, CancelTranscriptionRequest, GetProgressRequest, GetResultRequest,
    ListHistoryRequest, TranscribeAudioRequest,
};

#[derive(Debug, Parser)]
#[command(name = "transcribed")]
#[command(about = "Long-running speech transcription orchestrator", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v, -vv); logs go to stderr.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Path to a TOML config file (defaults to `TRANSCRIBE_CONFIG` or built-in defaults).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Path to the transcription engine binary. Omit to run against the
    /// in-process mock engine for local demonstration.
    #[arg(long, global = true)]
    engine_binary: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Submit a single audio file for transcription.
    Transcribe {
        file_path: String,
        #[arg(long)]
        language: Option<String>,
        #[arg(long, default_value_t = true)]
        diarize: bool,
    },

    /// Submit multiple audio files as a batch.
    Batch {
        #[arg(required = true)]
        file_paths: Vec<String>,
        #[arg(long, default_value = "3")]
        max_concurrent: u32,
    },

    /// Report progress for one job, or every active job.
    Progress {
        job_id: Option<String>,
        #[arg(long)]
        all: bool,
    },

    /// Fetch the completed artifact for a job.
    Result { job_id: String },

    /// List recent jobs.
    History {
        #[arg(long, default_value = "10")]
        limit: usize,
        #[arg(long)]
        search: Option<String>,
    },

    /// Cancel a queued or in-flight job.
    Cancel { job_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();

    let config = Config::load(cli.config.as_deref()).context("loading configuration")?;
    let backend = match cli.engine_binary {
        Some(binary_path) => EngineBackend::Subprocess { binary_path },
        None => EngineBackend::Mock,
    };
    let service = Service::start(config, backend)
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    service.spawn_retention_sweeper();

    let output = dispatch(&service, cli.command).await;
    println!("{}", serde_json::to_string(&output)?);
    Ok(())
}

async fn dispatch(service: &Service, command: Command) -> serde_json::Value {
    match command {
        Command::Transcribe {
            file_path,
            language,
            diarize,
        } => {
            tool_surface::transcribe_audio(
                service,
                TranscribeAudioRequest {
                    file_path,
                    model_size: None,
                    language,
                    enable_diarization: diarize,
                    device: None,
                    compute_type: None,
                    output_format: None,
                },
            )
            .await
        }

        Command::Batch {
            file_paths,
            max_concurrent,
        } => {
            tool_surface::batch_transcribe(
                service,
                BatchTranscribeRequest {
                    file_paths,
                    model_size: None,
                    language: None,
                    enable_diarization: true,
                    max_concurrent,
                    compute_type: None,
                    output_format: None,
                    device: None,
                },
            )
            .await
        }

        Command::Progress { job_id, all } => {
            tool_surface::get_transcription_progress(
                service,
                GetProgressRequest { job_id, all_jobs: all },
            )
            .await
        }

        Command::Result { job_id } => {
            tool_surface::get_transcription_result(service, GetResultRequest { job_id }).await
        }

        Command::History { limit, search } => {
            tool_surface::list_transcription_history(
                service,
                ListHistoryRequest {
                    limit,
                    status_filter: None,
                    search_query: search,
                },
            )
            .await
        }

        Command::Cancel { job_id } => {
            tool_surface::cancel_transcription(service, CancelTranscriptionRequest { job_id }).await
        }
    }
}
