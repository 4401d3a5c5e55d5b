use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::model::{Preset, StreamingPolicy};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// How the output is published once the job finishes
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StreamingMode {
    /// Do not publish the output
    None,
    /// Unencrypted streaming
    Clear,
    /// AES clear-key encryption with a signed token
    Protected,
}

impl StreamingMode {
    pub fn policy(self) -> Option<StreamingPolicy> {
        match self {
            StreamingMode::None => None,
            StreamingMode::Clear => Some(StreamingPolicy::Clear),
            StreamingMode::Protected => Some(StreamingPolicy::Protected),
        }
    }
}

/// Preset chosen on the command line for `run`, if any
pub fn preset_override(preset: Option<String>, analyze: Option<String>, audio_only: bool) -> Option<Preset> {
    match (preset, analyze) {
        (_, Some(audio_language)) if audio_only => Some(Preset::AudioAnalyzer { audio_language }),
        (_, Some(audio_language)) => Some(Preset::VideoAnalyzer { audio_language }),
        (Some(preset_name), None) => Some(Preset::BuiltInEncoder { preset_name }),
        (None, None) => None,
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Encode one input end to end: transform, upload, job, download and stream
    Run {
        /// Local media file to upload
        #[arg(long, conflicts_with = "input_url", required_unless_present = "input_url")]
        input_file: Option<PathBuf>,

        /// HTTPS or SAS URL the service reads directly
        #[arg(long)]
        input_url: Option<String>,

        /// Prefix for generated job, asset and locator names
        #[arg(long, default_value = "")]
        name_prefix: String,

        /// Transform to use or create (defaults to the configured name)
        #[arg(long)]
        transform: Option<String>,

        /// Built-in encoder preset for a newly created transform
        #[arg(long, conflicts_with = "analyze")]
        preset: Option<String>,

        /// Create an analyzer transform for this audio language (e.g. en-US)
        #[arg(long, value_name = "LANGUAGE")]
        analyze: Option<String>,

        /// With --analyze, run the audio-only analyzer
        #[arg(long, requires = "analyze")]
        audio_only: bool,

        /// Existing folder the output asset is downloaded into
        #[arg(long)]
        output_folder: Option<PathBuf>,

        /// Publish the output for streaming (defaults to the configured policy)
        #[arg(long, value_enum)]
        streaming: Option<StreamingMode>,

        /// Skip downloading the output asset
        #[arg(long)]
        no_download: bool,

        /// Delete the job and assets when done
        #[arg(long)]
        cleanup: bool,
    },

    /// Poll an existing job until it finishes
    Wait {
        /// Job name
        #[arg(short, long)]
        job: String,
    },

    /// Cancel a running job
    Cancel {
        /// Job name
        #[arg(short, long)]
        job: String,
    },

    /// List jobs of the configured transform
    Jobs,

    /// Download every file of an asset
    Download {
        /// Asset name
        #[arg(short, long)]
        asset: String,

        /// Existing folder to download into
        #[arg(short, long)]
        output_folder: Option<PathBuf>,
    },

    /// Generate a playback token for a content key
    Token {
        /// Content key identifier
        #[arg(short, long)]
        key_id: String,
    },

    /// Delete a job, its assets and optionally a content key policy
    Cleanup {
        /// Job name
        #[arg(short, long)]
        job: String,

        /// Asset names (repeatable)
        #[arg(short, long)]
        asset: Vec<String>,

        /// Content key policy to delete
        #[arg(long)]
        key_policy: Option<String>,
    },

    /// Write a default configuration file
    InitConfig {
        /// Where to write the configuration
        #[arg(short, long, default_value = "mediajob.toml")]
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}
