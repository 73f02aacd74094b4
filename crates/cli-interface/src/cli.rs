//! Command tree

use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};

use common::error::Result;
use common::types::ModelIdentity;
use deploy_config::DeployConfig;
use logging::{LogFormat, LoggingOptions};

#[derive(Parser, Debug)]
#[command(name = "nim-deploy")]
#[command(about = "Deploy quantized GGUF models as a local inference container")]
#[command(version)]
pub struct Cli {
    /// Configuration file (defaults to <config dir>/nim-deploy/config.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Root of the local model layout
    #[arg(long, global = true)]
    pub workdir: Option<PathBuf>,

    /// Inference server image tag (see `nim-deploy images`)
    #[arg(long, global = true)]
    pub image_tag: Option<String>,

    /// Host port the inference server is published on
    #[arg(short, long, global = true)]
    pub port: Option<u16>,

    /// More output (-v debug, -vv trace); RUST_LOG takes precedence
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Log output format: text or json
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// List local models, complete and resumable
    List,

    /// Download a model and deploy it
    Deploy {
        /// Repository holding config.json and the tokenizer, e.g. meta-llama/Llama-3.2-3B-Instruct
        #[arg(long)]
        model_repo: String,

        /// Repository holding the GGUF weights, e.g. bartowski/Llama-3.2-3B-Instruct-GGUF
        #[arg(long)]
        quant_repo: String,

        /// Quantization tag, e.g. Q4_K_M
        #[arg(long)]
        tag: String,
    },

    /// Deploy a local model; without arguments a menu is shown
    Run {
        /// Model name, e.g. Llama-3.2-3B-Instruct
        #[arg(requires_all = ["author", "tag"])]
        name: Option<String>,

        /// Publisher of the weights, e.g. bartowski
        author: Option<String>,

        /// Quantization tag, e.g. Q4_K_M
        tag: Option<String>,
    },

    /// Stop the running inference container
    Stop,

    /// List available inference server image tags
    Images,
}

impl Cli {
    /// Applies command-line overrides on top of the loaded configuration
    pub fn apply_overrides(&self, config: &mut DeployConfig) {
        if let Some(workdir) = &self.workdir {
            config.workdir = workdir.clone();
        }
        if let Some(tag) = &self.image_tag {
            config.container.tag = tag.clone();
        }
        if let Some(port) = self.port {
            config.container.port = port;
        }
    }

    pub fn logging_options(&self) -> LoggingOptions {
        LoggingOptions {
            verbosity: self.verbose,
            format: self.log_format,
        }
    }
}

impl Commands {
    /// Identity named on the `run` command line, if any
    pub fn run_identity(&self) -> Result<Option<ModelIdentity>> {
        match self {
            Commands::Run {
                name: Some(name),
                author: Some(author),
                tag: Some(tag),
            } => ModelIdentity::new(name.as_str(), author.as_str(), tag.as_str()).map(Some),
            _ => Ok(None),
        }
    }
}
