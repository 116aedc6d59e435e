use anyhow::Result;
use clap::{Parser, Subcommand};

pub mod chat;
pub mod compare;
pub mod models;
pub mod render;

use crate::core::{AppConfig, init_tracing};

#[derive(Subcommand)]
enum Command {
    /// List the models the backend can compare
    Models {},
    /// Send one prompt to several models and print every answer
    Compare {
        /// Model to include, repeat for each model
        #[arg(short, long = "model")]
        models: Vec<String>,
        /// Image to attach, a file path or a data URL
        #[arg(long)]
        image: Option<String>,
        prompt: String,
    },
    /// Start an interactive comparison session
    Chat {
        /// Models to start with, defaults to the first in the catalog
        #[arg(short, long = "model")]
        models: Vec<String>,
    },
}

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Base URL of the comparison backend
    #[arg(long, global = true)]
    api_url: Option<String>,

    /// System prompt applied to every model
    #[arg(long, global = true)]
    system_prompt: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

pub async fn run() -> Result<()> {
    let args = Cli::parse();
    init_tracing();

    let mut config = AppConfig::default();
    if let Some(api_url) = args.api_url {
        config.api_url = api_url;
    }
    if let Some(system_prompt) = args.system_prompt {
        config.system_prompt = Some(system_prompt).filter(|p| !p.trim().is_empty());
    }

    // Handle each sub command
    match args.command {
        Some(Command::Models {}) => {
            models::run(&config).await?;
        }
        Some(Command::Compare {
            models,
            image,
            prompt,
        }) => {
            compare::run(&config, &models, image.as_deref(), &prompt).await?;
        }
        Some(Command::Chat { models }) => {
            chat::run(&config, &models).await?;
        }
        None => {}
    }

    Ok(())
}
