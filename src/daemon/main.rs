// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use ghaf_canary_sentinel::config::{verify_config, SentinelConfig};
use ghaf_canary_sentinel::sentinel::{Collaborators, Sentinel};
use ghaf_canary_sentinel::util::{init_logger, wait_for_shutdown};

#[derive(Parser)]
#[command(name = "canary-sentinel")]
#[command(about = "Canary-file sentinel that stops file sharing when a decoy is tampered with")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Parser)]
enum Commands {
    /// Start the sentinel
    Run {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(short, long)]
        debug: bool,
        /// Alert only, never stop the file sharing service
        #[arg(long)]
        observe_only: bool,
    },
    /// Verify configuration file without starting the sentinel
    Verify {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Write a template configuration file
    Init {
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            debug,
            observe_only,
        } => {
            init_logger(debug)?;

            if !config.exists() {
                SentinelConfig::write_template(&config)?;
                anyhow::bail!(
                    "No configuration at {}; a template was written, edit it and restart",
                    config.display()
                );
            }

            let mut config = SentinelConfig::load_config(&config).with_context(|| {
                format!("Failed to load configuration from {}", config.display())
            })?;

            if observe_only {
                log::info!("Containment disabled via --observe-only flag");
                config.test_mode = true;
            }

            let collaborators = Collaborators::system(&config);
            let running = Sentinel::new(config, collaborators)
                .start()
                .context("Sentinel startup failed")?;

            wait_for_shutdown().await?;
            running.shutdown().await;
            Ok(())
        }
        Commands::Verify { config } => verify_config(&config)
            .with_context(|| format!("Failed to verify configuration file {}", config.display())),
        Commands::Init { config } => {
            if config.exists() {
                anyhow::bail!("Refusing to overwrite {}", config.display());
            }
            SentinelConfig::write_template(&config)?;
            println!("Template written to {}", config.display());
            Ok(())
        }
    }
}
