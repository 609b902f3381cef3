// Standard library
use std::io::Write;
use std::sync::Arc;

// External crates
use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info};

// Internal imports
use console_config::ConfigLoader;
use console_core::{console_error, console_print, console_println};
use console_dispatch::simulated::SimulatedConnector;
use console_dispatch::{DatacenterId, Dispatcher, DispatcherSettings};

// Local modules
mod cli;
mod commands;

use cli::{Args, ConsoleLine};
use commands::{execute_command, Flow};

const PROMPT: &str = "console> ";

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if let Err(e) = run(args).await {
        console_error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let loader = match &args.config {
        Some(path) => ConfigLoader::with_path(path),
        None => ConfigLoader::new(),
    };
    let config = loader.load().context("Failed to load configuration")?;

    let mut log_settings = config
        .logging
        .clone()
        .with_env_overrides()
        .context("Invalid logging override")?;
    if args.debug {
        log_settings.level = "debug".to_string();
    }
    // Held until exit so buffered file logs are flushed.
    let _log_guard =
        console_logging::init_subscriber(&log_settings).context("Failed to initialize logging")?;

    let connector = SimulatedConnector::default()
        .restricted_to(config.datacenters.iter().map(|id| DatacenterId::from(id.as_str())))
        .with_demo_servers();
    let dispatcher = Dispatcher::start(DispatcherSettings::from(&config), Arc::new(connector));
    info!(
        datacenters = config.datacenters.len(),
        "Console started with the simulated backend"
    );

    console_println!("Cloud console. Type 'help' for commands, 'exit' to leave.");
    let result = prompt_loop(&dispatcher).await;

    // In-flight work is not waited for.
    dispatcher.shutdown();
    debug!("Dispatcher shut down");
    result
}

async fn prompt_loop(dispatcher: &Dispatcher) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        console_print!("{}", PROMPT);
        std::io::stdout().flush().context("Failed to write prompt")?;

        let Some(line) = lines.next_line().await.context("Failed to read input")? else {
            console_println!();
            return Ok(());
        };
        if line.trim().is_empty() {
            continue;
        }

        let command = match ConsoleLine::parse_line(&line) {
            Ok(parsed) => parsed.command,
            Err(e) => {
                // Help and usage errors alike are printed by clap.
                let _ = e.print();
                continue;
            }
        };

        match execute_command(dispatcher, command).await {
            Ok(Flow::Exit) => return Ok(()),
            Ok(Flow::Continue) => {}
            Err(e) => console_error!("{:#}", e),
        }
    }
}
