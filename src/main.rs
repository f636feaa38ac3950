//! B2BUA process entry point.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use vertex_b2bua::aaa::StaticAaaEngine;
use vertex_b2bua::call_map::CallMap;
use vertex_b2bua::config::SwitchConfig;
use vertex_b2bua::dispatcher::Dispatcher;
use vertex_b2bua::sip::message::SipRequest;
use vertex_b2bua::sip::transaction::memory::InMemoryTransactionManager;
use vertex_b2bua::utils::setup_logging;
use vertex_b2bua::Result;

#[derive(Parser)]
#[command(name = "vertex-b2bua")]
#[command(about = "SIP back-to-back user agent")]
#[command(version = vertex_b2bua::VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the B2BUA (default when no subcommand is given)
    Start,
    /// Parse and validate a config file without starting anything
    ValidateConfig,
    /// Print a default config to stdout
    GenerateConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Start) {
        Commands::GenerateConfig => {
            let config = SwitchConfig::default_config();
            let rendered = toml::to_string_pretty(&config)
                .map_err(|e| vertex_b2bua::Error::internal(e.to_string()))?;
            println!("{}", rendered);
            return Ok(());
        }
        Commands::ValidateConfig => {
            let config = load_config(cli.config)?;
            config.validate()?;
            println!("configuration is valid");
            return Ok(());
        }
        Commands::Start => {
            let mut config = load_config(cli.config)?;
            config.logging.level = cli.log_level;
            run(config).await
        }
    }
}

fn load_config(path: Option<PathBuf>) -> Result<SwitchConfig> {
    match path {
        Some(path) => SwitchConfig::load_from_file(path),
        None => SwitchConfig::load_from_env().or_else(|_| Ok(SwitchConfig::default_config())),
    }
}

async fn run(config: SwitchConfig) -> Result<()> {
    setup_logging(&config.logging)?;
    config.validate()?;
    info!(node_id = %config.general.node_id, "starting b2bua");

    let transaction_manager = Arc::new(InMemoryTransactionManager::default());
    let call_map = CallMap::new(
        std::time::Duration::from_secs(config.call_map.gc_interval_secs),
        std::time::Duration::from_secs(config.call_map.fast_gc_interval_secs),
        transaction_manager.clone(),
    );
    let aaa = Arc::new(StaticAaaEngine::new(config.aaa.clone()));
    let dispatcher = Arc::new(Dispatcher::new(
        call_map.clone(),
        aaa,
        transaction_manager,
        &config.sip,
        &config.b2bua,
        config.aaa.digest_auth_only,
    ));

    // `_inbound_tx` is the seam a real transport adapter feeds: nothing
    // currently writes to it since the transport layer itself is out of
    // scope here, but the drain loop it feeds is real and is what
    // actually turns inbound requests into new calls.
    let (_inbound_tx, mut inbound_rx) = mpsc::unbounded_channel::<SipRequest>();
    let dispatch_loop = tokio::spawn({
        let dispatcher = dispatcher.clone();
        async move {
            while let Some(request) = inbound_rx.recv().await {
                if let Some(response) = dispatcher.on_new_dialog(request).await {
                    warn!(status = response.status_code_u16(), "inbound request rejected at dispatch");
                }
            }
        }
    });

    match signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(err) => error!("unable to listen for shutdown signal: {}", err),
    }

    dispatch_loop.abort();
    call_map.disconnect_all().await;
    Ok(())
}
