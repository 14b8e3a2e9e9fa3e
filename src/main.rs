use std::{process, sync::OnceLock};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use wiotp_agent::{agent::Agent, config::Config, logger::LoggerManager, print_error};

static CONFIG: OnceLock<Config> = OnceLock::new();

pub fn config() -> &'static Config {
    CONFIG.get_or_init(|| {
        Config::new().unwrap_or_else(|e| {
            print_error!("{}", e);
            process::exit(1);
        })
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cfg = config();
    let logger_manager = LoggerManager::new(cfg.logger.clone()).unwrap_or_else(|e| {
        print_error!("Failed to setup Log Manager: {}", e);
        process::exit(1);
    });
    logger_manager.init().unwrap_or_else(|e| {
        print_error!("Failed to init Log Manager: {}", e);
        process::exit(1);
    });
    info!("Starting wiotp-agent version {}...", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", cfg.logger.level);
    debug!("{:#?}", cfg.client);

    let agent = Agent::new(cfg.client.clone(), cfg.agent.clone()).unwrap_or_else(|e| {
        error!("Failed to create device client: {}", e);
        process::exit(1);
    });

    agent.start().await.unwrap_or_else(|e| {
        error!("Failed to connect: {}", e);
        process::exit(1);
    });
    info!(
        interval_secs = cfg.agent.status_interval_secs,
        event = %cfg.agent.event_id,
        "Publishing status events"
    );

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, initiating graceful shutdown...");
                shutdown.cancel();
            }
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        }
    });

    agent.run(cancel).await?;
    info!("Shutdown complete");
    Ok(())
}
