use std::error::Error;

use clap::Parser;

use shallot::config::{Cli, Config};
use shallot::cryptography::Identity;
use shallot::relay::Relay;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    // Configure logging based on verbose flag
    if cli.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
        log::info!("Verbose logging enabled");
    } else {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Info)
            .init();
    }

    // Both of these are fatal before any listener binds
    let config = Config::from_cli(&cli)?;
    let identity = Identity::load(&cli.hostkey)?;

    let relay = Relay::start(config, identity).await?;
    println!(
        "Relay up: control on port {}, peers on port {}",
        relay.control_port(),
        relay.api_port()
    );

    tokio::signal::ctrl_c().await?;
    log::info!("Shutting down");
    Ok(())
}
