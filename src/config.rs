use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::{DEFAULT_MINIMUM_HOPS, DEFAULT_RPS_ADDR, DEFAULT_TIMEOUT_SECS};

/// Command line surface of the onion relay.
#[derive(Parser)]
#[command(name = "shallot")]
#[command(about = "Onion-routing relay module", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Port the local control client connects to
    #[arg(short, long)]
    pub port: u16,

    /// Port remote relays connect to
    #[arg(long)]
    pub api_port: u16,

    /// Hostname or address both listeners bind to
    #[arg(long, default_value = "127.0.0.1")]
    pub hostname: String,

    /// Path to the 32-byte hostkey file
    #[arg(long)]
    pub hostkey: PathBuf,

    /// Minimum number of intermediate hops per tunnel
    #[arg(long, default_value_t = DEFAULT_MINIMUM_HOPS)]
    pub minimum_hops: usize,

    /// Address of the random peer sampling service
    #[arg(long, default_value = DEFAULT_RPS_ADDR)]
    pub rps_addr: String,

    /// Socket timeout in seconds
    #[arg(long, default_value_t = DEFAULT_TIMEOUT_SECS)]
    pub timeout: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

/// Validated runtime configuration shared by every task.
#[derive(Clone, Debug)]
pub struct Config {
    pub hostname: String,
    pub module_port: u16,
    pub api_port: u16,
    pub rps_addr: String,
    pub min_hops: usize,
    pub timeout: Duration,
}

impl Config {
    pub fn from_cli(cli: &Cli) -> Result<Self, String> {
        let config = Config {
            hostname: cli.hostname.clone(),
            module_port: cli.port,
            api_port: cli.api_port,
            rps_addr: cli.rps_addr.clone(),
            min_hops: cli.minimum_hops,
            timeout: Duration::from_secs(cli.timeout),
        };
        config.validate()?;
        Ok(config)
    }

    /// Checked before any listener binds; violations are fatal. Port 0
    /// asks the OS for an ephemeral port, so only explicit ports can clash.
    pub fn validate(&self) -> Result<(), String> {
        if self.module_port == self.api_port && self.module_port != 0 {
            return Err(format!(
                "control and peer listeners cannot share port {}",
                self.module_port
            ));
        }
        if self.min_hops == 0 {
            return Err("minimum hop count must be at least 1".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            hostname: "127.0.0.1".to_string(),
            module_port: 9301,
            api_port: 9302,
            rps_addr: DEFAULT_RPS_ADDR.to_string(),
            min_hops: 2,
            timeout: Duration::from_secs(10),
        }
    }

    #[test]
    fn test_distinct_ports_pass_validation() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn test_equal_ports_are_rejected() {
        let mut config = base_config();
        config.api_port = config.module_port;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_hop_minimum_is_rejected() {
        let mut config = base_config();
        config.min_hops = 0;
        assert!(config.validate().is_err());
    }
}
