use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;

use crate::cli::Cli;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub redis_url: String,
    pub standalone: bool,
    pub hint_ttl_seconds: u64,
    pub shutdown_grace: Duration,
}

impl TryFrom<Cli> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        Ok(ServerConfig {
            listen_addr,
            redis_url: cli.redis_url,
            standalone: cli.standalone,
            hint_ttl_seconds: cli.hint_ttl_secs,
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn defaults_produce_a_valid_config() {
        let cli = Cli::parse_from(["crosstalk"]);
        let config = ServerConfig::try_from(cli).expect("default config");
        assert_eq!(config.listen_addr.port(), 8090);
        assert!(!config.standalone);
        assert_eq!(config.shutdown_grace, Duration::from_secs(5));
    }

    #[test]
    fn rejects_unparseable_listen_address() {
        let cli = Cli::parse_from(["crosstalk", "--listen-addr", "not-an-addr"]);
        assert!(ServerConfig::try_from(cli).is_err());
    }
}
