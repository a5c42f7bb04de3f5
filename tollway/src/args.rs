use std::{net::SocketAddr, path::PathBuf};

use clap::Parser;

/// Tollway metered gateway
#[derive(Debug, Parser)]
#[command(name = "tollway", about = "Metered, quota-enforcing gateway for the Anthropic messages API")]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "tollway.toml", env = "TOLLWAY_CONFIG")]
    pub config: PathBuf,

    /// Override the listen address
    #[arg(long, env = "TOLLWAY_LISTEN")]
    pub listen: Option<SocketAddr>,

    /// Log filter directive, e.g. `info` or `tollway_relay=debug,info`
    #[arg(long, default_value = "info", env = "TOLLWAY_LOG")]
    pub log: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let args = Args::parse_from(["tollway"]);
        assert_eq!(args.config, PathBuf::from("tollway.toml"));
        assert!(args.listen.is_none());
        assert_eq!(args.log, "info");
    }

    #[test]
    fn overrides() {
        let args = Args::parse_from(["tollway", "-c", "/etc/tollway.toml", "--listen", "127.0.0.1:8080", "--log", "debug"]);
        assert_eq!(args.config, PathBuf::from("/etc/tollway.toml"));
        assert_eq!(args.listen, Some("127.0.0.1:8080".parse().unwrap()));
        assert_eq!(args.log, "debug");
    }
}
