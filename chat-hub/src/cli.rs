use std::{net::SocketAddr, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::{
    config::{HubConfig, RelayConfig},
    rate_limit::RateLimiter,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the chat hub with its observer feed.
    Hub(HubArgs),
    /// Relay clients to a hub, marking their nicknames.
    Relay(RelayArgs),
}

#[derive(Args, Debug, Clone)]
pub struct HubArgs {
    /// Socket address for chat clients. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:12345")]
    pub listen: SocketAddr,

    /// Socket address for WebSocket observers.
    #[arg(long, default_value = "127.0.0.1:8765")]
    pub observer_listen: SocketAddr,

    /// Messages a session may send within one rate-limit window.
    #[arg(long, default_value_t = 10)]
    pub rate_limit_messages: usize,

    /// Length of the rate-limit window in seconds.
    #[arg(long, default_value_t = 5)]
    pub rate_limit_window_secs: u64,

    /// Seconds between status log lines; 0 turns them off.
    #[arg(long, default_value_t = 30)]
    pub stats_interval_secs: u64,
}

impl HubArgs {
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            rate_limit: RateLimiter::new(
                self.rate_limit_messages,
                Duration::from_secs(self.rate_limit_window_secs),
            ),
            stats_interval: Duration::from_secs(self.stats_interval_secs),
            ..HubConfig::default()
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct RelayArgs {
    /// Socket address the relay accepts clients on.
    #[arg(long, default_value = "127.0.0.1:9999")]
    pub listen: SocketAddr,

    /// Address of the hub to forward to.
    #[arg(long, default_value = "127.0.0.1:12345")]
    pub upstream: SocketAddr,

    /// Character put in front of every relayed nickname.
    #[arg(long, default_value_t = '*')]
    pub marker: char,
}

impl RelayArgs {
    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            upstream: self.upstream,
            marker: self.marker,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hub_defaults_match_the_config_defaults() {
        let cli = Cli::try_parse_from(["chat-hub", "hub"]).expect("parse hub");
        let Command::Hub(args) = cli.command else {
            panic!("expected hub command");
        };
        assert_eq!(args.listen, crate::config::DEFAULT_CHAT_ADDR);
        assert_eq!(args.observer_listen, crate::config::DEFAULT_OBSERVER_ADDR);

        let config = args.hub_config();
        let defaults = HubConfig::default();
        assert_eq!(config.rate_limit, defaults.rate_limit);
        assert_eq!(config.stats_interval, defaults.stats_interval);
    }

    #[test]
    fn relay_flags_override_defaults() {
        let cli = Cli::try_parse_from([
            "chat-hub",
            "relay",
            "--upstream",
            "127.0.0.1:4000",
            "--marker",
            "~",
        ])
        .expect("parse relay");
        let Command::Relay(args) = cli.command else {
            panic!("expected relay command");
        };
        assert_eq!(args.listen, crate::config::DEFAULT_RELAY_ADDR);

        let config = args.relay_config();
        assert_eq!(config.upstream, "127.0.0.1:4000".parse().expect("addr"));
        assert_eq!(config.marker, '~');
    }
}
