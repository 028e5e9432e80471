use std::{net::SocketAddr, time::Duration};

use crate::{
    cli::ServeArgs,
    handler::{DEFAULT_MAX_CHUNK, HandlerSettings},
    registry::DEFAULT_WRITE_TIMEOUT,
    server::DEFAULT_BACKLOG,
};

/// Everything the relay needs to bind and serve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    pub listen: SocketAddr,
    pub backlog: u32,
    pub handler: HandlerSettings,
    pub write_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8888)),
            backlog: DEFAULT_BACKLOG,
            handler: HandlerSettings {
                max_chunk: DEFAULT_MAX_CHUNK,
                greeting: true,
            },
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }
}

impl From<ServeArgs> for RelayConfig {
    fn from(args: ServeArgs) -> Self {
        Self {
            listen: args.listen,
            backlog: args.backlog,
            handler: HandlerSettings {
                max_chunk: args.max_chunk.max(1),
                greeting: !args.no_greeting,
            },
            write_timeout: Duration::from_millis(args.write_timeout_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;
    use crate::cli::Cli;

    #[test]
    fn cli_defaults_match_config_defaults() {
        let cli = Cli::try_parse_from(["chat_relay"]).expect("parse");
        assert_eq!(RelayConfig::from(cli.serve), RelayConfig::default());
    }

    #[test]
    fn zero_chunk_is_clamped() {
        let cli = Cli::try_parse_from(["chat_relay", "--max-chunk", "0", "--no-greeting"])
            .expect("parse");
        let config = RelayConfig::from(cli.serve);
        assert_eq!(config.handler.max_chunk, 1);
        assert!(!config.handler.greeting);
    }
}
