use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;

use crate::backed_pipe::{PipeConfig, DEFAULT_REPLAY_BUFFER_SIZE};
use crate::manager::{ManagerConfig, MAX_STREAMS};

/// Immortal Streams Agent
#[derive(Parser, Debug, Clone)]
#[command(name = "immortal-agent")]
#[command(version)]
#[command(
    about = "Reconnectable byte streams to local TCP services",
    long_about = None
)]
pub struct Args {
    /// Address the HTTP/WebSocket endpoint listens on
    #[arg(short, long, env = "IMMORTAL_BIND", default_value = "127.0.0.1:4040")]
    pub bind: SocketAddr,

    /// Maximum number of live streams before eviction kicks in
    #[arg(long, env = "IMMORTAL_MAX_STREAMS", default_value_t = MAX_STREAMS)]
    pub max_streams: usize,

    /// Bytes of local output kept for replay per stream
    #[arg(long, env = "IMMORTAL_REPLAY_BUFFER_SIZE", default_value_t = DEFAULT_REPLAY_BUFFER_SIZE)]
    pub replay_buffer_size: usize,

    /// Give up dialing a local port after this many seconds
    #[arg(long, default_value_t = 10)]
    pub dial_timeout_secs: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit logs as JSON (also IMMORTAL_LOG_JSON=1)
    #[arg(long)]
    pub log_json: bool,
}

impl Args {
    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            max_streams: self.max_streams.max(1),
            pipe: PipeConfig {
                replay_buffer_size: self.replay_buffer_size.max(1),
            },
        }
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    pub fn json_logs(&self) -> bool {
        self.log_json || std::env::var("IMMORTAL_LOG_JSON").is_ok_and(|v| v == "1")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = Args::try_parse_from(["immortal-agent"]).unwrap();
        assert_eq!(args.bind, "127.0.0.1:4040".parse::<SocketAddr>().unwrap());
        assert_eq!(args.manager_config(), ManagerConfig::default());
        assert_eq!(args.dial_timeout(), Duration::from_secs(10));
        assert!(!args.verbose);
    }

    #[test]
    fn test_overrides() {
        let args = Args::try_parse_from([
            "immortal-agent",
            "--bind",
            "0.0.0.0:9000",
            "--max-streams",
            "4",
            "--replay-buffer-size",
            "1024",
            "-v",
        ])
        .unwrap();
        let config = args.manager_config();
        assert_eq!(config.max_streams, 4);
        assert_eq!(config.pipe.replay_buffer_size, 1024);
        assert!(args.verbose);
    }

    #[test]
    fn test_zero_limits_are_clamped() {
        let args =
            Args::try_parse_from(["immortal-agent", "--max-streams", "0", "--replay-buffer-size", "0"])
                .unwrap();
        let config = args.manager_config();
        assert_eq!(config.max_streams, 1);
        assert_eq!(config.pipe.replay_buffer_size, 1);
    }
}
