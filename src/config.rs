//! Command-line and environment configuration.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Depth-camera zone daemon: tracks configured rectangular zones against a
/// depth camera feed and reports occupancy over a line-oriented TCP protocol.
#[derive(Parser, Debug)]
#[clap(name = "knd", version)]
pub struct Config {
    /// TCP port the zone protocol server listens on.
    #[clap(long, env = "KND_PORT", default_value = "14308")]
    pub port: u16,

    /// Address the Prometheus metrics listener binds to.
    #[clap(long, env = "KND_METRICS_ADDR", default_value = "127.0.0.1:9897")]
    pub metrics_addr: SocketAddr,

    /// Directory zones.knd is loaded from and saved into. Persistence is
    /// disabled if unset.
    #[clap(long, env = "KND_SAVEDIR")]
    pub save_dir: Option<PathBuf>,

    /// Seconds the watchdog allows for startup before escalating.
    #[clap(long, env = "KND_INITTIMEOUT", default_value = "7")]
    pub init_timeout: f64,

    /// Seconds the watchdog allows between kicks once steady-state is reached.
    #[clap(long, env = "KND_RUNTIMEOUT", default_value = "0.75")]
    pub run_timeout: f64,

    /// Increase logging verbosity; repeatable.
    #[clap(short, long, parse(from_occurrences))]
    pub verbose: u8,

    /// Decrease logging verbosity; repeatable.
    #[clap(short, long, parse(from_occurrences))]
    pub quiet: u8,

    /// Run against the simulated camera driver instead of real hardware.
    #[clap(long)]
    pub simulate: bool,
}

impl Config {
    pub fn init_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.init_timeout.max(0.0))
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.run_timeout.max(0.001))
    }

    /// Combines -v/-q into a `stderrlog` verbosity level (0=Error..4=Trace),
    /// overridden by `KND_LOG_LEVEL` if set.
    pub fn verbosity(&self) -> usize {
        if let Ok(explicit) = std::env::var("KND_LOG_LEVEL") {
            if let Ok(level) = explicit.parse::<usize>() {
                return level.min(4);
            }
        }
        let base = 2i32; // Info
        let level = base + self.verbose as i32 - self.quiet as i32;
        level.clamp(0, 4) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_port_matches_the_knd_protocol_port() {
        let cfg = Config::parse_from(["knd"]);
        assert_eq!(cfg.port, 14308);
    }

    #[test]
    fn verbosity_shifts_around_info_level() {
        let mut cfg = Config::parse_from(["knd"]);
        assert_eq!(cfg.verbosity(), 2);
        cfg.verbose = 2;
        assert_eq!(cfg.verbosity(), 4);
        cfg.verbose = 0;
        cfg.quiet = 2;
        assert_eq!(cfg.verbosity(), 0);
    }
}
