//! Command-line argument parsing.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// Simulator command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug, Default)]
#[command(name = "tessera-sim", about = "Headless tessera world simulator")]
pub struct CliArgs {
    /// World seed.
    #[arg(long)]
    pub seed: Option<u64>,

    /// Ticks to run.
    #[arg(long)]
    pub ticks: Option<u32>,

    /// Snapshot reader threads (0 = one per CPU).
    #[arg(long)]
    pub reader_threads: Option<usize>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(seed) = args.seed {
            self.world.seed = seed;
        }
        if let Some(ticks) = args.ticks {
            self.sim.ticks = ticks;
        }
        if let Some(threads) = args.reader_threads {
            self.sim.reader_threads = threads;
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_override() {
        let mut config = Config::default();
        let args = CliArgs {
            seed: Some(99),
            ticks: Some(5),
            ..CliArgs::default()
        };
        config.apply_cli_overrides(&args);
        assert_eq!(config.world.seed, 99);
        assert_eq!(config.sim.ticks, 5);
        // Non-overridden fields retain defaults
        assert_eq!(config.sim.reader_threads, 0);
        assert_eq!(config.debug.log_level, "info");
    }

    #[test]
    fn test_cli_no_override() {
        let mut config = Config::default();
        config.apply_cli_overrides(&CliArgs::default());
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_cli_parses_flags() {
        let args = CliArgs::parse_from([
            "tessera-sim",
            "--seed",
            "17",
            "--reader-threads",
            "2",
            "--log-level",
            "debug",
        ]);
        assert_eq!(args.seed, Some(17));
        assert_eq!(args.reader_threads, Some(2));
        assert_eq!(args.log_level.as_deref(), Some("debug"));
        assert!(args.config.is_none());
    }
}
