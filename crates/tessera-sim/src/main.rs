//! Headless tessera simulator.

mod sim;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tessera_config::{CliArgs, Config, default_config_dir};
use tracing::{error, info};

use crate::sim::Simulation;

fn main() -> ExitCode {
    let args = CliArgs::parse();

    // Resolve config directory
    let config_dir = args
        .config
        .clone()
        .or_else(default_config_dir)
        .unwrap_or_else(|| PathBuf::from(".tessera"));

    // Load or create config, then apply CLI overrides
    let mut config = Config::load_or_create(&config_dir).unwrap_or_else(|e| {
        eprintln!("Failed to load config: {e}, using defaults");
        Config::default()
    });
    config.apply_cli_overrides(&args);

    let log_dir = config_dir.join("logs");
    tessera_log::init_logging(Some(&log_dir), cfg!(debug_assertions), Some(&config));

    let result = Simulation::new(&config).and_then(|sim| {
        let summary = sim.run(&config)?;
        Ok((summary, sim.sync.len()))
    });
    match result {
        Ok((s, observer_events)) => {
            info!(
                ticks = s.ticks,
                peak_chunks = s.peak_chunks,
                populated = s.populated,
                lit_columns = s.lit_columns,
                physics_updates = s.physics_updates,
                visibility_events = s.visibility_events,
                observer_events,
                edits = s.edits,
                saved = s.saved,
                unloaded = s.unloaded,
                reaped = s.reaped,
                snapshots_read = s.snapshots_read,
                snapshots_missed = s.snapshots_missed,
                solid_cells_read = s.solid_cells_read,
                "done"
            );
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(%err, "simulation failed");
            ExitCode::FAILURE
        }
    }
}
