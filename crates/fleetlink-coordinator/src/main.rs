//! Fleetlink coordinator binary.
//!
//! Runs a self-contained platoon demo: a synthetic straight-line
//! simulation, the coordinator step loop and in-process vehicle runtimes,
//! all wired over the in-memory bus.
//!
//! # Usage
//!
//! ```bash
//! # Three-vehicle platoon for 30 simulated seconds
//! fleetlink-coordinator --vehicles 3 --duration 30
//! ```

use std::{sync::Arc, time::Duration};

use clap::Parser;
use fleetlink_bus::MemoryBus;
use fleetlink_coordinator::{Coordinator, CoordinatorConfig, SyntheticSim};
use serde_json::json;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Fleetlink coordinator
#[derive(Parser, Debug)]
#[command(name = "fleetlink-coordinator")]
#[command(about = "Traffic simulation coordinator with in-process platoon demo")]
#[command(version)]
struct Args {
    /// Number of vehicles in the platoon
    #[arg(long, default_value = "3")]
    vehicles: usize,

    /// Size of the execution node pool
    #[arg(long, default_value = "16")]
    nodes: usize,

    /// Simulation step length in milliseconds
    #[arg(long, default_value = "100")]
    step_length_ms: u64,

    /// Simulated duration in seconds
    #[arg(long, default_value = "30")]
    duration: f64,

    /// Beacon interval in seconds
    #[arg(long, default_value = "0.1")]
    beacon_interval: f64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let step_length = Duration::from_millis(args.step_length_ms);
    let formation: Vec<String> = (0..args.vehicles).map(|i| format!("v.{i}")).collect();

    let mut sim = SyntheticSim::new(step_length);
    for (position, sumo_id) in formation.iter().enumerate() {
        // Head of the platoon spawns furthest ahead, 10 m spacing
        let x = (args.vehicles - 1 - position) as f64 * 10.0;
        sim.schedule_spawn(0.0, sumo_id, x, 20.0);
    }

    let config = CoordinatorConfig {
        node_count: args.nodes,
        step_length,
        test_mode: true,
        application: None,
        parameters: Some(json!({
            "platoon_formation": formation,
            "beacon_interval": args.beacon_interval,
            "min_speed": 15.0,
            "max_speed": 25.0,
        })),
        wait_for_start: false,
        run_until: Some(args.duration),
    };

    tracing::info!(vehicles = args.vehicles, duration = args.duration, "starting platoon demo");

    let coordinator = Coordinator::new(sim, config, Arc::new(MemoryBus::new()));
    coordinator.run().await?;

    Ok(())
}
