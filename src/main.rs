//! Headless runner: `cellgrid [config.json] [steps]`.
//!
//! Runs a fixed-step loop and logs the inspection report at the end.
//! Set `RUST_LOG=debug` for buffer sizes, `trace` for per-step output.

use std::process::ExitCode;
use std::time::{Duration, Instant};

use cellgrid::{SimConfig, Simulation};

const DELTA_TIME: f32 = 1.0 / 60.0;
const DEFAULT_STEPS: u64 = 100;

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) => SimConfig::from_json_file(&path)?,
        None => SimConfig::default(),
    };
    let steps = match args.next() {
        Some(n) => n.parse::<u64>()?,
        None => DEFAULT_STEPS,
    };

    let mut sim = Simulation::new(config)?;

    let start = Instant::now();
    for i in 0..steps {
        sim.step(DELTA_TIME)?;
        if (i + 1) % 10 == 0 {
            log::debug!("{} / {} steps", i + 1, steps);
        }
    }
    let elapsed = start.elapsed();

    log::info!(
        "{} steps on {} backend in {:.2?} ({:.2?} per step)",
        steps,
        sim.backend_name(),
        elapsed,
        per_step(elapsed, steps)
    );
    log::info!("\n{}", sim.inspect()?);
    Ok(())
}

fn per_step(elapsed: Duration, steps: u64) -> Duration {
    elapsed.div_f64(steps.max(1) as f64)
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
