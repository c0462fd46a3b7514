//! memsys stress driver
//!
//! Simulates frames of scratch and slab traffic against a fresh memory
//! system and reports allocator statistics.
//!
//! Run with: cargo run -p memsys_stress -- [config.toml]

mod config;
mod workload;

use std::process::ExitCode;

use config::StressConfig;

fn main() -> ExitCode {
    // Initialize logging
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info")
    ).init();

    let config = match StressConfig::load(std::env::args().nth(1)) {
        Ok(config) => config,
        Err(e) => {
            log::error!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    config.print_summary();

    match workload::run(&config) {
        Ok(report) => {
            log::info!(
                "Completed {} frames: {} scratch allocations ({} overflowed), {} slab allocations ({} from backing, {} contended)",
                report.frames,
                report.scratch_allocations,
                report.scratch_overflows,
                report.slab_allocations,
                report.slab_backing_allocations,
                report.slab_contended
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            log::error!("Stress run failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
