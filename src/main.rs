//! Oxidized-Xenon - Xbox 360 emulator core
//!
//! Headless entry point: `oxidized-xenon <path>` launches a title from an
//! executable, a disc image or an extracted package folder and runs it
//! until the main thread exits.

use anyhow::{anyhow, bail, Context};
use ox_core::config::CpuBackend;
use ox_core::{logging, Config};
use ox_cpu::NullBackend;
use ox_integration::{Emulator, Subsystems};
use std::path::PathBuf;
use std::sync::Arc;

fn main() -> anyhow::Result<()> {
    let config = Config::load().map_err(|e| anyhow!("failed to load configuration: {}", e))?;
    logging::init(&config.debug);

    let Some(target) = std::env::args_os().nth(1).map(PathBuf::from) else {
        bail!("usage: oxidized-xenon <path to xex, disc image or package folder>");
    };

    tracing::info!("Starting Oxidized-Xenon");

    let mut subsystems = Subsystems::null();
    subsystems.backend = match config.cpu.backend {
        CpuBackend::Any | CpuBackend::Null => Arc::new(NullBackend::new()),
    };
    if !config.audio.enable {
        subsystems.audio = None;
    }

    let emulator = Emulator::setup(config, Config::config_dir(), subsystems)
        .context("emulator setup failed")?;
    emulator
        .launch_path(&target)
        .with_context(|| format!("failed to launch {}", target.display()))?;

    loop {
        emulator.wait_until_exit();
        if !emulator.title_requested() {
            break;
        }
        emulator.terminate_title()?;
        emulator.launch_next_title()?;
    }

    tracing::info!("Title exited, shutting down");
    Ok(())
}
