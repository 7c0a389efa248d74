use anyhow::Context;
use clap::Parser;
use labwired_config::{ConfigError, SessionConfig, SessionFile, SystemKind};
use labwired_core::cpu::{Chip8Cpu, GameboyCpu};
use labwired_core::debug::DebugTarget;
use labwired_core::system::{self, BusDebugAdapter};
use labwired_core::{ComponentKind, SystemStatus};
use labwired_gdbstub::GdbServer;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use tracing::info;

/// Minimal headless runner exercising the core end-to-end for CI and
/// manual smoke-testing: loads a ROM, runs the selected system for a
/// bounded number of ticks (or until it halts), and optionally exposes a
/// remote-debug server while doing so.
#[derive(Parser, Debug)]
#[command(author, version, about = "Headless GameBoy/Chip8 runner", long_about = None)]
struct Args {
    /// Path to the ROM/cartridge image to load
    rom_path: PathBuf,

    /// Which emulated system to run ("gameboy" or "chip8")
    #[arg(long, value_parser = parse_system_kind)]
    system: Option<SystemKind>,

    /// Optional YAML session file; CLI flags override its values
    #[arg(long)]
    session: Option<PathBuf>,

    /// Start the remote-debug server on this port
    #[arg(long)]
    debug_port: Option<u16>,

    /// Display up-scale factor (informational; this runner opens no window)
    #[arg(long)]
    scale: Option<u32>,

    /// Enable instruction-level execution tracing
    #[arg(long)]
    trace: bool,

    /// Maximum number of ticks to run before stopping
    #[arg(long, default_value = "200000")]
    max_ticks: u64,
}

fn parse_system_kind(s: &str) -> Result<SystemKind, ConfigError> {
    s.parse()
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let base = match &args.session {
        Some(path) => SessionFile::from_file(path)
            .with_context(|| format!("loading session file {path:?}"))?,
        None => SessionFile::default(),
    };
    let overrides = SessionFile {
        system: args.system,
        rom_path: Some(args.rom_path.clone()),
        debug_port: args.debug_port,
        scale: args.scale,
        trace: args.trace.then_some(true),
    };
    let config = SessionConfig::merge(base, overrides)?;

    tracing_subscriber::fmt()
        .with_max_level(if config.trace { tracing::Level::DEBUG } else { tracing::Level::INFO })
        .init();

    info!("loading {} ROM from {:?}", config.system, config.rom_path);
    let rom = std::fs::read(&config.rom_path)
        .with_context(|| format!("reading ROM file {:?}", config.rom_path))?;

    let emulated_system = match config.system {
        SystemKind::Gameboy => system::wire_gameboy(&rom, None),
        SystemKind::Chip8 => system::wire_chip8(&rom),
    };

    let bus = emulated_system.bus_handle();
    let status = emulated_system.status_handle();
    let debug_stopped = emulated_system.debug_stopped_handle();
    let cpu_idx = bus
        .lock()
        .expect("bus mutex poisoned")
        .component_by_type(ComponentKind::Cpu)
        .first()
        .copied()
        .context("wired system has no CPU component")?;

    if let Some(port) = config.debug_port {
        let server = GdbServer::bind(port, true)?;
        let target: Arc<Mutex<dyn DebugTarget>> = match config.system {
            SystemKind::Gameboy => Arc::new(Mutex::new(BusDebugAdapter::<GameboyCpu>::new(
                "gameboy",
                bus.clone(),
                cpu_idx,
                debug_stopped.clone(),
                1,
            ))),
            SystemKind::Chip8 => Arc::new(Mutex::new(BusDebugAdapter::<Chip8Cpu>::new(
                "chip8",
                bus.clone(),
                cpu_idx,
                debug_stopped.clone(),
                1,
            ))),
        };
        info!("starting debug server on 127.0.0.1:{port}");
        std::thread::spawn(move || server.serve(target));
    }

    status.store(SystemStatus::Running as u8, Ordering::Release);
    let mut ticks = 0u64;
    while ticks < args.max_ticks
        && SystemStatus::from_u8(status.load(Ordering::Acquire)) == SystemStatus::Running
    {
        if debug_stopped.load(Ordering::Acquire) {
            std::thread::sleep(std::time::Duration::from_millis(1));
            continue;
        }
        bus.lock().expect("bus mutex poisoned").receive_tick();
        ticks += 1;
    }
    status.store(SystemStatus::Halted as u8, Ordering::Release);

    info!(
        "ran {ticks} ticks, final status {:?}",
        SystemStatus::from_u8(status.load(Ordering::Acquire))
    );

    Ok(())
}
