//! Component registry, run loop and debugger wiring (§4.6), plus the builder
//! functions that assemble a complete GameBoy or Chip8 machine out of the
//! bus/memory/CPU/display/input/timer primitives (§2 items 8-14).

use crate::bus::Bus;
use crate::cpu::{Chip8Cpu, GameboyCpu};
use crate::debug::{CpuIntrospect, DebugTarget, NotifyKind, RegisterInfo, StepArming};
use crate::display::Display;
use crate::input::Input;
use crate::memory::{MemoryBlock, MultiMappedMemory};
use crate::{ComponentKind, SystemStatus};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// What a front-end (a window, a file picker, a log pane — §6, out of core
/// scope) exposes back to the core. The core never constructs one itself;
/// it only calls through whatever implementation the embedding process
/// supplies. `NullFrontend` is the degenerate implementation a headless CLI
/// uses.
pub trait FrontendInterface: Send + Sync {
    fn open_file_dialog(&self) -> String;
    fn log(&self, message: &str);

    /// Halts the system thread this frontend manages, runs `reload`
    /// (ROM loading / component reset against the now-quiescent bus), then
    /// starts a new system thread. `reload` runs synchronously before this
    /// call returns.
    fn restart_system(&self, reload: Box<dyn FnOnce() + Send>);
}

/// The frontend a headless runner (the CLI, CI fixtures) plugs in when there
/// is no window to own: dialogs return nothing, logging goes through
/// `tracing` like everything else in the core, and `restart_system` drives
/// the same status handle the runner's tick loop observes.
#[derive(Debug, Clone)]
pub struct NullFrontend {
    status: Arc<AtomicU8>,
}

impl NullFrontend {
    pub fn new(status: Arc<AtomicU8>) -> Self {
        Self { status }
    }
}

impl FrontendInterface for NullFrontend {
    fn open_file_dialog(&self) -> String {
        String::new()
    }

    fn log(&self, message: &str) {
        tracing::info!(target: "frontend", "{message}");
    }

    fn restart_system(&self, reload: Box<dyn FnOnce() + Send>) {
        restart_system(&self.status, reload);
    }
}

type FrontendFn = Box<dyn Fn(&dyn FrontendInterface) + Send + Sync>;

/// A component registry, run-loop status flag, and the handful of named
/// actions a front-end may invoke — `(name, tick_rate_hz, components,
/// debugger?, status)` from §3's data model.
pub struct System {
    pub name: String,
    pub tick_rate_hz: u32,
    bus: Arc<Mutex<Bus>>,
    status: Arc<AtomicU8>,
    debug_stopped: Arc<AtomicBool>,
    frontend_functions: Vec<(String, FrontendFn)>,
}

impl System {
    pub fn new(name: impl Into<String>, tick_rate_hz: u32, bus: Bus) -> Self {
        Self {
            name: name.into(),
            tick_rate_hz,
            bus: Arc::new(Mutex::new(bus)),
            status: Arc::new(AtomicU8::new(SystemStatus::Halted as u8)),
            debug_stopped: Arc::new(AtomicBool::new(false)),
            frontend_functions: Vec::new(),
        }
    }

    pub fn bus_handle(&self) -> Arc<Mutex<Bus>> {
        self.bus.clone()
    }

    pub fn status_handle(&self) -> Arc<AtomicU8> {
        self.status.clone()
    }

    pub fn status(&self) -> SystemStatus {
        SystemStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn debug_stopped_handle(&self) -> Arc<AtomicBool> {
        self.debug_stopped.clone()
    }

    /// Attaches a named action the front-end may invoke (e.g. "Load ROM").
    pub fn register_frontend_function(
        &mut self,
        label: impl Into<String>,
        f: impl Fn(&dyn FrontendInterface) + Send + Sync + 'static,
    ) {
        self.frontend_functions.push((label.into(), Box::new(f)));
    }

    pub fn frontend_function_labels(&self) -> Vec<&str> {
        self.frontend_functions.iter().map(|(label, _)| label.as_str()).collect()
    }

    pub fn invoke_frontend_function(&self, label: &str, frontend: &dyn FrontendInterface) -> bool {
        match self.frontend_functions.iter().find(|(name, _)| name == label) {
            Some((_, f)) => {
                f(frontend);
                true
            }
            None => false,
        }
    }

    /// Discovers components by type tag, as the front-end does to find
    /// displays and inputs (§6).
    pub fn components_by_type(&self, kind: ComponentKind) -> Vec<usize> {
        self.bus.lock().expect("bus mutex poisoned").component_by_type(kind)
    }
}

/// Halts the system thread (by writing `Stopping` and waiting for the
/// runner to observe it and write `Halted`), runs `reload` (which performs
/// ROM loading and component reset against the now-quiescent bus), and
/// returns. Matches the core's half of `restart_system` (§6); the caller
/// (the front-end) is responsible for spinning up a fresh system thread
/// once this returns.
pub fn restart_system(status: &Arc<AtomicU8>, reload: impl FnOnce()) {
    status.store(SystemStatus::Stopping as u8, Ordering::Release);
    while SystemStatus::from_u8(status.load(Ordering::Acquire)) != SystemStatus::Halted {
        std::thread::sleep(Duration::from_millis(1));
    }
    reload();
}

/// The tick loop itself (§4.6): ticks the bus at `tick_rate_hz` while
/// `status == Running`, skipping the tick while the debug interface reports
/// `is_stopped`, and writing `Halted` on exit.
pub struct Runner;

impl Runner {
    pub fn run(
        status: &Arc<AtomicU8>,
        debug_stopped: &Arc<AtomicBool>,
        bus: &Arc<Mutex<Bus>>,
        tick_rate_hz: u32,
    ) {
        status.store(SystemStatus::Running as u8, Ordering::Release);
        let period = Duration::from_secs_f64(1.0 / f64::from(tick_rate_hz.max(1)));
        loop {
            match SystemStatus::from_u8(status.load(Ordering::Acquire)) {
                SystemStatus::Halted => break,
                SystemStatus::Stopping => {
                    status.store(SystemStatus::Halted as u8, Ordering::Release);
                    break;
                }
                SystemStatus::Running => {
                    if !debug_stopped.load(Ordering::Acquire) {
                        bus.lock().expect("bus mutex poisoned").receive_tick();
                    }
                    std::thread::sleep(period);
                }
            }
        }
    }
}

/// The uniform `DebugTarget` adapter every emulated system shares (§4.7):
/// generic over whichever CPU implements `CpuIntrospect`, so the remote-debug
/// server crate is written once against `dyn DebugTarget` and never needs to
/// know whether it's driving a GameBoy or a Chip8.
pub struct BusDebugAdapter<C> {
    name: String,
    bus: Arc<Mutex<Bus>>,
    cpu_index: usize,
    debug_stopped: Arc<AtomicBool>,
    stepping: Arc<Mutex<StepArming>>,
    pid: u32,
    _cpu: std::marker::PhantomData<fn() -> C>,
}

impl<C: CpuIntrospect + Send + 'static> BusDebugAdapter<C> {
    /// `cpu_index` must be the bus slot of a component whose concrete type is
    /// `C`. Wires the CPU's sole debug channel — `set_step_notify` — to this
    /// adapter's step-arming state before returning.
    pub fn new(
        name: impl Into<String>,
        bus: Arc<Mutex<Bus>>,
        cpu_index: usize,
        debug_stopped: Arc<AtomicBool>,
        pid: u32,
    ) -> Self {
        let stepping = Arc::new(Mutex::new(StepArming::default()));
        {
            let mut guard = bus.lock().expect("bus mutex poisoned");
            if let Some(cpu) = guard.component_mut(cpu_index).and_then(|d| d.as_any_mut().downcast_mut::<C>()) {
                let stepping = stepping.clone();
                let debug_stopped = debug_stopped.clone();
                cpu.set_step_notify(Box::new(move || {
                    if stepping.lock().expect("step-arming mutex poisoned").on_step() {
                        debug_stopped.store(true, Ordering::Release);
                    }
                }));
            }
        }
        Self {
            name: name.into(),
            bus,
            cpu_index,
            debug_stopped,
            stepping,
            pid,
            _cpu: std::marker::PhantomData,
        }
    }

    fn with_cpu<R>(&self, f: impl FnOnce(&C) -> R) -> Option<R> {
        let bus = self.bus.lock().expect("bus mutex poisoned");
        bus.component(self.cpu_index).and_then(|d| d.as_any().downcast_ref::<C>()).map(f)
    }

    fn with_cpu_mut<R>(&mut self, f: impl FnOnce(&mut C) -> R) -> Option<R> {
        let mut bus = self.bus.lock().expect("bus mutex poisoned");
        bus.component_mut(self.cpu_index).and_then(|d| d.as_any_mut().downcast_mut::<C>()).map(f)
    }
}

impl<C: CpuIntrospect + Send + 'static> DebugTarget for BusDebugAdapter<C> {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn is_stopped(&self) -> bool {
        self.debug_stopped.load(Ordering::Acquire)
    }

    fn handle_signal(&mut self, _sig: u8) {
        self.debug_stopped.store(true, Ordering::Release);
    }

    fn current_pid(&self) -> u32 {
        self.pid
    }

    fn ptr_size(&self) -> u32 {
        2 // both reference systems address memory with a 16-bit bus
    }

    fn register_count(&self) -> usize {
        C::register_count()
    }

    fn register_info(&self, n: usize) -> Option<RegisterInfo> {
        C::register_info(n)
    }

    fn read_register(&self, name: &str) -> Option<u64> {
        self.with_cpu(|cpu| cpu.read_register(name)).flatten()
    }

    fn write_register(&mut self, name: &str, value: u64) -> bool {
        self.with_cpu_mut(|cpu| cpu.write_register(name, value)).unwrap_or(false)
    }

    fn read_memory(&mut self, addr: u64, len: usize) -> Option<Vec<u8>> {
        let mut bus = self.bus.lock().expect("bus mutex poisoned");
        let mut out = Vec::with_capacity(len);
        for offset in 0..len as u32 {
            match bus.read::<u8>((addr as u32).wrapping_add(offset)) {
                Ok(byte) => out.push(byte),
                Err(_) => break,
            }
        }
        if out.is_empty() && len > 0 {
            None
        } else {
            Some(out)
        }
    }

    fn write_memory(&mut self, addr: u64, bytes: &[u8]) -> bool {
        let mut bus = self.bus.lock().expect("bus mutex poisoned");
        for (i, byte) in bytes.iter().enumerate() {
            if bus.write::<u8>((addr as u32).wrapping_add(i as u32), *byte).is_err() {
                return false;
            }
        }
        true
    }

    fn step_cpu(&mut self, n: u32, on_complete: Box<dyn FnOnce() + Send>) {
        self.stepping.lock().expect("step-arming mutex poisoned").arm(n, on_complete);
        self.debug_stopped.store(false, Ordering::Release);
    }

    fn run_cpu(&mut self) {
        self.stepping.lock().expect("step-arming mutex poisoned").disarm();
        self.debug_stopped.store(false, Ordering::Release);
    }

    fn shutdown_cpu(&mut self) {
        self.debug_stopped.store(true, Ordering::Release);
    }

    fn notify(&mut self, kind: NotifyKind) {
        match kind {
            NotifyKind::CpuStep => {
                if self.stepping.lock().expect("step-arming mutex poisoned").on_step() {
                    self.debug_stopped.store(true, Ordering::Release);
                }
            }
        }
    }
}

/// GameBoy memory map constants (DMG, ROM-only cartridges — mappers beyond
/// ROM-only are an explicit non-goal).
pub mod gameboy_map {
    pub const ROM_BANK0: (u32, u32) = (0x0000, 0x3FFF);
    pub const ROM_BANK1: (u32, u32) = (0x4000, 0x7FFF);
    pub const VRAM: (u32, u32) = (0x8000, 0x9FFF);
    pub const CART_RAM: (u32, u32) = (0xA000, 0xBFFF);
    pub const WRAM: (u32, u32) = (0xC000, 0xDFFF);
    pub const ECHO_RAM: (u32, u32) = (0xE000, 0xFDFF);
    pub const OAM: (u32, u32) = (0xFE00, 0xFE9F);
    pub const CPU_IO_LOW: (u32, u32) = (0xFF00, 0xFF3F);
    pub const HRAM: (u32, u32) = (0xFF80, 0xFFFE);
    pub const CPU_IO_HIGH: (u32, u32) = (0xFF50, 0xFF6F);
    pub const BOOT_ROM: (u32, u32) = (0x0000, 0x00FF);
}

const GAMEBOY_TICK_HZ: u32 = 4_194_304; // one tick per T-cycle, per §4.3
const CHIP8_TICK_HZ: u32 = 500; // one instruction per tick, a typical reference clock

/// Assembles a complete GameBoy system: ROM bank 0/1, VRAM, cartridge RAM,
/// echo-mirrored WRAM, OAM, HRAM, the CPU's I/O windows, and — if
/// `boot_rom` is given — a boot ROM shadowing bank 0 until the CPU's
/// `0xFF50` side channel unmaps it (§4.3's "ROM loading" paragraph).
pub fn wire_gameboy(rom: &[u8], boot_rom: Option<&[u8]>) -> System {
    let mut bus = Bus::new();

    let mut bank0 = MemoryBlock::read_only(vec![0; 0x4000]);
    bank0.load(&rom[..rom.len().min(0x4000)]);
    let bank0_idx = bus.add_component("rom_bank0", Box::new(bank0));
    bus.register_address_range(bank0_idx, gameboy_map::ROM_BANK0.0, gameboy_map::ROM_BANK0.1).unwrap();

    let mut bank1 = MemoryBlock::read_only(vec![0; 0x4000]);
    if rom.len() > 0x4000 {
        bank1.load(&rom[0x4000..]);
    }
    let bank1_idx = bus.add_component("rom_bank1", Box::new(bank1));
    bus.register_address_range(bank1_idx, gameboy_map::ROM_BANK1.0, gameboy_map::ROM_BANK1.1).unwrap();

    let vram_idx = bus.add_component("vram", Box::new(MemoryBlock::read_write(0x2000)));
    bus.register_address_range(vram_idx, gameboy_map::VRAM.0, gameboy_map::VRAM.1).unwrap();

    let cart_ram_idx = bus.add_component("cart_ram", Box::new(MemoryBlock::read_write(0x2000)));
    bus.register_address_range(cart_ram_idx, gameboy_map::CART_RAM.0, gameboy_map::CART_RAM.1).unwrap();

    let wram = MultiMappedMemory::new(0x2000, vec![gameboy_map::WRAM, gameboy_map::ECHO_RAM]);
    let wram_idx = bus.add_component("wram", Box::new(wram));
    bus.register_address_range(wram_idx, gameboy_map::WRAM.0, gameboy_map::WRAM.1).unwrap();
    bus.register_address_range(wram_idx, gameboy_map::ECHO_RAM.0, gameboy_map::ECHO_RAM.1).unwrap();

    let oam_idx = bus.add_component("oam", Box::new(MemoryBlock::read_write(0xA0)));
    bus.register_address_range(oam_idx, gameboy_map::OAM.0, gameboy_map::OAM.1).unwrap();

    let hram_idx = bus.add_component("hram", Box::new(MemoryBlock::read_write(0x7F)));
    bus.register_address_range(hram_idx, gameboy_map::HRAM.0, gameboy_map::HRAM.1).unwrap();

    let display_idx = bus.add_component("display", Box::new(Display::new(160, 144)));
    let input_idx = bus.add_component("input", Box::new(Input::new()));

    let cpu_idx = bus.add_component("cpu", Box::new(GameboyCpu::new()));
    bus.register_address_range(cpu_idx, gameboy_map::CPU_IO_LOW.0, gameboy_map::CPU_IO_LOW.1).unwrap();
    bus.register_address_range(cpu_idx, gameboy_map::CPU_IO_HIGH.0, gameboy_map::CPU_IO_HIGH.1).unwrap();

    // The boot ROM, if present, must be the *last*-registered component so
    // that `Bus::remove_component` (triggered by the CPU's 0xFF50 side
    // channel) never shifts any other component's slot index.
    if let Some(boot_rom) = boot_rom {
        let mut boot = MemoryBlock::read_only(vec![0; gameboy_map::BOOT_ROM.1 as usize + 1]);
        boot.load(boot_rom);
        let boot_idx = bus.add_component("boot_rom", Box::new(boot));
        bus.register_address_range(boot_idx, gameboy_map::BOOT_ROM.0, gameboy_map::BOOT_ROM.1).unwrap();
        if let Some(cpu) = bus.component_mut(cpu_idx).and_then(|d| d.as_any_mut().downcast_mut::<GameboyCpu>()) {
            cpu.set_boot_rom_slot(boot_idx);
        }
    }

    let _ = (display_idx, input_idx);
    System::new("gameboy", GAMEBOY_TICK_HZ, bus)
}

/// Assembles a complete Chip8 system: 4 KiB RAM (font set pre-loaded at
/// `0x000`, the cartridge at `0x200`), a 64x32 display and a 16-key input
/// pad, wired to the CPU by slot index the same way the GameBoy CPU's
/// boot-ROM-disable channel is wired.
pub fn wire_chip8(rom: &[u8]) -> System {
    use crate::cpu::chip8::{FONT_BASE, FONT_SET, PROGRAM_START};

    let mut bus = Bus::new();

    let mut ram = MemoryBlock::read_write(0x1000);
    ram.load(&{
        let mut image = vec![0u8; 0x1000];
        image[FONT_BASE as usize..FONT_BASE as usize + FONT_SET.len()].copy_from_slice(&FONT_SET);
        let start = PROGRAM_START as usize;
        let end = (start + rom.len()).min(image.len());
        image[start..end].copy_from_slice(&rom[..end - start]);
        image
    });
    let ram_idx = bus.add_component("ram", Box::new(ram));
    bus.register_address_range(ram_idx, 0x000, 0xFFF).unwrap();

    let display_idx = bus.add_component("display", Box::new(Display::new(64, 32)));
    let input_idx = bus.add_component("input", Box::new(Input::new()));
    for key in 0..16u32 {
        if let Some(input) = bus.component_mut(input_idx).and_then(|d| d.as_any_mut().downcast_mut::<Input>()) {
            input.register_key(key);
        }
    }

    let cpu_idx = bus.add_component("cpu", Box::new(Chip8Cpu::new(CHIP8_TICK_HZ)));
    if let Some(cpu) = bus.component_mut(cpu_idx).and_then(|d| d.as_any_mut().downcast_mut::<Chip8Cpu>()) {
        cpu.set_display_slot(display_idx);
        cpu.set_input_slot(input_idx);
    }

    System::new("chip8", CHIP8_TICK_HZ, bus)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::GameboyCpu;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn gameboy_wiring_maps_every_window_without_overlap() {
        let system = wire_gameboy(&[0u8; 0x8000], None);
        let bus = system.bus_handle();
        let mut bus = bus.lock().unwrap();
        assert_eq!(bus.read::<u8>(0x0000).unwrap(), 0);
        assert_eq!(bus.read::<u8>(gameboy_map::VRAM.0).unwrap(), 0);
        bus.write::<u8>(gameboy_map::WRAM.0, 0x42).unwrap();
        assert_eq!(bus.read::<u8>(gameboy_map::ECHO_RAM.0).unwrap(), 0x42);
    }

    #[test]
    fn chip8_wiring_preloads_font_set_below_the_program() {
        let system = wire_chip8(&[0x12, 0x34]);
        let bus = system.bus_handle();
        let mut bus = bus.lock().unwrap();
        assert_eq!(bus.read::<u8>(0x000).unwrap(), 0xF0);
        assert_eq!(bus.read::<u8>(0x200).unwrap(), 0x12);
    }

    #[test]
    fn runner_ticks_until_stopping_then_halts() {
        let system = wire_gameboy(&[0u8; 0x8000], None);
        let status = system.status_handle();
        let debug_stopped = system.debug_stopped_handle();
        let bus = system.bus_handle();

        status.store(SystemStatus::Stopping as u8, Ordering::SeqCst);
        Runner::run(&status, &debug_stopped, &bus, 1_000_000);
        assert_eq!(SystemStatus::from_u8(status.load(Ordering::SeqCst)), SystemStatus::Halted);
    }

    #[test]
    fn debug_adapter_step_arming_stops_after_n_instruction_boundaries() {
        let mut bus = Bus::new();
        let ram = bus.add_component("ram", Box::new(MemoryBlock::read_write(0xFF00)));
        bus.register_address_range(ram, 0x0000, 0xFEFF).unwrap();
        let cpu_idx = bus.add_component("cpu", Box::new(GameboyCpu::new()));
        bus.register_address_range(cpu_idx, 0xFF00, 0xFF3F).unwrap();
        bus.register_address_range(cpu_idx, 0xFF50, 0xFF6F).unwrap();
        let bus = Arc::new(Mutex::new(bus));
        let debug_stopped = Arc::new(AtomicBool::new(false));

        let mut adapter = BusDebugAdapter::<GameboyCpu>::new("gameboy", bus.clone(), cpu_idx, debug_stopped.clone(), 1);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        adapter.step_cpu(2, Box::new(move || { fired2.fetch_add(1, Ordering::SeqCst); }));

        for _ in 0..8 {
            bus.lock().unwrap().receive_tick();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(debug_stopped.load(Ordering::SeqCst));
    }

    #[test]
    fn null_frontend_logs_and_returns_empty_dialog_path() {
        let f = NullFrontend::new(Arc::new(AtomicU8::new(SystemStatus::Halted as u8)));
        assert_eq!(f.open_file_dialog(), "");
        f.log("test message");
    }

    #[test]
    fn null_frontend_restart_system_halts_then_runs_reload() {
        let status = Arc::new(AtomicU8::new(SystemStatus::Running as u8));
        let f = NullFrontend::new(status.clone());
        let reloaded = Arc::new(AtomicBool::new(false));
        let reloaded2 = reloaded.clone();

        let status_for_runner = status.clone();
        let runner = std::thread::spawn(move || {
            loop {
                match SystemStatus::from_u8(status_for_runner.load(Ordering::Acquire)) {
                    SystemStatus::Running => std::thread::sleep(Duration::from_millis(1)),
                    SystemStatus::Stopping => {
                        status_for_runner.store(SystemStatus::Halted as u8, Ordering::Release);
                        break;
                    }
                    SystemStatus::Halted => break,
                }
            }
        });
        // Give the runner thread a moment to start observing `status`.
        std::thread::sleep(Duration::from_millis(5));

        f.restart_system(Box::new(move || {
            reloaded2.store(true, Ordering::SeqCst);
        }));
        runner.join().unwrap();

        assert!(reloaded.load(Ordering::SeqCst));
        assert_eq!(SystemStatus::from_u8(status.load(Ordering::Acquire)), SystemStatus::Halted);
    }
}
