//! The per-system adapter a remote-debug server drives (§4.7). Each
//! emulated system (GameBoy, Chip8) implements `DebugTarget` over its own
//! CPU/bus state; the debug-server crate never reaches into CPU internals
//! directly.

/// What a register index/number most commonly maps to in a remote
/// debugger's UI. `None` means "no generic role" (e.g. a raw CB-prefixed
/// flag byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenericRole {
    Pc,
    Sp,
    Fp,
    Ra,
    Flags,
    Arg1,
    Arg2,
    Arg3,
    Arg4,
    Arg5,
    Arg6,
    Arg7,
    Arg8,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Uint,
    Sint,
    Ieee754,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Binary,
    Decimal,
    Float,
    Hex,
}

/// Per-register metadata a remote debugger needs to render and edit a
/// register, mirroring `qRegisterInfo`'s reply fields.
#[derive(Debug, Clone)]
pub struct RegisterInfo {
    pub name: String,
    pub alt_name: Option<String>,
    pub generic: GenericRole,
    pub encoding: Encoding,
    pub format: Format,
    pub bit_size: u32,
    pub offset: u32,
    pub group: String,
}

impl RegisterInfo {
    /// Renders the `name:…;alt-name:…;bitsize:…;offset:…;encoding:…;format:…;set:…[;generic:…]`
    /// string form the wire protocol expects.
    pub fn to_reply_string(&self) -> String {
        let mut out = format!(
            "name:{};bitsize:{};offset:{};encoding:{};format:{};set:{}",
            self.name,
            self.bit_size,
            self.offset,
            encoding_str(self.encoding),
            format_str(self.format),
            self.group,
        );
        if let Some(alt) = &self.alt_name {
            out = format!("name:{};alt-name:{};bitsize:{};offset:{};encoding:{};format:{};set:{}",
                self.name, alt, self.bit_size, self.offset,
                encoding_str(self.encoding), format_str(self.format), self.group);
        }
        if let Some(g) = generic_str(self.generic) {
            out.push_str(";generic:");
            out.push_str(g);
        }
        out
    }
}

fn encoding_str(e: Encoding) -> &'static str {
    match e {
        Encoding::Uint => "uint",
        Encoding::Sint => "sint",
        Encoding::Ieee754 => "ieee754",
    }
}

fn format_str(f: Format) -> &'static str {
    match f {
        Format::Binary => "binary",
        Format::Decimal => "decimal",
        Format::Float => "float",
        Format::Hex => "hex",
    }
}

fn generic_str(g: GenericRole) -> Option<&'static str> {
    Some(match g {
        GenericRole::Pc => "pc",
        GenericRole::Sp => "sp",
        GenericRole::Fp => "fp",
        GenericRole::Ra => "ra",
        GenericRole::Flags => "flags",
        GenericRole::Arg1 => "arg1",
        GenericRole::Arg2 => "arg2",
        GenericRole::Arg3 => "arg3",
        GenericRole::Arg4 => "arg4",
        GenericRole::Arg5 => "arg5",
        GenericRole::Arg6 => "arg6",
        GenericRole::Arg7 => "arg7",
        GenericRole::Arg8 => "arg8",
        GenericRole::None => return None,
    })
}

/// What the CPU reports to the debug interface at each instruction
/// boundary; `notify` is the sole channel a CPU uses to talk to the
/// debugger (§4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyKind {
    CpuStep,
}

/// The uniform surface a remote-debug server drives (§4.7). Implemented
/// once per emulated system; the server never needs to know whether it is
/// talking to a GameBoy or a Chip8.
pub trait DebugTarget: Send {
    fn name(&self) -> String;

    fn is_stopped(&self) -> bool;
    fn handle_signal(&mut self, sig: u8);

    fn current_pid(&self) -> u32;
    fn ptr_size(&self) -> u32;

    fn register_count(&self) -> usize;
    fn register_info(&self, n: usize) -> Option<RegisterInfo>;

    fn read_register(&self, name: &str) -> Option<u64>;
    fn write_register(&mut self, name: &str, value: u64) -> bool;

    /// Reads up to `len` bytes starting at `addr`. On partial failure
    /// (e.g. the range straddles mapped/unmapped memory), returns the
    /// prefix that *did* read successfully; `None` only on complete
    /// failure (nothing at all could be read).
    fn read_memory(&mut self, addr: u64, len: usize) -> Option<Vec<u8>>;

    fn write_memory(&mut self, addr: u64, bytes: &[u8]) -> bool;

    /// Arms single-step mode: stop again after `n` instruction boundaries.
    fn step_cpu(&mut self, n: u32, on_complete: Box<dyn FnOnce() + Send>);

    fn run_cpu(&mut self);
    fn shutdown_cpu(&mut self);

    /// The CPU's sole notification channel to the debugger; called with
    /// `CpuStep` at every instruction boundary.
    fn notify(&mut self, kind: NotifyKind);
}

/// Shared bookkeeping every `DebugTarget` impl reuses for single-step
/// arming, since the "after N steps, call back and stop" behavior is
/// identical across GameBoy and Chip8.
#[derive(Default)]
pub struct StepArming {
    remaining: Option<u32>,
    on_complete: Option<Box<dyn FnOnce() + Send>>,
}

impl StepArming {
    pub fn arm(&mut self, n: u32, on_complete: Box<dyn FnOnce() + Send>) {
        self.remaining = Some(n.max(1));
        self.on_complete = Some(on_complete);
    }

    pub fn disarm(&mut self) {
        self.remaining = None;
        self.on_complete = None;
    }

    /// Call on every `NotifyKind::CpuStep`. Returns true if this step
    /// completed the arm (the caller should then stop and fire the
    /// callback, which this also does).
    pub fn on_step(&mut self) -> bool {
        match &mut self.remaining {
            Some(n) => {
                *n -= 1;
                if *n == 0 {
                    self.remaining = None;
                    if let Some(cb) = self.on_complete.take() {
                        cb();
                    }
                    true
                } else {
                    false
                }
            }
            None => false,
        }
    }
}

/// What a concrete CPU exposes about its own register file and fault state,
/// independent of how a `DebugTarget` wraps it onto a shared bus. GameBoy and
/// Chip8 each implement this once; `system::BusDebugAdapter` is generic over
/// it so the remote-debug server code is written exactly once.
pub trait CpuIntrospect {
    fn register_count() -> usize
    where
        Self: Sized;

    fn register_info(n: usize) -> Option<RegisterInfo>
    where
        Self: Sized;

    fn read_register(&self, name: &str) -> Option<u64>;
    fn write_register(&mut self, name: &str, value: u64) -> bool;

    fn is_halted(&self) -> bool;
    fn take_fault(&mut self) -> Option<crate::BusError>;

    /// Installs the callback the CPU fires at every instruction boundary —
    /// the sole channel back to whatever `DebugTarget` is watching it. The
    /// CPU itself never depends on the `DebugTarget` trait; this keeps the
    /// dependency one-directional (debug adapter -> CPU, never the reverse).
    fn set_step_notify(&mut self, cb: Box<dyn FnMut() + Send>);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_info_renders_generic_suffix_only_when_present() {
        let info = RegisterInfo {
            name: "pc".into(),
            alt_name: None,
            generic: GenericRole::Pc,
            encoding: Encoding::Uint,
            format: Format::Hex,
            bit_size: 16,
            offset: 10,
            group: "gameboy".into(),
        };
        let s = info.to_reply_string();
        assert!(s.contains("name:pc"));
        assert!(s.contains("generic:pc"));

        let info2 = RegisterInfo { generic: GenericRole::None, ..info };
        assert!(!info2.to_reply_string().contains("generic:"));
    }

    #[test]
    fn step_arming_fires_exactly_on_the_nth_step() {
        let mut arming = StepArming::default();
        let fired = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let fired2 = fired.clone();
        arming.arm(3, Box::new(move || fired2.store(true, std::sync::atomic::Ordering::SeqCst)));

        assert!(!arming.on_step());
        assert!(!arming.on_step());
        assert!(arming.on_step());
        assert!(fired.load(std::sync::atomic::Ordering::SeqCst));
    }
}
