pub mod bus;
pub mod cpu;
pub mod debug;
pub mod display;
pub mod input;
pub mod memory;
pub mod system;
pub mod timer;

/// Typed error surface for every bus/CPU fault the core can raise.
///
/// Each variant corresponds to one of the abstract error kinds the
/// component contract defines; `Display` messages are written to read
/// well from a `tracing::error!` call site.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BusError {
    #[error("no component owns address {addr:#06x} ({access})")]
    InvalidAddress { addr: u32, access: Access },

    #[error("address range {start:#06x}-{end:#06x} overlaps an existing registration owned by {owner:?}")]
    AddressInUse {
        start: u32,
        end: u32,
        owner: ComponentKind,
    },

    #[error("write to read-only memory at {addr:#06x}")]
    ReadOnlyViolation { addr: u32 },

    #[error("{device} does not implement this access")]
    NotImplemented { device: &'static str },

    #[error("position ({x}, {y}) is outside the {width}x{height} display")]
    OutOfRange {
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    },

    #[error("unrecognized opcode {opcode:#04x} at pc {pc:#06x}")]
    UnknownOpcode { opcode: u8, pc: u16 },

    #[error("microcode queue overflow ({depth} steps already pending)")]
    StackOverflow { depth: usize },

    #[error("malformed debug packet: {0}")]
    ProtocolError(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

impl std::fmt::Display for Access {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Access::Read => write!(f, "read"),
            Access::Write => write!(f, "write"),
        }
    }
}

pub type BusResult<T> = Result<T, BusError>;

/// The tag every bus participant carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComponentKind {
    Cpu,
    Memory,
    Display,
    Input,
    Sound,
    Timer,
    Other,
}

/// System-wide run status, shared across the system thread and anything
/// observing it (the debug server, a future front-end).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SystemStatus {
    Running = 0,
    Stopping = 1,
    Halted = 2,
}

impl SystemStatus {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => SystemStatus::Running,
            1 => SystemStatus::Stopping,
            _ => SystemStatus::Halted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_bus_error_variant_displays_a_nonempty_single_line_message() {
        let variants = [
            BusError::InvalidAddress { addr: 0x1234, access: Access::Read },
            BusError::AddressInUse { start: 0x1000, end: 0x10ff, owner: ComponentKind::Memory },
            BusError::ReadOnlyViolation { addr: 0x4000 },
            BusError::NotImplemented { device: "read_u8" },
            BusError::OutOfRange { x: 64, y: 32, width: 64, height: 32 },
            BusError::UnknownOpcode { opcode: 0xfc, pc: 0xc000 },
            BusError::StackOverflow { depth: 32 },
            BusError::ProtocolError("bad checksum".to_string()),
        ];

        for variant in variants {
            let message = variant.to_string();
            assert!(!message.is_empty(), "{variant:?} produced an empty Display message");
            assert!(
                !message.contains('\n'),
                "{variant:?} produced a multi-line Display message: {message:?}"
            );
        }
    }
}
