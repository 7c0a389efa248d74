use crate::bus::BusDevice;
use crate::{BusError, BusResult, ComponentKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryMode {
    ReadWrite,
    ReadOnly,
}

/// A fixed-size byte-addressable block, RW or RO. Multi-byte accesses are
/// little-endian, satisfied by `BusDevice`'s default 16/32-bit composition
/// over `read_u8`/`write_u8`.
#[derive(Debug)]
pub struct MemoryBlock {
    mode: MemoryMode,
    data: Vec<u8>,
    /// Set while an alternate buffer has been swapped in via
    /// `overwrite_context`; holds the original bytes to bring back on
    /// `restore_context`.
    shelved: Option<Vec<u8>>,
}

impl MemoryBlock {
    pub fn read_write(size: usize) -> Self {
        Self {
            mode: MemoryMode::ReadWrite,
            data: vec![0; size],
            shelved: None,
        }
    }

    pub fn read_only(data: Vec<u8>) -> Self {
        Self {
            mode: MemoryMode::ReadOnly,
            data,
            shelved: None,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Copies `src` into the block starting at byte 0, truncating at the
    /// block's own length.
    pub fn load(&mut self, src: &[u8]) {
        let n = src.len().min(self.data.len());
        self.data[..n].copy_from_slice(&src[..n]);
    }

    /// Swaps the backing storage for `alt` (which must be the same length),
    /// shelving the previous contents. Used to let a boot ROM shadow
    /// cartridge bank 0 without re-registering bus ranges.
    pub fn overwrite_context(&mut self, alt: Vec<u8>) {
        debug_assert_eq!(alt.len(), self.data.len());
        let previous = std::mem::replace(&mut self.data, alt);
        self.shelved = Some(previous);
    }

    /// Restores whatever was shelved by the last `overwrite_context`. A
    /// no-op if no context is currently swapped.
    pub fn restore_context(&mut self) {
        if let Some(previous) = self.shelved.take() {
            self.data = previous;
        }
    }
}

impl BusDevice for MemoryBlock {
    crate::bus::impl_as_any!();

    fn kind(&self) -> ComponentKind {
        ComponentKind::Memory
    }

    fn read_u8(&self, offset: u32) -> BusResult<u8> {
        Ok(self.data[offset as usize])
    }

    fn write_u8(&mut self, offset: u32, value: u8) -> BusResult<()> {
        match self.mode {
            MemoryMode::ReadWrite => {
                self.data[offset as usize] = value;
                Ok(())
            }
            MemoryMode::ReadOnly => Err(BusError::ReadOnlyViolation { addr: offset }),
        }
    }
}

/// Same storage mapped at several disjoint bus windows; a write through any
/// alias is visible through all of them. Each alias is registered as its
/// own address range against the *same* component slot, so `Bus::read`
/// always normalizes by whichever alias matched.
#[derive(Debug)]
pub struct MultiMappedMemory {
    mode: MemoryMode,
    data: Vec<u8>,
    aliases: Vec<(u32, u32)>,
}

impl MultiMappedMemory {
    pub fn new(size: usize, aliases: Vec<(u32, u32)>) -> Self {
        Self {
            mode: MemoryMode::ReadWrite,
            data: vec![0; size],
            aliases,
        }
    }

    pub fn aliases(&self) -> &[(u32, u32)] {
        &self.aliases
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl BusDevice for MultiMappedMemory {
    crate::bus::impl_as_any!();

    fn kind(&self) -> ComponentKind {
        ComponentKind::Memory
    }

    // The bus subtracts whichever alias's base matched, so `offset` here is
    // already normalized relative to *some* alias; since every alias maps
    // onto the same underlying storage, no further translation is needed.
    fn read_u8(&self, offset: u32) -> BusResult<u8> {
        Ok(self.data[offset as usize % self.data.len()])
    }

    fn write_u8(&mut self, offset: u32, value: u8) -> BusResult<()> {
        match self.mode {
            MemoryMode::ReadWrite => {
                let len = self.data.len();
                self.data[offset as usize % len] = value;
                Ok(())
            }
            MemoryMode::ReadOnly => Err(BusError::ReadOnlyViolation { addr: offset }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Bus;

    #[test]
    fn read_only_memory_rejects_writes_and_keeps_its_value() {
        let mut bus = Bus::new();
        let mut block = MemoryBlock::read_only(vec![0; 16]);
        block.load(&[0xAA]);
        let idx = bus.add_component("rom", Box::new(block));
        bus.register_address_range(idx, 0, 0xF).unwrap();

        assert!(bus.write::<u8>(0, 0x11).is_err());
        assert_eq!(bus.read::<u8>(0).unwrap(), 0xAA);
    }

    #[test]
    fn multi_mapped_aliases_share_one_storage() {
        let mut bus = Bus::new();
        let mem = MultiMappedMemory::new(0x2000, vec![(0xC000, 0xDFFF), (0xE000, 0xFDFF)]);
        let idx = bus.add_component("wram", Box::new(mem));
        bus.register_address_range(idx, 0xC000, 0xDFFF).unwrap();
        bus.register_address_range(idx, 0xE000, 0xFDFF).unwrap();

        bus.write::<u8>(0xC050, 0xDE).unwrap();
        assert_eq!(bus.read::<u8>(0xE050).unwrap(), 0xDE);
        bus.write::<u8>(0xE051, 0xAD).unwrap();
        assert_eq!(bus.read::<u8>(0xC051).unwrap(), 0xAD);
    }

    #[test]
    fn context_swap_and_restore_round_trips() {
        let mut block = MemoryBlock::read_write(4);
        block.load(&[1, 2, 3, 4]);
        block.overwrite_context(vec![9, 9, 9, 9]);
        assert_eq!(block.read_u8(0).unwrap(), 9);
        block.restore_context();
        assert_eq!(block.read_u8(0).unwrap(), 1);
    }
}
