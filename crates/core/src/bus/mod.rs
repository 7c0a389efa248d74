use crate::{Access, BusError, BusResult, ComponentKind};

/// A non-overlapping `[start, end]` extent owned by one component, indexed
/// by that component's slot in `Bus::components`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct AddressRange {
    start: u32,
    end: u32,
    owner: usize,
}

impl AddressRange {
    fn overlaps(&self, other: &AddressRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    fn contains(&self, addr: u32) -> bool {
        addr >= self.start && addr <= self.end
    }
}

/// A single bus participant together with the name it was registered under.
/// The name is what a `System` looks components up by and what bus faults
/// report as the offending/owning component.
struct ComponentSlot {
    name: String,
    device: Box<dyn BusDevice>,
}

type WatchCallback = Box<dyn FnMut(u32, bool) + Send>;

/// The shared interconnect. Owns every component and mediates all
/// component-to-component memory access, exactly as in the original engine's
/// `Bus` class: components never hold a pointer to each other, only to the
/// bus, and the bus routes by address range.
#[derive(Default)]
pub struct Bus {
    components: Vec<ComponentSlot>,
    ranges: Vec<AddressRange>,
    watchpoints: Vec<u32>,
    watch_callback: Option<WatchCallback>,
}

impl std::fmt::Debug for Bus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bus")
            .field("components", &self.components.iter().map(|c| &c.name).collect::<Vec<_>>())
            .field("ranges", &self.ranges)
            .field("watchpoints", &self.watchpoints)
            .finish()
    }
}

impl Bus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a component under `name`, returning its slot index. Registering
    /// an address range for it is a separate step (`register_address_range`)
    /// so that a component's constructor need not know its own slot index.
    pub fn add_component(&mut self, name: impl Into<String>, device: Box<dyn BusDevice>) -> usize {
        self.components.push(ComponentSlot {
            name: name.into(),
            device,
        });
        self.components.len() - 1
    }

    pub fn component_index(&self, name: &str) -> Option<usize> {
        self.components.iter().position(|c| c.name == name)
    }

    pub fn component_name(&self, index: usize) -> Option<&str> {
        self.components.get(index).map(|c| c.name.as_str())
    }

    pub fn component(&self, index: usize) -> Option<&dyn BusDevice> {
        self.components.get(index).map(|c| c.device.as_ref())
    }

    pub fn component_mut(&mut self, index: usize) -> Option<&mut (dyn BusDevice + 'static)> {
        self.components.get_mut(index).map(|c| c.device.as_mut())
    }

    pub fn component_by_type(&self, kind: ComponentKind) -> Vec<usize> {
        self.components
            .iter()
            .enumerate()
            .filter(|(_, c)| c.device.kind() == kind)
            .map(|(i, _)| i)
            .collect()
    }

    /// Removes a component and every address range it owns. Used by the
    /// GameBoy CPU's boot-ROM-disable side channel.
    pub fn remove_component(&mut self, index: usize) -> Option<Box<dyn BusDevice>> {
        if index >= self.components.len() {
            return None;
        }
        self.ranges.retain(|r| r.owner != index);
        let slot = self.components.remove(index);
        // Shift owner indices above the removed slot down by one.
        for r in &mut self.ranges {
            if r.owner > index {
                r.owner -= 1;
            }
        }
        Some(slot.device)
    }

    /// Registers `[start, end]` (inclusive) for `owner`. Rejected if either
    /// endpoint of the new range falls within the extent of any existing
    /// range, matching `Bus::RegisterComponentAddressRange` in the original.
    pub fn register_address_range(&mut self, owner: usize, start: u32, end: u32) -> BusResult<()> {
        let candidate = AddressRange { start, end, owner };
        for existing in &self.ranges {
            if existing.overlaps(&candidate) {
                tracing::warn!(
                    start = format!("{:#06x}", start),
                    end = format!("{:#06x}", end),
                    "address range registration rejected: overlaps existing range"
                );
                return Err(BusError::AddressInUse {
                    start,
                    end,
                    owner: self.components[existing.owner].device.kind(),
                });
            }
        }
        self.ranges.push(candidate);
        tracing::debug!(
            component = self.components[owner].name.as_str(),
            start = format!("{:#06x}", start),
            end = format!("{:#06x}", end),
            "address range registered"
        );
        Ok(())
    }

    /// Re-checks against ranges owned by *other* components, then replaces
    /// every range `owner` previously held.
    pub fn update_address_range(&mut self, owner: usize, start: u32, end: u32) -> BusResult<()> {
        let candidate = AddressRange { start, end, owner };
        for existing in &self.ranges {
            if existing.owner != owner && existing.overlaps(&candidate) {
                return Err(BusError::AddressInUse {
                    start,
                    end,
                    owner: self.components[existing.owner].device.kind(),
                });
            }
        }
        self.ranges.retain(|r| r.owner != owner);
        self.ranges.push(candidate);
        Ok(())
    }

    fn range_for(&self, addr: u32) -> Option<&AddressRange> {
        self.ranges.iter().find(|r| r.contains(addr))
    }

    fn fire_watchpoint(&mut self, addr: u32, is_write: bool) {
        if self.watchpoints.contains(&addr) {
            if let Some(cb) = &mut self.watch_callback {
                cb(addr, is_write);
            }
        }
    }

    pub fn add_memory_watchpoint(&mut self, addr: u32) {
        if !self.watchpoints.contains(&addr) {
            self.watchpoints.push(addr);
        }
    }

    pub fn remove_memory_watchpoint(&mut self, addr: u32) {
        self.watchpoints.retain(|&a| a != addr);
    }

    pub fn register_memory_watch_callback(&mut self, cb: WatchCallback) {
        self.watch_callback = Some(cb);
    }

    /// Typed read dispatch. Only the starting address of the access is
    /// checked against watchpoints, and only the first matching range is
    /// consulted — per §9 open question resolution, the original's
    /// behavior is kept rather than widened.
    pub fn read<T: BusValue>(&mut self, addr: u32) -> BusResult<T> {
        self.fire_watchpoint(addr, false);
        match self.range_for(addr) {
            Some(range) if addr + (T::WIDTH - 1) <= range.end => {
                let owner = range.owner;
                let offset = addr - range.start;
                T::read_from(self.components[owner].device.as_ref(), offset)
            }
            _ => {
                tracing::warn!(addr = format!("{:#06x}", addr), "read from unmapped address");
                Err(BusError::InvalidAddress {
                    addr,
                    access: Access::Read,
                })
            }
        }
    }

    pub fn write<T: BusValue>(&mut self, addr: u32, value: T) -> BusResult<()> {
        self.fire_watchpoint(addr, true);
        match self.range_for(addr) {
            Some(range) if addr + (T::WIDTH - 1) <= range.end => {
                let owner = range.owner;
                let offset = addr - range.start;
                T::write_to(self.components[owner].device.as_mut(), offset, value)
            }
            _ => {
                tracing::warn!(addr = format!("{:#06x}", addr), "write to unmapped address");
                Err(BusError::InvalidAddress {
                    addr,
                    access: Access::Write,
                })
            }
        }
    }

    /// Fans `on_tick` out to every component in registration order. Uses
    /// `mem::take` to detach `components` from `self` for the duration of
    /// the loop, so each device can borrow `self` (the bus, now temporarily
    /// empty of devices) mutably to perform its own bus accesses.
    pub fn receive_tick(&mut self) {
        let mut components = std::mem::take(&mut self.components);
        for slot in &mut components {
            slot.device.on_tick(self);
        }
        self.components = components;
    }

    pub fn power_on(&mut self) {
        let mut components = std::mem::take(&mut self.components);
        for slot in &mut components {
            slot.device.power_on();
        }
        self.components = components;
    }

    pub fn power_off(&mut self) {
        let mut components = std::mem::take(&mut self.components);
        for slot in &mut components {
            slot.device.power_off();
        }
        self.components = components;
    }

    pub fn log_stacktrace(&self) {
        for slot in &self.components {
            slot.device.log_stacktrace();
        }
    }
}

/// Maps a Rust numeric type onto the typed read/write methods a
/// `BusDevice` exposes, so `Bus::read`/`Bus::write` can stay generic the
/// way the original's templated `Read<T>`/`Write<T>` were.
pub trait BusValue: Copy {
    const WIDTH: u32;
    fn read_from(dev: &dyn BusDevice, offset: u32) -> BusResult<Self>;
    fn write_to(dev: &mut dyn BusDevice, offset: u32, value: Self) -> BusResult<()>;
}

macro_rules! impl_bus_value {
    ($ty:ty, $width:expr, $read:ident, $write:ident) => {
        impl BusValue for $ty {
            const WIDTH: u32 = $width;
            fn read_from(dev: &dyn BusDevice, offset: u32) -> BusResult<Self> {
                dev.$read(offset)
            }
            fn write_to(dev: &mut dyn BusDevice, offset: u32, value: Self) -> BusResult<()> {
                dev.$write(offset, value)
            }
        }
    };
}

impl_bus_value!(i8, 1, read_i8, write_i8);
impl_bus_value!(u8, 1, read_u8, write_u8);
impl_bus_value!(i16, 2, read_i16, write_i16);
impl_bus_value!(u16, 2, read_u16, write_u16);
impl_bus_value!(i32, 4, read_i32, write_i32);
impl_bus_value!(u32, 4, read_u32, write_u32);
impl_bus_value!(f32, 4, read_f32, write_f32);

/// The contract every bus participant implements. Default methods mirror
/// the original's macro-generated `ReadX`/`WriteX` pairs: any access a
/// component doesn't override fails with `NotImplemented` rather than
/// silently succeeding.
pub trait BusDevice: Send {
    fn kind(&self) -> ComponentKind {
        ComponentKind::Other
    }

    fn read_i8(&self, offset: u32) -> BusResult<i8> {
        self.read_u8(offset).map(|v| v as i8)
    }
    fn write_i8(&mut self, offset: u32, value: i8) -> BusResult<()> {
        self.write_u8(offset, value as u8)
    }

    fn read_u8(&self, _offset: u32) -> BusResult<u8> {
        Err(BusError::NotImplemented { device: "read_u8" })
    }
    fn write_u8(&mut self, _offset: u32, _value: u8) -> BusResult<()> {
        Err(BusError::NotImplemented { device: "write_u8" })
    }

    fn read_i16(&self, offset: u32) -> BusResult<i16> {
        self.read_u16(offset).map(|v| v as i16)
    }
    fn write_i16(&mut self, offset: u32, value: i16) -> BusResult<()> {
        self.write_u16(offset, value as u16)
    }

    fn read_u16(&self, offset: u32) -> BusResult<u16> {
        let lo = self.read_u8(offset)? as u16;
        let hi = self.read_u8(offset + 1)? as u16;
        Ok(lo | (hi << 8))
    }
    fn write_u16(&mut self, offset: u32, value: u16) -> BusResult<()> {
        self.write_u8(offset, (value & 0xFF) as u8)?;
        self.write_u8(offset + 1, (value >> 8) as u8)
    }

    fn read_i32(&self, offset: u32) -> BusResult<i32> {
        self.read_u32(offset).map(|v| v as i32)
    }
    fn write_i32(&mut self, offset: u32, value: i32) -> BusResult<()> {
        self.write_u32(offset, value as u32)
    }

    fn read_u32(&self, offset: u32) -> BusResult<u32> {
        let lo = self.read_u16(offset)? as u32;
        let hi = self.read_u16(offset + 2)? as u32;
        Ok(lo | (hi << 16))
    }
    fn write_u32(&mut self, offset: u32, value: u32) -> BusResult<()> {
        self.write_u16(offset, (value & 0xFFFF) as u16)?;
        self.write_u16(offset + 2, (value >> 16) as u16)
    }

    fn read_f32(&self, offset: u32) -> BusResult<f32> {
        self.read_u32(offset).map(f32::from_bits)
    }
    fn write_f32(&mut self, offset: u32, value: f32) -> BusResult<()> {
        self.write_u32(offset, value.to_bits())
    }

    /// Called once per bus tick, in registration order. Receives the bus
    /// itself so it can perform its own reads/writes/fetches.
    fn on_tick(&mut self, _bus: &mut Bus) {}

    fn power_on(&mut self) {}
    fn power_off(&mut self) {}
    fn log_stacktrace(&self) {}

    /// Lets a debug interface downcast to the concrete CPU type to reach
    /// registers/flags that the generic typed-I/O surface doesn't expose.
    /// Mirrors the teacher's `Peripheral::as_any`. Each concrete device
    /// implements this as `self`; a `Self: Sized` default isn't callable
    /// through the `dyn BusDevice` objects the bus actually stores.
    fn as_any(&self) -> &dyn std::any::Any;
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any;
}

/// Shorthand for the `fn as_any(&self) -> &dyn Any { self }` boilerplate
/// every `BusDevice` impl needs.
macro_rules! impl_as_any {
    () => {
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
        fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
            self
        }
    };
}
pub(crate) use impl_as_any;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBlock;

    #[test]
    fn routes_to_the_owning_component_and_rejects_unmapped_addresses() {
        let mut bus = Bus::new();
        let m1 = bus.add_component("m1", Box::new(MemoryBlock::read_write(0x0400)));
        bus.register_address_range(m1, 0x0000, 0x03FF).unwrap();
        let m2 = bus.add_component("m2", Box::new(MemoryBlock::read_write(0x0100)));
        bus.register_address_range(m2, 0x1000, 0x10FF).unwrap();

        bus.write::<u8>(0x0050, 0x12).unwrap();
        assert_eq!(bus.read::<u8>(0x0050).unwrap(), 0x12);

        assert_eq!(
            bus.read::<u8>(0x0800),
            Err(BusError::InvalidAddress {
                addr: 0x0800,
                access: Access::Read,
            })
        );
    }

    #[test]
    fn rejects_overlapping_registration() {
        let mut bus = Bus::new();
        let m1 = bus.add_component("m1", Box::new(MemoryBlock::read_write(0x0400)));
        bus.register_address_range(m1, 0x0000, 0x03FF).unwrap();
        let m3 = bus.add_component("m3", Box::new(MemoryBlock::read_write(0x0300)));
        assert!(bus.register_address_range(m3, 0x0200, 0x04FF).is_err());
    }

    #[test]
    fn endianness_is_little_endian_across_the_bus() {
        let mut bus = Bus::new();
        let m1 = bus.add_component("m1", Box::new(MemoryBlock::read_write(0x10)));
        bus.register_address_range(m1, 0, 0xF).unwrap();

        bus.write::<u16>(0, 0xCAFE).unwrap();
        assert_eq!(bus.read::<u8>(0).unwrap(), 0xFE);
        assert_eq!(bus.read::<u8>(1).unwrap(), 0xCA);
        assert_eq!(bus.read::<u16>(0).unwrap(), 0xCAFE);
    }

    #[test]
    fn watchpoint_fires_once_on_starting_address_only() {
        let mut bus = Bus::new();
        let m1 = bus.add_component("m1", Box::new(MemoryBlock::read_write(0x10)));
        bus.register_address_range(m1, 0, 0xF).unwrap();
        bus.add_memory_watchpoint(4);

        let hits = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let hits2 = hits.clone();
        bus.register_memory_watch_callback(Box::new(move |addr, _write| {
            assert_eq!(addr, 4);
            hits2.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }));

        bus.write::<u8>(4, 1).unwrap();
        bus.read::<u8>(5).unwrap();
        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
