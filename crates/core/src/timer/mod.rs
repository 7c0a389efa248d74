use crate::bus::{Bus, BusDevice};
use crate::{BusResult, ComponentKind};

/// A down-counter that fires a completion callback and reloads, mirroring
/// the original engine's `Timer` component. Not to be confused with the
/// GameBoy's own DIV/TIMA registers, which the GameBoy CPU owns directly as
/// part of its I/O window (§4.3); this is the generic bus-level timer used
/// by both reference systems for coarser scheduling (e.g. Chip8's 60Hz
/// delay/sound counters).
pub struct Timer {
    counter: u32,
    start_value: u32,
    on_complete: Option<Box<dyn FnMut() + Send>>,
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer")
            .field("counter", &self.counter)
            .field("start_value", &self.start_value)
            .field("on_complete", &self.on_complete.is_some())
            .finish()
    }
}

impl Timer {
    pub fn new(start_value: u32) -> Self {
        Self {
            counter: start_value,
            start_value,
            on_complete: None,
        }
    }

    pub fn on_complete(mut self, cb: impl FnMut() + Send + 'static) -> Self {
        self.on_complete = Some(Box::new(cb));
        self
    }

    pub fn set_on_complete(&mut self, cb: impl FnMut() + Send + 'static) {
        self.on_complete = Some(Box::new(cb));
    }

    pub fn counter(&self) -> u32 {
        self.counter
    }

    pub fn reload(&mut self) {
        self.counter = self.start_value;
    }

    /// Advances the counter by one tick: fires and reloads at zero,
    /// otherwise decrements. Matches the original's `Timer::Tick`.
    pub fn advance(&mut self) {
        if self.counter == 0 {
            if let Some(cb) = &mut self.on_complete {
                cb();
            }
            self.counter = self.start_value;
        } else {
            self.counter -= 1;
        }
    }
}

impl BusDevice for Timer {
    crate::bus::impl_as_any!();

    fn kind(&self) -> ComponentKind {
        ComponentKind::Timer
    }

    fn on_tick(&mut self, _bus: &mut Bus) {
        self.advance();
    }

    fn read_u8(&self, _offset: u32) -> BusResult<u8> {
        Ok(self.counter.min(u8::MAX as u32) as u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn fires_on_complete_then_reloads() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let mut t = Timer::new(2).on_complete(move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        });

        t.advance(); // 2 -> 1
        t.advance(); // 1 -> 0
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        t.advance(); // 0 -> fire, reload to 2
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(t.counter(), 2);
    }

    #[test]
    fn with_no_callback_just_wraps() {
        let mut t = Timer::new(1);
        t.advance();
        t.advance();
        assert_eq!(t.counter(), 1);
    }
}
