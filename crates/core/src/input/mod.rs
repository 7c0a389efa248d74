use crate::bus::BusDevice;
use crate::ComponentKind;
use std::collections::HashMap;

type KeyCallback = Box<dyn FnMut(u32) + Send>;

#[derive(Default)]
struct KeyHandler {
    on_press: Option<KeyCallback>,
    on_release: Option<KeyCallback>,
    is_pressed: bool,
}

/// A key-code -> handler map with press/release edge detection, as in the
/// original's `Input` component. `register_key` is idempotent; repeated
/// calls for the same code keep the existing handler record (and its
/// current pressed state) rather than resetting it.
#[derive(Default)]
pub struct Input {
    keys: HashMap<u32, KeyHandler>,
    on_key_press: Option<KeyCallback>,
    on_key_release: Option<KeyCallback>,
}

impl std::fmt::Debug for Input {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Input")
            .field("keys", &self.keys.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Input {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_key(&mut self, code: u32) {
        self.keys.entry(code).or_default();
    }

    pub fn set_on_press(&mut self, code: u32, cb: impl FnMut(u32) + Send + 'static) {
        self.keys.entry(code).or_default().on_press = Some(Box::new(cb));
    }

    pub fn set_on_release(&mut self, code: u32, cb: impl FnMut(u32) + Send + 'static) {
        self.keys.entry(code).or_default().on_release = Some(Box::new(cb));
    }

    pub fn set_on_key_press(&mut self, cb: impl FnMut(u32) + Send + 'static) {
        self.on_key_press = Some(Box::new(cb));
    }

    pub fn set_on_key_release(&mut self, cb: impl FnMut(u32) + Send + 'static) {
        self.on_key_release = Some(Box::new(cb));
    }

    pub fn is_pressed(&self, code: u32) -> bool {
        self.keys.get(&code).map(|h| h.is_pressed).unwrap_or(false)
    }

    /// No-ops if already pressed; otherwise flips state, fires the
    /// per-key handler, then the bus-wide observer.
    pub fn press_key(&mut self, code: u32) {
        let handler = self.keys.entry(code).or_default();
        if handler.is_pressed {
            return;
        }
        handler.is_pressed = true;
        if let Some(cb) = &mut handler.on_press {
            cb(code);
        }
        if let Some(cb) = &mut self.on_key_press {
            cb(code);
        }
    }

    pub fn release_key(&mut self, code: u32) {
        let handler = self.keys.entry(code).or_default();
        if !handler.is_pressed {
            return;
        }
        handler.is_pressed = false;
        if let Some(cb) = &mut handler.on_release {
            cb(code);
        }
        if let Some(cb) = &mut self.on_key_release {
            cb(code);
        }
    }

    pub fn toggle_key(&mut self, code: u32) {
        if self.is_pressed(code) {
            self.release_key(code);
        } else {
            self.press_key(code);
        }
    }
}

impl BusDevice for Input {
    crate::bus::impl_as_any!();

    fn kind(&self) -> ComponentKind {
        ComponentKind::Input
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn press_fires_only_on_the_false_to_true_edge() {
        let mut input = Input::new();
        let presses = Arc::new(AtomicUsize::new(0));
        let presses2 = presses.clone();
        input.set_on_press(1, move |_| {
            presses2.fetch_add(1, Ordering::SeqCst);
        });

        input.press_key(1);
        input.press_key(1);
        assert_eq!(presses.load(Ordering::SeqCst), 1);
        assert!(input.is_pressed(1));
    }

    #[test]
    fn release_fires_only_on_the_true_to_false_edge() {
        let mut input = Input::new();
        let releases = Arc::new(AtomicUsize::new(0));
        let releases2 = releases.clone();
        input.set_on_release(1, move |_| {
            releases2.fetch_add(1, Ordering::SeqCst);
        });

        input.release_key(1);
        assert_eq!(releases.load(Ordering::SeqCst), 0);
        input.press_key(1);
        input.release_key(1);
        input.release_key(1);
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unknown_key_reports_not_pressed() {
        let input = Input::new();
        assert!(!input.is_pressed(99));
    }

    #[test]
    fn toggle_flips_and_fires_the_matching_edge() {
        let mut input = Input::new();
        input.toggle_key(5);
        assert!(input.is_pressed(5));
        input.toggle_key(5);
        assert!(!input.is_pressed(5));
    }
}
