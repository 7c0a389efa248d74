use crate::bus::BusDevice;
use crate::{BusError, BusResult, ComponentKind};

/// A packed RGBA pixel. The wire format a front-end texture upload expects
/// is `(r<<24)|(g<<16)|(b<<8)|a`, produced by `Rgba::to_packed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rgba {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Rgba {
    pub const BLACK: Rgba = Rgba { r: 0, g: 0, b: 0, a: 255 };
    pub const WHITE: Rgba = Rgba { r: 255, g: 255, b: 255, a: 255 };

    pub fn to_packed(self) -> u32 {
        (u32::from(self.r) << 24) | (u32::from(self.g) << 16) | (u32::from(self.b) << 8) | u32::from(self.a)
    }
}

/// A 2D pixel surface with an integer up-scaler, shared by the GameBoy PPU
/// (160x144) and the Chip8 display (64x32). Owns no timing of its own; the
/// owning CPU/PPU decides when pixels change.
#[derive(Debug)]
pub struct Display {
    width: u32,
    height: u32,
    scale: u32,
    pixels: Vec<Rgba>,
}

impl Display {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            scale: 1,
            pixels: vec![Rgba::BLACK; (width * height) as usize],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn scale(&self) -> u32 {
        self.scale
    }

    pub fn set_scale(&mut self, scale: u32) {
        self.scale = scale.max(1);
    }

    pub fn clear(&mut self) {
        self.pixels.fill(Rgba::BLACK);
    }

    pub fn clear_with(&mut self, color: Rgba) {
        self.pixels.fill(color);
    }

    fn index(&self, x: u32, y: u32) -> BusResult<usize> {
        if x >= self.width || y >= self.height {
            return Err(BusError::OutOfRange {
                x,
                y,
                width: self.width,
                height: self.height,
            });
        }
        Ok((y * self.width + x) as usize)
    }

    pub fn get_pixel(&self, x: u32, y: u32) -> BusResult<Rgba> {
        self.index(x, y).map(|i| self.pixels[i])
    }

    pub fn set_pixel(&mut self, x: u32, y: u32, color: Rgba) -> BusResult<()> {
        let i = self.index(x, y)?;
        self.pixels[i] = color;
        Ok(())
    }

    /// Returns a freshly allocated `(width*scale)x(height*scale)` RGBA
    /// image, each source pixel replicated as a `scale x scale` block.
    /// Ownership of the buffer transfers to the caller, as in the original
    /// `Display::GetPixelData`.
    pub fn get_pixel_data(&self) -> Vec<Rgba> {
        let scale = self.scale;
        let out_w = self.width * scale;
        let out_h = self.height * scale;
        let mut out = vec![Rgba::BLACK; (out_w * out_h) as usize];
        for y in 0..self.height {
            for x in 0..self.width {
                let color = self.pixels[(y * self.width + x) as usize];
                for dy in 0..scale {
                    let out_y = y * scale + dy;
                    let row_base = (out_y * out_w + x * scale) as usize;
                    for dx in 0..scale {
                        out[row_base + dx as usize] = color;
                    }
                }
            }
        }
        out
    }
}

impl BusDevice for Display {
    crate::bus::impl_as_any!();

    fn kind(&self) -> ComponentKind {
        ComponentKind::Display
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_pixel() {
        let mut d = Display::new(4, 4);
        for y in 0..4 {
            for x in 0..4 {
                let p = Rgba { r: x as u8, g: y as u8, b: 0, a: 255 };
                d.set_pixel(x, y, p).unwrap();
                assert_eq!(d.get_pixel(x, y).unwrap(), p);
            }
        }
    }

    #[test]
    fn out_of_range_is_rejected() {
        let d = Display::new(4, 4);
        assert!(matches!(d.get_pixel(4, 0), Err(BusError::OutOfRange { .. })));
    }

    #[test]
    fn scaling_replicates_each_source_pixel_as_a_block() {
        let mut d = Display::new(2, 1);
        d.set_pixel(0, 0, Rgba::WHITE).unwrap();
        d.set_pixel(1, 0, Rgba::BLACK).unwrap();
        d.set_scale(2);
        let data = d.get_pixel_data();
        assert_eq!(data.len(), 4 * 2);
        // Top-left 2x2 block is all WHITE, top-right 2x2 block all BLACK.
        assert_eq!(data[0], Rgba::WHITE);
        assert_eq!(data[1], Rgba::WHITE);
        assert_eq!(data[2], Rgba::BLACK);
        assert_eq!(data[3], Rgba::BLACK);
        assert_eq!(data[4], Rgba::WHITE);
    }

    #[test]
    fn packed_wire_format_matches_front_end_contract() {
        let p = Rgba { r: 0x11, g: 0x22, b: 0x33, a: 0x44 };
        assert_eq!(p.to_packed(), 0x1122_3344);
    }
}
