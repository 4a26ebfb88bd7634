//! CPU presentation surface
//!
//! Renders into an in-memory BGRA framebuffer with nearest-neighbour
//! scaling. Used for headless runs, tests and benchmarks; the framebuffer
//! stays readable through [`SoftwareSurface::canvas`].

use crate::decoder::{DecodedFrame, BYTES_PER_PIXEL};
use crate::renderer::{Color, FitRect, PresentationSurface};
use crate::utils::error::Result;
use parking_lot::Mutex;
use std::sync::Arc;

/// The presented framebuffer
#[derive(Debug, Default)]
pub struct SoftwareCanvas {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
    presents: u64,
}

impl SoftwareCanvas {
    fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixels: vec![0; width as usize * height as usize * BYTES_PER_PIXEL],
            presents: 0,
        }
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// BGRA bytes of the pixel at (x, y), if inside the canvas
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let offset = (y as usize * self.width as usize + x as usize) * BYTES_PER_PIXEL;
        let mut bgra = [0; 4];
        bgra.copy_from_slice(&self.pixels[offset..offset + BYTES_PER_PIXEL]);
        Some(bgra)
    }

    /// Number of completed presents
    pub fn presents(&self) -> u64 {
        self.presents
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }
}

/// Surface-owned copy of the last uploaded frame
struct Image {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

/// Presentation surface backed by a [`SoftwareCanvas`]
pub struct SoftwareSurface {
    canvas: Arc<Mutex<SoftwareCanvas>>,
    image: Option<Image>,
}

impl SoftwareSurface {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            canvas: Arc::new(Mutex::new(SoftwareCanvas::new(width, height))),
            image: None,
        }
    }

    /// Shared handle to the framebuffer
    pub fn canvas(&self) -> Arc<Mutex<SoftwareCanvas>> {
        Arc::clone(&self.canvas)
    }
}

impl PresentationSurface for SoftwareSurface {
    fn size(&self) -> (u32, u32) {
        self.canvas.lock().size()
    }

    fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        let mut canvas = self.canvas.lock();
        let presents = canvas.presents;
        *canvas = SoftwareCanvas::new(width, height);
        canvas.presents = presents;
        Ok(())
    }

    fn upload(&mut self, frame: &DecodedFrame) -> Result<()> {
        let row = frame.width as usize * BYTES_PER_PIXEL;
        let mut data = Vec::with_capacity(row * frame.height as usize);
        for y in 0..frame.height {
            data.extend_from_slice(frame.row(y));
        }
        self.image = Some(Image {
            width: frame.width,
            height: frame.height,
            data,
        });
        Ok(())
    }

    fn draw(&mut self, background: Color, dest: Option<FitRect>) -> Result<()> {
        let mut canvas = self.canvas.lock();
        let clear = background.to_bgra8();
        for pixel in canvas.pixels.chunks_exact_mut(BYTES_PER_PIXEL) {
            pixel.copy_from_slice(&clear);
        }

        if let (Some(image), Some(rect)) = (&self.image, dest) {
            blit_scaled(&mut canvas, image, rect);
        }

        canvas.presents += 1;
        Ok(())
    }
}

/// Nearest-neighbour copy of `image` into the pixels covered by `rect`
fn blit_scaled(canvas: &mut SoftwareCanvas, image: &Image, rect: FitRect) {
    let x0 = rect.x.round().max(0.0) as u32;
    let y0 = rect.y.round().max(0.0) as u32;
    let x1 = ((rect.x + rect.width).round() as u32).min(canvas.width);
    let y1 = ((rect.y + rect.height).round() as u32).min(canvas.height);
    if x1 <= x0 || y1 <= y0 {
        return;
    }

    let (dw, dh) = ((x1 - x0) as f32, (y1 - y0) as f32);
    let canvas_width = canvas.width as usize;

    for dy in y0..y1 {
        let sy = ((((dy - y0) as f32 + 0.5) / dh * image.height as f32) as u32).min(image.height - 1);
        for dx in x0..x1 {
            let sx = ((((dx - x0) as f32 + 0.5) / dw * image.width as f32) as u32).min(image.width - 1);

            let src = (sy as usize * image.width as usize + sx as usize) * BYTES_PER_PIXEL;
            let dst = (dy as usize * canvas_width + dx as usize) * BYTES_PER_PIXEL;
            canvas.pixels[dst..dst + BYTES_PER_PIXEL]
                .copy_from_slice(&image.data[src..src + BYTES_PER_PIXEL]);
        }
    }
}
