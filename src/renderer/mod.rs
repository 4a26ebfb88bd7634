//! Renderer module for clipplayer
//!
//! The [`Renderer`] owns a presentation surface, copies decoded frames into
//! a surface-owned image and presents that image scaled uniformly to fit
//! the surface and centered on it. Backends implement
//! [`PresentationSurface`]: [`WgpuSurface`] for windows and
//! [`SoftwareSurface`] for headless use.

mod pipeline;
mod software;
mod wgpu_renderer;

pub use software::{SoftwareCanvas, SoftwareSurface};
pub use wgpu_renderer::WgpuSurface;

use crate::decoder::DecodedFrame;
use crate::utils::config::RendererConfig;
use crate::utils::error::{PlayerError, Result};
use log::{debug, trace};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::sync::Arc;

/// A surface frames can be uploaded to and drawn on
///
/// Every method is called with the controller's state lock held, so a
/// resize never overlaps a draw.
pub trait PresentationSurface: Send {
    /// Current backing size in pixels
    fn size(&self) -> (u32, u32);

    /// Reconfigure the backing buffers
    fn resize(&mut self, width: u32, height: u32) -> Result<()>;

    /// Copy `frame` into the surface-owned image, replacing the previous one
    fn upload(&mut self, frame: &DecodedFrame) -> Result<()>;

    /// Clear to `background`, draw the image into `dest` if given, and present
    fn draw(&mut self, background: Color, dest: Option<FitRect>) -> Result<()>;
}

/// Destination rectangle of a scaled image, in surface pixels
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FitRect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,

    /// Uniform scale applied to the image
    pub scale: f32,
}

/// Scale an image uniformly to fit the surface and center it
///
/// `s = min(W / w, H / h)`; the image occupies `(w * s, h * s)` with equal
/// margins on both sides of each axis. `None` when either size is empty.
pub fn fit_rect(image: (u32, u32), surface: (u32, u32)) -> Option<FitRect> {
    let (w, h) = (image.0 as f32, image.1 as f32);
    let (sw, sh) = (surface.0 as f32, surface.1 as f32);
    if w <= 0.0 || h <= 0.0 || sw <= 0.0 || sh <= 0.0 {
        return None;
    }

    let scale = (sw / w).min(sh / h);
    let width = w * scale;
    let height = h * scale;

    Some(FitRect {
        x: (sw - width) / 2.0,
        y: (sh - height) / 2.0,
        width,
        height,
        scale,
    })
}

/// Handle to the image last uploaded to a [`Renderer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrawableImage {
    pub width: u32,
    pub height: u32,
    generation: u64,
}

/// Render statistics
#[derive(Debug, Clone, Copy, Default)]
pub struct RenderStats {
    pub frames_uploaded: u64,
    pub frames_presented: u64,

    /// Presents skipped because the surface had no area
    pub presents_skipped: u64,

    /// Current render resolution
    pub render_width: u32,
    pub render_height: u32,
}

/// Owner of the presentation surface
pub struct Renderer {
    surface: Box<dyn PresentationSurface>,
    background: Color,
    generation: u64,
    current: Option<DrawableImage>,
    last_present: Option<FitRect>,
    stats: RenderStats,
}

impl Renderer {
    /// Create a GPU-backed renderer bound to `window`
    ///
    /// Fails with `RenderInit` when neither a hardware nor (if allowed) a
    /// software adapter is available. The session cannot proceed without it.
    pub fn initialize<W>(window: Arc<W>, size: (u32, u32), config: &RendererConfig) -> Result<Self>
    where
        W: HasWindowHandle + HasDisplayHandle + Send + Sync + 'static,
    {
        let background = Color::from_hex(&config.background)?;
        let surface = WgpuSurface::new(window, size, config)?;
        Ok(Self::with_surface(Box::new(surface), background))
    }

    /// Wrap an existing surface
    pub fn with_surface(surface: Box<dyn PresentationSurface>, background: Color) -> Self {
        let (render_width, render_height) = surface.size();
        Self {
            surface,
            background,
            generation: 0,
            current: None,
            last_present: None,
            stats: RenderStats {
                render_width,
                render_height,
                ..RenderStats::default()
            },
        }
    }

    /// Reconfigure the surface for a new window size
    pub fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        self.surface.resize(width, height)?;
        self.stats.render_width = width;
        self.stats.render_height = height;
        debug!("Surface resized to {}x{}", width, height);
        Ok(())
    }

    /// Copy `frame` into the renderer-owned image
    ///
    /// The frame's buffer is not retained past this call.
    pub fn upload_frame(&mut self, frame: &DecodedFrame) -> Result<DrawableImage> {
        if !frame.is_well_formed() {
            return Err(PlayerError::Render(format!(
                "malformed {}x{} frame ({} bytes, stride {})",
                frame.width,
                frame.height,
                frame.data.len(),
                frame.stride
            )));
        }

        self.surface.upload(frame)?;
        self.generation += 1;
        self.stats.frames_uploaded += 1;

        let image = DrawableImage {
            width: frame.width,
            height: frame.height,
            generation: self.generation,
        };
        self.current = Some(image);
        Ok(image)
    }

    /// Clear the surface and draw `image` scaled to fit and centered
    pub fn present(&mut self, image: &DrawableImage) -> Result<()> {
        if self.current.map(|c| c.generation) != Some(image.generation) {
            return Err(PlayerError::Render("image was replaced by a later upload".to_string()));
        }

        let Some(rect) = fit_rect((image.width, image.height), self.surface.size()) else {
            self.stats.presents_skipped += 1;
            trace!("Surface has no area, skipping present");
            return Ok(());
        };

        self.surface.draw(self.background, Some(rect))?;
        self.last_present = Some(rect);
        self.stats.frames_presented += 1;
        Ok(())
    }

    /// Present the last uploaded image again, or just the background
    pub fn redraw(&mut self) -> Result<()> {
        match self.current {
            Some(image) => self.present(&image),
            None => {
                let (width, height) = self.surface.size();
                if width == 0 || height == 0 {
                    return Ok(());
                }
                self.surface.draw(self.background, None)
            }
        }
    }

    /// Forget the current image and clear the surface
    pub fn clear(&mut self) -> Result<()> {
        self.current = None;
        self.last_present = None;
        self.redraw()
    }

    /// Destination of the last present
    pub fn last_present(&self) -> Option<FitRect> {
        self.last_present
    }

    pub fn frames_presented(&self) -> u64 {
        self.stats.frames_presented
    }

    pub fn stats(&self) -> RenderStats {
        self.stats
    }

    pub fn size(&self) -> (u32, u32) {
        self.surface.size()
    }

    pub fn background(&self) -> Color {
        self.background
    }
}

/// Color representation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Color {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl Color {
    /// Create a new color
    pub fn new(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }

    /// Create color from RGBA values (0-255)
    pub fn from_rgba(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self {
            r: r as f32 / 255.0,
            g: g as f32 / 255.0,
            b: b as f32 / 255.0,
            a: a as f32 / 255.0,
        }
    }

    /// Create color from a `#RRGGBB` or `#RRGGBBAA` string
    pub fn from_hex(hex: &str) -> Result<Self> {
        let digits = hex.trim_start_matches('#');
        if !(digits.len() == 6 || digits.len() == 8) || !digits.is_ascii() {
            return Err(PlayerError::InvalidInput(format!(
                "Hex color must be 6 or 8 characters: '{}'",
                hex
            )));
        }

        let channel = |i: usize| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .map_err(|_| PlayerError::InvalidInput(format!("Invalid hex color '{}'", hex)))
        };
        let a = if digits.len() == 8 { channel(6)? } else { 255 };

        Ok(Self::from_rgba(channel(0)?, channel(2)?, channel(4)?, a))
    }

    /// Bytes in BGRA order
    pub fn to_bgra8(&self) -> [u8; 4] {
        let byte = |c: f32| (c.clamp(0.0, 1.0) * 255.0).round() as u8;
        [byte(self.b), byte(self.g), byte(self.r), byte(self.a)]
    }

    // Common colors
    pub const WHITE: Self = Self { r: 1.0, g: 1.0, b: 1.0, a: 1.0 };
    pub const BLACK: Self = Self { r: 0.0, g: 0.0, b: 0.0, a: 1.0 };
}

impl Default for Color {
    fn default() -> Self {
        Self::WHITE
    }
}
