//! WGPU presentation surface for clipplayer
//!
//! A double-buffered swap chain bound to a window. Uploaded frames land in a
//! BGRA texture that is drawn into the fit rectangle through the viewport;
//! the clear covers the rest of the surface.

use crate::decoder::DecodedFrame;
use crate::renderer::pipeline::FramePipeline;
use crate::renderer::{Color, FitRect, PresentationSurface};
use crate::utils::config::RendererConfig;
use crate::utils::error::{IntoPlayerError, PlayerError, Result};
use log::{info, warn};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::sync::Arc;

/// Texture holding the last uploaded frame
struct FrameTexture {
    texture: wgpu::Texture,
    bind_group: wgpu::BindGroup,
    width: u32,
    height: u32,
}

/// Window-bound GPU surface
pub struct WgpuSurface {
    device: wgpu::Device,
    queue: wgpu::Queue,
    surface: wgpu::Surface<'static>,
    surface_config: wgpu::SurfaceConfiguration,
    pipeline: FramePipeline,
    texture_format: wgpu::TextureFormat,
    frame: Option<FrameTexture>,
    size: (u32, u32),
}

impl WgpuSurface {
    /// Create the surface for `window`
    ///
    /// Requests a hardware adapter first and, when the configuration allows
    /// it, the platform's software adapter.
    pub fn new<W>(window: Arc<W>, size: (u32, u32), config: &RendererConfig) -> Result<Self>
    where
        W: HasWindowHandle + HasDisplayHandle + Send + Sync + 'static,
    {
        pollster::block_on(Self::init(window, size, config))
    }

    async fn init<W>(window: Arc<W>, size: (u32, u32), config: &RendererConfig) -> Result<Self>
    where
        W: HasWindowHandle + HasDisplayHandle + Send + Sync + 'static,
    {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let surface = instance
            .create_surface(window)
            .render_init_err("Failed to create surface")?;

        let adapter = match Self::request_adapter(&instance, &surface, false).await {
            Ok(adapter) => adapter,
            Err(e) if config.allow_software_fallback => {
                warn!("No hardware adapter ({}), trying software rasterizer", e);
                Self::request_adapter(&instance, &surface, true).await.map_err(|e| {
                    PlayerError::RenderInit(format!("No hardware or software adapter: {}", e))
                })?
            }
            Err(e) => {
                return Err(PlayerError::RenderInit(format!("No hardware adapter: {}", e)));
            }
        };
        info!("Using adapter: {:?}", adapter.get_info().name);

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("clipplayer device"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::downlevel_defaults().using_resolution(adapter.limits()),
                memory_hints: wgpu::MemoryHints::default(),
                trace: wgpu::Trace::Off,
            })
            .await
            .render_init_err("Failed to create GPU device")?;

        let surface_caps = surface.get_capabilities(&adapter);
        let surface_format = surface_caps
            .formats
            .iter()
            .copied()
            .find(|f| f.is_srgb())
            .or_else(|| surface_caps.formats.first().copied())
            .ok_or_else(|| PlayerError::RenderInit("Surface reports no formats".to_string()))?;
        let alpha_mode = surface_caps
            .alpha_modes
            .first()
            .copied()
            .unwrap_or(wgpu::CompositeAlphaMode::Auto);

        let surface_config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format: surface_format,
            width: size.0.max(1),
            height: size.1.max(1),
            present_mode: if config.vsync {
                wgpu::PresentMode::AutoVsync
            } else {
                wgpu::PresentMode::AutoNoVsync
            },
            alpha_mode,
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };
        if size.0 > 0 && size.1 > 0 {
            surface.configure(&device, &surface_config);
        }

        // Sampling an sRGB texture into an sRGB target leaves the pixel values unchanged.
        let texture_format = if surface_format.is_srgb() {
            wgpu::TextureFormat::Bgra8UnormSrgb
        } else {
            wgpu::TextureFormat::Bgra8Unorm
        };
        let pipeline = FramePipeline::new(&device, surface_format);

        Ok(Self {
            device,
            queue,
            surface,
            surface_config,
            pipeline,
            texture_format,
            frame: None,
            size,
        })
    }

    async fn request_adapter(
        instance: &wgpu::Instance,
        surface: &wgpu::Surface<'static>,
        force_fallback_adapter: bool,
    ) -> std::result::Result<wgpu::Adapter, wgpu::RequestAdapterError> {
        instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: Some(surface),
                force_fallback_adapter,
            })
            .await
    }

    fn reconfigure_surface(&mut self) {
        if self.size.0 > 0 && self.size.1 > 0 {
            self.surface.configure(&self.device, &self.surface_config);
        }
    }

    fn create_frame_texture(&self, width: u32, height: u32) -> FrameTexture {
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Frame Texture"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: self.texture_format,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let bind_group = self.pipeline.bind_group(&self.device, &view);
        FrameTexture {
            texture,
            bind_group,
            width,
            height,
        }
    }
}

impl PresentationSurface for WgpuSurface {
    fn size(&self) -> (u32, u32) {
        self.size
    }

    fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        self.size = (width, height);
        if width == 0 || height == 0 {
            return Ok(());
        }
        self.surface_config.width = width;
        self.surface_config.height = height;
        self.reconfigure_surface();
        Ok(())
    }

    fn upload(&mut self, frame: &DecodedFrame) -> Result<()> {
        let stride = u32::try_from(frame.stride).renderer_err("Frame stride too large")?;

        let target = match self.frame.take() {
            Some(target) if target.width == frame.width && target.height == frame.height => target,
            _ => self.create_frame_texture(frame.width, frame.height),
        };

        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &target.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            &frame.data,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(stride),
                rows_per_image: Some(frame.height),
            },
            wgpu::Extent3d {
                width: frame.width,
                height: frame.height,
                depth_or_array_layers: 1,
            },
        );
        self.frame = Some(target);
        Ok(())
    }

    fn draw(&mut self, background: Color, dest: Option<FitRect>) -> Result<()> {
        if self.size.0 == 0 || self.size.1 == 0 {
            return Ok(());
        }

        let surface_texture = match self.surface.get_current_texture() {
            Ok(texture) => texture,
            Err(wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated) => {
                // Skip this present; the next one draws on the new swap chain.
                self.reconfigure_surface();
                return Ok(());
            }
            Err(wgpu::SurfaceError::OutOfMemory) => {
                return Err(PlayerError::Render("Out of GPU memory".to_string()));
            }
            Err(e) => {
                warn!("Surface texture acquisition failed: {:?}", e);
                return Ok(());
            }
        };

        let view = surface_texture
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Frame Encoder"),
            });

        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Frame Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(background.into()),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });

            if let (Some(frame), Some(rect)) = (&self.frame, dest) {
                let (sw, sh) = (self.size.0 as f32, self.size.1 as f32);
                let x = rect.x.clamp(0.0, sw);
                let y = rect.y.clamp(0.0, sh);
                let width = rect.width.min(sw - x);
                let height = rect.height.min(sh - y);
                if width > 0.0 && height > 0.0 {
                    pass.set_viewport(x, y, width, height, 0.0, 1.0);
                    self.pipeline.draw(&mut pass, &frame.bind_group);
                }
            }
        }

        self.queue.submit(std::iter::once(encoder.finish()));
        surface_texture.present();
        Ok(())
    }
}

impl From<Color> for wgpu::Color {
    fn from(color: Color) -> Self {
        wgpu::Color {
            r: f64::from(color.r),
            g: f64::from(color.g),
            b: f64::from(color.b),
            a: f64::from(color.a),
        }
    }
}
