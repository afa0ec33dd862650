//! Viewer application: a cycling checkerboard texture behind a clear-screen pass.

use std::sync::Arc;

use ash::vk;
use glam::Vec4;
use tracing::{info, warn};

use vulkanoid_app::{AppContext, FrameContext, GpuContext, VulkanoidApp};
use vulkanoid_gpu::command::transition_image;
use vulkanoid_gpu::memory::defer_free_image;
use vulkanoid_gpu::texture::{create_sampler, upload_rgba8};
use vulkanoid_gpu::{
    abort_on_fatal, BindlessHandle, FrameUniforms, GpuImage, ResourceBinding, ResourceManager,
    SharedAllocator,
};

/// Side length of the generated checkerboard, in texels.
const CHECKER_SIZE: u32 = 64;

/// Seconds between texture swaps.
const SWAP_PERIOD: f32 = 4.0;

/// Per-frame shader constants.
#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ViewerUniforms {
    pub clear_color: Vec4,
    pub texture: BindlessHandle,
    pub time: f32,
    pub _pad: [f32; 2],
}

/// Options parsed from the command line.
#[derive(Debug, Clone, Copy)]
pub struct ViewerParams {
    pub frames_in_flight: usize,
    pub vsync: bool,
}

impl Default for ViewerParams {
    fn default() -> Self {
        Self {
            frames_in_flight: 2,
            vsync: false,
        }
    }
}

impl ViewerParams {
    /// Parse viewer parameters from command line arguments.
    pub fn from_args() -> Self {
        Self::parse(std::env::args().skip(1))
    }

    fn parse(args: impl IntoIterator<Item = String>) -> Self {
        let mut params = Self::default();
        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--frames-in-flight" => {
                    if let Some(v) = args.next().and_then(|v| v.parse().ok()) {
                        params.frames_in_flight = v;
                    }
                }
                "--vsync" => params.vsync = true,
                _ => {}
            }
        }
        params
    }
}

/// RGBA8 checkerboard with `cells` squares per side.
pub fn checkerboard(size: u32, cells: u32, a: [u8; 4], b: [u8; 4]) -> Vec<u8> {
    let cell = (size / cells.max(1)).max(1);
    (0..size * size)
        .flat_map(|texel| {
            let (x, y) = (texel % size, texel / size);
            if (x / cell + y / cell) % 2 == 0 {
                a
            } else {
                b
            }
        })
        .collect()
}

/// Palette entry used for the `generation`th texture.
fn palette(generation: u64) -> [u8; 4] {
    const COLORS: [[u8; 4]; 4] = [
        [230, 80, 60, 255],
        [60, 170, 230, 255],
        [90, 200, 90, 255],
        [240, 200, 60, 255],
    ];
    COLORS[(generation % COLORS.len() as u64) as usize]
}

fn clear_color(time: f32) -> Vec4 {
    Vec4::new(
        0.1 + 0.1 * time.sin().abs(),
        0.1,
        0.15 + 0.1 * (time * 0.5).cos().abs(),
        1.0,
    )
}

/// Fires once every `period` seconds of accumulated frame time.
#[derive(Debug, Clone, Copy)]
struct SwapTimer {
    period: f32,
    elapsed: f32,
}

impl SwapTimer {
    fn new(period: f32) -> Self {
        Self {
            period,
            elapsed: 0.0,
        }
    }

    fn tick(&mut self, dt: f32) -> bool {
        self.elapsed += dt;
        if self.elapsed < self.period {
            return false;
        }
        self.elapsed = 0.0;
        true
    }
}

/// A texture registered in the bindless table.
struct BoundTexture {
    image: GpuImage,
    handle: BindlessHandle,
}

/// Viewer application state.
pub struct Viewer {
    allocator: SharedAllocator,
    sampler: vk::Sampler,
    fallback: Option<GpuImage>,
    texture: Option<BoundTexture>,
    uniforms: Option<FrameUniforms<ViewerUniforms>>,
    generation: u64,
    swap_timer: SwapTimer,
    time: f32,
}

impl Viewer {
    fn upload_texture(
        &self,
        gpu: &GpuContext,
        resources: &ResourceManager<GpuContext>,
        generation: u64,
    ) -> vulkanoid_gpu::Result<GpuImage> {
        let pixels = checkerboard(CHECKER_SIZE, 8, palette(generation), [20, 20, 24, 255]);
        upload_rgba8(
            gpu,
            resources,
            &pixels,
            CHECKER_SIZE,
            CHECKER_SIZE,
            &format!("checkerboard {generation}"),
        )
    }

    /// Replace the bound texture between frames.
    ///
    /// The old handle is retired behind the last submitted frame. When the table rejects
    /// the new texture it is freed at once and the current one stays bound.
    fn swap_texture(&mut self, ctx: &mut AppContext) -> vulkanoid_gpu::Result<()> {
        let generation = self.generation + 1;
        let mut image = self.upload_texture(&ctx.gpu, &ctx.resources, generation)?;
        let binding = ResourceBinding::sampled_image(image.view, self.sampler);
        let handle = match ctx.resources.register_resource(binding) {
            Ok(handle) => handle,
            Err(err) => {
                // Only the finished upload ever touched the image.
                self.allocator.lock().free_image(&mut image)?;
                if err.is_recoverable() {
                    warn!(generation, "keeping current texture: {err}");
                    return Ok(());
                }
                return Err(err);
            }
        };

        if let Some(old) = self.texture.replace(BoundTexture { image, handle }) {
            let allocator = Arc::clone(&self.allocator);
            let mut image = old.image;
            ctx.resources.retire_resource(old.handle, move || {
                if let Err(err) = allocator.lock().free_image(&mut image) {
                    vulkanoid_gpu::error::fatal("free retired texture", &err);
                }
            })?;
        }

        self.generation = generation;
        info!(generation, %handle, "texture swapped");
        Ok(())
    }
}

impl VulkanoidApp for Viewer {
    fn init(ctx: &mut AppContext) -> anyhow::Result<Self> {
        let gpu = Arc::clone(&ctx.gpu);
        let allocator = Arc::clone(gpu.allocator());

        let sampler = create_sampler(&gpu, ctx.resources.global_queue_mut())?;

        let magenta = checkerboard(2, 2, [255, 0, 255, 255], [0, 0, 0, 255]);
        let fallback = upload_rgba8(&gpu, &ctx.resources, &magenta, 2, 2, "fallback")?;
        ctx.resources
            .set_fallback(ResourceBinding::sampled_image(fallback.view, sampler))?;

        let uniforms = FrameUniforms::new(&allocator, ctx.frames_in_flight(), "viewer uniforms")?;

        let mut viewer = Self {
            allocator,
            sampler,
            fallback: Some(fallback),
            texture: None,
            uniforms: Some(uniforms),
            generation: 0,
            swap_timer: SwapTimer::new(SWAP_PERIOD),
            time: 0.0,
        };

        let image = viewer.upload_texture(&gpu, &ctx.resources, 0)?;
        let handle = ctx
            .resources
            .register_resource(ResourceBinding::sampled_image(image.view, sampler))?;
        viewer.texture = Some(BoundTexture { image, handle });

        info!(
            frames_in_flight = ctx.frames_in_flight(),
            %handle,
            "viewer initialized"
        );
        Ok(viewer)
    }

    fn update(&mut self, ctx: &mut AppContext, dt: f32) {
        self.time += dt;
        if self.swap_timer.tick(dt) {
            if let Err(err) = abort_on_fatal("texture swap", self.swap_texture(ctx)) {
                warn!("texture swap failed: {err}");
            }
        }
    }

    fn render(&mut self, gpu: &GpuContext, frame: &mut FrameContext<'_>) -> anyhow::Result<()> {
        let color = clear_color(self.time);
        let texture = self
            .texture
            .as_ref()
            .map_or(BindlessHandle::FALLBACK, |texture| texture.handle);
        if let Some(uniforms) = &mut self.uniforms {
            uniforms.write(
                frame.slot,
                &ViewerUniforms {
                    clear_color: color,
                    texture,
                    time: self.time,
                    _pad: [0.0; 2],
                },
            )?;
        }

        let device = gpu.device();
        let cmd = frame.command_buffer;
        let range = vk::ImageSubresourceRange::default()
            .aspect_mask(vk::ImageAspectFlags::COLOR)
            .level_count(1)
            .layer_count(1);
        let clear = vk::ClearColorValue {
            float32: color.to_array(),
        };

        unsafe {
            transition_image(
                device,
                cmd,
                frame.swapchain_image,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            );
            device.cmd_clear_color_image(
                cmd,
                frame.swapchain_image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &clear,
                &[range],
            );
            transition_image(
                device,
                cmd,
                frame.swapchain_image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::PRESENT_SRC_KHR,
            );
        }

        Ok(())
    }

    fn cleanup(mut self, ctx: &mut AppContext) {
        let queue = ctx.resources.global_queue_mut();
        if let Some(uniforms) = self.uniforms.take() {
            uniforms.defer_destroy(queue, &self.allocator);
        }
        if let Some(texture) = self.texture.take() {
            defer_free_image(queue, &self.allocator, texture.image);
        }
        if let Some(fallback) = self.fallback.take() {
            defer_free_image(queue, &self.allocator, fallback);
        }
        info!(generations = self.generation + 1, "viewer resources released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkerboard_alternates_cells() {
        let a = [1, 1, 1, 1];
        let b = [2, 2, 2, 2];
        let pixels = checkerboard(4, 2, a, b);
        assert_eq!(pixels.len(), 4 * 4 * 4);

        let texel = |x: usize, y: usize| &pixels[(y * 4 + x) * 4..(y * 4 + x) * 4 + 4];
        assert_eq!(texel(0, 0), a);
        assert_eq!(texel(2, 0), b);
        assert_eq!(texel(0, 2), b);
        assert_eq!(texel(3, 3), a);
    }

    #[test]
    fn swap_timer_fires_once_per_period() {
        let mut timer = SwapTimer::new(1.0);
        let fired: Vec<bool> = [0.4, 0.4, 0.4, 0.4, 0.4, 0.4]
            .into_iter()
            .map(|dt| timer.tick(dt))
            .collect();
        assert_eq!(fired, [false, false, true, false, false, true]);

        // A single long stall still fires only once.
        assert!(timer.tick(5.0));
        assert!(!timer.tick(0.1));
    }

    #[test]
    fn uniforms_are_std140_sized() {
        assert_eq!(std::mem::size_of::<ViewerUniforms>(), 32);
    }

    #[test]
    fn args_override_defaults() {
        let args = ["--frames-in-flight", "3", "--vsync"].map(String::from);
        let params = ViewerParams::parse(args);
        assert_eq!(params.frames_in_flight, 3);
        assert!(params.vsync);

        let params = ViewerParams::parse(["--frames-in-flight", "x"].map(String::from));
        assert_eq!(params.frames_in_flight, 2);
    }
}
