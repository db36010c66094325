// =============================================================================
// RENDERER - Owns every GPU resource for the textured quad
// =============================================================================
//
// INIT ORDER (each step borrows or holds the ones above it):
// ┌─────────────────────────────────────────────────────────────────┐
// │  Instance ─> Surface ─> Device                                  │
// │    └── Swapchain ─> Pipeline (render pass, framebuffers)        │
// │          └── Uploader ─> vertex/index buffers, texture          │
// │                └── Uniform buffers ─> Descriptor sets           │
// │                      └── Frame scheduler                        │
// └─────────────────────────────────────────────────────────────────┘
//
// Teardown is the reverse, enforced by field order.
// =============================================================================

use anyhow::{Context, Result};
use ash::vk;
use raw_window_handle::HasDisplayHandle;
use std::sync::Arc;
use std::time::Instant;
use winit::window::Window;

use crate::backend::descriptor::DescriptorBinder;
use crate::backend::error::log_failure;
use crate::backend::frame::{FrameInputs, FrameOutcome, FrameScheduler, MAX_FRAMES_IN_FLIGHT};
use crate::backend::pipeline::PipelineState;
use crate::backend::shader::read_spirv;
use crate::backend::texture::Texture;
use crate::backend::upload::Uploader;
use crate::backend::{GpuBuffer, Instance, Surface, Swapchain, VulkanDevice};
use crate::config::Config;
use crate::scene::{self, UniformBufferObject, Vertex, QUAD_INDICES, QUAD_VERTICES};

/// Field order matters for Drop! Rust drops fields top to bottom, and
/// everything below `frames` must outlive the GPU work it may still reference.
pub struct Renderer {
    frames: FrameScheduler,
    descriptors: DescriptorBinder,
    uniform_buffers: Vec<GpuBuffer>,
    texture: Texture,
    index_buffer: GpuBuffer,
    vertex_buffer: GpuBuffer,
    pipeline: PipelineState,
    swapchain: Option<Swapchain>,
    surface: Surface,
    device: Arc<VulkanDevice>,
    _instance: Arc<Instance>,

    window: Arc<Window>,
    clear_color: [f32; 4],
    rotation_degrees_per_second: f32,
    prefer_mailbox: bool,
    start_time: Instant,
    needs_rebuild: bool,
}

impl Renderer {
    pub fn new(window: Arc<Window>, config: &Config) -> Result<Self> {
        // ─────────────────────────────────────────────────────────────────────
        // Instance, surface, device
        // ─────────────────────────────────────────────────────────────────────
        let display = window
            .display_handle()
            .context("Window has no display handle")?
            .as_raw();
        let instance = Instance::new(&config.window.title, Some(display), config.validation_enabled())
            .context("Failed to create Vulkan instance")?;
        let surface = Surface::new(instance.clone(), window.as_ref())
            .context("Failed to create window surface")?;
        let device = VulkanDevice::new(
            instance.clone(),
            Some(&surface),
            &config.device_requirements(),
            config.selection_policy(),
        )
        .context("Failed to create Vulkan device")?;

        // ─────────────────────────────────────────────────────────────────────
        // Swapchain + pipeline
        // ─────────────────────────────────────────────────────────────────────
        let size = window.inner_size();
        let swapchain = Swapchain::new(
            device.clone(),
            &surface,
            (size.width, size.height),
            config.graphics.prefer_mailbox,
        )
        .context("Failed to create swapchain")?;

        let descriptors = DescriptorBinder::new(device.clone(), MAX_FRAMES_IN_FLIGHT as u32)
            .context("Failed to create descriptor pool")?;

        let vert_code = read_spirv(&config.assets.vertex_shader)?;
        let frag_code = read_spirv(&config.assets.fragment_shader)?;
        let pipeline = PipelineState::new(
            device.clone(),
            &swapchain,
            &vert_code,
            &frag_code,
            &Vertex::layout(),
            Some(descriptors.layout),
        )
        .context("Failed to build graphics pipeline")?;

        // ─────────────────────────────────────────────────────────────────────
        // Static resources via staging uploads
        // ─────────────────────────────────────────────────────────────────────
        let uploader = Uploader::new(device.clone())?;
        let vertex_buffer = uploader.upload_buffer(
            bytemuck::cast_slice(&QUAD_VERTICES),
            vk::BufferUsageFlags::VERTEX_BUFFER,
        )?;
        let index_buffer = uploader.upload_buffer(
            bytemuck::cast_slice(&QUAD_INDICES),
            vk::BufferUsageFlags::INDEX_BUFFER,
        )?;
        let texture = Texture::from_file(&uploader, &config.assets.texture)
            .context("Failed to load texture")?;

        // ─────────────────────────────────────────────────────────────────────
        // Per-slot uniforms + descriptor sets
        // ─────────────────────────────────────────────────────────────────────
        let ubo_size = std::mem::size_of::<UniformBufferObject>() as vk::DeviceSize;
        let uniform_buffers = (0..MAX_FRAMES_IN_FLIGHT)
            .map(|_| {
                GpuBuffer::persistently_mapped(
                    device.clone(),
                    ubo_size,
                    vk::BufferUsageFlags::UNIFORM_BUFFER,
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut descriptors = descriptors;
        descriptors.allocate_and_write(&uniform_buffers, &texture)?;

        // Uploads are synchronous, so the transfer pool has nothing left to do
        drop(uploader);

        let frames = FrameScheduler::new(device.clone())?;

        log::info!(
            "Renderer ready: {}x{} swapchain, {} frames in flight",
            swapchain.extent.width,
            swapchain.extent.height,
            MAX_FRAMES_IN_FLIGHT
        );

        Ok(Self {
            frames,
            descriptors,
            uniform_buffers,
            texture,
            index_buffer,
            vertex_buffer,
            pipeline,
            swapchain: Some(swapchain),
            surface,
            device,
            _instance: instance,
            window,
            clear_color: config.graphics.clear_color,
            rotation_degrees_per_second: config.graphics.rotation_degrees_per_second,
            prefer_mailbox: config.graphics.prefer_mailbox,
            start_time: Instant::now(),
            needs_rebuild: false,
        })
    }

    /// Window was resized; rebuild before the next frame
    pub fn request_rebuild(&mut self) {
        self.needs_rebuild = true;
    }

    /// Draw one frame. Returns false when nothing was presented (minimised
    /// window or stale swapchain).
    pub fn draw_frame(&mut self) -> Result<bool> {
        let size = self.window.inner_size();
        if size.width == 0 || size.height == 0 {
            // Minimised: a zero-sized swapchain is invalid, wait for a resize
            return Ok(false);
        }

        if self.needs_rebuild {
            self.rebuild_swapchain((size.width, size.height))?;
        }

        let swapchain = self
            .swapchain
            .as_ref()
            .context("Swapchain not initialized")?;

        let start_time = self.start_time;
        let degrees_per_second = self.rotation_degrees_per_second;
        let uniforms = move |extent: vk::Extent2D| {
            scene::uniforms_at(start_time.elapsed().as_secs_f32(), extent, degrees_per_second)
        };

        let outcome = self.frames.draw_frame(FrameInputs {
            swapchain,
            pipeline: &self.pipeline,
            vertex_buffer: &self.vertex_buffer,
            index_buffer: &self.index_buffer,
            index_count: QUAD_INDICES.len() as u32,
            uniform_buffers: &mut self.uniform_buffers,
            uniforms: &uniforms,
            descriptor_sets: &self.descriptors.sets,
            clear_color: self.clear_color,
        })?;

        if outcome.needs_rebuild() {
            self.needs_rebuild = true;
        }
        Ok(outcome != FrameOutcome::Skipped)
    }

    /// Recreate the swapchain and framebuffers from fresh surface queries
    fn rebuild_swapchain(&mut self, framebuffer_size: (u32, u32)) -> Result<()> {
        // Nothing may still reference the old images
        self.device.wait_idle()?;

        // The old swapchain must go before a new one is created for the surface
        self.swapchain = None;
        let swapchain = Swapchain::new(
            self.device.clone(),
            &self.surface,
            framebuffer_size,
            self.prefer_mailbox,
        )
        .context("Failed to rebuild swapchain")?;
        self.pipeline.rebuild_framebuffers(&swapchain)?;

        log::info!(
            "Swapchain rebuilt: {}x{} ({:?})",
            swapchain.extent.width,
            swapchain.extent.height,
            swapchain.present_mode
        );
        self.swapchain = Some(swapchain);
        self.needs_rebuild = false;
        Ok(())
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        // CRITICAL: Wait for GPU to finish before destroying anything
        log_failure("Failed to idle device during shutdown", self.device.wait_idle());
        log::info!(
            "Releasing renderer ({} frames in flight, texture {}x{})",
            self.frames.in_flight_count(),
            self.texture.extent.width,
            self.texture.extent.height
        );
    }
}
