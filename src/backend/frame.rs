// Frame scheduler
//
// Owns the per-frame-in-flight command buffers and sync objects, and drives
// wait -> acquire -> update -> record -> submit -> present for one slot per
// call. Everything it draws with is borrowed from the renderer.

use ash::vk;
use bytemuck::Pod;
use std::sync::Arc;

use super::buffer::GpuBuffer;
use super::device::VulkanDevice;
use super::error::{GfxResult, VkCheck};
use super::pipeline::PipelineState;
use super::swapchain::{AcquireOutcome, PresentOutcome, Swapchain};
use super::sync::FrameSync;

/// How many frames the CPU may record ahead of the GPU
pub const MAX_FRAMES_IN_FLIGHT: usize = 2;

// =============================================================================
// SLOT STATE MACHINE
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Fence signaled, no GPU work outstanding
    Idle,
    Acquiring,
    Recording,
    /// Fence reset, GPU work in flight
    Submitted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Presented,
    /// Presented, but the swapchain no longer matches the surface
    PresentedStale,
    /// Acquire reported out-of-date; nothing was submitted
    Skipped,
}

impl FrameOutcome {
    pub fn needs_rebuild(self) -> bool {
        self != FrameOutcome::Presented
    }
}

/// The GPU-facing half of one frame. `FrameRing::draw` decides the order;
/// implementors only perform each step for the slot they are handed.
pub trait FrameBackend<S> {
    /// Block until the work last submitted from `slot` has retired
    fn wait(&mut self, index: usize, slot: &S) -> GfxResult<()>;
    fn acquire(&mut self, index: usize, slot: &S) -> GfxResult<AcquireOutcome>;
    /// Write this frame's uniforms into the slot's buffer
    fn update_uniforms(&mut self, index: usize) -> GfxResult<()>;
    fn reset_fence(&mut self, index: usize, slot: &S) -> GfxResult<()>;
    /// Record and submit, signaling the slot's fence on completion
    fn submit(&mut self, index: usize, slot: &S, image_index: u32) -> GfxResult<()>;
    fn present(&mut self, index: usize, slot: &S, image_index: u32) -> GfxResult<PresentOutcome>;
}

/// Fixed ring of slots indexed by a modulo counter.
///
/// The ring owns the frame ordering; everything that touches the GPU goes
/// through a `FrameBackend`.
pub struct FrameRing<S> {
    slots: Vec<S>,
    states: Vec<SlotState>,
    current: usize,
}

impl<S> FrameRing<S> {
    pub fn new(slots: Vec<S>) -> Self {
        let states = vec![SlotState::Idle; slots.len()];
        Self {
            slots,
            states,
            current: 0,
        }
    }

    fn advance(&mut self) {
        self.current = (self.current + 1) % self.slots.len();
    }

    /// Slots whose GPU work has been submitted but not yet waited on
    pub fn in_flight_count(&self) -> usize {
        self.states
            .iter()
            .filter(|&&s| s == SlotState::Submitted)
            .count()
    }

    /// Render and present one frame using the current slot.
    ///
    /// FRAME TIMELINE:
    /// ┌──────────────────────────────────────────────────────────────────────┐
    /// │  wait_fence ─> acquire ─> write UBO ─> reset fence ─> record        │
    /// │     ─> submit ─> present ─> next slot                                │
    /// └──────────────────────────────────────────────────────────────────────┘
    pub fn draw<B: FrameBackend<S>>(&mut self, backend: &mut B) -> GfxResult<FrameOutcome> {
        let index = self.current;
        let slot = &self.slots[index];

        // ─────────────────────────────────────────────────────────────────────
        // STEP 1: Wait until this slot's previous submission has retired
        // ─────────────────────────────────────────────────────────────────────
        // The only backpressure: at most one submission per slot outstanding
        backend.wait(index, slot)?;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 2: Acquire next swapchain image
        // ─────────────────────────────────────────────────────────────────────
        self.states[index] = SlotState::Acquiring;
        let (image_index, acquire_suboptimal) = match backend.acquire(index, slot) {
            Ok(AcquireOutcome::Ready {
                image_index,
                suboptimal,
            }) => (image_index, suboptimal),
            Ok(AcquireOutcome::OutOfDate) => {
                // Fence untouched, so the next wait on this slot returns at once
                self.states[index] = SlotState::Idle;
                log::debug!("Swapchain out of date at acquire, skipping frame");
                return Ok(FrameOutcome::Skipped);
            }
            Err(e) => {
                self.states[index] = SlotState::Idle;
                return Err(e);
            }
        };

        // ─────────────────────────────────────────────────────────────────────
        // STEP 3: Per-frame uniforms
        // ─────────────────────────────────────────────────────────────────────
        // Safe to overwrite: the fence wait above retired the last reader
        if let Err(e) = backend.update_uniforms(index) {
            self.states[index] = SlotState::Idle;
            return Err(e);
        }

        // ─────────────────────────────────────────────────────────────────────
        // STEP 4: Reset fence, record and submit
        // ─────────────────────────────────────────────────────────────────────
        // Only reset once we know work will be submitted, or the next wait
        // on this fence would never return
        backend.reset_fence(index, slot)?;
        self.states[index] = SlotState::Recording;
        backend.submit(index, slot, image_index)?;
        self.states[index] = SlotState::Submitted;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 5: Present
        // ─────────────────────────────────────────────────────────────────────
        let present = backend.present(index, slot, image_index);

        // ─────────────────────────────────────────────────────────────────────
        // STEP 6: Advance to next slot
        // ─────────────────────────────────────────────────────────────────────
        // The submission happened either way, so advance even if present failed
        self.advance();

        let present = present?;
        if acquire_suboptimal || present.needs_rebuild() {
            Ok(FrameOutcome::PresentedStale)
        } else {
            Ok(FrameOutcome::Presented)
        }
    }
}

// =============================================================================
// SCHEDULER
// =============================================================================

pub struct FrameSlot {
    pub command_buffer: vk::CommandBuffer,
    pub sync: FrameSync,
}

/// Borrowed state for one draw
pub struct FrameInputs<'a, U> {
    pub swapchain: &'a Swapchain,
    pub pipeline: &'a PipelineState,
    pub vertex_buffer: &'a GpuBuffer,
    pub index_buffer: &'a GpuBuffer,
    pub index_count: u32,
    /// One per slot, written after the slot's fence wait
    pub uniform_buffers: &'a mut [GpuBuffer],
    /// Evaluated after acquire, against the extent being drawn to
    pub uniforms: &'a dyn Fn(vk::Extent2D) -> U,
    /// One per slot
    pub descriptor_sets: &'a [vk::DescriptorSet],
    pub clear_color: [f32; 4],
}

pub struct FrameScheduler {
    ring: FrameRing<FrameSlot>,
    command_pool: vk::CommandPool,
    device: Arc<VulkanDevice>,
}

impl FrameScheduler {
    pub fn new(device: Arc<VulkanDevice>) -> GfxResult<Self> {
        // RESET_COMMAND_BUFFER: every slot re-records its buffer each frame
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(device.queue_families.graphics)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let command_pool = unsafe { device.device.create_command_pool(&pool_info, None) }
            .check("vkCreateCommandPool")?;

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(MAX_FRAMES_IN_FLIGHT as u32);

        let command_buffers = match unsafe { device.device.allocate_command_buffers(&alloc_info) }
            .check("vkAllocateCommandBuffers")
        {
            Ok(buffers) => buffers,
            Err(e) => {
                unsafe { device.device.destroy_command_pool(command_pool, None) };
                return Err(e);
            }
        };

        let mut slots = Vec::with_capacity(MAX_FRAMES_IN_FLIGHT);
        for command_buffer in command_buffers {
            match FrameSync::new(device.clone()) {
                Ok(sync) => slots.push(FrameSlot {
                    command_buffer,
                    sync,
                }),
                Err(e) => {
                    drop(slots);
                    unsafe { device.device.destroy_command_pool(command_pool, None) };
                    return Err(e);
                }
            }
        }

        log::info!("Created {} frame slots", slots.len());

        Ok(Self {
            ring: FrameRing::new(slots),
            command_pool,
            device,
        })
    }

    pub fn in_flight_count(&self) -> usize {
        self.ring.in_flight_count()
    }

    pub fn draw_frame<U: Pod>(&mut self, inputs: FrameInputs<'_, U>) -> GfxResult<FrameOutcome> {
        let mut backend = VulkanFrame {
            device: &self.device,
            inputs,
        };
        self.ring.draw(&mut backend)
    }
}

/// One frame's worth of Vulkan calls against a `FrameSlot`
struct VulkanFrame<'d, 'a, U> {
    device: &'d VulkanDevice,
    inputs: FrameInputs<'a, U>,
}

impl<U: Pod> FrameBackend<FrameSlot> for VulkanFrame<'_, '_, U> {
    fn wait(&mut self, _index: usize, slot: &FrameSlot) -> GfxResult<()> {
        slot.sync.wait()
    }

    fn acquire(&mut self, _index: usize, slot: &FrameSlot) -> GfxResult<AcquireOutcome> {
        self.inputs
            .swapchain
            .acquire_next_image(u64::MAX, slot.sync.image_available)
    }

    fn update_uniforms(&mut self, index: usize) -> GfxResult<()> {
        let data = (self.inputs.uniforms)(self.inputs.swapchain.extent);
        self.inputs.uniform_buffers[index].write_mapped(bytemuck::bytes_of(&data))
    }

    fn reset_fence(&mut self, _index: usize, slot: &FrameSlot) -> GfxResult<()> {
        slot.sync.reset()
    }

    fn submit(&mut self, index: usize, slot: &FrameSlot, image_index: u32) -> GfxResult<()> {
        let device = &self.device.device;
        unsafe {
            record_draw(
                device,
                slot.command_buffer,
                &self.inputs,
                image_index,
                self.inputs.descriptor_sets[index],
            )?;
        }

        let wait_semaphores = [slot.sync.image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let signal_semaphores = [slot.sync.render_finished];
        let command_buffers = [slot.command_buffer];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            device.queue_submit(
                self.device.graphics_queue,
                &[submit_info.build()],
                slot.sync.in_flight_fence,
            )
        }
        .check("vkQueueSubmit")
    }

    fn present(&mut self, _index: usize, slot: &FrameSlot, image_index: u32) -> GfxResult<PresentOutcome> {
        self.inputs.swapchain.present(
            self.device.present_queue,
            image_index,
            &[slot.sync.render_finished],
        )
    }
}

/// Record the full render pass for one frame into `cmd`
unsafe fn record_draw<U>(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    inputs: &FrameInputs<'_, U>,
    image_index: u32,
    descriptor_set: vk::DescriptorSet,
) -> GfxResult<()> {
    let extent = inputs.swapchain.extent;

    device
        .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
        .check("vkResetCommandBuffer")?;
    let begin_info = vk::CommandBufferBeginInfo::builder();
    device
        .begin_command_buffer(cmd, &begin_info)
        .check("vkBeginCommandBuffer")?;

    let clear_values = [vk::ClearValue {
        color: vk::ClearColorValue {
            float32: inputs.clear_color,
        },
    }];
    let render_area = vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent,
    };
    let render_pass_info = vk::RenderPassBeginInfo::builder()
        .render_pass(inputs.pipeline.render_pass)
        .framebuffer(inputs.pipeline.framebuffers[image_index as usize])
        .render_area(render_area)
        .clear_values(&clear_values);

    device.cmd_begin_render_pass(cmd, &render_pass_info, vk::SubpassContents::INLINE);
    device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, inputs.pipeline.pipeline);

    // Dynamic state: always the extent of the swapchain being drawn to
    let viewport = vk::Viewport {
        x: 0.0,
        y: 0.0,
        width: extent.width as f32,
        height: extent.height as f32,
        min_depth: 0.0,
        max_depth: 1.0,
    };
    device.cmd_set_viewport(cmd, 0, &[viewport]);
    device.cmd_set_scissor(cmd, 0, &[render_area]);

    device.cmd_bind_vertex_buffers(cmd, 0, &[inputs.vertex_buffer.buffer], &[0]);
    device.cmd_bind_index_buffer(cmd, inputs.index_buffer.buffer, 0, vk::IndexType::UINT16);
    device.cmd_bind_descriptor_sets(
        cmd,
        vk::PipelineBindPoint::GRAPHICS,
        inputs.pipeline.pipeline_layout,
        0,
        &[descriptor_set],
        &[],
    );
    device.cmd_draw_indexed(cmd, inputs.index_count, 1, 0, 0, 0);

    device.cmd_end_render_pass(cmd);
    device.end_command_buffer(cmd).check("vkEndCommandBuffer")
}

impl Drop for FrameScheduler {
    fn drop(&mut self) {
        // Freeing the pool frees its command buffers; FrameSync cleans up
        // the semaphores and fences when the ring drops
        unsafe {
            self.device
                .device
                .destroy_command_pool(self.command_pool, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::error::GfxError;
    use std::collections::VecDeque;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Call {
        Wait(usize),
        Acquire(usize),
        Uniforms(usize),
        Reset(usize),
        Submit(usize),
        Present(usize),
    }

    /// Fences and a queue that only make progress when told to. A fence
    /// signals when its submission completes, either because the test
    /// finishes it or because a wait blocks on it.
    struct FakeGpu {
        signaled: Vec<bool>,
        /// Slots with submitted work still running, oldest first
        pending: VecDeque<usize>,
        peak_pending: usize,
        blocked_waits: usize,
        acquires: VecDeque<GfxResult<AcquireOutcome>>,
        presents: VecDeque<GfxResult<PresentOutcome>>,
        calls: Vec<Call>,
    }

    impl FakeGpu {
        fn new() -> Self {
            Self {
                // created signaled, like FrameSync
                signaled: vec![true; MAX_FRAMES_IN_FLIGHT],
                pending: VecDeque::new(),
                peak_pending: 0,
                blocked_waits: 0,
                acquires: VecDeque::new(),
                presents: VecDeque::new(),
                calls: Vec::new(),
            }
        }

        fn finish_oldest(&mut self) {
            if let Some(slot) = self.pending.pop_front() {
                self.signaled[slot] = true;
            }
        }

        fn device_lost(call: &'static str) -> GfxError {
            GfxError::Vulkan {
                call,
                result: vk::Result::ERROR_DEVICE_LOST,
            }
        }
    }

    impl FrameBackend<()> for FakeGpu {
        fn wait(&mut self, index: usize, _slot: &()) -> GfxResult<()> {
            self.calls.push(Call::Wait(index));
            if self.signaled[index] {
                return Ok(());
            }
            if !self.pending.contains(&index) {
                // Unsignaled with nothing queued: a real wait never returns
                return Err(GfxError::Vulkan {
                    call: "vkWaitForFences",
                    result: vk::Result::TIMEOUT,
                });
            }
            // Blocks until the queue drains through this slot's work
            self.blocked_waits += 1;
            while !self.signaled[index] {
                self.finish_oldest();
            }
            Ok(())
        }

        fn acquire(&mut self, index: usize, _slot: &()) -> GfxResult<AcquireOutcome> {
            self.calls.push(Call::Acquire(index));
            self.acquires.pop_front().unwrap_or(Ok(AcquireOutcome::Ready {
                image_index: 0,
                suboptimal: false,
            }))
        }

        fn update_uniforms(&mut self, index: usize) -> GfxResult<()> {
            self.calls.push(Call::Uniforms(index));
            Ok(())
        }

        fn reset_fence(&mut self, index: usize, _slot: &()) -> GfxResult<()> {
            self.calls.push(Call::Reset(index));
            if self.pending.contains(&index) {
                return Err(Self::device_lost("vkResetFences"));
            }
            self.signaled[index] = false;
            Ok(())
        }

        fn submit(&mut self, index: usize, _slot: &(), _image_index: u32) -> GfxResult<()> {
            self.calls.push(Call::Submit(index));
            if self.signaled[index] {
                return Err(Self::device_lost("vkQueueSubmit"));
            }
            self.pending.push_back(index);
            self.peak_pending = self.peak_pending.max(self.pending.len());
            Ok(())
        }

        fn present(&mut self, index: usize, _slot: &(), _image_index: u32) -> GfxResult<PresentOutcome> {
            self.calls.push(Call::Present(index));
            self.presents
                .pop_front()
                .unwrap_or(Ok(PresentOutcome::Presented))
        }
    }

    fn ring() -> FrameRing<()> {
        FrameRing::new(vec![(); MAX_FRAMES_IN_FLIGHT])
    }

    #[test]
    fn submitted_work_never_exceeds_frames_in_flight() {
        let mut ring = ring();
        let mut gpu = FakeGpu::new();

        for frame in 0..60 {
            // the GPU only gets ahead on its own every third frame
            if frame % 3 == 0 {
                gpu.finish_oldest();
            }
            assert_eq!(ring.draw(&mut gpu).unwrap(), FrameOutcome::Presented);
            assert!(gpu.pending.len() <= MAX_FRAMES_IN_FLIGHT);
        }

        assert_eq!(gpu.peak_pending, MAX_FRAMES_IN_FLIGHT);
        assert!(gpu.blocked_waits > 0);
    }

    #[test]
    fn one_frame_runs_in_order() {
        let mut ring = ring();
        let mut gpu = FakeGpu::new();
        ring.draw(&mut gpu).unwrap();

        assert_eq!(
            gpu.calls,
            vec![
                Call::Wait(0),
                Call::Acquire(0),
                Call::Uniforms(0),
                Call::Reset(0),
                Call::Submit(0),
                Call::Present(0),
            ]
        );
        assert_eq!(ring.states[0], SlotState::Submitted);
        assert_eq!(ring.in_flight_count(), 1);
    }

    #[test]
    fn out_of_date_acquire_leaves_fence_signaled() {
        let mut ring = ring();
        let mut gpu = FakeGpu::new();

        // fill both slots so slot 0 has real work behind its fence
        ring.draw(&mut gpu).unwrap();
        ring.draw(&mut gpu).unwrap();
        assert_eq!(ring.current, 0);

        gpu.acquires.push_back(Ok(AcquireOutcome::OutOfDate));
        gpu.calls.clear();
        assert_eq!(ring.draw(&mut gpu).unwrap(), FrameOutcome::Skipped);

        assert_eq!(gpu.calls, vec![Call::Wait(0), Call::Acquire(0)]);
        assert!(gpu.signaled[0]);
        assert_eq!(ring.current, 0);
        assert_eq!(ring.states[0], SlotState::Idle);

        // the retry on the same slot must not hang on its fence
        assert_eq!(ring.draw(&mut gpu).unwrap(), FrameOutcome::Presented);
        assert_eq!(ring.current, 1);
    }

    #[test]
    fn failed_acquire_keeps_the_slot() {
        let mut ring = ring();
        let mut gpu = FakeGpu::new();
        gpu.acquires
            .push_back(Err(FakeGpu::device_lost("vkAcquireNextImageKHR")));

        assert!(ring.draw(&mut gpu).is_err());
        assert!(gpu.signaled[0]);
        assert_eq!(ring.current, 0);
        assert_eq!(ring.states[0], SlotState::Idle);
    }

    #[test]
    fn failed_present_still_advances() {
        let mut ring = ring();
        let mut gpu = FakeGpu::new();
        gpu.presents
            .push_back(Err(FakeGpu::device_lost("vkQueuePresentKHR")));

        assert!(ring.draw(&mut gpu).is_err());
        assert_eq!(ring.current, 1);
        assert_eq!(ring.states[0], SlotState::Submitted);
        assert_eq!(gpu.pending, VecDeque::from([0]));

        // both slots stay usable afterwards
        ring.draw(&mut gpu).unwrap();
        ring.draw(&mut gpu).unwrap();
        assert_eq!(ring.current, 1);
    }

    #[test]
    fn slots_rotate_round_robin() {
        let mut ring = ring();
        let mut gpu = FakeGpu::new();
        let mut visited = Vec::new();
        for _ in 0..5 {
            visited.push(ring.current);
            ring.draw(&mut gpu).unwrap();
        }
        assert_eq!(visited, vec![0, 1, 0, 1, 0]);
    }

    #[test]
    fn suboptimal_signals_surface_as_stale() {
        let mut ring = ring();
        let mut gpu = FakeGpu::new();

        gpu.acquires.push_back(Ok(AcquireOutcome::Ready {
            image_index: 1,
            suboptimal: true,
        }));
        assert_eq!(ring.draw(&mut gpu).unwrap(), FrameOutcome::PresentedStale);

        gpu.presents.push_back(Ok(PresentOutcome::OutOfDate));
        assert_eq!(ring.draw(&mut gpu).unwrap(), FrameOutcome::PresentedStale);

        assert_eq!(ring.draw(&mut gpu).unwrap(), FrameOutcome::Presented);
    }

    #[test]
    fn stale_outcomes_request_rebuild() {
        assert!(!FrameOutcome::Presented.needs_rebuild());
        assert!(FrameOutcome::PresentedStale.needs_rebuild());
        assert!(FrameOutcome::Skipped.needs_rebuild());
    }
}
