// Graphics pipeline creation and management
//
// The graphics pipeline defines how vertices are processed and rasterized.
// It includes: vertex input, shaders, rasterization, blending. Viewport and
// scissor are dynamic and set while recording each frame.

use ash::vk;
use std::sync::Arc;

use super::device::VulkanDevice;
use super::error::{GfxError, GfxResult, VkCheck};
use super::shader::create_shader_module;
use super::swapchain::Swapchain;

/// Vertex layout description consumed by the pipeline
pub struct VertexLayout {
    pub bindings: Vec<vk::VertexInputBindingDescription>,
    pub attributes: Vec<vk::VertexInputAttributeDescription>,
}

/// Render pass, layout, pipeline and one framebuffer per swapchain image view
pub struct PipelineState {
    pub render_pass: vk::RenderPass,
    pub pipeline_layout: vk::PipelineLayout,
    pub pipeline: vk::Pipeline,
    pub framebuffers: Vec<vk::Framebuffer>,
    format: vk::Format,
    device: Arc<VulkanDevice>,
}

impl PipelineState {
    /// Build everything against `swapchain`.
    ///
    /// `descriptor_set_layout` is `None` for pipelines that read no uniforms
    /// or textures.
    pub fn new(
        device: Arc<VulkanDevice>,
        swapchain: &Swapchain,
        vert_code: &[u32],
        frag_code: &[u32],
        vertex_layout: &VertexLayout,
        descriptor_set_layout: Option<vk::DescriptorSetLayout>,
    ) -> GfxResult<Self> {
        let format = swapchain.format.format;
        let render_pass = create_render_pass(&device, format)?;

        // Drop cleans up whatever exists if a later step fails
        let mut state = Self {
            render_pass,
            pipeline_layout: vk::PipelineLayout::null(),
            pipeline: vk::Pipeline::null(),
            framebuffers: Vec::new(),
            format,
            device,
        };

        let set_layouts: Vec<vk::DescriptorSetLayout> = descriptor_set_layout.into_iter().collect();
        let layout_info = vk::PipelineLayoutCreateInfo::builder().set_layouts(&set_layouts);
        state.pipeline_layout = unsafe { state.device.device.create_pipeline_layout(&layout_info, None) }
            .check("vkCreatePipelineLayout")?;

        let vert_shader = create_shader_module(&state.device, vert_code)?;
        let frag_shader = match create_shader_module(&state.device, frag_code) {
            Ok(module) => module,
            Err(e) => {
                unsafe { state.device.device.destroy_shader_module(vert_shader, None) };
                return Err(e);
            }
        };

        let pipeline = create_graphics_pipeline(
            &state.device,
            state.render_pass,
            state.pipeline_layout,
            vert_shader,
            frag_shader,
            vertex_layout,
        );

        // Modules are only needed while the pipeline is being compiled
        unsafe {
            state.device.device.destroy_shader_module(vert_shader, None);
            state.device.device.destroy_shader_module(frag_shader, None);
        }
        state.pipeline = pipeline?;

        state.framebuffers = create_framebuffers(&state.device, swapchain, state.render_pass)?;

        log::info!(
            "Graphics pipeline ready ({} framebuffers, {} descriptor set layout(s))",
            state.framebuffers.len(),
            set_layouts.len()
        );
        Ok(state)
    }

    /// Replace the framebuffers after the swapchain was rebuilt
    pub fn rebuild_framebuffers(&mut self, swapchain: &Swapchain) -> GfxResult<()> {
        if swapchain.format.format != self.format {
            return Err(GfxError::SurfaceFormatChanged {
                old: self.format,
                new: swapchain.format.format,
            });
        }

        self.destroy_framebuffers();
        self.framebuffers = create_framebuffers(&self.device, swapchain, self.render_pass)?;
        Ok(())
    }

    fn destroy_framebuffers(&mut self) {
        for framebuffer in self.framebuffers.drain(..) {
            unsafe { self.device.device.destroy_framebuffer(framebuffer, None) };
        }
    }
}

impl Drop for PipelineState {
    fn drop(&mut self) {
        self.destroy_framebuffers();
        unsafe {
            let device = &self.device.device;
            if self.pipeline != vk::Pipeline::null() {
                device.destroy_pipeline(self.pipeline, None);
            }
            if self.pipeline_layout != vk::PipelineLayout::null() {
                device.destroy_pipeline_layout(self.pipeline_layout, None);
            }
            device.destroy_render_pass(self.render_pass, None);
        }
    }
}

/// Subpass dependency that keeps color writes of the next frame from starting
/// before the presentation engine is done reading the image.
pub fn external_color_dependency() -> vk::SubpassDependency {
    vk::SubpassDependency::builder()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
        .src_access_mask(vk::AccessFlags::empty())
        .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
        .dst_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)
        .build()
}

/// Single color attachment: cleared on load, stored, handed to presentation
pub fn color_attachment(format: vk::Format) -> vk::AttachmentDescription {
    vk::AttachmentDescription::builder()
        .format(format)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::STORE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::PRESENT_SRC_KHR)
        .build()
}

fn create_render_pass(device: &VulkanDevice, format: vk::Format) -> GfxResult<vk::RenderPass> {
    let color_attachment_ref = vk::AttachmentReference::builder()
        .attachment(0)
        .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
        .build();

    let color_attachments = &[color_attachment_ref];
    let subpass = vk::SubpassDescription::builder()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(color_attachments)
        .build();

    let attachments = &[color_attachment(format)];
    let subpasses = &[subpass];
    let dependencies = &[external_color_dependency()];

    let render_pass_info = vk::RenderPassCreateInfo::builder()
        .attachments(attachments)
        .subpasses(subpasses)
        .dependencies(dependencies);

    unsafe { device.device.create_render_pass(&render_pass_info, None) }
        .check("vkCreateRenderPass")
}

fn create_framebuffers(
    device: &VulkanDevice,
    swapchain: &Swapchain,
    render_pass: vk::RenderPass,
) -> GfxResult<Vec<vk::Framebuffer>> {
    let mut framebuffers = Vec::with_capacity(swapchain.image_views.len());

    for &image_view in &swapchain.image_views {
        let attachments = &[image_view];
        let framebuffer_info = vk::FramebufferCreateInfo::builder()
            .render_pass(render_pass)
            .attachments(attachments)
            .width(swapchain.extent.width)
            .height(swapchain.extent.height)
            .layers(1);

        match unsafe { device.device.create_framebuffer(&framebuffer_info, None) }
            .check("vkCreateFramebuffer")
        {
            Ok(framebuffer) => framebuffers.push(framebuffer),
            Err(e) => {
                for framebuffer in framebuffers {
                    unsafe { device.device.destroy_framebuffer(framebuffer, None) };
                }
                return Err(e);
            }
        }
    }

    Ok(framebuffers)
}

fn create_graphics_pipeline(
    device: &VulkanDevice,
    render_pass: vk::RenderPass,
    pipeline_layout: vk::PipelineLayout,
    vert_shader: vk::ShaderModule,
    frag_shader: vk::ShaderModule,
    vertex_layout: &VertexLayout,
) -> GfxResult<vk::Pipeline> {
    let entry_point = c"main";

    let vert_stage = vk::PipelineShaderStageCreateInfo::builder()
        .stage(vk::ShaderStageFlags::VERTEX)
        .module(vert_shader)
        .name(entry_point)
        .build();

    let frag_stage = vk::PipelineShaderStageCreateInfo::builder()
        .stage(vk::ShaderStageFlags::FRAGMENT)
        .module(frag_shader)
        .name(entry_point)
        .build();

    let shader_stages = &[vert_stage, frag_stage];

    // Vertex input
    let vertex_input_info = vk::PipelineVertexInputStateCreateInfo::builder()
        .vertex_binding_descriptions(&vertex_layout.bindings)
        .vertex_attribute_descriptions(&vertex_layout.attributes);

    // Input assembly
    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
        .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
        .primitive_restart_enable(false);

    // Viewport and scissor are dynamic; only the counts are baked in
    let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
        .viewport_count(1)
        .scissor_count(1);

    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state = vk::PipelineDynamicStateCreateInfo::builder()
        .dynamic_states(&dynamic_states);

    // Rasterization
    let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
        .depth_clamp_enable(false)
        .rasterizer_discard_enable(false)
        .polygon_mode(vk::PolygonMode::FILL)
        .line_width(1.0)
        .cull_mode(vk::CullModeFlags::BACK)
        .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
        .depth_bias_enable(false);

    // Multisampling (disabled)
    let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
        .sample_shading_enable(false)
        .rasterization_samples(vk::SampleCountFlags::TYPE_1);

    // Color blending (no blending, opaque)
    let color_blend_attachment = vk::PipelineColorBlendAttachmentState::builder()
        .color_write_mask(vk::ColorComponentFlags::RGBA)
        .blend_enable(false)
        .build();

    let color_blend_attachments = &[color_blend_attachment];
    let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
        .logic_op_enable(false)
        .attachments(color_blend_attachments);

    let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
        .stages(shader_stages)
        .vertex_input_state(&vertex_input_info)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterizer)
        .multisample_state(&multisampling)
        .color_blend_state(&color_blending)
        .dynamic_state(&dynamic_state)
        .layout(pipeline_layout)
        .render_pass(render_pass)
        .subpass(0)
        .build();

    let pipelines = unsafe {
        device
            .device
            .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
    }
    .map_err(|(_, result)| GfxError::Vulkan {
        call: "vkCreateGraphicsPipelines",
        result,
    })?;

    Ok(pipelines[0])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn color_attachment_clears_and_ends_presentable() {
        let attachment = color_attachment(vk::Format::B8G8R8A8_SRGB);
        assert_eq!(attachment.load_op, vk::AttachmentLoadOp::CLEAR);
        assert_eq!(attachment.store_op, vk::AttachmentStoreOp::STORE);
        assert_eq!(attachment.initial_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(attachment.final_layout, vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(attachment.samples, vk::SampleCountFlags::TYPE_1);
    }

    #[test]
    fn external_dependency_guards_color_output() {
        let dependency = external_color_dependency();
        assert_eq!(dependency.src_subpass, vk::SUBPASS_EXTERNAL);
        assert_eq!(dependency.dst_subpass, 0);
        assert_eq!(dependency.src_stage_mask, vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT);
        assert_eq!(dependency.dst_stage_mask, vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT);
        assert!(dependency.src_access_mask.is_empty());
        assert_eq!(dependency.dst_access_mask, vk::AccessFlags::COLOR_ATTACHMENT_WRITE);
    }
}
