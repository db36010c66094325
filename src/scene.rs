// Scene data: the textured quad and its per-frame transforms

use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};
use std::mem::{offset_of, size_of};

use crate::backend::pipeline::VertexLayout;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct Vertex {
    pub pos: [f32; 2],
    pub color: [f32; 3],
    pub tex_coord: [f32; 2],
}

impl Vertex {
    /// One interleaved binding; locations match quad.vert
    pub fn layout() -> VertexLayout {
        VertexLayout {
            bindings: vec![vk::VertexInputBindingDescription {
                binding: 0,
                stride: size_of::<Vertex>() as u32,
                input_rate: vk::VertexInputRate::VERTEX,
            }],
            attributes: vec![
                vk::VertexInputAttributeDescription {
                    location: 0,
                    binding: 0,
                    format: vk::Format::R32G32_SFLOAT,
                    offset: offset_of!(Vertex, pos) as u32,
                },
                vk::VertexInputAttributeDescription {
                    location: 1,
                    binding: 0,
                    format: vk::Format::R32G32B32_SFLOAT,
                    offset: offset_of!(Vertex, color) as u32,
                },
                vk::VertexInputAttributeDescription {
                    location: 2,
                    binding: 0,
                    format: vk::Format::R32G32_SFLOAT,
                    offset: offset_of!(Vertex, tex_coord) as u32,
                },
            ],
        }
    }
}

pub const QUAD_VERTICES: [Vertex; 4] = [
    Vertex { pos: [-0.5, -0.5], color: [1.0, 0.0, 0.0], tex_coord: [1.0, 0.0] },
    Vertex { pos: [0.5, -0.5], color: [0.0, 1.0, 0.0], tex_coord: [0.0, 0.0] },
    Vertex { pos: [0.5, 0.5], color: [0.0, 0.0, 1.0], tex_coord: [0.0, 1.0] },
    Vertex { pos: [-0.5, 0.5], color: [1.0, 1.0, 1.0], tex_coord: [1.0, 1.0] },
];

pub const QUAD_INDICES: [u16; 6] = [0, 1, 2, 2, 3, 0];

/// Matches the std140 block at binding 0 of quad.vert
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct UniformBufferObject {
    pub model: Mat4,
    pub view: Mat4,
    pub proj: Mat4,
}

/// Transforms after `elapsed_secs` of rotation at `degrees_per_second`
pub fn uniforms_at(
    elapsed_secs: f32,
    extent: vk::Extent2D,
    degrees_per_second: f32,
) -> UniformBufferObject {
    let model = Mat4::from_rotation_z((elapsed_secs * degrees_per_second).to_radians());
    let view = Mat4::look_at_rh(Vec3::splat(2.0), Vec3::ZERO, Vec3::Z);

    // A zero-height extent never reaches here (minimised windows skip frames)
    let aspect = extent.width as f32 / extent.height.max(1) as f32;
    let mut proj = Mat4::perspective_rh(45f32.to_radians(), aspect, 0.1, 10.0);
    // Vulkan clip space has +Y pointing down
    proj.y_axis.y *= -1.0;

    UniformBufferObject { model, view, proj }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec4;

    const EXTENT: vk::Extent2D = vk::Extent2D {
        width: 800,
        height: 600,
    };

    #[test]
    fn vertex_layout_matches_struct() {
        let layout = Vertex::layout();
        assert_eq!(layout.bindings[0].stride, 28);
        let offsets: Vec<u32> = layout.attributes.iter().map(|a| a.offset).collect();
        assert_eq!(offsets, vec![0, 8, 20]);
    }

    #[test]
    fn indices_cover_both_triangles() {
        assert_eq!(QUAD_INDICES.len(), 6);
        assert!(QUAD_INDICES.iter().all(|&i| (i as usize) < QUAD_VERTICES.len()));
    }

    #[test]
    fn uniform_block_is_three_matrices() {
        assert_eq!(size_of::<UniformBufferObject>(), 3 * 64);
    }

    #[test]
    fn quarter_turn_after_one_second() {
        let ubo = uniforms_at(1.0, EXTENT, 90.0);
        let rotated = ubo.model * Vec4::new(1.0, 0.0, 0.0, 1.0);
        assert!((rotated.x).abs() < 1e-5);
        assert!((rotated.y - 1.0).abs() < 1e-5);
    }

    #[test]
    fn model_is_identity_at_start() {
        let ubo = uniforms_at(0.0, EXTENT, 90.0);
        assert!(ubo.model.abs_diff_eq(Mat4::IDENTITY, 1e-6));
    }

    #[test]
    fn projection_flips_y() {
        let ubo = uniforms_at(0.0, EXTENT, 90.0);
        let unflipped = Mat4::perspective_rh(45f32.to_radians(), 800.0 / 600.0, 0.1, 10.0);
        assert!(ubo.proj.y_axis.y < 0.0);
        assert!((ubo.proj.y_axis.y + unflipped.y_axis.y).abs() < 1e-6);
        assert!((ubo.proj.x_axis.x - unflipped.x_axis.x).abs() < 1e-6);
    }
}
