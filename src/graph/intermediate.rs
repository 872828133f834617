//! Recording for the canned subgraphs `add_intermediate_pass` declares:
//! `CopyBuffer`/`BlitTexture`/`GenerateMipmaps` compile straight to a
//! command sequence with no user callback (spec §4.I/§4.J).

use ash::vk;

use crate::command::CommandBuffer;
use crate::resource::{max_mip_count, ResourceManager};
use crate::vulkan::Gpu;

use super::builder::IntermediateOp;

pub(crate) fn record(cmd: &mut CommandBuffer, gpu: &Gpu, resources: &ResourceManager, op: &IntermediateOp) {
    match op {
        IntermediateOp::CopyBuffer { src, dst, size, src_offset, dst_offset } => {
            let src_raw = resources.buffer_raw(*src).expect("CopyBuffer references an invalid source buffer handle");
            let dst_raw = resources.buffer_raw(*dst).expect("CopyBuffer references an invalid destination buffer handle");
            let region = vk::BufferCopy { src_offset: *src_offset, dst_offset: *dst_offset, size: *size };
            cmd.cmd_copy_buffer(gpu, src_raw, dst_raw, &[region]);
        }
        IntermediateOp::BlitTexture { src, dst } => {
            let src_image = resources.texture_image(src.texture_handle).expect("BlitTexture references an invalid source texture handle");
            let dst_image = resources.texture_image(dst.texture_handle).expect("BlitTexture references an invalid destination texture handle");
            let src_extent = resources.texture_extent(src.texture_handle).expect("invalid source texture handle");
            let dst_extent = resources.texture_extent(dst.texture_handle).expect("invalid destination texture handle");

            let region = vk::ImageBlit {
                src_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: src.base_mip,
                    base_array_layer: src.base_layer,
                    layer_count: src.num_layers.unwrap_or(1),
                },
                src_offsets: [
                    vk::Offset3D::default(),
                    vk::Offset3D { x: src_extent.width as i32, y: src_extent.height as i32, z: src_extent.depth as i32 },
                ],
                dst_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: dst.base_mip,
                    base_array_layer: dst.base_layer,
                    layer_count: dst.num_layers.unwrap_or(1),
                },
                dst_offsets: [
                    vk::Offset3D::default(),
                    vk::Offset3D { x: dst_extent.width as i32, y: dst_extent.height as i32, z: dst_extent.depth as i32 },
                ],
            };

            cmd.cmd_blit_image(
                gpu,
                src_image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                dst_image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
                vk::Filter::LINEAR,
            );
        }
        IntermediateOp::GenerateMipmaps { texture } => {
            let image = resources.texture_image(*texture).expect("GenerateMipmaps references an invalid texture handle");
            let extent = resources.texture_extent(*texture).expect("invalid texture handle");
            let num_mips = max_mip_count(extent);

            let mut src_width = extent.width as i32;
            let mut src_height = extent.height as i32;

            for level in 1..num_mips {
                let dst_width = (src_width / 2).max(1);
                let dst_height = (src_height / 2).max(1);

                let region = vk::ImageBlit {
                    src_subresource: vk::ImageSubresourceLayers {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        mip_level: level - 1,
                        base_array_layer: 0,
                        layer_count: 1,
                    },
                    src_offsets: [vk::Offset3D::default(), vk::Offset3D { x: src_width, y: src_height, z: 1 }],
                    dst_subresource: vk::ImageSubresourceLayers {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        mip_level: level,
                        base_array_layer: 0,
                        layer_count: 1,
                    },
                    dst_offsets: [vk::Offset3D::default(), vk::Offset3D { x: dst_width, y: dst_height, z: 1 }],
                };

                cmd.cmd_blit_image(
                    gpu,
                    image,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[region],
                    vk::Filter::LINEAR,
                );

                // The level just blitted into becomes the source for the
                // next iteration; flip it TRANSFER_DST -> TRANSFER_SRC
                // before that happens. Internal to this op, so it bypasses
                // the coarse per-pass tracker barrier.
                if level + 1 < num_mips {
                    let barrier = vk::ImageMemoryBarrier2::default()
                        .src_stage_mask(vk::PipelineStageFlags2::TRANSFER)
                        .src_access_mask(vk::AccessFlags2::TRANSFER_WRITE)
                        .dst_stage_mask(vk::PipelineStageFlags2::TRANSFER)
                        .dst_access_mask(vk::AccessFlags2::TRANSFER_READ)
                        .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                        .new_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
                        .image(image)
                        .subresource_range(vk::ImageSubresourceRange {
                            aspect_mask: vk::ImageAspectFlags::COLOR,
                            base_mip_level: level,
                            level_count: 1,
                            base_array_layer: 0,
                            layer_count: 1,
                        });
                    let dependency_info = vk::DependencyInfo::default().image_memory_barriers(std::slice::from_ref(&barrier));
                    cmd.cmd_pipeline_barrier2(gpu, &dependency_info);
                }

                src_width = dst_width;
                src_height = dst_height;
            }
        }
    }
}
