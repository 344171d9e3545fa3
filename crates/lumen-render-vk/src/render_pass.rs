// SPDX-License-Identifier: CEPL-1.0
use ash::vk;

use crate::error::{GpuError, GpuResult, VkResultExt};
use crate::swapchain::SwapchainInfo;

/// Depth candidates in order of preference.
pub const DEPTH_FORMATS: [vk::Format; 4] = [
    vk::Format::D32_SFLOAT,
    vk::Format::D24_UNORM_S8_UINT,
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D16_UNORM,
];

/// A pass that renders into a depth attachment besides the colour target.
pub trait HasDepthAttachment {
    fn depth_format(&self) -> vk::Format;

    fn has_stencil(&self) -> bool {
        matches!(
            self.depth_format(),
            vk::Format::D24_UNORM_S8_UINT | vk::Format::D32_SFLOAT_S8_UINT
        )
    }
}

pub struct ColorPass {
    raw: vk::RenderPass,
    format: vk::Format,
}

pub struct ColorDepthPass {
    raw: vk::RenderPass,
    format: vk::Format,
    depth_format: vk::Format,
}

impl HasDepthAttachment for ColorDepthPass {
    fn depth_format(&self) -> vk::Format {
        self.depth_format
    }
}

pub enum RenderPassKind {
    Color(ColorPass),
    ColorDepth(ColorDepthPass),
}

impl RenderPassKind {
    /// Single-subpass pass targeting the swapchain, with a depth attachment
    /// when `depth` is given. Must be destroyed with [`destroy`](Self::destroy).
    pub fn create(device: &ash::Device, swapchain: &dyn SwapchainInfo, depth: Option<vk::Format>) -> GpuResult<Self> {
        let format = swapchain.format();
        let raw = create_render_pass(device, format, swapchain.sample_count(), depth)?;
        Ok(match depth {
            Some(depth_format) => RenderPassKind::ColorDepth(ColorDepthPass {
                raw,
                format,
                depth_format,
            }),
            None => RenderPassKind::Color(ColorPass { raw, format }),
        })
    }

    pub fn raw(&self) -> vk::RenderPass {
        match self {
            RenderPassKind::Color(p) => p.raw,
            RenderPassKind::ColorDepth(p) => p.raw,
        }
    }

    pub fn color_format(&self) -> vk::Format {
        match self {
            RenderPassKind::Color(p) => p.format,
            RenderPassKind::ColorDepth(p) => p.format,
        }
    }

    pub fn depth_attachment(&self) -> Option<&dyn HasDepthAttachment> {
        match self {
            RenderPassKind::Color(_) => None,
            RenderPassKind::ColorDepth(p) => Some(p),
        }
    }

    pub fn clear_values(&self, rgba: [f32; 4]) -> Vec<vk::ClearValue> {
        let mut values = vec![vk::ClearValue {
            color: vk::ClearColorValue { float32: rgba },
        }];
        if self.depth_attachment().is_some() {
            values.push(vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue { depth: 1.0, stencil: 0 },
            });
        }
        values
    }

    pub fn destroy(&self, device: &ash::Device) {
        unsafe { device.destroy_render_pass(self.raw(), None) };
    }
}

/// First candidate `supports` accepts as an optimal-tiling depth attachment.
pub fn pick_depth_format(supports: impl Fn(vk::Format) -> bool) -> Option<vk::Format> {
    DEPTH_FORMATS.into_iter().find(|&f| supports(f))
}

pub fn find_depth_format(instance: &ash::Instance, phys: vk::PhysicalDevice) -> GpuResult<vk::Format> {
    pick_depth_format(|fmt| {
        let props = unsafe { instance.get_physical_device_format_properties(phys, fmt) };
        props
            .optimal_tiling_features
            .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
    })
    .ok_or_else(|| GpuError::configuration("no depth format usable as an attachment"))
}

pub fn attachment_descriptions(
    format: vk::Format,
    samples: vk::SampleCountFlags,
    depth: Option<vk::Format>,
) -> Vec<vk::AttachmentDescription> {
    let mut attachments = vec![vk::AttachmentDescription {
        format,
        samples,
        load_op: vk::AttachmentLoadOp::CLEAR,
        store_op: vk::AttachmentStoreOp::STORE,
        stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
        stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
        initial_layout: vk::ImageLayout::UNDEFINED,
        final_layout: vk::ImageLayout::PRESENT_SRC_KHR,
        ..Default::default()
    }];
    if let Some(depth_format) = depth {
        attachments.push(vk::AttachmentDescription {
            format: depth_format,
            samples,
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: vk::AttachmentStoreOp::DONT_CARE,
            stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
            stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            final_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            ..Default::default()
        });
    }
    attachments
}

pub fn create_render_pass(
    device: &ash::Device,
    format: vk::Format,
    samples: vk::SampleCountFlags,
    depth: Option<vk::Format>,
) -> GpuResult<vk::RenderPass> {
    let attachments = attachment_descriptions(format, samples, depth);
    let color_ref = vk::AttachmentReference {
        attachment: 0,
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    };
    let depth_ref = vk::AttachmentReference {
        attachment: 1,
        layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
    };
    let subpass = vk::SubpassDescription {
        pipeline_bind_point: vk::PipelineBindPoint::GRAPHICS,
        color_attachment_count: 1,
        p_color_attachments: &color_ref,
        p_depth_stencil_attachment: if depth.is_some() {
            &depth_ref
        } else {
            std::ptr::null()
        },
        ..Default::default()
    };

    // The acquire semaphore is waited on at colour output; hold the layout
    // transition (and the depth clear) until then.
    let mut stages = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT;
    let mut access = vk::AccessFlags::COLOR_ATTACHMENT_WRITE;
    if depth.is_some() {
        stages |= vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS;
        access |= vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE;
    }
    let dependency = vk::SubpassDependency {
        src_subpass: vk::SUBPASS_EXTERNAL,
        dst_subpass: 0,
        src_stage_mask: stages,
        dst_stage_mask: stages,
        src_access_mask: vk::AccessFlags::empty(),
        dst_access_mask: access,
        ..Default::default()
    };

    let info = vk::RenderPassCreateInfo {
        s_type: vk::StructureType::RENDER_PASS_CREATE_INFO,
        attachment_count: attachments.len() as u32,
        p_attachments: attachments.as_ptr(),
        subpass_count: 1,
        p_subpasses: &subpass,
        dependency_count: 1,
        p_dependencies: &dependency,
        ..Default::default()
    };
    unsafe { device.create_render_pass(&info, None) }.created("render pass")
}
