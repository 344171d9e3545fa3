// SPDX-License-Identifier: CEPL-1.0
//! The Vulkan calls the swapchain and frame loop make, behind a trait so the
//! state machines above can be driven without a GPU.

use std::sync::Arc;

use ash::khr::swapchain;
use ash::vk;

use crate::device::Device;
use crate::error::{GpuError, GpuResult, VkResultExt};
use crate::queue::Capability;
use crate::surface::SurfaceContext;
use crate::swapchain::SwapchainPlan;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AcquiredImage {
    pub index: u32,
    pub suboptimal: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PresentStatus {
    Optimal,
    Suboptimal,
}

/// Swapchain, sync-object and queue operations used per frame.
///
/// Out-of-date results from acquire and present come back as
/// [`GpuError::SurfaceOutOfDate`].
pub trait GpuOps {
    fn surface_capabilities(&self) -> GpuResult<vk::SurfaceCapabilitiesKHR>;
    fn surface_formats(&self) -> GpuResult<Vec<vk::SurfaceFormatKHR>>;
    fn present_modes(&self) -> GpuResult<Vec<vk::PresentModeKHR>>;

    fn create_swapchain(&self, plan: &SwapchainPlan, old: vk::SwapchainKHR) -> GpuResult<vk::SwapchainKHR>;
    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR);
    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> GpuResult<Vec<vk::Image>>;
    fn create_image_view(&self, image: vk::Image, format: vk::Format) -> GpuResult<vk::ImageView>;
    fn destroy_image_view(&self, view: vk::ImageView);

    fn create_fence(&self, signaled: bool) -> GpuResult<vk::Fence>;
    fn destroy_fence(&self, fence: vk::Fence);
    fn create_semaphore(&self) -> GpuResult<vk::Semaphore>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);
    fn wait_fence(&self, fence: vk::Fence) -> GpuResult<()>;
    fn reset_fence(&self, fence: vk::Fence) -> GpuResult<()>;

    fn acquire_next_image(&self, swapchain: vk::SwapchainKHR, signal: vk::Semaphore) -> GpuResult<AcquiredImage>;
    /// Submits `cmd` to the graphics queue.
    fn submit(
        &self,
        cmd: vk::CommandBuffer,
        wait: vk::Semaphore,
        signal: vk::Semaphore,
        fence: vk::Fence,
    ) -> GpuResult<()>;
    fn present(&self, swapchain: vk::SwapchainKHR, index: u32, wait: vk::Semaphore) -> GpuResult<PresentStatus>;

    fn wait_idle(&self) -> GpuResult<()>;
}

pub struct AshBackend {
    loader: swapchain::Device,
    graphics_queue: vk::Queue,
    present_queue: vk::Queue,
    /// Graphics and present families when they differ.
    concurrent_families: Option<[u32; 2]>,
    surface: Arc<SurfaceContext>,
    device: Arc<Device>,
}

impl AshBackend {
    pub fn new(device: Arc<Device>, surface: Arc<SurfaceContext>) -> GpuResult<Self> {
        let graphics_queue = device
            .queue(Capability::Graphics)
            .ok_or_else(|| GpuError::configuration("device has no graphics queue"))?;
        let present_queue = device
            .queue(Capability::Present)
            .ok_or_else(|| GpuError::configuration("device has no present queue"))?;

        let concurrent_families = match (device.family(Capability::Graphics), device.family(Capability::Present)) {
            (Some(g), Some(p)) if g != p => Some([g, p]),
            _ => None,
        };
        let loader = swapchain::Device::new(device.instance().raw(), device.raw());

        Ok(Self {
            loader,
            graphics_queue,
            present_queue,
            concurrent_families,
            surface,
            device,
        })
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn surface(&self) -> &Arc<SurfaceContext> {
        &self.surface
    }
}

fn out_of_date_or(result: vk::Result, call: &'static str) -> GpuError {
    if result == vk::Result::ERROR_OUT_OF_DATE_KHR {
        GpuError::SurfaceOutOfDate
    } else {
        GpuError::Vk { call, result }
    }
}

impl GpuOps for AshBackend {
    fn surface_capabilities(&self) -> GpuResult<vk::SurfaceCapabilitiesKHR> {
        self.surface.capabilities(self.device.physical())
    }

    fn surface_formats(&self) -> GpuResult<Vec<vk::SurfaceFormatKHR>> {
        self.surface.formats(self.device.physical())
    }

    fn present_modes(&self) -> GpuResult<Vec<vk::PresentModeKHR>> {
        self.surface.present_modes(self.device.physical())
    }

    fn create_swapchain(&self, plan: &SwapchainPlan, old: vk::SwapchainKHR) -> GpuResult<vk::SwapchainKHR> {
        let (sharing, families): (vk::SharingMode, &[u32]) = match &self.concurrent_families {
            Some(f) => (vk::SharingMode::CONCURRENT, f.as_slice()),
            None => (vk::SharingMode::EXCLUSIVE, &[]),
        };
        let info = vk::SwapchainCreateInfoKHR {
            s_type: vk::StructureType::SWAPCHAIN_CREATE_INFO_KHR,
            surface: self.surface.raw(),
            min_image_count: plan.image_count,
            image_format: plan.surface_format.format,
            image_color_space: plan.surface_format.color_space,
            image_extent: plan.extent,
            image_array_layers: 1,
            image_usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
            image_sharing_mode: sharing,
            queue_family_index_count: families.len() as u32,
            p_queue_family_indices: families.as_ptr(),
            pre_transform: plan.pre_transform,
            composite_alpha: plan.composite_alpha,
            present_mode: plan.present_mode,
            clipped: vk::TRUE,
            old_swapchain: old,
            ..Default::default()
        };
        unsafe { self.loader.create_swapchain(&info, None) }.created("swapchain")
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        unsafe { self.loader.destroy_swapchain(swapchain, None) };
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> GpuResult<Vec<vk::Image>> {
        unsafe { self.loader.get_swapchain_images(swapchain) }.during("vkGetSwapchainImagesKHR")
    }

    fn create_image_view(&self, image: vk::Image, format: vk::Format) -> GpuResult<vk::ImageView> {
        let info = vk::ImageViewCreateInfo {
            s_type: vk::StructureType::IMAGE_VIEW_CREATE_INFO,
            image,
            view_type: vk::ImageViewType::TYPE_2D,
            format,
            subresource_range: vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            },
            ..Default::default()
        };
        unsafe { self.device.raw().create_image_view(&info, None) }.created("swapchain image view")
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        unsafe { self.device.raw().destroy_image_view(view, None) };
    }

    fn create_fence(&self, signaled: bool) -> GpuResult<vk::Fence> {
        let info = vk::FenceCreateInfo {
            s_type: vk::StructureType::FENCE_CREATE_INFO,
            flags: if signaled {
                vk::FenceCreateFlags::SIGNALED
            } else {
                vk::FenceCreateFlags::empty()
            },
            ..Default::default()
        };
        unsafe { self.device.raw().create_fence(&info, None) }.created("fence")
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.raw().destroy_fence(fence, None) };
    }

    fn create_semaphore(&self) -> GpuResult<vk::Semaphore> {
        let info = vk::SemaphoreCreateInfo {
            s_type: vk::StructureType::SEMAPHORE_CREATE_INFO,
            ..Default::default()
        };
        unsafe { self.device.raw().create_semaphore(&info, None) }.created("semaphore")
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.raw().destroy_semaphore(semaphore, None) };
    }

    fn wait_fence(&self, fence: vk::Fence) -> GpuResult<()> {
        unsafe { self.device.raw().wait_for_fences(&[fence], true, u64::MAX) }.during("vkWaitForFences")
    }

    fn reset_fence(&self, fence: vk::Fence) -> GpuResult<()> {
        unsafe { self.device.raw().reset_fences(&[fence]) }.during("vkResetFences")
    }

    fn acquire_next_image(&self, swapchain: vk::SwapchainKHR, signal: vk::Semaphore) -> GpuResult<AcquiredImage> {
        match unsafe {
            self.loader
                .acquire_next_image(swapchain, u64::MAX, signal, vk::Fence::null())
        } {
            Ok((index, suboptimal)) => Ok(AcquiredImage { index, suboptimal }),
            Err(result) => Err(out_of_date_or(result, "vkAcquireNextImageKHR")),
        }
    }

    fn submit(
        &self,
        cmd: vk::CommandBuffer,
        wait: vk::Semaphore,
        signal: vk::Semaphore,
        fence: vk::Fence,
    ) -> GpuResult<()> {
        let wait_stage = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT;
        let submit = vk::SubmitInfo {
            s_type: vk::StructureType::SUBMIT_INFO,
            wait_semaphore_count: 1,
            p_wait_semaphores: &wait,
            p_wait_dst_stage_mask: &wait_stage,
            command_buffer_count: 1,
            p_command_buffers: &cmd,
            signal_semaphore_count: 1,
            p_signal_semaphores: &signal,
            ..Default::default()
        };
        unsafe {
            self.device
                .raw()
                .queue_submit(self.graphics_queue, std::slice::from_ref(&submit), fence)
        }
        .during("vkQueueSubmit")
    }

    fn present(&self, swapchain: vk::SwapchainKHR, index: u32, wait: vk::Semaphore) -> GpuResult<PresentStatus> {
        let present = vk::PresentInfoKHR {
            s_type: vk::StructureType::PRESENT_INFO_KHR,
            wait_semaphore_count: 1,
            p_wait_semaphores: &wait,
            swapchain_count: 1,
            p_swapchains: &swapchain,
            p_image_indices: &index,
            ..Default::default()
        };
        match unsafe { self.loader.queue_present(self.present_queue, &present) } {
            Ok(false) => Ok(PresentStatus::Optimal),
            Ok(true) => Ok(PresentStatus::Suboptimal),
            Err(result) => Err(out_of_date_or(result, "vkQueuePresentKHR")),
        }
    }

    fn wait_idle(&self) -> GpuResult<()> {
        self.device.wait_idle()
    }
}
