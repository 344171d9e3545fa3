// SPDX-License-Identifier: CEPL-1.0
use std::sync::Arc;

use ash::khr::surface;
use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

use crate::error::{GpuResult, VkResultExt};
use crate::instance::InstanceContext;

/// Presentable surface for the platform window. Keeps its instance alive.
pub struct SurfaceContext {
    loader: surface::Instance,
    raw: vk::SurfaceKHR,
    instance: Arc<InstanceContext>,
}

impl SurfaceContext {
    pub fn new(
        instance: Arc<InstanceContext>,
        display: RawDisplayHandle,
        window: RawWindowHandle,
    ) -> GpuResult<Arc<Self>> {
        let loader = surface::Instance::new(instance.entry(), instance.raw());
        // SAFETY: the handles come from a live window that outlives the renderer.
        let raw = unsafe {
            ash_window::create_surface(instance.entry(), instance.raw(), display, window, None)
        }
        .created("window surface")?;

        Ok(Arc::new(Self {
            loader,
            raw,
            instance,
        }))
    }

    pub fn raw(&self) -> vk::SurfaceKHR {
        self.raw
    }

    pub fn loader(&self) -> &surface::Instance {
        &self.loader
    }

    pub fn instance(&self) -> &Arc<InstanceContext> {
        &self.instance
    }

    /// Whether queue family `family` of `phys` can present here. Query
    /// failures count as "no".
    pub fn supports_present(&self, phys: vk::PhysicalDevice, family: u32) -> bool {
        unsafe {
            self.loader
                .get_physical_device_surface_support(phys, family, self.raw)
                .unwrap_or(false)
        }
    }

    pub fn capabilities(&self, phys: vk::PhysicalDevice) -> GpuResult<vk::SurfaceCapabilitiesKHR> {
        unsafe { self.loader.get_physical_device_surface_capabilities(phys, self.raw) }
            .during("vkGetPhysicalDeviceSurfaceCapabilitiesKHR")
    }

    pub fn formats(&self, phys: vk::PhysicalDevice) -> GpuResult<Vec<vk::SurfaceFormatKHR>> {
        unsafe { self.loader.get_physical_device_surface_formats(phys, self.raw) }
            .during("vkGetPhysicalDeviceSurfaceFormatsKHR")
    }

    pub fn present_modes(&self, phys: vk::PhysicalDevice) -> GpuResult<Vec<vk::PresentModeKHR>> {
        unsafe { self.loader.get_physical_device_surface_present_modes(phys, self.raw) }
            .during("vkGetPhysicalDeviceSurfacePresentModesKHR")
    }
}

impl Drop for SurfaceContext {
    fn drop(&mut self) {
        unsafe { self.loader.destroy_surface(self.raw, None) };
    }
}
