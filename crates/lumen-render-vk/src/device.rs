// SPDX-License-Identifier: CEPL-1.0
use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::sync::Arc;

use ash::vk;
use tracing::{debug, info};

use crate::config::DeviceFeature;
use crate::error::{GpuError, GpuResult, VkResultExt};
use crate::instance::InstanceContext;
use crate::physical_device::SelectedDevice;
use crate::queue::{Capability, QueueFamilyIndices};

/// Logical device with one queue per distinct resolved family.
pub struct Device {
    raw: ash::Device,
    physical: vk::PhysicalDevice,
    name: String,
    indices: QueueFamilyIndices,
    queues: Vec<(u32, vk::Queue)>,
    supported_features: vk::PhysicalDeviceFeatures,
    enabled_features: vk::PhysicalDeviceFeatures,
    supported_extensions: Vec<CString>,
    enabled_extensions: Vec<CString>,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    instance: Arc<InstanceContext>,
}

/// Checks that everything about to be enabled was reported as supported.
fn validate_enables(selected: &SelectedDevice) -> GpuResult<()> {
    let unsupported: Vec<String> = selected
        .enabled_extensions
        .iter()
        .filter(|e| !selected.candidate.supports_extension(e))
        .map(|e| e.to_string_lossy().into_owned())
        .collect();
    if !unsupported.is_empty() {
        return Err(GpuError::configuration(format!(
            "{} does not support extensions {}",
            selected.candidate.name,
            unsupported.join(", ")
        )));
    }

    let requested = features_in(&selected.enabled_features);
    let unsupported: Vec<DeviceFeature> = requested
        .into_iter()
        .filter(|f| !f.is_supported(&selected.candidate.features))
        .collect();
    if !unsupported.is_empty() {
        return Err(GpuError::configuration(format!(
            "{} does not support features {unsupported:?}",
            selected.candidate.name
        )));
    }
    Ok(())
}

fn features_in(features: &vk::PhysicalDeviceFeatures) -> Vec<DeviceFeature> {
    use DeviceFeature::*;
    [
        SamplerAnisotropy,
        FillModeNonSolid,
        WideLines,
        LargePoints,
        GeometryShader,
        TessellationShader,
        MultiDrawIndirect,
        SampleRateShading,
        IndependentBlend,
        DepthClamp,
        ShaderInt64,
        SparseBinding,
    ]
    .into_iter()
    .filter(|f| f.is_supported(features))
    .collect()
}

/// Fetches one queue per distinct family. The present queue reuses an
/// already fetched handle when its family was resolved for another capability.
pub(crate) fn fetch_queues(
    indices: &QueueFamilyIndices,
    mut get_queue: impl FnMut(u32) -> vk::Queue,
) -> Vec<(u32, vk::Queue)> {
    let mut queues: Vec<(u32, vk::Queue)> = Vec::new();
    for cap in [
        Capability::Graphics,
        Capability::Compute,
        Capability::Transfer,
        Capability::SparseBinding,
    ] {
        if let Some(family) = indices.index(cap) {
            if !queues.iter().any(|&(f, _)| f == family) {
                queues.push((family, get_queue(family)));
            }
        }
    }
    if let Some(family) = indices.index(Capability::Present) {
        if !queues.iter().any(|&(f, _)| f == family) {
            queues.push((family, get_queue(family)));
        }
    }
    queues
}

impl Device {
    pub fn new(instance: Arc<InstanceContext>, selected: SelectedDevice) -> GpuResult<Arc<Self>> {
        validate_enables(&selected)?;

        let SelectedDevice {
            candidate,
            indices,
            enabled_extensions,
            enabled_features,
        } = selected;

        let priorities = [1.0_f32];
        let queue_infos: Vec<vk::DeviceQueueCreateInfo> = indices
            .distinct_families()
            .into_iter()
            .map(|family| vk::DeviceQueueCreateInfo {
                s_type: vk::StructureType::DEVICE_QUEUE_CREATE_INFO,
                queue_family_index: family,
                queue_count: 1,
                p_queue_priorities: priorities.as_ptr(),
                ..Default::default()
            })
            .collect();

        let ext_ptrs: Vec<*const c_char> = enabled_extensions.iter().map(|e| e.as_ptr()).collect();
        let dinfo = vk::DeviceCreateInfo {
            s_type: vk::StructureType::DEVICE_CREATE_INFO,
            queue_create_info_count: queue_infos.len() as u32,
            p_queue_create_infos: queue_infos.as_ptr(),
            enabled_extension_count: ext_ptrs.len() as u32,
            pp_enabled_extension_names: ext_ptrs.as_ptr(),
            p_enabled_features: &enabled_features,
            ..Default::default()
        };

        let raw_instance = instance.raw();
        // SAFETY: queue infos, extension names and features outlive the call.
        let raw = unsafe { raw_instance.create_device(candidate.handle, &dinfo, None) }.created("logical device")?;
        let queues = fetch_queues(&indices, |family| unsafe { raw.get_device_queue(family, 0) });
        let memory_properties = unsafe { raw_instance.get_physical_device_memory_properties(candidate.handle) };

        debug!("queue create infos: {}, fetched queues: {:?}", queue_infos.len(), queues);
        info!(
            "logical device on {} (shared graphics/present: {}, dedicated compute: {}, dedicated transfer: {})",
            candidate.name,
            indices.shared_graphics_present,
            indices.is_dedicated(Capability::Compute),
            indices.is_dedicated(Capability::Transfer),
        );

        Ok(Arc::new(Self {
            raw,
            physical: candidate.handle,
            name: candidate.name,
            indices,
            queues,
            supported_features: candidate.features,
            enabled_features,
            supported_extensions: candidate.extensions,
            enabled_extensions,
            memory_properties,
            instance,
        }))
    }

    pub fn raw(&self) -> &ash::Device {
        &self.raw
    }

    pub fn instance(&self) -> &Arc<InstanceContext> {
        &self.instance
    }

    pub fn physical(&self) -> vk::PhysicalDevice {
        self.physical
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn indices(&self) -> &QueueFamilyIndices {
        &self.indices
    }

    pub fn family(&self, cap: Capability) -> Option<u32> {
        self.indices.index(cap)
    }

    pub fn queue_for_family(&self, family: u32) -> Option<vk::Queue> {
        self.queues.iter().find(|&&(f, _)| f == family).map(|&(_, q)| q)
    }

    pub fn queue(&self, cap: Capability) -> Option<vk::Queue> {
        self.family(cap).and_then(|f| self.queue_for_family(f))
    }

    pub fn is_dedicated(&self, cap: Capability) -> bool {
        self.indices.is_dedicated(cap)
    }

    pub fn has_shared_graphics_present(&self) -> bool {
        self.indices.shared_graphics_present
    }

    pub fn is_extension_supported(&self, name: &CStr) -> bool {
        self.supported_extensions.iter().any(|e| e.as_c_str() == name)
    }

    pub fn is_extension_enabled(&self, name: &CStr) -> bool {
        self.enabled_extensions.iter().any(|e| e.as_c_str() == name)
    }

    pub fn supported_features(&self) -> &vk::PhysicalDeviceFeatures {
        &self.supported_features
    }

    pub fn enabled_features(&self) -> &vk::PhysicalDeviceFeatures {
        &self.enabled_features
    }

    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    pub fn wait_idle(&self) -> GpuResult<()> {
        unsafe { self.raw.device_wait_idle() }.during("vkDeviceWaitIdle")
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        unsafe {
            self.raw.device_wait_idle().ok();
            self.raw.destroy_device(None);
        }
    }
}
