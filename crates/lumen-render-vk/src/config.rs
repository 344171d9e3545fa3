// SPDX-License-Identifier: CEPL-1.0
use std::ffi::CString;

use ash::vk;
use serde::Deserialize;

use crate::error::{GpuError, GpuResult};
use crate::physical_device::DeviceRequest;
use crate::queue::QueueCapabilities;
use crate::swapchain::SwapchainPreferences;

/// Which vsync flavour to ask for when vsync is on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresentPreference {
    Fifo,
    #[default]
    Mailbox,
}

/// Optional device features a renderer may require.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceFeature {
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
}

impl DeviceFeature {
    fn slot(self, features: &mut vk::PhysicalDeviceFeatures) -> &mut vk::Bool32 {
        match self {
            DeviceFeature::SamplerAnisotropy => &mut features.sampler_anisotropy,
            DeviceFeature::FillModeNonSolid => &mut features.fill_mode_non_solid,
            DeviceFeature::WideLines => &mut features.wide_lines,
            DeviceFeature::LargePoints => &mut features.large_points,
            DeviceFeature::GeometryShader => &mut features.geometry_shader,
            DeviceFeature::TessellationShader => &mut features.tessellation_shader,
            DeviceFeature::MultiDrawIndirect => &mut features.multi_draw_indirect,
            DeviceFeature::SampleRateShading => &mut features.sample_rate_shading,
            DeviceFeature::IndependentBlend => &mut features.independent_blend,
            DeviceFeature::DepthClamp => &mut features.depth_clamp,
            DeviceFeature::ShaderInt64 => &mut features.shader_int64,
            DeviceFeature::SparseBinding => &mut features.sparse_binding,
        }
    }

    pub fn is_supported(self, features: &vk::PhysicalDeviceFeatures) -> bool {
        let mut copy = *features;
        *self.slot(&mut copy) == vk::TRUE
    }

    pub fn enable(self, features: &mut vk::PhysicalDeviceFeatures) {
        *self.slot(features) = vk::TRUE;
    }
}

/// Renderer settings read from the `[render]` table of `lumen.toml`.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct GpuConfig {
    pub validation: bool,
    pub vsync: bool,
    pub present_mode: PresentPreference,
    pub depth: bool,
    pub clear_color: [f32; 4],
    pub compute_queue: bool,
    pub transfer_queue: bool,
    pub sparse_binding_queue: bool,
    pub features: Vec<DeviceFeature>,
    pub extensions: Vec<String>,
}

impl Default for GpuConfig {
    fn default() -> Self {
        Self {
            validation: cfg!(debug_assertions),
            vsync: true,
            present_mode: PresentPreference::Mailbox,
            depth: false,
            clear_color: [0.02, 0.02, 0.04, 1.0],
            compute_queue: false,
            transfer_queue: true,
            sparse_binding_queue: false,
            features: Vec::new(),
            extensions: Vec::new(),
        }
    }
}

impl GpuConfig {
    pub fn queue_capabilities(&self) -> QueueCapabilities {
        let mut caps = QueueCapabilities::GRAPHICS | QueueCapabilities::PRESENT;
        caps.set(QueueCapabilities::COMPUTE, self.compute_queue);
        caps.set(QueueCapabilities::TRANSFER, self.transfer_queue);
        caps.set(QueueCapabilities::SPARSE_BINDING, self.sparse_binding_queue);
        caps
    }

    /// Device requirements: the swapchain extension plus anything configured.
    pub fn device_request(&self) -> GpuResult<DeviceRequest> {
        let mut extensions = vec![CString::from(ash::khr::swapchain::NAME)];
        for name in &self.extensions {
            let name = CString::new(name.as_str())
                .map_err(|_| GpuError::configuration(format!("extension name {name:?} contains NUL")))?;
            if !extensions.contains(&name) {
                extensions.push(name);
            }
        }

        let mut features = self.features.clone();
        if self.sparse_binding_queue && !features.contains(&DeviceFeature::SparseBinding) {
            features.push(DeviceFeature::SparseBinding);
        }

        Ok(DeviceRequest {
            queues: self.queue_capabilities(),
            extensions,
            features,
        })
    }

    pub fn swapchain_preferences(&self) -> SwapchainPreferences {
        SwapchainPreferences {
            vsync: self.vsync,
            present: self.present_mode,
            ..SwapchainPreferences::default()
        }
    }
}
