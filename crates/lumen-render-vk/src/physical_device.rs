// SPDX-License-Identifier: CEPL-1.0
use std::ffi::{CStr, CString};
use std::fmt;

use ash::vk;
use tracing::{debug, info};

use crate::config::DeviceFeature;
use crate::error::{GpuError, GpuResult, VkResultExt};
use crate::instance::InstanceContext;
use crate::queue::{resolve_queue_families, QueueCapabilities, QueueFamilyIndices};
use crate::surface::SurfaceContext;

/// What a physical device must offer to be picked.
#[derive(Clone, Debug, Default)]
pub struct DeviceRequest {
    pub queues: QueueCapabilities,
    pub extensions: Vec<CString>,
    pub features: Vec<DeviceFeature>,
}

/// Everything the selector needs to know about one physical device.
#[derive(Clone, Debug)]
pub struct DeviceCandidate {
    pub handle: vk::PhysicalDevice,
    pub name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub queue_families: Vec<vk::QueueFamilyProperties>,
    pub present_support: Vec<bool>,
    pub extensions: Vec<CString>,
    pub features: vk::PhysicalDeviceFeatures,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Rejection {
    MissingQueues(QueueCapabilities),
    MissingExtensions(Vec<String>),
    MissingFeatures(Vec<DeviceFeature>),
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::MissingQueues(q) => write!(f, "no queue family for {q:?}"),
            Rejection::MissingExtensions(e) => write!(f, "missing extensions {}", e.join(", ")),
            Rejection::MissingFeatures(feats) => write!(f, "missing features {feats:?}"),
        }
    }
}

/// A device that satisfied a [`DeviceRequest`], with the exact sets to enable.
#[derive(Clone, Debug)]
pub struct SelectedDevice {
    pub candidate: DeviceCandidate,
    pub indices: QueueFamilyIndices,
    pub enabled_extensions: Vec<CString>,
    pub enabled_features: vk::PhysicalDeviceFeatures,
}

impl DeviceCandidate {
    /// Snapshots `phys`, probing presentation support against `surface`.
    pub fn query(instance: &ash::Instance, surface: &SurfaceContext, phys: vk::PhysicalDevice) -> GpuResult<Self> {
        unsafe {
            let props = instance.get_physical_device_properties(phys);
            let name = CStr::from_ptr(props.device_name.as_ptr())
                .to_string_lossy()
                .into_owned();
            let queue_families = instance.get_physical_device_queue_family_properties(phys);
            let present_support = (0..queue_families.len() as u32)
                .map(|i| surface.supports_present(phys, i))
                .collect();
            let extensions = instance
                .enumerate_device_extension_properties(phys)
                .during("vkEnumerateDeviceExtensionProperties")?
                .iter()
                .map(|e| CStr::from_ptr(e.extension_name.as_ptr()).to_owned())
                .collect();
            let features = instance.get_physical_device_features(phys);

            Ok(Self {
                handle: phys,
                name,
                device_type: props.device_type,
                queue_families,
                present_support,
                extensions,
                features,
            })
        }
    }

    pub fn supports_extension(&self, name: &CStr) -> bool {
        self.extensions.iter().any(|e| e.as_c_str() == name)
    }

    pub fn evaluate(&self, request: &DeviceRequest) -> Result<QueueFamilyIndices, Rejection> {
        let indices = resolve_queue_families(&self.queue_families, &self.present_support, request.queues);
        let missing = indices.missing(request.queues);
        if !missing.is_empty() {
            return Err(Rejection::MissingQueues(missing));
        }

        let missing: Vec<String> = request
            .extensions
            .iter()
            .filter(|e| !self.supports_extension(e))
            .map(|e| e.to_string_lossy().into_owned())
            .collect();
        if !missing.is_empty() {
            return Err(Rejection::MissingExtensions(missing));
        }

        let missing: Vec<DeviceFeature> = request
            .features
            .iter()
            .copied()
            .filter(|f| !f.is_supported(&self.features))
            .collect();
        if !missing.is_empty() {
            return Err(Rejection::MissingFeatures(missing));
        }

        Ok(indices)
    }
}

/// Returns the first candidate that satisfies `request`. No ranking.
pub fn select_first(
    candidates: impl IntoIterator<Item = DeviceCandidate>,
    request: &DeviceRequest,
) -> GpuResult<SelectedDevice> {
    let mut rejections = Vec::new();
    for candidate in candidates {
        match candidate.evaluate(request) {
            Ok(indices) => {
                let mut enabled_features = vk::PhysicalDeviceFeatures::default();
                for f in &request.features {
                    f.enable(&mut enabled_features);
                }
                return Ok(SelectedDevice {
                    enabled_extensions: request.extensions.clone(),
                    enabled_features,
                    indices,
                    candidate,
                });
            }
            Err(reason) => {
                debug!("rejecting {} ({:?}): {reason}", candidate.name, candidate.device_type);
                rejections.push(format!("{}: {reason}", candidate.name));
            }
        }
    }

    if rejections.is_empty() {
        Err(GpuError::configuration("no Vulkan physical devices found"))
    } else {
        Err(GpuError::configuration(format!(
            "no physical device satisfies the request ({})",
            rejections.join("; ")
        )))
    }
}

/// Drops devices that could not be queried; the rest stay in driver order.
pub fn usable_candidates(
    queried: impl IntoIterator<Item = (vk::PhysicalDevice, GpuResult<DeviceCandidate>)>,
) -> Vec<DeviceCandidate> {
    queried
        .into_iter()
        .filter_map(|(phys, result)| match result {
            Ok(candidate) => Some(candidate),
            Err(e) => {
                debug!("skipping physical device {phys:?}: {e}");
                None
            }
        })
        .collect()
}

pub struct PhysicalDeviceSelector<'a> {
    instance: &'a InstanceContext,
    surface: &'a SurfaceContext,
}

impl<'a> PhysicalDeviceSelector<'a> {
    pub fn new(instance: &'a InstanceContext, surface: &'a SurfaceContext) -> Self {
        Self { instance, surface }
    }

    pub fn select(&self, request: &DeviceRequest) -> GpuResult<SelectedDevice> {
        let raw = self.instance.raw();
        let devices = unsafe { raw.enumerate_physical_devices() }.during("vkEnumeratePhysicalDevices")?;
        let candidates = usable_candidates(
            devices
                .into_iter()
                .map(|phys| (phys, DeviceCandidate::query(raw, self.surface, phys))),
        );

        let selected = select_first(candidates, request)?;
        info!(
            "selected GPU {} ({:?}), queues {:?}",
            selected.candidate.name, selected.candidate.device_type, selected.indices
        );
        Ok(selected)
    }
}
