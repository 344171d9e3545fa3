// SPDX-License-Identifier: CEPL-1.0
use std::borrow::Cow;
use std::ffi::{c_void, CStr, CString};
use std::os::raw::c_char;

use ash::ext::debug_utils;
use ash::{vk, Entry};
use raw_window_handle::RawDisplayHandle;
use tracing::{debug, error, info, trace, warn};

use crate::error::{GpuError, GpuResult, VkResultExt};

pub const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

#[derive(Clone, Debug)]
pub struct InstanceConfig {
    pub app_name: String,
    /// Enable the Khronos validation layer and debug-utils messenger when
    /// the loader offers them.
    pub validation: bool,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            app_name: "lumen".into(),
            validation: cfg!(debug_assertions),
        }
    }
}

struct DebugMessenger {
    loader: debug_utils::Instance,
    messenger: vk::DebugUtilsMessengerEXT,
}

/// The Vulkan instance plus whatever debug plumbing it was created with.
pub struct InstanceContext {
    entry: Entry,
    raw: ash::Instance,
    debug: Option<DebugMessenger>,
    enabled_layers: Vec<CString>,
    enabled_extensions: Vec<CString>,
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    types: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user: *mut c_void,
) -> vk::Bool32 {
    if data.is_null() {
        return vk::FALSE;
    }
    // SAFETY: the loader passes a valid callback struct for the duration of the call.
    let data = unsafe { &*data };
    let message = if data.p_message.is_null() {
        Cow::from("")
    } else {
        unsafe { CStr::from_ptr(data.p_message) }.to_string_lossy()
    };

    match severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => error!(target: "vulkan", "{types:?}: {message}"),
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => warn!(target: "vulkan", "{types:?}: {message}"),
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => debug!(target: "vulkan", "{types:?}: {message}"),
        _ => trace!(target: "vulkan", "{types:?}: {message}"),
    }
    vk::FALSE
}

/// Picks `required` and the available subset of `optional` from `available`.
///
/// A missing required name is a configuration error; a missing optional one
/// is logged and skipped.
pub fn negotiate_names(
    kind: &str,
    required: &[&CStr],
    optional: &[&CStr],
    available: &[CString],
) -> GpuResult<Vec<CString>> {
    let has = |name: &CStr| available.iter().any(|a| a.as_c_str() == name);

    let missing: Vec<_> = required
        .iter()
        .filter(|name| !has(name))
        .map(|name| name.to_string_lossy().into_owned())
        .collect();
    if !missing.is_empty() {
        return Err(GpuError::configuration(format!(
            "required instance {kind} not available: {}",
            missing.join(", ")
        )));
    }

    let mut enabled: Vec<CString> = required.iter().map(|&n| n.to_owned()).collect();
    for &name in optional {
        if !has(name) {
            warn!("optional instance {kind} {name:?} not available; continuing without it");
        } else if !enabled.iter().any(|e| e.as_c_str() == name) {
            enabled.push(name.to_owned());
        }
    }
    Ok(enabled)
}

fn c_names<'a>(raw: impl Iterator<Item = &'a [c_char]>) -> Vec<CString> {
    raw.map(|chars| {
        // SAFETY: the loader NUL-terminates fixed-size name arrays.
        unsafe { CStr::from_ptr(chars.as_ptr()) }.to_owned()
    })
    .collect()
}

impl InstanceContext {
    pub fn new(display: RawDisplayHandle, cfg: &InstanceConfig) -> GpuResult<Self> {
        let entry = Entry::linked();

        // SAFETY: enumeration calls on a linked entry have no preconditions.
        let available_exts = unsafe { entry.enumerate_instance_extension_properties(None) }
            .during("vkEnumerateInstanceExtensionProperties")?;
        let available_layers = unsafe { entry.enumerate_instance_layer_properties() }
            .during("vkEnumerateInstanceLayerProperties")?;
        let available_exts = c_names(available_exts.iter().map(|e| &e.extension_name[..]));
        let available_layers = c_names(available_layers.iter().map(|l| &l.layer_name[..]));

        let surface_exts = ash_window::enumerate_required_extensions(display)
            .during("ash_window::enumerate_required_extensions")?;
        // SAFETY: ash-window returns pointers to static NUL-terminated names.
        let required: Vec<&CStr> = surface_exts
            .iter()
            .map(|&p| unsafe { CStr::from_ptr(p) })
            .collect();
        let optional: &[&CStr] = if cfg.validation { &[debug_utils::NAME] } else { &[] };
        let enabled_extensions = negotiate_names("extension", &required, optional, &available_exts)?;

        let optional_layers: &[&CStr] = if cfg.validation { &[VALIDATION_LAYER] } else { &[] };
        let enabled_layers = negotiate_names("layer", &[], optional_layers, &available_layers)?;

        let app_name = CString::new(cfg.app_name.as_str())
            .map_err(|_| GpuError::configuration("application name contains NUL"))?;
        let app_info = vk::ApplicationInfo {
            s_type: vk::StructureType::APPLICATION_INFO,
            p_application_name: app_name.as_ptr(),
            application_version: 0,
            p_engine_name: c"lumen".as_ptr(),
            engine_version: 0,
            api_version: vk::API_VERSION_1_0,
            ..Default::default()
        };

        let ext_ptrs: Vec<*const c_char> = enabled_extensions.iter().map(|e| e.as_ptr()).collect();
        let layer_ptrs: Vec<*const c_char> = enabled_layers.iter().map(|l| l.as_ptr()).collect();
        let create_info = vk::InstanceCreateInfo {
            s_type: vk::StructureType::INSTANCE_CREATE_INFO,
            p_application_info: &app_info,
            enabled_extension_count: ext_ptrs.len() as u32,
            pp_enabled_extension_names: ext_ptrs.as_ptr(),
            enabled_layer_count: layer_ptrs.len() as u32,
            pp_enabled_layer_names: layer_ptrs.as_ptr(),
            ..Default::default()
        };

        // SAFETY: every pointer in create_info outlives the call.
        let raw = unsafe { entry.create_instance(&create_info, None) }.created("instance")?;

        let debug = if enabled_extensions.iter().any(|e| e.as_c_str() == debug_utils::NAME) {
            match unsafe { create_debug_messenger(&entry, &raw) } {
                Ok(d) => Some(d),
                Err(e) => {
                    warn!("debug messenger unavailable: {e}");
                    None
                }
            }
        } else {
            None
        };

        info!(
            "vulkan instance ready (layers: [{}], extensions: [{}])",
            join_names(&enabled_layers),
            join_names(&enabled_extensions)
        );

        Ok(Self {
            entry,
            raw,
            debug,
            enabled_layers,
            enabled_extensions,
        })
    }

    pub fn entry(&self) -> &Entry {
        &self.entry
    }

    pub fn raw(&self) -> &ash::Instance {
        &self.raw
    }

    pub fn validation_enabled(&self) -> bool {
        self.enabled_layers.iter().any(|l| l.as_c_str() == VALIDATION_LAYER)
    }

    pub fn is_extension_enabled(&self, name: &CStr) -> bool {
        self.enabled_extensions.iter().any(|e| e.as_c_str() == name)
    }
}

unsafe fn create_debug_messenger(entry: &Entry, instance: &ash::Instance) -> GpuResult<DebugMessenger> {
    let loader = debug_utils::Instance::new(entry, instance);
    let ci = vk::DebugUtilsMessengerCreateInfoEXT {
        s_type: vk::StructureType::DEBUG_UTILS_MESSENGER_CREATE_INFO_EXT,
        message_severity: vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
            | vk::DebugUtilsMessageSeverityFlagsEXT::INFO
            | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
            | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        message_type: vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
            | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
            | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        pfn_user_callback: Some(debug_callback),
        ..Default::default()
    };
    let messenger = unsafe { loader.create_debug_utils_messenger(&ci, None) }.created("debug messenger")?;
    Ok(DebugMessenger { loader, messenger })
}

fn join_names(names: &[CString]) -> String {
    names
        .iter()
        .map(|n| n.to_string_lossy())
        .collect::<Vec<_>>()
        .join(", ")
}

impl Drop for InstanceContext {
    fn drop(&mut self) {
        unsafe {
            if let Some(d) = self.debug.take() {
                d.loader.destroy_debug_utils_messenger(d.messenger, None);
            }
            self.raw.destroy_instance(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<CString> {
        list.iter().map(|s| CString::new(*s).unwrap()).collect()
    }

    #[test]
    fn optional_names_are_enabled_only_when_available() {
        let available = names(&["VK_KHR_surface", "VK_KHR_xcb_surface"]);
        let enabled = negotiate_names(
            "extension",
            &[c"VK_KHR_surface", c"VK_KHR_xcb_surface"],
            &[debug_utils::NAME],
            &available,
        )
        .unwrap();
        assert_eq!(enabled, available);

        let available = names(&["VK_KHR_surface", "VK_EXT_debug_utils"]);
        let enabled = negotiate_names("extension", &[c"VK_KHR_surface"], &[debug_utils::NAME], &available).unwrap();
        assert_eq!(enabled, available);
    }

    #[test]
    fn missing_required_name_is_fatal() {
        let available = names(&["VK_KHR_surface"]);
        let err = negotiate_names("extension", &[c"VK_KHR_wayland_surface"], &[], &available).unwrap_err();
        match err {
            GpuError::Configuration(msg) => assert!(msg.contains("VK_KHR_wayland_surface")),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn duplicates_are_not_enabled_twice() {
        let available = names(&["VK_LAYER_KHRONOS_validation"]);
        let enabled = negotiate_names("layer", &[VALIDATION_LAYER], &[VALIDATION_LAYER], &available).unwrap();
        assert_eq!(enabled.len(), 1);
    }
}
