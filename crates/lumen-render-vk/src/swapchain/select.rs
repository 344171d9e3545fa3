// SPDX-License-Identifier: CEPL-1.0
//! Swapchain parameter selection from surface capabilities.

use ash::vk;
use lumen_render::RenderSize;

use crate::config::PresentPreference;
use crate::error::{GpuError, GpuResult};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SwapchainPreferences {
    /// Ordered (format, color space) preferences.
    pub formats: Vec<vk::SurfaceFormatKHR>,
    /// Used when the surface reports only `UNDEFINED`, i.e. "anything goes".
    pub fallback: vk::SurfaceFormatKHR,
    pub vsync: bool,
    pub present: PresentPreference,
}

impl Default for SwapchainPreferences {
    fn default() -> Self {
        let srgb = |format| vk::SurfaceFormatKHR {
            format,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        Self {
            formats: vec![
                srgb(vk::Format::B8G8R8A8_SRGB),
                srgb(vk::Format::R8G8B8A8_SRGB),
                srgb(vk::Format::B8G8R8A8_UNORM),
            ],
            fallback: srgb(vk::Format::B8G8R8A8_SRGB),
            vsync: true,
            present: PresentPreference::Mailbox,
        }
    }
}

/// Everything needed to create one swapchain.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SwapchainPlan {
    pub surface_format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    /// Requested image count; also the number of frames in flight.
    pub image_count: u32,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
    pub composite_alpha: vk::CompositeAlphaFlagsKHR,
}

pub fn choose_surface_format(
    available: &[vk::SurfaceFormatKHR],
    prefs: &SwapchainPreferences,
) -> Option<vk::SurfaceFormatKHR> {
    if let [only] = available {
        if only.format == vk::Format::UNDEFINED {
            return Some(prefs.fallback);
        }
    }
    prefs
        .formats
        .iter()
        .find(|want| available.contains(want))
        .or_else(|| {
            prefs
                .formats
                .iter()
                .find_map(|want| available.iter().find(|a| a.format == want.format))
        })
        .or_else(|| available.first())
        .copied()
}

/// `current_extent` unless the surface leaves sizing to us, in which case
/// the window size clamped into the supported range.
pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, window: RenderSize) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D {
            width: window
                .width
                .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: window
                .height
                .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    }
}

/// Frames in flight implied by a present mode.
pub fn frames_for_mode(mode: vk::PresentModeKHR) -> u32 {
    match mode {
        vk::PresentModeKHR::MAILBOX => 3,
        vk::PresentModeKHR::IMMEDIATE => 1,
        _ => 2,
    }
}

/// Inverse of [`frames_for_mode`]; FIFO when the mapped mode is unsupported.
pub fn mode_for_frames(count: u32, supported: &[vk::PresentModeKHR]) -> vk::PresentModeKHR {
    let mode = match count {
        0 | 1 => vk::PresentModeKHR::IMMEDIATE,
        2 => vk::PresentModeKHR::FIFO,
        _ => vk::PresentModeKHR::MAILBOX,
    };
    if supported.contains(&mode) {
        mode
    } else {
        vk::PresentModeKHR::FIFO
    }
}

/// Clamps into `[min_image_count, max_image_count]`; a max of 0 means unbounded.
pub fn clamp_image_count(count: u32, caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = count.max(caps.min_image_count);
    if caps.max_image_count == 0 {
        count
    } else {
        count.min(caps.max_image_count)
    }
}

/// Picks present mode and frame count together so they stay consistent
/// after the count is clamped to what the surface allows.
pub fn choose_present_mode(
    supported: &[vk::PresentModeKHR],
    caps: &vk::SurfaceCapabilitiesKHR,
    prefs: &SwapchainPreferences,
) -> (vk::PresentModeKHR, u32) {
    let mailbox_fits = caps.max_image_count == 0 || caps.max_image_count >= frames_for_mode(vk::PresentModeKHR::MAILBOX);
    let order: &[vk::PresentModeKHR] = match (prefs.vsync, prefs.present) {
        (false, _) => &[vk::PresentModeKHR::IMMEDIATE, vk::PresentModeKHR::MAILBOX],
        (true, PresentPreference::Mailbox) => &[vk::PresentModeKHR::MAILBOX],
        (true, PresentPreference::Fifo) => &[],
    };
    let mode = order
        .iter()
        .copied()
        .find(|m| supported.contains(m) && (*m != vk::PresentModeKHR::MAILBOX || mailbox_fits))
        .unwrap_or(vk::PresentModeKHR::FIFO);

    let wanted = frames_for_mode(mode);
    let count = clamp_image_count(wanted, caps);
    if count == wanted {
        (mode, count)
    } else {
        (mode_for_frames(count, supported), count)
    }
}

pub fn choose_composite_alpha(caps: &vk::SurfaceCapabilitiesKHR) -> vk::CompositeAlphaFlagsKHR {
    [
        vk::CompositeAlphaFlagsKHR::OPAQUE,
        vk::CompositeAlphaFlagsKHR::INHERIT,
        vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED,
        vk::CompositeAlphaFlagsKHR::POST_MULTIPLIED,
    ]
    .into_iter()
    .find(|&a| caps.supported_composite_alpha.contains(a))
    .unwrap_or(vk::CompositeAlphaFlagsKHR::OPAQUE)
}

pub fn choose_pre_transform(caps: &vk::SurfaceCapabilitiesKHR) -> vk::SurfaceTransformFlagsKHR {
    if caps
        .supported_transforms
        .contains(vk::SurfaceTransformFlagsKHR::IDENTITY)
    {
        vk::SurfaceTransformFlagsKHR::IDENTITY
    } else {
        caps.current_transform
    }
}

pub fn plan_swapchain(
    caps: &vk::SurfaceCapabilitiesKHR,
    formats: &[vk::SurfaceFormatKHR],
    modes: &[vk::PresentModeKHR],
    window: RenderSize,
    prefs: &SwapchainPreferences,
) -> GpuResult<SwapchainPlan> {
    let surface_format = choose_surface_format(formats, prefs)
        .ok_or_else(|| GpuError::configuration("surface reports no formats"))?;
    if modes.is_empty() {
        return Err(GpuError::configuration("surface reports no present modes"));
    }
    let (present_mode, image_count) = choose_present_mode(modes, caps, prefs);

    Ok(SwapchainPlan {
        surface_format,
        present_mode,
        extent: choose_extent(caps, window),
        image_count,
        pre_transform: choose_pre_transform(caps),
        composite_alpha: choose_composite_alpha(caps),
    })
}

pub fn present_mode_name(m: vk::PresentModeKHR) -> &'static str {
    match m {
        vk::PresentModeKHR::FIFO => "FIFO",
        vk::PresentModeKHR::MAILBOX => "MAILBOX",
        vk::PresentModeKHR::IMMEDIATE => "IMMEDIATE",
        vk::PresentModeKHR::FIFO_RELAXED => "FIFO_RELAXED",
        _ => "OTHER",
    }
}
