// SPDX-License-Identifier: CEPL-1.0
mod manager;
mod select;

use ash::vk;

pub use manager::{SwapchainManager, SwapchainState};
pub use select::{
    choose_composite_alpha, choose_extent, choose_pre_transform, choose_present_mode, choose_surface_format,
    clamp_image_count, frames_for_mode, mode_for_frames, plan_swapchain, present_mode_name, SwapchainPlan,
    SwapchainPreferences,
};

/// Read-only view of the current swapchain, handed to whoever builds
/// per-image targets.
pub trait SwapchainInfo {
    fn format(&self) -> vk::Format;
    fn extent(&self) -> vk::Extent2D;
    fn image_count(&self) -> usize;
    fn image_view(&self, index: usize) -> Option<vk::ImageView>;
    /// Frames in flight the present mode calls for.
    fn frame_count(&self) -> usize;
    fn present_mode(&self) -> vk::PresentModeKHR;

    fn sample_count(&self) -> vk::SampleCountFlags {
        vk::SampleCountFlags::TYPE_1
    }
}
