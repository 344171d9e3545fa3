// SPDX-License-Identifier: CEPL-1.0
//! Vulkan device negotiation, swapchain lifecycle and frame pacing.

pub mod backend;
pub mod command;
pub mod config;
pub mod device;
pub mod error;
pub mod frame_loop;
pub mod instance;
pub mod physical_device;
pub mod queue;
pub mod render_pass;
mod renderer;
pub mod surface;
pub mod swapchain;
pub mod sync;
pub mod targets;

#[cfg(test)]
mod mock;

pub use backend::{AshBackend, GpuOps};
pub use command::{CommandOps, CommandPoolManager};
pub use config::{DeviceFeature, GpuConfig, PresentPreference};
pub use device::Device;
pub use error::{GpuError, GpuResult};
pub use frame_loop::FrameLoop;
pub use queue::{Capability, QueueCapabilities, QueueFamilyIndices};
pub use renderer::VkRenderer;
pub use swapchain::{SwapchainInfo, SwapchainManager};
pub use sync::{FrameContent, FrameOutcome, FrameSynchronizer};
