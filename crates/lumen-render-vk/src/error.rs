// SPDX-License-Identifier: CEPL-1.0
use ash::prelude::VkResult;
use ash::vk;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GpuError {
    /// No device, layer, extension or feature satisfies what was asked for.
    #[error("unsupported configuration: {0}")]
    Configuration(String),

    /// Acquire or present reported the surface as out of date.
    #[error("presentation surface is out of date")]
    SurfaceOutOfDate,

    #[error("failed to create {what}: {result}")]
    ResourceCreation {
        what: &'static str,
        result: vk::Result,
    },

    #[error("{call} failed: {result}")]
    Vk {
        call: &'static str,
        result: vk::Result,
    },

    #[error("window handle unavailable: {0}")]
    WindowHandle(#[from] raw_window_handle::HandleError),
}

pub type GpuResult<T> = Result<T, GpuError>;

impl GpuError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Errors that recreating the swapchain recovers from.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::SurfaceOutOfDate)
    }
}

pub(crate) trait VkResultExt<T> {
    fn created(self, what: &'static str) -> GpuResult<T>;
    fn during(self, call: &'static str) -> GpuResult<T>;
}

impl<T> VkResultExt<T> for VkResult<T> {
    fn created(self, what: &'static str) -> GpuResult<T> {
        self.map_err(|result| GpuError::ResourceCreation { what, result })
    }

    fn during(self, call: &'static str) -> GpuResult<T> {
        self.map_err(|result| GpuError::Vk { call, result })
    }
}
