// SPDX-License-Identifier: CEPL-1.0
use std::sync::Arc;

use anyhow::{Context, Result};
use ash::vk;
use lumen_render::{ExtentSource, RenderSize, Renderer};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use tracing::{debug, info, warn};

use crate::backend::AshBackend;
use crate::command::CommandPoolManager;
use crate::config::GpuConfig;
use crate::device::Device;
use crate::error::{GpuError, GpuResult, VkResultExt};
use crate::frame_loop::FrameLoop;
use crate::instance::{InstanceConfig, InstanceContext};
use crate::physical_device::PhysicalDeviceSelector;
use crate::queue::Capability;
use crate::render_pass::{find_depth_format, RenderPassKind};
use crate::surface::SurfaceContext;
use crate::swapchain::SwapchainInfo;
use crate::sync::{FrameContent, FrameOutcome};
use crate::targets::FrameTargets;

/// Records the per-frame clear pass and owns everything built on the
/// swapchain images.
struct ClearRecorder {
    targets: FrameTargets,
    pass: Option<RenderPassKind>,
    command_buffers: Vec<vk::CommandBuffer>,
    pools: CommandPoolManager,
    depth_format: Option<vk::Format>,
    clear_color: [f32; 4],
    device: Arc<Device>,
}

impl ClearRecorder {
    fn new(device: Arc<Device>, depth_format: Option<vk::Format>, clear_color: [f32; 4]) -> GpuResult<Self> {
        Ok(Self {
            targets: FrameTargets::new(device.clone(), 0),
            pass: None,
            command_buffers: Vec::new(),
            pools: CommandPoolManager::new(device.clone())?,
            depth_format,
            clear_color,
            device,
        })
    }

    fn destroy_pass(&mut self) {
        if let Some(pass) = self.pass.take() {
            pass.destroy(self.device.raw());
        }
    }
}

impl FrameContent for ClearRecorder {
    fn release_image(&mut self, image: usize) {
        self.targets.release(image);
    }

    fn record(&mut self, slot: usize, image: usize, swapchain: &dyn SwapchainInfo) -> GpuResult<vk::CommandBuffer> {
        let pass = self
            .pass
            .as_ref()
            .ok_or_else(|| GpuError::configuration("render pass not built"))?;
        let cmd = *self
            .command_buffers
            .get(slot)
            .ok_or_else(|| GpuError::configuration(format!("no command buffer for frame slot {slot}")))?;
        self.targets.build(image, pass, swapchain)?;
        let framebuffer = self
            .targets
            .framebuffer(image)
            .ok_or_else(|| GpuError::configuration(format!("no framebuffer for image {image}")))?;

        let d = self.device.raw();
        let extent = swapchain.extent();
        let clear = pass.clear_values(self.clear_color);
        let begin = vk::CommandBufferBeginInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_BEGIN_INFO,
            flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            ..Default::default()
        };
        let rp_begin = vk::RenderPassBeginInfo {
            s_type: vk::StructureType::RENDER_PASS_BEGIN_INFO,
            render_pass: pass.raw(),
            framebuffer,
            render_area: vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            },
            clear_value_count: clear.len() as u32,
            p_clear_values: clear.as_ptr(),
            ..Default::default()
        };

        unsafe {
            d.reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
                .during("vkResetCommandBuffer")?;
            d.begin_command_buffer(cmd, &begin).during("vkBeginCommandBuffer")?;
            d.cmd_begin_render_pass(cmd, &rp_begin, vk::SubpassContents::INLINE);
            d.cmd_end_render_pass(cmd);
            d.end_command_buffer(cmd).during("vkEndCommandBuffer")?;
        }
        Ok(cmd)
    }

    fn release_all(&mut self) {
        self.targets.release_all();
    }

    fn swapchain_rebuilt(&mut self, swapchain: &dyn SwapchainInfo) -> GpuResult<()> {
        self.targets.reset(swapchain.image_count());
        self.destroy_pass();
        self.pass = Some(RenderPassKind::create(self.device.raw(), swapchain, self.depth_format)?);

        let frames = swapchain.frame_count();
        if self.command_buffers.len() != frames {
            self.pools.free(Capability::Graphics, &self.command_buffers);
            self.command_buffers = self.pools.allocate_primary(Capability::Graphics, frames as u32)?;
        }
        Ok(())
    }
}

impl Drop for ClearRecorder {
    fn drop(&mut self) {
        self.targets.release_all();
        self.destroy_pass();
        self.pools.free(Capability::Graphics, &self.command_buffers);
    }
}

/// Vulkan implementation of [`Renderer`]: clears the window once per tick.
pub struct VkRenderer {
    content: ClearRecorder,
    frames: FrameLoop<AshBackend>,
    cfg: GpuConfig,
    size: RenderSize,
    extent_source: Option<ExtentSource>,
    paused: bool,
    /// Present preferences changed but the swapchain was not rebuilt yet.
    prefs_dirty: bool,
    device: Arc<Device>,
}

impl VkRenderer {
    pub fn with_config(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        size: RenderSize,
        cfg: GpuConfig,
    ) -> Result<Self> {
        let display_raw = display.display_handle().map_err(GpuError::from)?.as_raw();
        let window_raw = window.window_handle().map_err(GpuError::from)?.as_raw();

        let instance_cfg = InstanceConfig {
            validation: cfg.validation,
            ..InstanceConfig::default()
        };
        let instance = Arc::new(InstanceContext::new(display_raw, &instance_cfg).context("create Vulkan instance")?);
        let surface = SurfaceContext::new(instance.clone(), display_raw, window_raw).context("create surface")?;

        let request = cfg.device_request()?;
        let selected = PhysicalDeviceSelector::new(&instance, &surface)
            .select(&request)
            .context("select physical device")?;
        let device = Device::new(instance, selected).context("create logical device")?;

        let depth_format = if cfg.depth {
            Some(find_depth_format(device.instance().raw(), device.physical())?)
        } else {
            None
        };

        let backend = AshBackend::new(device.clone(), surface)?;
        let frames =
            FrameLoop::new(backend, size, cfg.swapchain_preferences()).context("create swapchain")?;
        let mut content = ClearRecorder::new(device.clone(), depth_format, cfg.clear_color)?;
        content
            .swapchain_rebuilt(frames.swapchain())
            .context("build render pass")?;

        info!(
            "vk: renderer ready on {} (depth: {:?}, validation: {})",
            device.name(),
            depth_format,
            device.instance().validation_enabled()
        );
        Ok(Self {
            content,
            frames,
            paused: size.is_empty(),
            prefs_dirty: false,
            cfg,
            size,
            extent_source: None,
            device,
        })
    }

    /// Queries the platform for the drawable size instead of trusting the
    /// last resize event.
    pub fn set_extent_source(&mut self, source: ExtentSource) {
        self.extent_source = Some(source);
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn command_pools(&self) -> &CommandPoolManager {
        &self.content.pools
    }

    pub fn swapchain(&self) -> &dyn SwapchainInfo {
        self.frames.swapchain()
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    fn drawable_size(&self) -> RenderSize {
        self.extent_source.as_ref().map_or(self.size, |source| source())
    }

    fn apply_preferences(&mut self, size: RenderSize) -> GpuResult<()> {
        self.frames
            .set_preferences(self.cfg.swapchain_preferences(), &mut self.content, size)?;
        self.prefs_dirty = false;
        Ok(())
    }
}

impl Renderer for VkRenderer {
    fn new(window: &dyn HasWindowHandle, display: &dyn HasDisplayHandle, size: RenderSize) -> Result<Self> {
        Self::with_config(window, display, size, GpuConfig::default())
    }

    fn resize(&mut self, size: RenderSize) -> Result<()> {
        if size.is_empty() {
            if !self.paused {
                info!("vk: resize to {}x{} → paused", size.width, size.height);
            }
            self.paused = true;
            return Ok(());
        }
        if self.paused {
            info!("vk: resize to {}x{} → resumed", size.width, size.height);
        }
        self.paused = false;
        self.size = size;
        // Also picks up a vsync change made while paused.
        self.apply_preferences(size)
            .context("recreate swapchain after resize")
    }

    fn render(&mut self) -> Result<()> {
        if self.paused {
            return Ok(());
        }
        let size = self.drawable_size();
        if size.is_empty() {
            info!("vk: drawable is 0x0 → paused");
            self.paused = true;
            return Ok(());
        }
        if self.prefs_dirty {
            self.apply_preferences(size)
                .context("apply present preferences")?;
        }

        let outcome = self.frames.tick(&mut self.content, size).context("render frame")?;
        if outcome != FrameOutcome::Presented {
            debug!("vk: frame {outcome:?}, swapchain rebuilt");
        }
        Ok(())
    }

    fn set_clear_color(&mut self, rgba: [f32; 4]) {
        self.cfg.clear_color = rgba;
        self.content.clear_color = rgba;
    }

    fn set_vsync(&mut self, on: bool) {
        if self.cfg.vsync == on {
            return;
        }
        self.cfg.vsync = on;
        self.prefs_dirty = true;
        if self.paused {
            return;
        }
        let size = self.drawable_size();
        if let Err(e) = self.apply_preferences(size) {
            // Still dirty: the next render retries and reports the failure.
            warn!("vk: vsync switch failed: {e}");
        }
    }
}

impl Drop for VkRenderer {
    fn drop(&mut self) {
        // Targets reference swapchain views; release them while the device
        // is idle and before the frame loop tears the swapchain down.
        self.frames.wait_idle().ok();
        self.content.release_all();
    }
}
