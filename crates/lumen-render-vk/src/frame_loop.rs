// SPDX-License-Identifier: CEPL-1.0
use lumen_render::RenderSize;
use tracing::{debug, warn};

use crate::backend::GpuOps;
use crate::error::GpuResult;
use crate::swapchain::{SwapchainInfo, SwapchainManager, SwapchainPreferences};
use crate::sync::{FrameContent, FrameOutcome, FrameSynchronizer};

/// Swapchain plus frame pacing over one backend. Rebuilds itself whenever
/// a frame reports the surface out of date or suboptimal.
pub struct FrameLoop<G: GpuOps> {
    swapchain: SwapchainManager,
    sync: FrameSynchronizer,
    gpu: G,
}

impl<G: GpuOps> FrameLoop<G> {
    pub fn new(gpu: G, window: RenderSize, prefs: SwapchainPreferences) -> GpuResult<Self> {
        let mut swapchain = SwapchainManager::new(prefs);
        swapchain.create(&gpu, window)?;
        let sync = match FrameSynchronizer::new(&gpu, swapchain.frame_count(), swapchain.image_count()) {
            Ok(s) => s,
            Err(e) => {
                swapchain.destroy(&gpu);
                return Err(e);
            }
        };
        Ok(Self { swapchain, sync, gpu })
    }

    pub fn gpu(&self) -> &G {
        &self.gpu
    }

    pub fn swapchain(&self) -> &SwapchainManager {
        &self.swapchain
    }

    pub fn synchronizer(&self) -> &FrameSynchronizer {
        &self.sync
    }

    /// Renders one frame, rebuilding for `window` when the surface changed.
    ///
    /// A frame that fails after its image was acquired leaves that image
    /// unpresented. The loop rebuilds before returning the error, so the
    /// next tick starts from a fresh swapchain and fresh frame slots.
    pub fn tick<C: FrameContent + ?Sized>(&mut self, content: &mut C, window: RenderSize) -> GpuResult<FrameOutcome> {
        if self.sync.is_stale() {
            self.recreate(content, window)?;
        }
        let outcome = match self.sync.draw(&self.gpu, &self.swapchain, content) {
            Ok(outcome) => outcome,
            Err(e) => {
                if self.sync.is_stale() {
                    warn!("frame failed after acquire ({e}), rebuilding swapchain");
                    if let Err(rebuild) = self.recreate(content, window) {
                        warn!("rebuild after failed frame: {rebuild}");
                    }
                }
                return Err(e);
            }
        };
        match outcome {
            FrameOutcome::Presented => {}
            FrameOutcome::Suboptimal => {
                warn!("swapchain suboptimal for the surface, rebuilding");
                self.recreate(content, window)?;
            }
            FrameOutcome::OutOfDate => self.recreate(content, window)?,
        }
        Ok(outcome)
    }

    /// Idle, drop dependents, rebuild swapchain and views, reset frame
    /// slots, then let `content` rebuild its dependents.
    pub fn recreate<C: FrameContent + ?Sized>(&mut self, content: &mut C, window: RenderSize) -> GpuResult<()> {
        self.gpu.wait_idle()?;
        self.sync.wait_all(&self.gpu)?;
        content.release_all();

        self.swapchain.recreate(&self.gpu, window)?;
        self.sync
            .reconfigure(&self.gpu, self.swapchain.frame_count(), self.swapchain.image_count())?;
        content.swapchain_rebuilt(&self.swapchain)?;
        debug!("frame loop rebuilt (swapchain #{})", self.swapchain.generation());
        Ok(())
    }

    /// Applies new present preferences by rebuilding the swapchain.
    pub fn set_preferences<C: FrameContent + ?Sized>(
        &mut self,
        prefs: SwapchainPreferences,
        content: &mut C,
        window: RenderSize,
    ) -> GpuResult<()> {
        self.swapchain.set_preferences(prefs);
        self.recreate(content, window)
    }

    pub fn wait_idle(&mut self) -> GpuResult<()> {
        self.gpu.wait_idle()?;
        self.sync.wait_all(&self.gpu)
    }
}

impl<G: GpuOps> Drop for FrameLoop<G> {
    fn drop(&mut self) {
        self.gpu.wait_idle().ok();
        self.sync.wait_all(&self.gpu).ok();
        self.sync.destroy(&self.gpu);
        self.swapchain.destroy(&self.gpu);
    }
}
