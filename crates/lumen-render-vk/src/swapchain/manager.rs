// SPDX-License-Identifier: CEPL-1.0
use ash::vk;
use lumen_render::RenderSize;
use tracing::{debug, info, warn};

use super::select::{plan_swapchain, present_mode_name, SwapchainPlan, SwapchainPreferences};
use super::SwapchainInfo;
use crate::backend::GpuOps;
use crate::error::GpuResult;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SwapchainState {
    Uninitialized,
    Created,
    Recreating,
    Destroyed,
}

/// Owns the swapchain handle and one colour view per swapchain image.
///
/// Holds no device reference; every call takes the [`GpuOps`] that created
/// it, and [`destroy`](Self::destroy) must run before that goes away.
pub struct SwapchainManager {
    state: SwapchainState,
    handle: vk::SwapchainKHR,
    plan: SwapchainPlan,
    images: Vec<vk::Image>,
    views: Vec<vk::ImageView>,
    prefs: SwapchainPreferences,
    generation: u64,
}

impl SwapchainManager {
    pub fn new(prefs: SwapchainPreferences) -> Self {
        Self {
            state: SwapchainState::Uninitialized,
            handle: vk::SwapchainKHR::null(),
            plan: SwapchainPlan::default(),
            images: Vec::new(),
            views: Vec::new(),
            prefs,
            generation: 0,
        }
    }

    pub fn state(&self) -> SwapchainState {
        self.state
    }

    pub fn handle(&self) -> vk::SwapchainKHR {
        self.handle
    }

    pub fn plan(&self) -> &SwapchainPlan {
        &self.plan
    }

    pub fn images(&self) -> &[vk::Image] {
        &self.images
    }

    /// Bumped on every successful (re)creation.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn preferences(&self) -> &SwapchainPreferences {
        &self.prefs
    }

    /// Takes effect on the next (re)creation.
    pub fn set_preferences(&mut self, prefs: SwapchainPreferences) {
        self.prefs = prefs;
    }

    /// Builds a swapchain for `window`, retiring the current one if any.
    ///
    /// The previous swapchain and its views are destroyed only once the
    /// replacement and all of its views exist. On failure the previous
    /// swapchain stays current.
    pub fn create<G: GpuOps + ?Sized>(&mut self, gpu: &G, window: RenderSize) -> GpuResult<()> {
        let caps = gpu.surface_capabilities()?;
        let formats = gpu.surface_formats()?;
        let modes = gpu.present_modes()?;
        let plan = plan_swapchain(&caps, &formats, &modes, window, &self.prefs)?;

        let old = self.handle;
        let handle = gpu.create_swapchain(&plan, old)?;
        let images = match gpu.swapchain_images(handle) {
            Ok(images) => images,
            Err(e) => {
                gpu.destroy_swapchain(handle);
                return Err(e);
            }
        };
        let views = match Self::create_image_views(gpu, &images, plan.surface_format.format) {
            Ok(views) => views,
            Err(e) => {
                gpu.destroy_swapchain(handle);
                return Err(e);
            }
        };

        self.release(gpu);
        self.handle = handle;
        self.plan = plan;
        self.images = images;
        self.views = views;
        self.generation += 1;
        self.state = SwapchainState::Created;

        info!(
            "swapchain #{}: {}x{} {:?}, {} images, {} ({} frames in flight)",
            self.generation,
            plan.extent.width,
            plan.extent.height,
            plan.surface_format.format,
            self.images.len(),
            present_mode_name(plan.present_mode),
            plan.image_count,
        );
        Ok(())
    }

    /// One colour view per image. Views made before a failure are destroyed.
    pub fn create_image_views<G: GpuOps + ?Sized>(
        gpu: &G,
        images: &[vk::Image],
        format: vk::Format,
    ) -> GpuResult<Vec<vk::ImageView>> {
        let mut views = Vec::with_capacity(images.len());
        for &image in images {
            match gpu.create_image_view(image, format) {
                Ok(view) => views.push(view),
                Err(e) => {
                    for view in views {
                        gpu.destroy_image_view(view);
                    }
                    return Err(e);
                }
            }
        }
        Ok(views)
    }

    pub fn recreate<G: GpuOps + ?Sized>(&mut self, gpu: &G, window: RenderSize) -> GpuResult<()> {
        let prior = self.state;
        self.state = SwapchainState::Recreating;
        debug!("recreating swapchain for {}x{}", window.width, window.height);
        let result = self.create(gpu, window);
        if let Err(e) = &result {
            warn!("swapchain recreation failed, keeping the previous one: {e}");
            self.state = prior;
        }
        result
    }

    /// Views first, then the swapchain.
    pub fn destroy<G: GpuOps + ?Sized>(&mut self, gpu: &G) {
        if self.state == SwapchainState::Destroyed {
            return;
        }
        self.release(gpu);
        self.state = SwapchainState::Destroyed;
    }

    fn release<G: GpuOps + ?Sized>(&mut self, gpu: &G) {
        for view in self.views.drain(..) {
            gpu.destroy_image_view(view);
        }
        self.images.clear();
        if self.handle != vk::SwapchainKHR::null() {
            gpu.destroy_swapchain(self.handle);
            self.handle = vk::SwapchainKHR::null();
        }
    }
}

impl SwapchainInfo for SwapchainManager {
    fn format(&self) -> vk::Format {
        self.plan.surface_format.format
    }

    fn extent(&self) -> vk::Extent2D {
        self.plan.extent
    }

    fn image_count(&self) -> usize {
        self.images.len()
    }

    fn image_view(&self, index: usize) -> Option<vk::ImageView> {
        self.views.get(index).copied()
    }

    fn frame_count(&self) -> usize {
        self.plan.image_count as usize
    }

    fn present_mode(&self) -> vk::PresentModeKHR {
        self.plan.present_mode
    }
}
