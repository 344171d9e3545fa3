// SPDX-License-Identifier: CEPL-1.0
//! Frames in flight.
//!
//! The number of frame slots follows the present mode and is independent of
//! how many images the swapchain actually holds. Which slot last rendered
//! into which image is tracked so an image is never handed to a new frame
//! while an older submission may still be writing to it.

use ash::vk;
use tracing::{debug, trace};

use crate::backend::{GpuOps, PresentStatus};
use crate::error::{GpuError, GpuResult};
use crate::swapchain::{SwapchainInfo, SwapchainManager};

/// Sync objects for one frame slot.
#[derive(Clone, Copy, Debug)]
pub struct FrameSlot {
    pub fence: vk::Fence,
    pub image_available: vk::Semaphore,
    pub render_complete: vk::Semaphore,
    /// The fence guards a submission nobody has waited on yet.
    pub in_flight: bool,
}

impl FrameSlot {
    fn create<G: GpuOps + ?Sized>(gpu: &G) -> GpuResult<Self> {
        let fence = gpu.create_fence(true)?;
        let image_available = match gpu.create_semaphore() {
            Ok(s) => s,
            Err(e) => {
                gpu.destroy_fence(fence);
                return Err(e);
            }
        };
        let render_complete = match gpu.create_semaphore() {
            Ok(s) => s,
            Err(e) => {
                gpu.destroy_semaphore(image_available);
                gpu.destroy_fence(fence);
                return Err(e);
            }
        };
        Ok(Self {
            fence,
            image_available,
            render_complete,
            in_flight: false,
        })
    }

    fn destroy<G: GpuOps + ?Sized>(self, gpu: &G) {
        gpu.destroy_semaphore(self.render_complete);
        gpu.destroy_semaphore(self.image_available);
        gpu.destroy_fence(self.fence);
    }
}

/// Slot ↔ image association. Binding either side drops its previous partner.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FrameImageMap {
    slot_image: Vec<Option<usize>>,
    image_slot: Vec<Option<usize>>,
}

impl FrameImageMap {
    pub fn new(slots: usize, images: usize) -> Self {
        Self {
            slot_image: vec![None; slots],
            image_slot: vec![None; images],
        }
    }

    pub fn reset(&mut self, slots: usize, images: usize) {
        *self = Self::new(slots, images);
    }

    pub fn image_of(&self, slot: usize) -> Option<usize> {
        self.slot_image.get(slot).copied().flatten()
    }

    pub fn slot_of(&self, image: usize) -> Option<usize> {
        self.image_slot.get(image).copied().flatten()
    }

    pub fn bind(&mut self, slot: usize, image: usize) {
        self.unbind_slot(slot);
        self.unbind_image(image);
        self.slot_image[slot] = Some(image);
        self.image_slot[image] = Some(slot);
    }

    pub fn unbind_slot(&mut self, slot: usize) -> Option<usize> {
        let image = self.slot_image.get_mut(slot)?.take()?;
        self.image_slot[image] = None;
        Some(image)
    }

    pub fn unbind_image(&mut self, image: usize) -> Option<usize> {
        let slot = self.image_slot.get_mut(image)?.take()?;
        self.slot_image[slot] = None;
        Some(slot)
    }
}

/// What the frame loop needs from whoever owns per-image targets and
/// command buffers.
pub trait FrameContent {
    /// Image `image` is about to be reused; drop anything built for it.
    fn release_image(&mut self, image: usize);
    /// Rebuild targets for `image` and record the command buffer of `slot`.
    fn record(&mut self, slot: usize, image: usize, swapchain: &dyn SwapchainInfo) -> GpuResult<vk::CommandBuffer>;
    /// The swapchain is going away; drop everything built on it.
    fn release_all(&mut self);
    fn swapchain_rebuilt(&mut self, swapchain: &dyn SwapchainInfo) -> GpuResult<()>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameOutcome {
    Presented,
    /// Presented, but the swapchain no longer matches the surface exactly.
    Suboptimal,
    /// Nothing was presented; the swapchain must be rebuilt.
    OutOfDate,
}

impl FrameOutcome {
    pub fn needs_recreate(self) -> bool {
        !matches!(self, FrameOutcome::Presented)
    }
}

pub struct FrameSynchronizer {
    slots: Vec<FrameSlot>,
    map: FrameImageMap,
    frame: u64,
    /// A frame failed after its image was acquired. The slot semaphores and
    /// the swapchain are out of step until the next reconfigure.
    stale: bool,
}

impl FrameSynchronizer {
    pub fn new<G: GpuOps + ?Sized>(gpu: &G, frames: usize, images: usize) -> GpuResult<Self> {
        let mut sync = Self {
            slots: Vec::new(),
            map: FrameImageMap::default(),
            frame: 0,
            stale: false,
        };
        sync.reconfigure(gpu, frames, images)?;
        Ok(sync)
    }

    /// Rebuilds every slot for a new swapchain. The device must be idle.
    pub fn reconfigure<G: GpuOps + ?Sized>(&mut self, gpu: &G, frames: usize, images: usize) -> GpuResult<()> {
        self.destroy(gpu);
        let frames = frames.max(1);
        for _ in 0..frames {
            match FrameSlot::create(gpu) {
                Ok(slot) => self.slots.push(slot),
                Err(e) => {
                    self.destroy(gpu);
                    return Err(e);
                }
            }
        }
        self.map.reset(frames, images);
        self.frame = 0;
        self.stale = false;
        debug!("frame sync: {frames} slots over {images} images");
        Ok(())
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn slot(&self, index: usize) -> Option<&FrameSlot> {
        self.slots.get(index)
    }

    pub fn map(&self) -> &FrameImageMap {
        &self.map
    }

    /// True once a frame failed between acquire and present. [`draw`](Self::draw)
    /// refuses to run until the slots are reconfigured.
    pub fn is_stale(&self) -> bool {
        self.stale
    }

    /// Frames started since the last reconfigure.
    pub fn frame_number(&self) -> u64 {
        self.frame
    }

    fn retire<G: GpuOps + ?Sized>(&mut self, gpu: &G, slot: usize) -> GpuResult<()> {
        let s = &mut self.slots[slot];
        if s.in_flight {
            gpu.wait_fence(s.fence)?;
            s.in_flight = false;
        }
        Ok(())
    }

    /// Acquires, records, submits and presents one frame.
    pub fn draw<G, C>(&mut self, gpu: &G, swapchain: &SwapchainManager, content: &mut C) -> GpuResult<FrameOutcome>
    where
        G: GpuOps + ?Sized,
        C: FrameContent + ?Sized,
    {
        if self.slots.is_empty() {
            return Err(GpuError::configuration("frame synchronizer has no slots"));
        }
        if self.stale {
            return Err(GpuError::configuration("frame slots must be reconfigured after a failed frame"));
        }
        let f = (self.frame % self.slots.len() as u64) as usize;

        self.retire(gpu, f)?;
        gpu.reset_fence(self.slots[f].fence)?;

        if let Some(image) = self.map.unbind_slot(f) {
            content.release_image(image);
        }

        let acquired = match gpu.acquire_next_image(swapchain.handle(), self.slots[f].image_available) {
            Ok(a) => a,
            Err(GpuError::SurfaceOutOfDate) => {
                debug!("acquire: surface out of date, dropping frame {}", self.frame);
                return Ok(FrameOutcome::OutOfDate);
            }
            Err(e) => return Err(e),
        };
        let image = acquired.index as usize;

        // The image is ours until presented; any failure from here on leaves
        // it acquired and image_available[f] signalled with no waiter.
        if let Err(e) = self.submit_acquired(gpu, swapchain, content, f, image) {
            debug!("frame {} failed after acquiring image {image}: {e}", self.frame);
            self.stale = true;
            return Err(e);
        }

        let slot = self.slots[f];
        let presented = gpu.present(swapchain.handle(), acquired.index, slot.render_complete);
        self.frame += 1;

        match presented {
            Ok(PresentStatus::Optimal) if !acquired.suboptimal => Ok(FrameOutcome::Presented),
            Ok(_) => Ok(FrameOutcome::Suboptimal),
            Err(GpuError::SurfaceOutOfDate) => Ok(FrameOutcome::OutOfDate),
            Err(e) => {
                self.stale = true;
                Err(e)
            }
        }
    }

    /// Frees `image` from whichever slot last used it, records slot `f`
    /// into it and submits.
    fn submit_acquired<G, C>(
        &mut self,
        gpu: &G,
        swapchain: &SwapchainManager,
        content: &mut C,
        f: usize,
        image: usize,
    ) -> GpuResult<()>
    where
        G: GpuOps + ?Sized,
        C: FrameContent + ?Sized,
    {
        if let Some(other) = self.map.slot_of(image) {
            trace!("image {image} still held by slot {other}");
            if self.slots[other].in_flight {
                self.retire(gpu, other)?;
                gpu.reset_fence(self.slots[other].fence)?;
            }
            self.map.unbind_image(image);
            content.release_image(image);
        }

        let cmd = content.record(f, image, swapchain)?;
        self.map.bind(f, image);

        let slot = self.slots[f];
        gpu.submit(cmd, slot.image_available, slot.render_complete, slot.fence)?;
        self.slots[f].in_flight = true;
        Ok(())
    }

    /// Waits for every outstanding submission.
    pub fn wait_all<G: GpuOps + ?Sized>(&mut self, gpu: &G) -> GpuResult<()> {
        for i in 0..self.slots.len() {
            self.retire(gpu, i)?;
        }
        Ok(())
    }

    /// Destroys every slot. Outstanding submissions must have completed.
    pub fn destroy<G: GpuOps + ?Sized>(&mut self, gpu: &G) {
        for slot in self.slots.drain(..) {
            slot.destroy(gpu);
        }
        self.map = FrameImageMap::default();
    }
}
