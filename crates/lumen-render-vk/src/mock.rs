// SPDX-License-Identifier: CEPL-1.0
//! In-memory `GpuOps` for driving the swapchain and frame state machines
//! in tests.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet, VecDeque};
use std::ops::Deref;
use std::rc::Rc;

use ash::vk::{self, Handle};

use crate::backend::{AcquiredImage, GpuOps, PresentStatus};
use crate::error::{GpuError, GpuResult};
use crate::swapchain::{SwapchainInfo, SwapchainPlan};
use crate::sync::FrameContent;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum FenceState {
    Signaled,
    Unsignaled,
    /// Submitted and not yet waited on.
    Pending,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Acquire {
    Image(u32),
    Suboptimal(u32),
    OutOfDate,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Event {
    CreateSwapchain { handle: u64, old: u64 },
    DestroySwapchain(u64),
    Acquire { image: u32 },
    WaitFence(u64),
    ResetFence(u64),
    Submit { cmd: u64, fence: u64 },
    Present { image: u32 },
    WaitIdle,
}

#[derive(Default)]
struct MockState {
    next_handle: u64,
    events: Vec<Event>,
    fences: HashMap<u64, FenceState>,
    semaphores: Vec<u64>,
    /// Semaphores with a signal operation nobody has waited on yet.
    signaled: HashSet<u64>,
    swapchains: HashMap<u64, Vec<vk::Image>>,
    views: Vec<u64>,
    acquire_script: VecDeque<Acquire>,
    present_script: VecDeque<GpuResult<PresentStatus>>,
    round_robin: u32,
}

impl MockState {
    fn handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }
}

/// Cheap to clone; clones share one device, so a test can keep a handle
/// after moving the mock into a frame loop.
#[derive(Clone)]
pub(crate) struct MockGpu(Rc<MockInner>);

pub(crate) struct MockInner {
    pub caps: Cell<vk::SurfaceCapabilitiesKHR>,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub modes: Vec<vk::PresentModeKHR>,
    /// Images the swapchain hands out beyond the requested count.
    pub extra_images: Cell<u32>,
    pub fail_next_swapchain: Cell<bool>,
    state: RefCell<MockState>,
}

impl Deref for MockGpu {
    type Target = MockInner;

    fn deref(&self) -> &MockInner {
        &self.0
    }
}

impl MockGpu {
    pub fn new(min_images: u32, max_images: u32, modes: &[vk::PresentModeKHR]) -> Self {
        let caps = vk::SurfaceCapabilitiesKHR {
            min_image_count: min_images,
            max_image_count: max_images,
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D { width: 1, height: 1 },
            max_image_extent: vk::Extent2D {
                width: 8192,
                height: 8192,
            },
            supported_transforms: vk::SurfaceTransformFlagsKHR::IDENTITY,
            current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
            supported_composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
            ..Default::default()
        };
        Self(Rc::new(MockInner {
            caps: Cell::new(caps),
            formats: vec![vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            }],
            modes: modes.to_vec(),
            extra_images: Cell::new(0),
            fail_next_swapchain: Cell::new(false),
            state: RefCell::new(MockState::default()),
        }))
    }

    pub fn script_acquire(&self, results: impl IntoIterator<Item = Acquire>) {
        self.state.borrow_mut().acquire_script.extend(results);
    }

    pub fn script_present(&self, results: impl IntoIterator<Item = GpuResult<PresentStatus>>) {
        self.state.borrow_mut().present_script.extend(results);
    }

    pub fn events(&self) -> Vec<Event> {
        self.state.borrow().events.clone()
    }

    pub fn clear_events(&self) {
        self.state.borrow_mut().events.clear();
    }

    pub fn live_swapchains(&self) -> usize {
        self.state.borrow().swapchains.len()
    }

    pub fn live_views(&self) -> usize {
        self.state.borrow().views.len()
    }

    pub fn live_fences(&self) -> usize {
        self.state.borrow().fences.len()
    }

    pub fn live_semaphores(&self) -> usize {
        self.state.borrow().semaphores.len()
    }

    pub fn fence_state(&self, fence: vk::Fence) -> Option<FenceState> {
        self.state.borrow().fences.get(&fence.as_raw()).copied()
    }

    pub fn count(&self, pred: impl Fn(&Event) -> bool) -> usize {
        self.state.borrow().events.iter().filter(|e| pred(e)).count()
    }
}

impl GpuOps for MockGpu {
    fn surface_capabilities(&self) -> GpuResult<vk::SurfaceCapabilitiesKHR> {
        Ok(self.caps.get())
    }

    fn surface_formats(&self) -> GpuResult<Vec<vk::SurfaceFormatKHR>> {
        Ok(self.formats.clone())
    }

    fn present_modes(&self) -> GpuResult<Vec<vk::PresentModeKHR>> {
        Ok(self.modes.clone())
    }

    fn create_swapchain(&self, plan: &SwapchainPlan, old: vk::SwapchainKHR) -> GpuResult<vk::SwapchainKHR> {
        if self.fail_next_swapchain.replace(false) {
            return Err(GpuError::ResourceCreation {
                what: "swapchain",
                result: vk::Result::ERROR_NATIVE_WINDOW_IN_USE_KHR,
            });
        }
        let mut s = self.state.borrow_mut();
        if old != vk::SwapchainKHR::null() {
            assert!(s.swapchains.contains_key(&old.as_raw()), "old swapchain {old:?} is not live");
        }
        let handle = s.handle();
        let images = (0..plan.image_count + self.extra_images.get())
            .map(|i| vk::Image::from_raw(handle * 100 + u64::from(i)))
            .collect();
        s.swapchains.insert(handle, images);
        s.events.push(Event::CreateSwapchain {
            handle,
            old: old.as_raw(),
        });
        Ok(vk::SwapchainKHR::from_raw(handle))
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        let mut s = self.state.borrow_mut();
        assert!(
            s.swapchains.remove(&swapchain.as_raw()).is_some(),
            "swapchain {swapchain:?} destroyed twice"
        );
        s.events.push(Event::DestroySwapchain(swapchain.as_raw()));
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> GpuResult<Vec<vk::Image>> {
        Ok(self.state.borrow().swapchains[&swapchain.as_raw()].clone())
    }

    fn create_image_view(&self, _image: vk::Image, _format: vk::Format) -> GpuResult<vk::ImageView> {
        let mut s = self.state.borrow_mut();
        let h = s.handle();
        s.views.push(h);
        Ok(vk::ImageView::from_raw(h))
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        let mut s = self.state.borrow_mut();
        let pos = s.views.iter().position(|&v| v == view.as_raw());
        let pos = pos.unwrap_or_else(|| panic!("view {view:?} destroyed twice"));
        s.views.swap_remove(pos);
    }

    fn create_fence(&self, signaled: bool) -> GpuResult<vk::Fence> {
        let mut s = self.state.borrow_mut();
        let h = s.handle();
        let state = if signaled {
            FenceState::Signaled
        } else {
            FenceState::Unsignaled
        };
        s.fences.insert(h, state);
        Ok(vk::Fence::from_raw(h))
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let mut s = self.state.borrow_mut();
        let prev = s.fences.remove(&fence.as_raw());
        assert!(prev.is_some(), "fence {fence:?} destroyed twice");
        assert_ne!(prev, Some(FenceState::Pending), "destroyed a fence still in use");
    }

    fn create_semaphore(&self) -> GpuResult<vk::Semaphore> {
        let mut s = self.state.borrow_mut();
        let h = s.handle();
        s.semaphores.push(h);
        Ok(vk::Semaphore::from_raw(h))
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        let mut s = self.state.borrow_mut();
        let pos = s.semaphores.iter().position(|&h| h == semaphore.as_raw());
        let pos = pos.unwrap_or_else(|| panic!("semaphore {semaphore:?} destroyed twice"));
        s.semaphores.swap_remove(pos);
        s.signaled.remove(&semaphore.as_raw());
    }

    /// Completes pending work. Waiting on a fence nobody will signal panics.
    fn wait_fence(&self, fence: vk::Fence) -> GpuResult<()> {
        let mut s = self.state.borrow_mut();
        let state = s.fences.get_mut(&fence.as_raw()).expect("wait on unknown fence");
        assert_ne!(*state, FenceState::Unsignaled, "wait on {fence:?} would never return");
        *state = FenceState::Signaled;
        s.events.push(Event::WaitFence(fence.as_raw()));
        Ok(())
    }

    fn reset_fence(&self, fence: vk::Fence) -> GpuResult<()> {
        let mut s = self.state.borrow_mut();
        let state = s.fences.get_mut(&fence.as_raw()).expect("reset of unknown fence");
        assert_ne!(*state, FenceState::Pending, "reset of {fence:?} while in use");
        *state = FenceState::Unsignaled;
        s.events.push(Event::ResetFence(fence.as_raw()));
        Ok(())
    }

    fn acquire_next_image(&self, swapchain: vk::SwapchainKHR, signal: vk::Semaphore) -> GpuResult<AcquiredImage> {
        let mut s = self.state.borrow_mut();
        let count = s.swapchains[&swapchain.as_raw()].len() as u32;
        let next = match s.acquire_script.pop_front() {
            Some(Acquire::OutOfDate) => return Err(GpuError::SurfaceOutOfDate),
            Some(Acquire::Image(index)) => AcquiredImage {
                index,
                suboptimal: false,
            },
            Some(Acquire::Suboptimal(index)) => AcquiredImage {
                index,
                suboptimal: true,
            },
            None => {
                let index = s.round_robin % count;
                s.round_robin += 1;
                AcquiredImage {
                    index,
                    suboptimal: false,
                }
            }
        };
        assert!(next.index < count, "acquired image out of range");
        assert!(
            s.signaled.insert(signal.as_raw()),
            "acquire signals {signal:?} while an earlier signal is still pending"
        );
        s.events.push(Event::Acquire { image: next.index });
        Ok(next)
    }

    fn submit(
        &self,
        cmd: vk::CommandBuffer,
        wait: vk::Semaphore,
        signal: vk::Semaphore,
        fence: vk::Fence,
    ) -> GpuResult<()> {
        let mut s = self.state.borrow_mut();
        assert!(s.signaled.remove(&wait.as_raw()), "submit waits on {wait:?} which nothing signals");
        assert!(s.signaled.insert(signal.as_raw()), "{signal:?} signalled twice");
        let state = s.fences.get_mut(&fence.as_raw()).expect("submit with unknown fence");
        assert_eq!(*state, FenceState::Unsignaled, "{fence:?} submitted twice without reset");
        *state = FenceState::Pending;
        s.events.push(Event::Submit {
            cmd: cmd.as_raw(),
            fence: fence.as_raw(),
        });
        Ok(())
    }

    fn present(&self, _swapchain: vk::SwapchainKHR, index: u32, wait: vk::Semaphore) -> GpuResult<PresentStatus> {
        let mut s = self.state.borrow_mut();
        assert!(s.signaled.remove(&wait.as_raw()), "present waits on {wait:?} which nothing signals");
        s.events.push(Event::Present { image: index });
        s.present_script.pop_front().unwrap_or(Ok(PresentStatus::Optimal))
    }

    fn wait_idle(&self) -> GpuResult<()> {
        let mut s = self.state.borrow_mut();
        for state in s.fences.values_mut() {
            if *state == FenceState::Pending {
                *state = FenceState::Signaled;
            }
        }
        s.events.push(Event::WaitIdle);
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum ContentEvent {
    Release(usize),
    Record { slot: usize, image: usize },
    ReleaseAll,
    Rebuilt { images: usize },
}

/// Records what the synchronizer asks of the renderer and tracks which
/// images currently hold targets.
#[derive(Default)]
pub(crate) struct MockContent {
    pub events: Vec<ContentEvent>,
    pub live: Vec<usize>,
    /// The next `record` fails as if a framebuffer could not be created.
    pub fail_next_record: bool,
}

impl FrameContent for MockContent {
    fn release_image(&mut self, image: usize) {
        self.live.retain(|&i| i != image);
        self.events.push(ContentEvent::Release(image));
    }

    fn record(&mut self, slot: usize, image: usize, swapchain: &dyn SwapchainInfo) -> GpuResult<vk::CommandBuffer> {
        assert!(image < swapchain.image_count());
        if std::mem::take(&mut self.fail_next_record) {
            return Err(GpuError::ResourceCreation {
                what: "framebuffer",
                result: vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
            });
        }
        assert!(!self.live.contains(&image), "image {image} recorded while still owned by another frame");
        self.live.push(image);
        self.events.push(ContentEvent::Record { slot, image });
        Ok(vk::CommandBuffer::from_raw(1000 + slot as u64))
    }

    fn release_all(&mut self) {
        self.live.clear();
        self.events.push(ContentEvent::ReleaseAll);
    }

    fn swapchain_rebuilt(&mut self, swapchain: &dyn SwapchainInfo) -> GpuResult<()> {
        self.events.push(ContentEvent::Rebuilt {
            images: swapchain.image_count(),
        });
        Ok(())
    }
}
