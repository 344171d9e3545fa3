// SPDX-License-Identifier: CEPL-1.0
//! Per-image render targets: a framebuffer over the swapchain view and,
//! for depth passes, a depth image of matching extent.

use std::sync::Arc;

use ash::vk;
use slotmap::SlotMap;
use tracing::trace;

use crate::device::Device;
use crate::error::{GpuError, GpuResult, VkResultExt};
use crate::render_pass::RenderPassKind;
use crate::swapchain::SwapchainInfo;

slotmap::new_key_type! {
    /// Generational handle of one image's targets. Stale after the image is
    /// released, even if the slot is reused.
    pub struct TargetKey;
}

/// Arena of per-image values, indexed by swapchain image.
pub struct TargetSlots<T> {
    arena: SlotMap<TargetKey, T>,
    by_image: Vec<Option<TargetKey>>,
}

impl<T> TargetSlots<T> {
    pub fn new(images: usize) -> Self {
        Self {
            arena: SlotMap::with_key(),
            by_image: vec![None; images],
        }
    }

    pub fn image_count(&self) -> usize {
        self.by_image.len()
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    /// Stores `value` for `image`, handing back whatever it replaced.
    pub fn insert(&mut self, image: usize, value: T) -> (TargetKey, Option<T>) {
        if image >= self.by_image.len() {
            self.by_image.resize(image + 1, None);
        }
        let replaced = self.take(image);
        let key = self.arena.insert(value);
        self.by_image[image] = Some(key);
        (key, replaced)
    }

    pub fn take(&mut self, image: usize) -> Option<T> {
        let key = self.by_image.get_mut(image)?.take()?;
        self.arena.remove(key)
    }

    pub fn key_of(&self, image: usize) -> Option<TargetKey> {
        self.by_image.get(image).copied().flatten()
    }

    pub fn get(&self, image: usize) -> Option<&T> {
        self.key_of(image).and_then(|k| self.arena.get(k))
    }

    pub fn get_by_key(&self, key: TargetKey) -> Option<&T> {
        self.arena.get(key)
    }

    /// Empties the arena and resizes for `images` images.
    pub fn reset(&mut self, images: usize) -> Vec<T> {
        let drained = self.drain();
        self.by_image = vec![None; images];
        drained
    }

    pub fn drain(&mut self) -> Vec<T> {
        self.by_image.iter_mut().for_each(|k| *k = None);
        self.arena.drain().map(|(_, v)| v).collect()
    }
}

pub struct DepthImage {
    pub image: vk::Image,
    pub memory: vk::DeviceMemory,
    pub view: vk::ImageView,
}

pub struct ImageTarget {
    pub framebuffer: vk::Framebuffer,
    pub extent: vk::Extent2D,
    pub depth: Option<DepthImage>,
}

/// Index of the first memory type allowed by `type_bits` with all of `required`.
pub fn find_memory_type(
    props: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
) -> Option<u32> {
    (0..props.memory_type_count).find(|&i| {
        type_bits & (1 << i) != 0 && props.memory_types[i as usize].property_flags.contains(required)
    })
}

/// Framebuffers and depth images for every swapchain image that has been
/// rendered since the last release.
pub struct FrameTargets {
    slots: TargetSlots<ImageTarget>,
    device: Arc<Device>,
}

impl FrameTargets {
    pub fn new(device: Arc<Device>, images: usize) -> Self {
        Self {
            slots: TargetSlots::new(images),
            device,
        }
    }

    /// (Re)builds the targets of `image` for `pass`.
    pub fn build(&mut self, image: usize, pass: &RenderPassKind, swapchain: &dyn SwapchainInfo) -> GpuResult<TargetKey> {
        let view = swapchain
            .image_view(image)
            .ok_or_else(|| GpuError::configuration(format!("swapchain has no image {image}")))?;
        let extent = swapchain.extent();

        let depth = match pass.depth_attachment() {
            Some(d) => Some(self.create_depth_image(extent, d.depth_format())?),
            None => None,
        };
        let mut attachments = vec![view];
        attachments.extend(depth.as_ref().map(|d| d.view));

        let fb_info = vk::FramebufferCreateInfo {
            s_type: vk::StructureType::FRAMEBUFFER_CREATE_INFO,
            render_pass: pass.raw(),
            attachment_count: attachments.len() as u32,
            p_attachments: attachments.as_ptr(),
            width: extent.width,
            height: extent.height,
            layers: 1,
            ..Default::default()
        };
        let framebuffer = match unsafe { self.device.raw().create_framebuffer(&fb_info, None) } {
            Ok(fb) => fb,
            Err(result) => {
                if let Some(d) = depth {
                    self.destroy_depth(d);
                }
                return Err(GpuError::ResourceCreation {
                    what: "framebuffer",
                    result,
                });
            }
        };

        let (key, replaced) = self.slots.insert(
            image,
            ImageTarget {
                framebuffer,
                extent,
                depth,
            },
        );
        if let Some(old) = replaced {
            self.destroy_target(old);
        }
        trace!("targets for image {image} built ({key:?})");
        Ok(key)
    }

    pub fn get(&self, image: usize) -> Option<&ImageTarget> {
        self.slots.get(image)
    }

    pub fn framebuffer(&self, image: usize) -> Option<vk::Framebuffer> {
        self.get(image).map(|t| t.framebuffer)
    }

    pub fn release(&mut self, image: usize) {
        if let Some(target) = self.slots.take(image) {
            self.destroy_target(target);
        }
    }

    pub fn release_all(&mut self) {
        for target in self.slots.drain() {
            self.destroy_target(target);
        }
    }

    /// Drops everything and resizes for a swapchain with `images` images.
    pub fn reset(&mut self, images: usize) {
        for target in self.slots.reset(images) {
            self.destroy_target(target);
        }
    }

    fn create_depth_image(&self, extent: vk::Extent2D, format: vk::Format) -> GpuResult<DepthImage> {
        let d = self.device.raw();
        let image_info = vk::ImageCreateInfo {
            s_type: vk::StructureType::IMAGE_CREATE_INFO,
            image_type: vk::ImageType::TYPE_2D,
            format,
            extent: vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            },
            mip_levels: 1,
            array_layers: 1,
            samples: vk::SampleCountFlags::TYPE_1,
            tiling: vk::ImageTiling::OPTIMAL,
            usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            ..Default::default()
        };
        let image = unsafe { d.create_image(&image_info, None) }.created("depth image")?;

        let req = unsafe { d.get_image_memory_requirements(image) };
        let Some(memory_type_index) = find_memory_type(
            self.device.memory_properties(),
            req.memory_type_bits,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        ) else {
            unsafe { d.destroy_image(image, None) };
            return Err(GpuError::configuration("no device-local memory type for depth image"));
        };
        let alloc = vk::MemoryAllocateInfo {
            s_type: vk::StructureType::MEMORY_ALLOCATE_INFO,
            allocation_size: req.size,
            memory_type_index,
            ..Default::default()
        };
        let memory = match unsafe { d.allocate_memory(&alloc, None) } {
            Ok(m) => m,
            Err(result) => {
                unsafe { d.destroy_image(image, None) };
                return Err(GpuError::ResourceCreation {
                    what: "depth image memory",
                    result,
                });
            }
        };

        let view_info = vk::ImageViewCreateInfo {
            s_type: vk::StructureType::IMAGE_VIEW_CREATE_INFO,
            image,
            view_type: vk::ImageViewType::TYPE_2D,
            format,
            subresource_range: vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::DEPTH,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            },
            ..Default::default()
        };
        let view = unsafe {
            d.bind_image_memory(image, memory, 0)
                .and_then(|_| d.create_image_view(&view_info, None))
        };
        match view {
            Ok(view) => Ok(DepthImage { image, memory, view }),
            Err(result) => {
                unsafe {
                    d.destroy_image(image, None);
                    d.free_memory(memory, None);
                }
                Err(GpuError::ResourceCreation {
                    what: "depth image view",
                    result,
                })
            }
        }
    }

    fn destroy_depth(&self, depth: DepthImage) {
        let d = self.device.raw();
        unsafe {
            d.destroy_image_view(depth.view, None);
            d.destroy_image(depth.image, None);
            d.free_memory(depth.memory, None);
        }
    }

    fn destroy_target(&self, target: ImageTarget) {
        unsafe { self.device.raw().destroy_framebuffer(target.framebuffer, None) };
        if let Some(depth) = target.depth {
            self.destroy_depth(depth);
        }
    }
}

impl Drop for FrameTargets {
    fn drop(&mut self) {
        self.release_all();
    }
}
