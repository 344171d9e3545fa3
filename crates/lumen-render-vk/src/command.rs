// SPDX-License-Identifier: CEPL-1.0
//! Command pools per queue family.
//!
//! Capabilities that share the graphics family get no pool of their own;
//! asking for one hands back the graphics pool, so callers never have to
//! check whether a dedicated family exists.

use std::sync::Arc;

use ash::vk;
use tracing::debug;

use crate::device::Device;
use crate::error::{GpuError, GpuResult, VkResultExt};
use crate::queue::{Capability, QueueFamilyIndices};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolEntry {
    pub pool: vk::CommandPool,
    pub family: u32,
}

/// Up to four pools, one per pool-owning capability.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CommandPools {
    graphics: Option<PoolEntry>,
    compute: Option<PoolEntry>,
    transfer: Option<PoolEntry>,
    sparse_binding: Option<PoolEntry>,
}

const POOL_CAPABILITIES: [Capability; 4] = [
    Capability::Graphics,
    Capability::Compute,
    Capability::Transfer,
    Capability::SparseBinding,
];

impl CommandPools {
    /// Capabilities that get their own pool, with the family it targets.
    pub fn plan(indices: &QueueFamilyIndices) -> Vec<(Capability, u32)> {
        let graphics = indices.index(Capability::Graphics);
        POOL_CAPABILITIES
            .into_iter()
            .filter_map(|cap| {
                let family = indices.index(cap)?;
                let own = cap == Capability::Graphics || graphics != Some(family);
                own.then_some((cap, family))
            })
            .collect()
    }

    /// Builds the group, calling `create` once per planned pool. Pools made
    /// before a failure are handed to `destroy`.
    pub fn build(
        indices: &QueueFamilyIndices,
        mut create: impl FnMut(u32) -> GpuResult<vk::CommandPool>,
        mut destroy: impl FnMut(vk::CommandPool),
    ) -> GpuResult<Self> {
        let mut pools = Self::default();
        for (cap, family) in Self::plan(indices) {
            match create(family) {
                Ok(pool) => *pools.slot(cap) = Some(PoolEntry { pool, family }),
                Err(e) => {
                    pools.drain().for_each(|entry| destroy(entry.pool));
                    return Err(e);
                }
            }
        }
        Ok(pools)
    }

    fn slot(&mut self, cap: Capability) -> &mut Option<PoolEntry> {
        match cap {
            Capability::Compute => &mut self.compute,
            Capability::Transfer => &mut self.transfer,
            Capability::SparseBinding => &mut self.sparse_binding,
            Capability::Graphics | Capability::Present => &mut self.graphics,
        }
    }

    fn own(&self, cap: Capability) -> Option<PoolEntry> {
        match cap {
            Capability::Compute => self.compute,
            Capability::Transfer => self.transfer,
            Capability::SparseBinding => self.sparse_binding,
            Capability::Graphics | Capability::Present => self.graphics,
        }
    }

    /// Pool for `cap`, or the graphics pool if `cap` has none of its own.
    pub fn get(&self, cap: Capability) -> Option<PoolEntry> {
        self.own(cap).or(self.graphics)
    }

    pub fn has_own(&self, cap: Capability) -> bool {
        self.own(cap).is_some()
    }

    fn drain(&mut self) -> impl Iterator<Item = PoolEntry> {
        [
            self.graphics.take(),
            self.compute.take(),
            self.transfer.take(),
            self.sparse_binding.take(),
        ]
        .into_iter()
        .flatten()
    }
}

/// Device calls that one-shot submission goes through.
pub trait CommandOps {
    fn allocate_command_buffers(&self, pool: vk::CommandPool, count: u32) -> GpuResult<Vec<vk::CommandBuffer>>;
    fn free_command_buffers(&self, pool: vk::CommandPool, buffers: &[vk::CommandBuffer]);
    fn begin_command_buffer(&self, cmd: vk::CommandBuffer, flags: vk::CommandBufferUsageFlags) -> GpuResult<()>;
    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> GpuResult<()>;
    fn family_queue(&self, family: u32) -> Option<vk::Queue>;
    fn create_fence(&self, signaled: bool) -> GpuResult<vk::Fence>;
    fn destroy_fence(&self, fence: vk::Fence);
    fn submit_batch(&self, queue: vk::Queue, buffers: &[vk::CommandBuffer], fence: vk::Fence) -> GpuResult<()>;
    fn wait_fence(&self, fence: vk::Fence) -> GpuResult<()>;
}

impl CommandOps for Device {
    fn allocate_command_buffers(&self, pool: vk::CommandPool, count: u32) -> GpuResult<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_ALLOCATE_INFO,
            command_pool: pool,
            level: vk::CommandBufferLevel::PRIMARY,
            command_buffer_count: count,
            ..Default::default()
        };
        unsafe { self.raw().allocate_command_buffers(&alloc_info) }.created("command buffers")
    }

    fn free_command_buffers(&self, pool: vk::CommandPool, buffers: &[vk::CommandBuffer]) {
        unsafe { self.raw().free_command_buffers(pool, buffers) };
    }

    fn begin_command_buffer(&self, cmd: vk::CommandBuffer, flags: vk::CommandBufferUsageFlags) -> GpuResult<()> {
        let begin = vk::CommandBufferBeginInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_BEGIN_INFO,
            flags,
            ..Default::default()
        };
        unsafe { self.raw().begin_command_buffer(cmd, &begin) }.during("vkBeginCommandBuffer")
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> GpuResult<()> {
        unsafe { self.raw().end_command_buffer(cmd) }.during("vkEndCommandBuffer")
    }

    fn family_queue(&self, family: u32) -> Option<vk::Queue> {
        self.queue_for_family(family)
    }

    fn create_fence(&self, signaled: bool) -> GpuResult<vk::Fence> {
        let info = vk::FenceCreateInfo {
            s_type: vk::StructureType::FENCE_CREATE_INFO,
            flags: if signaled {
                vk::FenceCreateFlags::SIGNALED
            } else {
                vk::FenceCreateFlags::empty()
            },
            ..Default::default()
        };
        unsafe { self.raw().create_fence(&info, None) }.created("fence")
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.raw().destroy_fence(fence, None) };
    }

    fn submit_batch(&self, queue: vk::Queue, buffers: &[vk::CommandBuffer], fence: vk::Fence) -> GpuResult<()> {
        let submit = vk::SubmitInfo {
            s_type: vk::StructureType::SUBMIT_INFO,
            command_buffer_count: buffers.len() as u32,
            p_command_buffers: buffers.as_ptr(),
            ..Default::default()
        };
        unsafe { self.raw().queue_submit(queue, std::slice::from_ref(&submit), fence) }.during("vkQueueSubmit")
    }

    fn wait_fence(&self, fence: vk::Fence) -> GpuResult<()> {
        unsafe { self.raw().wait_for_fences(&[fence], true, u64::MAX) }.during("vkWaitForFences")
    }
}

/// Buffers allocated and begun by [`CommandPoolManager::begin_one_shot`].
#[must_use = "one-shot buffers must be passed to end_and_submit"]
pub struct OneShot {
    entry: PoolEntry,
    buffers: Vec<vk::CommandBuffer>,
}

impl OneShot {
    /// Allocates `count` buffers (at least one) from `entry` and begins them
    /// for a single submission.
    pub fn begin<O: CommandOps + ?Sized>(ops: &O, entry: PoolEntry, count: u32) -> GpuResult<Self> {
        let buffers = ops.allocate_command_buffers(entry.pool, count.max(1))?;
        for &cmd in &buffers {
            if let Err(e) = ops.begin_command_buffer(cmd, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT) {
                ops.free_command_buffers(entry.pool, &buffers);
                return Err(e);
            }
        }
        Ok(Self { entry, buffers })
    }

    pub fn buffers(&self) -> &[vk::CommandBuffer] {
        &self.buffers
    }

    pub fn first(&self) -> vk::CommandBuffer {
        self.buffers[0]
    }

    /// Ends, submits and waits on a fresh fence. The buffers are freed
    /// whether or not the submission went through.
    pub fn submit<O: CommandOps + ?Sized>(self, ops: &O) -> GpuResult<()> {
        let OneShot { entry, buffers } = self;
        let result = run_to_completion(ops, entry.family, &buffers);
        ops.free_command_buffers(entry.pool, &buffers);
        result
    }
}

fn run_to_completion<O: CommandOps + ?Sized>(ops: &O, family: u32, buffers: &[vk::CommandBuffer]) -> GpuResult<()> {
    for &cmd in buffers {
        ops.end_command_buffer(cmd)?;
    }
    let queue = ops
        .family_queue(family)
        .ok_or_else(|| GpuError::configuration(format!("no queue fetched for family {family}")))?;
    let fence = ops.create_fence(false)?;
    let waited = ops
        .submit_batch(queue, buffers, fence)
        .and_then(|_| ops.wait_fence(fence));
    ops.destroy_fence(fence);
    waited
}

/// General (resettable) and short-lived (transient) pools for every family.
pub struct CommandPoolManager {
    general: CommandPools,
    short_lived: CommandPools,
    device: Arc<Device>,
}

impl CommandPoolManager {
    pub fn new(device: Arc<Device>) -> GpuResult<Self> {
        let general = create_group(&device, vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)?;
        let short_lived = match create_group(&device, vk::CommandPoolCreateFlags::TRANSIENT) {
            Ok(p) => p,
            Err(e) => {
                let mut general = general;
                destroy_group(&device, &mut general);
                return Err(e);
            }
        };
        debug!(
            "command pools: {:?}",
            CommandPools::plan(device.indices())
                .iter()
                .map(|(cap, fam)| format!("{cap:?}@{fam}"))
                .collect::<Vec<_>>()
        );
        Ok(Self {
            general,
            short_lived,
            device,
        })
    }

    pub fn general(&self, cap: Capability) -> Option<vk::CommandPool> {
        self.general.get(cap).map(|e| e.pool)
    }

    pub fn short_lived(&self, cap: Capability) -> Option<vk::CommandPool> {
        self.short_lived.get(cap).map(|e| e.pool)
    }

    pub fn pools(&self) -> (&CommandPools, &CommandPools) {
        (&self.general, &self.short_lived)
    }

    fn entry(pools: &CommandPools, cap: Capability) -> GpuResult<PoolEntry> {
        pools
            .get(cap)
            .ok_or_else(|| GpuError::configuration(format!("no command pool can serve {cap:?}")))
    }

    /// Long-lived primary buffers from the general pool for `cap`.
    pub fn allocate_primary(&self, cap: Capability, count: u32) -> GpuResult<Vec<vk::CommandBuffer>> {
        let entry = Self::entry(&self.general, cap)?;
        self.device.allocate_command_buffers(entry.pool, count)
    }

    pub fn free(&self, cap: Capability, buffers: &[vk::CommandBuffer]) {
        if buffers.is_empty() {
            return;
        }
        if let Some(entry) = self.general.get(cap) {
            self.device.free_command_buffers(entry.pool, buffers);
        }
    }

    /// Allocates `count` buffers from the short-lived pool and begins them
    /// for a single submission.
    pub fn begin_one_shot(&self, cap: Capability, count: u32) -> GpuResult<OneShot> {
        OneShot::begin(&*self.device, Self::entry(&self.short_lived, cap)?, count)
    }

    /// Ends, submits and waits for a one-shot batch, then frees it.
    ///
    /// Blocks the calling thread. Setup and resize paths only.
    pub fn end_and_submit(&self, shot: OneShot) -> GpuResult<()> {
        shot.submit(&*self.device)
    }

    /// Records one buffer with `record` and runs it to completion.
    pub fn one_shot(&self, cap: Capability, record: impl FnOnce(&ash::Device, vk::CommandBuffer)) -> GpuResult<()> {
        let shot = self.begin_one_shot(cap, 1)?;
        record(self.device.raw(), shot.first());
        self.end_and_submit(shot)
    }
}

fn create_group(device: &Device, flags: vk::CommandPoolCreateFlags) -> GpuResult<CommandPools> {
    let d = device.raw();
    CommandPools::build(
        device.indices(),
        |family| {
            let info = vk::CommandPoolCreateInfo {
                s_type: vk::StructureType::COMMAND_POOL_CREATE_INFO,
                queue_family_index: family,
                flags,
                ..Default::default()
            };
            unsafe { d.create_command_pool(&info, None) }.created("command pool")
        },
        |pool| unsafe { d.destroy_command_pool(pool, None) },
    )
}

fn destroy_group(device: &Device, pools: &mut CommandPools) {
    for entry in pools.drain() {
        unsafe { device.raw().destroy_command_pool(entry.pool, None) };
    }
}

impl Drop for CommandPoolManager {
    fn drop(&mut self) {
        destroy_group(&self.device, &mut self.short_lived);
        destroy_group(&self.device, &mut self.general);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::ResolvedFamily;
    use ash::vk::Handle;
    use std::cell::{Cell, RefCell};
    use std::collections::HashMap;

    #[derive(Clone, Debug, PartialEq, Eq)]
    enum Op {
        Allocate { pool: u64, count: u32 },
        Free { pool: u64, count: usize },
        Begin(u64),
        End(u64),
        CreateFence { signaled: bool },
        Submit { buffers: usize, fence: u64 },
        Wait(u64),
        DestroyFence(u64),
    }

    /// Records every call and keeps fences honest: waiting on an
    /// unsubmitted, unsignalled fence would block forever.
    #[derive(Default)]
    struct Recorder {
        ops: RefCell<Vec<Op>>,
        next: Cell<u64>,
        /// fence -> submitted
        fences: RefCell<HashMap<u64, bool>>,
        live_buffers: Cell<usize>,
        no_queue: bool,
        fail_begin: Cell<bool>,
        fail_submit: Cell<bool>,
    }

    impl Recorder {
        fn handle(&self) -> u64 {
            self.next.set(self.next.get() + 1);
            100 + self.next.get()
        }

        fn ops(&self) -> Vec<Op> {
            self.ops.borrow().clone()
        }
    }

    impl CommandOps for Recorder {
        fn allocate_command_buffers(&self, pool: vk::CommandPool, count: u32) -> GpuResult<Vec<vk::CommandBuffer>> {
            self.ops.borrow_mut().push(Op::Allocate { pool: pool.as_raw(), count });
            self.live_buffers.set(self.live_buffers.get() + count as usize);
            Ok((0..count).map(|_| vk::CommandBuffer::from_raw(self.handle())).collect())
        }

        fn free_command_buffers(&self, pool: vk::CommandPool, buffers: &[vk::CommandBuffer]) {
            self.ops.borrow_mut().push(Op::Free {
                pool: pool.as_raw(),
                count: buffers.len(),
            });
            self.live_buffers.set(self.live_buffers.get() - buffers.len());
        }

        fn begin_command_buffer(&self, cmd: vk::CommandBuffer, flags: vk::CommandBufferUsageFlags) -> GpuResult<()> {
            assert_eq!(flags, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            if self.fail_begin.replace(false) {
                return Err(GpuError::Vk {
                    call: "vkBeginCommandBuffer",
                    result: vk::Result::ERROR_OUT_OF_HOST_MEMORY,
                });
            }
            self.ops.borrow_mut().push(Op::Begin(cmd.as_raw()));
            Ok(())
        }

        fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> GpuResult<()> {
            self.ops.borrow_mut().push(Op::End(cmd.as_raw()));
            Ok(())
        }

        fn family_queue(&self, family: u32) -> Option<vk::Queue> {
            (!self.no_queue).then(|| vk::Queue::from_raw(u64::from(family) + 1))
        }

        fn create_fence(&self, signaled: bool) -> GpuResult<vk::Fence> {
            let h = self.handle();
            self.fences.borrow_mut().insert(h, false);
            self.ops.borrow_mut().push(Op::CreateFence { signaled });
            Ok(vk::Fence::from_raw(h))
        }

        fn destroy_fence(&self, fence: vk::Fence) {
            assert!(self.fences.borrow_mut().remove(&fence.as_raw()).is_some());
            self.ops.borrow_mut().push(Op::DestroyFence(fence.as_raw()));
        }

        fn submit_batch(&self, _queue: vk::Queue, buffers: &[vk::CommandBuffer], fence: vk::Fence) -> GpuResult<()> {
            if self.fail_submit.replace(false) {
                return Err(GpuError::Vk {
                    call: "vkQueueSubmit",
                    result: vk::Result::ERROR_DEVICE_LOST,
                });
            }
            self.fences.borrow_mut().insert(fence.as_raw(), true);
            self.ops.borrow_mut().push(Op::Submit {
                buffers: buffers.len(),
                fence: fence.as_raw(),
            });
            Ok(())
        }

        fn wait_fence(&self, fence: vk::Fence) -> GpuResult<()> {
            assert_eq!(self.fences.borrow().get(&fence.as_raw()), Some(&true), "wait would never return");
            self.ops.borrow_mut().push(Op::Wait(fence.as_raw()));
            Ok(())
        }
    }

    fn transfer_pool() -> PoolEntry {
        PoolEntry {
            pool: vk::CommandPool::from_raw(0),
            family: 1,
        }
    }

    #[test]
    fn one_shot_waits_on_a_fresh_fence_then_frees_everything() {
        let ops = Recorder::default();
        let shot = OneShot::begin(&ops, transfer_pool(), 2).unwrap();
        let (a, b) = (shot.buffers()[0].as_raw(), shot.buffers()[1].as_raw());
        assert_eq!(shot.first().as_raw(), a);
        shot.submit(&ops).unwrap();

        let fence = 103;
        assert_eq!(
            ops.ops(),
            vec![
                Op::Allocate { pool: 0, count: 2 },
                Op::Begin(a),
                Op::Begin(b),
                Op::End(a),
                Op::End(b),
                Op::CreateFence { signaled: false },
                Op::Submit { buffers: 2, fence },
                Op::Wait(fence),
                Op::DestroyFence(fence),
                Op::Free { pool: 0, count: 2 },
            ]
        );
        assert!(ops.fences.borrow().is_empty());
        assert_eq!(ops.live_buffers.get(), 0);
    }

    #[test]
    fn failed_submit_destroys_fence_and_frees_buffers() {
        let ops = Recorder::default();
        let shot = OneShot::begin(&ops, transfer_pool(), 1).unwrap();
        ops.fail_submit.set(true);
        let err = shot.submit(&ops).unwrap_err();
        assert!(matches!(err, GpuError::Vk { call: "vkQueueSubmit", .. }));

        let recorded = ops.ops();
        assert!(!recorded.iter().any(|op| matches!(op, Op::Wait(_))));
        assert!(recorded.iter().any(|op| matches!(op, Op::DestroyFence(_))));
        assert_eq!(recorded.last(), Some(&Op::Free { pool: 0, count: 1 }));
        assert!(ops.fences.borrow().is_empty());
        assert_eq!(ops.live_buffers.get(), 0);
    }

    #[test]
    fn missing_queue_frees_buffers_without_a_fence() {
        let ops = Recorder {
            no_queue: true,
            ..Recorder::default()
        };
        let shot = OneShot::begin(&ops, transfer_pool(), 1).unwrap();
        assert!(matches!(shot.submit(&ops), Err(GpuError::Configuration(_))));
        assert!(!ops.ops().iter().any(|op| matches!(op, Op::CreateFence { .. })));
        assert_eq!(ops.live_buffers.get(), 0);
    }

    #[test]
    fn failed_begin_frees_the_allocation_and_zero_count_still_allocates_one() {
        let ops = Recorder::default();
        ops.fail_begin.set(true);
        assert!(OneShot::begin(&ops, transfer_pool(), 3).is_err());
        assert_eq!(ops.ops().last(), Some(&Op::Free { pool: 0, count: 3 }));
        assert_eq!(ops.live_buffers.get(), 0);

        let shot = OneShot::begin(&ops, transfer_pool(), 0).unwrap();
        assert_eq!(shot.buffers().len(), 1);
        shot.submit(&ops).unwrap();
        assert_eq!(ops.live_buffers.get(), 0);
    }

    fn fam(index: u32) -> Option<ResolvedFamily> {
        Some(ResolvedFamily { index, dedicated: index != 0 })
    }

    fn fake_pools(indices: &QueueFamilyIndices) -> CommandPools {
        let mut next = 0u64;
        CommandPools::build(
            indices,
            |_| {
                next += 1;
                Ok(vk::CommandPool::from_raw(next))
            },
            |_| panic!("nothing to destroy"),
        )
        .unwrap()
    }

    #[test]
    fn shared_capabilities_fall_back_to_graphics_pool() {
        let indices = QueueFamilyIndices {
            graphics: Some(ResolvedFamily { index: 0, dedicated: false }),
            compute: Some(ResolvedFamily { index: 0, dedicated: false }),
            transfer: Some(ResolvedFamily { index: 0, dedicated: false }),
            present: Some(ResolvedFamily { index: 0, dedicated: false }),
            ..Default::default()
        };
        assert_eq!(CommandPools::plan(&indices), vec![(Capability::Graphics, 0)]);

        let pools = fake_pools(&indices);
        let graphics = pools.get(Capability::Graphics).unwrap();
        for cap in [Capability::Compute, Capability::Transfer, Capability::SparseBinding] {
            assert_eq!(pools.get(cap), Some(graphics), "{cap:?}");
            assert!(!pools.has_own(cap));
        }
    }

    #[test]
    fn dedicated_families_get_their_own_pools() {
        let indices = QueueFamilyIndices {
            graphics: fam(0),
            compute: fam(2),
            transfer: fam(1),
            ..Default::default()
        };
        let pools = fake_pools(&indices);
        assert_eq!(pools.get(Capability::Compute).unwrap().family, 2);
        assert_eq!(pools.get(Capability::Transfer).unwrap().family, 1);
        assert_eq!(pools.get(Capability::SparseBinding).unwrap().family, 0);
        assert_ne!(pools.get(Capability::Compute), pools.get(Capability::Graphics));
    }

    #[test]
    fn failed_creation_destroys_earlier_pools() {
        let indices = QueueFamilyIndices {
            graphics: fam(0),
            compute: fam(2),
            transfer: fam(1),
            ..Default::default()
        };
        let mut created = 0;
        let mut destroyed = Vec::new();
        let result = CommandPools::build(
            &indices,
            |_| {
                created += 1;
                if created == 3 {
                    Err(GpuError::ResourceCreation {
                        what: "command pool",
                        result: vk::Result::ERROR_OUT_OF_HOST_MEMORY,
                    })
                } else {
                    Ok(vk::CommandPool::from_raw(created))
                }
            },
            |pool| destroyed.push(pool.as_raw()),
        );
        assert!(matches!(result, Err(GpuError::ResourceCreation { .. })));
        assert_eq!(destroyed, vec![1, 2]);
    }

    #[test]
    fn compute_only_device_has_no_fallback_pool() {
        let indices = QueueFamilyIndices {
            compute: fam(1),
            ..Default::default()
        };
        let pools = fake_pools(&indices);
        assert!(pools.get(Capability::Compute).is_some());
        assert_eq!(pools.get(Capability::Transfer), None);
    }
}
