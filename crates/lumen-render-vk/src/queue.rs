// SPDX-License-Identifier: CEPL-1.0
//! Queue-family resolution.
//!
//! Families are matched greedily in the order the driver reports them: the
//! first family that satisfies a rule wins, even when a later one would
//! spread work across more hardware queues.

use ash::vk;
use bitflags::bitflags;

bitflags! {
    /// Queue capabilities a caller can ask the device selector for.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct QueueCapabilities: u32 {
        const GRAPHICS = 1 << 0;
        const COMPUTE = 1 << 1;
        const TRANSFER = 1 << 2;
        const SPARSE_BINDING = 1 << 3;
        const PRESENT = 1 << 4;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Capability {
    Graphics,
    Compute,
    Transfer,
    SparseBinding,
    Present,
}

impl Capability {
    pub const ALL: [Capability; 5] = [
        Capability::Graphics,
        Capability::Compute,
        Capability::Transfer,
        Capability::SparseBinding,
        Capability::Present,
    ];

    pub fn flag(self) -> QueueCapabilities {
        match self {
            Capability::Graphics => QueueCapabilities::GRAPHICS,
            Capability::Compute => QueueCapabilities::COMPUTE,
            Capability::Transfer => QueueCapabilities::TRANSFER,
            Capability::SparseBinding => QueueCapabilities::SPARSE_BINDING,
            Capability::Present => QueueCapabilities::PRESENT,
        }
    }

    /// Matching Vulkan queue flag. Presentation is a per-surface query, not a flag.
    pub fn queue_flag(self) -> Option<vk::QueueFlags> {
        match self {
            Capability::Graphics => Some(vk::QueueFlags::GRAPHICS),
            Capability::Compute => Some(vk::QueueFlags::COMPUTE),
            Capability::Transfer => Some(vk::QueueFlags::TRANSFER),
            Capability::SparseBinding => Some(vk::QueueFlags::SPARSE_BINDING),
            Capability::Present => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResolvedFamily {
    pub index: u32,
    /// The family has no graphics capability.
    pub dedicated: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    pub graphics: Option<ResolvedFamily>,
    pub compute: Option<ResolvedFamily>,
    pub transfer: Option<ResolvedFamily>,
    pub sparse_binding: Option<ResolvedFamily>,
    pub present: Option<ResolvedFamily>,
    pub shared_graphics_present: bool,
}

impl QueueFamilyIndices {
    pub fn get(&self, cap: Capability) -> Option<ResolvedFamily> {
        match cap {
            Capability::Graphics => self.graphics,
            Capability::Compute => self.compute,
            Capability::Transfer => self.transfer,
            Capability::SparseBinding => self.sparse_binding,
            Capability::Present => self.present,
        }
    }

    pub fn index(&self, cap: Capability) -> Option<u32> {
        self.get(cap).map(|f| f.index)
    }

    pub fn is_dedicated(&self, cap: Capability) -> bool {
        self.get(cap).is_some_and(|f| f.dedicated)
    }

    /// Requested capabilities that did not resolve to a family.
    pub fn missing(&self, requested: QueueCapabilities) -> QueueCapabilities {
        Capability::ALL
            .into_iter()
            .filter(|&cap| requested.contains(cap.flag()) && self.get(cap).is_none())
            .fold(QueueCapabilities::empty(), |acc, cap| acc | cap.flag())
    }

    /// Resolved family indices without duplicates, in capability order.
    pub fn distinct_families(&self) -> Vec<u32> {
        let mut out = Vec::with_capacity(Capability::ALL.len());
        for cap in Capability::ALL {
            if let Some(index) = self.index(cap) {
                if !out.contains(&index) {
                    out.push(index);
                }
            }
        }
        out
    }
}

fn usable(family: &vk::QueueFamilyProperties, flag: vk::QueueFlags) -> bool {
    family.queue_count > 0 && family.queue_flags.contains(flag)
}

fn shared(index: usize) -> ResolvedFamily {
    ResolvedFamily {
        index: index as u32,
        dedicated: false,
    }
}

/// First family with `flag` but without graphics.
fn find_dedicated(families: &[vk::QueueFamilyProperties], flag: vk::QueueFlags) -> Option<ResolvedFamily> {
    families
        .iter()
        .position(|f| usable(f, flag) && !f.queue_flags.contains(vk::QueueFlags::GRAPHICS))
        .map(|i| ResolvedFamily {
            index: i as u32,
            dedicated: true,
        })
}

fn find_first(families: &[vk::QueueFamilyProperties], flag: vk::QueueFlags) -> Option<ResolvedFamily> {
    families.iter().position(|f| usable(f, flag)).map(shared)
}

/// Resolves a family per requested capability.
///
/// `present_support[i]` tells whether family `i` can present to the target
/// surface; missing entries count as unsupported.
pub fn resolve_queue_families(
    families: &[vk::QueueFamilyProperties],
    present_support: &[bool],
    requested: QueueCapabilities,
) -> QueueFamilyIndices {
    let presents = |i: usize| present_support.get(i).copied().unwrap_or(false);
    let mut out = QueueFamilyIndices::default();

    if requested.intersects(QueueCapabilities::GRAPHICS | QueueCapabilities::PRESENT) {
        let mut first_graphics = None;
        let mut first_present = None;
        let mut both = None;
        for (i, family) in families.iter().enumerate() {
            let can_present = family.queue_count > 0 && presents(i);
            if can_present && first_present.is_none() {
                first_present = Some(i);
            }
            if usable(family, vk::QueueFlags::GRAPHICS) {
                if can_present {
                    both = Some(i);
                    break;
                }
                first_graphics.get_or_insert(i);
            }
        }

        let (graphics, present) = match both {
            Some(i) => {
                out.shared_graphics_present = true;
                (Some(i), Some(i))
            }
            None => (first_graphics, first_present),
        };
        if requested.contains(QueueCapabilities::GRAPHICS) {
            out.graphics = graphics.map(shared);
        }
        if requested.contains(QueueCapabilities::PRESENT) {
            out.present = present.map(shared);
        }
    }

    if requested.contains(QueueCapabilities::COMPUTE) {
        out.compute = find_dedicated(families, vk::QueueFlags::COMPUTE)
            .or_else(|| find_first(families, vk::QueueFlags::COMPUTE));
    }

    if requested.contains(QueueCapabilities::SPARSE_BINDING) {
        out.sparse_binding = find_dedicated(families, vk::QueueFlags::SPARSE_BINDING)
            .or_else(|| find_first(families, vk::QueueFlags::SPARSE_BINDING));
    }

    if requested.contains(QueueCapabilities::TRANSFER) {
        // Graphics and compute families accept transfer work whether or not
        // they advertise the flag.
        out.transfer = find_dedicated(families, vk::QueueFlags::TRANSFER)
            .or_else(|| out.compute.map(|f| shared(f.index as usize)))
            .or_else(|| out.graphics.map(|f| shared(f.index as usize)))
            .or_else(|| {
                families
                    .iter()
                    .position(|f| {
                        f.queue_count > 0
                            && f.queue_flags.intersects(
                                vk::QueueFlags::TRANSFER
                                    | vk::QueueFlags::GRAPHICS
                                    | vk::QueueFlags::COMPUTE,
                            )
                    })
                    .map(shared)
            });
    }

    out
}

#[cfg(test)]
pub(crate) fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
    vk::QueueFamilyProperties {
        queue_flags: flags,
        queue_count: 1,
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const G: vk::QueueFlags = vk::QueueFlags::GRAPHICS;
    const C: vk::QueueFlags = vk::QueueFlags::COMPUTE;
    const T: vk::QueueFlags = vk::QueueFlags::TRANSFER;
    const S: vk::QueueFlags = vk::QueueFlags::SPARSE_BINDING;

    fn all() -> QueueCapabilities {
        QueueCapabilities::all()
    }

    #[test]
    fn discrete_layout_uses_dedicated_families() {
        let families = [family(G | C | T | S), family(T | S), family(C | T | S)];
        let idx = resolve_queue_families(&families, &[true, false, false], all());

        assert_eq!(idx.index(Capability::Graphics), Some(0));
        assert_eq!(idx.index(Capability::Present), Some(0));
        assert!(idx.shared_graphics_present);
        assert_eq!(idx.compute, Some(ResolvedFamily { index: 2, dedicated: true }));
        assert_eq!(idx.transfer, Some(ResolvedFamily { index: 1, dedicated: true }));
        assert_eq!(idx.sparse_binding, Some(ResolvedFamily { index: 1, dedicated: true }));
        assert_eq!(idx.distinct_families(), vec![0, 2, 1]);
    }

    #[test]
    fn single_family_device_shares_everything() {
        let families = [family(G | C | T)];
        let requested = QueueCapabilities::GRAPHICS
            | QueueCapabilities::COMPUTE
            | QueueCapabilities::TRANSFER
            | QueueCapabilities::PRESENT;
        let idx = resolve_queue_families(&families, &[true], requested);

        for cap in [Capability::Graphics, Capability::Compute, Capability::Transfer, Capability::Present] {
            assert_eq!(idx.index(cap), Some(0), "{cap:?}");
            assert!(!idx.is_dedicated(cap), "{cap:?}");
        }
        assert_eq!(idx.sparse_binding, None);
        assert!(idx.missing(requested).is_empty());
        assert_eq!(idx.distinct_families(), vec![0]);
    }

    #[test]
    fn prefers_graphics_family_that_can_present() {
        let families = [family(G | C | T), family(G | C | T)];
        let idx = resolve_queue_families(&families, &[false, true], all());
        assert_eq!(idx.index(Capability::Graphics), Some(1));
        assert_eq!(idx.index(Capability::Present), Some(1));
        assert!(idx.shared_graphics_present);
    }

    #[test]
    fn present_on_separate_family_when_no_graphics_family_presents() {
        let families = [family(G | T), family(C)];
        let requested = QueueCapabilities::GRAPHICS | QueueCapabilities::PRESENT;
        let idx = resolve_queue_families(&families, &[false, true], requested);
        assert_eq!(idx.index(Capability::Graphics), Some(0));
        assert_eq!(idx.index(Capability::Present), Some(1));
        assert!(!idx.shared_graphics_present);
    }

    #[test]
    fn transfer_falls_back_to_compute_then_graphics() {
        // compute-only family without the transfer bit
        let families = [family(G | C | T), family(C)];
        let idx = resolve_queue_families(&families, &[true, false], all());
        assert_eq!(idx.compute, Some(ResolvedFamily { index: 1, dedicated: true }));
        assert_eq!(idx.transfer, Some(ResolvedFamily { index: 1, dedicated: false }));

        let requested = QueueCapabilities::GRAPHICS | QueueCapabilities::TRANSFER;
        let idx = resolve_queue_families(&families, &[true, false], requested);
        assert_eq!(idx.compute, None);
        assert_eq!(idx.transfer, Some(ResolvedFamily { index: 0, dedicated: false }));
    }

    #[test]
    fn unresolved_capabilities_are_reported_missing() {
        let families = [family(G | C | T)];
        let idx = resolve_queue_families(&families, &[false], all());
        assert_eq!(
            idx.missing(all()),
            QueueCapabilities::PRESENT | QueueCapabilities::SPARSE_BINDING
        );
    }

    #[test]
    fn empty_families_are_skipped() {
        let mut empty = family(C);
        empty.queue_count = 0;
        let families = [family(G | C | T), empty];
        let idx = resolve_queue_families(&families, &[true, true], all());
        assert_eq!(idx.index(Capability::Compute), Some(0));
        assert!(!idx.is_dedicated(Capability::Compute));
    }

    #[test]
    fn resolution_is_sound_for_every_two_family_layout() {
        let flag_sets: Vec<vk::QueueFlags> = (0u32..16)
            .map(|bits| {
                [G, C, T, S]
                    .into_iter()
                    .enumerate()
                    .filter(|(i, _)| bits & (1 << i) != 0)
                    .fold(vk::QueueFlags::empty(), |acc, (_, f)| acc | f)
            })
            .collect();

        for &a in &flag_sets {
            for &b in &flag_sets {
                for present_bits in 0u32..4 {
                    let families = [family(a), family(b)];
                    let present = [present_bits & 1 != 0, present_bits & 2 != 0];
                    let idx = resolve_queue_families(&families, &present, all());

                    for cap in Capability::ALL {
                        let Some(resolved) = idx.get(cap) else { continue };
                        let props = &families[resolved.index as usize];
                        if resolved.dedicated {
                            assert!(!props.queue_flags.contains(G), "{cap:?} dedicated on graphics family");
                        }
                        match cap {
                            Capability::Present => assert!(present[resolved.index as usize]),
                            Capability::Transfer => assert!(props.queue_flags.intersects(G | C | T)),
                            _ => assert!(props.queue_flags.contains(cap.queue_flag().unwrap())),
                        }
                    }
                    if idx.shared_graphics_present {
                        assert_eq!(idx.graphics.map(|f| f.index), idx.present.map(|f| f.index));
                    }
                }
            }
        }
    }
}
