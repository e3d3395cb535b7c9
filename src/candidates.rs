//! Candidate store: arena buffers of hierarchy nodes and clusters
//! awaiting a culling test.
//!
//! Slots are handed out through the queue counters and live for one
//! invocation. A candidate is consumed by exactly one traversal step per
//! pass; the only way an item crosses from the main pass to the post pass
//! is through the explicit occluded list.

use bytemuck::{Pod, Zeroable};

/// Culling state flags carried by candidates and visible clusters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CullFlags(pub u32);

impl CullFlags {
    /// Candidate came from the explicit cluster list, not traversal.
    pub const EXPLICIT_LIST: u32 = 1 << 0;
    /// Candidate was occluded in the main pass and re-queued.
    pub const POST_PASS: u32 = 1 << 1;
    /// Instance is uncached / first frame; skip the HZB test.
    pub const NO_HZB_TEST: u32 = 1 << 2;
}

/// A candidate hierarchy node awaiting a node-level test (16 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable, Default)]
pub struct CandidateNodeGpu {
    /// Node index into the external LOD-hierarchy topology.
    pub node_index: u32,
    /// Instance this candidate belongs to.
    pub instance_id: u32,
    /// View index (low 24 bits) and cull flags (high 8 bits).
    pub view_flags: u32,
    /// Transform-assembly index for deformed geometry.
    pub assembly_index: u32,
}

/// A candidate cluster awaiting the cluster-cull step (16 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable, Default)]
pub struct CandidateClusterGpu {
    /// Cluster index within the external page data.
    pub cluster_index: u32,
    /// Instance this candidate belongs to.
    pub instance_id: u32,
    /// View index (low 24 bits) and cull flags (high 8 bits).
    pub view_flags: u32,
    /// Transform-assembly index for deformed geometry.
    pub assembly_index: u32,
}

/// A visible cluster emitted by culling (16 bytes).
///
/// Append-only per pass; the total is bounded by
/// [`crate::resources::ResourceLimits::max_visible`] and excess entries
/// are dropped and counted, never written out of bounds.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable, Default)]
pub struct VisibleClusterGpu {
    /// Instance the cluster belongs to.
    pub instance_id: u32,
    /// Cluster index within the external page data.
    pub cluster_id: u32,
    /// View index (low 24 bits) and cull flags (high 8 bits).
    pub view_flags: u32,
    /// LOD/assembly index chosen during traversal.
    pub assembly_index: u32,
}

impl VisibleClusterGpu {
    /// Size in bytes, asserted by tests.
    pub const SIZE: usize = 16;
}

/// Pack a view index and cull flags into the shared `view_flags` field.
#[inline]
pub const fn pack_view_flags(view_index: u32, flags: u32) -> u32 {
    (view_index & 0x00FF_FFFF) | (flags << 24)
}

/// Unpack the view index.
#[inline]
pub const fn unpack_view(view_flags: u32) -> u32 {
    view_flags & 0x00FF_FFFF
}

/// Unpack the cull flags.
#[inline]
pub const fn unpack_flags(view_flags: u32) -> u32 {
    view_flags >> 24
}

/// Expand host-named cluster overrides into candidate records, one per
/// view, flagged so the cluster-cull step keeps its LOD test off.
///
/// Returns the records and how many were dropped to stay inside the
/// cluster arena.
pub fn build_override_candidates(
    overrides: &[crate::scene::ClusterOverride],
    view_count: u32,
    max_clusters: u32,
) -> (Vec<CandidateClusterGpu>, u32) {
    let total = overrides.len() as u64 * view_count as u64;
    let kept = total.min(max_clusters as u64) as usize;
    let mut candidates = Vec::with_capacity(kept);
    for view_index in 0..view_count {
        for entry in overrides {
            if candidates.len() == kept {
                return (candidates, (total - kept as u64) as u32);
            }
            candidates.push(CandidateClusterGpu {
                cluster_index: entry.cluster_id,
                instance_id: entry.instance_id,
                view_flags: pack_view_flags(view_index, CullFlags::EXPLICIT_LIST),
                assembly_index: 0,
            });
        }
    }
    (candidates, (total - kept as u64) as u32)
}

/// Arena buffers for candidates, the visible list, and the occluded list.
///
/// All buffers are exclusively owned by the current invocation and reset
/// at the start of each use; only the external hierarchy data is shared
/// across frames.
pub struct CandidateStore {
    /// Candidate node arena. Two level-buffers are alternated so one
    /// traversal step reads level N while appending level N+1.
    pub node_buffers: [wgpu::Buffer; 2],
    /// Candidate cluster arena.
    pub cluster_buffer: wgpu::Buffer,
    /// Visible-cluster output list.
    pub visible_buffer: wgpu::Buffer,
    /// Occlusion-only failures, re-tested by the post pass.
    pub occluded_buffer: wgpu::Buffer,
    /// Maximum candidate nodes per level.
    pub max_nodes: u32,
    /// Maximum candidate clusters.
    pub max_clusters: u32,
    /// Maximum visible clusters.
    pub max_visible: u32,
}

impl CandidateStore {
    /// Allocate the candidate arenas.
    pub fn new(device: &wgpu::Device, max_nodes: u32, max_clusters: u32, max_visible: u32) -> Self {
        let node_size = std::mem::size_of::<CandidateNodeGpu>() as u64;
        let cluster_size = std::mem::size_of::<CandidateClusterGpu>() as u64;
        let visible_size = VisibleClusterGpu::SIZE as u64;

        let make_node_buffer = |label: &str| {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size: max_nodes as u64 * node_size,
                usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            })
        };

        let node_buffers = [
            make_node_buffer("Candidate Node Buffer A"),
            make_node_buffer("Candidate Node Buffer B"),
        ];

        let cluster_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Candidate Cluster Buffer"),
            size: max_clusters as u64 * cluster_size,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let visible_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Visible Cluster Buffer"),
            size: max_visible as u64 * visible_size,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let occluded_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Occluded Candidate Buffer"),
            size: max_clusters as u64 * cluster_size,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        Self {
            node_buffers,
            cluster_buffer,
            visible_buffer,
            occluded_buffer,
            max_nodes,
            max_clusters,
            max_visible,
        }
    }

    /// Node buffer read by traversal level `level`.
    pub fn node_read_buffer(&self, level: u32) -> &wgpu::Buffer {
        &self.node_buffers[(level & 1) as usize]
    }

    /// Node buffer written with children expanded at level `level`.
    pub fn node_write_buffer(&self, level: u32) -> &wgpu::Buffer {
        &self.node_buffers[((level + 1) & 1) as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::ClusterOverride;

    #[test]
    fn test_candidate_sizes() {
        assert_eq!(std::mem::size_of::<CandidateNodeGpu>(), 16);
        assert_eq!(std::mem::size_of::<CandidateClusterGpu>(), 16);
        assert_eq!(std::mem::size_of::<VisibleClusterGpu>(), VisibleClusterGpu::SIZE);
    }

    #[test]
    fn test_view_flags_packing() {
        let packed = pack_view_flags(1234, CullFlags::POST_PASS | CullFlags::EXPLICIT_LIST);
        assert_eq!(unpack_view(packed), 1234);
        assert_eq!(
            unpack_flags(packed),
            CullFlags::POST_PASS | CullFlags::EXPLICIT_LIST
        );
    }

    #[test]
    fn view_index_saturates_at_24_bits() {
        let packed = pack_view_flags(0x0123_4567, 0);
        assert_eq!(unpack_view(packed), 0x0023_4567);
    }

    #[test]
    fn override_candidates_fan_out_per_view_with_explicit_flag() {
        let overrides = [
            ClusterOverride {
                cluster_id: 17,
                instance_id: 3,
            },
            ClusterOverride {
                cluster_id: 42,
                instance_id: 3,
            },
        ];
        let (candidates, dropped) = build_override_candidates(&overrides, 2, 1 << 10);

        assert_eq!(dropped, 0);
        assert_eq!(candidates.len(), 4);
        // Every record carries the explicit-list flag and its view.
        assert_eq!(candidates[0].cluster_index, 17);
        assert_eq!(candidates[0].instance_id, 3);
        assert_eq!(unpack_view(candidates[0].view_flags), 0);
        assert_eq!(unpack_flags(candidates[0].view_flags), CullFlags::EXPLICIT_LIST);
        assert_eq!(candidates[3].cluster_index, 42);
        assert_eq!(unpack_view(candidates[3].view_flags), 1);
    }

    #[test]
    fn override_candidates_clamp_to_the_cluster_arena() {
        let overrides: Vec<ClusterOverride> = (0..10)
            .map(|id| ClusterOverride {
                cluster_id: id,
                instance_id: 0,
            })
            .collect();
        let (candidates, dropped) = build_override_candidates(&overrides, 3, 8);

        assert_eq!(candidates.len(), 8);
        assert_eq!(dropped, 22);
    }
}
