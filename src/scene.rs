//! External interfaces: read-only LOD-hierarchy data and the instance
//! list consumed from the streaming service, plus the streaming-request
//! records handed back to it.
//!
//! The hierarchy and page storage belong to the external service; this
//! module only fixes the GPU layouts the culling kernels address them by.

use bytemuck::{Pod, Zeroable};

/// GPU topology record for one LOD-hierarchy node (48 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable, Default)]
pub struct HierarchyNodeGpu {
    /// Bounding sphere: xyz = center (local space), w = radius.
    pub bounds: [f32; 4],
    /// First child node index (traversed when the node is too coarse).
    pub child_offset: u32,
    /// Number of child nodes; zero marks a leaf node.
    pub child_count: u32,
    /// First leaf cluster index reached through this node.
    pub cluster_offset: u32,
    /// Number of leaf clusters (consumed when the node is a leaf).
    pub cluster_count: u32,
    /// Maximum screen-error bound of the node's parent.
    pub max_parent_error: f32,
    /// This node's own error bound.
    pub node_error: f32,
    /// Residency flags maintained by the streaming service.
    pub flags: u32,
    /// Padding.
    pub _pad: u32,
}

impl HierarchyNodeGpu {
    /// Size in bytes, asserted by tests.
    pub const SIZE: usize = 48;
    /// Residency bit: node's cluster pages are GPU resident.
    pub const FLAG_RESIDENT: u32 = 1 << 0;
}

/// GPU record for one leaf cluster (48 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable, Default)]
pub struct ClusterGpu {
    /// Bounding sphere: xyz = center (local space), w = radius.
    pub bounds: [f32; 4],
    /// This cluster's LOD error bound.
    pub lod_error: f32,
    /// Error bound of the coarser parent representation.
    pub parent_error: f32,
    /// Material id, resolved to a bin by the binner.
    pub material_id: u32,
    /// Number of triangles.
    pub triangle_count: u32,
    /// Page the cluster's geometry lives in.
    pub page_index: u32,
    /// Residency / streaming flags.
    pub flags: u32,
    /// First vertex in the page's position stream.
    pub vertex_offset: u32,
    /// First index in the page's index stream.
    pub index_offset: u32,
}

impl ClusterGpu {
    /// Size in bytes, asserted by tests.
    pub const SIZE: usize = 48;
    /// Residency bit: geometry page is GPU resident at this LOD.
    pub const FLAG_RESIDENT: u32 = 1 << 0;
}

/// GPU record for one scene instance (96 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct InstanceGpu {
    /// Local-to-world transform.
    pub transform: [[f32; 4]; 4],
    /// Bounding sphere: xyz = center (local space), w = radius.
    pub bounds: [f32; 4],
    /// Root node of the instance's LOD hierarchy.
    pub root_node: u32,
    /// Instance flags (mirrors candidate [`crate::candidates::CullFlags`]).
    pub flags: u32,
    /// Maximum draw distance; 0 disables distance culling for the instance.
    pub max_draw_distance: f32,
    /// Transform-assembly index for skinned/spline instances.
    pub assembly_index: u32,
}

impl InstanceGpu {
    /// Size in bytes, asserted by tests.
    pub const SIZE: usize = 96;
}

impl Default for InstanceGpu {
    fn default() -> Self {
        Self {
            transform: [
                [1.0, 0.0, 0.0, 0.0],
                [0.0, 1.0, 0.0, 0.0],
                [0.0, 0.0, 1.0, 0.0],
                [0.0, 0.0, 0.0, 1.0],
            ],
            bounds: [0.0, 0.0, 0.0, 1.0],
            root_node: 0,
            flags: 0,
            max_draw_distance: 0.0,
            assembly_index: 0,
        }
    }
}

/// Streaming request emitted when a cluster was wanted at a finer LOD
/// than is resident (16 bytes). Handed back to the LOD service.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable, Default)]
pub struct StreamingRequestGpu {
    /// Page that should be made resident.
    pub page_index: u32,
    /// Cluster that triggered the request.
    pub cluster_id: u32,
    /// Requested LOD error bound, as f32 bits (for atomic min on GPU).
    pub wanted_error_bits: u32,
    /// Priority accumulator (views wanting the page this frame).
    pub priority: u32,
}

/// A host-named cluster for explicit-list culling: the hierarchy walk
/// is skipped and these clusters seed the cluster queue directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterOverride {
    /// Cluster index within the external page data.
    pub cluster_id: u32,
    /// Instance the cluster is drawn under.
    pub instance_id: u32,
}

/// The external buffers one invocation culls against.
///
/// All of these are read-only here: they are owned and updated by the
/// LOD-hierarchy/streaming service and shared across views and frames.
pub struct SceneBinding<'a> {
    /// Instance records ([`InstanceGpu`] layout).
    pub instance_buffer: &'a wgpu::Buffer,
    /// Number of instances in `instance_buffer`.
    pub instance_count: u32,
    /// Hierarchy topology ([`HierarchyNodeGpu`] layout).
    pub node_buffer: &'a wgpu::Buffer,
    /// Leaf cluster records ([`ClusterGpu`] layout).
    pub cluster_buffer: &'a wgpu::Buffer,
    /// Deepest node level in the hierarchy.
    pub max_levels: u32,
    /// Host-named clusters consumed when explicit-list culling is
    /// enabled; `None` (or empty) runs the full hierarchy traversal.
    pub cluster_overrides: Option<&'a [ClusterOverride]>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scene_record_sizes() {
        assert_eq!(std::mem::size_of::<HierarchyNodeGpu>(), HierarchyNodeGpu::SIZE);
        assert_eq!(std::mem::size_of::<ClusterGpu>(), ClusterGpu::SIZE);
        assert_eq!(std::mem::size_of::<InstanceGpu>(), InstanceGpu::SIZE);
        assert_eq!(std::mem::size_of::<StreamingRequestGpu>(), 16);
    }
}
