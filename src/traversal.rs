//! Breadth-first traversal of the LOD hierarchy.
//!
//! The traverser runs as a chain of indirectly-dispatched node levels:
//! level N consumes the candidate nodes level N-1 expanded, tests each
//! against frustum, depth pyramid and projected LOD error, and either
//! expands children into level N+1 or pushes reached leaf clusters into
//! the cluster-candidate queue. A final cluster-cull step filters the
//! cluster candidates the same way and appends `VisibleCluster` entries.
//!
//! The persistent mode runs the identical logic in a single long-running
//! dispatch that drains a shared counter with workgroup-sized batches.
//! It is a scheduling policy only: the visible set it produces is the
//! same, and nothing downstream can tell the two modes apart.

use bytemuck::{Pod, Zeroable};

/// Scheduling policy for hierarchy traversal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TraversalMode {
    /// One indirect dispatch per node level.
    #[default]
    Levels,
    /// Single persistent dispatch draining a shared counter.
    Persistent,
}

/// Traversal state machine; one step per GPU dispatch in `Levels` mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraversalState {
    /// Nothing dispatched yet.
    Init,
    /// Testing candidate nodes at one hierarchy level.
    NodeLevel(u32),
    /// Filtering the accumulated cluster candidates.
    ClusterCull,
    /// Traversal finished for this pass.
    Done,
}

impl TraversalState {
    /// Advance to the next state for a hierarchy `max_levels` deep.
    pub fn next(self, max_levels: u32) -> Self {
        match self {
            TraversalState::Init => {
                if max_levels == 0 {
                    TraversalState::ClusterCull
                } else {
                    TraversalState::NodeLevel(0)
                }
            }
            TraversalState::NodeLevel(level) => {
                if level + 1 < max_levels {
                    TraversalState::NodeLevel(level + 1)
                } else {
                    TraversalState::ClusterCull
                }
            }
            TraversalState::ClusterCull => TraversalState::Done,
            TraversalState::Done => TraversalState::Done,
        }
    }
}

/// Byte stride of one per-level slot in the traversal uniform buffer.
/// Matches wgpu's minimum dynamic uniform offset alignment.
pub const UNIFORM_STRIDE: u64 = 256;

/// Byte stride of one record in the dispatch argument chain
/// (x, y, z, raw item count).
///
/// Slot layout: one slot per node level, then the main-pass cluster-cull
/// slot at `max_levels`, then the post-pass (occluded list) slot at
/// `max_levels + 1`.
pub const LEVEL_ARG_STRIDE: u64 = 16;

/// Number of cluster-cull slots appended after the node-level slots.
pub const CLUSTER_ARG_SLOTS: u64 = 2;

/// Traversal uniform data, one slot per node level plus one for the
/// cluster-cull step (48 bytes used of each 256-byte slot).
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable, Default)]
pub struct TraversalUniform {
    /// Current node level; `max_levels` in the cluster-cull slot.
    pub level: u32,
    /// Hierarchy depth.
    pub max_levels: u32,
    /// 0 = main pass, 1 = post pass.
    pub pass_index: u32,
    /// Nonzero when a valid previous-frame HZB exists.
    pub hzb_valid: u32,
    /// Capacity of the candidate node arena (per level).
    pub max_nodes: u32,
    /// Capacity of the candidate cluster arena.
    pub max_clusters: u32,
    /// Capacity of the visible-cluster list.
    pub max_visible: u32,
    /// Capacity of the streaming-request list.
    pub max_streaming_requests: u32,
    /// LOD error threshold in pixels.
    pub error_threshold: f32,
    /// Number of views.
    pub view_count: u32,
    /// Padding.
    pub _pad: [u32; 2],
}

/// The dispatch sequence for one pass, used for submission and testable
/// without a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraversalStep {
    /// Indirect node-level dispatch reading the argument chain at a level.
    NodeLevel {
        /// Hierarchy level.
        level: u32,
    },
    /// Indirect cluster-cull dispatch.
    ClusterCull,
    /// One fixed-size persistent dispatch covering the whole walk.
    Persistent {
        /// Number of persistent workgroups.
        workgroups: u32,
    },
}

/// Build the dispatch plan for a pass.
pub fn plan_steps(mode: TraversalMode, max_levels: u32, persistent_workgroups: u32) -> Vec<TraversalStep> {
    match mode {
        TraversalMode::Levels => {
            let mut steps = Vec::with_capacity(max_levels as usize + 1);
            let mut state = TraversalState::Init.next(max_levels);
            loop {
                match state {
                    TraversalState::NodeLevel(level) => steps.push(TraversalStep::NodeLevel { level }),
                    TraversalState::ClusterCull => steps.push(TraversalStep::ClusterCull),
                    TraversalState::Done => break,
                    TraversalState::Init => unreachable!(),
                }
                state = state.next(max_levels);
            }
            steps
        }
        TraversalMode::Persistent => vec![TraversalStep::Persistent {
            workgroups: persistent_workgroups.max(1),
        }],
    }
}

/// Buffers the traverser binds; all owned by the current invocation
/// except the read-only scene data.
pub struct TraversalBindings<'a> {
    /// Packed view buffer.
    pub views: &'a wgpu::Buffer,
    /// External instance records.
    pub instances: &'a wgpu::Buffer,
    /// External hierarchy topology.
    pub nodes: &'a wgpu::Buffer,
    /// External leaf cluster records.
    pub clusters: &'a wgpu::Buffer,
    /// Queue state block.
    pub queue_state: &'a wgpu::Buffer,
    /// Candidate node arena (ping/pong pair as one buffer pair).
    pub node_candidates: [&'a wgpu::Buffer; 2],
    /// Candidate cluster arena.
    pub cluster_candidates: &'a wgpu::Buffer,
    /// Visible-cluster output.
    pub visible: &'a wgpu::Buffer,
    /// Occluded list re-tested by the post pass.
    pub occluded: &'a wgpu::Buffer,
    /// Per-level dispatch argument chain.
    pub level_args: &'a wgpu::Buffer,
    /// Dispatch args sized by the visible count, consumed by binning.
    pub visible_args: &'a wgpu::Buffer,
    /// Streaming-request output.
    pub streaming_requests: &'a wgpu::Buffer,
    /// Previous/current depth pyramid.
    pub hzb_view: &'a wgpu::TextureView,
    /// Pyramid sampler.
    pub hzb_sampler: &'a wgpu::Sampler,
}

/// Manages the node-cull, cluster-cull and persistent traversal pipelines.
pub struct HierarchyTraverser {
    node_pipeline: wgpu::ComputePipeline,
    cluster_pipeline: wgpu::ComputePipeline,
    persistent_pipeline: wgpu::ComputePipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    uniform_buffer: wgpu::Buffer,
    /// One bind group per node-buffer parity (level N reads A writes B,
    /// level N+1 reads B writes A).
    bind_groups: [Option<wgpu::BindGroup>; 2],
    max_levels: u32,
}

impl HierarchyTraverser {
    /// Create the traversal pipelines.
    pub fn new(device: &wgpu::Device, max_levels: u32) -> Self {
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Hierarchy Traversal Shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("shaders/traversal.wgsl").into()),
        });

        let storage_rw = |binding: u32| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only: false },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };
        let storage_ro = |binding: u32| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only: true },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Hierarchy Traversal Bind Group Layout"),
            entries: &[
                // Per-level uniform (dynamic offset, one slot per level)
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: true,
                        min_binding_size: None,
                    },
                    count: None,
                },
                storage_ro(1),  // views
                storage_ro(2),  // instances
                storage_ro(3),  // hierarchy nodes
                storage_ro(4),  // clusters
                storage_rw(5),  // queue state
                storage_ro(6),  // candidate nodes (read side)
                storage_rw(7),  // candidate nodes (write side)
                storage_rw(8),  // candidate clusters
                storage_rw(9),  // visible clusters
                storage_rw(10), // occluded list
                storage_rw(11), // level dispatch arg chain
                storage_rw(12), // visible dispatch args
                storage_rw(13), // streaming requests
                // Depth pyramid
                wgpu::BindGroupLayoutEntry {
                    binding: 14,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: false },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 15,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::NonFiltering),
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Hierarchy Traversal Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let make_pipeline = |label: &str, entry: &str| {
            device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(label),
                layout: Some(&pipeline_layout),
                module: &shader,
                entry_point: Some(entry),
                compilation_options: Default::default(),
                cache: None,
            })
        };

        let node_pipeline = make_pipeline("Node Cull Pipeline", "node_cull");
        let cluster_pipeline = make_pipeline("Cluster Cull Pipeline", "cluster_cull");
        let persistent_pipeline = make_pipeline("Persistent Cull Pipeline", "persistent_cull");

        // One 256-byte slot per node level, one for cluster cull.
        let uniform_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Hierarchy Traversal Uniform Buffer"),
            size: (max_levels as u64 + 1) * UNIFORM_STRIDE,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        Self {
            node_pipeline,
            cluster_pipeline,
            persistent_pipeline,
            bind_group_layout,
            uniform_buffer,
            bind_groups: [None, None],
            max_levels,
        }
    }

    /// Create or update both parity bind groups.
    pub fn update_bind_groups(&mut self, device: &wgpu::Device, bindings: &TraversalBindings) {
        for parity in 0..2 {
            let read_side = bindings.node_candidates[parity];
            let write_side = bindings.node_candidates[parity ^ 1];
            self.bind_groups[parity] = Some(device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("Hierarchy Traversal Bind Group"),
                layout: &self.bind_group_layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                            buffer: &self.uniform_buffer,
                            offset: 0,
                            size: wgpu::BufferSize::new(std::mem::size_of::<TraversalUniform>() as u64),
                        }),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: bindings.views.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: bindings.instances.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 3,
                        resource: bindings.nodes.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 4,
                        resource: bindings.clusters.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 5,
                        resource: bindings.queue_state.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 6,
                        resource: read_side.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 7,
                        resource: write_side.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 8,
                        resource: bindings.cluster_candidates.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 9,
                        resource: bindings.visible.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 10,
                        resource: bindings.occluded.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 11,
                        resource: bindings.level_args.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 12,
                        resource: bindings.visible_args.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 13,
                        resource: bindings.streaming_requests.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 14,
                        resource: wgpu::BindingResource::TextureView(bindings.hzb_view),
                    },
                    wgpu::BindGroupEntry {
                        binding: 15,
                        resource: wgpu::BindingResource::Sampler(bindings.hzb_sampler),
                    },
                ],
            }));
        }
    }

    /// Upload one uniform slot per step before encoding.
    pub fn update_uniforms(&self, queue: &wgpu::Queue, base: TraversalUniform) {
        let mut staged = vec![0u8; (self.max_levels as usize + 1) * UNIFORM_STRIDE as usize];
        for level in 0..=self.max_levels {
            let uniform = TraversalUniform {
                level,
                ..base
            };
            let offset = level as usize * UNIFORM_STRIDE as usize;
            staged[offset..offset + std::mem::size_of::<TraversalUniform>()]
                .copy_from_slice(bytemuck::bytes_of(&uniform));
        }
        queue.write_buffer(&self.uniform_buffer, 0, &staged);
    }

    /// Record all traversal dispatches for one pass.
    ///
    /// Level N's dispatch size comes from the argument chain written by
    /// level N-1 (level 0's by the instance culler); the kernels clamp the
    /// written dimensions to the configured maxima, so no step here
    /// assumes a fixed dispatch size.
    /// `pass_index` selects the cluster-cull argument slot: the main
    /// pass drains the candidate list, the post pass the occluded list.
    pub fn record(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        level_args: &wgpu::Buffer,
        steps: &[TraversalStep],
        pass_index: u32,
    ) {
        for step in steps {
            match *step {
                TraversalStep::NodeLevel { level } => {
                    let Some(bind_group) = &self.bind_groups[(level & 1) as usize] else {
                        return;
                    };
                    let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                        label: Some("Node Cull Pass"),
                        timestamp_writes: None,
                    });
                    pass.set_pipeline(&self.node_pipeline);
                    pass.set_bind_group(0, bind_group, &[(level as u64 * UNIFORM_STRIDE) as u32]);
                    pass.dispatch_workgroups_indirect(level_args, level as u64 * LEVEL_ARG_STRIDE);
                }
                TraversalStep::ClusterCull => {
                    let Some(bind_group) = &self.bind_groups[0] else {
                        return;
                    };
                    let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                        label: Some("Cluster Cull Pass"),
                        timestamp_writes: None,
                    });
                    pass.set_pipeline(&self.cluster_pipeline);
                    pass.set_bind_group(
                        0,
                        bind_group,
                        &[(self.max_levels as u64 * UNIFORM_STRIDE) as u32],
                    );
                    pass.dispatch_workgroups_indirect(
                        level_args,
                        (self.max_levels + pass_index) as u64 * LEVEL_ARG_STRIDE,
                    );
                }
                TraversalStep::Persistent { workgroups } => {
                    // Parity 1 so the writable node binding is the
                    // buffer the instance culler seeded; the persistent
                    // kernel drains and refills it as one ring.
                    let Some(bind_group) = &self.bind_groups[1] else {
                        return;
                    };
                    let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                        label: Some("Persistent Cull Pass"),
                        timestamp_writes: None,
                    });
                    pass.set_pipeline(&self.persistent_pipeline);
                    pass.set_bind_group(0, bind_group, &[0]);
                    pass.dispatch_workgroups(workgroups, 1, 1);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_fits_one_slot() {
        assert!(std::mem::size_of::<TraversalUniform>() as u64 <= UNIFORM_STRIDE);
        assert_eq!(std::mem::size_of::<TraversalUniform>(), 48);
    }

    #[test]
    fn state_machine_walks_all_levels_once() {
        let mut state = TraversalState::Init;
        let mut visited = Vec::new();
        loop {
            state = state.next(3);
            if state == TraversalState::Done {
                break;
            }
            visited.push(state);
        }
        assert_eq!(
            visited,
            vec![
                TraversalState::NodeLevel(0),
                TraversalState::NodeLevel(1),
                TraversalState::NodeLevel(2),
                TraversalState::ClusterCull,
            ]
        );
    }

    #[test]
    fn zero_level_hierarchy_goes_straight_to_cluster_cull() {
        assert_eq!(TraversalState::Init.next(0), TraversalState::ClusterCull);
    }

    #[test]
    fn done_is_terminal() {
        assert_eq!(TraversalState::Done.next(5), TraversalState::Done);
    }

    #[test]
    fn level_plan_has_one_step_per_level_plus_cluster_cull() {
        let steps = plan_steps(TraversalMode::Levels, 4, 0);
        assert_eq!(steps.len(), 5);
        assert_eq!(steps[0], TraversalStep::NodeLevel { level: 0 });
        assert_eq!(steps[4], TraversalStep::ClusterCull);
    }

    #[test]
    fn persistent_plan_is_a_single_dispatch() {
        let steps = plan_steps(TraversalMode::Persistent, 4, 256);
        assert_eq!(steps, vec![TraversalStep::Persistent { workgroups: 256 }]);
        // Zero workgroups would deadlock the drain loop; clamp to one.
        assert_eq!(
            plan_steps(TraversalMode::Persistent, 4, 0),
            vec![TraversalStep::Persistent { workgroups: 1 }]
        );
    }
}
