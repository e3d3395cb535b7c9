//! Raster-bin construction over the visible-cluster list.
//!
//! Three compute passes keyed by material bin index:
//! 1. **count** — scatter-count visible entries per bin,
//! 2. **reserve** — prefix-allocate a contiguous indirection range per bin
//!    from a shared allocator and write that bin's indirect arguments,
//! 3. **scatter** — write each entry's index into its bin's reserved range.
//!
//! Bin metadata (sort keys, shader handles, argument offsets) is built on
//! the CPU from the registered material set, so a bin exists for every
//! material whether or not any of its clusters survived culling; an empty
//! bin keeps a valid zero-sized argument slot and consumers treat it as a
//! no-op dispatch, never a missing one.

use bytemuck::{Pod, Zeroable};

use crate::material::{MaterialFlags, ShaderHandle};

/// Byte stride of one bin's argument slot in the shared argument buffer.
///
/// Each slot holds a draw-indirect record (vertex_count, instance_count,
/// first_vertex, first_instance), a dispatch-indirect record, and a meta
/// record carrying the bin's entry count. Hardware and software consumers
/// read the same slot at different offsets, so binning stays
/// policy-agnostic to the rasterization backend.
pub const BIN_ARG_STRIDE: u64 = 48;

/// Byte offset of the dispatch-indirect record inside a bin argument slot.
pub const BIN_ARG_DISPATCH_OFFSET: u64 = 16;

/// Ceiling on any one indirect dispatch dimension (the wgpu default
/// `max_compute_workgroups_per_dimension`).
pub const MAX_DISPATCH_DIM: u32 = 65_535;

/// Split an entry count into an (x, y) workgroup grid with both
/// dimensions within [`MAX_DISPATCH_DIM`]. Rows are full except the
/// last, so a kernel recovers its entry as `y * MAX_DISPATCH_DIM + x`
/// and bounds-checks against the recorded entry count. Mirrors the
/// reserve kernel.
pub fn dispatch_grid(entry_count: u32) -> (u32, u32) {
    (
        entry_count.min(MAX_DISPATCH_DIM),
        entry_count.div_ceil(MAX_DISPATCH_DIM),
    )
}

/// One bin's argument slot (48 bytes). Written by the reserve kernel.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable, Default)]
pub struct BinArgsGpu {
    /// Draw-indirect record for the hardware path.
    pub draw: [u32; 4],
    /// Dispatch-indirect record (x, y, z) plus the bin's start offset in
    /// the indirection table.
    pub dispatch: [u32; 4],
    /// x = entry count (the dispatch grid may over-cover it); y..w unused.
    pub meta: [u32; 4],
}

/// Metadata for one raster bin, built once per invocation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RasterBin {
    /// Material descriptor shared by every entry in the bin.
    pub flags: MaterialFlags,
    /// Bin index; also the slot index in the argument buffer.
    pub bin_index: u32,
    /// Byte offset of this bin's argument slot.
    pub arg_offset: u64,
    /// Start of this bin's range in the indirection table. Written by the
    /// reserve kernel; u32::MAX until the GPU has run.
    pub indirection_offset: u32,
    /// Shader handle resolved for the chosen backend.
    pub shader: ShaderHandle,
    /// Ordering key; see [`sort_key`].
    pub sort_key: u64,
}

/// Sort key for a bin.
///
/// Depth-test/discard-capable bins (masked, displaced) sort last: they pay
/// per-pixel overdraw cost that is cheapest after opaque geometry has
/// filled the depth buffer. Within each half, bins with identical
/// programmable state sort adjacently to minimize pipeline switches, with
/// the bin index as the tiebreaker so the order is total.
pub fn sort_key(flags: MaterialFlags, shader: ShaderHandle, bin_index: u32) -> u64 {
    let discard_class: u64 = if flags.needs_pixel_depth_resolve() { 1 } else { 0 };
    (discard_class << 62)
        | ((flags.permutation_index() as u64) << 54)
        | ((shader.0 as u64) << 22)
        | (bin_index as u64 & 0x3F_FFFF)
}

/// Build bin metadata for the registered material set.
///
/// Deterministic for a given material list: re-running it (and re-running
/// the GPU passes on an unchanged visible list) yields bins with identical
/// entry totals.
pub fn build_bins(
    materials: &[(MaterialFlags, ShaderHandle)],
    sort_enabled: bool,
) -> Vec<RasterBin> {
    let mut bins: Vec<RasterBin> = materials
        .iter()
        .enumerate()
        .map(|(index, &(flags, shader))| {
            let bin_index = index as u32;
            RasterBin {
                flags,
                bin_index,
                arg_offset: bin_index as u64 * BIN_ARG_STRIDE,
                indirection_offset: u32::MAX,
                shader,
                sort_key: sort_key(flags, shader, bin_index),
            }
        })
        .collect();

    if sort_enabled {
        bins.sort_by_key(|bin| bin.sort_key);
    }

    bins
}

/// Debug-build consistency check over freshly built bin metadata: every
/// argument slot in range, no two bins sharing a slot. Compiled out of
/// release builds.
pub fn debug_validate_bins(bins: &[RasterBin], max_bins: u32) {
    if cfg!(debug_assertions) {
        let mut seen = vec![false; max_bins as usize];
        for bin in bins {
            debug_assert!(bin.bin_index < max_bins, "bin index out of range");
            debug_assert_eq!(bin.arg_offset, bin.bin_index as u64 * BIN_ARG_STRIDE);
            let slot = &mut seen[bin.bin_index as usize];
            debug_assert!(!*slot, "duplicate bin index");
            *slot = true;
        }
    }
}

/// Binning uniform data (16 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable, Default)]
pub struct BinningUniform {
    /// Number of bins (registered materials).
    pub bin_count: u32,
    /// Capacity of the visible-cluster list.
    pub max_visible: u32,
    /// Capacity of the indirection table.
    pub max_indirection: u32,
    /// Triangles per cluster, for draw-argument expansion.
    pub triangles_per_cluster: u32,
}

/// Manages the bin count/reserve/scatter compute pipelines.
pub struct RasterBinner {
    count_pipeline: wgpu::ComputePipeline,
    reserve_pipeline: wgpu::ComputePipeline,
    scatter_pipeline: wgpu::ComputePipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    uniform_buffer: wgpu::Buffer,
    bind_group: Option<wgpu::BindGroup>,

    /// Per-bin entry counters, zeroed per invocation.
    pub bin_count_buffer: wgpu::Buffer,
    /// Per-bin argument slots (one [`BinArgsGpu`] each).
    pub bin_args_buffer: wgpu::Buffer,
    /// Indirection table: visible-cluster indices grouped by bin.
    pub indirection_buffer: wgpu::Buffer,
    /// Shared range allocator (single atomic u32).
    pub allocator_buffer: wgpu::Buffer,

    max_bins: u32,
}

impl RasterBinner {
    /// Create the binning pipelines and bin-local buffers.
    pub fn new(device: &wgpu::Device, max_bins: u32, max_indirection: u32) -> Self {
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Raster Binning Shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("shaders/binning.wgsl").into()),
        });

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Raster Binning Bind Group Layout"),
            entries: &[
                // Binning uniform
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                // Visible clusters (read)
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: true },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                // Queue state (read)
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: true },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                // Materials (read) - maps cluster material id to bin index
                wgpu::BindGroupLayoutEntry {
                    binding: 3,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: true },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                // Per-bin counts (atomic)
                wgpu::BindGroupLayoutEntry {
                    binding: 4,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: false },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                // Bin argument slots (write)
                wgpu::BindGroupLayoutEntry {
                    binding: 5,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: false },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                // Indirection table (write)
                wgpu::BindGroupLayoutEntry {
                    binding: 6,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: false },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                // Shared allocator (atomic)
                wgpu::BindGroupLayoutEntry {
                    binding: 7,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: false },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                // Clusters (read) - resolves a visible entry's material id
                wgpu::BindGroupLayoutEntry {
                    binding: 8,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: true },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Raster Binning Pipeline Layout"),
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

        let count_pipeline = make_pipeline("Bin Count Pipeline", "bin_count");
        let reserve_pipeline = make_pipeline("Bin Reserve Pipeline", "bin_reserve");
        let scatter_pipeline = make_pipeline("Bin Scatter Pipeline", "bin_scatter");

        let uniform_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Raster Binning Uniform Buffer"),
            size: std::mem::size_of::<BinningUniform>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let bin_count_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Bin Count Buffer"),
            size: max_bins as u64 * 4,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });

        let bin_args_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Bin Args Buffer"),
            size: max_bins as u64 * BIN_ARG_STRIDE,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::INDIRECT
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let indirection_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Bin Indirection Buffer"),
            size: max_indirection as u64 * 4,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let allocator_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Bin Allocator Buffer"),
            size: 4,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        Self {
            count_pipeline,
            reserve_pipeline,
            scatter_pipeline,
            bind_group_layout,
            uniform_buffer,
            bind_group: None,
            bin_count_buffer,
            bin_args_buffer,
            indirection_buffer,
            allocator_buffer,
            max_bins,
        }
    }

    /// Create or update the bind group with the invocation's buffers.
    pub fn update_bind_group(
        &mut self,
        device: &wgpu::Device,
        visible_buffer: &wgpu::Buffer,
        queue_state_buffer: &wgpu::Buffer,
        material_buffer: &wgpu::Buffer,
        cluster_buffer: &wgpu::Buffer,
    ) {
        self.bind_group = Some(device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Raster Binning Bind Group"),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: self.uniform_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: visible_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: queue_state_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: material_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: self.bin_count_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 5,
                    resource: self.bin_args_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 6,
                    resource: self.indirection_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 7,
                    resource: self.allocator_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 8,
                    resource: cluster_buffer.as_entire_binding(),
                },
            ],
        }));
    }

    /// Update the binning uniform and zero the per-invocation state.
    pub fn prepare(
        &self,
        queue: &wgpu::Queue,
        bin_count: u32,
        max_visible: u32,
        max_indirection: u32,
        triangles_per_cluster: u32,
    ) {
        let uniform = BinningUniform {
            bin_count,
            max_visible,
            max_indirection,
            triangles_per_cluster,
        };
        queue.write_buffer(&self.uniform_buffer, 0, bytemuck::cast_slice(&[uniform]));
        queue.write_buffer(
            &self.bin_count_buffer,
            0,
            &vec![0u8; self.max_bins as usize * 4],
        );
        queue.write_buffer(&self.allocator_buffer, 0, bytemuck::cast_slice(&[0u32]));
    }

    /// Record the count → reserve → scatter sequence.
    ///
    /// The count and scatter passes are sized by the indirect arguments the
    /// cluster-cull pass wrote (one thread per visible entry); the reserve
    /// pass is sized by the CPU-known bin count.
    pub fn record(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        visible_dispatch_args: &wgpu::Buffer,
        bin_count: u32,
    ) {
        let Some(bind_group) = &self.bind_group else {
            return;
        };

        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("Bin Count Pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.count_pipeline);
            pass.set_bind_group(0, bind_group, &[]);
            pass.dispatch_workgroups_indirect(visible_dispatch_args, 0);
        }

        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("Bin Reserve Pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.reserve_pipeline);
            pass.set_bind_group(0, bind_group, &[]);
            let workgroups = (bin_count + 63) / 64;
            pass.dispatch_workgroups(workgroups.max(1), 1, 1);
        }

        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("Bin Scatter Pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.scatter_pipeline);
            pass.set_bind_group(0, bind_group, &[]);
            pass.dispatch_workgroups_indirect(visible_dispatch_args, 0);
        }
    }

    /// The shared argument buffer consumed by both rasterization backends.
    pub fn bin_args_buffer(&self) -> &wgpu::Buffer {
        &self.bin_args_buffer
    }

    /// The indirection table, bound by both rasterization backends.
    pub fn indirection_buffer(&self) -> &wgpu::Buffer {
        &self.indirection_buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::material::ShaderTarget;

    fn material_set() -> Vec<(MaterialFlags, ShaderHandle)> {
        vec![
            (MaterialFlags(0), ShaderHandle(1)),
            (MaterialFlags(MaterialFlags::MASKED), ShaderHandle(2)),
            (MaterialFlags(MaterialFlags::PIXEL_PROGRAMMABLE), ShaderHandle(3)),
            (MaterialFlags(MaterialFlags::DISPLACED), ShaderHandle(4)),
            (MaterialFlags(MaterialFlags::PIXEL_PROGRAMMABLE), ShaderHandle(3)),
        ]
    }

    #[test]
    fn test_bin_args_layout() {
        assert_eq!(std::mem::size_of::<BinArgsGpu>() as u64, BIN_ARG_STRIDE);
    }

    #[test]
    fn every_material_gets_a_bin_slot() {
        let bins = build_bins(&material_set(), false);
        assert_eq!(bins.len(), 5);
        for (i, bin) in bins.iter().enumerate() {
            assert_eq!(bin.bin_index, i as u32);
            assert_eq!(bin.arg_offset, i as u64 * BIN_ARG_STRIDE);
        }
    }

    #[test]
    fn discard_capable_bins_sort_last() {
        let bins = build_bins(&material_set(), true);
        let first_discard = bins
            .iter()
            .position(|b| b.flags.needs_pixel_depth_resolve())
            .unwrap();
        assert!(bins[first_discard..]
            .iter()
            .all(|b| b.flags.needs_pixel_depth_resolve()));
        assert!(bins[..first_discard]
            .iter()
            .all(|b| !b.flags.needs_pixel_depth_resolve()));
    }

    #[test]
    fn state_identical_bins_are_adjacent_after_sort() {
        let bins = build_bins(&material_set(), true);
        let programmable: Vec<u32> = bins
            .iter()
            .filter(|b| b.flags.0 == MaterialFlags::PIXEL_PROGRAMMABLE)
            .map(|b| b.bin_index)
            .collect();
        // Bins 2 and 4 share the same permutation and shader; they must be
        // adjacent in the sorted order.
        assert_eq!(programmable.len(), 2);
        let positions: Vec<usize> = bins
            .iter()
            .enumerate()
            .filter(|(_, b)| b.flags.0 == MaterialFlags::PIXEL_PROGRAMMABLE)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(positions[1] - positions[0], 1);
    }

    #[test]
    fn binning_is_idempotent() {
        let materials = material_set();
        let a = build_bins(&materials, true);
        let b = build_bins(&materials, true);
        assert_eq!(a, b);
    }

    #[test]
    fn unsorted_bins_keep_registration_order() {
        let bins = build_bins(&material_set(), false);
        let indices: Vec<u32> = bins.iter().map(|b| b.bin_index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn dispatch_grid_splits_past_the_dimension_limit() {
        assert_eq!(dispatch_grid(0), (0, 0));
        assert_eq!(dispatch_grid(100), (100, 1));
        assert_eq!(dispatch_grid(MAX_DISPATCH_DIM), (MAX_DISPATCH_DIM, 1));

        // A bin larger than one dispatch dimension spills into rows
        // instead of silently dropping workgroups.
        let (x, y) = dispatch_grid(200_000);
        assert_eq!((x, y), (MAX_DISPATCH_DIM, 4));
        assert!(u64::from(x) * u64::from(y) >= 200_000);

        // Largest realistic bin (every visible entry at default limits).
        let (x, y) = dispatch_grid(1 << 21);
        assert!(x <= MAX_DISPATCH_DIM && y <= MAX_DISPATCH_DIM);
        assert!(u64::from(x) * u64::from(y) >= 1 << 21);
    }

    #[test]
    fn built_bins_pass_validation() {
        let bins = build_bins(&material_set(), true);
        debug_validate_bins(&bins, bins.len() as u32);
    }

    #[test]
    fn shader_table_resolution_feeds_bins() {
        use crate::material::ShaderTable;
        let mut table = ShaderTable::new();
        let flags = MaterialFlags(MaterialFlags::MASKED);
        table.register(flags, ShaderTarget::Software, ShaderHandle(9));
        let materials = vec![(flags, table.lookup(flags, ShaderTarget::Software))];
        let bins = build_bins(&materials, false);
        assert_eq!(bins[0].shader, ShaderHandle(9));
    }
}
