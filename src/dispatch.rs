//! Rasterizer dispatch: routes each raster bin to the hardware pipeline
//! or the compute software rasterizer and records the per-bin indirect
//! submissions.
//!
//! Small triangles (a few pixels) waste hardware raster throughput on
//! quad overshading, so they go to a compute rasterizer. Both backends
//! settle depth through one store in the end: the compute path packs
//! inverted depth bits and the visibility payload into a single 64-bit
//! word per pixel and resolves writes with one `atomicMax`, then a
//! fullscreen resolve pass replays the surviving words through the same
//! depth attachment the hardware bins render against. That keeps the
//! final visibility image independent of bin order and of how work was
//! split between the backends.
//!
//! The 64-bit scheme needs `SHADER_INT64` and
//! `SHADER_INT64_ATOMIC_MIN_MAX`; without them every bin routes to the
//! hardware path. Both backends read the same bin argument buffer the
//! binner filled: the hardware path consumes the draw-indirect record at
//! the front of a bin's slot, the software path the dispatch-indirect
//! record behind it.

use bytemuck::{Pod, Zeroable};

use crate::binning::{RasterBin, BIN_ARG_DISPATCH_OFFSET};
use crate::material::MaterialFlags;

/// Which rasterizer executes a bin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RasterBackend {
    /// Hardware vertex/fragment pipeline into the visibility target.
    Hardware,
    /// Compute rasterizer with a packed 64-bit depth+payload word.
    Software,
}

/// Device capabilities relevant to backend routing.
#[derive(Debug, Clone, Copy)]
pub struct RasterCaps {
    /// The device can run the compute rasterizer: 64-bit shader
    /// integers with atomic min/max, plus storage room for the
    /// per-pixel word buffer.
    pub software_raster: bool,
    /// `draw_indirect` is available for the hardware path.
    pub draw_indirect: bool,
}

impl RasterCaps {
    /// Read routing capabilities off the device.
    pub fn from_device(device: &wgpu::Device) -> Self {
        let int64_atomics = device.features().contains(
            wgpu::Features::SHADER_INT64 | wgpu::Features::SHADER_INT64_ATOMIC_MIN_MAX,
        );
        // The compute path binds one u64 of depth+payload per pixel;
        // require room for a 4k target.
        let word_bytes = 8u64 * 3840 * 2160;
        let limits = device.limits();
        Self {
            software_raster: int64_atomics
                && u64::from(limits.max_storage_buffer_binding_size) >= word_bytes,
            // Indirect draws are core wgpu.
            draw_indirect: true,
        }
    }

    /// Everything available; used by tests and as a safe default for
    /// desktop adapters.
    pub fn full() -> Self {
        Self {
            software_raster: true,
            draw_indirect: true,
        }
    }
}

/// Choose the backend for one bin.
///
/// Materials needing a per-pixel depth resolve (masked, displaced) run
/// their discard logic in a fragment shader, so they stay on hardware
/// even when software rasterization is forced.
pub fn select_backend(flags: MaterialFlags, caps: RasterCaps, force_software: bool) -> RasterBackend {
    if !caps.software_raster {
        return RasterBackend::Hardware;
    }
    if flags.needs_pixel_depth_resolve() {
        return RasterBackend::Hardware;
    }
    if force_software {
        return RasterBackend::Software;
    }
    // Default split: programmable-vertex materials keep the hardware
    // path (their deform programs are compiled as vertex shaders); the
    // common fixed-deform case goes to compute, where the GPU-side
    // per-triangle size test does the fine routing.
    if flags.contains(MaterialFlags::VERTEX_PROGRAMMABLE) {
        RasterBackend::Hardware
    } else {
        RasterBackend::Software
    }
}

/// One bin's resolved submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinSubmission {
    /// Backend the bin runs on.
    pub backend: RasterBackend,
    /// Byte offset of the record the backend consumes.
    pub arg_offset: u64,
    /// Slot index, for uniforms and debugging.
    pub bin_index: u32,
    /// Backfaces rasterize too; hardware picks the unculled pipeline
    /// variant, compute flips the winding in the kernel.
    pub two_sided: bool,
}

/// Resolve every bin to a backend and the argument record it reads.
pub fn plan_submissions(
    bins: &[RasterBin],
    caps: RasterCaps,
    force_software: bool,
) -> Vec<BinSubmission> {
    bins.iter()
        .map(|bin| {
            let backend = select_backend(bin.flags, caps, force_software);
            let arg_offset = match backend {
                RasterBackend::Hardware => bin.arg_offset,
                RasterBackend::Software => bin.arg_offset + BIN_ARG_DISPATCH_OFFSET,
            };
            BinSubmission {
                backend,
                arg_offset,
                bin_index: bin.bin_index,
                two_sided: bin.flags.contains(MaterialFlags::TWO_SIDED),
            }
        })
        .collect()
}

/// Pack a depth value and visibility payload into the per-pixel word the
/// compute rasterizer resolves with `atomicMax`. Depth is inverted so a
/// nearer fragment compares greater; equal depths tie-break on the
/// payload, so the winner never depends on write order.
pub fn pack_depth_payload(depth: f32, payload: u32) -> u64 {
    (u64::from((1.0 - depth.clamp(0.0, 1.0)).to_bits()) << 32) | u64::from(payload)
}

/// Payload half of a packed depth+payload word.
pub fn unpack_payload(word: u64) -> u32 {
    (word & 0xFFFF_FFFF) as u32
}

/// Depth half of a packed depth+payload word.
pub fn unpack_depth(word: u64) -> f32 {
    1.0 - f32::from_bits((word >> 32) as u32)
}

/// Byte stride of one bin's slot in the raster uniform buffer. Matches
/// wgpu's minimum dynamic uniform offset alignment.
pub const RASTER_UNIFORM_STRIDE: u64 = 256;

/// Rasterization uniform data, one slot per bin (dynamic offset).
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable, Default)]
pub struct RasterUniform {
    /// Render target size: x=width, y=height, z=1/width, w=1/height.
    pub screen_size: [f32; 4],
    /// Active view index.
    pub view_index: u32,
    /// Bin this slot serves; the kernels read their argument record and
    /// indirection offset through it.
    pub bin_index: u32,
    /// Triangles per cluster upper bound.
    pub triangles_per_cluster: u32,
    /// Material flag bits of the bin's materials.
    pub material_flags: u32,
}

/// Color and depth targets the rasterizers write.
pub struct RasterTargets<'a> {
    /// R32Uint visibility target (cluster id << 7 | triangle id).
    pub visibility_view: &'a wgpu::TextureView,
    /// Depth attachment shared by the hardware bins and the resolve pass.
    pub depth_view: &'a wgpu::TextureView,
    /// Per-pixel packed depth+payload words written by the compute
    /// rasterizer, one u64 per pixel.
    pub depth_payload: &'a wgpu::Buffer,
}

/// Geometry and per-frame buffers both backends read.
pub struct RasterBindings<'a> {
    /// Packed view buffer.
    pub views: &'a wgpu::Buffer,
    /// Instance records.
    pub instances: &'a wgpu::Buffer,
    /// Leaf cluster records.
    pub clusters: &'a wgpu::Buffer,
    /// Vertex positions for resident pages.
    pub positions: &'a wgpu::Buffer,
    /// Triangle indices for resident pages.
    pub indices: &'a wgpu::Buffer,
    /// Visible-cluster list produced by traversal.
    pub visible: &'a wgpu::Buffer,
    /// Per-bin indirection table filled by the binner's scatter step.
    pub indirection: &'a wgpu::Buffer,
    /// Bin argument slots; the kernels read their bin's indirection
    /// offset from here.
    pub bin_args: &'a wgpu::Buffer,
}

/// Records per-bin rasterization work for both backends.
pub struct BinDispatcher {
    hw_pipeline: wgpu::RenderPipeline,
    hw_two_sided_pipeline: wgpu::RenderPipeline,
    hw_bind_group_layout: wgpu::BindGroupLayout,
    hw_bind_group: Option<wgpu::BindGroup>,

    // The compute rasterizer and its resolve pass need 64-bit atomics;
    // absent on the device, they stay unbuilt and routing sends every
    // bin to hardware.
    sw_pipeline: Option<wgpu::ComputePipeline>,
    sw_bind_group_layout: Option<wgpu::BindGroupLayout>,
    sw_bind_group: Option<wgpu::BindGroup>,

    resolve_pipeline: Option<wgpu::RenderPipeline>,
    resolve_bind_group_layout: Option<wgpu::BindGroupLayout>,
    resolve_bind_group: Option<wgpu::BindGroup>,

    uniform_buffer: wgpu::Buffer,
    max_bins: u32,
}

impl BinDispatcher {
    /// Create both backend pipelines.
    pub fn new(
        device: &wgpu::Device,
        depth_format: wgpu::TextureFormat,
        max_bins: u32,
        caps: RasterCaps,
    ) -> Self {
        let storage_ro = |binding: u32, visibility: wgpu::ShaderStages| wgpu::BindGroupLayoutEntry {
            binding,
            visibility,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only: true },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };

        // Hardware visibility pipeline
        let hw_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("HW Raster Shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("shaders/hw_raster.wgsl").into()),
        });

        let hw_stages = wgpu::ShaderStages::VERTEX_FRAGMENT;
        let hw_bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("HW Raster Bind Group Layout"),
            entries: &[
                // Per-bin uniform (dynamic offset, one slot per bin)
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: hw_stages,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: true,
                        min_binding_size: None,
                    },
                    count: None,
                },
                storage_ro(1, hw_stages), // views
                storage_ro(2, hw_stages), // instances
                storage_ro(3, hw_stages), // clusters
                storage_ro(4, hw_stages), // positions
                storage_ro(5, hw_stages), // indices
                storage_ro(6, hw_stages), // visible clusters
                storage_ro(7, hw_stages), // bin indirection
                storage_ro(8, hw_stages), // bin argument slots
            ],
        });

        let hw_pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("HW Raster Pipeline Layout"),
            bind_group_layouts: &[&hw_bind_group_layout],
            push_constant_ranges: &[],
        });

        let make_hw_pipeline = |label: &str, cull_mode: Option<wgpu::Face>| {
            device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some(label),
                layout: Some(&hw_pipeline_layout),
                vertex: wgpu::VertexState {
                    module: &hw_shader,
                    entry_point: Some("vs_main"),
                    buffers: &[],
                    compilation_options: Default::default(),
                },
                fragment: Some(wgpu::FragmentState {
                    module: &hw_shader,
                    entry_point: Some("fs_main"),
                    targets: &[Some(wgpu::ColorTargetState {
                        format: wgpu::TextureFormat::R32Uint,
                        blend: None, // No blending for visibility IDs
                        write_mask: wgpu::ColorWrites::ALL,
                    })],
                    compilation_options: Default::default(),
                }),
                primitive: wgpu::PrimitiveState {
                    topology: wgpu::PrimitiveTopology::TriangleList,
                    strip_index_format: None,
                    front_face: wgpu::FrontFace::Ccw,
                    cull_mode,
                    polygon_mode: wgpu::PolygonMode::Fill,
                    unclipped_depth: false,
                    conservative: false,
                },
                depth_stencil: Some(wgpu::DepthStencilState {
                    format: depth_format,
                    depth_write_enabled: true,
                    depth_compare: wgpu::CompareFunction::Less,
                    stencil: wgpu::StencilState::default(),
                    bias: wgpu::DepthBiasState::default(),
                }),
                multisample: wgpu::MultisampleState::default(),
                multiview: None,
                cache: None,
            })
        };

        let hw_pipeline = make_hw_pipeline("HW Raster Pipeline", Some(wgpu::Face::Back));
        let hw_two_sided_pipeline = make_hw_pipeline("HW Raster Two-Sided Pipeline", None);

        // Software compute rasterizer and its resolve pass, built only
        // when the device carries the 64-bit atomic features.
        let (
            sw_pipeline,
            sw_bind_group_layout,
            resolve_pipeline,
            resolve_bind_group_layout,
        ) = if caps.software_raster {
            let sw_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("SW Raster Shader"),
                source: wgpu::ShaderSource::Wgsl(include_str!("shaders/sw_raster.wgsl").into()),
            });

            let compute = wgpu::ShaderStages::COMPUTE;
            let sw_bind_group_layout =
                device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                    label: Some("SW Raster Bind Group Layout"),
                    entries: &[
                        // Per-bin uniform (dynamic offset, one slot per bin)
                        wgpu::BindGroupLayoutEntry {
                            binding: 0,
                            visibility: compute,
                            ty: wgpu::BindingType::Buffer {
                                ty: wgpu::BufferBindingType::Uniform,
                                has_dynamic_offset: true,
                                min_binding_size: None,
                            },
                            count: None,
                        },
                        storage_ro(1, compute), // views
                        storage_ro(2, compute), // instances
                        storage_ro(3, compute), // clusters
                        storage_ro(4, compute), // positions
                        storage_ro(5, compute), // indices
                        storage_ro(6, compute), // visible clusters
                        storage_ro(7, compute), // bin indirection
                        // Packed depth+payload words
                        wgpu::BindGroupLayoutEntry {
                            binding: 8,
                            visibility: compute,
                            ty: wgpu::BindingType::Buffer {
                                ty: wgpu::BufferBindingType::Storage { read_only: false },
                                has_dynamic_offset: false,
                                min_binding_size: None,
                            },
                            count: None,
                        },
                        storage_ro(9, compute), // bin argument slots
                    ],
                });

            let sw_pipeline_layout =
                device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                    label: Some("SW Raster Pipeline Layout"),
                    bind_group_layouts: &[&sw_bind_group_layout],
                    push_constant_ranges: &[],
                });

            let sw_pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some("SW Raster Pipeline"),
                layout: Some(&sw_pipeline_layout),
                module: &sw_shader,
                entry_point: Some("main"),
                compilation_options: Default::default(),
                cache: None,
            });

            let resolve_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("SW Resolve Shader"),
                source: wgpu::ShaderSource::Wgsl(include_str!("shaders/sw_resolve.wgsl").into()),
            });

            let resolve_bind_group_layout =
                device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                    label: Some("SW Resolve Bind Group Layout"),
                    entries: &[
                        wgpu::BindGroupLayoutEntry {
                            binding: 0,
                            visibility: wgpu::ShaderStages::FRAGMENT,
                            ty: wgpu::BindingType::Buffer {
                                ty: wgpu::BufferBindingType::Uniform,
                                has_dynamic_offset: false,
                                min_binding_size: None,
                            },
                            count: None,
                        },
                        storage_ro(1, wgpu::ShaderStages::FRAGMENT),
                    ],
                });

            let resolve_pipeline_layout =
                device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                    label: Some("SW Resolve Pipeline Layout"),
                    bind_group_layouts: &[&resolve_bind_group_layout],
                    push_constant_ranges: &[],
                });

            let resolve_pipeline =
                device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                    label: Some("SW Resolve Pipeline"),
                    layout: Some(&resolve_pipeline_layout),
                    vertex: wgpu::VertexState {
                        module: &resolve_shader,
                        entry_point: Some("vs_main"),
                        buffers: &[],
                        compilation_options: Default::default(),
                    },
                    fragment: Some(wgpu::FragmentState {
                        module: &resolve_shader,
                        entry_point: Some("fs_main"),
                        targets: &[Some(wgpu::ColorTargetState {
                            format: wgpu::TextureFormat::R32Uint,
                            blend: None,
                            write_mask: wgpu::ColorWrites::ALL,
                        })],
                        compilation_options: Default::default(),
                    }),
                    primitive: wgpu::PrimitiveState {
                        topology: wgpu::PrimitiveTopology::TriangleList,
                        strip_index_format: None,
                        front_face: wgpu::FrontFace::Ccw,
                        cull_mode: None,
                        polygon_mode: wgpu::PolygonMode::Fill,
                        unclipped_depth: false,
                        conservative: false,
                    },
                    depth_stencil: Some(wgpu::DepthStencilState {
                        format: depth_format,
                        depth_write_enabled: true,
                        depth_compare: wgpu::CompareFunction::Less,
                        stencil: wgpu::StencilState::default(),
                        bias: wgpu::DepthBiasState::default(),
                    }),
                    multisample: wgpu::MultisampleState::default(),
                    multiview: None,
                    cache: None,
                });

            (
                Some(sw_pipeline),
                Some(sw_bind_group_layout),
                Some(resolve_pipeline),
                Some(resolve_bind_group_layout),
            )
        } else {
            (None, None, None, None)
        };

        // One 256-byte slot per bin.
        let uniform_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Raster Uniform Buffer"),
            size: max_bins.max(1) as u64 * RASTER_UNIFORM_STRIDE,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        Self {
            hw_pipeline,
            hw_two_sided_pipeline,
            hw_bind_group_layout,
            hw_bind_group: None,
            sw_pipeline,
            sw_bind_group_layout,
            sw_bind_group: None,
            resolve_pipeline,
            resolve_bind_group_layout,
            resolve_bind_group: None,
            uniform_buffer,
            max_bins,
        }
    }

    /// Create or update the backend bind groups.
    pub fn update_bind_groups(
        &mut self,
        device: &wgpu::Device,
        bindings: &RasterBindings,
        targets: &RasterTargets,
    ) {
        let uniform_buffer = &self.uniform_buffer;
        let shared = || {
            vec![
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                        buffer: uniform_buffer,
                        offset: 0,
                        size: wgpu::BufferSize::new(std::mem::size_of::<RasterUniform>() as u64),
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
                    resource: bindings.clusters.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: bindings.positions.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 5,
                    resource: bindings.indices.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 6,
                    resource: bindings.visible.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 7,
                    resource: bindings.indirection.as_entire_binding(),
                },
            ]
        };

        let mut hw_entries = shared();
        hw_entries.push(wgpu::BindGroupEntry {
            binding: 8,
            resource: bindings.bin_args.as_entire_binding(),
        });
        self.hw_bind_group = Some(device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("HW Raster Bind Group"),
            layout: &self.hw_bind_group_layout,
            entries: &hw_entries,
        }));

        if let Some(layout) = &self.sw_bind_group_layout {
            let mut sw_entries = shared();
            sw_entries.push(wgpu::BindGroupEntry {
                binding: 8,
                resource: targets.depth_payload.as_entire_binding(),
            });
            sw_entries.push(wgpu::BindGroupEntry {
                binding: 9,
                resource: bindings.bin_args.as_entire_binding(),
            });
            self.sw_bind_group = Some(device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("SW Raster Bind Group"),
                layout,
                entries: &sw_entries,
            }));
        }

        if let Some(layout) = &self.resolve_bind_group_layout {
            self.resolve_bind_group = Some(device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("SW Resolve Bind Group"),
                layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                            buffer: &self.uniform_buffer,
                            offset: 0,
                            size: wgpu::BufferSize::new(
                                std::mem::size_of::<RasterUniform>() as u64
                            ),
                        }),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: targets.depth_payload.as_entire_binding(),
                    },
                ],
            }));
        }
    }

    /// Upload one uniform slot per bin, carrying that bin's material
    /// flag bits. Slots without a bin stay zeroed.
    pub fn update_uniforms(&self, queue: &wgpu::Queue, base: RasterUniform, bins: &[RasterBin]) {
        let mut staged = vec![0u8; self.max_bins.max(1) as usize * RASTER_UNIFORM_STRIDE as usize];
        for bin in bins {
            if bin.bin_index >= self.max_bins {
                continue;
            }
            let uniform = RasterUniform {
                bin_index: bin.bin_index,
                material_flags: bin.flags.0,
                ..base
            };
            let offset = bin.bin_index as usize * RASTER_UNIFORM_STRIDE as usize;
            staged[offset..offset + std::mem::size_of::<RasterUniform>()]
                .copy_from_slice(bytemuck::bytes_of(&uniform));
        }
        queue.write_buffer(&self.uniform_buffer, 0, &staged);
    }

    /// Record every bin submission.
    ///
    /// Contiguous hardware bins share one render pass; software bins run
    /// as compute dispatches between them. Each submission reads its own
    /// record from the shared bin argument buffer, so an empty bin costs
    /// a zero-sized draw or dispatch and nothing else. When any software
    /// bin ran, a final fullscreen pass resolves the packed words into
    /// the visibility target through the shared depth attachment.
    pub fn record(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        targets: &RasterTargets,
        bin_args: &wgpu::Buffer,
        submissions: &[BinSubmission],
    ) {
        let Some(hw_bind_group) = &self.hw_bind_group else {
            return;
        };

        let mut software_ran = false;
        let mut index = 0;
        while index < submissions.len() {
            match submissions[index].backend {
                RasterBackend::Hardware => {
                    let run_start = index;
                    while index < submissions.len()
                        && submissions[index].backend == RasterBackend::Hardware
                    {
                        index += 1;
                    }

                    let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                        label: Some("HW Raster Pass"),
                        color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                            view: targets.visibility_view,
                            resolve_target: None,
                            ops: wgpu::Operations {
                                load: wgpu::LoadOp::Load,
                                store: wgpu::StoreOp::Store,
                            },
                        })],
                        depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                            view: targets.depth_view,
                            depth_ops: Some(wgpu::Operations {
                                load: wgpu::LoadOp::Load,
                                store: wgpu::StoreOp::Store,
                            }),
                            stencil_ops: None,
                        }),
                        timestamp_writes: None,
                        occlusion_query_set: None,
                    });
                    for submission in &submissions[run_start..index] {
                        if submission.two_sided {
                            pass.set_pipeline(&self.hw_two_sided_pipeline);
                        } else {
                            pass.set_pipeline(&self.hw_pipeline);
                        }
                        let offset = (submission.bin_index as u64 * RASTER_UNIFORM_STRIDE) as u32;
                        pass.set_bind_group(0, hw_bind_group, &[offset]);
                        pass.draw_indirect(bin_args, submission.arg_offset);
                    }
                }
                RasterBackend::Software => {
                    let (Some(sw_pipeline), Some(sw_bind_group)) =
                        (&self.sw_pipeline, &self.sw_bind_group)
                    else {
                        index += 1;
                        continue;
                    };
                    software_ran = true;
                    let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                        label: Some("SW Raster Pass"),
                        timestamp_writes: None,
                    });
                    pass.set_pipeline(sw_pipeline);
                    while index < submissions.len()
                        && submissions[index].backend == RasterBackend::Software
                    {
                        let submission = &submissions[index];
                        let offset = (submission.bin_index as u64 * RASTER_UNIFORM_STRIDE) as u32;
                        pass.set_bind_group(0, sw_bind_group, &[offset]);
                        pass.dispatch_workgroups_indirect(bin_args, submission.arg_offset);
                        index += 1;
                    }
                }
            }
        }

        if software_ran {
            if let (Some(resolve_pipeline), Some(resolve_bind_group)) =
                (&self.resolve_pipeline, &self.resolve_bind_group)
            {
                let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                    label: Some("SW Resolve Pass"),
                    color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                        view: targets.visibility_view,
                        resolve_target: None,
                        ops: wgpu::Operations {
                            load: wgpu::LoadOp::Load,
                            store: wgpu::StoreOp::Store,
                        },
                    })],
                    depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                        view: targets.depth_view,
                        depth_ops: Some(wgpu::Operations {
                            load: wgpu::LoadOp::Load,
                            store: wgpu::StoreOp::Store,
                        }),
                        stencil_ops: None,
                    }),
                    timestamp_writes: None,
                    occlusion_query_set: None,
                });
                pass.set_pipeline(resolve_pipeline);
                pass.set_bind_group(0, resolve_bind_group, &[]);
                pass.draw(0..3, 0..1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binning::BIN_ARG_STRIDE;
    use crate::material::ShaderHandle;

    fn bin(flags: u32, index: u32) -> RasterBin {
        RasterBin {
            flags: MaterialFlags(flags),
            bin_index: index,
            arg_offset: index as u64 * BIN_ARG_STRIDE,
            indirection_offset: u32::MAX,
            shader: ShaderHandle::FIXED_FUNCTION,
            sort_key: 0,
        }
    }

    #[test]
    fn depth_resolve_bins_stay_on_hardware() {
        let caps = RasterCaps::full();
        assert_eq!(
            select_backend(MaterialFlags(MaterialFlags::MASKED), caps, true),
            RasterBackend::Hardware
        );
        assert_eq!(
            select_backend(MaterialFlags(MaterialFlags::DISPLACED), caps, false),
            RasterBackend::Hardware
        );
    }

    #[test]
    fn force_software_routes_everything_else_to_compute() {
        let caps = RasterCaps::full();
        assert_eq!(
            select_backend(
                MaterialFlags(MaterialFlags::VERTEX_PROGRAMMABLE),
                caps,
                true
            ),
            RasterBackend::Software
        );
        assert_eq!(
            select_backend(MaterialFlags(0), caps, true),
            RasterBackend::Software
        );
    }

    #[test]
    fn missing_compute_support_falls_back_to_hardware() {
        let caps = RasterCaps {
            software_raster: false,
            draw_indirect: true,
        };
        assert_eq!(
            select_backend(MaterialFlags(0), caps, true),
            RasterBackend::Hardware
        );
    }

    #[test]
    fn submissions_pick_the_matching_arg_record() {
        let caps = RasterCaps::full();
        let bins = vec![bin(MaterialFlags::MASKED, 0), bin(0, 1)];
        let plan = plan_submissions(&bins, caps, false);

        // Hardware bin reads the draw record at the slot's base.
        assert_eq!(plan[0].backend, RasterBackend::Hardware);
        assert_eq!(plan[0].arg_offset, 0);
        // Software bin reads the dispatch record behind it.
        assert_eq!(plan[1].backend, RasterBackend::Software);
        assert_eq!(plan[1].arg_offset, BIN_ARG_STRIDE + BIN_ARG_DISPATCH_OFFSET);
    }

    #[test]
    fn forced_software_plan_covers_the_same_bins() {
        let caps = RasterCaps::full();
        let bins = vec![
            bin(MaterialFlags::VERTEX_PROGRAMMABLE, 0),
            bin(0, 1),
            bin(MaterialFlags::TWO_SIDED, 2),
        ];
        let default_plan = plan_submissions(&bins, caps, false);
        let forced_plan = plan_submissions(&bins, caps, true);

        // Same bins in the same order; only the backend differs.
        assert_eq!(default_plan.len(), forced_plan.len());
        for (a, b) in default_plan.iter().zip(&forced_plan) {
            assert_eq!(a.bin_index, b.bin_index);
        }
        assert!(forced_plan.iter().all(|s| s.backend == RasterBackend::Software));
    }

    #[test]
    fn two_sided_bins_are_marked_in_the_plan() {
        let caps = RasterCaps::full();
        let bins = vec![
            bin(MaterialFlags::MASKED | MaterialFlags::TWO_SIDED, 0),
            bin(MaterialFlags::TWO_SIDED, 1),
            bin(0, 2),
        ];
        let plan = plan_submissions(&bins, caps, false);

        assert!(plan[0].two_sided);
        assert_eq!(plan[0].backend, RasterBackend::Hardware);
        assert!(plan[1].two_sided);
        assert!(!plan[2].two_sided);
    }

    #[test]
    fn depth_payload_word_orders_nearer_fragments_first() {
        let near = pack_depth_payload(0.25, 7);
        let far = pack_depth_payload(0.75, 9);
        assert!(near > far);
        assert_eq!(unpack_payload(near.max(far)), 7);
        assert!((unpack_depth(near) - 0.25).abs() < 1e-6);
    }

    #[test]
    fn equal_depth_words_break_ties_by_payload() {
        let a = pack_depth_payload(0.5, 3);
        let b = pack_depth_payload(0.5, 11);
        // The same pair of writes always settles on the same word, no
        // matter the order they land in.
        assert_eq!(a.max(b), b.max(a));
        assert_eq!(unpack_payload(a.max(b)), 11);
    }

    #[test]
    fn cleared_word_loses_to_any_fragment() {
        // The per-pixel buffer clears to zero; any rasterized fragment
        // with a nonzero payload must replace it, including one exactly
        // at the far plane.
        assert!(pack_depth_payload(1.0, 1) > 0);
        assert!(pack_depth_payload(0.0, 0) > 0);
        assert!(pack_depth_payload(0.5, 0) > pack_depth_payload(1.0, u32::MAX));
    }
}
