//! Per-instance culling: the first stage of the pipeline.
//!
//! Each instance is tested against every view's frustum, minimum screen
//! radius and draw distance. Survivors seed hierarchy traversal as
//! candidate nodes; occlusion is resolved later at cluster granularity.
//! In explicit-list mode the candidate is flagged so traversal emits the
//! instance's clusters without hierarchy LOD selection. Appends past the
//! node arena capacity are dropped and show up only in the overflow
//! counter.

use bytemuck::{Pod, Zeroable};

/// Instance-culling uniform data (32 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable, Default)]
pub struct InstanceCullUniform {
    /// Number of instances to test.
    pub instance_count: u32,
    /// Number of views in the view buffer.
    pub view_count: u32,
    /// 0 = main pass, 1 = post pass.
    pub pass_index: u32,
    /// 0 = seed hierarchy traversal, 1 = explicit cluster list.
    pub mode: u32,
    /// Minimum projected screen radius in pixels; smaller instances cull.
    pub min_screen_radius: f32,
    /// Capacity of the candidate node arena.
    pub max_nodes: u32,
    /// Capacity of the candidate cluster arena.
    pub max_clusters: u32,
    /// Nonzero when a valid previous-frame HZB exists.
    pub hzb_valid: u32,
}

/// Manages the instance-culling compute pipeline.
pub struct InstanceCuller {
    pipeline: wgpu::ComputePipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    uniform_buffer: wgpu::Buffer,
    bind_group: Option<wgpu::BindGroup>,
}

impl InstanceCuller {
    /// Create the instance-culling pipeline.
    pub fn new(device: &wgpu::Device) -> Self {
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Instance Cull Shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("shaders/instance_cull.wgsl").into()),
        });

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Instance Cull Bind Group Layout"),
            entries: &[
                // Uniform
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
                // Packed views (read)
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
                // Instances (read)
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
                // Queue state (atomic read/write)
                wgpu::BindGroupLayoutEntry {
                    binding: 3,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: false },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                // Candidate nodes out (write)
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
                // Level-0 traversal dispatch args (write)
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
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Instance Cull Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("Instance Cull Pipeline"),
            layout: Some(&pipeline_layout),
            module: &shader,
            entry_point: Some("main"),
            compilation_options: Default::default(),
            cache: None,
        });

        let uniform_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Instance Cull Uniform Buffer"),
            size: std::mem::size_of::<InstanceCullUniform>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        Self {
            pipeline,
            bind_group_layout,
            uniform_buffer,
            bind_group: None,
        }
    }

    /// Create or update the bind group with the invocation's buffers.
    pub fn update_bind_group(
        &mut self,
        device: &wgpu::Device,
        view_buffer: &wgpu::Buffer,
        instance_buffer: &wgpu::Buffer,
        queue_state_buffer: &wgpu::Buffer,
        node_out_buffer: &wgpu::Buffer,
        node_dispatch_args: &wgpu::Buffer,
    ) {
        self.bind_group = Some(device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Instance Cull Bind Group"),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: self.uniform_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: view_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: instance_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: queue_state_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: node_out_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 6,
                    resource: node_dispatch_args.as_entire_binding(),
                },
            ],
        }));
    }

    /// Upload the uniform for this invocation.
    pub fn update_uniform(&self, queue: &wgpu::Queue, uniform: InstanceCullUniform) {
        queue.write_buffer(&self.uniform_buffer, 0, bytemuck::cast_slice(&[uniform]));
    }

    /// Dispatch one thread per (instance, view) pair.
    pub fn dispatch(&self, encoder: &mut wgpu::CommandEncoder, instance_count: u32, view_count: u32) {
        let Some(bind_group) = &self.bind_group else {
            return;
        };
        if instance_count == 0 || view_count == 0 {
            return;
        }

        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("Instance Cull Pass"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&self.pipeline);
        pass.set_bind_group(0, bind_group, &[]);

        let workgroups = (instance_count + 63) / 64;
        pass.dispatch_workgroups(workgroups, view_count, 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_size() {
        assert_eq!(std::mem::size_of::<InstanceCullUniform>(), 32);
    }
}
