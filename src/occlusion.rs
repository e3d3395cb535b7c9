//! Hierarchical Z-Buffer (HZB) and the two-pass occlusion schedule.
//!
//! The HZB is a mip chain of the depth buffer where each texel contains
//! the maximum depth (furthest) of its corresponding region, so one texel
//! fetch at the right mip gives a conservative occlusion answer for a
//! whole screen-space bounding rect.
//!
//! Two-pass scheme: the main pass culls against the previous frame's HZB
//! and defers everything it rejects for occlusion to an occluded list;
//! the current frame's HZB is then rebuilt from the main pass's depth,
//! and the post pass re-tests only the occluded list against it. Objects
//! disoccluded this frame are recovered one pass late at most, and
//! nothing visible is ever lost.

/// One step of the occlusion schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CullingPass {
    /// Single pass with no depth-pyramid test (occlusion disabled, or no
    /// usable pyramid exists yet).
    NoOcclusion,
    /// Cull against the previous frame's pyramid, deferring occluded work.
    MainPass,
    /// Rebuild the pyramid from the depth rendered so far this frame.
    BuildOccluder,
    /// Re-test the deferred occluded list against the fresh pyramid.
    PostPass,
}

impl CullingPass {
    /// Queue the pass appends into and consumes from.
    pub fn queue(&self) -> crate::queue::QueuePass {
        match self {
            CullingPass::PostPass => crate::queue::QueuePass::Post,
            _ => crate::queue::QueuePass::Main,
        }
    }

    /// Pass index handed to the kernels (0 = main, 1 = post).
    pub fn index(&self) -> u32 {
        match self {
            CullingPass::PostPass => 1,
            _ => 0,
        }
    }
}

/// Tracks whether the pyramid holds usable depth and plans each frame's
/// pass sequence.
#[derive(Debug, Default)]
pub struct OcclusionSchedule {
    hzb_valid: bool,
}

impl OcclusionSchedule {
    /// Fresh schedule; the pyramid starts invalid.
    pub fn new() -> Self {
        Self { hzb_valid: false }
    }

    /// True if the pyramid holds depth from a completed frame at the
    /// current resolution.
    pub fn hzb_valid(&self) -> bool {
        self.hzb_valid
    }

    /// Drop the pyramid (resize, scene reset, first frame).
    pub fn invalidate(&mut self) {
        self.hzb_valid = false;
    }

    /// Plan the pass sequence for one frame and mark the pyramid valid
    /// for the next. With a stale pyramid the frame degrades to a single
    /// unoccluded pass plus a pyramid build, never to a wrong cull.
    pub fn plan(&mut self, occlusion_enabled: bool) -> Vec<CullingPass> {
        if !occlusion_enabled {
            self.hzb_valid = false;
            vec![CullingPass::NoOcclusion]
        } else if !self.hzb_valid {
            self.hzb_valid = true;
            vec![CullingPass::NoOcclusion, CullingPass::BuildOccluder]
        } else {
            vec![
                CullingPass::MainPass,
                CullingPass::BuildOccluder,
                CullingPass::PostPass,
            ]
        }
    }
}

/// Builds and owns the depth pyramid.
pub struct HzbBuilder {
    /// Pyramid texture with full mip chain.
    pub hzb_texture: wgpu::Texture,
    /// One view per mip level, for the reduction passes.
    pub hzb_mip_views: Vec<wgpu::TextureView>,
    /// Full-chain view for sampling in the cull kernels.
    pub hzb_view: wgpu::TextureView,
    /// Nearest-neighbor sampler (conservative depth).
    pub hzb_sampler: wgpu::Sampler,
    /// Pyramid width at mip 0.
    pub width: u32,
    /// Pyramid height at mip 0.
    pub height: u32,
    /// Number of mip levels.
    pub mip_count: u32,

    copy_pipeline: wgpu::ComputePipeline,
    reduce_pipeline: wgpu::ComputePipeline,
    build_bind_group_layout: wgpu::BindGroupLayout,
    build_bind_groups: Vec<wgpu::BindGroup>,
}

impl HzbBuilder {
    fn calculate_mip_count(width: u32, height: u32) -> u32 {
        let max_dim = width.max(height);
        (max_dim as f32).log2().floor() as u32 + 1
    }

    /// Create the pyramid texture and reduction pipeline.
    pub fn new(device: &wgpu::Device, width: u32, height: u32) -> Self {
        // Power-of-two extent keeps every 2x2 reduction exact; mip 0 is
        // a 1:1 copy of the depth target with far-plane padding, so the
        // cull kernels scale screen uv by screen/pyramid when sampling.
        let hzb_width = width.next_power_of_two().max(64);
        let hzb_height = height.next_power_of_two().max(64);
        let mip_count = Self::calculate_mip_count(hzb_width, hzb_height);

        // R32Float so the pyramid can be both sampled and storage-written.
        let hzb_texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("HZB Texture"),
            size: wgpu::Extent3d {
                width: hzb_width,
                height: hzb_height,
                depth_or_array_layers: 1,
            },
            mip_level_count: mip_count,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::R32Float,
            usage: wgpu::TextureUsages::STORAGE_BINDING
                | wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });

        let mut hzb_mip_views = Vec::with_capacity(mip_count as usize);
        for mip in 0..mip_count {
            let view = hzb_texture.create_view(&wgpu::TextureViewDescriptor {
                label: Some(&format!("HZB Mip {} View", mip)),
                format: Some(wgpu::TextureFormat::R32Float),
                dimension: Some(wgpu::TextureViewDimension::D2),
                aspect: wgpu::TextureAspect::All,
                base_mip_level: mip,
                mip_level_count: Some(1),
                base_array_layer: 0,
                array_layer_count: Some(1),
            });
            hzb_mip_views.push(view);
        }

        let hzb_view = hzb_texture.create_view(&wgpu::TextureViewDescriptor {
            label: Some("HZB Full View"),
            format: Some(wgpu::TextureFormat::R32Float),
            dimension: Some(wgpu::TextureViewDimension::D2),
            aspect: wgpu::TextureAspect::All,
            base_mip_level: 0,
            mip_level_count: Some(mip_count),
            base_array_layer: 0,
            array_layer_count: Some(1),
        });

        // Nearest everywhere; filtering would blend depths and break the
        // conservative bound.
        let hzb_sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("HZB Sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Nearest,
            min_filter: wgpu::FilterMode::Nearest,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });

        let build_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("HZB Build Shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("shaders/hzb_build.wgsl").into()),
        });

        let build_bind_group_layout =
            device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("HZB Build Bind Group Layout"),
                entries: &[
                    // Source mip (texture)
                    wgpu::BindGroupLayoutEntry {
                        binding: 0,
                        visibility: wgpu::ShaderStages::COMPUTE,
                        ty: wgpu::BindingType::Texture {
                            sample_type: wgpu::TextureSampleType::Float { filterable: false },
                            view_dimension: wgpu::TextureViewDimension::D2,
                            multisampled: false,
                        },
                        count: None,
                    },
                    // Destination mip (storage texture)
                    wgpu::BindGroupLayoutEntry {
                        binding: 1,
                        visibility: wgpu::ShaderStages::COMPUTE,
                        ty: wgpu::BindingType::StorageTexture {
                            access: wgpu::StorageTextureAccess::WriteOnly,
                            format: wgpu::TextureFormat::R32Float,
                            view_dimension: wgpu::TextureViewDimension::D2,
                        },
                        count: None,
                    },
                ],
            });

        let build_pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("HZB Build Pipeline Layout"),
            bind_group_layouts: &[&build_bind_group_layout],
            push_constant_ranges: &[],
        });

        let make_pipeline = |label: &str, entry: &str| {
            device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(label),
                layout: Some(&build_pipeline_layout),
                module: &build_shader,
                entry_point: Some(entry),
                compilation_options: Default::default(),
                cache: None,
            })
        };
        let copy_pipeline = make_pipeline("HZB Copy Pipeline", "copy_depth");
        let reduce_pipeline = make_pipeline("HZB Reduce Pipeline", "reduce");

        Self {
            hzb_texture,
            hzb_mip_views,
            hzb_view,
            hzb_sampler,
            width: hzb_width,
            height: hzb_height,
            mip_count,
            copy_pipeline,
            reduce_pipeline,
            build_bind_group_layout,
            build_bind_groups: Vec::new(),
        }
    }

    /// Recreate the pyramid at a new resolution. The caller must
    /// invalidate its [`OcclusionSchedule`] when this returns true.
    pub fn resize(&mut self, device: &wgpu::Device, width: u32, height: u32) -> bool {
        let hzb_width = width.next_power_of_two().max(64);
        let hzb_height = height.next_power_of_two().max(64);

        if hzb_width == self.width && hzb_height == self.height {
            return false;
        }

        *self = Self::new(device, width, height);
        true
    }

    /// Create the per-mip build bind groups; mip 0 copies from the depth
    /// buffer, mip N reduces mip N-1.
    pub fn create_build_bind_groups(
        &mut self,
        device: &wgpu::Device,
        depth_view: &wgpu::TextureView,
    ) {
        self.build_bind_groups.clear();

        for mip in 0..self.mip_count {
            let src_view = if mip == 0 {
                depth_view
            } else {
                &self.hzb_mip_views[(mip - 1) as usize]
            };
            let dst_view = &self.hzb_mip_views[mip as usize];

            let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(&format!("HZB Build Bind Group Mip {}", mip)),
                layout: &self.build_bind_group_layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: wgpu::BindingResource::TextureView(src_view),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: wgpu::BindingResource::TextureView(dst_view),
                    },
                ],
            });

            self.build_bind_groups.push(bind_group);
        }
    }

    /// Record the depth copy and the mip-chain reduction. The kernels
    /// read their extents from `textureDimensions`, so no per-mip
    /// uniform upload is needed.
    pub fn record_build(&self, encoder: &mut wgpu::CommandEncoder) {
        if self.build_bind_groups.is_empty() {
            return;
        }

        for mip in 0..self.mip_count {
            let dst_w = (self.width >> mip).max(1);
            let dst_h = (self.height >> mip).max(1);

            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(&format!("HZB Build Mip {}", mip)),
                timestamp_writes: None,
            });

            if mip == 0 {
                pass.set_pipeline(&self.copy_pipeline);
            } else {
                pass.set_pipeline(&self.reduce_pipeline);
            }
            pass.set_bind_group(0, &self.build_bind_groups[mip as usize], &[]);

            // 8x8 workgroups
            let workgroups_x = (dst_w + 7) / 8;
            let workgroups_y = (dst_h + 7) / 8;
            pass.dispatch_workgroups(workgroups_x, workgroups_y, 1);
        }
    }

    /// Full-chain view for the cull kernels.
    pub fn hzb_view(&self) -> &wgpu::TextureView {
        &self.hzb_view
    }

    /// Pyramid dimensions (width, height, mip count).
    pub fn dimensions(&self) -> (u32, u32, u32) {
        (self.width, self.height, self.mip_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueuePass;

    #[test]
    fn first_frame_runs_without_pyramid_then_builds_it() {
        let mut schedule = OcclusionSchedule::new();
        assert!(!schedule.hzb_valid());
        assert_eq!(
            schedule.plan(true),
            vec![CullingPass::NoOcclusion, CullingPass::BuildOccluder]
        );
        assert!(schedule.hzb_valid());
    }

    #[test]
    fn steady_state_is_main_build_post() {
        let mut schedule = OcclusionSchedule::new();
        schedule.plan(true);
        assert_eq!(
            schedule.plan(true),
            vec![
                CullingPass::MainPass,
                CullingPass::BuildOccluder,
                CullingPass::PostPass,
            ]
        );
    }

    #[test]
    fn invalidation_falls_back_to_unoccluded_pass() {
        let mut schedule = OcclusionSchedule::new();
        schedule.plan(true);
        schedule.plan(true);
        schedule.invalidate();
        assert_eq!(
            schedule.plan(true),
            vec![CullingPass::NoOcclusion, CullingPass::BuildOccluder]
        );
    }

    #[test]
    fn disabling_occlusion_also_drops_the_pyramid() {
        let mut schedule = OcclusionSchedule::new();
        schedule.plan(true);
        schedule.plan(true);
        assert_eq!(schedule.plan(false), vec![CullingPass::NoOcclusion]);
        // Re-enabling must not trust a pyramid that was never rebuilt.
        assert_eq!(
            schedule.plan(true),
            vec![CullingPass::NoOcclusion, CullingPass::BuildOccluder]
        );
    }

    #[test]
    fn only_the_post_pass_uses_the_post_queue() {
        assert_eq!(CullingPass::MainPass.queue(), QueuePass::Main);
        assert_eq!(CullingPass::NoOcclusion.queue(), QueuePass::Main);
        assert_eq!(CullingPass::PostPass.queue(), QueuePass::Post);
        assert_eq!(CullingPass::PostPass.index(), 1);
        assert_eq!(CullingPass::MainPass.index(), 0);
    }
}
