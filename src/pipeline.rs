//! Frame orchestration: wires instance culling, hierarchy traversal,
//! occlusion, binning and rasterization into one invocation.
//!
//! Each culling pass is submitted separately so its uniform uploads
//! land before its dispatches; within a pass all work is recorded into
//! a single command encoder in dependency order. Bin metadata is built
//! on a worker thread while the GPU runs the culling passes and joined
//! right before binning needs it.

use std::thread;

use crate::binning::{build_bins, debug_validate_bins, RasterBin, RasterBinner};
use crate::candidates::build_override_candidates;
use crate::dispatch::{
    plan_submissions, BinDispatcher, RasterBindings, RasterCaps, RasterTargets, RasterUniform,
};
use crate::instance_cull::{InstanceCullUniform, InstanceCuller};
use crate::material::{MaterialFlags, ShaderHandle};
use crate::occlusion::{CullingPass, HzbBuilder, OcclusionSchedule};
use crate::resources::{CullResources, ResourceLimits};
use crate::scene::SceneBinding;
use crate::stats::{FrameStats, StatsReadback};
use crate::traversal::{
    plan_steps, HierarchyTraverser, TraversalBindings, TraversalMode, TraversalStep,
    TraversalUniform, LEVEL_ARG_STRIDE,
};
use crate::view::ViewSet;
use crate::Error;

/// Per-invocation knobs; everything here has a working default.
#[derive(Debug, Clone)]
pub struct CullConfig {
    /// Scheduling policy for hierarchy traversal.
    pub traversal_mode: TraversalMode,
    /// Workgroups for the persistent mode.
    pub persistent_workgroups: u32,
    /// Enable two-pass occlusion culling.
    pub occlusion: bool,
    /// Route every eligible bin to the compute rasterizer.
    pub force_software: bool,
    /// Sort bins by state, depth-discard-capable bins last.
    pub sort_bins: bool,
    /// LOD error threshold in pixels.
    pub error_threshold: f32,
    /// Minimum projected instance radius in pixels.
    pub min_screen_radius: f32,
    /// Triangles-per-cluster upper bound, for draw argument expansion.
    pub triangles_per_cluster: u32,
    /// Cull host-named clusters ([`crate::scene::SceneBinding::cluster_overrides`])
    /// instead of walking the hierarchy; instances flagged
    /// [`crate::candidates::CullFlags::EXPLICIT_LIST`] skip LOD selection.
    pub explicit_list: bool,
}

impl Default for CullConfig {
    fn default() -> Self {
        Self {
            traversal_mode: TraversalMode::Levels,
            persistent_workgroups: 256,
            occlusion: true,
            force_software: false,
            sort_bins: true,
            error_threshold: 1.0,
            min_screen_radius: 0.5,
            triangles_per_cluster: 128,
            explicit_list: false,
        }
    }
}

/// Geometry buffers owned by the external page/material services.
pub struct GeometryBinding<'a> {
    /// Vertex positions for resident pages.
    pub positions: &'a wgpu::Buffer,
    /// Triangle indices for resident pages.
    pub indices: &'a wgpu::Buffer,
    /// Material records ([`crate::material::MaterialGpu`] layout).
    pub materials: &'a wgpu::Buffer,
    /// Registered material set mirrored on the CPU, in bin order.
    pub material_set: &'a [(MaterialFlags, ShaderHandle)],
}

/// What one invocation did, for callers and tests.
#[derive(Debug, Clone, Default)]
pub struct CullingResults {
    /// Number of views culled.
    pub view_count: u32,
    /// Pass sequence that ran.
    pub passes: Vec<CullingPass>,
    /// Number of raster bins submitted.
    pub bin_count: u32,
    /// Stats from an earlier frame, if a readback completed.
    pub stats: FrameStats,
}

/// Builds bin metadata off-thread while the culling passes record.
struct BinPrepJob {
    handle: Option<thread::JoinHandle<Vec<RasterBin>>>,
    // For the synchronous fallback if the worker died.
    materials: Vec<(MaterialFlags, ShaderHandle)>,
    sort: bool,
}

impl BinPrepJob {
    fn spawn(materials: Vec<(MaterialFlags, ShaderHandle)>, sort: bool) -> Self {
        let worker_materials = materials.clone();
        let handle = thread::spawn(move || build_bins(&worker_materials, sort));
        Self {
            handle: Some(handle),
            materials,
            sort,
        }
    }

    /// Join point: blocks until the metadata is ready.
    fn join(mut self) -> Vec<RasterBin> {
        match self.handle.take().map(|h| h.join()) {
            Some(Ok(bins)) => bins,
            _ => build_bins(&self.materials, self.sort),
        }
    }
}

/// The full culling-and-rasterization pipeline for one camera.
pub struct CullRasterPipeline {
    instance_culler: InstanceCuller,
    traverser: HierarchyTraverser,
    hzb: HzbBuilder,
    schedule: OcclusionSchedule,
    binner: RasterBinner,
    dispatcher: BinDispatcher,
    resources: CullResources,
    stats: StatsReadback,
    caps: RasterCaps,
    config: CullConfig,
    bind_groups_stale: bool,
}

impl CullRasterPipeline {
    /// Create the pipeline and its arenas.
    pub fn new(
        device: &wgpu::Device,
        width: u32,
        height: u32,
        limits: ResourceLimits,
        max_bins: u32,
        config: CullConfig,
    ) -> Result<Self, Error> {
        if width == 0 || height == 0 {
            return Err(Error::ZeroExtent);
        }
        if max_bins == 0 {
            return Err(Error::NoBins);
        }
        limits.validate()?;

        let caps = RasterCaps::from_device(device);
        let resources = CullResources::new(device, width, height, limits);
        let instance_culler = InstanceCuller::new(device);
        let traverser = HierarchyTraverser::new(device, limits.max_levels);
        let hzb = HzbBuilder::new(device, width, height);
        let binner = RasterBinner::new(device, max_bins, limits.max_visible);
        let dispatcher = BinDispatcher::new(device, CullResources::DEPTH_FORMAT, max_bins, caps);
        let stats = StatsReadback::new(device);

        log::info!(
            "culling pipeline created: {}x{} target, {} levels, software raster {}",
            width,
            height,
            limits.max_levels,
            if caps.software_raster { "on" } else { "off" }
        );

        Ok(Self {
            instance_culler,
            traverser,
            hzb,
            schedule: OcclusionSchedule::new(),
            binner,
            dispatcher,
            resources,
            stats,
            caps,
            config,
            bind_groups_stale: true,
        })
    }

    /// Current configuration.
    pub fn config(&self) -> &CullConfig {
        &self.config
    }

    /// Replace the configuration; takes effect next invocation.
    pub fn set_config(&mut self, config: CullConfig) {
        self.config = config;
    }

    /// Resize the render targets and depth pyramid.
    pub fn resize(&mut self, device: &wgpu::Device, width: u32, height: u32) {
        let targets_changed = self.resources.resize(device, width, height);
        let hzb_changed = self.hzb.resize(device, width, height);
        if hzb_changed {
            self.schedule.invalidate();
        }
        if targets_changed || hzb_changed {
            self.bind_groups_stale = true;
        }
    }

    /// Force bind-group rebuild, e.g. after the scene buffers moved.
    pub fn invalidate_bind_groups(&mut self) {
        self.bind_groups_stale = true;
    }

    fn rebuild_bind_groups(
        &mut self,
        device: &wgpu::Device,
        scene: &SceneBinding,
        geometry: &GeometryBinding,
    ) {
        self.instance_culler.update_bind_group(
            device,
            &self.resources.view_buffer,
            scene.instance_buffer,
            self.resources.queue_state.buffer(),
            self.resources.candidates.node_read_buffer(0),
            &self.resources.level_args,
        );

        let traversal_bindings = TraversalBindings {
            views: &self.resources.view_buffer,
            instances: scene.instance_buffer,
            nodes: scene.node_buffer,
            clusters: scene.cluster_buffer,
            queue_state: self.resources.queue_state.buffer(),
            node_candidates: [
                &self.resources.candidates.node_buffers[0],
                &self.resources.candidates.node_buffers[1],
            ],
            cluster_candidates: &self.resources.candidates.cluster_buffer,
            visible: &self.resources.candidates.visible_buffer,
            occluded: &self.resources.candidates.occluded_buffer,
            level_args: &self.resources.level_args,
            visible_args: &self.resources.visible_args,
            streaming_requests: &self.resources.streaming_requests,
            hzb_view: self.hzb.hzb_view(),
            hzb_sampler: &self.hzb.hzb_sampler,
        };
        self.traverser.update_bind_groups(device, &traversal_bindings);

        self.binner.update_bind_group(
            device,
            &self.resources.candidates.visible_buffer,
            self.resources.queue_state.buffer(),
            geometry.materials,
            scene.cluster_buffer,
        );

        let raster_bindings = RasterBindings {
            views: &self.resources.view_buffer,
            instances: scene.instance_buffer,
            clusters: scene.cluster_buffer,
            positions: geometry.positions,
            indices: geometry.indices,
            visible: &self.resources.candidates.visible_buffer,
            indirection: self.binner.indirection_buffer(),
            bin_args: self.binner.bin_args_buffer(),
        };
        let raster_targets = RasterTargets {
            visibility_view: &self.resources.visibility_view,
            depth_view: &self.resources.depth_view,
            depth_payload: &self.resources.depth_payload,
        };
        self.dispatcher
            .update_bind_groups(device, &raster_bindings, &raster_targets);

        self.hzb
            .create_build_bind_groups(device, &self.resources.depth_view);

        self.bind_groups_stale = false;
    }

    fn record_cull_pass(
        &mut self,
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        scene: &SceneBinding,
        pass: CullingPass,
        view_count: u32,
        hzb_valid: bool,
    ) {
        let limits = self.resources.limits;
        let pass_index = pass.index();
        let hzb_word = u32::from(hzb_valid && pass != CullingPass::NoOcclusion);

        self.instance_culler.update_uniform(
            queue,
            InstanceCullUniform {
                instance_count: scene.instance_count,
                view_count,
                pass_index,
                mode: u32::from(self.config.explicit_list),
                min_screen_radius: self.config.min_screen_radius,
                max_nodes: limits.max_nodes,
                max_clusters: limits.max_clusters,
                hzb_valid: hzb_word,
            },
        );
        self.traverser.update_uniforms(
            queue,
            TraversalUniform {
                level: 0,
                // The cluster and post arg slots sit at the end of the
                // level chain, which is laid out with the configured
                // limit, not the scene's depth.
                max_levels: limits.max_levels,
                pass_index,
                hzb_valid: hzb_word,
                max_nodes: limits.max_nodes,
                max_clusters: limits.max_clusters,
                max_visible: limits.max_visible,
                max_streaming_requests: limits.max_streaming_requests,
                error_threshold: self.config.error_threshold,
                view_count,
                _pad: [0; 2],
            },
        );

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Cull Pass Encoder"),
        });

        // The post pass re-tests only the deferred occluded list, so it
        // skips instance culling and the node levels entirely. The same
        // goes for the main pass when host-named clusters already seeded
        // the cluster queue.
        let explicit_seeded = self.config.explicit_list
            && scene.cluster_overrides.is_some_and(|o| !o.is_empty());
        let steps = if pass_index == 0 && !explicit_seeded {
            self.instance_culler
                .dispatch(&mut encoder, scene.instance_count, view_count);
            plan_steps(
                self.config.traversal_mode,
                scene.max_levels.min(limits.max_levels),
                self.config.persistent_workgroups,
            )
        } else {
            vec![TraversalStep::ClusterCull]
        };
        self.traverser
            .record(&mut encoder, &self.resources.level_args, &steps, pass_index);

        queue.submit(Some(encoder.finish()));
    }

    /// Upload host-named clusters straight into the cluster queue and
    /// write the main cluster-cull args, bypassing hierarchy traversal.
    fn seed_cluster_overrides(
        &self,
        queue: &wgpu::Queue,
        overrides: &[crate::scene::ClusterOverride],
        view_count: u32,
    ) {
        let limits = self.resources.limits;
        let (candidates, dropped) =
            build_override_candidates(overrides, view_count, limits.max_clusters);
        if dropped > 0 {
            log::warn!(
                "cluster override list dropped {dropped} entries; raise ResourceLimits::max_clusters"
            );
        }
        if candidates.is_empty() {
            return;
        }

        queue.write_buffer(
            &self.resources.candidates.cluster_buffer,
            0,
            bytemuck::cast_slice(&candidates),
        );

        let count = candidates.len() as u32;
        let args = [count.div_ceil(64), 1, 1, count];
        queue.write_buffer(
            &self.resources.level_args,
            u64::from(limits.max_levels) * LEVEL_ARG_STRIDE,
            bytemuck::cast_slice(&args),
        );
        // Mirror the seeded count into the queue counters so the stats
        // readback reports it like a traversal append.
        queue.write_buffer(
            self.resources.queue_state.buffer(),
            8,
            bytemuck::cast_slice(&[count]),
        );
    }

    fn record_raster(
        &mut self,
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        bins: &[RasterBin],
        clear_targets: bool,
    ) {
        let limits = self.resources.limits;
        self.binner.prepare(
            queue,
            bins.len() as u32,
            limits.max_visible,
            limits.max_visible,
            self.config.triangles_per_cluster,
        );
        self.dispatcher.update_uniforms(
            queue,
            RasterUniform {
                screen_size: [
                    self.resources.width as f32,
                    self.resources.height as f32,
                    1.0 / self.resources.width as f32,
                    1.0 / self.resources.height as f32,
                ],
                view_index: 0,
                bin_index: 0,
                triangles_per_cluster: self.config.triangles_per_cluster,
                material_flags: 0,
            },
            bins,
        );

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Raster Encoder"),
        });

        if clear_targets {
            self.resources.clear_depth_payload(&mut encoder);
            // Clear visibility and depth with an empty pass before any
            // bin loads them.
            let _clear = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Target Clear Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &self.resources.visibility_view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                    view: &self.resources.depth_view,
                    depth_ops: Some(wgpu::Operations {
                        load: wgpu::LoadOp::Clear(1.0),
                        store: wgpu::StoreOp::Store,
                    }),
                    stencil_ops: None,
                }),
                timestamp_writes: None,
                occlusion_query_set: None,
            });
        }

        self.binner
            .record(&mut encoder, &self.resources.visible_args, bins.len() as u32);

        let submissions = plan_submissions(bins, self.caps, self.config.force_software);
        let targets = RasterTargets {
            visibility_view: &self.resources.visibility_view,
            depth_view: &self.resources.depth_view,
            depth_payload: &self.resources.depth_payload,
        };
        self.dispatcher.record(
            &mut encoder,
            &targets,
            self.binner.bin_args_buffer(),
            &submissions,
        );

        queue.submit(Some(encoder.finish()));
    }

    /// Run one full invocation for a view set.
    ///
    /// An empty view set is a no-op: no passes run, no state changes.
    pub fn render(
        &mut self,
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        scene: &SceneBinding,
        geometry: &GeometryBinding,
        views: &ViewSet,
        fov_y: f32,
    ) -> CullingResults {
        let packed = views.pack(fov_y);
        if packed.is_empty() || scene.instance_count == 0 {
            return CullingResults::default();
        }

        if self.bind_groups_stale {
            self.rebuild_bind_groups(device, scene, geometry);
        }

        // Kick the CPU-side bin build; joined right before binning.
        let bin_job = BinPrepJob::spawn(geometry.material_set.to_vec(), self.config.sort_bins);

        let view_count = self.resources.upload_views(queue, &packed);
        self.resources.reset(queue);

        if self.config.explicit_list {
            if let Some(overrides) = scene.cluster_overrides {
                self.seed_cluster_overrides(queue, overrides, view_count);
            }
        }

        let hzb_was_valid = self.schedule.hzb_valid();
        let passes = self.schedule.plan(self.config.occlusion);

        let mut bins: Option<Vec<RasterBin>> = None;
        let mut bin_job = Some(bin_job);
        let mut first_raster = true;

        for &pass in &passes {
            match pass {
                CullingPass::NoOcclusion | CullingPass::MainPass | CullingPass::PostPass => {
                    self.record_cull_pass(device, queue, scene, pass, view_count, hzb_was_valid);

                    if bins.is_none() {
                        let built = bin_job.take().map(BinPrepJob::join).unwrap_or_default();
                        debug_validate_bins(&built, built.len() as u32);
                        bins = Some(built);
                    }
                    let frame_bins = bins.as_deref().unwrap_or(&[]);
                    self.record_raster(device, queue, frame_bins, first_raster);
                    first_raster = false;
                }
                CullingPass::BuildOccluder => {
                    let mut encoder =
                        device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                            label: Some("Occluder Build Encoder"),
                        });
                    self.hzb.record_build(&mut encoder);
                    queue.submit(Some(encoder.finish()));
                }
            }
        }

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Stats Copy Encoder"),
        });
        self.stats
            .record_copy(&mut encoder, self.resources.queue_state.buffer());
        queue.submit(Some(encoder.finish()));

        let stats = self.stats.poll(device);
        if stats.saturated() {
            log::warn!(
                "culling arenas overflowed ({} drops); raise ResourceLimits",
                stats.overflows
            );
        }

        CullingResults {
            view_count,
            passes,
            bin_count: bins.map(|b| b.len() as u32).unwrap_or(0),
            stats,
        }
    }

    /// The visibility target for downstream shading.
    pub fn visibility_view(&self) -> &wgpu::TextureView {
        &self.resources.visibility_view
    }

    /// The streaming-request buffer for the LOD service to drain.
    pub fn streaming_requests(&self) -> &wgpu::Buffer {
        &self.resources.streaming_requests
    }

    /// Most recent completed frame statistics.
    pub fn latest_stats(&self) -> FrameStats {
        self.stats.latest()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_two_pass_levels() {
        let config = CullConfig::default();
        assert_eq!(config.traversal_mode, TraversalMode::Levels);
        assert!(config.occlusion);
        assert!(config.sort_bins);
        assert!(!config.force_software);
    }

    #[test]
    fn bin_prep_job_produces_the_same_bins_as_synchronous_build() {
        let materials = vec![
            (MaterialFlags(0), ShaderHandle(1)),
            (MaterialFlags(MaterialFlags::MASKED), ShaderHandle(2)),
        ];
        let job = BinPrepJob::spawn(materials.clone(), true);
        assert_eq!(job.join(), build_bins(&materials, true));
    }
}
