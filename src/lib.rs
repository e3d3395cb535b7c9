//! # vgr - GPU-driven visibility and rasterization
//!
//! vgr is the culling and rasterization core of a virtualized-geometry
//! renderer, built on wgpu. It takes an externally-owned LOD hierarchy
//! (instances, nodes, clusters, geometry pages) and, entirely on the
//! GPU, decides what is visible and rasterizes it into a visibility
//! buffer.
//!
//! ## Pipeline
//!
//! - **Instance culling**: frustum, distance and screen-size tests per
//!   (instance, view) pair, seeding hierarchy traversal
//! - **Hierarchy traversal**: breadth-first LOD selection with
//!   per-level indirect dispatch or a persistent-thread mode
//! - **Two-pass occlusion**: cull against last frame's depth pyramid,
//!   rebuild it, re-test only what was occluded
//! - **Binning**: group visible clusters by material into raster bins
//!   with indirect arguments for both backends
//! - **Dispatch**: hardware raster for large or depth-discarding work,
//!   compute software raster for tiny triangles
//!
//! ## Example
//!
//! ```ignore
//! use vgr::{CullConfig, CullRasterPipeline, ResourceLimits, ViewSet};
//!
//! let mut pipeline = CullRasterPipeline::new(
//!     &device, 1920, 1080, ResourceLimits::default(), 64, CullConfig::default(),
//! )?;
//! let views = ViewSet::single(view);
//! let results = pipeline.render(&device, &queue, &scene, &geometry, &views, fov_y);
//! println!("visible clusters: {}", results.stats.visible_clusters);
//! ```

#![warn(missing_docs)]

use thiserror::Error as ThisError;

pub mod binning;
pub mod candidates;
pub mod cullmath;
pub mod dispatch;
pub mod instance_cull;
pub mod material;
pub mod occlusion;
pub mod pipeline;
pub mod queue;
pub mod resources;
pub mod scene;
pub mod stats;
pub mod traversal;
pub mod view;

pub use binning::{build_bins, RasterBin, RasterBinner};
pub use dispatch::{plan_submissions, BinDispatcher, RasterBackend, RasterCaps};
pub use material::{MaterialFlags, ShaderHandle, ShaderTable, ShaderTarget};
pub use occlusion::{CullingPass, HzbBuilder, OcclusionSchedule};
pub use pipeline::{CullConfig, CullRasterPipeline, CullingResults, GeometryBinding};
pub use resources::{CullResources, ResourceLimits};
pub use scene::{
    ClusterGpu, ClusterOverride, HierarchyNodeGpu, InstanceGpu, SceneBinding, StreamingRequestGpu,
};
pub use stats::FrameStats;
pub use traversal::{HierarchyTraverser, TraversalMode};
pub use view::{View, ViewFlags, ViewSet};

/// Errors surfaced during pipeline construction and reconfiguration.
#[derive(Debug, ThisError)]
pub enum Error {
    /// A render target dimension was zero.
    #[error("render target extent must be nonzero")]
    ZeroExtent,
    /// No material bins were allocated.
    #[error("at least one raster bin is required")]
    NoBins,
    /// A capacity limit was out of range for the device.
    #[error("resource limit out of range: {0}")]
    LimitOutOfRange(&'static str),
}
