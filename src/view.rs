//! Packed views consumed by the culling passes.
//!
//! Views are built externally (camera, shadow cascades, virtual shadow map
//! mips) and are immutable for the duration of one cull/rasterize
//! invocation. A primary view may carry a number of derived mip views that
//! share its transform but cull at a reduced resolution.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};

use crate::cullmath::Frustum;

/// Per-view behavior flags (bit positions match the WGSL kernels).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ViewFlags(pub u32);

impl ViewFlags {
    /// Depth-only view (shadow pass); no material binning consumers.
    pub const DEPTH_ONLY: u32 = 1 << 0;
    /// Apply draw-distance culling for this view.
    pub const DISTANCE_CULL: u32 = 1 << 1;
    /// Test candidates against the previous frame's depth pyramid.
    pub const HZB_TEST: u32 = 1 << 2;

    /// Check whether a flag bit is set.
    pub fn contains(&self, bit: u32) -> bool {
        self.0 & bit != 0
    }
}

/// A single culling view.
#[derive(Debug, Clone)]
pub struct View {
    /// World-to-view matrix.
    pub view: Mat4,
    /// View-to-clip matrix.
    pub projection: Mat4,
    /// Previous frame's view-projection, for main-pass occlusion tests.
    pub prev_view_proj: Mat4,
    /// Viewport rectangle in pixels (x, y, width, height).
    pub viewport: [u32; 4],
    /// Scale applied to projected LOD error before thresholding.
    pub lod_scale: f32,
    /// Maximum draw distance when distance culling is enabled.
    pub max_draw_distance: f32,
    /// Behavior flags.
    pub flags: ViewFlags,
}

impl View {
    /// Combined view-projection matrix.
    pub fn view_proj(&self) -> Mat4 {
        self.projection * self.view
    }

    /// Camera position extracted from the inverse view matrix.
    pub fn camera_position(&self) -> Vec3 {
        self.view.inverse().w_axis.truncate()
    }

    /// Frustum for CPU-side plan validation.
    pub fn frustum(&self) -> Frustum {
        Frustum::from_view_proj(&self.view_proj())
    }
}

impl Default for View {
    fn default() -> Self {
        Self {
            view: Mat4::IDENTITY,
            projection: Mat4::IDENTITY,
            prev_view_proj: Mat4::IDENTITY,
            viewport: [0, 0, 1920, 1080],
            lod_scale: 1.0,
            max_draw_distance: f32::MAX,
            flags: ViewFlags::default(),
        }
    }
}

/// GPU representation of a packed view (288 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct PackedViewGpu {
    /// View-projection matrix.
    pub view_proj: [[f32; 4]; 4],
    /// Previous frame's view-projection matrix.
    pub prev_view_proj: [[f32; 4]; 4],
    /// Frustum planes, world space.
    pub planes: [[f32; 4]; 6],
    /// Camera position (xyz), w = max draw distance.
    pub camera_pos: [f32; 4],
    /// Viewport rectangle in pixels.
    pub viewport: [u32; 4],
    /// x = lod scale, y = screen height, z = fov_y, w = unused.
    pub lod_params: [f32; 4],
    /// x = flags, y = view index, z = primary view index, w = mip level.
    pub packed: [u32; 4],
}

impl PackedViewGpu {
    /// Size in bytes, asserted by tests.
    pub const SIZE: usize = 288;
}

/// The full set of views for one invocation.
///
/// Zero views is valid: every downstream pass degenerates to an empty
/// dispatch and the pipeline emits empty results.
#[derive(Debug, Clone, Default)]
pub struct ViewSet {
    views: Vec<View>,
    /// Parallel to `views`: (primary index, mip level).
    derivation: Vec<(u32, u32)>,
}

impl ViewSet {
    /// A view set with a single primary view.
    pub fn single(view: View) -> Self {
        let mut set = Self::default();
        set.push_primary(view);
        set
    }

    /// Append a primary view. Returns its index.
    pub fn push_primary(&mut self, view: View) -> u32 {
        let index = self.views.len() as u32;
        self.views.push(view);
        self.derivation.push((index, 0));
        index
    }

    /// Append `mip_count` derived mip views for an existing primary view.
    ///
    /// Derived views share the primary's transform; each halves the
    /// viewport of the previous and scales LOD error to match. Used by the
    /// virtual-shadow-map collaborator to cull one page hierarchy with a
    /// variable number of mip views.
    pub fn push_mips(&mut self, primary: u32, mip_count: u32) {
        let base = self.views[primary as usize].clone();
        for mip in 1..=mip_count {
            let mut view = base.clone();
            view.viewport[2] = (base.viewport[2] >> mip).max(1);
            view.viewport[3] = (base.viewport[3] >> mip).max(1);
            view.lod_scale = base.lod_scale / (1u32 << mip) as f32;
            self.views.push(view);
            self.derivation.push((primary, mip));
        }
    }

    /// Number of views, derived included.
    pub fn len(&self) -> usize {
        self.views.len()
    }

    /// True when no views were supplied.
    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    /// Iterate over all views.
    pub fn iter(&self) -> impl Iterator<Item = &View> {
        self.views.iter()
    }

    /// View by index.
    pub fn get(&self, index: u32) -> Option<&View> {
        self.views.get(index as usize)
    }

    /// Pack all views for upload into the view storage buffer.
    pub fn pack(&self, fov_y: f32) -> Vec<PackedViewGpu> {
        self.views
            .iter()
            .zip(self.derivation.iter())
            .enumerate()
            .map(|(index, (view, &(primary, mip)))| {
                let view_proj = view.view_proj();
                let camera = view.camera_position();
                PackedViewGpu {
                    view_proj: view_proj.to_cols_array_2d(),
                    prev_view_proj: view.prev_view_proj.to_cols_array_2d(),
                    planes: view.frustum().to_arrays(),
                    camera_pos: [camera.x, camera.y, camera.z, view.max_draw_distance],
                    viewport: view.viewport,
                    lod_params: [view.lod_scale, view.viewport[3] as f32, fov_y, 0.0],
                    packed: [view.flags.0, index as u32, primary, mip],
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packed_view_size() {
        assert_eq!(std::mem::size_of::<PackedViewGpu>(), PackedViewGpu::SIZE);
    }

    #[test]
    fn empty_view_set_packs_to_nothing() {
        let set = ViewSet::default();
        assert!(set.is_empty());
        assert!(set.pack(1.0).is_empty());
    }

    #[test]
    fn mip_views_halve_viewport_and_error_scale() {
        let mut set = ViewSet::default();
        let primary = set.push_primary(View {
            viewport: [0, 0, 1024, 1024],
            ..Default::default()
        });
        set.push_mips(primary, 3);
        assert_eq!(set.len(), 4);

        let packed = set.pack(std::f32::consts::FRAC_PI_4);
        assert_eq!(packed[1].viewport[2], 512);
        assert_eq!(packed[3].viewport[2], 128);
        assert_eq!(packed[2].packed[2], primary);
        assert_eq!(packed[2].packed[3], 2);
        assert!((packed[3].lod_params[0] - 0.125).abs() < 1e-6);
    }

    #[test]
    fn camera_position_round_trips_through_view_matrix() {
        let eye = Vec3::new(3.0, 4.0, 5.0);
        let view = View {
            view: Mat4::look_at_rh(eye, Vec3::ZERO, Vec3::Y),
            ..Default::default()
        };
        assert!((view.camera_position() - eye).length() < 1e-4);
    }
}
