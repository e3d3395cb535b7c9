//! Culling math shared between the CPU planner and the WGSL kernels.
//!
//! The compute shaders are the authority for per-item culling; the CPU
//! versions here exist for dispatch planning, validation, and tests, and
//! mirror the shader logic exactly.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec2, Vec3, Vec4, Vec4Swizzles};

/// A view frustum as 6 planes (left, right, bottom, top, near, far),
/// each stored as vec4: xyz = normal, w = distance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Frustum {
    /// The six planes of the frustum.
    pub planes: [Vec4; 6],
}

impl Frustum {
    /// Extract frustum planes from a view-projection matrix
    /// (Gribb/Hartmann, rows of the transposed matrix).
    pub fn from_view_proj(view_proj: &Mat4) -> Self {
        let r0 = view_proj.row(0);
        let r1 = view_proj.row(1);
        let r2 = view_proj.row(2);
        let r3 = view_proj.row(3);

        let planes = [
            normalize_plane(r3 + r0), // left
            normalize_plane(r3 - r0), // right
            normalize_plane(r3 + r1), // bottom
            normalize_plane(r3 - r1), // top
            normalize_plane(r3 + r2), // near
            normalize_plane(r3 - r2), // far
        ];

        Self { planes }
    }

    /// Test a world-space bounding sphere against all 6 planes.
    ///
    /// Conservative: returns true if the sphere is inside or intersecting.
    pub fn contains_sphere(&self, center: Vec3, radius: f32) -> bool {
        for plane in &self.planes {
            let distance = plane.xyz().dot(center) + plane.w;
            if distance < -radius {
                return false;
            }
        }
        true
    }

    /// Planes in the GPU uniform layout.
    pub fn to_arrays(&self) -> [[f32; 4]; 6] {
        [
            self.planes[0].to_array(),
            self.planes[1].to_array(),
            self.planes[2].to_array(),
            self.planes[3].to_array(),
            self.planes[4].to_array(),
            self.planes[5].to_array(),
        ]
    }
}

fn normalize_plane(plane: Vec4) -> Vec4 {
    let length = plane.xyz().length();
    if length > 0.0 {
        plane / length
    } else {
        plane
    }
}

/// Project a world-space error metric to pixels.
///
/// `error_pixels = (error / distance) * screen_height / (2 * tan(fov_y / 2))`.
/// A distance of zero (camera inside the bounds) projects to infinite error,
/// which always selects the finest level.
pub fn project_error_to_pixels(
    world_error: f32,
    camera_distance: f32,
    screen_height: f32,
    fov_y: f32,
) -> f32 {
    if camera_distance <= 0.0 {
        return f32::MAX;
    }
    let projection_scale = screen_height / (2.0 * (fov_y * 0.5).tan());
    (world_error / camera_distance) * projection_scale
}

/// Projected screen radius of a bounding sphere, in pixels.
pub fn project_sphere_radius(
    radius: f32,
    camera_distance: f32,
    screen_height: f32,
    fov_y: f32,
) -> f32 {
    project_error_to_pixels(radius, camera_distance, screen_height, fov_y)
}

/// Where a projected sphere lands in the depth pyramid: the uv rect to
/// sample and the mip whose texels cover the footprint.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HzbFootprint {
    /// Lower-left corner of the sample rect, pyramid uv space.
    pub uv_min: Vec2,
    /// Upper-right corner of the sample rect, pyramid uv space.
    pub uv_max: Vec2,
    /// Mip level whose texel size covers the footprint diameter.
    pub mip: u32,
}

/// Compute a sphere's sample footprint in the depth pyramid.
///
/// Mip 0 of the pyramid is a 1:1 copy of the depth target padded out to
/// the power-of-two pyramid extent, so screen uv maps into the
/// `screen / hzb_size` sub-rectangle and the mip is chosen from the
/// radius in screen pixels. Mirrors the cull kernels' pyramid lookup.
pub fn hzb_footprint(ndc_center: Vec2, radius_ndc: f32, screen: Vec2, hzb_size: Vec2) -> HzbFootprint {
    let scale = screen / hzb_size;
    let screen_uv = Vec2::new(ndc_center.x * 0.5 + 0.5, 0.5 - ndc_center.y * 0.5);
    let uv = screen_uv * scale;
    let offset = Vec2::splat(radius_ndc * 0.5) * scale;

    let pixel_radius = radius_ndc * 0.5 * screen.x;
    let mip = (pixel_radius * 2.0).max(1.0).log2().ceil().clamp(0.0, 16.0) as u32;

    HzbFootprint {
        uv_min: uv - offset,
        uv_max: uv + offset,
        mip,
    }
}

/// The pyramid occlusion predicate: a sphere is occluded only when its
/// nearest depth lies beyond the farthest depth stored over its
/// footprint.
pub fn hzb_occludes(footprint_furthest: f32, sphere_nearest_depth: f32) -> bool {
    sphere_nearest_depth > footprint_furthest
}

/// World-space bounding sphere (xyz = center, w = radius), GPU layout.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable, Default)]
pub struct BoundingSphere {
    /// Center (xyz) and radius (w).
    pub center_radius: [f32; 4],
}

impl BoundingSphere {
    /// Create from center and radius.
    pub fn new(center: Vec3, radius: f32) -> Self {
        Self {
            center_radius: [center.x, center.y, center.z, radius],
        }
    }

    /// Sphere center.
    pub fn center(&self) -> Vec3 {
        Vec3::new(
            self.center_radius[0],
            self.center_radius[1],
            self.center_radius[2],
        )
    }

    /// Sphere radius.
    pub fn radius(&self) -> f32 {
        self.center_radius[3]
    }

    /// Transform by an instance matrix. The radius is scaled by the
    /// largest axis scale so the result stays conservative.
    pub fn transformed(&self, transform: &Mat4) -> Self {
        let center = transform.transform_point3(self.center());
        let scale_x = transform.x_axis.xyz().length();
        let scale_y = transform.y_axis.xyz().length();
        let scale_z = transform.z_axis.xyz().length();
        let max_scale = scale_x.max(scale_y).max(scale_z);
        Self::new(center, self.radius() * max_scale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_view_proj() -> Mat4 {
        let proj = Mat4::perspective_rh(std::f32::consts::FRAC_PI_4, 16.0 / 9.0, 0.1, 1000.0);
        let view = Mat4::look_at_rh(Vec3::new(0.0, 0.0, 10.0), Vec3::ZERO, Vec3::Y);
        proj * view
    }

    #[test]
    fn sphere_at_origin_is_inside() {
        let frustum = Frustum::from_view_proj(&test_view_proj());
        assert!(frustum.contains_sphere(Vec3::ZERO, 1.0));
    }

    #[test]
    fn sphere_behind_camera_is_outside() {
        let frustum = Frustum::from_view_proj(&test_view_proj());
        assert!(!frustum.contains_sphere(Vec3::new(0.0, 0.0, 100.0), 1.0));
    }

    #[test]
    fn sphere_straddling_plane_is_kept() {
        let frustum = Frustum::from_view_proj(&test_view_proj());
        // Far to the left but with a huge radius reaching into the frustum.
        assert!(frustum.contains_sphere(Vec3::new(-50.0, 0.0, 0.0), 60.0));
    }

    #[test]
    fn error_projection_scales_inversely_with_distance() {
        let near = project_error_to_pixels(0.1, 5.0, 1080.0, std::f32::consts::FRAC_PI_4);
        let far = project_error_to_pixels(0.1, 50.0, 1080.0, std::f32::consts::FRAC_PI_4);
        assert!(near > far);
        assert!((near / far - 10.0).abs() < 1e-3);
    }

    #[test]
    fn zero_distance_projects_to_max() {
        let e = project_error_to_pixels(0.1, 0.0, 1080.0, 1.0);
        assert_eq!(e, f32::MAX);
    }

    #[test]
    fn pyramid_footprint_stays_inside_screen_mapped_region() {
        // 1920x1080 target in a 2048x2048 pyramid: the screen occupies
        // the [0, 0.9375] x [0, 0.5273] sub-rectangle of uv space.
        let screen = Vec2::new(1920.0, 1080.0);
        let hzb = Vec2::new(2048.0, 2048.0);
        let fp = hzb_footprint(Vec2::ZERO, 0.05, screen, hzb);

        let center = (fp.uv_min + fp.uv_max) * 0.5;
        assert!((center.x - 0.5 * 1920.0 / 2048.0).abs() < 1e-5);
        assert!((center.y - 0.5 * 1080.0 / 2048.0).abs() < 1e-5);
        // A screen-centered sphere must never sample the padding region
        // past the screen-mapped sub-rectangle.
        assert!(fp.uv_max.x <= 1920.0 / 2048.0);
        assert!(fp.uv_max.y <= 1080.0 / 2048.0);
    }

    #[test]
    fn footprint_mip_tracks_projected_radius() {
        let screen = Vec2::new(1920.0, 1080.0);
        let hzb = Vec2::new(2048.0, 2048.0);

        // Sub-pixel sphere samples the finest mip.
        let tiny = hzb_footprint(Vec2::ZERO, 1.0e-4, screen, hzb);
        assert_eq!(tiny.mip, 0);

        // ~48 pixel radius: a 96 texel diameter needs mip 7 (128 texels).
        let big = hzb_footprint(Vec2::ZERO, 0.05, screen, hzb);
        assert_eq!(big.mip, 7);
    }

    #[test]
    fn far_padding_depth_never_occludes() {
        // Padding texels hold the far-plane depth, so the conservative
        // max over a footprint touching them can only keep the sphere.
        assert!(!hzb_occludes(1.0, 0.75));
        assert!(hzb_occludes(0.25, 0.75));
    }

    #[test]
    fn transformed_sphere_uses_max_axis_scale() {
        let sphere = BoundingSphere::new(Vec3::ZERO, 1.0);
        let transform = Mat4::from_scale(Vec3::new(1.0, 3.0, 2.0));
        let out = sphere.transformed(&transform);
        assert!((out.radius() - 3.0).abs() < 1e-5);
    }
}
