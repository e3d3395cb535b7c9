//! Material descriptors and the shader-permutation lookup table.
//!
//! The material/shader-permutation service is external; this module models
//! its interface: a bit-flags descriptor per material, and a table that
//! resolves the descriptor to a compiled shader handle for the hardware
//! path, the software path, and a fixed-function fallback.

use bytemuck::{Pod, Zeroable};

/// Material bit-flags descriptor.
///
/// Bit positions are part of the interface with the permutation service
/// and the binning kernels; they must not be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MaterialFlags(pub u32);

impl MaterialFlags {
    /// Runs a programmable vertex/deform program.
    pub const VERTEX_PROGRAMMABLE: u32 = 1 << 0;
    /// Runs a programmable pixel program.
    pub const PIXEL_PROGRAMMABLE: u32 = 1 << 1;
    /// Two-sided; no backface culling.
    pub const TWO_SIDED: u32 = 1 << 2;
    /// Displacement mapping; needs per-pixel depth resolve.
    pub const DISPLACED: u32 = 1 << 3;
    /// Alpha-masked; per-pixel discard.
    pub const MASKED: u32 = 1 << 4;
    /// Skinned geometry.
    pub const SKINNED: u32 = 1 << 5;
    /// Spline-deformed geometry.
    pub const SPLINE: u32 = 1 << 6;
    /// Casts shadows (participates in depth-only views).
    pub const CAST_SHADOW: u32 = 1 << 7;

    /// Check whether a flag bit is set.
    pub fn contains(&self, bit: u32) -> bool {
        self.0 & bit != 0
    }

    /// Any programmable stage at all.
    pub fn is_programmable(&self) -> bool {
        self.contains(Self::VERTEX_PROGRAMMABLE) || self.contains(Self::PIXEL_PROGRAMMABLE)
    }

    /// Needs per-pixel depth test/discard that the hardware pipeline
    /// cannot resolve inline (masked or displaced surfaces).
    pub fn needs_pixel_depth_resolve(&self) -> bool {
        self.contains(Self::MASKED) || self.contains(Self::DISPLACED)
    }

    /// Index into the permutation table: the subset of bits that select a
    /// distinct compiled variant.
    pub fn permutation_index(&self) -> usize {
        const PERMUTATION_MASK: u32 = MaterialFlags::VERTEX_PROGRAMMABLE
            | MaterialFlags::PIXEL_PROGRAMMABLE
            | MaterialFlags::TWO_SIDED
            | MaterialFlags::DISPLACED
            | MaterialFlags::MASKED;
        (self.0 & PERMUTATION_MASK) as usize
    }

    /// Number of distinct permutation slots per backend.
    pub const PERMUTATION_COUNT: usize = 32;
}

/// Opaque handle to a compiled shader variant, owned by the external
/// permutation service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShaderHandle(pub u32);

impl ShaderHandle {
    /// Handle of the fixed-function fallback variant.
    pub const FIXED_FUNCTION: Self = Self(0);
}

/// GPU material record consumed by the binning kernels (16 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable, Default)]
pub struct MaterialGpu {
    /// Bit-flags descriptor.
    pub flags: u32,
    /// Raster bin this material maps to.
    pub bin_index: u32,
    /// Resolved shader handle for the selected backend.
    pub shader: u32,
    /// Padding.
    pub _pad: u32,
}

/// Which rasterization backend a shader variant targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderTarget {
    /// Hardware vertex/primitive pipeline.
    Hardware,
    /// Compute-kernel software rasterizer.
    Software,
}

/// Lookup table from material descriptors to compiled shader variants.
///
/// One variant set per backend. Variants are registered by the external
/// permutation service at setup; lookups that miss resolve to the
/// fixed-function fallback rather than failing, so an unregistered
/// permutation degrades visually but never aborts a frame.
pub struct ShaderTable {
    hardware: [Option<ShaderHandle>; MaterialFlags::PERMUTATION_COUNT],
    software: [Option<ShaderHandle>; MaterialFlags::PERMUTATION_COUNT],
}

impl ShaderTable {
    /// An empty table; every lookup resolves to the fallback.
    pub fn new() -> Self {
        Self {
            hardware: [None; MaterialFlags::PERMUTATION_COUNT],
            software: [None; MaterialFlags::PERMUTATION_COUNT],
        }
    }

    /// Register a compiled variant for a permutation.
    pub fn register(&mut self, flags: MaterialFlags, target: ShaderTarget, handle: ShaderHandle) {
        let slot = flags.permutation_index();
        match target {
            ShaderTarget::Hardware => self.hardware[slot] = Some(handle),
            ShaderTarget::Software => self.software[slot] = Some(handle),
        }
    }

    /// Resolve a descriptor to a shader handle for the given backend,
    /// falling back to the fixed-function variant.
    pub fn lookup(&self, flags: MaterialFlags, target: ShaderTarget) -> ShaderHandle {
        let slot = flags.permutation_index();
        let entry = match target {
            ShaderTarget::Hardware => self.hardware[slot],
            ShaderTarget::Software => self.software[slot],
        };
        entry.unwrap_or(ShaderHandle::FIXED_FUNCTION)
    }

    /// True if a non-fallback variant exists for the permutation.
    pub fn has_variant(&self, flags: MaterialFlags, target: ShaderTarget) -> bool {
        let slot = flags.permutation_index();
        match target {
            ShaderTarget::Hardware => self.hardware[slot].is_some(),
            ShaderTarget::Software => self.software[slot].is_some(),
        }
    }
}

impl Default for ShaderTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permutation_index_ignores_non_variant_bits() {
        let a = MaterialFlags(MaterialFlags::MASKED | MaterialFlags::CAST_SHADOW);
        let b = MaterialFlags(MaterialFlags::MASKED | MaterialFlags::SKINNED);
        assert_eq!(a.permutation_index(), b.permutation_index());
        assert!(a.permutation_index() < MaterialFlags::PERMUTATION_COUNT);
    }

    #[test]
    fn lookup_miss_falls_back_to_fixed_function() {
        let table = ShaderTable::new();
        let flags = MaterialFlags(MaterialFlags::PIXEL_PROGRAMMABLE);
        assert_eq!(
            table.lookup(flags, ShaderTarget::Hardware),
            ShaderHandle::FIXED_FUNCTION
        );
    }

    #[test]
    fn registered_variant_is_resolved_per_target() {
        let mut table = ShaderTable::new();
        let flags = MaterialFlags(MaterialFlags::MASKED);
        table.register(flags, ShaderTarget::Software, ShaderHandle(7));
        assert_eq!(table.lookup(flags, ShaderTarget::Software), ShaderHandle(7));
        // Hardware slot untouched.
        assert_eq!(
            table.lookup(flags, ShaderTarget::Hardware),
            ShaderHandle::FIXED_FUNCTION
        );
    }

    #[test]
    fn depth_resolve_materials_are_detected() {
        assert!(MaterialFlags(MaterialFlags::MASKED).needs_pixel_depth_resolve());
        assert!(MaterialFlags(MaterialFlags::DISPLACED).needs_pixel_depth_resolve());
        assert!(!MaterialFlags(MaterialFlags::TWO_SIDED).needs_pixel_depth_resolve());
    }
}
