//! GPU resources owned by one culling/rasterization invocation.
//!
//! Everything here is transient per-camera state: packed views, the
//! dispatch argument chains, the render targets and the streaming
//! request arena. Scene data (instances, hierarchy, clusters, geometry
//! pages) is bound from outside and never allocated here.

use crate::candidates::CandidateStore;
use crate::Error;
use crate::queue::QueueStateBuffer;
use crate::scene::StreamingRequestGpu;
use crate::traversal::{CLUSTER_ARG_SLOTS, LEVEL_ARG_STRIDE};
use crate::view::PackedViewGpu;

/// Capacity configuration for one invocation's arenas.
#[derive(Debug, Clone, Copy)]
pub struct ResourceLimits {
    /// Candidate node arena capacity per level.
    pub max_nodes: u32,
    /// Candidate cluster arena capacity.
    pub max_clusters: u32,
    /// Visible-cluster list capacity.
    pub max_visible: u32,
    /// Maximum packed views per invocation.
    pub max_views: u32,
    /// Streaming request arena capacity.
    pub max_streaming_requests: u32,
    /// Deepest hierarchy level.
    pub max_levels: u32,
}

impl ResourceLimits {
    /// Check the limits against the packing formats and arena layouts.
    ///
    /// View indices pack into 24 bits of a candidate record, and the
    /// level argument chain is laid out per hierarchy level, so both
    /// have hard ceilings.
    pub fn validate(&self) -> Result<(), Error> {
        if self.max_nodes == 0 {
            return Err(Error::LimitOutOfRange("max_nodes"));
        }
        if self.max_clusters == 0 {
            return Err(Error::LimitOutOfRange("max_clusters"));
        }
        if self.max_visible == 0 {
            return Err(Error::LimitOutOfRange("max_visible"));
        }
        if self.max_views == 0 || self.max_views > 1 << 24 {
            return Err(Error::LimitOutOfRange("max_views"));
        }
        if self.max_levels == 0 || self.max_levels > 32 {
            return Err(Error::LimitOutOfRange("max_levels"));
        }
        Ok(())
    }
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_nodes: 1 << 20,
            max_clusters: 1 << 21,
            max_visible: 1 << 21,
            max_views: 64,
            max_streaming_requests: 1 << 16,
            max_levels: 12,
        }
    }
}

/// Buffers and targets for one invocation.
pub struct CullResources {
    /// Packed view array ([`PackedViewGpu`] layout).
    pub view_buffer: wgpu::Buffer,
    /// Queue state block (main + post pass counter pairs).
    pub queue_state: QueueStateBuffer,
    /// Candidate and visible-cluster arenas.
    pub candidates: CandidateStore,
    /// Per-level traversal dispatch chain; the trailing slots hold the
    /// main and post cluster-cull args.
    pub level_args: wgpu::Buffer,
    /// Dispatch args sized by the visible count, consumed by binning.
    pub visible_args: wgpu::Buffer,
    /// Streaming request arena plus a leading count word.
    pub streaming_requests: wgpu::Buffer,
    /// R32Uint visibility target.
    pub visibility_texture: wgpu::Texture,
    /// Render-attachment view of the visibility target.
    pub visibility_view: wgpu::TextureView,
    /// Depth attachment shared by the hardware bins and the software
    /// resolve pass.
    pub depth_texture: wgpu::Texture,
    /// Depth attachment view.
    pub depth_view: wgpu::TextureView,
    /// Compute-rasterizer word buffer, one packed depth+payload u64 per
    /// pixel.
    pub depth_payload: wgpu::Buffer,
    /// Target width in pixels.
    pub width: u32,
    /// Target height in pixels.
    pub height: u32,
    /// Limits the arenas were sized with.
    pub limits: ResourceLimits,
}

impl CullResources {
    /// Depth attachment format for the hardware path.
    pub const DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth32Float;

    /// Allocate all arenas and targets.
    pub fn new(device: &wgpu::Device, width: u32, height: u32, limits: ResourceLimits) -> Self {
        let view_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Packed View Buffer"),
            size: limits.max_views as u64 * PackedViewGpu::SIZE as u64,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let queue_state = QueueStateBuffer::new(device);
        let candidates = CandidateStore::new(
            device,
            limits.max_nodes,
            limits.max_clusters,
            limits.max_visible,
        );

        let level_args = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Traversal Level Args Buffer"),
            size: (limits.max_levels as u64 + CLUSTER_ARG_SLOTS) * LEVEL_ARG_STRIDE,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::INDIRECT
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let visible_args = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Visible Dispatch Args Buffer"),
            size: LEVEL_ARG_STRIDE,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::INDIRECT
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        // Leading count word, then the request records.
        let streaming_requests = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Streaming Request Buffer"),
            size: 16 + limits.max_streaming_requests as u64
                * std::mem::size_of::<StreamingRequestGpu>() as u64,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });

        let (visibility_texture, visibility_view) = Self::create_visibility(device, width, height);
        let (depth_texture, depth_view) = Self::create_depth(device, width, height);

        let depth_payload = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Depth Payload Buffer"),
            size: width as u64 * height as u64 * 8,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        Self {
            view_buffer,
            queue_state,
            candidates,
            level_args,
            visible_args,
            streaming_requests,
            visibility_texture,
            visibility_view,
            depth_texture,
            depth_view,
            depth_payload,
            width,
            height,
            limits,
        }
    }

    fn create_visibility(
        device: &wgpu::Device,
        width: u32,
        height: u32,
    ) -> (wgpu::Texture, wgpu::TextureView) {
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Visibility Texture"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::R32Uint,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        (texture, view)
    }

    fn create_depth(
        device: &wgpu::Device,
        width: u32,
        height: u32,
    ) -> (wgpu::Texture, wgpu::TextureView) {
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Raster Depth Texture"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: Self::DEPTH_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        (texture, view)
    }

    /// Recreate the targets at a new resolution. Arenas are size-stable
    /// and survive; bind groups referencing the old targets must be
    /// rebuilt by the caller.
    pub fn resize(&mut self, device: &wgpu::Device, width: u32, height: u32) -> bool {
        if width == self.width && height == self.height {
            return false;
        }
        self.width = width;
        self.height = height;

        let (visibility_texture, visibility_view) = Self::create_visibility(device, width, height);
        self.visibility_texture = visibility_texture;
        self.visibility_view = visibility_view;

        let (depth_texture, depth_view) = Self::create_depth(device, width, height);
        self.depth_texture = depth_texture;
        self.depth_view = depth_view;

        self.depth_payload = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Depth Payload Buffer"),
            size: width as u64 * height as u64 * 8,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        true
    }

    /// Reset the per-invocation counters and argument chains.
    ///
    /// Candidate and visible arenas are left as-is: their contents are
    /// addressed only through the counters, so stale records past the
    /// reset counters are unreachable.
    pub fn reset(&self, queue: &wgpu::Queue) {
        self.queue_state.reset(queue);

        // Level args: zero dispatch dims, so an unwritten level costs a
        // no-op dispatch.
        let chain_len =
            (self.limits.max_levels as u64 + CLUSTER_ARG_SLOTS) as usize * LEVEL_ARG_STRIDE as usize;
        let zeroes = vec![0u8; chain_len];
        queue.write_buffer(&self.level_args, 0, &zeroes);
        queue.write_buffer(&self.visible_args, 0, &zeroes[..LEVEL_ARG_STRIDE as usize]);

        // Streaming request count word.
        queue.write_buffer(&self.streaming_requests, 0, bytemuck::cast_slice(&[0u32; 4]));
    }

    /// Clear the packed depth+payload words to zero, the farthest value
    /// in the inverted scheme the compute rasterizer resolves with.
    pub fn clear_depth_payload(&self, encoder: &mut wgpu::CommandEncoder) {
        encoder.clear_buffer(&self.depth_payload, 0, None);
    }

    /// Pack and upload a view array; returns the number uploaded.
    pub fn upload_views(&self, queue: &wgpu::Queue, views: &[PackedViewGpu]) -> u32 {
        let count = (views.len() as u32).min(self.limits.max_views);
        if count > 0 {
            queue.write_buffer(
                &self.view_buffer,
                0,
                bytemuck::cast_slice(&views[..count as usize]),
            );
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_limits_are_nonzero() {
        let limits = ResourceLimits::default();
        assert!(limits.max_nodes > 0);
        assert!(limits.max_clusters >= limits.max_nodes);
        assert!(limits.max_views > 0);
        assert!(limits.max_levels > 0);
        assert!(limits.validate().is_ok());
    }

    #[test]
    fn out_of_range_limits_are_rejected() {
        let zero_views = ResourceLimits {
            max_views: 0,
            ..ResourceLimits::default()
        };
        assert!(matches!(
            zero_views.validate(),
            Err(Error::LimitOutOfRange("max_views"))
        ));

        // View indices pack into 24 bits of a candidate record.
        let too_many_views = ResourceLimits {
            max_views: (1 << 24) + 1,
            ..ResourceLimits::default()
        };
        assert!(too_many_views.validate().is_err());

        let deep = ResourceLimits {
            max_levels: 33,
            ..ResourceLimits::default()
        };
        assert!(matches!(
            deep.validate(),
            Err(Error::LimitOutOfRange("max_levels"))
        ));
    }
}
