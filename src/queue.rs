//! Work-queue state shared by the culling passes.
//!
//! Every queue is a pair of monotonically advancing counters,
//! `(allocated, consumed)`, bumped with atomic adds on the GPU. Counters
//! are scoped to one invocation's buffer and reset at the start of each
//! use; nothing here is a process-wide static. Allocation past a queue's
//! capacity clamps: the write is dropped, an overflow counter is bumped,
//! and the stored count never wraps.

use bytemuck::{Pod, Zeroable};

/// Counter block for one culling pass (48 bytes).
///
/// Layout matches `QueuePassState` in the WGSL kernels.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable, Default)]
pub struct QueuePassStateGpu {
    /// Candidate nodes allocated so far.
    pub node_alloc: u32,
    /// Candidate nodes consumed by traversal steps.
    pub node_consumed: u32,
    /// Candidate clusters allocated so far.
    pub cluster_alloc: u32,
    /// Candidate clusters consumed by the cluster-cull step.
    pub cluster_consumed: u32,
    /// Visible-cluster entries written.
    pub visible_count: u32,
    /// Candidates deferred to the post pass (occlusion-only failures).
    pub occluded_count: u32,
    /// Writes dropped because a queue was full.
    pub overflow_count: u32,
    /// Padding to a 16-byte multiple.
    pub _pad: [u32; 5],
}

impl QueuePassStateGpu {
    /// Size in bytes, asserted by tests.
    pub const SIZE: usize = 48;
}

/// Full queue-state block: main pass followed by post pass (96 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable, Default)]
pub struct QueueStateGpu {
    /// Main-pass counters.
    pub main: QueuePassStateGpu,
    /// Post-pass counters.
    pub post: QueuePassStateGpu,
}

impl QueueStateGpu {
    /// Size in bytes, asserted by tests.
    pub const SIZE: usize = 96;
}

/// Which half of the queue-state block a pass operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePass {
    /// First cull pass, tested against the previous frame's pyramid.
    Main,
    /// Occlusion retest pass over the occluded list.
    Post,
}

impl QueuePass {
    /// Byte offset of this pass's counter block inside the GPU buffer.
    pub fn byte_offset(&self) -> u64 {
        match self {
            QueuePass::Main => 0,
            QueuePass::Post => QueuePassStateGpu::SIZE as u64,
        }
    }
}

/// CPU mirror of one queue's `(allocated, consumed)` pair with the same
/// clamp semantics as the kernels. Used for conservative dispatch bounds
/// and for tests of the overflow behavior.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueCounters {
    /// Items allocated so far, clamped to capacity.
    pub allocated: u32,
    /// Items consumed so far.
    pub consumed: u32,
    /// Items dropped past capacity.
    pub overflow: u32,
    /// Queue capacity.
    pub capacity: u32,
}

impl QueueCounters {
    /// Create an empty queue with the given capacity.
    pub fn with_capacity(capacity: u32) -> Self {
        Self {
            capacity,
            ..Default::default()
        }
    }

    /// Reserve `count` slots. Returns the range actually granted; the
    /// portion past capacity is dropped and counted, never written.
    pub fn allocate(&mut self, count: u32) -> std::ops::Range<u32> {
        let start = self.allocated;
        let granted = count.min(self.capacity.saturating_sub(start));
        self.allocated = start + granted;
        self.overflow += count - granted;
        start..start + granted
    }

    /// Consume up to `count` items. Consumption never overtakes allocation.
    pub fn consume(&mut self, count: u32) -> u32 {
        let granted = count.min(self.allocated - self.consumed);
        self.consumed += granted;
        granted
    }

    /// Items allocated but not yet consumed.
    pub fn pending(&self) -> u32 {
        self.allocated - self.consumed
    }
}

/// GPU buffer holding the queue-state block, plus reset plumbing.
pub struct QueueStateBuffer {
    buffer: wgpu::Buffer,
}

impl QueueStateBuffer {
    /// Create the queue-state buffer.
    pub fn new(device: &wgpu::Device) -> Self {
        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Queue State Buffer"),
            size: QueueStateGpu::SIZE as u64,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        Self { buffer }
    }

    /// Reset all counters for a new invocation.
    pub fn reset(&self, queue: &wgpu::Queue) {
        queue.write_buffer(
            &self.buffer,
            0,
            bytemuck::cast_slice(&[QueueStateGpu::default()]),
        );
    }

    /// The underlying buffer, bound by every culling pass.
    pub fn buffer(&self) -> &wgpu::Buffer {
        &self.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_state_sizes() {
        assert_eq!(
            std::mem::size_of::<QueuePassStateGpu>(),
            QueuePassStateGpu::SIZE
        );
        assert_eq!(std::mem::size_of::<QueueStateGpu>(), QueueStateGpu::SIZE);
    }

    #[test]
    fn allocate_within_capacity() {
        let mut counters = QueueCounters::with_capacity(100);
        assert_eq!(counters.allocate(30), 0..30);
        assert_eq!(counters.allocate(30), 30..60);
        assert_eq!(counters.overflow, 0);
    }

    #[test]
    fn allocate_past_capacity_clamps_and_counts() {
        let mut counters = QueueCounters::with_capacity(100);
        assert_eq!(counters.allocate(80), 0..80);
        // 50 requested, 20 granted, 30 dropped.
        assert_eq!(counters.allocate(50), 80..100);
        assert_eq!(counters.allocated, 100);
        assert_eq!(counters.overflow, 30);
        // Fully saturated: empty range, all dropped.
        assert_eq!(counters.allocate(10), 100..100);
        assert_eq!(counters.overflow, 40);
    }

    #[test]
    fn consumed_never_exceeds_allocated() {
        let mut counters = QueueCounters::with_capacity(100);
        counters.allocate(40);
        assert_eq!(counters.consume(60), 40);
        assert_eq!(counters.consumed, 40);
        assert!(counters.consumed <= counters.allocated);
        assert_eq!(counters.pending(), 0);
    }

    #[test]
    fn post_pass_offset_points_past_main_block() {
        assert_eq!(QueuePass::Main.byte_offset(), 0);
        assert_eq!(QueuePass::Post.byte_offset(), 48);
    }
}
