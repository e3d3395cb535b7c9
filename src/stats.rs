//! Frame statistics read back from the queue state block.
//!
//! The counters are copied into a staging ring after the post pass and
//! mapped a frame or two later, so reading them never stalls the GPU.
//! Numbers are therefore always a little stale; they are for budgeting
//! and diagnostics, not for driving per-frame decisions.

use std::sync::mpsc;

use crate::queue::{QueuePassStateGpu, QueueStateGpu};

/// Aggregated counters for one completed invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    /// Candidate nodes processed across both passes.
    pub nodes_processed: u32,
    /// Candidate clusters processed across both passes.
    pub clusters_processed: u32,
    /// Clusters in the final visible list.
    pub visible_clusters: u32,
    /// Clusters deferred to the post pass by the main pass.
    pub occluded_clusters: u32,
    /// Appends dropped because an arena was full.
    pub overflows: u32,
}

impl FrameStats {
    fn accumulate_pass(&mut self, pass: &QueuePassStateGpu) {
        self.nodes_processed += pass.node_alloc;
        self.clusters_processed += pass.cluster_alloc;
        self.visible_clusters += pass.visible_count;
        self.overflows += pass.overflow_count;
    }

    /// Fold the raw queue state into frame totals.
    pub fn from_queue_state(state: &QueueStateGpu) -> Self {
        let mut stats = Self::default();
        stats.accumulate_pass(&state.main);
        stats.accumulate_pass(&state.post);
        // Only the main pass defers work; the post pass's occluded
        // counter stays zero by construction.
        stats.occluded_clusters = state.main.occluded_count;
        stats
    }

    /// True when any arena dropped work this frame; callers should grow
    /// their [`crate::resources::ResourceLimits`].
    pub fn saturated(&self) -> bool {
        self.overflows > 0
    }
}

struct StagingSlot {
    buffer: wgpu::Buffer,
    in_flight: bool,
    receiver: Option<mpsc::Receiver<Result<(), wgpu::BufferAsyncError>>>,
}

/// Double-buffered staging ring for asynchronous counter readback.
pub struct StatsReadback {
    slots: [StagingSlot; 2],
    write_slot: usize,
    latest: FrameStats,
}

impl StatsReadback {
    /// Create the staging ring.
    pub fn new(device: &wgpu::Device) -> Self {
        let make = |label: &str| StagingSlot {
            buffer: device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size: QueueStateGpu::SIZE as u64,
                usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            }),
            in_flight: false,
            receiver: None,
        };
        Self {
            slots: [make("Stats Staging Buffer 0"), make("Stats Staging Buffer 1")],
            write_slot: 0,
            latest: FrameStats::default(),
        }
    }

    /// Record the end-of-frame counter copy. Call once per invocation,
    /// after the last pass that touches the queue state. Returns false
    /// when both slots are still in flight and this frame is skipped.
    pub fn record_copy(
        &mut self,
        encoder: &mut wgpu::CommandEncoder,
        queue_state: &wgpu::Buffer,
    ) -> bool {
        let slot = &mut self.slots[self.write_slot];
        if slot.in_flight {
            return false;
        }
        encoder.copy_buffer_to_buffer(
            queue_state,
            0,
            &slot.buffer,
            0,
            QueueStateGpu::SIZE as u64,
        );
        slot.in_flight = true;
        self.write_slot ^= 1;
        true
    }

    /// Map and fold the oldest submitted copy, if the GPU has finished
    /// it. Returns the freshest stats available; never blocks.
    pub fn poll(&mut self, device: &wgpu::Device) -> FrameStats {
        // The write slot is the older of the two.
        let index = self.write_slot;
        let slot = &mut self.slots[index];
        if !slot.in_flight {
            return self.latest;
        }

        if slot.receiver.is_none() {
            let (sender, receiver) = mpsc::channel();
            slot.buffer
                .slice(..)
                .map_async(wgpu::MapMode::Read, move |result| {
                    let _ = sender.send(result);
                });
            slot.receiver = Some(receiver);
        }
        device.poll(wgpu::Maintain::Poll);

        let done = matches!(
            slot.receiver.as_ref().map(|r| r.try_recv()),
            Some(Ok(Ok(())))
        );
        if done {
            {
                let mapped = slot.buffer.slice(..).get_mapped_range();
                let state: QueueStateGpu = *bytemuck::from_bytes(&mapped);
                self.latest = FrameStats::from_queue_state(&state);
            }
            slot.buffer.unmap();
            slot.in_flight = false;
            slot.receiver = None;
        }
        self.latest
    }

    /// Most recently collected stats without touching the device.
    pub fn latest(&self) -> FrameStats {
        self.latest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_fold_both_passes() {
        let mut state = QueueStateGpu::default();
        state.main.cluster_alloc = 100;
        state.main.visible_count = 60;
        state.main.occluded_count = 40;
        state.post.cluster_alloc = 40;
        state.post.visible_count = 10;
        state.post.overflow_count = 2;

        let stats = FrameStats::from_queue_state(&state);
        assert_eq!(stats.clusters_processed, 140);
        assert_eq!(stats.visible_clusters, 70);
        assert_eq!(stats.occluded_clusters, 40);
        assert_eq!(stats.overflows, 2);
        assert!(stats.saturated());
    }

    #[test]
    fn empty_state_is_not_saturated() {
        let stats = FrameStats::from_queue_state(&QueueStateGpu::default());
        assert_eq!(stats, FrameStats::default());
        assert!(!stats.saturated());
    }
}
