use crate::graph::{BufferUsageRec, PassData};
use crate::resource::{BufferAccessKind, FrameGraphBuffer, PinStorage};
use crate::resource_pool::{BufferTrackingState, ResourcePool, TransientBuffer};
use gpu_core::{self as gpu, Handle, HandlePool};
use std::collections::HashMap;

struct BufferTracking {
    previous_stages: gpu::PipelineStages,
    previous_access: gpu::MemoryAccess,
    has_memory_barrier: bool,
    current_access_kind: BufferAccessKind,
    current_barrier_idx: usize,
}

/// Walks the accumulated buffer usages once and produces the per-pass buffer
/// memory barriers.
///
/// Consecutive read usages merge into the already emitted barrier by OR-ing
/// stages and accesses; any write boundary emits a new barrier whose
/// `previous` side is the tracked prior usage. Stable buffers start from the
/// tracking the pool persisted last frame and store the final state back.
pub(crate) fn build_pass_barriers(
    passes: &mut [PassData],
    buffer_usages: &[BufferUsageRec],
    pin_storage: &HandlePool<PinStorage>,
    resource_pool: &mut ResourcePool,
) -> Vec<gpu::BufferBarrier> {
    let mut memory_barriers: Vec<gpu::BufferBarrier> = Vec::with_capacity(128);

    // Keyed by the pool index: two different pin storages may point to the
    // same buffer after rerouting, the pool index identifies the buffer.
    let mut tracking_map: HashMap<Handle<TransientBuffer>, BufferTracking> = HashMap::new();
    let mut stable_buffers: Vec<Handle<TransientBuffer>> = Vec::new();

    for pass in passes.iter_mut() {
        let first_barrier_idx = memory_barriers.len() as u32;

        let (usage_begin, usage_end) = pass.buffer_usage_range;

        for usage in &buffer_usages[usage_begin as usize..usage_end as usize] {
            let storage = pin_storage
                .get(usage.storage)
                .expect("buffer usage references dead pin storage");

            let buffer_resource_id = storage.transient_buffer;
            debug_assert!(buffer_resource_id.is_some());

            let inserted = !tracking_map.contains_key(&buffer_resource_id);
            let tracking = tracking_map
                .entry(buffer_resource_id)
                .or_insert(BufferTracking {
                    previous_stages: gpu::PipelineStages::empty(),
                    previous_access: gpu::MemoryAccess::empty(),
                    has_memory_barrier: false,
                    current_access_kind: BufferAccessKind::Read,
                    current_barrier_idx: 0,
                });

            if inserted && resource_pool.is_stable(buffer_resource_id) {
                // Stable buffers keep their usage over multiple frames.
                let persisted = resource_pool.fetch_buffer_tracking(buffer_resource_id);
                tracking.previous_stages = persisted.stages;
                tracking.previous_access = persisted.access;
                if let Some(kind) = persisted.access_kind {
                    tracking.current_access_kind = kind;
                }

                stable_buffers.push(buffer_resource_id);
            } else if usage.uploaded_to {
                debug_assert!(
                    !resource_pool.is_stable(buffer_resource_id),
                    "uploading to stable buffers is not supported; it would require a barrier on the first frame"
                );
                debug_assert!(tracking.previous_stages.is_empty());

                tracking.previous_stages = gpu::PipelineStages::TRANSFER;
                tracking.previous_access = gpu::MemoryAccess::ANY_WRITE;
            }

            // A usage with no stages is just forwarding the buffer along.
            if usage.stages.is_empty() {
                continue;
            }

            debug_assert!(!usage.access.is_empty());

            let is_new_usage_read = usage.access_kind == BufferAccessKind::Read;
            let is_current_usage_read =
                tracking.has_memory_barrier && tracking.current_access_kind == BufferAccessKind::Read;

            if is_new_usage_read && is_current_usage_read {
                // Read after read: extend the already emitted barrier.
                let barrier = &mut memory_barriers[tracking.current_barrier_idx];
                barrier.next_pipelines |= usage.stages;
                barrier.next_accesses |= usage.access;
            } else {
                // Pick up the previous access from the last barrier if any,
                // otherwise from the tracked state (none, persisted stable
                // state, or transfer when the buffer was uploaded to).
                if tracking.has_memory_barrier {
                    let barrier = &memory_barriers[tracking.current_barrier_idx];
                    tracking.previous_stages = barrier.next_pipelines;
                    tracking.previous_access = barrier.next_accesses;
                }

                let buffer = unsafe { *(storage.data as *const FrameGraphBuffer) };
                debug_assert!(buffer.handle.is_some());

                tracking.has_memory_barrier = true;
                tracking.current_barrier_idx = memory_barriers.len();
                tracking.current_access_kind = usage.access_kind;

                memory_barriers.push(gpu::BufferBarrier {
                    range: buffer.range(),
                    previous_pipelines: tracking.previous_stages,
                    previous_accesses: tracking.previous_access,
                    next_pipelines: usage.stages,
                    next_accesses: usage.access,
                });
            }
        }

        pass.buffer_barrier_range = (first_barrier_idx, memory_barriers.len() as u32);
    }

    for stable_buffer_id in stable_buffers {
        if let Some(tracking) = tracking_map.get(&stable_buffer_id) {
            if tracking.has_memory_barrier {
                let barrier = &memory_barriers[tracking.current_barrier_idx];
                resource_pool.store_buffer_tracking(
                    stable_buffer_id,
                    BufferTrackingState {
                        stages: barrier.next_pipelines,
                        access: barrier.next_accesses,
                        access_kind: Some(tracking.current_access_kind),
                    },
                );
            }
        }
    }

    memory_barriers
}
