use crate::resource::{BufferAccessKind, FrameGraphBuffer, FrameGraphTexture};
use gpu_core::{self as gpu, Device, Handle};
use std::collections::HashMap;

/// Marker types for transient resource handles handed out during build.
pub enum TransientTexture {}
pub enum TransientBuffer {}

/// Inclusive pass range a transient is alive for.
pub type LifetimeRange = (u32, u32);

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct BufferTrackingState {
    pub stages: gpu::PipelineStages,
    pub access: gpu::MemoryAccess,
    pub access_kind: Option<BufferAccessKind>,
}

#[derive(Clone, Copy, Debug)]
pub struct TextureTrackingState {
    pub stages: gpu::PipelineStages,
    pub state: gpu::ImageState,
}

impl Default for TextureTrackingState {
    fn default() -> Self {
        Self {
            stages: gpu::PipelineStages::TOP_OF_PIPE,
            state: gpu::ImageState::Undefined,
        }
    }
}

struct TextureEntry {
    desc: gpu::ImageDesc,
    lifetime: LifetimeRange,
    stable_id: u32,
    external: Option<Handle<gpu::Image>>,
    resolved: Handle<gpu::Image>,
}

struct BufferEntry {
    size: u64,
    usage: gpu::BufferUsage,
    lifetime: LifetimeRange,
    stable_id: u32,
    resolved: gpu::BufferRange,
}

struct StableTexture {
    image: Handle<gpu::Image>,
    desc: gpu::ImageDesc,
    frames_alive: u32,
    seen: bool,
    tracking: TextureTrackingState,
}

struct StableBuffer {
    buffer: Handle<gpu::Buffer>,
    size: u64,
    usage: gpu::BufferUsage,
    frames_alive: u32,
    seen: bool,
    tracking: BufferTrackingState,
}

struct FrameImage {
    image: Handle<gpu::Image>,
    desc: gpu::ImageDesc,
    last_use: u32,
}

struct FrameBuffer {
    buffer: Handle<gpu::Buffer>,
    size: u64,
    usage: gpu::BufferUsage,
    last_use: u32,
}

/// Allocates and aliases transient buffers and images declared during the
/// build phase, and tracks the cross-frame state of stable resources.
///
/// Non-stable transients are materialised at `end_build` with a greedy pass
/// over first-use order: each transient reuses the smallest live allocation
/// whose last use precedes its first use and whose usage flags are a
/// superset of the request, otherwise a fresh allocation is made. Stable ids
/// bypass aliasing and pin dedicated allocations that survive frames.
#[derive(Default)]
pub struct ResourcePool {
    textures: Vec<TextureEntry>,
    buffers: Vec<BufferEntry>,

    stable_textures: HashMap<u32, StableTexture>,
    stable_buffers: HashMap<u32, StableBuffer>,

    /// Frames-alive counters for externally owned images.
    external_frames: HashMap<Handle<gpu::Image>, (u32, bool)>,

    frame_images: Vec<FrameImage>,
    frame_buffers: Vec<FrameBuffer>,
}

fn texture_handle(index: usize) -> Handle<TransientTexture> {
    Handle::from_parts(index as u32 + 1, 0)
}

fn buffer_handle(index: usize) -> Handle<TransientBuffer> {
    Handle::from_parts(index as u32 + 1, 0)
}

fn entry_index<T: ?Sized>(handle: Handle<T>) -> usize {
    debug_assert!(handle.is_some());
    handle.index() as usize - 1
}

impl ResourcePool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin_build(&mut self) {
        self.textures.clear();
        self.buffers.clear();

        for stable in self.stable_textures.values_mut() {
            stable.seen = false;
        }
        for stable in self.stable_buffers.values_mut() {
            stable.seen = false;
        }
        for external in self.external_frames.values_mut() {
            external.1 = false;
        }
    }

    pub fn add_transient_texture(
        &mut self,
        desc: &gpu::ImageDesc,
        lifetime: LifetimeRange,
        stable_id: u32,
    ) -> Handle<TransientTexture> {
        self.textures.push(TextureEntry {
            desc: desc.clone(),
            lifetime,
            stable_id,
            external: None,
            resolved: Handle::NONE,
        });

        texture_handle(self.textures.len() - 1)
    }

    pub fn add_transient_texture_usage(&mut self, handle: Handle<TransientTexture>, usage: gpu::ImageUsage) {
        let entry = &mut self.textures[entry_index(handle)];
        entry.desc.usage |= usage;
    }

    pub fn add_external_texture(&mut self, image: Handle<gpu::Image>, desc: &gpu::ImageDesc) -> Handle<TransientTexture> {
        let counter = self.external_frames.entry(image).or_insert((0, false));
        counter.0 += 1;
        counter.1 = true;

        self.textures.push(TextureEntry {
            desc: desc.clone(),
            lifetime: (0, 0),
            stable_id: 0,
            external: Some(image),
            resolved: image,
        });

        texture_handle(self.textures.len() - 1)
    }

    pub fn add_transient_buffer(
        &mut self,
        size: u64,
        usage: gpu::BufferUsage,
        lifetime: LifetimeRange,
        stable_id: u32,
    ) -> Handle<TransientBuffer> {
        self.buffers.push(BufferEntry {
            size,
            usage,
            lifetime,
            stable_id,
            resolved: gpu::BufferRange::default(),
        });

        buffer_handle(self.buffers.len() - 1)
    }

    pub fn add_transient_buffer_usage(&mut self, handle: Handle<TransientBuffer>, usage: gpu::BufferUsage) {
        let entry = &mut self.buffers[entry_index(handle)];
        entry.usage |= usage;
    }

    pub fn extend_texture_lifetime(&mut self, handle: Handle<TransientTexture>, pass_index: u32) {
        let entry = &mut self.textures[entry_index(handle)];
        entry.lifetime.1 = entry.lifetime.1.max(pass_index);
    }

    pub fn extend_buffer_lifetime(&mut self, handle: Handle<TransientBuffer>, pass_index: u32) {
        let entry = &mut self.buffers[entry_index(handle)];
        entry.lifetime.1 = entry.lifetime.1.max(pass_index);
    }

    pub fn is_stable(&self, handle: Handle<TransientBuffer>) -> bool {
        self.buffers[entry_index(handle)].stable_id != 0
    }

    pub fn is_stable_texture(&self, handle: Handle<TransientTexture>) -> bool {
        self.textures[entry_index(handle)].stable_id != 0
    }

    pub fn fetch_buffer_tracking(&self, handle: Handle<TransientBuffer>) -> BufferTrackingState {
        let stable_id = self.buffers[entry_index(handle)].stable_id;
        self.stable_buffers
            .get(&stable_id)
            .map(|stable| stable.tracking)
            .unwrap_or_default()
    }

    pub fn store_buffer_tracking(&mut self, handle: Handle<TransientBuffer>, tracking: BufferTrackingState) {
        let stable_id = self.buffers[entry_index(handle)].stable_id;
        if let Some(stable) = self.stable_buffers.get_mut(&stable_id) {
            stable.tracking = tracking;
        }
    }

    pub fn fetch_texture_tracking(&self, handle: Handle<TransientTexture>) -> TextureTrackingState {
        let stable_id = self.textures[entry_index(handle)].stable_id;
        self.stable_textures
            .get(&stable_id)
            .map(|stable| stable.tracking)
            .unwrap_or_default()
    }

    pub fn store_texture_tracking(&mut self, handle: Handle<TransientTexture>, tracking: TextureTrackingState) {
        let stable_id = self.textures[entry_index(handle)].stable_id;
        if let Some(stable) = self.stable_textures.get_mut(&stable_id) {
            stable.tracking = tracking;
        }
    }

    pub fn get_initializer(&self, handle: Handle<TransientTexture>) -> &gpu::ImageDesc {
        &self.textures[entry_index(handle)].desc
    }

    pub fn get_transient_texture(&self, handle: Handle<TransientTexture>) -> FrameGraphTexture {
        let entry = &self.textures[entry_index(handle)];
        FrameGraphTexture {
            handle: entry.resolved,
            descriptor: entry.desc.clone(),
        }
    }

    pub fn get_transient_buffer(&self, handle: Handle<TransientBuffer>) -> FrameGraphBuffer {
        let entry = &self.buffers[entry_index(handle)];
        FrameGraphBuffer {
            handle: entry.resolved.buffer,
            offset: entry.resolved.offset,
            size: entry.size,
        }
    }

    pub fn get_texture_frames_alive(&self, handle: Handle<TransientTexture>) -> u32 {
        let entry = &self.textures[entry_index(handle)];

        if let Some(image) = entry.external {
            return self.external_frames.get(&image).map(|c| c.0 - 1).unwrap_or(0);
        }

        self.stable_textures
            .get(&entry.stable_id)
            .map(|stable| stable.frames_alive)
            .unwrap_or(0)
    }

    pub fn get_buffer_frames_alive(&self, handle: Handle<TransientBuffer>) -> u32 {
        let entry = &self.buffers[entry_index(handle)];
        self.stable_buffers
            .get(&entry.stable_id)
            .map(|stable| stable.frames_alive)
            .unwrap_or(0)
    }

    /// Number of distinct live allocations materialised for this frame,
    /// aliased transients included once.
    pub fn live_image_allocations(&self) -> usize {
        self.frame_images.len()
    }

    pub fn live_buffer_allocations(&self) -> usize {
        self.frame_buffers.len()
    }

    pub fn end_build(&mut self, device: &dyn Device) {
        let submit_index = device.get_submit_index();

        // Last frame's non-stable allocations are recycled through deferred
        // destruction; aliasing is recomputed from scratch every frame.
        for image in self.frame_images.drain(..) {
            device.destroy_deferred(gpu::GpuObject::Image(image.image), submit_index);
        }
        for buffer in self.frame_buffers.drain(..) {
            device.destroy_deferred(gpu::GpuObject::Buffer(buffer.buffer), submit_index);
        }

        self.allocate_textures(device);
        self.allocate_buffers(device);

        // Retire stable resources whose ids were not seen this frame.
        self.stable_textures.retain(|_, stable| {
            if !stable.seen {
                device.destroy_deferred(gpu::GpuObject::Image(stable.image), submit_index);
            }
            stable.seen
        });
        self.stable_buffers.retain(|_, stable| {
            if !stable.seen {
                device.destroy_deferred(gpu::GpuObject::Buffer(stable.buffer), submit_index);
            }
            stable.seen
        });
        self.external_frames.retain(|_, counter| counter.1);
    }

    fn allocate_textures(&mut self, device: &dyn Device) {
        let mut order: Vec<usize> = (0..self.textures.len())
            .filter(|&i| self.textures[i].external.is_none())
            .collect();
        order.sort_by_key(|&i| self.textures[i].lifetime.0);

        for index in order {
            let entry = &mut self.textures[index];

            if entry.stable_id != 0 {
                let stable = self.stable_textures.entry(entry.stable_id);
                let stable = match stable {
                    std::collections::hash_map::Entry::Occupied(mut occupied) => {
                        if occupied.get().desc != entry.desc {
                            let old = occupied.get().image;
                            device.destroy_deferred(gpu::GpuObject::Image(old), device.get_submit_index());
                            match device.create_image(&entry.desc) {
                                Ok(image) => {
                                    let slot = occupied.get_mut();
                                    slot.image = image;
                                    slot.desc = entry.desc.clone();
                                    slot.frames_alive = 0;
                                    slot.tracking = TextureTrackingState::default();
                                }
                                Err(err) => {
                                    log::error!("stable image allocation failed: {:#}", err);
                                    occupied.get_mut().image = Handle::NONE;
                                }
                            }
                        } else {
                            let slot = occupied.get_mut();
                            slot.frames_alive += 1;
                        }
                        occupied.into_mut()
                    }
                    std::collections::hash_map::Entry::Vacant(vacant) => {
                        let image = match device.create_image(&entry.desc) {
                            Ok(image) => image,
                            Err(err) => {
                                log::error!("stable image allocation failed: {:#}", err);
                                Handle::NONE
                            }
                        };
                        vacant.insert(StableTexture {
                            image,
                            desc: entry.desc.clone(),
                            frames_alive: 0,
                            seen: false,
                            tracking: TextureTrackingState::default(),
                        })
                    }
                };

                stable.seen = true;
                entry.resolved = stable.image;
                continue;
            }

            let (first_use, last_use) = entry.lifetime;

            let reuse = self.frame_images.iter().position(|allocation| {
                allocation.last_use < first_use
                    && allocation.desc.format == entry.desc.format
                    && allocation.desc.width == entry.desc.width
                    && allocation.desc.height == entry.desc.height
                    && allocation.desc.depth == entry.desc.depth
                    && allocation.desc.usage.contains(entry.desc.usage)
            });

            match reuse {
                Some(found) => {
                    let allocation = &mut self.frame_images[found];
                    allocation.last_use = last_use;
                    entry.resolved = allocation.image;
                }
                None => match device.create_image(&entry.desc) {
                    Ok(image) => {
                        self.frame_images.push(FrameImage {
                            image,
                            desc: entry.desc.clone(),
                            last_use,
                        });
                        entry.resolved = image;
                    }
                    Err(err) => {
                        log::error!("transient image allocation failed: {:#}", err);
                    }
                },
            }
        }
    }

    fn allocate_buffers(&mut self, device: &dyn Device) {
        let mut order: Vec<usize> = (0..self.buffers.len()).collect();
        order.sort_by_key(|&i| self.buffers[i].lifetime.0);

        for index in order {
            let entry = &mut self.buffers[index];

            if entry.stable_id != 0 {
                let stable = match self.stable_buffers.entry(entry.stable_id) {
                    std::collections::hash_map::Entry::Occupied(mut occupied) => {
                        let needs_recreate =
                            occupied.get().size < entry.size || !occupied.get().usage.contains(entry.usage);
                        if needs_recreate {
                            let old = occupied.get().buffer;
                            device.destroy_deferred(gpu::GpuObject::Buffer(old), device.get_submit_index());

                            let merged_usage = occupied.get().usage | entry.usage;
                            match device.create_buffer(&gpu::BufferDesc {
                                size: entry.size,
                                usage: merged_usage,
                                memory_usage: gpu::MemoryUsage::GpuOnly,
                                debug_label: "fg stable buffer",
                            }) {
                                Ok(buffer) => {
                                    let slot = occupied.get_mut();
                                    slot.buffer = buffer;
                                    slot.size = entry.size;
                                    slot.usage = merged_usage;
                                    slot.frames_alive = 0;
                                    slot.tracking = BufferTrackingState::default();
                                }
                                Err(err) => {
                                    log::error!("stable buffer allocation failed: {:#}", err);
                                    occupied.get_mut().buffer = Handle::NONE;
                                }
                            }
                        } else {
                            occupied.get_mut().frames_alive += 1;
                        }
                        occupied.into_mut()
                    }
                    std::collections::hash_map::Entry::Vacant(vacant) => {
                        let buffer = match device.create_buffer(&gpu::BufferDesc {
                            size: entry.size,
                            usage: entry.usage,
                            memory_usage: gpu::MemoryUsage::GpuOnly,
                            debug_label: "fg stable buffer",
                        }) {
                            Ok(buffer) => buffer,
                            Err(err) => {
                                log::error!("stable buffer allocation failed: {:#}", err);
                                Handle::NONE
                            }
                        };
                        vacant.insert(StableBuffer {
                            buffer,
                            size: entry.size,
                            usage: entry.usage,
                            frames_alive: 0,
                            seen: false,
                            tracking: BufferTrackingState::default(),
                        })
                    }
                };

                stable.seen = true;
                entry.resolved = gpu::BufferRange {
                    buffer: stable.buffer,
                    offset: 0,
                    size: entry.size,
                };
                continue;
            }

            let (first_use, last_use) = entry.lifetime;

            let reuse = self.frame_buffers.iter().position(|allocation| {
                allocation.last_use < first_use
                    && allocation.size >= entry.size
                    && allocation.usage.contains(entry.usage)
            });

            match reuse {
                Some(found) => {
                    let allocation = &mut self.frame_buffers[found];
                    allocation.last_use = last_use;
                    entry.resolved = gpu::BufferRange {
                        buffer: allocation.buffer,
                        offset: 0,
                        size: entry.size,
                    };
                }
                None => match device.create_buffer(&gpu::BufferDesc {
                    size: entry.size,
                    usage: entry.usage,
                    memory_usage: gpu::MemoryUsage::GpuOnly,
                    debug_label: "fg transient buffer",
                }) {
                    Ok(buffer) => {
                        self.frame_buffers.push(FrameBuffer {
                            buffer,
                            size: entry.size,
                            usage: entry.usage,
                            last_use,
                        });
                        entry.resolved = gpu::BufferRange {
                            buffer,
                            offset: 0,
                            size: entry.size,
                        };
                    }
                    Err(err) => {
                        log::error!("transient buffer allocation failed: {:#}", err);
                    }
                },
            }
        }
    }

    pub fn shutdown(&mut self, device: &dyn Device) {
        let submit_index = device.get_submit_index();

        for image in self.frame_images.drain(..) {
            device.destroy_deferred(gpu::GpuObject::Image(image.image), submit_index);
        }
        for buffer in self.frame_buffers.drain(..) {
            device.destroy_deferred(gpu::GpuObject::Buffer(buffer.buffer), submit_index);
        }
        for (_, stable) in self.stable_textures.drain() {
            device.destroy_deferred(gpu::GpuObject::Image(stable.image), submit_index);
        }
        for (_, stable) in self.stable_buffers.drain() {
            device.destroy_deferred(gpu::GpuObject::Buffer(stable.buffer), submit_index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpu_core::mock::MockDevice;

    fn desc(width: u32) -> gpu::ImageDesc {
        gpu::ImageDesc {
            format: gpu::Format::Rgba8Unorm,
            width,
            height: 64,
            usage: gpu::ImageUsage::STORAGE,
            ..Default::default()
        }
    }

    #[test]
    fn disjoint_lifetimes_alias() {
        let device = MockDevice::new();
        let mut pool = ResourcePool::new();

        pool.begin_build();
        pool.add_transient_texture(&desc(64), (0, 1), 0);
        pool.add_transient_texture(&desc(64), (2, 3), 0);
        pool.end_build(&device);

        assert_eq!(pool.live_image_allocations(), 1);
        assert_eq!(device.image_creation_count(), 1);
    }

    #[test]
    fn overlapping_lifetimes_do_not_alias() {
        let device = MockDevice::new();
        let mut pool = ResourcePool::new();

        pool.begin_build();
        pool.add_transient_texture(&desc(64), (0, 2), 0);
        pool.add_transient_texture(&desc(64), (1, 3), 0);
        pool.end_build(&device);

        assert_eq!(pool.live_image_allocations(), 2);
    }

    #[test]
    fn usage_superset_required_for_aliasing() {
        let device = MockDevice::new();
        let mut pool = ResourcePool::new();

        pool.begin_build();
        let first = pool.add_transient_texture(&desc(64), (0, 0), 0);
        pool.add_transient_texture_usage(first, gpu::ImageUsage::TRANSFER_SOURCE);

        let mut wants_more = desc(64);
        wants_more.usage |= gpu::ImageUsage::COLOR_ATTACHMENT;
        pool.add_transient_texture(&wants_more, (1, 1), 0);
        pool.end_build(&device);

        assert_eq!(pool.live_image_allocations(), 2);
    }

    #[test]
    fn stable_textures_survive_frames() {
        let device = MockDevice::new();
        let mut pool = ResourcePool::new();

        pool.begin_build();
        let a = pool.add_transient_texture(&desc(64), (0, 0), 42);
        pool.end_build(&device);
        let first = pool.get_transient_texture(a).handle;

        device.end_frame();

        pool.begin_build();
        let b = pool.add_transient_texture(&desc(64), (0, 0), 42);
        pool.end_build(&device);
        let second = pool.get_transient_texture(b).handle;

        assert_eq!(first, second);
        assert_eq!(pool.get_texture_frames_alive(b), 1);
    }

    #[test]
    fn unseen_stable_ids_are_retired() {
        let device = MockDevice::new();
        let mut pool = ResourcePool::new();

        pool.begin_build();
        pool.add_transient_texture(&desc(64), (0, 0), 7);
        pool.end_build(&device);

        pool.begin_build();
        pool.end_build(&device);

        assert!(device.pending_deferred_count() > 0);
    }

    #[test]
    fn buffer_tracking_round_trips() {
        let device = MockDevice::new();
        let mut pool = ResourcePool::new();

        pool.begin_build();
        let b = pool.add_transient_buffer(256, gpu::BufferUsage::STORAGE, (0, 0), 3);
        pool.end_build(&device);

        let tracking = BufferTrackingState {
            stages: gpu::PipelineStages::COMPUTE,
            access: gpu::MemoryAccess::ANY_WRITE,
            access_kind: Some(BufferAccessKind::Write),
        };
        pool.store_buffer_tracking(b, tracking);

        pool.begin_build();
        let b2 = pool.add_transient_buffer(256, gpu::BufferUsage::STORAGE, (0, 0), 3);
        pool.end_build(&device);

        assert_eq!(pool.fetch_buffer_tracking(b2), tracking);
    }
}
