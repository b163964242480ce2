use crate::binding_table::{BindingTable, BindingValue};
use crate::download::{AsyncDownload, DownloadStaging, PendingDownload};
use crate::frame_alloc::{alloc_erased, free_erased, FrameAllocator};
use crate::graph::{
    BindlessAcquire, BufferDownloadRec, BufferUsageRec, ComputePassInstance, EmptyPassInstance,
    NodeData, PassData, PassKind, PinData, RayTracingPassInstance, RenderPassInstance, Subgraph,
    TextureTransitionRec, TransferPassInstance, GLOBAL_TLAS,
};
use crate::image_state::ImageStateTracker;
use crate::pass_manager::{
    ComputePassCtx, ComputePassInit, ComputePipelineInit, PassManager, PipelineState,
    RayTracingPassCtx, RayTracingPassInit, RayTracingPipelineInit, RenderPassCtx, RenderPassInit,
    RenderPipelineInit,
};
use crate::resource::{
    buffer_usage_flags, image_desc_from_init, image_usage_flags, pin, BufferAccess,
    BufferAccessKind, BufferInit, DataTypeDesc, FrameGraphBuffer, FrameGraphTexture, PinStorage,
    RetainedTexture, TextureInit, TextureInitDesc,
};
use crate::resource_pool::ResourcePool;
use crate::texture_registry::{ResidentTexture, TextureRegistry};
use crate::topology::{Topology, Vertex};
use anyhow::bail;
use gpu_core::{self as gpu, Device, Handle, HandlePool, StagingBuffer};
use std::any::TypeId;
use std::collections::HashSet;

fn convert_for_sync2(
    pass_kind: PassKind,
    access: BufferAccess,
) -> (gpu::PipelineStages, gpu::MemoryAccess, BufferAccessKind) {
    let stages = match pass_kind {
        PassKind::None => gpu::PipelineStages::empty(),
        PassKind::Graphics => gpu::PipelineStages::GRAPHICS,
        PassKind::Compute => gpu::PipelineStages::COMPUTE,
        PassKind::RayTracing => gpu::PipelineStages::RAYTRACING,
        PassKind::Transfer => gpu::PipelineStages::TRANSFER,
    };

    let (mask, kind) = match access {
        BufferAccess::StorageRead => (gpu::MemoryAccess::ANY_READ, BufferAccessKind::Read),
        // Write is interpreted as read-write, e.g. reading uploaded data.
        BufferAccess::StorageWrite => (
            gpu::MemoryAccess::ANY_READ | gpu::MemoryAccess::ANY_WRITE,
            BufferAccessKind::Write,
        ),
        BufferAccess::StorageUpload => (gpu::MemoryAccess::ANY_WRITE, BufferAccessKind::Write),
        BufferAccess::Download
        | BufferAccess::Uniform
        | BufferAccess::Indirect
        | BufferAccess::Index => (gpu::MemoryAccess::ANY_READ, BufferAccessKind::Read),
    };

    (stages, mask, kind)
}

fn read_storage_buffer(pin_storage: &HandlePool<PinStorage>, buffer: pin::Buffer) -> FrameGraphBuffer {
    let storage = pin_storage
        .get(buffer.storage())
        .expect("buffer pin references dead storage");
    debug_assert!(!storage.data.is_null());
    unsafe { *(storage.data as *const FrameGraphBuffer) }
}

fn read_storage_texture(pin_storage: &HandlePool<PinStorage>, texture: pin::Texture) -> FrameGraphTexture {
    let storage = pin_storage
        .get(texture.storage())
        .expect("texture pin references dead storage");
    debug_assert!(!storage.data.is_null());
    unsafe { (*(storage.data as *const FrameGraphTexture)).clone() }
}

fn storage_data_ref<'a, T: 'static>(pin_storage: &'a HandlePool<PinStorage>, storage: Handle<pin::Storage>) -> &'a T {
    let entry = pin_storage.get(storage).expect("data pin references dead storage");
    assert_eq!(entry.type_desc.type_id, TypeId::of::<T>(), "pin data type mismatch");
    debug_assert!(!entry.data.is_null());
    unsafe { &*(entry.data as *const T) }
}

#[allow(clippy::mut_from_ref)]
fn storage_data_mut<'a, T: 'static>(pin_storage: &'a HandlePool<PinStorage>, storage: Handle<pin::Storage>) -> &'a mut T {
    let entry = pin_storage.get(storage).expect("data pin references dead storage");
    assert_eq!(entry.type_desc.type_id, TypeId::of::<T>(), "pin data type mismatch");
    debug_assert!(!entry.data.is_null());
    unsafe { &mut *(entry.data as *mut T) }
}

// ---------------------------------------------------------------------------
// Init context

pub struct InitContext<'a> {
    pub(crate) device: &'a dyn Device,
    pub(crate) pass_manager: &'a mut PassManager,
    pub(crate) gpu_info: gpu::DeviceInfo,
}

impl<'a> InitContext<'a> {
    pub fn register_compute_pass(&mut self, init: &ComputePassInit) -> Handle<crate::pass_manager::ComputePass> {
        self.pass_manager.register_compute_pass(init)
    }

    pub fn register_render_pass(&mut self, init: &RenderPassInit) -> Handle<crate::pass_manager::RenderPass> {
        self.pass_manager.register_render_pass(init)
    }

    pub fn register_raytracing_pass(
        &mut self,
        init: &RayTracingPassInit,
    ) -> anyhow::Result<Handle<crate::pass_manager::RayTracingPass>> {
        self.pass_manager.register_raytracing_pass(init)
    }

    pub fn gpu_info(&self) -> gpu::DeviceInfo {
        self.gpu_info
    }

    pub fn device(&self) -> &'a dyn Device {
        self.device
    }
}

// ---------------------------------------------------------------------------
// Build context

pub struct BuildContext<'a> {
    pub(crate) device: &'a dyn Device,
    pub(crate) pass_manager: &'a mut PassManager,
    pub(crate) staging: &'a mut StagingBuffer,
    pub(crate) texture_registry: &'a mut TextureRegistry,
    pub(crate) graph: &'a Topology,
    pub(crate) nodes: &'a HandlePool<NodeData>,
    pub(crate) pins: &'a HandlePool<PinData>,
    pub(crate) pin_storage: &'a mut HandlePool<PinStorage>,
    pub(crate) subgraphs: &'a mut HandlePool<Subgraph>,
    pub(crate) passes: &'a mut Vec<PassData>,
    pub(crate) passes_per_node: &'a mut Vec<(u32, u32)>,
    pub(crate) texture_transitions: &'a mut Vec<TextureTransitionRec>,
    pub(crate) buffer_usages: &'a mut Vec<BufferUsageRec>,
    pub(crate) buffer_downloads: &'a mut Vec<BufferDownloadRec>,
    pub(crate) transient_buffers: &'a mut Vec<(Handle<pin::Storage>, Handle<crate::resource_pool::TransientBuffer>)>,
    pub(crate) transient_textures: &'a mut Vec<(Handle<pin::Storage>, Handle<crate::resource_pool::TransientTexture>)>,
    pub(crate) pending_uploads: &'a mut Vec<crate::graph::PendingUpload>,
    pub(crate) resource_pool: &'a mut ResourcePool,
    pub(crate) reroute_stash: &'a mut Vec<(Handle<pin::Storage>, PinStorage)>,
    pub(crate) dynamic_pins: &'a mut Vec<Handle<pin::Storage>>,
    pub(crate) retained_textures: &'a mut HashSet<Handle<pin::Storage>>,
    pub(crate) bindless_textures: &'a mut Vec<BindlessAcquire>,
    pub(crate) pending_metrics: &'a mut Vec<(TypeId, pin::Buffer)>,
    pub(crate) empty_events: &'a HashSet<TypeId>,
    pub(crate) arena: &'a FrameAllocator,
    pub(crate) global_tlas: &'a mut Handle<gpu::AccelerationStructure>,
    pub(crate) gpu_info: gpu::DeviceInfo,
    pub(crate) frame_counter: u32,
    pub(crate) recording_metrics: bool,
    pub(crate) current_node: Handle<Vertex>,
    pub(crate) current_pass: u32,
}

impl<'a> BuildContext<'a> {
    fn begin_pass_build(&mut self, kind: PassKind) -> u32 {
        self.end_pass_build();

        let index = self.passes.len() as u32;
        let transitions = self.texture_transitions.len() as u32;
        let usages = self.buffer_usages.len() as u32;
        let downloads = self.buffer_downloads.len() as u32;

        self.passes.push(PassData {
            kind,
            texture_transition_range: (transitions, transitions),
            buffer_usage_range: (usages, usages),
            buffer_download_range: (downloads, downloads),
            ..Default::default()
        });

        self.current_pass = index;

        if let Some(range) = self.passes_per_node.last_mut() {
            range.1 = index + 1;
        }

        index
    }

    pub(crate) fn end_pass_build(&mut self) {
        if self.current_pass == 0 {
            return;
        }

        let transitions = self.texture_transitions.len() as u32;
        let usages = self.buffer_usages.len() as u32;
        let downloads = self.buffer_downloads.len() as u32;

        let pass = &mut self.passes[self.current_pass as usize];
        pass.texture_transition_range.1 = transitions;
        pass.buffer_usage_range.1 = usages;
        pass.buffer_download_range.1 = downloads;

        self.current_pass = 0;
    }

    /// Opens a compute pass; the previous pass of this node is closed.
    pub fn compute_pass(
        &mut self,
        pass: Handle<crate::pass_manager::ComputePass>,
        init: &ComputePipelineInit,
    ) -> ComputePassInstance {
        let index = self.begin_pass_build(PassKind::Compute);
        let pipeline = self
            .pass_manager
            .get_or_create_compute_pipeline(self.device, pass, init);
        self.passes[index as usize].compute_pipeline = pipeline;
        ComputePassInstance(index)
    }

    pub fn render_pass(
        &mut self,
        pass: Handle<crate::pass_manager::RenderPass>,
        init: &RenderPipelineInit,
    ) -> RenderPassInstance {
        let index = self.begin_pass_build(PassKind::Graphics);
        let pipeline = self
            .pass_manager
            .get_or_create_render_pipeline(self.device, pass, init);
        self.passes[index as usize].render_pipeline = pipeline;
        RenderPassInstance(index)
    }

    pub fn raytracing_pass(
        &mut self,
        pass: Handle<crate::pass_manager::RayTracingPass>,
        init: &RayTracingPipelineInit,
    ) -> RayTracingPassInstance {
        let index = self.begin_pass_build(PassKind::RayTracing);
        let pipeline = self
            .pass_manager
            .get_or_create_raytracing_pipeline(self.device, pass, init);
        self.passes[index as usize].raytracing_pipeline = pipeline;
        RayTracingPassInstance(index)
    }

    pub fn transfer_pass(&mut self) -> TransferPassInstance {
        TransferPassInstance(self.begin_pass_build(PassKind::Transfer))
    }

    pub fn empty_pass(&mut self) -> EmptyPassInstance {
        EmptyPassInstance(self.begin_pass_build(PassKind::None))
    }

    fn add_texture_access(&mut self, texture: pin::Texture, state: gpu::ImageState) {
        let transient = self
            .pin_storage
            .get(texture.storage())
            .map(|s| s.transient_texture)
            .unwrap_or(Handle::NONE);

        debug_assert!(transient.is_some(), "texture has no input connected or needs creation");

        if transient.is_none() {
            return;
        }

        let usage = image_usage_flags(state);
        if !usage.is_empty() {
            self.resource_pool.add_transient_texture_usage(transient, usage);
        }
        self.resource_pool.extend_texture_lifetime(transient, self.current_pass);
    }

    fn set_buffer_access(&mut self, buffer: pin::Buffer, access: BufferAccess, uploaded_to: bool) {
        let pass_kind = self.passes[self.current_pass as usize].kind;
        let (stages, mask, kind) = convert_for_sync2(pass_kind, access);

        self.buffer_usages.push(BufferUsageRec {
            storage: buffer.storage(),
            stages,
            access: mask,
            access_kind: kind,
            uploaded_to,
        });

        if access == BufferAccess::Download {
            debug_assert!(pass_kind == PassKind::Transfer, "downloads require a transfer pass");
            self.buffer_downloads.push(BufferDownloadRec {
                storage: buffer.storage(),
                pending_id: 0,
            });
        }
    }

    /// Registers the texture as a transient with the pool and records its
    /// first usage; must be called inside an open pass.
    pub fn create_texture(&mut self, texture: pin::Texture, init: &TextureInit, state: gpu::ImageState) {
        debug_assert!(self.current_pass != 0);

        let desc = image_desc_from_init(init, image_usage_flags(state) | gpu::ImageUsage::SHADER_SAMPLE);

        // The pin handle is unique and stable as long as the topology does
        // not change, which makes it a good stable id.
        let stable_id = if init.is_stable { texture.0 } else { 0 };

        let lifetime = (self.current_pass, self.current_pass);
        let transient = self.resource_pool.add_transient_texture(&desc, lifetime, stable_id);

        let storage = texture.storage();
        self.pin_storage.get_mut(storage).unwrap().transient_texture = transient;
        self.transient_textures.push((storage, transient));

        self.texture_transitions.push(TextureTransitionRec {
            storage,
            new_state: state,
        });
    }

    /// Adds usage flags and records a transition for an already created
    /// (or connected) texture.
    pub fn acquire_texture(&mut self, texture: pin::Texture, state: gpu::ImageState) {
        debug_assert!(self.current_pass != 0);

        self.texture_transitions.push(TextureTransitionRec {
            storage: texture.storage(),
            new_state: state,
        });

        self.add_texture_access(texture, state);
    }

    /// Like [`BuildContext::acquire_texture`], additionally reserving a
    /// bindless slot that resolves to this texture for the frame.
    pub fn acquire_bindless(&mut self, texture: pin::Texture, state: gpu::ImageState) -> Handle<ResidentTexture> {
        debug_assert!(self.current_pass != 0);

        self.texture_transitions.push(TextureTransitionRec {
            storage: texture.storage(),
            new_state: state,
        });
        self.add_texture_access(texture, state);

        let resident = self.texture_registry.acquire();
        self.bindless_textures.push(BindlessAcquire {
            resident,
            texture,
            state,
        });

        resident
    }

    pub fn create_buffer(&mut self, buffer: pin::Buffer, init: &BufferInit<'_>, access: BufferAccess) {
        debug_assert!(self.current_pass != 0);

        let mut usage = buffer_usage_flags(access);
        let upload = !init.data.is_empty();

        if upload {
            usage |= gpu::BufferUsage::TRANSFER_DESTINATION;
        }

        let stable_id = if init.is_stable {
            debug_assert!(
                init.data.is_empty(),
                "uploading at initialization time on stable buffers is not supported"
            );
            buffer.0
        } else {
            0
        };

        let lifetime = (self.current_pass, self.current_pass);
        let transient = self
            .resource_pool
            .add_transient_buffer(init.size, usage, lifetime, stable_id);

        let storage = buffer.storage();
        self.pin_storage.get_mut(storage).unwrap().transient_buffer = transient;
        self.transient_buffers.push((storage, transient));

        if upload {
            // The global memory barrier around upload flushing synchronizes
            // this before any pass runs.
            let span = self
                .staging
                .stage(self.device, init.data)
                .expect("out of space on the staging buffer");
            self.pending_uploads.push(crate::graph::PendingUpload { storage, span });
        }

        self.set_buffer_access(buffer, access, upload);
    }

    /// Creates a buffer whose content is an already staged span.
    pub fn create_buffer_staged(
        &mut self,
        buffer: pin::Buffer,
        staged: &gpu::StagingBufferSpan,
        access: BufferAccess,
    ) {
        debug_assert!(self.current_pass != 0);

        let size = staged.total_size();
        let mut usage = buffer_usage_flags(access);

        if size != 0 {
            usage |= gpu::BufferUsage::TRANSFER_DESTINATION;
        }

        let lifetime = (self.current_pass, self.current_pass);
        let transient = self.resource_pool.add_transient_buffer(size, usage, lifetime, 0);

        let storage = buffer.storage();
        self.pin_storage.get_mut(storage).unwrap().transient_buffer = transient;
        self.transient_buffers.push((storage, transient));

        if size != 0 {
            self.pending_uploads.push(crate::graph::PendingUpload {
                storage,
                span: *staged,
            });
        }

        self.set_buffer_access(buffer, access, size != 0);
    }

    /// Adds usage flags for an already created buffer and records its
    /// access for barrier derivation.
    ///
    /// Acquiring the same buffer for read and write within one pass records
    /// a single usage and emits a single barrier; the caller is responsible
    /// for the intra-pass ordering in that case.
    pub fn acquire_buffer(&mut self, buffer: pin::Buffer, access: BufferAccess) {
        debug_assert!(self.current_pass != 0);

        let transient = self
            .pin_storage
            .get(buffer.storage())
            .map(|s| s.transient_buffer)
            .unwrap_or(Handle::NONE);

        debug_assert!(transient.is_some(), "buffer has no input connected or needs creation");

        if transient.is_none() {
            return;
        }

        self.resource_pool
            .add_transient_buffer_usage(transient, buffer_usage_flags(access));
        self.resource_pool.extend_buffer_lifetime(transient, self.current_pass);

        self.set_buffer_access(buffer, access, false);
    }

    /// Redirects `destination`'s storage to `source`; the previous binding
    /// is stashed and restored at frame end, leaving the topology untouched.
    /// Only the owner node of the destination pin may reroute into it.
    pub fn reroute_buffer(&mut self, source: pin::Buffer, destination: pin::Buffer) {
        self.reroute(source.storage(), destination.storage());
    }

    pub fn reroute_texture(&mut self, source: pin::Texture, destination: pin::Texture) {
        self.reroute(source.storage(), destination.storage());
    }

    fn reroute(&mut self, source: Handle<pin::Storage>, destination: Handle<pin::Storage>) {
        debug_assert!(
            self.owner_node_vertex(destination) == self.current_node,
            "only the source of the pin should reroute"
        );

        let source_storage = *self.pin_storage.get(source).unwrap();
        let destination_storage = self.pin_storage.get_mut(destination).unwrap();

        self.reroute_stash.push((destination, *destination_storage));
        *destination_storage = source_storage;
    }

    fn owner_node_vertex(&self, storage: Handle<pin::Storage>) -> Handle<Vertex> {
        self.pin_storage
            .get(storage)
            .and_then(|s| self.pins.get(s.owner))
            .map(|p| p.node_vertex)
            .unwrap_or(Handle::NONE)
    }

    /// Whether the pin feeds an enabled subgraph output this frame.
    pub fn is_active_output(&self, texture: pin::Texture) -> bool {
        self.pin_storage
            .get(texture.storage())
            .map(|s| s.has_path_to_output)
            .unwrap_or(false)
    }

    pub fn has_source_buffer(&self, buffer: pin::Buffer) -> bool {
        self.owner_node_vertex(buffer.storage()) != self.current_node
    }

    pub fn has_source_texture(&self, texture: pin::Texture) -> bool {
        self.owner_node_vertex(texture.storage()) != self.current_node
    }

    /// Allocates a pin that lives for this frame only and creates a buffer
    /// through it.
    pub fn create_dynamic_buffer(&mut self, init: &BufferInit<'_>, access: BufferAccess) -> pin::Buffer {
        let storage = self.pin_storage.insert_tagged::<pin::Storage>(PinStorage {
            type_desc: DataTypeDesc::of::<FrameGraphBuffer>(),
            ..Default::default()
        });
        self.dynamic_pins.push(storage);

        let buffer = pin::Buffer::from_storage(storage);
        self.create_buffer(buffer, init, access);
        buffer
    }

    pub fn create_dynamic_buffer_staged(
        &mut self,
        staged: &gpu::StagingBufferSpan,
        access: BufferAccess,
    ) -> pin::Buffer {
        let storage = self.pin_storage.insert_tagged::<pin::Storage>(PinStorage {
            type_desc: DataTypeDesc::of::<FrameGraphBuffer>(),
            ..Default::default()
        });
        self.dynamic_pins.push(storage);

        let buffer = pin::Buffer::from_storage(storage);
        self.create_buffer_staged(buffer, staged, access);
        buffer
    }

    /// Descriptor the texture is currently registered with in the pool.
    pub fn get_current_initializer(&self, texture: pin::Texture) -> anyhow::Result<TextureInitDesc> {
        let transient = self
            .pin_storage
            .get(texture.storage())
            .map(|s| s.transient_texture)
            .unwrap_or(Handle::NONE);

        if transient.is_none() {
            bail!("texture resource not found in frame graph pool");
        }

        let desc = self.resource_pool.get_initializer(transient);

        Ok(TextureInitDesc {
            width: desc.width,
            height: desc.height,
            format: desc.format,
        })
    }

    /// Allocates an image that outlives the frame; its destruction is
    /// deferred and GPU-safe once the owning subgraph goes away.
    pub fn create_retained_texture(&mut self, init: &TextureInit, states: &[gpu::ImageState]) -> RetainedTexture {
        let mut usage = gpu::ImageUsage::empty();
        for state in states {
            usage |= image_usage_flags(*state);
        }

        let desc = image_desc_from_init(init, usage);

        let image = match self.device.create_image(&desc) {
            Ok(image) => image,
            Err(err) => {
                log::error!("retained texture allocation failed: {:#}", err);
                return RetainedTexture(0);
            }
        };

        let data = alloc_erased(
            std::mem::size_of::<FrameGraphTexture>(),
            std::mem::align_of::<FrameGraphTexture>(),
        );
        unsafe {
            std::ptr::write(
                data as *mut FrameGraphTexture,
                FrameGraphTexture {
                    handle: image,
                    descriptor: desc.clone(),
                },
            );
        }

        let transient = self.resource_pool.add_external_texture(image, &desc);

        let storage = self.pin_storage.insert_tagged::<pin::Storage>(PinStorage {
            type_desc: DataTypeDesc::of::<FrameGraphTexture>(),
            data,
            transient_texture: transient,
            is_owned_texture: true,
            ..Default::default()
        });

        self.transient_textures.push((storage, transient));
        self.retained_textures.insert(storage);

        // The owning subgraph reclaims the storage when it is removed.
        let node = self.graph.get(self.current_node).node;
        let subgraph = self.nodes.get(node).map(|n| n.subgraph).unwrap_or(Handle::NONE);
        if let Some(sg) = self.subgraphs.get_mut(subgraph) {
            sg.dynamic_storage.push(storage);
        }

        RetainedTexture(storage.raw())
    }

    pub fn destroy_retained_texture(&mut self, retained: RetainedTexture) {
        let storage_key = retained.storage();

        let storage = match self.pin_storage.remove(storage_key) {
            Some(storage) => storage,
            None => return,
        };

        debug_assert!(storage.is_owned_texture);

        if !storage.data.is_null() {
            let texture = unsafe { &*(storage.data as *const FrameGraphTexture) };
            if texture.handle.is_some() {
                self.device
                    .destroy_deferred(gpu::GpuObject::Image(texture.handle), self.device.get_submit_index());
            }
            free_erased(storage.data, storage.type_desc.size, storage.type_desc.align);
        }

        self.retained_textures.remove(&storage_key);

        let node = self.graph.get(self.current_node).node;
        let subgraph = self.nodes.get(node).map(|n| n.subgraph).unwrap_or(Handle::NONE);
        if let Some(sg) = self.subgraphs.get_mut(subgraph) {
            sg.dynamic_storage.retain(|s| *s != storage_key);
        }
    }

    /// The frame-graph pin of a retained texture, usable with `acquire` and
    /// `reroute`.
    pub fn get_resource(&self, retained: RetainedTexture) -> pin::Texture {
        pin::Texture(retained.0)
    }

    /// Tracks an image owned elsewhere for barrier purposes.
    pub fn register_texture(&mut self, texture: pin::Texture, image: Handle<gpu::Image>, desc: &gpu::ImageDesc) {
        let transient = self.resource_pool.add_external_texture(image, desc);
        let storage = texture.storage();
        self.pin_storage.get_mut(storage).unwrap().transient_texture = transient;
        self.transient_textures.push((storage, transient));
    }

    pub fn register_global_tlas(&mut self, tlas: Handle<gpu::AccelerationStructure>) {
        debug_assert!(self.global_tlas.is_none());
        *self.global_tlas = tlas;
    }

    /// Registers a buffer for the hidden metrics download pass.
    pub fn register_metrics_buffer<T: 'static>(&mut self, buffer: pin::Buffer) {
        self.pending_metrics.push((TypeId::of::<T>(), buffer));
    }

    /// Returns a span valid until frame end.
    pub fn stage_upload(&mut self, data: &[u8]) -> gpu::StagingBufferSpan {
        self.staging
            .stage(self.device, data)
            .expect("out of space on the staging buffer")
    }

    pub fn stage_upload_image(&mut self, data: &[u8], texel_size: u32) -> gpu::StagingBufferSpan {
        self.staging
            .stage_image(self.device, data, texel_size)
            .expect("out of space on the staging buffer")
    }

    pub fn data<T: 'static>(&self, data_pin: pin::Data<T>) -> &T {
        storage_data_ref(self.pin_storage, data_pin.storage())
    }

    pub fn data_mut<T: 'static>(&mut self, data_pin: pin::Data<T>) -> &mut T {
        storage_data_mut(self.pin_storage, data_pin.storage())
    }

    pub fn gpu_info(&self) -> gpu::DeviceInfo {
        self.gpu_info
    }

    pub fn frame_counter(&self) -> u32 {
        self.frame_counter
    }

    pub fn is_recording_metrics(&self) -> bool {
        self.recording_metrics
    }

    pub fn has_event<T: 'static>(&self) -> bool {
        self.empty_events.contains(&TypeId::of::<T>())
    }
}

// ---------------------------------------------------------------------------
// Execute context

pub struct ExecuteContext<'a> {
    pub(crate) device: &'a dyn Device,
    pub(crate) cmd: gpu::CommandBuffer,
    pub(crate) pass_manager: &'a PassManager,
    pub(crate) staging: &'a mut StagingBuffer,
    pub(crate) graph: &'a Topology,
    pub(crate) nodes: &'a HandlePool<NodeData>,
    pub(crate) pins: &'a HandlePool<PinData>,
    pub(crate) pin_storage: &'a HandlePool<PinStorage>,
    pub(crate) passes: &'a [PassData],
    pub(crate) buffer_usages: &'a [BufferUsageRec],
    pub(crate) buffer_downloads: &'a [BufferDownloadRec],
    pub(crate) texture_transitions: &'a [TextureTransitionRec],
    pub(crate) pending_downloads: &'a mut Vec<PendingDownload>,
    pub(crate) download_staging: &'a DownloadStaging,
    pub(crate) image_tracker: &'a mut ImageStateTracker,
    pub(crate) buffer_barriers: &'a [gpu::BufferBarrier],
    pub(crate) resource_pool: &'a ResourcePool,
    pub(crate) empty_events: &'a HashSet<TypeId>,
    pub(crate) global_tlas: Handle<gpu::AccelerationStructure>,
    pub(crate) gpu_info: gpu::DeviceInfo,
    pub(crate) frame_counter: u32,
    pub(crate) recording_metrics: bool,
    pub(crate) current_node: Handle<Vertex>,
    pub(crate) current_pass: u32,
    pub(crate) pass_kind: PassKind,
    pub(crate) compute_ctx: Option<ComputePassCtx>,
    pub(crate) render_ctx: Option<RenderPassCtx>,
    pub(crate) rt_ctx: Option<RayTracingPassCtx>,
}

impl<'a> ExecuteContext<'a> {
    /// Emits the pass's pre-barriers (merged buffer barriers plus texture
    /// transitions through the image state tracker). Within a node, passes
    /// must be opened in the order they were declared during build.
    pub(crate) fn begin_pass_execution(&mut self, pass_index: u32) {
        debug_assert!(pass_index != 0);

        if self.current_pass == pass_index {
            return;
        }

        debug_assert!(
            self.current_pass == 0 || pass_index == self.current_pass + 1,
            "passes must execute in declaration order"
        );

        let pass = &self.passes[pass_index as usize];

        let stages = match pass.kind {
            PassKind::Transfer => gpu::PipelineStages::TRANSFER,
            PassKind::RayTracing => gpu::PipelineStages::RAYTRACING,
            PassKind::Graphics => gpu::PipelineStages::GRAPHICS,
            PassKind::Compute => gpu::PipelineStages::COMPUTE,
            PassKind::None => gpu::PipelineStages::empty(),
        };

        let mut image_barriers = Vec::with_capacity(
            (pass.texture_transition_range.1 - pass.texture_transition_range.0) as usize,
        );

        for transition in &self.texture_transitions
            [pass.texture_transition_range.0 as usize..pass.texture_transition_range.1 as usize]
        {
            let storage = self.pin_storage.get(transition.storage).unwrap();
            let texture = unsafe { &*(storage.data as *const FrameGraphTexture) };

            if let Some(barrier) =
                self.image_tracker
                    .add_transition(texture.handle, stages, transition.new_state)
            {
                image_barriers.push(barrier);
            }
        }

        let buffer_barriers = &self.buffer_barriers
            [pass.buffer_barrier_range.0 as usize..pass.buffer_barrier_range.1 as usize];

        if !buffer_barriers.is_empty() || !image_barriers.is_empty() {
            self.device.cmd_apply_barriers(
                self.cmd,
                &gpu::Barriers {
                    buffers: buffer_barriers,
                    images: &image_barriers,
                    ..Default::default()
                },
            );
        }

        self.current_pass = pass_index;
    }

    pub fn begin_compute_pass(&mut self, instance: ComputePassInstance) -> anyhow::Result<()> {
        debug_assert!(instance.is_some());
        debug_assert!(self.passes[instance.0 as usize].kind == PassKind::Compute);

        self.begin_pass_execution(instance.0);

        let pipeline = self.passes[instance.0 as usize].compute_pipeline;

        match self.pass_manager.begin_compute_pass(self.device, self.cmd, pipeline) {
            Some(ctx) => {
                self.pass_kind = PassKind::Compute;
                self.compute_ctx = Some(ctx);
                Ok(())
            }
            None => {
                self.pass_kind = PassKind::None;
                bail!("compute pipeline context not found")
            }
        }
    }

    pub fn begin_render_pass(
        &mut self,
        instance: RenderPassInstance,
        cfg: &gpu::GraphicsPassDesc,
    ) -> anyhow::Result<()> {
        debug_assert!(instance.is_some());
        debug_assert!(self.passes[instance.0 as usize].kind == PassKind::Graphics);

        self.begin_pass_execution(instance.0);

        let pipeline = self.passes[instance.0 as usize].render_pipeline;

        match self.pass_manager.begin_render_pass(self.device, self.cmd, pipeline, cfg) {
            Some(ctx) => {
                self.pass_kind = PassKind::Graphics;
                self.render_ctx = Some(ctx);
                Ok(())
            }
            None => {
                self.pass_kind = PassKind::None;
                bail!("graphics pipeline context not found")
            }
        }
    }

    pub fn begin_raytracing_pass(&mut self, instance: RayTracingPassInstance) -> anyhow::Result<()> {
        debug_assert!(instance.is_some());
        debug_assert!(self.passes[instance.0 as usize].kind == PassKind::RayTracing);

        self.begin_pass_execution(instance.0);

        let pipeline = self.passes[instance.0 as usize].raytracing_pipeline;

        match self.pass_manager.begin_raytracing_pass(self.device, self.cmd, pipeline) {
            Some(ctx) => {
                self.pass_kind = PassKind::RayTracing;
                self.rt_ctx = Some(ctx);
                Ok(())
            }
            None => {
                self.pass_kind = PassKind::None;
                bail!("ray tracing pipeline context not found")
            }
        }
    }

    pub fn begin_transfer_pass(&mut self, instance: TransferPassInstance) -> anyhow::Result<()> {
        debug_assert!(instance.is_some());
        debug_assert!(self.passes[instance.0 as usize].kind == PassKind::Transfer);

        self.begin_pass_execution(instance.0);
        self.pass_kind = PassKind::Transfer;
        Ok(())
    }

    pub fn begin_empty_pass(&mut self, instance: EmptyPassInstance) -> anyhow::Result<()> {
        debug_assert!(instance.is_some());
        debug_assert!(self.passes[instance.0 as usize].kind == PassKind::None);

        self.begin_pass_execution(instance.0);
        self.pass_kind = PassKind::None;
        Ok(())
    }

    pub fn end_pass(&mut self) {
        match self.pass_kind {
            PassKind::Compute => {
                if let Some(ctx) = self.compute_ctx.take() {
                    self.pass_manager.end_compute_pass(self.device, &ctx);
                }
            }
            PassKind::Graphics => {
                if let Some(ctx) = self.render_ctx.take() {
                    self.pass_manager.end_render_pass(self.device, &ctx);
                }
            }
            PassKind::RayTracing => {
                if let Some(ctx) = self.rt_ctx.take() {
                    self.pass_manager.end_raytracing_pass(self.device, &ctx);
                }
            }
            PassKind::Transfer | PassKind::None => {}
        }

        self.pass_kind = PassKind::None;
    }

    fn current_pipeline(&self) -> Option<&PipelineState> {
        match self.pass_kind {
            PassKind::Compute => self
                .compute_ctx
                .as_ref()
                .and_then(|ctx| self.pass_manager.get_compute_pipeline(ctx.pipeline)),
            PassKind::Graphics => self
                .render_ctx
                .as_ref()
                .and_then(|ctx| self.pass_manager.get_render_pipeline(ctx.pipeline)),
            PassKind::RayTracing => self
                .rt_ctx
                .as_ref()
                .and_then(|ctx| self.pass_manager.get_raytracing_pipeline(ctx.pipeline)),
            _ => None,
        }
    }

    /// Satisfies the current pipeline's reflected set-0 bindings by looking
    /// each name up in the supplied binding-table stack.
    pub fn bind_descriptor_sets(&self, tables: &[&BindingTable]) {
        let state = match self.current_pipeline() {
            Some(state) => state,
            None => return,
        };

        let pin_storage = &*self.pin_storage;
        let image_tracker = &*self.image_tracker;
        let global_tlas = self.global_tlas;
        let passes = self.passes;
        let buffer_usages = self.buffer_usages;
        let current_pass = self.current_pass;
        let label = state.label.clone();

        self.pass_manager
            .bind_descriptor_sets(self.device, self.cmd, state, |binding| {
                let value = tables.iter().find_map(|table| table.try_find(&binding.name))?;

                match value {
                    BindingValue::Buffer(buffer_pin) => {
                        if cfg!(debug_assertions) {
                            let is_read_only = binding.kind == gpu::DescriptorKind::UniformBuffer
                                || binding.read_only;

                            let pass = &passes[current_pass as usize];
                            let mut found = false;
                            for usage in &buffer_usages[pass.buffer_usage_range.0 as usize
                                ..pass.buffer_usage_range.1 as usize]
                            {
                                if usage.storage == buffer_pin.storage() {
                                    found = (usage.access_kind == BufferAccessKind::Read) == is_read_only;
                                    break;
                                }
                            }

                            if !found {
                                log::error!(
                                    "[{}] missing or mismatching acquire for buffer {}",
                                    label,
                                    binding.name
                                );
                            }
                        }

                        let buffer = read_storage_buffer(pin_storage, buffer_pin);
                        Some(gpu::BindableObject::Buffer(buffer.range()))
                    }
                    BindingValue::Texture(texture_pin) => {
                        let texture = read_storage_texture(pin_storage, texture_pin);
                        let state = image_tracker
                            .try_get_state(texture.handle)
                            .unwrap_or(gpu::ImageState::Undefined);

                        Some(gpu::BindableObject::Image(gpu::ImageInfo {
                            image: texture.handle,
                            state,
                        }))
                    }
                    BindingValue::AccelerationStructure(tlas_pin) => {
                        debug_assert!(
                            tlas_pin == GLOBAL_TLAS,
                            "only the global TLAS is supported at the moment"
                        );
                        Some(gpu::BindableObject::AccelerationStructure(global_tlas))
                    }
                }
            });
    }

    pub fn push_constants(&self, stages: gpu::ShaderStageFlags, offset: u32, data: &[u8]) {
        if let Some(state) = self.current_pipeline() {
            self.pass_manager
                .push_constants(self.device, self.cmd, state, stages, offset, data);
        }
    }

    /// Reflected push constant block of the current pipeline, including the
    /// per-draw `instanceTableId` offset when the member exists.
    pub fn push_constant_info(&self) -> Option<crate::reflection::PushConstantReflection> {
        self.current_pipeline().and_then(|state| state.push_constants)
    }

    /// Compute workgroup size reflected out of the current pipeline.
    pub fn compute_group_size(&self) -> [u32; 3] {
        self.current_pipeline().map(|state| state.group_size).unwrap_or([1, 1, 1])
    }

    pub fn dispatch_compute(&self, groups_x: u32, groups_y: u32, groups_z: u32) {
        debug_assert!(self.pass_kind == PassKind::Compute);
        self.device.cmd_dispatch_compute(self.cmd, groups_x, groups_y, groups_z);
    }

    pub fn trace_rays(&self, width: u32, height: u32, depth: u32) {
        debug_assert!(self.pass_kind == PassKind::RayTracing);
        if let Some(ctx) = &self.rt_ctx {
            self.pass_manager.trace_rays(self.device, ctx, width, height, depth);
        }
    }

    pub fn draw_indexed(
        &self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        self.device.cmd_draw_indexed(
            self.cmd,
            index_count,
            instance_count,
            first_index,
            vertex_offset,
            first_instance,
        );
    }

    pub fn draw_mesh_tasks_indirect_count(
        &self,
        draw_call_buffer: pin::Buffer,
        draw_call_offset: u64,
        count_buffer: pin::Buffer,
        count_offset: u64,
        max_draw_count: u32,
    ) {
        let draw = read_storage_buffer(self.pin_storage, draw_call_buffer);
        let count = read_storage_buffer(self.pin_storage, count_buffer);

        self.device.cmd_draw_mesh_tasks_indirect_count(
            self.cmd,
            draw.range(),
            draw.offset + draw_call_offset,
            count.range(),
            count.offset + count_offset,
            max_draw_count,
        );
    }

    pub fn blit_color(&self, src: pin::Texture, dst: pin::Texture) {
        let src = read_storage_texture(self.pin_storage, src);
        let dst = read_storage_texture(self.pin_storage, dst);
        self.device
            .cmd_blit(self.cmd, src.handle, dst.handle, gpu::SamplerFilter::Linear);
    }

    pub fn bind_index_buffer(&self, buffer: pin::Buffer, offset: u64, index_type: gpu::IndexType) {
        let b = read_storage_buffer(self.pin_storage, buffer);
        self.device
            .cmd_bind_index_buffer(self.cmd, b.handle, b.offset + offset, index_type);
    }

    pub fn set_viewport(&self, width: u32, height: u32, min_depth: f32, max_depth: f32) {
        self.device.cmd_set_viewport(self.cmd, width, height, min_depth, max_depth);
    }

    pub fn set_scissor(&self, x: i32, y: i32, width: u32, height: u32) {
        self.device.cmd_set_scissor(self.cmd, x, y, width, height);
    }

    pub fn access_buffer(&self, buffer: pin::Buffer) -> gpu::BufferRange {
        read_storage_buffer(self.pin_storage, buffer).range()
    }

    pub fn access_texture(&self, texture: pin::Texture) -> Handle<gpu::Image> {
        read_storage_texture(self.pin_storage, texture).handle
    }

    pub fn get_resolution(&self, texture: pin::Texture) -> (u32, u32) {
        let t = read_storage_texture(self.pin_storage, texture);
        (t.descriptor.width, t.descriptor.height)
    }

    pub fn get_device_address(&self, buffer: pin::Buffer) -> u64 {
        self.device
            .get_device_address(read_storage_buffer(self.pin_storage, buffer).range())
    }

    pub fn get_global_tlas(&self) -> pin::AccelerationStructure {
        GLOBAL_TLAS
    }

    /// Stages bytes and records a transfer into the buffer; only valid
    /// inside a transfer pass.
    pub fn upload(&mut self, buffer: pin::Buffer, data: &[u8], buffer_offset: u64) {
        debug_assert!(self.pass_kind == PassKind::Transfer);

        let span = match self.staging.stage(self.device, data) {
            Ok(span) => span,
            Err(err) => {
                log::error!("staging upload failed: {:#}", err);
                return;
            }
        };

        let b = read_storage_buffer(self.pin_storage, buffer);
        self.staging
            .upload(self.device, self.cmd, &span, b.handle, b.offset + buffer_offset);
    }

    pub fn upload_staged(&mut self, buffer: pin::Buffer, staged: &gpu::StagingBufferSpan, buffer_offset: u64) {
        let b = read_storage_buffer(self.pin_storage, buffer);
        self.staging
            .upload(self.device, self.cmd, staged, b.handle, b.offset + buffer_offset);
    }

    pub fn upload_texture(&mut self, texture: pin::Texture, staged: &gpu::StagingBufferSpan) {
        let t = read_storage_texture(self.pin_storage, texture);
        self.staging.upload_image(self.device, self.cmd, staged, t.handle);
    }

    /// Records the readback of a buffer declared as a download during
    /// build; the returned future is fulfilled by the post-frame reaping
    /// loop once the submit has finished.
    pub fn download(&mut self, buffer: pin::Buffer) -> AsyncDownload {
        debug_assert!(buffer.is_some());
        debug_assert!(self.current_pass != 0);
        debug_assert!(self.pass_kind == PassKind::Transfer);

        let pass = &self.passes[self.current_pass as usize];

        for record in &self.buffer_downloads
            [pass.buffer_download_range.0 as usize..pass.buffer_download_range.1 as usize]
        {
            if record.storage != buffer.storage() {
                continue;
            }

            let pending = &mut self.pending_downloads[record.pending_id as usize];
            let b = read_storage_buffer(self.pin_storage, buffer);

            self.download_staging
                .download(self.device, self.cmd, b.range(), 0, &pending.span);

            return pending.take_future();
        }

        debug_assert!(false, "the download was not declared in the build process");
        AsyncDownload::invalid()
    }

    pub fn has_source_buffer(&self, buffer: pin::Buffer) -> bool {
        self.owner_node_vertex(buffer.storage()) != self.current_node
    }

    pub fn has_source_texture(&self, texture: pin::Texture) -> bool {
        self.owner_node_vertex(texture.storage()) != self.current_node
    }

    fn owner_node_vertex(&self, storage: Handle<pin::Storage>) -> Handle<Vertex> {
        self.pin_storage
            .get(storage)
            .and_then(|s| self.pins.get(s.owner))
            .map(|p| p.node_vertex)
            .unwrap_or(Handle::NONE)
    }

    pub fn get_frames_alive_count_texture(&self, texture: pin::Texture) -> u32 {
        let transient = self
            .pin_storage
            .get(texture.storage())
            .map(|s| s.transient_texture)
            .unwrap_or(Handle::NONE);
        debug_assert!(transient.is_some());
        self.resource_pool.get_texture_frames_alive(transient)
    }

    pub fn get_frames_alive_count_buffer(&self, buffer: pin::Buffer) -> u32 {
        let transient = self
            .pin_storage
            .get(buffer.storage())
            .map(|s| s.transient_buffer)
            .unwrap_or(Handle::NONE);
        debug_assert!(transient.is_some());
        self.resource_pool.get_buffer_frames_alive(transient)
    }

    pub fn data<T: 'static>(&self, data_pin: pin::Data<T>) -> &T {
        storage_data_ref(self.pin_storage, data_pin.storage())
    }

    pub fn data_mut<T: 'static>(&mut self, data_pin: pin::Data<T>) -> &mut T {
        storage_data_mut(self.pin_storage, data_pin.storage())
    }

    pub fn gpu_info(&self) -> gpu::DeviceInfo {
        self.gpu_info
    }

    pub fn frame_counter(&self) -> u32 {
        self.frame_counter
    }

    pub fn is_recording_metrics(&self) -> bool {
        self.recording_metrics
    }

    pub fn has_event<T: 'static>(&self) -> bool {
        self.empty_events.contains(&TypeId::of::<T>())
    }

    pub fn device(&self) -> &'a dyn Device {
        self.device
    }

    pub fn command_buffer(&self) -> gpu::CommandBuffer {
        self.cmd
    }
}
