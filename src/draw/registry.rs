use crate::draw::mesh::{MeshIndexType, MeshSource, ResourceId};
use crate::draw::mesh_table::{
    GpuAabb, GpuFullIndexBuffer, MeshDataBuffer, MeshDrawRange, MeshHandle, MeshTable,
    MeshTableInit, VertexAttribute,
};
use crate::ecs::{Deferred, EntityRegistry, Tag};
use anyhow::Result;
use glam::Mat4;
use gpu_core::{self as gpu, Device, Handle, StagingBuffer};
use std::any::TypeId;
use std::collections::HashMap;

// ---------------------------------------------------------------------------
// Components and tags the registry drives off the entity store

#[derive(Clone, Copy, Debug, Default)]
pub struct DrawMeshComponent {
    pub mesh: ResourceId,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct DrawInstanceComponent {
    pub mesh: MeshHandle,
}

/// Global id stored in the visibility buffer and as the acceleration
/// structure instance custom index: 20 bits of instance index, 4 bits of
/// instance table id.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DrawInstanceIdComponent {
    pub rt_instance_id: u32,
}

#[derive(Clone, Copy, Debug)]
pub struct GlobalTransformComponent {
    pub local_to_world: Mat4,
}

impl Default for GlobalTransformComponent {
    fn default() -> Self {
        Self {
            local_to_world: Mat4::identity(),
        }
    }
}

// Meshes with different index widths cannot be drawn together; the tags
// split them into separate archetypes.
pub struct MeshIndexNoneTag;
pub struct MeshIndexU8Tag;
pub struct MeshIndexU16Tag;
pub struct MeshIndexU32Tag;
pub struct DrawRaytracedTag;

impl Tag for MeshIndexNoneTag {}
impl Tag for MeshIndexU8Tag {}
impl Tag for MeshIndexU16Tag {}
impl Tag for MeshIndexU32Tag {}
impl Tag for DrawRaytracedTag {}

const INSTANCE_INDEX_BITS: u32 = 20;
const INSTANCE_INDEX_MASK: u32 = (1 << INSTANCE_INDEX_BITS) - 1;

pub fn make_global_instance_id(instance_table_id: u32, instance_index: u32) -> DrawInstanceIdComponent {
    debug_assert!(instance_table_id < (1 << 4));
    debug_assert!(instance_index <= INSTANCE_INDEX_MASK);

    DrawInstanceIdComponent {
        rt_instance_id: (instance_index & INSTANCE_INDEX_MASK) | (instance_table_id << INSTANCE_INDEX_BITS),
    }
}

// ---------------------------------------------------------------------------
// Instance data types

/// Registration of the component types whose data is staged per instance
/// into GPU buffers, each with the buffer id the shaders select it by.
#[derive(Default)]
pub struct InstanceDataTypeRegistry {
    entries: HashMap<TypeId, InstanceDataTypeInfo>,
}

#[derive(Clone, Debug)]
pub struct InstanceDataTypeInfo {
    pub name: &'static str,
    pub gpu_buffer_id: u32,
}

impl InstanceDataTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: Copy + 'static>(&mut self, name: &'static str) {
        let gpu_buffer_id = self.entries.len() as u32;
        self.entries.insert(
            TypeId::of::<T>(),
            InstanceDataTypeInfo { name, gpu_buffer_id },
        );
    }

    pub fn try_find(&self, type_id: TypeId) -> Option<&InstanceDataTypeInfo> {
        self.entries.get(&type_id)
    }

    /// Shader defines describing the instance buffer ids, fed into the pass
    /// manager so pipelines recompile when the layout changes.
    pub fn make_defines(&self) -> String {
        let mut entries: Vec<&InstanceDataTypeInfo> = self.entries.values().collect();
        entries.sort_by_key(|info| info.gpu_buffer_id);

        let mut defines = String::new();
        for info in entries {
            defines.push_str(&format!(
                "#define FG_INSTANCE_BUFFER_{} {}\n",
                info.name, info.gpu_buffer_id
            ));
        }
        defines
    }
}

// ---------------------------------------------------------------------------
// Draw batches

/// One staged instance buffer per recognised instance-data component type.
#[derive(Clone, Debug, Default)]
pub struct DrawBatch {
    pub instance_table_id: u32,
    pub instance_count: u32,
    pub instance_buffers: Vec<(u32, gpu::StagingBufferSpan)>,
}

struct Blas {
    acceleration_structure: Handle<gpu::AccelerationStructure>,
    buffer: Handle<gpu::Buffer>,
    device_address: u64,
    /// Promoted index buffer; the AS builder cannot consume the u8
    /// micro-indices, so the full u16/u32 index buffer lives here.
    full_index_buffer: Handle<gpu::Buffer>,
    mesh: ResourceId,
    primitive_count: u32,
    vertex_count: u32,
}

struct PendingMeshUpload {
    span: gpu::StagingBufferSpan,
    dst: gpu::BufferRange,
}

struct QueuedBlasBuild {
    acceleration_structure: Handle<gpu::AccelerationStructure>,
    geometry: gpu::AsTriangleGeometry,
    scratch_size: u64,
}

/// Maps the entity store onto GPU draw batches each frame, allocates the
/// mesh table, and builds BLAS/TLAS for ray-traced instances.
pub struct DrawRegistry {
    meshes: MeshTable,
    cached_meshes: HashMap<ResourceId, MeshHandle>,
    mesh_to_blas: HashMap<MeshHandle, Blas>,

    tlas: Handle<gpu::AccelerationStructure>,
    tlas_buffer: Handle<gpu::Buffer>,
    rt_instance_buffer: Handle<gpu::Buffer>,
    rt_instance_capacity: u64,

    pending_uploads: Vec<PendingMeshUpload>,

    instance_types: InstanceDataTypeRegistry,
    mesh_source: Box<dyn MeshSource>,

    batches: Vec<DrawBatch>,
    mesh_database: Vec<u8>,
}

impl DrawRegistry {
    pub fn new(
        device: &dyn Device,
        mesh_source: Box<dyn MeshSource>,
        instance_types: InstanceDataTypeRegistry,
    ) -> Result<Self> {
        Ok(Self {
            meshes: MeshTable::new(device, &MeshTableInit::default())?,
            cached_meshes: HashMap::new(),
            mesh_to_blas: HashMap::new(),
            tlas: Handle::NONE,
            tlas_buffer: Handle::NONE,
            rt_instance_buffer: Handle::NONE,
            rt_instance_capacity: 0,
            pending_uploads: Vec::new(),
            instance_types,
            mesh_source,
            batches: Vec::new(),
            mesh_database: Vec::new(),
        })
    }

    pub fn register_components(entities: &mut EntityRegistry) {
        entities.register_component::<DrawMeshComponent>("DrawMeshComponent");
        entities.register_component::<DrawInstanceComponent>("DrawInstanceComponent");
        entities.register_component::<DrawInstanceIdComponent>("DrawInstanceIdComponent");
        entities.register_component::<GlobalTransformComponent>("GlobalTransformComponent");
    }

    pub fn instance_types(&self) -> &InstanceDataTypeRegistry {
        &self.instance_types
    }

    pub fn mesh_table(&self) -> &MeshTable {
        &self.meshes
    }

    pub fn get_draw_calls(&self) -> &[DrawBatch] {
        &self.batches
    }

    pub fn get_mesh_database_data(&self) -> &[u8] {
        &self.mesh_database
    }

    pub fn get_tlas(&self) -> Handle<gpu::AccelerationStructure> {
        self.tlas
    }

    pub fn try_get_mesh(&self, resource: ResourceId) -> MeshHandle {
        self.cached_meshes.get(&resource).copied().unwrap_or_default()
    }

    fn defer_upload(
        &mut self,
        device: &dyn Device,
        staging: &mut StagingBuffer,
        data: &[u8],
        dst: gpu::BufferRange,
    ) {
        if data.is_empty() || dst.buffer.is_none() {
            return;
        }

        // Flushing mid-frame would need its own synchronization; the table
        // capacities keep a frame's uploads within the staging ring.
        let span = staging
            .stage(device, data)
            .expect("mesh upload exceeded the staging ring");

        self.pending_uploads.push(PendingMeshUpload { span, dst });
    }

    /// Materialises the mesh through the cache, loading and uploading it if
    /// this is the first use.
    pub fn get_or_create_mesh(
        &mut self,
        device: &dyn Device,
        staging: &mut StagingBuffer,
        resource: ResourceId,
    ) -> MeshHandle {
        if let Some(&handle) = self.cached_meshes.get(&resource) {
            return handle;
        }

        // TODO: let it load asynchronously instead of blocking
        let asset = match self.mesh_source.load(resource) {
            Ok(asset) => asset,
            Err(err) => {
                log::error!("failed to load mesh {:?}: {:#}", resource, err);
                return MeshHandle(0);
            }
        };

        let handle = match self.meshes.create_mesh(
            asset.raster_index_type(),
            asset.vertex_count(),
            asset.index_count(),
            asset.meshlet_count(),
        ) {
            Ok(handle) => handle,
            Err(err) => {
                log::error!("mesh table allocation failed for {:?}: {:#}", resource, err);
                return MeshHandle(0);
            }
        };

        let positions = self.meshes.attribute_range(handle, VertexAttribute::Position);
        self.defer_upload(device, staging, as_bytes(&asset.positions), positions);

        let normals = self.meshes.attribute_range(handle, VertexAttribute::Normal);
        self.defer_upload(device, staging, as_bytes(&asset.normals), normals);

        let tangents = self.meshes.attribute_range(handle, VertexAttribute::Tangent);
        self.defer_upload(device, staging, as_bytes(&asset.tangents), tangents);

        let uvs = self.meshes.attribute_range(handle, VertexAttribute::Uv0);
        self.defer_upload(device, staging, as_bytes(&asset.uvs), uvs);

        let indices = self.meshes.index_range(handle);
        self.defer_upload(device, staging, &asset.microindices, indices);

        let meshlets = self.meshes.meshlet_range(handle);
        self.defer_upload(device, staging, as_bytes(&asset.meshlets), meshlets);

        let range = self.meshes.get_table_range(handle);
        let draw_range = MeshDrawRange {
            vertex_offset: range.vertex_offset,
            index_offset: range.index_offset,
            meshlet_offset: range.meshlet_offset,
            meshlet_count: range.meshlet_count,
        };
        let draw_range_dst = self.meshes.mesh_data_range(handle, MeshDataBuffer::DrawRange);
        self.defer_upload(device, staging, as_bytes(std::slice::from_ref(&draw_range)), draw_range_dst);

        let aabb = GpuAabb {
            min: asset.aabb_min,
            max: asset.aabb_max,
            ..Default::default()
        };
        let aabb_dst = self.meshes.mesh_data_range(handle, MeshDataBuffer::Aabb);
        self.defer_upload(device, staging, as_bytes(std::slice::from_ref(&aabb)), aabb_dst);

        self.cached_meshes.insert(resource, handle);

        // Remember the resource so the BLAS can be built on demand later.
        self.mesh_to_blas.insert(
            handle,
            Blas {
                acceleration_structure: Handle::NONE,
                buffer: Handle::NONE,
                device_address: 0,
                full_index_buffer: Handle::NONE,
                mesh: resource,
                primitive_count: 0,
                vertex_count: 0,
            },
        );

        handle
    }

    /// Adds the instance component and index-width tag to every entity that
    /// carries a mesh resource but no instance yet.
    fn create_instances(
        &mut self,
        device: &dyn Device,
        staging: &mut StagingBuffer,
        entities: &mut EntityRegistry,
    ) {
        let candidates = entities.range(
            &[TypeId::of::<DrawMeshComponent>()],
            &[],
            &[TypeId::of::<DrawInstanceComponent>()],
        );

        if candidates.is_empty() {
            return;
        }

        let mut deferred = Deferred::default();

        for entity in candidates {
            let mesh_component = match entities.get::<DrawMeshComponent>(entity) {
                Some(component) => component,
                None => continue,
            };

            let handle = self.get_or_create_mesh(device, staging, mesh_component.mesh);
            if !handle.is_some() {
                continue;
            }

            match self.meshes.get_index_type(handle) {
                MeshIndexType::None => deferred.add_tag::<MeshIndexNoneTag>(entity),
                MeshIndexType::U8 => deferred.add_tag::<MeshIndexU8Tag>(entity),
                MeshIndexType::U16 => deferred.add_tag::<MeshIndexU16Tag>(entity),
                MeshIndexType::U32 => deferred.add_tag::<MeshIndexU32Tag>(entity),
            }

            deferred.add_component(entity, DrawInstanceComponent { mesh: handle });
            deferred.add_component(entity, DrawInstanceIdComponent::default());
        }

        deferred.apply(entities);
    }

    /// Walks the instance archetypes and produces one draw batch per
    /// archetype: a staged buffer per recognised instance component plus the
    /// filled-in global instance ids.
    pub fn generate_draw_calls(
        &mut self,
        device: &dyn Device,
        staging: &mut StagingBuffer,
        entities: &mut EntityRegistry,
    ) {
        self.create_instances(device, staging, entities);

        self.batches.clear();

        let instance_component = TypeId::of::<DrawInstanceComponent>();

        for archetype in entities.archetypes_mut() {
            if !archetype.component_types().contains(&instance_component) {
                continue;
            }

            let instance_count = archetype.entity_count() as u32;
            if instance_count == 0 {
                continue;
            }

            let instance_table_id = self.batches.len() as u32;

            let mut batch = DrawBatch {
                instance_table_id,
                instance_count,
                instance_buffers: Vec::new(),
            };

            for index in 0..instance_count {
                archetype.set(
                    index as usize,
                    make_global_instance_id(instance_table_id, index),
                );
            }

            // TODO: don't blindly re-stage every instance buffer each frame
            let component_types: Vec<TypeId> = archetype.component_types().to_vec();
            for component_type in component_types {
                let info = match self.instance_types.try_find(component_type) {
                    Some(info) => info,
                    None => continue,
                };
                let gpu_buffer_id = info.gpu_buffer_id;

                let bytes = archetype
                    .column_bytes(component_type)
                    .expect("column for declared component");

                match staging.stage(device, bytes) {
                    Ok(span) => batch.instance_buffers.push((gpu_buffer_id, span)),
                    Err(err) => {
                        log::error!("instance buffer staging failed: {:#}", err);
                    }
                }
            }

            self.batches.push(batch);
        }

        self.mesh_database = self.meshes.create_mesh_table_lookup();
    }

    /// Records the staged mesh uploads, bracketed by global barriers.
    pub fn flush_uploads(&mut self, device: &dyn Device, cmd: gpu::CommandBuffer, staging: &StagingBuffer) {
        if self.pending_uploads.is_empty() {
            return;
        }

        device.cmd_apply_barriers(
            cmd,
            &gpu::Barriers {
                memory: &[gpu::GlobalBarrier {
                    previous_pipelines: gpu::PipelineStages::GRAPHICS
                        | gpu::PipelineStages::COMPUTE
                        | gpu::PipelineStages::ACCELERATION_STRUCTURE_BUILD,
                    previous_accesses: gpu::MemoryAccess::ANY_READ,
                    next_pipelines: gpu::PipelineStages::TRANSFER,
                    next_accesses: gpu::MemoryAccess::ANY_WRITE,
                }],
                ..Default::default()
            },
        );

        for upload in self.pending_uploads.drain(..) {
            staging.upload(device, cmd, &upload.span, upload.dst.buffer, upload.dst.offset);
        }

        device.cmd_apply_barriers(
            cmd,
            &gpu::Barriers {
                memory: &[gpu::GlobalBarrier {
                    previous_pipelines: gpu::PipelineStages::TRANSFER,
                    previous_accesses: gpu::MemoryAccess::ANY_WRITE,
                    next_pipelines: gpu::PipelineStages::GRAPHICS
                        | gpu::PipelineStages::COMPUTE
                        | gpu::PipelineStages::ACCELERATION_STRUCTURE_BUILD,
                    next_accesses: gpu::MemoryAccess::ANY_READ,
                }],
                ..Default::default()
            },
        );
    }

    fn release_tlas(&mut self, device: &dyn Device) {
        let submit_index = device.get_submit_index();

        if self.tlas.is_some() {
            device.destroy_deferred(gpu::GpuObject::AccelerationStructure(self.tlas), submit_index);
            self.tlas = Handle::NONE;
        }
        if self.tlas_buffer.is_some() {
            device.destroy_deferred(gpu::GpuObject::Buffer(self.tlas_buffer), submit_index);
            self.tlas_buffer = Handle::NONE;
        }
    }

    fn build_blas_for_mesh(
        &mut self,
        device: &dyn Device,
        staging: &mut StagingBuffer,
        mesh: MeshHandle,
        queued: &mut Vec<QueuedBlasBuild>,
        blas_upload_ranges: &mut Vec<gpu::BufferRange>,
    ) -> bool {
        let resource = match self.mesh_to_blas.get(&mesh) {
            Some(blas) => blas.mesh,
            None => return false,
        };

        let asset = match self.mesh_source.load(resource) {
            Ok(asset) => asset,
            Err(err) => {
                log::error!("failed to load mesh {:?} for BLAS: {:#}", resource, err);
                return false;
            }
        };

        use byte_slice_cast::AsByteSlice;

        let (index_type, index_bytes): (gpu::IndexType, Vec<u8>) = match asset.full_index_type {
            MeshIndexType::U16 => {
                let narrowed: Vec<u16> = asset.indices.iter().map(|&i| i as u16).collect();
                (gpu::IndexType::U16, narrowed.as_byte_slice().to_vec())
            }
            MeshIndexType::U32 => (gpu::IndexType::U32, asset.indices.as_byte_slice().to_vec()),
            _ => {
                log::error!("ray tracing only supports u16 and u32 indices");
                return false;
            }
        };

        // The AS builder cannot use the u8 micro-indices; promote the full
        // index buffer into its own allocation.
        let full_index_buffer = match device.create_buffer(&gpu::BufferDesc {
            size: index_bytes.len() as u64,
            usage: gpu::BufferUsage::TRANSFER_DESTINATION
                | gpu::BufferUsage::INDEX
                | gpu::BufferUsage::STORAGE
                | gpu::BufferUsage::DEVICE_ADDRESS
                | gpu::BufferUsage::ACCELERATION_STRUCTURE_INPUT,
            memory_usage: gpu::MemoryUsage::GpuOnly,
            debug_label: "blas index buffer",
        }) {
            Ok(buffer) => buffer,
            Err(err) => {
                log::error!("BLAS index buffer allocation failed: {:#}", err);
                return false;
            }
        };

        let index_buffer_range = gpu::BufferRange {
            buffer: full_index_buffer,
            offset: 0,
            size: index_bytes.len() as u64,
        };

        let positions = self.meshes.attribute_range(mesh, VertexAttribute::Position);
        let vertex_address = device.get_device_address(positions);
        let index_address = device.get_device_address(index_buffer_range);

        let geometry = gpu::AsTriangleGeometry {
            vertex_address,
            vertex_stride: 12,
            max_vertex: asset.vertex_count().saturating_sub(1),
            index_type,
            index_address,
            primitive_count: asset.indices.len() as u32 / 3,
        };

        let sizes = device.get_acceleration_structure_build_sizes(&gpu::AsGeometry::Triangles(geometry));

        let blas_buffer = match device.create_buffer(&gpu::BufferDesc {
            size: sizes.acceleration_structure_size,
            usage: gpu::BufferUsage::ACCELERATION_STRUCTURE_STORAGE | gpu::BufferUsage::DEVICE_ADDRESS,
            memory_usage: gpu::MemoryUsage::GpuOnly,
            debug_label: "blas storage",
        }) {
            Ok(buffer) => buffer,
            Err(err) => {
                log::error!("BLAS storage allocation failed: {:#}", err);
                device.destroy_deferred(gpu::GpuObject::Buffer(full_index_buffer), device.get_submit_index());
                return false;
            }
        };

        let acceleration_structure = match device.create_acceleration_structure(&gpu::AccelerationStructureDesc {
            kind: gpu::AccelerationStructureKind::BottomLevel,
            buffer: gpu::BufferRange {
                buffer: blas_buffer,
                offset: 0,
                size: sizes.acceleration_structure_size,
            },
        }) {
            Ok(handle) => handle,
            Err(err) => {
                log::error!("failed to create BLAS for mesh {:?}: {:#}", resource, err);
                let submit_index = device.get_submit_index();
                device.destroy_deferred(gpu::GpuObject::Buffer(blas_buffer), submit_index);
                device.destroy_deferred(gpu::GpuObject::Buffer(full_index_buffer), submit_index);
                return false;
            }
        };

        let device_address = device.get_acceleration_structure_address(acceleration_structure);

        // Upload the promoted index buffer and expose it to the ray tracing
        // pipeline through the mesh table.
        self.defer_upload(device, staging, &index_bytes, index_buffer_range);
        blas_upload_ranges.push(index_buffer_range);

        let gpu_index_type = match index_type {
            gpu::IndexType::U16 => 2u32,
            gpu::IndexType::U32 => 3u32,
        };
        let full_index_data = GpuFullIndexBuffer {
            device_address: index_address,
            index_type: gpu_index_type,
            ..Default::default()
        };
        let full_index_dst = self.meshes.mesh_data_range(mesh, MeshDataBuffer::FullIndexBuffer);
        self.defer_upload(
            device,
            staging,
            as_bytes(std::slice::from_ref(&full_index_data)),
            full_index_dst,
        );

        queued.push(QueuedBlasBuild {
            acceleration_structure,
            geometry,
            scratch_size: round_up(sizes.build_scratch_size, 256),
        });

        let blas = self.mesh_to_blas.get_mut(&mesh).unwrap();
        blas.acceleration_structure = acceleration_structure;
        blas.buffer = blas_buffer;
        blas.device_address = device_address;
        blas.full_index_buffer = full_index_buffer;
        blas.primitive_count = geometry.primitive_count;
        blas.vertex_count = asset.vertex_count();

        true
    }

    /// Lazily builds a BLAS per ray-traced mesh and rebuilds the TLAS from
    /// the current transforms, with the barrier chain bracketing the index
    /// uploads, the BLAS builds and the TLAS build.
    pub fn generate_raytracing_structures(
        &mut self,
        device: &dyn Device,
        cmd: gpu::CommandBuffer,
        staging: &mut StagingBuffer,
        entities: &EntityRegistry,
    ) {
        let raytraced = entities.range(
            &[
                TypeId::of::<DrawInstanceComponent>(),
                TypeId::of::<DrawInstanceIdComponent>(),
                TypeId::of::<GlobalTransformComponent>(),
            ],
            &[TypeId::of::<DrawRaytracedTag>()],
            &[],
        );

        let mut instances: Vec<gpu::AsInstanceData> = Vec::with_capacity(raytraced.len());
        let mut queued: Vec<QueuedBlasBuild> = Vec::new();
        let mut blas_upload_ranges: Vec<gpu::BufferRange> = Vec::new();

        for entity in raytraced {
            let instance = entities.get::<DrawInstanceComponent>(entity).unwrap();
            let instance_id = entities.get::<DrawInstanceIdComponent>(entity).unwrap();
            let transform = entities.get::<GlobalTransformComponent>(entity).unwrap();

            let needs_build = match self.mesh_to_blas.get(&instance.mesh) {
                Some(blas) => blas.acceleration_structure.is_none(),
                None => continue,
            };

            if needs_build
                && !self.build_blas_for_mesh(device, staging, instance.mesh, &mut queued, &mut blas_upload_ranges)
            {
                continue;
            }

            let blas = self.mesh_to_blas.get(&instance.mesh).unwrap();

            instances.push(gpu::AsInstanceData {
                transform: transform_3x4(&transform.local_to_world),
                instance_custom_index_and_mask: (instance_id.rt_instance_id & 0x00ff_ffff) | (0xff << 24),
                sbt_offset_and_flags: 0,
                acceleration_structure_address: blas.device_address,
            });
        }

        // Build the queued BLAS in one batch off a shared scratch buffer.
        if !queued.is_empty() {
            if !blas_upload_ranges.is_empty() {
                // Flush the promoted index buffers and fence them against
                // the acceleration structure build.
                self.flush_uploads(device, cmd, staging);

                let barriers: Vec<gpu::BufferBarrier> = blas_upload_ranges
                    .iter()
                    .map(|range| gpu::BufferBarrier {
                        range: *range,
                        previous_pipelines: gpu::PipelineStages::TRANSFER,
                        previous_accesses: gpu::MemoryAccess::ANY_WRITE,
                        next_pipelines: gpu::PipelineStages::ACCELERATION_STRUCTURE_BUILD,
                        next_accesses: gpu::MemoryAccess::ANY_WRITE,
                    })
                    .collect();

                device.cmd_apply_barriers(
                    cmd,
                    &gpu::Barriers {
                        buffers: &barriers,
                        ..Default::default()
                    },
                );
            }

            let scratch_total: u64 = queued.iter().map(|build| build.scratch_size).sum();

            let scratch = match device.create_buffer(&gpu::BufferDesc {
                size: scratch_total,
                usage: gpu::BufferUsage::STORAGE | gpu::BufferUsage::DEVICE_ADDRESS,
                memory_usage: gpu::MemoryUsage::GpuOnly,
                debug_label: "blas scratch",
            }) {
                Ok(buffer) => buffer,
                Err(err) => {
                    log::error!("BLAS scratch allocation failed: {:#}", err);
                    return;
                }
            };

            let submit_index = device.get_submit_index();
            device.destroy_deferred(gpu::GpuObject::Buffer(scratch), submit_index);

            let mut scratch_address = device.get_device_address(gpu::BufferRange {
                buffer: scratch,
                offset: 0,
                size: scratch_total,
            });

            let builds: Vec<gpu::AsBuild> = queued
                .iter()
                .map(|build| {
                    let as_build = gpu::AsBuild {
                        acceleration_structure: build.acceleration_structure,
                        geometry: gpu::AsGeometry::Triangles(build.geometry),
                        scratch_address,
                    };
                    scratch_address += build.scratch_size;
                    as_build
                })
                .collect();

            device.cmd_begin_debug_label(cmd, "Build BLAS");
            device.cmd_build_acceleration_structures(cmd, &builds);
            device.cmd_end_debug_label(cmd);

            device.cmd_apply_barriers(
                cmd,
                &gpu::Barriers {
                    memory: &[gpu::GlobalBarrier {
                        previous_pipelines: gpu::PipelineStages::ACCELERATION_STRUCTURE_BUILD,
                        previous_accesses: gpu::MemoryAccess::ANY_WRITE,
                        next_pipelines: gpu::PipelineStages::ACCELERATION_STRUCTURE_BUILD,
                        next_accesses: gpu::MemoryAccess::ANY_READ,
                    }],
                    ..Default::default()
                },
            );
        }

        // The TLAS is torn down and rebuilt from scratch every frame.
        self.release_tlas(device);

        let instance_bytes = as_bytes(&instances);
        let required = (instance_bytes.len() as u64).max(1 << 14);

        if self.rt_instance_buffer.is_none() || self.rt_instance_capacity < required {
            if self.rt_instance_buffer.is_some() {
                device.destroy_deferred(
                    gpu::GpuObject::Buffer(self.rt_instance_buffer),
                    device.get_submit_index(),
                );
            }

            self.rt_instance_buffer = match device.create_buffer(&gpu::BufferDesc {
                size: required,
                usage: gpu::BufferUsage::TRANSFER_DESTINATION
                    | gpu::BufferUsage::DEVICE_ADDRESS
                    | gpu::BufferUsage::ACCELERATION_STRUCTURE_INPUT,
                memory_usage: gpu::MemoryUsage::GpuOnly,
                debug_label: "tlas instances",
            }) {
                Ok(buffer) => buffer,
                Err(err) => {
                    log::error!("TLAS instance buffer allocation failed: {:#}", err);
                    return;
                }
            };
            self.rt_instance_capacity = required;
        }

        let instance_range = gpu::BufferRange {
            buffer: self.rt_instance_buffer,
            offset: 0,
            size: self.rt_instance_capacity,
        };

        if !instances.is_empty() {
            let span = match staging.stage(device, instance_bytes) {
                Ok(span) => span,
                Err(err) => {
                    log::error!("TLAS instance staging failed: {:#}", err);
                    return;
                }
            };

            let before = [gpu::BufferBarrier {
                range: instance_range,
                previous_pipelines: gpu::PipelineStages::RAYTRACING
                    | gpu::PipelineStages::ACCELERATION_STRUCTURE_BUILD,
                previous_accesses: gpu::MemoryAccess::ANY_READ,
                next_pipelines: gpu::PipelineStages::TRANSFER,
                next_accesses: gpu::MemoryAccess::ANY_WRITE,
            }];
            device.cmd_apply_barriers(cmd, &gpu::Barriers { buffers: &before, ..Default::default() });

            staging.upload(device, cmd, &span, self.rt_instance_buffer, 0);

            let after = [gpu::BufferBarrier {
                range: instance_range,
                previous_pipelines: gpu::PipelineStages::TRANSFER,
                previous_accesses: gpu::MemoryAccess::ANY_WRITE,
                next_pipelines: gpu::PipelineStages::RAYTRACING
                    | gpu::PipelineStages::ACCELERATION_STRUCTURE_BUILD,
                next_accesses: gpu::MemoryAccess::ANY_READ,
            }];
            device.cmd_apply_barriers(cmd, &gpu::Barriers { buffers: &after, ..Default::default() });
        }

        let instance_geometry = gpu::AsInstanceGeometry {
            instance_address: device.get_device_address(instance_range),
            instance_count: instances.len() as u32,
        };

        let sizes =
            device.get_acceleration_structure_build_sizes(&gpu::AsGeometry::Instances(instance_geometry));

        self.tlas_buffer = match device.create_buffer(&gpu::BufferDesc {
            size: sizes.acceleration_structure_size,
            usage: gpu::BufferUsage::ACCELERATION_STRUCTURE_STORAGE | gpu::BufferUsage::DEVICE_ADDRESS,
            memory_usage: gpu::MemoryUsage::GpuOnly,
            debug_label: "tlas storage",
        }) {
            Ok(buffer) => buffer,
            Err(err) => {
                log::error!("TLAS storage allocation failed: {:#}", err);
                return;
            }
        };

        self.tlas = match device.create_acceleration_structure(&gpu::AccelerationStructureDesc {
            kind: gpu::AccelerationStructureKind::TopLevel,
            buffer: gpu::BufferRange {
                buffer: self.tlas_buffer,
                offset: 0,
                size: sizes.acceleration_structure_size,
            },
        }) {
            Ok(handle) => handle,
            Err(err) => {
                log::error!("TLAS creation failed: {:#}", err);
                return;
            }
        };

        let scratch = match device.create_buffer(&gpu::BufferDesc {
            size: sizes.build_scratch_size.max(1),
            usage: gpu::BufferUsage::STORAGE | gpu::BufferUsage::DEVICE_ADDRESS,
            memory_usage: gpu::MemoryUsage::GpuOnly,
            debug_label: "tlas scratch",
        }) {
            Ok(buffer) => buffer,
            Err(err) => {
                log::error!("TLAS scratch allocation failed: {:#}", err);
                return;
            }
        };
        device.destroy_deferred(gpu::GpuObject::Buffer(scratch), device.get_submit_index());

        let scratch_address = device.get_device_address(gpu::BufferRange {
            buffer: scratch,
            offset: 0,
            size: sizes.build_scratch_size.max(1),
        });

        device.cmd_begin_debug_label(cmd, "Build TLAS");
        device.cmd_build_acceleration_structures(
            cmd,
            &[gpu::AsBuild {
                acceleration_structure: self.tlas,
                geometry: gpu::AsGeometry::Instances(instance_geometry),
                scratch_address,
            }],
        );
        device.cmd_end_debug_label(cmd);

        // Make the TLAS visible to ray tracing shaders.
        device.cmd_apply_barriers(
            cmd,
            &gpu::Barriers {
                memory: &[gpu::GlobalBarrier {
                    previous_pipelines: gpu::PipelineStages::ACCELERATION_STRUCTURE_BUILD,
                    previous_accesses: gpu::MemoryAccess::ANY_WRITE,
                    next_pipelines: gpu::PipelineStages::RAYTRACING,
                    next_accesses: gpu::MemoryAccess::ANY_READ,
                }],
                ..Default::default()
            },
        );
    }

    pub fn shutdown(&mut self, device: &dyn Device) {
        let submit_index = device.get_submit_index();

        for (_, blas) in self.mesh_to_blas.drain() {
            if blas.acceleration_structure.is_some() {
                device.destroy_deferred(
                    gpu::GpuObject::AccelerationStructure(blas.acceleration_structure),
                    submit_index,
                );
            }
            if blas.buffer.is_some() {
                device.destroy_deferred(gpu::GpuObject::Buffer(blas.buffer), submit_index);
            }
            if blas.full_index_buffer.is_some() {
                device.destroy_deferred(gpu::GpuObject::Buffer(blas.full_index_buffer), submit_index);
            }
        }

        self.release_tlas(device);

        if self.rt_instance_buffer.is_some() {
            device.destroy_deferred(gpu::GpuObject::Buffer(self.rt_instance_buffer), submit_index);
            self.rt_instance_buffer = Handle::NONE;
        }

        self.meshes.shutdown(device);
    }
}

fn transform_3x4(matrix: &Mat4) -> [[f32; 4]; 3] {
    let columns = matrix.to_cols_array_2d();
    let mut rows = [[0.0f32; 4]; 3];

    for (row_index, row) in rows.iter_mut().enumerate() {
        for column_index in 0..4 {
            row[column_index] = columns[column_index][row_index];
        }
    }

    rows
}

fn as_bytes<T: Copy>(slice: &[T]) -> &[u8] {
    unsafe {
        std::slice::from_raw_parts(slice.as_ptr() as *const u8, std::mem::size_of::<T>() * slice.len())
    }
}

fn round_up(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) & !(alignment - 1)
}
