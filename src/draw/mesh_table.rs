use crate::draw::mesh::MeshIndexType;
use anyhow::{ensure, Result};
use gpu_core::{self as gpu, Device, Handle};

/// Vertex attribute columns of the mesh table, SoA.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VertexAttribute {
    Position,
    Normal,
    Tangent,
    Uv0,
}

pub const VERTEX_ATTRIBUTE_COUNT: usize = 4;

pub fn attribute_element_size(attribute: VertexAttribute) -> u64 {
    match attribute {
        VertexAttribute::Position | VertexAttribute::Normal => 12,
        VertexAttribute::Tangent => 16,
        VertexAttribute::Uv0 => 8,
    }
}

const ATTRIBUTES: [VertexAttribute; VERTEX_ATTRIBUTE_COUNT] = [
    VertexAttribute::Position,
    VertexAttribute::Normal,
    VertexAttribute::Tangent,
    VertexAttribute::Uv0,
];

/// Per-mesh side-band buffers addressed by mesh slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MeshDataBuffer {
    DrawRange,
    Aabb,
    FullIndexBuffer,
}

pub const MESH_DATA_BUFFER_COUNT: usize = 3;

/// Layout of one `MeshDataBuffer::DrawRange` element, consumed by shaders.
#[derive(Clone, Copy, Debug, Default)]
#[repr(C)]
pub struct MeshDrawRange {
    pub vertex_offset: u32,
    pub index_offset: u32,
    pub meshlet_offset: u32,
    pub meshlet_count: u32,
}

#[derive(Clone, Copy, Debug, Default)]
#[repr(C)]
pub struct GpuAabb {
    pub min: [f32; 3],
    pub _pad0: f32,
    pub max: [f32; 3],
    pub _pad1: f32,
}

/// Device address + index width of a promoted full index buffer, consumed
/// by ray tracing shaders.
#[derive(Clone, Copy, Debug, Default)]
#[repr(C)]
pub struct GpuFullIndexBuffer {
    pub device_address: u64,
    pub index_type: u32,
    pub _padding: u32,
}

fn mesh_data_element_size(buffer: MeshDataBuffer) -> u64 {
    match buffer {
        MeshDataBuffer::DrawRange => std::mem::size_of::<MeshDrawRange>() as u64,
        MeshDataBuffer::Aabb => std::mem::size_of::<GpuAabb>() as u64,
        MeshDataBuffer::FullIndexBuffer => std::mem::size_of::<GpuFullIndexBuffer>() as u64,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct MeshHandle(pub u32);

impl MeshHandle {
    pub fn is_some(self) -> bool {
        self.0 != 0
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct MeshTableRange {
    pub vertex_offset: u32,
    pub vertex_count: u32,
    pub index_offset: u32,
    pub index_count: u32,
    pub meshlet_offset: u32,
    pub meshlet_count: u32,
}

struct MeshRecord {
    range: MeshTableRange,
    index_type: MeshIndexType,
}

pub struct MeshTableInit {
    pub vertex_capacity: u32,
    pub index_capacity: u32,
    pub mesh_capacity: u32,
    pub meshlet_capacity: u32,
    pub meshlet_element_size: u64,
}

impl Default for MeshTableInit {
    fn default() -> Self {
        // TODO: sub-allocate one big buffer in fixed size batches instead
        // of hard capacities.
        Self {
            vertex_capacity: 1 << 24,
            index_capacity: 1 << 28,
            mesh_capacity: 1 << 14,
            meshlet_capacity: 1 << 20,
            meshlet_element_size: 16,
        }
    }
}

/// Big shared buffers all meshes suballocate ranges from: one buffer per
/// vertex attribute, a micro-index buffer, a meshlet buffer, and the
/// per-mesh data columns.
pub struct MeshTable {
    vertex_buffers: [Handle<gpu::Buffer>; VERTEX_ATTRIBUTE_COUNT],
    index_buffer: Handle<gpu::Buffer>,
    meshlet_buffer: Handle<gpu::Buffer>,
    mesh_data_buffers: [Handle<gpu::Buffer>; MESH_DATA_BUFFER_COUNT],
    meshlet_element_size: u64,

    vertex_capacity: u32,
    index_capacity: u32,
    mesh_capacity: u32,
    meshlet_capacity: u32,

    vertex_head: u32,
    index_head: u32,
    meshlet_head: u32,

    meshes: Vec<MeshRecord>,
}

impl MeshTable {
    pub fn new(device: &dyn Device, init: &MeshTableInit) -> Result<Self> {
        let buffer_usage = gpu::BufferUsage::TRANSFER_DESTINATION
            | gpu::BufferUsage::STORAGE
            | gpu::BufferUsage::DEVICE_ADDRESS
            | gpu::BufferUsage::ACCELERATION_STRUCTURE_INPUT;

        let mut vertex_buffers = [Handle::NONE; VERTEX_ATTRIBUTE_COUNT];
        for (buffer, attribute) in vertex_buffers.iter_mut().zip(ATTRIBUTES.iter()) {
            *buffer = device.create_buffer(&gpu::BufferDesc {
                size: u64::from(init.vertex_capacity) * attribute_element_size(*attribute),
                usage: buffer_usage,
                memory_usage: gpu::MemoryUsage::GpuOnly,
                debug_label: "mesh table vertex data",
            })?;
        }

        let index_buffer = device.create_buffer(&gpu::BufferDesc {
            size: u64::from(init.index_capacity),
            usage: buffer_usage | gpu::BufferUsage::INDEX,
            memory_usage: gpu::MemoryUsage::GpuOnly,
            debug_label: "mesh table micro indices",
        })?;

        let meshlet_buffer = device.create_buffer(&gpu::BufferDesc {
            size: u64::from(init.meshlet_capacity) * init.meshlet_element_size,
            usage: buffer_usage,
            memory_usage: gpu::MemoryUsage::GpuOnly,
            debug_label: "mesh table meshlets",
        })?;

        let mut mesh_data_buffers = [Handle::NONE; MESH_DATA_BUFFER_COUNT];
        let mesh_data = [
            MeshDataBuffer::DrawRange,
            MeshDataBuffer::Aabb,
            MeshDataBuffer::FullIndexBuffer,
        ];
        for (buffer, kind) in mesh_data_buffers.iter_mut().zip(mesh_data.iter()) {
            *buffer = device.create_buffer(&gpu::BufferDesc {
                size: u64::from(init.mesh_capacity) * mesh_data_element_size(*kind),
                usage: buffer_usage,
                memory_usage: gpu::MemoryUsage::GpuOnly,
                debug_label: "mesh table mesh data",
            })?;
        }

        Ok(Self {
            vertex_buffers,
            index_buffer,
            meshlet_buffer,
            mesh_data_buffers,
            meshlet_element_size: init.meshlet_element_size,
            vertex_capacity: init.vertex_capacity,
            index_capacity: init.index_capacity,
            mesh_capacity: init.mesh_capacity,
            meshlet_capacity: init.meshlet_capacity,
            vertex_head: 0,
            index_head: 0,
            meshlet_head: 0,
            meshes: Vec::new(),
        })
    }

    pub fn create_mesh(
        &mut self,
        index_type: MeshIndexType,
        vertex_count: u32,
        index_count: u32,
        meshlet_count: u32,
    ) -> Result<MeshHandle> {
        ensure!(self.meshes.len() < self.mesh_capacity as usize, "mesh table full");
        ensure!(self.vertex_head + vertex_count <= self.vertex_capacity, "vertex capacity exceeded");
        ensure!(self.index_head + index_count <= self.index_capacity, "index capacity exceeded");
        ensure!(
            self.meshlet_head + meshlet_count <= self.meshlet_capacity,
            "meshlet capacity exceeded"
        );

        let range = MeshTableRange {
            vertex_offset: self.vertex_head,
            vertex_count,
            index_offset: self.index_head,
            index_count,
            meshlet_offset: self.meshlet_head,
            meshlet_count,
        };

        self.vertex_head += vertex_count;
        self.index_head += index_count;
        self.meshlet_head += meshlet_count;

        self.meshes.push(MeshRecord { range, index_type });

        // Slot 0 stays invalid.
        Ok(MeshHandle(self.meshes.len() as u32))
    }

    fn record(&self, handle: MeshHandle) -> Option<&MeshRecord> {
        if handle.0 == 0 {
            return None;
        }
        self.meshes.get(handle.0 as usize - 1)
    }

    pub fn get_table_range(&self, handle: MeshHandle) -> MeshTableRange {
        self.record(handle).map(|record| record.range).unwrap_or_default()
    }

    pub fn get_index_type(&self, handle: MeshHandle) -> MeshIndexType {
        self.record(handle)
            .map(|record| record.index_type)
            .unwrap_or(MeshIndexType::None)
    }

    /// Range of an attribute column covering this mesh's vertices.
    pub fn attribute_range(&self, handle: MeshHandle, attribute: VertexAttribute) -> gpu::BufferRange {
        let record = match self.record(handle) {
            Some(record) => record,
            None => return gpu::BufferRange::default(),
        };

        let elem = attribute_element_size(attribute);
        let index = ATTRIBUTES.iter().position(|a| *a == attribute).unwrap();

        gpu::BufferRange {
            buffer: self.vertex_buffers[index],
            offset: u64::from(record.range.vertex_offset) * elem,
            size: u64::from(record.range.vertex_count) * elem,
        }
    }

    pub fn index_range(&self, handle: MeshHandle) -> gpu::BufferRange {
        let record = match self.record(handle) {
            Some(record) => record,
            None => return gpu::BufferRange::default(),
        };

        gpu::BufferRange {
            buffer: self.index_buffer,
            offset: u64::from(record.range.index_offset),
            size: u64::from(record.range.index_count),
        }
    }

    pub fn meshlet_range(&self, handle: MeshHandle) -> gpu::BufferRange {
        let record = match self.record(handle) {
            Some(record) => record,
            None => return gpu::BufferRange::default(),
        };

        gpu::BufferRange {
            buffer: self.meshlet_buffer,
            offset: u64::from(record.range.meshlet_offset) * self.meshlet_element_size,
            size: u64::from(record.range.meshlet_count) * self.meshlet_element_size,
        }
    }

    /// Range of one per-mesh data element for this mesh's slot.
    pub fn mesh_data_range(&self, handle: MeshHandle, buffer: MeshDataBuffer) -> gpu::BufferRange {
        if self.record(handle).is_none() {
            return gpu::BufferRange::default();
        }

        let elem = mesh_data_element_size(buffer);
        let slot = u64::from(handle.0 - 1);

        gpu::BufferRange {
            buffer: self.mesh_data_buffers[buffer as usize],
            offset: slot * elem,
            size: elem,
        }
    }

    /// Compact lookup blob describing every mesh's draw range, consumed by
    /// the visibility shaders as the mesh database.
    pub fn create_mesh_table_lookup(&self) -> Vec<u8> {
        let mut blob = Vec::with_capacity(self.meshes.len() * std::mem::size_of::<MeshDrawRange>());

        for record in &self.meshes {
            let draw_range = MeshDrawRange {
                vertex_offset: record.range.vertex_offset,
                index_offset: record.range.index_offset,
                meshlet_offset: record.range.meshlet_offset,
                meshlet_count: record.range.meshlet_count,
            };

            let bytes = unsafe {
                std::slice::from_raw_parts(
                    &draw_range as *const MeshDrawRange as *const u8,
                    std::mem::size_of::<MeshDrawRange>(),
                )
            };
            blob.extend_from_slice(bytes);
        }

        blob
    }

    pub fn shutdown(&mut self, device: &dyn Device) {
        let submit_index = device.get_submit_index();

        for buffer in self
            .vertex_buffers
            .iter()
            .chain(self.mesh_data_buffers.iter())
            .chain([self.index_buffer, self.meshlet_buffer].iter())
        {
            if buffer.is_some() {
                device.destroy_deferred(gpu::GpuObject::Buffer(*buffer), submit_index);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpu_core::mock::MockDevice;

    #[test]
    fn ranges_do_not_overlap() {
        let device = MockDevice::new();
        let mut table = MeshTable::new(
            &device,
            &MeshTableInit {
                vertex_capacity: 1024,
                index_capacity: 4096,
                mesh_capacity: 16,
                meshlet_capacity: 64,
                meshlet_element_size: 16,
            },
        )
        .unwrap();

        let a = table.create_mesh(MeshIndexType::U8, 100, 300, 4).unwrap();
        let b = table.create_mesh(MeshIndexType::U8, 50, 150, 2).unwrap();

        let ra = table.get_table_range(a);
        let rb = table.get_table_range(b);

        assert_eq!(ra.vertex_offset, 0);
        assert_eq!(rb.vertex_offset, 100);
        assert_eq!(rb.index_offset, 300);
        assert_eq!(rb.meshlet_offset, 4);

        let pa = table.attribute_range(a, VertexAttribute::Position);
        let pb = table.attribute_range(b, VertexAttribute::Position);
        assert_eq!(pa.buffer, pb.buffer);
        assert_eq!(pa.offset + pa.size, pb.offset);
    }

    #[test]
    fn capacity_is_enforced() {
        let device = MockDevice::new();
        let mut table = MeshTable::new(
            &device,
            &MeshTableInit {
                vertex_capacity: 10,
                index_capacity: 10,
                mesh_capacity: 16,
                meshlet_capacity: 16,
                meshlet_element_size: 16,
            },
        )
        .unwrap();

        assert!(table.create_mesh(MeshIndexType::U8, 20, 0, 0).is_err());
    }
}
