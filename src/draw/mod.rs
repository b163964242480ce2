//! Draw registry: maps the entity store onto GPU-consumable draw batches,
//! owns the mesh table, and builds the ray tracing acceleration structures.

pub mod mesh;
pub mod mesh_table;
pub mod registry;

pub use mesh::{FileMeshSource, MemoryMeshSource, MeshAsset, MeshIndexType, MeshSource, ResourceId};
pub use mesh_table::{MeshHandle, MeshTable};
pub use registry::*;
