use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Identifier of a mesh resource, stable across runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct ResourceId(pub u128);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MeshIndexType {
    None,
    U8,
    U16,
    U32,
}

impl Default for MeshIndexType {
    fn default() -> Self {
        MeshIndexType::None
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct Meshlet {
    pub vertex_offset: u32,
    pub vertex_count: u32,
    pub index_offset: u32,
    pub index_count: u32,
}

/// Pre-packed mesh data as produced by the import pipeline (out of scope
/// here); loaded synchronously through a [`MeshSource`].
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct MeshAsset {
    pub positions: Vec<[f32; 3]>,
    pub normals: Vec<[f32; 3]>,
    pub tangents: Vec<[f32; 4]>,
    pub uvs: Vec<[f32; 2]>,

    /// Meshlet-local micro-indices; u8 is the only supported width.
    pub microindices: Vec<u8>,
    pub meshlets: Vec<Meshlet>,

    /// Full index buffer for the acceleration structure path.
    pub indices: Vec<u32>,
    pub full_index_type: MeshIndexType,

    pub aabb_min: [f32; 3],
    pub aabb_max: [f32; 3],
}

impl MeshAsset {
    pub fn vertex_count(&self) -> u32 {
        self.positions.len() as u32
    }

    pub fn index_count(&self) -> u32 {
        self.microindices.len() as u32
    }

    pub fn meshlet_count(&self) -> u32 {
        self.meshlets.len() as u32
    }

    /// Index width used for rasterization (micro-indices).
    pub fn raster_index_type(&self) -> MeshIndexType {
        if self.microindices.is_empty() {
            MeshIndexType::None
        } else {
            MeshIndexType::U8
        }
    }
}

/// Where the draw registry materialises meshes from.
pub trait MeshSource {
    fn load(&self, id: ResourceId) -> Result<MeshAsset>;
}

/// Loads bincode-serialized mesh assets from `{root}/{id:032x}.mesh`.
pub struct FileMeshSource {
    root: PathBuf,
}

impl FileMeshSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn asset_path(&self, id: ResourceId) -> PathBuf {
        self.root.join(format!("{:032x}.mesh", id.0))
    }

    pub fn save(&self, id: ResourceId, asset: &MeshAsset) -> Result<()> {
        std::fs::create_dir_all(&self.root)?;
        let bytes = bincode::serialize(asset)?;
        std::fs::write(self.asset_path(id), bytes)?;
        Ok(())
    }
}

impl MeshSource for FileMeshSource {
    fn load(&self, id: ResourceId) -> Result<MeshAsset> {
        let path = self.asset_path(id);
        let bytes = std::fs::read(&path)
            .map_err(|err| anyhow!("failed to read mesh {}: {}", path.display(), err))?;
        Ok(bincode::deserialize(&bytes)?)
    }
}

/// In-memory source, used by tests and procedural content.
#[derive(Default)]
pub struct MemoryMeshSource {
    meshes: HashMap<ResourceId, MeshAsset>,
}

impl MemoryMeshSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: ResourceId, asset: MeshAsset) {
        self.meshes.insert(id, asset);
    }
}

impl MeshSource for MemoryMeshSource {
    fn load(&self, id: ResourceId) -> Result<MeshAsset> {
        self.meshes
            .get(&id)
            .cloned()
            .ok_or_else(|| anyhow!("unknown mesh resource {:?}", id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_source_round_trips() {
        let dir = std::env::temp_dir().join(format!("frame-rs-mesh-{}", std::process::id()));
        let source = FileMeshSource::new(&dir);

        let asset = MeshAsset {
            positions: vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
            indices: vec![0, 1, 2],
            full_index_type: MeshIndexType::U16,
            ..Default::default()
        };

        let id = ResourceId(0xabc);
        source.save(id, &asset).unwrap();

        let loaded = source.load(id).unwrap();
        assert_eq!(loaded.positions.len(), 3);
        assert_eq!(loaded.full_index_type, MeshIndexType::U16);
        assert!(source.load(ResourceId(0xdef)).is_err());
    }
}
