use crate::draw::{DrawRegistry, InstanceDataTypeRegistry, MeshSource};
use crate::ecs::EntityRegistry;
use crate::shader::{HotwatchWatcher, ShaderCache};
use anyhow::Result;
use fg::{
    BuildArgs, ExecuteArgs, FrameGraph, PassManager, ShaderCompilerConfig, TextureRegistry,
};
use gpu_core::{self as gpu, Device, StagingBuffer};
use std::path::PathBuf;

const UPLOAD_STAGING_SIZE: u64 = 64 << 20;
const MAX_BINDLESS_IMAGES: u32 = 2048;

pub struct RendererDesc {
    pub shader_include_dirs: Vec<PathBuf>,
    pub spirv_cache_dir: PathBuf,
    pub mesh_source: Box<dyn MeshSource>,
    pub instance_types: InstanceDataTypeRegistry,
    /// Directory watching is optional; headless runs skip it.
    pub enable_hot_reload: bool,
}

/// Ties the pieces together and drives one frame: draw registry update,
/// frame graph build, then execute into the frame's command buffer.
pub struct Renderer {
    pub pass_manager: PassManager,
    pub frame_graph: FrameGraph,
    pub staging: StagingBuffer,
    pub texture_registry: TextureRegistry,
    pub draw_registry: DrawRegistry,
    pub config: ShaderCompilerConfig,
}

impl Renderer {
    pub fn new(device: &dyn Device, desc: RendererDesc) -> Result<Self> {
        let compiler = ShaderCache::new(desc.spirv_cache_dir, desc.shader_include_dirs);

        let instance_defines = desc.instance_types.make_defines();

        let mut pass_manager =
            PassManager::new(device, Box::new(compiler), None, MAX_BINDLESS_IMAGES)?;

        if desc.enable_hot_reload {
            match HotwatchWatcher::new(pass_manager.watch_queue()) {
                Ok(watcher) => pass_manager.set_watcher(Box::new(watcher)),
                Err(err) => log::warn!("shader hot reload unavailable: {:#}", err),
            }
        }

        pass_manager.update_instance_data_defines(instance_defines);

        Ok(Self {
            pass_manager,
            frame_graph: FrameGraph::new(device)?,
            staging: StagingBuffer::new(device, UPLOAD_STAGING_SIZE)?,
            texture_registry: TextureRegistry::new(MAX_BINDLESS_IMAGES),
            draw_registry: DrawRegistry::new(device, desc.mesh_source, desc.instance_types)?,
            config: ShaderCompilerConfig::default(),
        })
    }

    /// Runs one frame: the draw registry consumes the entity store, then
    /// the frame graph builds and executes into `cmd`. The caller submits
    /// the command buffer and advances the device's frame afterwards.
    pub fn render_frame(
        &mut self,
        device: &dyn Device,
        cmd: gpu::CommandBuffer,
        entities: &mut EntityRegistry,
    ) -> Result<()> {
        self.staging.restore_all();

        self.draw_registry
            .generate_draw_calls(device, &mut self.staging, entities);
        self.draw_registry.flush_uploads(device, cmd, &self.staging);
        self.draw_registry
            .generate_raytracing_structures(device, cmd, &mut self.staging, entities);

        self.frame_graph.build(BuildArgs {
            device,
            pass_manager: &mut self.pass_manager,
            staging: &mut self.staging,
            texture_registry: &mut self.texture_registry,
            config: self.config,
        })?;

        self.frame_graph.execute(ExecuteArgs {
            device,
            cmd,
            pass_manager: &mut self.pass_manager,
            staging: &mut self.staging,
            texture_registry: &mut self.texture_registry,
        });

        Ok(())
    }

    pub fn shutdown(&mut self, device: &dyn Device) {
        self.frame_graph.shutdown(device);
        self.draw_registry.shutdown(device);
        self.pass_manager.shutdown(device);
    }
}
