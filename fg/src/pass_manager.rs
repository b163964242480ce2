use crate::reflection::{
    DescriptorBinding, PipelineReflection, PushConstantReflection, BINDLESS_TEXTURES_BINDING,
    SAMPLERS_BINDING,
};
use crate::texture_registry::TextureRegistry;
use anyhow::{anyhow, Result};
use gpu_core::{self as gpu, Device, Handle, HandlePool, ShaderStage};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

// Handle markers.
pub enum ComputePass {}
pub enum RenderPass {}
pub enum RayTracingPass {}
pub enum ComputePipeline {}
pub enum RenderPipeline {}
pub enum RayTracingPipeline {}

/// Raster stages a render pass template may combine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RasterStage {
    Mesh,
    Vertex,
    Fragment,
}

impl RasterStage {
    fn shader_stage(self) -> ShaderStage {
        match self {
            RasterStage::Mesh => ShaderStage::Mesh,
            RasterStage::Vertex => ShaderStage::Vertex,
            RasterStage::Fragment => ShaderStage::Fragment,
        }
    }

    fn stage_define(self) -> &'static str {
        match self {
            RasterStage::Mesh => "FG_STAGE_MESH",
            RasterStage::Vertex => "FG_STAGE_VERTEX",
            RasterStage::Fragment => "FG_STAGE_FRAGMENT",
        }
    }
}

fn raytracing_stage_define(stage: ShaderStage) -> &'static str {
    match stage {
        ShaderStage::Raygen => "FG_STAGE_RAYGEN",
        ShaderStage::Intersection => "FG_STAGE_INTERSECTION",
        ShaderStage::AnyHit => "FG_STAGE_ANY_HIT",
        ShaderStage::ClosestHit => "FG_STAGE_CLOSEST_HIT",
        ShaderStage::Miss => "FG_STAGE_MISS",
        ShaderStage::Callable => "FG_STAGE_CALLABLE",
        _ => unreachable!(),
    }
}

fn deduce_raytracing_stage(path: &Path) -> Result<ShaderStage> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("rgen") => Ok(ShaderStage::Raygen),
        Some("rint") => Ok(ShaderStage::Intersection),
        Some("rahit") => Ok(ShaderStage::AnyHit),
        Some("rchit") => Ok(ShaderStage::ClosestHit),
        Some("rmiss") => Ok(ShaderStage::Miss),
        Some("rcall") => Ok(ShaderStage::Callable),
        other => Err(anyhow!("unrecognized ray tracing shader extension: {:?}", other)),
    }
}

// ---------------------------------------------------------------------------
// Shader compilation seam

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CompilerOptions {
    pub optimize: bool,
    pub debug_info: bool,
    pub emit_line_directives: bool,
    pub prefer_glslang: bool,
    pub enable_cache: bool,
}

pub struct ShaderCompileRequest<'a> {
    pub path: &'a Path,
    pub stage: ShaderStage,
    pub preamble: &'a str,
    pub options: CompilerOptions,
    pub debug_name: &'a str,
}

pub struct CompiledShader {
    pub spirv: Vec<u32>,
    /// Every source file the compilation referenced, includes included.
    pub source_files: Vec<PathBuf>,
}

/// Produces SPIR-V for a source file; implementations preprocess, cache and
/// pick a back-end compiler.
pub trait ShaderCompiler {
    fn compile(&mut self, request: &ShaderCompileRequest<'_>) -> Result<CompiledShader>;
}

/// Subscribes directories to the hot-reload file watcher.
pub trait SourceWatcher {
    fn watch(&mut self, path: &Path);
}

/// Queue of files touched on disk, filled by the watcher thread and drained
/// by the pass manager at `begin_frame`.
pub type WatchQueue = Arc<Mutex<HashSet<PathBuf>>>;

/// Build-time configuration of the shader pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShaderCompilerConfig {
    pub prefer_glslang: bool,
    pub optimize_shaders: bool,
    pub emit_debug_info: bool,
    pub emit_line_directives: bool,
    pub enable_printf: bool,
    pub enable_spirv_cache: bool,
    pub is_ray_tracing_enabled: bool,
}

impl Default for ShaderCompilerConfig {
    fn default() -> Self {
        Self {
            prefer_glslang: false,
            optimize_shaders: false,
            emit_debug_info: false,
            emit_line_directives: false,
            enable_printf: false,
            enable_spirv_cache: true,
            is_ray_tracing_enabled: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Pipeline initializers

#[derive(Clone, Debug, Default)]
pub struct ComputePipelineInit {
    pub defines: Vec<String>,
}

#[derive(Clone, Debug, Default)]
pub struct RenderPipelineInit {
    pub defines: Vec<String>,
    pub render_targets: gpu::RenderTargetsDesc,
    pub rasterization: gpu::RasterizationState,
    pub depth_stencil: gpu::DepthStencilState,
}

#[derive(Clone, Debug, Default)]
pub struct RayTracingPipelineInit {
    pub defines: Vec<String>,
    pub max_ray_recursion_depth: u32,
}

#[derive(Clone, Debug)]
pub struct ComputePassInit {
    pub name: String,
    pub shader_source: PathBuf,
}

#[derive(Clone, Debug)]
pub struct RenderPassStageInit {
    pub shader_source: PathBuf,
    pub stage: RasterStage,
}

#[derive(Clone, Debug)]
pub struct RenderPassInit {
    pub name: String,
    pub stages: Vec<RenderPassStageInit>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RayTracingHitType {
    Triangle,
    Procedural,
}

#[derive(Clone, Debug)]
pub struct RayTracingHitGroupInit {
    pub hit_type: RayTracingHitType,
    pub shaders: Vec<PathBuf>,
}

#[derive(Clone, Debug)]
pub struct RayTracingPassInit {
    pub name: String,
    pub generation: PathBuf,
    pub miss: Vec<PathBuf>,
    pub hit_groups: Vec<RayTracingHitGroupInit>,
}

// ---------------------------------------------------------------------------
// Internal state

struct Variant<T: ?Sized> {
    hash: u64,
    /// `NONE` marks a variant whose compilation failed, so retries are
    /// cheap until the sources change.
    pipeline: Handle<T>,
}

struct ComputePassTemplate {
    name: String,
    shader_source: PathBuf,
    variants: Vec<Variant<ComputePipeline>>,
    should_recompile: bool,
}

struct RenderPassTemplate {
    name: String,
    stages: Vec<RenderPassStageInit>,
    variants: Vec<Variant<RenderPipeline>>,
    should_recompile: bool,
}

struct RayTracingHitGroup {
    hit_type: RayTracingHitType,
    shader_indices: Vec<u32>,
}

struct RayTracingPassTemplate {
    name: String,
    shader_sources: Vec<PathBuf>,
    shader_stages: Vec<ShaderStage>,
    generation: u32,
    miss: Vec<u32>,
    hit_groups: Vec<RayTracingHitGroup>,
    groups_count: u32,
    variants: Vec<Variant<RayTracingPipeline>>,
    should_recompile: bool,
}

/// A compiled pipeline variant plus everything reflected out of it.
pub struct PipelineState {
    pub pipeline: Handle<gpu::Pipeline>,
    pub layout: Handle<gpu::PipelineLayout>,
    pub set_layout: Handle<gpu::BindGroupLayout>,
    pub bindings: Vec<DescriptorBinding>,
    pub push_constants: Option<PushConstantReflection>,
    pub requires_bindless: bool,
    pub shader_modules: Vec<Handle<gpu::ShaderModule>>,
    pub group_size: [u32; 3],
    pub sbt_buffer: Handle<gpu::Buffer>,
    pub sbt_regions: gpu::ShaderBindingTableRegions,
    pub label: String,
    pub bind_point: gpu::BindPoint,
}

fn destroy_pipeline(device: &dyn Device, state: &PipelineState) {
    let submit_index = device.get_submit_index();

    if state.pipeline.is_some() {
        device.destroy_deferred(gpu::GpuObject::Pipeline(state.pipeline), submit_index);
    }
    if state.layout.is_some() {
        device.destroy_deferred(gpu::GpuObject::PipelineLayout(state.layout), submit_index);
    }
    for module in &state.shader_modules {
        if module.is_some() {
            device.destroy_deferred(gpu::GpuObject::ShaderModule(*module), submit_index);
        }
    }
    if state.sbt_buffer.is_some() {
        device.destroy_deferred(gpu::GpuObject::Buffer(state.sbt_buffer), submit_index);
    }
}

pub(crate) fn hash_mix(seed: u64, value: u64) -> u64 {
    wyhash::wyhash(&value.to_le_bytes(), seed)
}

/// Hashes defines in order; order matters here, which is undesirable, so
/// callers that need stability sort their define lists first.
pub fn hash_defines(defines: &[String]) -> u64 {
    let mut hash = 0u64;
    for define in defines {
        hash = wyhash::wyhash(define.as_bytes(), hash);
    }
    hash
}

#[derive(Clone, Copy)]
enum PassRef {
    Compute(Handle<ComputePass>),
    Render(Handle<RenderPass>),
    RayTracing(Handle<RayTracingPass>),
}

#[derive(Clone, Copy)]
pub struct ComputePassCtx {
    pub cmd: gpu::CommandBuffer,
    pub pipeline: Handle<ComputePipeline>,
}

#[derive(Clone, Copy)]
pub struct RenderPassCtx {
    pub cmd: gpu::CommandBuffer,
    pub pipeline: Handle<RenderPipeline>,
}

#[derive(Clone, Copy)]
pub struct RayTracingPassCtx {
    pub cmd: gpu::CommandBuffer,
    pub pipeline: Handle<RayTracingPipeline>,
}

const SAMPLER_COUNT: usize = 6;

/// Owns render/compute/ray-tracing pass templates and their compiled
/// variants, the hot-reload bookkeeping, and the global sampler + bindless
/// descriptor sets.
pub struct PassManager {
    compute_passes: HandlePool<ComputePassTemplate>,
    render_passes: HandlePool<RenderPassTemplate>,
    raytracing_passes: HandlePool<RayTracingPassTemplate>,

    compute_pipelines: HandlePool<PipelineState>,
    render_pipelines: HandlePool<PipelineState>,
    raytracing_pipelines: HandlePool<PipelineState>,

    compiler: Box<dyn ShaderCompiler>,
    watcher: Option<Box<dyn SourceWatcher>>,
    touched_files: WatchQueue,
    file_to_passes: HashMap<PathBuf, Vec<PassRef>>,

    samplers: [Handle<gpu::Sampler>; SAMPLER_COUNT],
    samplers_set_layout: Handle<gpu::BindGroupLayout>,
    bindless_set_layout: Handle<gpu::BindGroupLayout>,
    current_samplers_group: Handle<gpu::BindGroup>,
    current_bindless_group: Handle<gpu::BindGroup>,

    instance_data_defines: String,
    config: ShaderCompilerConfig,
    subgroup_size: u32,
    shader_groups: gpu::ShaderGroupInfo,
    is_ray_tracing_enabled: bool,
}

impl PassManager {
    pub fn new(
        device: &dyn Device,
        compiler: Box<dyn ShaderCompiler>,
        watcher: Option<Box<dyn SourceWatcher>>,
        max_bindless_images: u32,
    ) -> Result<Self> {
        use gpu::{SamplerAddressMode as Am, SamplerFilter as Sf};

        // Fixed layout, matching the FG_SAMPLER_* indices in shaders.
        let sampler_descs = [
            gpu::SamplerDesc { filter: Sf::Linear, address_mode: Am::Repeat, anisotropy: false },
            gpu::SamplerDesc { filter: Sf::Linear, address_mode: Am::ClampToEdge, anisotropy: false },
            gpu::SamplerDesc { filter: Sf::Linear, address_mode: Am::ClampToBorderBlack, anisotropy: false },
            gpu::SamplerDesc { filter: Sf::Linear, address_mode: Am::ClampToBorderWhite, anisotropy: false },
            gpu::SamplerDesc { filter: Sf::Nearest, address_mode: Am::Repeat, anisotropy: false },
            gpu::SamplerDesc { filter: Sf::Linear, address_mode: Am::Repeat, anisotropy: true },
        ];

        let mut samplers = [Handle::NONE; SAMPLER_COUNT];
        for (handle, desc) in samplers.iter_mut().zip(sampler_descs.iter()) {
            *handle = device.create_sampler(desc)?;
        }

        let samplers_set_layout = device.create_bind_group_layout(&gpu::BindGroupLayoutDesc {
            entries: vec![gpu::BindGroupLayoutEntry {
                binding: SAMPLERS_BINDING,
                count: SAMPLER_COUNT as u32,
                kind: gpu::DescriptorKind::Sampler,
                stages: gpu::ShaderStageFlags::ALL,
                immutable_samplers: samplers.to_vec(),
            }],
            update_after_bind: false,
        })?;

        let bindless_set_layout = device.create_bind_group_layout(&gpu::BindGroupLayoutDesc {
            entries: vec![gpu::BindGroupLayoutEntry {
                binding: BINDLESS_TEXTURES_BINDING,
                count: max_bindless_images,
                kind: gpu::DescriptorKind::SampledImage,
                stages: gpu::ShaderStageFlags::ALL,
                immutable_samplers: Vec::new(),
            }],
            update_after_bind: true,
        })?;

        let info = device.get_device_info();

        Ok(Self {
            compute_passes: HandlePool::new(),
            render_passes: HandlePool::new(),
            raytracing_passes: HandlePool::new(),
            compute_pipelines: HandlePool::new(),
            render_pipelines: HandlePool::new(),
            raytracing_pipelines: HandlePool::new(),
            compiler,
            watcher,
            touched_files: Arc::new(Mutex::new(HashSet::new())),
            file_to_passes: HashMap::new(),
            samplers,
            samplers_set_layout,
            bindless_set_layout,
            current_samplers_group: Handle::NONE,
            current_bindless_group: Handle::NONE,
            instance_data_defines: String::new(),
            config: ShaderCompilerConfig::default(),
            subgroup_size: info.subgroup_size,
            shader_groups: info.shader_groups,
            is_ray_tracing_enabled: info.is_ray_tracing_supported,
        })
    }

    /// Shared queue the directory watcher pushes touched files into.
    pub fn watch_queue(&self) -> WatchQueue {
        self.touched_files.clone()
    }

    /// Installs the source watcher after construction; useful because the
    /// watcher typically wants the watch queue first.
    pub fn set_watcher(&mut self, watcher: Box<dyn SourceWatcher>) {
        self.watcher = Some(watcher);

        // Subscribe the files that registered before the watcher existed.
        let files: Vec<PathBuf> = self.file_to_passes.keys().cloned().collect();
        if let Some(watcher) = self.watcher.as_mut() {
            for file in files {
                if let Some(parent) = file.parent() {
                    watcher.watch(parent);
                }
            }
        }
    }

    pub fn set_raytracing_enabled(&mut self, enabled: bool) {
        self.is_ray_tracing_enabled = enabled;
    }

    pub fn subgroup_size(&self) -> u32 {
        self.subgroup_size
    }

    /// Defines describing the instance-data buffer layout; changing them
    /// triggers recompilation of every pass.
    pub fn update_instance_data_defines(&mut self, defines: String) {
        if self.instance_data_defines != defines {
            self.instance_data_defines = defines;
            self.invalidate_all_passes();
        }
    }

    pub fn begin_frame(
        &mut self,
        device: &dyn Device,
        config: &ShaderCompilerConfig,
        texture_registry: &TextureRegistry,
    ) {
        if self.config != *config {
            self.config = *config;
            self.invalidate_all_passes();
        }

        self.is_ray_tracing_enabled =
            config.is_ray_tracing_enabled && device.get_device_info().is_ray_tracing_supported;

        self.update_global_descriptor_sets(device, texture_registry);
        self.propagate_pipeline_invalidation();
    }

    /// Rebuilds the per-frame sampler and bindless descriptor sets from the
    /// texture registry's image-info array.
    pub fn update_global_descriptor_sets(&mut self, device: &dyn Device, texture_registry: &TextureRegistry) {
        let infos = texture_registry.image_infos();

        if infos.is_empty() {
            self.current_bindless_group = Handle::NONE;
            self.current_samplers_group = Handle::NONE;
            return;
        }

        match device.acquire_transient_bind_group(self.bindless_set_layout, &[], Some(infos.len() as u32)) {
            Ok(group) => {
                device.update_bindless_images(group, &infos);
                self.current_bindless_group = group;
            }
            Err(err) => {
                log::error!("bindless descriptor set acquisition failed: {:#}", err);
                self.current_bindless_group = Handle::NONE;
            }
        }

        // Sampler descriptors are immutable and require no update.
        match device.acquire_transient_bind_group(self.samplers_set_layout, &[], None) {
            Ok(group) => self.current_samplers_group = group,
            Err(err) => {
                log::error!("sampler descriptor set acquisition failed: {:#}", err);
                self.current_samplers_group = Handle::NONE;
            }
        }
    }

    pub fn current_bindless_group(&self) -> Handle<gpu::BindGroup> {
        self.current_bindless_group
    }

    fn invalidate_all_passes(&mut self) {
        for template in self.compute_passes.values_mut() {
            template.should_recompile = true;
        }
        for template in self.render_passes.values_mut() {
            template.should_recompile = true;
        }
        for template in self.raytracing_passes.values_mut() {
            template.should_recompile = true;
        }
    }

    fn propagate_pipeline_invalidation(&mut self) {
        let touched: Vec<PathBuf> = {
            let mut queue = self.touched_files.lock().unwrap();
            queue.drain().collect()
        };

        for file in touched {
            let canonical = file.canonicalize().unwrap_or(file);
            if let Some(passes) = self.file_to_passes.get(&canonical) {
                for pass in passes {
                    match *pass {
                        PassRef::Compute(handle) => {
                            if let Some(t) = self.compute_passes.get_mut(handle) {
                                t.should_recompile = true;
                            }
                        }
                        PassRef::Render(handle) => {
                            if let Some(t) = self.render_passes.get_mut(handle) {
                                t.should_recompile = true;
                            }
                        }
                        PassRef::RayTracing(handle) => {
                            if let Some(t) = self.raytracing_passes.get_mut(handle) {
                                t.should_recompile = true;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Marks the file as touched, as the watcher thread would. Used by the
    /// host when it knows a file changed without going through the watcher.
    pub fn notify_file_changed(&self, path: &Path) {
        let canonical = path.canonicalize().unwrap_or_else(|_| path.to_owned());
        self.touched_files.lock().unwrap().insert(canonical);
    }

    fn add_watch(&mut self, file: &Path, pass: PassRef) {
        let canonical = file.canonicalize().unwrap_or_else(|_| file.to_owned());

        if let Some(watcher) = self.watcher.as_mut() {
            if let Some(parent) = canonical.parent() {
                watcher.watch(parent);
            }
        }

        self.file_to_passes.entry(canonical).or_default().push(pass);
    }

    // -----------------------------------------------------------------------
    // Registration

    pub fn register_compute_pass(&mut self, init: &ComputePassInit) -> Handle<ComputePass> {
        let handle = self.compute_passes.insert_tagged(ComputePassTemplate {
            name: init.name.clone(),
            shader_source: init.shader_source.clone(),
            variants: Vec::new(),
            should_recompile: false,
        });

        self.add_watch(&init.shader_source, PassRef::Compute(handle));
        handle
    }

    pub fn register_render_pass(&mut self, init: &RenderPassInit) -> Handle<RenderPass> {
        let handle = self.render_passes.insert_tagged(RenderPassTemplate {
            name: init.name.clone(),
            stages: init.stages.clone(),
            variants: Vec::new(),
            should_recompile: false,
        });

        for stage in &init.stages {
            self.add_watch(&stage.shader_source, PassRef::Render(handle));
        }
        handle
    }

    pub fn register_raytracing_pass(&mut self, init: &RayTracingPassInit) -> Result<Handle<RayTracingPass>> {
        let mut shader_sources = Vec::new();
        let mut shader_stages = Vec::new();

        let mut append_shader = |source: &PathBuf| -> Result<u32> {
            let index = shader_sources.len() as u32;
            shader_stages.push(deduce_raytracing_stage(source)?);
            shader_sources.push(source.clone());
            Ok(index)
        };

        let generation = append_shader(&init.generation)?;

        let mut miss = Vec::with_capacity(init.miss.len());
        for source in &init.miss {
            miss.push(append_shader(source)?);
        }

        let mut hit_groups = Vec::with_capacity(init.hit_groups.len());
        for group in &init.hit_groups {
            let mut shader_indices = Vec::with_capacity(group.shaders.len());
            for shader in &group.shaders {
                shader_indices.push(append_shader(shader)?);
            }
            hit_groups.push(RayTracingHitGroup {
                hit_type: group.hit_type,
                shader_indices,
            });
        }

        let groups_count = 1 + init.miss.len() as u32 + init.hit_groups.len() as u32;

        let handle = self.raytracing_passes.insert_tagged(RayTracingPassTemplate {
            name: init.name.clone(),
            shader_sources: shader_sources.clone(),
            shader_stages,
            generation,
            miss,
            hit_groups,
            groups_count,
            variants: Vec::new(),
            should_recompile: false,
        });

        for source in &shader_sources {
            self.add_watch(source, PassRef::RayTracing(handle));
        }

        Ok(handle)
    }

    // -----------------------------------------------------------------------
    // Compilation

    fn compiler_options(&self) -> CompilerOptions {
        CompilerOptions {
            optimize: self.config.optimize_shaders,
            debug_info: self.config.emit_debug_info,
            emit_line_directives: self.config.emit_line_directives,
            prefer_glslang: self.config.prefer_glslang,
            enable_cache: self.config.enable_spirv_cache,
        }
    }

    fn compose_preamble(&self, built_in_defines: &[&str], user_defines: &[String]) -> String {
        let mut preamble = String::with_capacity(1 << 10);

        if self.config.enable_printf {
            preamble.push_str("#define FG_DEBUG_PRINTF 1\n");
            preamble.push_str("#extension GL_EXT_debug_printf : enable\n");
        }

        preamble.push_str(&format!("#define FG_SUBGROUP_SIZE {}\n", self.subgroup_size));

        for define in built_in_defines {
            preamble.push_str(&format!("#define {}\n", define));
        }

        preamble.push_str(&self.instance_data_defines);

        for define in user_defines {
            preamble.push_str(&format!("#define {}\n", define));
        }

        preamble
    }

    /// Preprocesses + compiles one stage and creates the shader module.
    /// Returns the module, the SPIR-V (for reflection) and the referenced
    /// source files (for hot-reload subscription).
    fn create_shader_module(
        &mut self,
        device: &dyn Device,
        path: &Path,
        stage: ShaderStage,
        built_in_defines: &[&str],
        user_defines: &[String],
        debug_name: &str,
    ) -> Result<(Handle<gpu::ShaderModule>, Vec<u32>, Vec<PathBuf>)> {
        let preamble = self.compose_preamble(built_in_defines, user_defines);
        let options = self.compiler_options();

        let compiled = self
            .compiler
            .compile(&ShaderCompileRequest {
                path,
                stage,
                preamble: &preamble,
                options,
                debug_name,
            })
            .map_err(|err| {
                log::error!("shader compilation failed for {}\n{:#}", debug_name, err);
                err
            })?;

        let module = device.create_shader_module(&compiled.spirv, debug_name)?;

        Ok((module, compiled.spirv, compiled.source_files))
    }

    fn create_pipeline_layout(
        &self,
        device: &dyn Device,
        reflection: &mut PipelineReflection,
        label: &str,
    ) -> Result<(Handle<gpu::BindGroupLayout>, Handle<gpu::PipelineLayout>, Vec<DescriptorBinding>)> {
        let bindings = reflection.build_descriptor_bindings(label)?;

        let set_layout = if bindings.is_empty() {
            Handle::NONE
        } else {
            device.create_bind_group_layout(&gpu::BindGroupLayoutDesc {
                entries: bindings
                    .iter()
                    .map(|binding| gpu::BindGroupLayoutEntry {
                        binding: binding.binding,
                        count: 1,
                        kind: binding.kind,
                        stages: binding.stages,
                        immutable_samplers: Vec::new(),
                    })
                    .collect(),
                update_after_bind: false,
            })?
        };

        let mut bind_group_layouts = vec![set_layout];
        if reflection.requires_bindless {
            bind_group_layouts.push(self.samplers_set_layout);
            bind_group_layouts.push(self.bindless_set_layout);
        }

        let mut push_constant_ranges = Vec::new();
        if let Some(push_constants) = &reflection.push_constants {
            push_constant_ranges.push(gpu::PushConstantRange {
                stages: push_constants.stages,
                offset: 0,
                size: push_constants.size,
            });
        }

        let layout = device.create_pipeline_layout(&gpu::PipelineLayoutDesc {
            bind_group_layouts,
            push_constant_ranges,
        })?;

        Ok((set_layout, layout, bindings))
    }

    pub fn get_or_create_compute_pipeline(
        &mut self,
        device: &dyn Device,
        pass: Handle<ComputePass>,
        init: &ComputePipelineInit,
    ) -> Handle<ComputePipeline> {
        let (name, source) = {
            let template = match self.compute_passes.get_mut(pass) {
                Some(template) => template,
                None => return Handle::NONE,
            };

            if template.should_recompile {
                log::debug!("recompiling pass {}", template.name);
                let variants: Vec<_> = template.variants.drain(..).collect();
                template.should_recompile = false;

                for variant in variants {
                    if let Some(state) = self.compute_pipelines.remove(variant.pipeline) {
                        destroy_pipeline(device, &state);
                    }
                }
            }

            let template = self.compute_passes.get(pass).unwrap();
            (template.name.clone(), template.shader_source.clone())
        };

        // The whole initializer should be considered, but only defines feed
        // the variant key for now.
        let expected_hash = hash_mix(u64::from(pass.raw()), hash_defines(&init.defines));

        if let Some(existing) = self
            .compute_passes
            .get(pass)
            .and_then(|t| t.variants.iter().find(|v| v.hash == expected_hash))
        {
            return existing.pipeline;
        }

        let pipeline = self.compile_compute_variant(device, &name, &source, init, pass);

        let handle = match pipeline {
            Ok(handle) => handle,
            Err(err) => {
                log::error!("compute pipeline creation failed for {}: {:#}", name, err);
                Handle::NONE
            }
        };

        if let Some(template) = self.compute_passes.get_mut(pass) {
            template.variants.push(Variant {
                hash: expected_hash,
                pipeline: handle,
            });
        }

        handle
    }

    fn compile_compute_variant(
        &mut self,
        device: &dyn Device,
        name: &str,
        source: &Path,
        init: &ComputePipelineInit,
        pass: Handle<ComputePass>,
    ) -> Result<Handle<ComputePipeline>> {
        let debug_name = format!("[{}] {}", name, source.display());

        let (module, spirv, source_files) = self.create_shader_module(
            device,
            source,
            ShaderStage::Compute,
            &["FG_PIPELINE_COMPUTE", "FG_STAGE_COMPUTE"],
            &init.defines,
            &debug_name,
        )?;

        for file in &source_files {
            self.add_watch(file, PassRef::Compute(pass));
        }

        let mut reflection = PipelineReflection::default();
        reflection.add_stage(&spirv, ShaderStage::Compute)?;

        let (set_layout, layout, bindings) = self.create_pipeline_layout(device, &mut reflection, name)?;

        let pipeline = device.create_compute_pipeline(&gpu::ComputePipelineDesc {
            module,
            layout,
            debug_label: "",
        })?;

        Ok(self.compute_pipelines.insert_tagged(PipelineState {
            pipeline,
            layout,
            set_layout,
            bindings,
            push_constants: reflection.push_constants,
            requires_bindless: reflection.requires_bindless,
            shader_modules: vec![module],
            group_size: reflection.compute_local_size.unwrap_or([1, 1, 1]),
            sbt_buffer: Handle::NONE,
            sbt_regions: Default::default(),
            label: name.to_owned(),
            bind_point: gpu::BindPoint::Compute,
        }))
    }

    pub fn get_or_create_render_pipeline(
        &mut self,
        device: &dyn Device,
        pass: Handle<RenderPass>,
        init: &RenderPipelineInit,
    ) -> Handle<RenderPipeline> {
        let (name, stages) = {
            let template = match self.render_passes.get_mut(pass) {
                Some(template) => template,
                None => return Handle::NONE,
            };

            if template.should_recompile {
                log::debug!("recompiling pass {}", template.name);
                let variants: Vec<_> = template.variants.drain(..).collect();
                template.should_recompile = false;

                for variant in variants {
                    if let Some(state) = self.render_pipelines.remove(variant.pipeline) {
                        destroy_pipeline(device, &state);
                    }
                }
            }

            let template = self.render_passes.get(pass).unwrap();
            (template.name.clone(), template.stages.clone())
        };

        let expected_hash = hash_mix(u64::from(pass.raw()), hash_defines(&init.defines));

        if let Some(existing) = self
            .render_passes
            .get(pass)
            .and_then(|t| t.variants.iter().find(|v| v.hash == expected_hash))
        {
            return existing.pipeline;
        }

        let pipeline = self.compile_render_variant(device, &name, &stages, init, pass);

        let handle = match pipeline {
            Ok(handle) => handle,
            Err(err) => {
                log::error!("render pipeline creation failed for {}: {:#}", name, err);
                Handle::NONE
            }
        };

        if let Some(template) = self.render_passes.get_mut(pass) {
            template.variants.push(Variant {
                hash: expected_hash,
                pipeline: handle,
            });
        }

        handle
    }

    fn compile_render_variant(
        &mut self,
        device: &dyn Device,
        name: &str,
        stages: &[RenderPassStageInit],
        init: &RenderPipelineInit,
        pass: Handle<RenderPass>,
    ) -> Result<Handle<RenderPipeline>> {
        let mut reflection = PipelineReflection::default();
        let mut modules = Vec::with_capacity(stages.len());
        let mut stage_descs = Vec::with_capacity(stages.len());

        for stage in stages {
            let shader_stage = stage.stage.shader_stage();
            let debug_name = format!("[{}] {}", name, stage.shader_source.display());

            let (module, spirv, source_files) = self.create_shader_module(
                device,
                &stage.shader_source,
                shader_stage,
                &["FG_PIPELINE_RENDER", stage.stage.stage_define()],
                &init.defines,
                &debug_name,
            )?;

            for file in &source_files {
                self.add_watch(file, PassRef::Render(pass));
            }

            reflection.add_stage(&spirv, shader_stage)?;
            modules.push(module);
            stage_descs.push(gpu::ShaderStageDesc {
                module,
                stage: shader_stage,
                entry_point: "main",
            });
        }

        let (set_layout, layout, bindings) = self.create_pipeline_layout(device, &mut reflection, name)?;

        let pipeline = device.create_graphics_pipeline(&gpu::GraphicsPipelineDesc {
            stages: stage_descs,
            layout,
            vertex_bindings: reflection.vertex_bindings.clone(),
            vertex_attributes: reflection.vertex_attributes.clone(),
            render_targets: init.render_targets.clone(),
            rasterization: init.rasterization,
            depth_stencil: init.depth_stencil,
            debug_label: "",
        })?;

        Ok(self.render_pipelines.insert_tagged(PipelineState {
            pipeline,
            layout,
            set_layout,
            bindings,
            push_constants: reflection.push_constants,
            requires_bindless: reflection.requires_bindless,
            shader_modules: modules,
            group_size: [1, 1, 1],
            sbt_buffer: Handle::NONE,
            sbt_regions: Default::default(),
            label: name.to_owned(),
            bind_point: gpu::BindPoint::Graphics,
        }))
    }

    pub fn get_or_create_raytracing_pipeline(
        &mut self,
        device: &dyn Device,
        pass: Handle<RayTracingPass>,
        init: &RayTracingPipelineInit,
    ) -> Handle<RayTracingPipeline> {
        if !self.is_ray_tracing_enabled {
            return Handle::NONE;
        }

        let name = {
            let template = match self.raytracing_passes.get_mut(pass) {
                Some(template) => template,
                None => return Handle::NONE,
            };

            if template.should_recompile {
                log::debug!("recompiling pass {}", template.name);
                let variants: Vec<_> = template.variants.drain(..).collect();
                template.should_recompile = false;

                for variant in variants {
                    if let Some(state) = self.raytracing_pipelines.remove(variant.pipeline) {
                        destroy_pipeline(device, &state);
                    }
                }
            }

            self.raytracing_passes.get(pass).unwrap().name.clone()
        };

        let expected_hash = hash_mix(
            hash_mix(u64::from(pass.raw()), u64::from(init.max_ray_recursion_depth)),
            hash_defines(&init.defines),
        );

        if let Some(existing) = self
            .raytracing_passes
            .get(pass)
            .and_then(|t| t.variants.iter().find(|v| v.hash == expected_hash))
        {
            return existing.pipeline;
        }

        let pipeline = self.compile_raytracing_variant(device, &name, init, pass);

        let handle = match pipeline {
            Ok(handle) => handle,
            Err(err) => {
                log::error!("ray tracing pipeline creation failed for {}: {:#}", name, err);
                Handle::NONE
            }
        };

        if let Some(template) = self.raytracing_passes.get_mut(pass) {
            template.variants.push(Variant {
                hash: expected_hash,
                pipeline: handle,
            });
        }

        handle
    }

    fn compile_raytracing_variant(
        &mut self,
        device: &dyn Device,
        name: &str,
        init: &RayTracingPipelineInit,
        pass: Handle<RayTracingPass>,
    ) -> Result<Handle<RayTracingPipeline>> {
        let (sources, stages, generation, miss, hit_groups, groups_count) = {
            let template = self.raytracing_passes.get(pass).unwrap();
            (
                template.shader_sources.clone(),
                template.shader_stages.clone(),
                template.generation,
                template.miss.clone(),
                template
                    .hit_groups
                    .iter()
                    .map(|group| (group.hit_type, group.shader_indices.clone()))
                    .collect::<Vec<_>>(),
                template.groups_count,
            )
        };

        let mut reflection = PipelineReflection::default();
        let mut modules = Vec::with_capacity(sources.len());
        let mut stage_descs = Vec::with_capacity(sources.len());

        for (source, stage) in sources.iter().zip(stages.iter()) {
            let debug_name = format!("[{}] {}", name, source.display());

            let (module, spirv, source_files) = self.create_shader_module(
                device,
                source,
                *stage,
                &["FG_PIPELINE_RAYTRACING", raytracing_stage_define(*stage)],
                &init.defines,
                &debug_name,
            )?;

            for file in &source_files {
                self.add_watch(file, PassRef::RayTracing(pass));
            }

            reflection.add_stage(&spirv, *stage)?;
            modules.push(module);
            stage_descs.push(gpu::ShaderStageDesc {
                module,
                stage: *stage,
                entry_point: "main",
            });
        }

        let mut groups = Vec::with_capacity(groups_count as usize);

        groups.push(gpu::RayTracingGroupDesc {
            kind: gpu::RayTracingGroupKind::General,
            general: generation,
            ..Default::default()
        });

        for miss_index in &miss {
            groups.push(gpu::RayTracingGroupDesc {
                kind: gpu::RayTracingGroupKind::General,
                general: *miss_index,
                ..Default::default()
            });
        }

        let mut hit_shader_count = 0u32;

        for (hit_type, shader_indices) in &hit_groups {
            let mut group = gpu::RayTracingGroupDesc {
                kind: match hit_type {
                    RayTracingHitType::Triangle => gpu::RayTracingGroupKind::TrianglesHitGroup,
                    RayTracingHitType::Procedural => gpu::RayTracingGroupKind::ProceduralHitGroup,
                },
                ..Default::default()
            };

            for shader_index in shader_indices {
                match stages[*shader_index as usize] {
                    ShaderStage::Intersection => group.intersection = *shader_index,
                    ShaderStage::AnyHit => group.any_hit = *shader_index,
                    ShaderStage::ClosestHit => group.closest_hit = *shader_index,
                    _ => {}
                }
                hit_shader_count += 1;
            }

            groups.push(group);
        }

        let (set_layout, layout, bindings) = self.create_pipeline_layout(device, &mut reflection, name)?;

        let pipeline = device.create_raytracing_pipeline(&gpu::RayTracingPipelineDesc {
            stages: stage_descs,
            groups,
            layout,
            max_ray_recursion_depth: init.max_ray_recursion_depth,
            debug_label: "",
        })?;

        let (sbt_buffer, sbt_regions) = self.build_shader_binding_table(
            device,
            pipeline,
            miss.len() as u32,
            hit_shader_count,
            groups_count,
        )?;

        Ok(self.raytracing_pipelines.insert_tagged(PipelineState {
            pipeline,
            layout,
            set_layout,
            bindings,
            push_constants: reflection.push_constants,
            requires_bindless: reflection.requires_bindless,
            shader_modules: modules,
            group_size: [1, 1, 1],
            sbt_buffer,
            sbt_regions,
            label: name.to_owned(),
            bind_point: gpu::BindPoint::RayTracing,
        }))
    }

    /// Lays out the shader binding table: handles grouped as ray-gen, miss,
    /// hit, callable, with the device-enforced base and stride alignment.
    /// Ray generation is special cased: its size must match its stride.
    fn build_shader_binding_table(
        &self,
        device: &dyn Device,
        pipeline: Handle<gpu::Pipeline>,
        miss_count: u32,
        hit_count: u32,
        group_count: u32,
    ) -> Result<(Handle<gpu::Buffer>, gpu::ShaderBindingTableRegions)> {
        let info = self.shader_groups;
        let handle_size = u64::from(info.handle_size);
        let handle_size_aligned = round_up(handle_size, u64::from(info.handle_alignment));
        let base_alignment = u64::from(info.base_alignment);

        let mut regions = gpu::ShaderBindingTableRegions::default();

        regions.raygen.stride = round_up(handle_size_aligned, base_alignment);
        regions.raygen.size = regions.raygen.stride;

        if miss_count > 0 {
            regions.miss.stride = handle_size_aligned;
            regions.miss.size = round_up(u64::from(miss_count) * handle_size_aligned, base_alignment);
        }

        regions.hit.stride = handle_size_aligned;
        regions.hit.size = round_up(u64::from(hit_count) * handle_size_aligned, base_alignment);

        let sbt_size = regions.raygen.size + regions.miss.size + regions.hit.size + regions.callable.size;

        let sbt_buffer = device.create_buffer(&gpu::BufferDesc {
            size: sbt_size,
            usage: gpu::BufferUsage::TRANSFER_SOURCE
                | gpu::BufferUsage::DEVICE_ADDRESS
                | gpu::BufferUsage::SHADER_BINDING_TABLE,
            memory_usage: gpu::MemoryUsage::HostVisible,
            debug_label: "shader binding table",
        })?;

        let handles = device.get_shader_group_handles(pipeline, group_count)?;

        let sbt_address = device.get_device_address(gpu::BufferRange {
            buffer: sbt_buffer,
            offset: 0,
            size: sbt_size,
        });

        regions.raygen.device_address = sbt_address;
        regions.miss.device_address = regions.raygen.device_address + regions.raygen.size;
        regions.hit.device_address = regions.miss.device_address + regions.miss.size;
        regions.callable.device_address = regions.hit.device_address + regions.hit.size;

        let groups_with_count = [
            (&regions.raygen, 1u32),
            (&regions.miss, miss_count),
            (&regions.hit, hit_count),
            (&regions.callable, 0u32),
        ];

        let mut next_handle = 0usize;

        for (region, handle_count) in groups_with_count.iter() {
            if region.size == 0 {
                continue;
            }

            let region_offset = region.device_address - sbt_address;

            for i in 0..*handle_count {
                let dst_offset = region_offset + u64::from(i) * handle_size_aligned;
                let src_offset = next_handle * handle_size as usize;

                device.write_buffer(
                    sbt_buffer,
                    dst_offset,
                    &handles[src_offset..src_offset + handle_size as usize],
                )?;

                next_handle += 1;
            }
        }

        Ok((sbt_buffer, regions))
    }

    // -----------------------------------------------------------------------
    // Recording

    pub fn get_compute_pipeline(&self, handle: Handle<ComputePipeline>) -> Option<&PipelineState> {
        self.compute_pipelines.get(handle)
    }

    pub fn get_render_pipeline(&self, handle: Handle<RenderPipeline>) -> Option<&PipelineState> {
        self.render_pipelines.get(handle)
    }

    pub fn get_raytracing_pipeline(&self, handle: Handle<RayTracingPipeline>) -> Option<&PipelineState> {
        self.raytracing_pipelines.get(handle)
    }

    fn bind_common(&self, device: &dyn Device, cmd: gpu::CommandBuffer, state: &PipelineState) {
        device.cmd_begin_debug_label(cmd, &state.label);
        device.cmd_bind_pipeline(cmd, state.bind_point, state.pipeline);

        if state.requires_bindless && self.current_samplers_group.is_some() {
            device.cmd_bind_groups(
                cmd,
                state.bind_point,
                state.layout,
                crate::reflection::SAMPLERS_DESCRIPTOR_SET,
                &[self.current_samplers_group],
            );
        }

        if state.requires_bindless && self.current_bindless_group.is_some() {
            device.cmd_bind_groups(
                cmd,
                state.bind_point,
                state.layout,
                crate::reflection::BINDLESS_TEXTURES_DESCRIPTOR_SET,
                &[self.current_bindless_group],
            );
        }
    }

    pub fn begin_compute_pass(
        &self,
        device: &dyn Device,
        cmd: gpu::CommandBuffer,
        pipeline: Handle<ComputePipeline>,
    ) -> Option<ComputePassCtx> {
        let state = self.compute_pipelines.get(pipeline)?;
        self.bind_common(device, cmd, state);
        Some(ComputePassCtx { cmd, pipeline })
    }

    pub fn end_compute_pass(&self, device: &dyn Device, ctx: &ComputePassCtx) {
        device.cmd_end_debug_label(ctx.cmd);
    }

    pub fn begin_render_pass(
        &self,
        device: &dyn Device,
        cmd: gpu::CommandBuffer,
        pipeline: Handle<RenderPipeline>,
        cfg: &gpu::GraphicsPassDesc,
    ) -> Option<RenderPassCtx> {
        let state = self.render_pipelines.get(pipeline)?;
        self.bind_common(device, cmd, state);
        device.cmd_begin_rendering(cmd, cfg);
        Some(RenderPassCtx { cmd, pipeline })
    }

    pub fn end_render_pass(&self, device: &dyn Device, ctx: &RenderPassCtx) {
        device.cmd_end_rendering(ctx.cmd);
        device.cmd_end_debug_label(ctx.cmd);
    }

    pub fn begin_raytracing_pass(
        &self,
        device: &dyn Device,
        cmd: gpu::CommandBuffer,
        pipeline: Handle<RayTracingPipeline>,
    ) -> Option<RayTracingPassCtx> {
        let state = self.raytracing_pipelines.get(pipeline)?;
        self.bind_common(device, cmd, state);
        Some(RayTracingPassCtx { cmd, pipeline })
    }

    pub fn end_raytracing_pass(&self, device: &dyn Device, ctx: &RayTracingPassCtx) {
        device.cmd_end_debug_label(ctx.cmd);
    }

    /// Satisfies the reflected set-0 bindings from a resolver that looks
    /// names up in the caller's binding-table stack. Kind mismatches and
    /// missing bindings are logged and skipped.
    pub fn bind_descriptor_sets(
        &self,
        device: &dyn Device,
        cmd: gpu::CommandBuffer,
        state: &PipelineState,
        mut resolve: impl FnMut(&DescriptorBinding) -> Option<gpu::BindableObject>,
    ) {
        if state.set_layout.is_none() {
            return;
        }

        let mut writes = Vec::with_capacity(state.bindings.len());

        for binding in &state.bindings {
            let object = match resolve(binding) {
                Some(object) => object,
                None => {
                    log::debug!("[{}] unable to find a match for binding {}", state.label, binding.name);
                    continue;
                }
            };

            let compatible = match (&object, binding.kind) {
                (gpu::BindableObject::Buffer(_), gpu::DescriptorKind::UniformBuffer)
                | (gpu::BindableObject::Buffer(_), gpu::DescriptorKind::StorageBuffer) => true,
                (gpu::BindableObject::Image(_), gpu::DescriptorKind::StorageImage)
                | (gpu::BindableObject::Image(_), gpu::DescriptorKind::SampledImage)
                | (gpu::BindableObject::Image(_), gpu::DescriptorKind::CombinedImageSampler) => true,
                (
                    gpu::BindableObject::AccelerationStructure(_),
                    gpu::DescriptorKind::AccelerationStructure,
                ) => true,
                _ => false,
            };

            if !compatible {
                log::debug!(
                    "[{}] a binding for {} was found, but its kind does not match",
                    state.label,
                    binding.name
                );
                continue;
            }

            writes.push(gpu::BindGroupWrite {
                binding: binding.binding,
                kind: binding.kind,
                object,
            });
        }

        match device.acquire_transient_bind_group(state.set_layout, &writes, None) {
            Ok(group) => {
                device.cmd_bind_groups(
                    cmd,
                    state.bind_point,
                    state.layout,
                    crate::reflection::PIPELINE_DESCRIPTOR_SET,
                    &[group],
                );
            }
            Err(err) => {
                log::error!("[{}] descriptor set acquisition failed: {:#}", state.label, err);
            }
        }
    }

    pub fn push_constants(
        &self,
        device: &dyn Device,
        cmd: gpu::CommandBuffer,
        state: &PipelineState,
        stages: gpu::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    ) {
        device.cmd_push_constants(cmd, state.layout, stages, offset, data);
    }

    pub fn trace_rays(
        &self,
        device: &dyn Device,
        ctx: &RayTracingPassCtx,
        width: u32,
        height: u32,
        depth: u32,
    ) {
        if let Some(state) = self.raytracing_pipelines.get(ctx.pipeline) {
            device.cmd_trace_rays(ctx.cmd, &state.sbt_regions, width, height, depth);
        }
    }

    pub fn shutdown(&mut self, device: &dyn Device) {
        let submit_index = device.get_submit_index();

        for state in self
            .compute_pipelines
            .values()
            .chain(self.render_pipelines.values())
            .chain(self.raytracing_pipelines.values())
        {
            destroy_pipeline(device, state);
        }

        for sampler in self.samplers.iter() {
            if sampler.is_some() {
                device.destroy_deferred(gpu::GpuObject::Sampler(*sampler), submit_index);
            }
        }

        device.destroy_deferred(gpu::GpuObject::BindGroupLayout(self.bindless_set_layout), submit_index);
        device.destroy_deferred(gpu::GpuObject::BindGroupLayout(self.samplers_set_layout), submit_index);
    }
}

fn round_up(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) & !(alignment - 1)
}
