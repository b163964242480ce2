use anyhow::{anyhow, bail, Result};
use gpu_core::ShaderStage;

#[derive(Clone, Copy, Debug, Default)]
pub struct BackendOptions {
    pub optimize: bool,
    pub debug_info: bool,
}

/// A GLSL → SPIR-V compiler back-end. Two of these are interchangeable at
/// run time; `prefer_glslang` picks the glslang-based one when it is built
/// in, with fall-back to the other.
pub trait ShaderBackend {
    fn name(&self) -> &'static str;

    fn compile(
        &mut self,
        debug_name: &str,
        source: &str,
        stage: ShaderStage,
        options: &BackendOptions,
    ) -> Result<Vec<u32>>;
}

/// Pure-Rust back-end on top of naga's GLSL front-end. Covers the vertex /
/// fragment / compute stages; ray tracing and mesh stages need the glslang
/// back-end.
#[derive(Default)]
pub struct NagaBackend;

fn naga_stage(stage: ShaderStage) -> Option<naga::ShaderStage> {
    match stage {
        ShaderStage::Vertex => Some(naga::ShaderStage::Vertex),
        ShaderStage::Fragment => Some(naga::ShaderStage::Fragment),
        ShaderStage::Compute => Some(naga::ShaderStage::Compute),
        _ => None,
    }
}

impl ShaderBackend for NagaBackend {
    fn name(&self) -> &'static str {
        "naga"
    }

    fn compile(
        &mut self,
        debug_name: &str,
        source: &str,
        stage: ShaderStage,
        options: &BackendOptions,
    ) -> Result<Vec<u32>> {
        let stage = naga_stage(stage)
            .ok_or_else(|| anyhow!("{}: stage not supported by the naga back-end", debug_name))?;

        let mut frontend = naga::front::glsl::Frontend::default();

        let module = frontend
            .parse(
                &naga::front::glsl::Options {
                    stage,
                    defines: Default::default(),
                },
                source,
            )
            .map_err(|errors| anyhow!("{}: {:?}", debug_name, errors))?;

        let info = naga::valid::Validator::new(
            naga::valid::ValidationFlags::all(),
            naga::valid::Capabilities::all(),
        )
        .validate(&module)
        .map_err(|err| anyhow!("{}: {:?}", debug_name, err))?;

        let mut spv_options = naga::back::spv::Options::default();
        if options.debug_info {
            spv_options.flags |= naga::back::spv::WriterFlags::DEBUG;
        } else {
            spv_options.flags.remove(naga::back::spv::WriterFlags::DEBUG);
        }

        let pipeline_options = naga::back::spv::PipelineOptions {
            shader_stage: stage,
            entry_point: "main".to_owned(),
        };

        naga::back::spv::write_vec(&module, &info, &spv_options, Some(&pipeline_options))
            .map_err(|err| anyhow!("{}: {:?}", debug_name, err))
    }
}

/// glslang-proper back-end through shaderc.
#[cfg(feature = "shaderc")]
pub struct ShadercBackend {
    compiler: shaderc::Compiler,
}

#[cfg(feature = "shaderc")]
impl ShadercBackend {
    pub fn new() -> Option<Self> {
        shaderc::Compiler::new().map(|compiler| Self { compiler })
    }
}

#[cfg(feature = "shaderc")]
fn shaderc_kind(stage: ShaderStage) -> shaderc::ShaderKind {
    use shaderc::ShaderKind as K;
    match stage {
        ShaderStage::Vertex => K::Vertex,
        ShaderStage::Fragment => K::Fragment,
        ShaderStage::Compute => K::Compute,
        ShaderStage::Mesh => K::Mesh,
        ShaderStage::Task => K::Task,
        ShaderStage::Raygen => K::RayGeneration,
        ShaderStage::Intersection => K::Intersection,
        ShaderStage::AnyHit => K::AnyHit,
        ShaderStage::ClosestHit => K::ClosestHit,
        ShaderStage::Miss => K::Miss,
        ShaderStage::Callable => K::Callable,
    }
}

#[cfg(feature = "shaderc")]
impl ShaderBackend for ShadercBackend {
    fn name(&self) -> &'static str {
        "glslang"
    }

    fn compile(
        &mut self,
        debug_name: &str,
        source: &str,
        stage: ShaderStage,
        options: &BackendOptions,
    ) -> Result<Vec<u32>> {
        let mut compile_options = shaderc::CompileOptions::new()
            .ok_or_else(|| anyhow!("failed to create shaderc compile options"))?;

        compile_options.set_target_env(
            shaderc::TargetEnv::Vulkan,
            shaderc::EnvVersion::Vulkan1_2 as u32,
        );
        compile_options.set_optimization_level(if options.optimize {
            shaderc::OptimizationLevel::Performance
        } else {
            shaderc::OptimizationLevel::Zero
        });
        if options.debug_info {
            compile_options.set_generate_debug_info();
        }

        let artifact = self
            .compiler
            .compile_into_spirv(
                source,
                shaderc_kind(stage),
                debug_name,
                "main",
                Some(&compile_options),
            )
            .map_err(|err| anyhow!("{}", err))?;

        Ok(artifact.as_binary().to_vec())
    }
}

/// A no-op back-end emitting a canned module; used by tests that exercise
/// the caching and hot-reload machinery without a real compiler.
pub struct StubBackend {
    pub compile_count: std::rc::Rc<std::cell::Cell<u32>>,
}

impl ShaderBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn compile(
        &mut self,
        _debug_name: &str,
        source: &str,
        _stage: ShaderStage,
        _options: &BackendOptions,
    ) -> Result<Vec<u32>> {
        if source.contains("FORCE_COMPILE_ERROR") {
            bail!("forced compile error");
        }

        self.compile_count.set(self.compile_count.get() + 1);

        // Minimal valid-shaped module header so the blob is non-empty.
        Ok(vec![0x0723_0203, 0x0001_0000, 0, 0, 0])
    }
}
