use crate::shader::backend::{BackendOptions, NagaBackend, ShaderBackend};
use crate::shader::preprocess::preprocess_file;
use anyhow::Result;
use fg::{CompiledShader, ShaderCompileRequest, ShaderCompiler};
use gpu_core::ShaderStage;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Serialize, Deserialize)]
struct CachedBlob {
    spirv: Vec<u32>,
    source_files: Vec<PathBuf>,
}

fn stage_tag(stage: ShaderStage) -> u8 {
    match stage {
        ShaderStage::Vertex => 0,
        ShaderStage::Fragment => 1,
        ShaderStage::Compute => 2,
        ShaderStage::Mesh => 3,
        ShaderStage::Task => 4,
        ShaderStage::Raygen => 5,
        ShaderStage::Intersection => 6,
        ShaderStage::AnyHit => 7,
        ShaderStage::ClosestHit => 8,
        ShaderStage::Miss => 9,
        ShaderStage::Callable => 10,
    }
}

/// Preprocesses, compiles and caches SPIR-V on disk.
///
/// The cache key combines the canonical path, stage, preamble hash and
/// compiler-options hash; the preprocessed source text feeds the key as
/// well, so stale blobs never outlive an edit.
pub struct ShaderCache {
    cache_dir: PathBuf,
    include_dirs: Vec<PathBuf>,
    primary: Box<dyn ShaderBackend>,
    glslang: Option<Box<dyn ShaderBackend>>,
}

impl ShaderCache {
    pub fn new(cache_dir: impl Into<PathBuf>, include_dirs: Vec<PathBuf>) -> Self {
        let glslang: Option<Box<dyn ShaderBackend>> = {
            #[cfg(feature = "shaderc")]
            {
                crate::shader::backend::ShadercBackend::new()
                    .map(|backend| Box::new(backend) as Box<dyn ShaderBackend>)
            }
            #[cfg(not(feature = "shaderc"))]
            {
                None
            }
        };

        Self {
            cache_dir: cache_dir.into(),
            include_dirs,
            primary: Box::new(NagaBackend::default()),
            glslang,
        }
    }

    /// Test seam: replaces both back-ends with the supplied one.
    pub fn with_backend(cache_dir: impl Into<PathBuf>, include_dirs: Vec<PathBuf>, backend: Box<dyn ShaderBackend>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            include_dirs,
            primary: backend,
            glslang: None,
        }
    }

    fn cache_path(&self, key: u64) -> PathBuf {
        self.cache_dir.join(format!("{:016x}.spv", key))
    }

    fn try_load(&self, key: u64) -> Option<CachedBlob> {
        let bytes = std::fs::read(self.cache_path(key)).ok()?;
        bincode::deserialize(&bytes).ok()
    }

    fn store(&self, key: u64, blob: &CachedBlob) {
        if std::fs::create_dir_all(&self.cache_dir).is_err() {
            return;
        }

        match bincode::serialize(blob) {
            Ok(bytes) => {
                if let Err(err) = std::fs::write(self.cache_path(key), bytes) {
                    log::warn!("failed to write shader cache entry: {}", err);
                }
            }
            Err(err) => log::warn!("failed to serialize shader cache entry: {}", err),
        }
    }

    fn cache_key(&self, path: &Path, request: &ShaderCompileRequest<'_>, source: &str) -> u64 {
        let canonical = path
            .canonicalize()
            .unwrap_or_else(|_| path.to_owned());

        let mut key = wyhash::wyhash(canonical.to_string_lossy().as_bytes(), 0);
        key = wyhash::wyhash(&[stage_tag(request.stage)], key);
        key = wyhash::wyhash(request.preamble.as_bytes(), key);
        key = wyhash::wyhash(
            &[
                request.options.optimize as u8,
                request.options.debug_info as u8,
                request.options.emit_line_directives as u8,
            ],
            key,
        );
        wyhash::wyhash(source.as_bytes(), key)
    }
}

impl ShaderCompiler for ShaderCache {
    fn compile(&mut self, request: &ShaderCompileRequest<'_>) -> Result<CompiledShader> {
        let preprocessed = preprocess_file(
            request.path,
            request.preamble,
            &self.include_dirs,
            request.options.emit_line_directives,
        )?;

        let key = self.cache_key(request.path, request, &preprocessed.source);

        if request.options.enable_cache {
            if let Some(blob) = self.try_load(key) {
                return Ok(CompiledShader {
                    spirv: blob.spirv,
                    source_files: blob.source_files,
                });
            }
        }

        let backend_options = BackendOptions {
            optimize: request.options.optimize,
            debug_info: request.options.debug_info,
        };

        // Prefer glslang when requested and present, fall back otherwise.
        let backend = if request.options.prefer_glslang {
            self.glslang.as_mut().unwrap_or(&mut self.primary)
        } else {
            &mut self.primary
        };

        let spirv = backend.compile(
            request.debug_name,
            &preprocessed.source,
            request.stage,
            &backend_options,
        )?;

        if request.options.enable_cache {
            self.store(
                key,
                &CachedBlob {
                    spirv: spirv.clone(),
                    source_files: preprocessed.source_files.clone(),
                },
            );
        }

        Ok(CompiledShader {
            spirv,
            source_files: preprocessed.source_files,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shader::backend::StubBackend;
    use fg::CompilerOptions;
    use std::cell::Cell;
    use std::rc::Rc;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("frame-rs-cache-{}-{}", tag, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn options(enable_cache: bool) -> CompilerOptions {
        CompilerOptions {
            optimize: false,
            debug_info: false,
            emit_line_directives: false,
            prefer_glslang: false,
            enable_cache,
        }
    }

    #[test]
    fn disk_cache_avoids_recompilation() {
        let dir = temp_dir("hit");
        let shader = dir.join("t.comp");
        std::fs::write(&shader, "#version 460\nvoid main() {}\n").unwrap();

        let count = Rc::new(Cell::new(0));
        let mut cache = ShaderCache::with_backend(
            dir.join("spirv"),
            vec![],
            Box::new(StubBackend {
                compile_count: count.clone(),
            }),
        );

        fn request(path: &Path, options: CompilerOptions) -> ShaderCompileRequest<'_> {
            ShaderCompileRequest {
                path,
                stage: ShaderStage::Compute,
                preamble: "#define A 1\n",
                options,
                debug_name: "t",
            }
        }

        cache.compile(&request(&shader, options(true))).unwrap();
        cache.compile(&request(&shader, options(true))).unwrap();
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn edits_change_the_cache_key() {
        let dir = temp_dir("edit");
        let shader = dir.join("t.comp");
        std::fs::write(&shader, "#version 460\nvoid main() {}\n").unwrap();

        let count = Rc::new(Cell::new(0));
        let mut cache = ShaderCache::with_backend(
            dir.join("spirv"),
            vec![],
            Box::new(StubBackend {
                compile_count: count.clone(),
            }),
        );

        let opts = options(true);
        cache
            .compile(&ShaderCompileRequest {
                path: &shader,
                stage: ShaderStage::Compute,
                preamble: "",
                options: opts,
                debug_name: "t",
            })
            .unwrap();

        std::fs::write(&shader, "#version 460\nvoid main() { int x = 1; }\n").unwrap();

        cache
            .compile(&ShaderCompileRequest {
                path: &shader,
                stage: ShaderStage::Compute,
                preamble: "",
                options: opts,
                debug_name: "t",
            })
            .unwrap();

        assert_eq!(count.get(), 2);
    }

    #[test]
    fn different_preambles_do_not_share_entries() {
        let dir = temp_dir("preamble");
        let shader = dir.join("t.comp");
        std::fs::write(&shader, "#version 460\nvoid main() {}\n").unwrap();

        let count = Rc::new(Cell::new(0));
        let mut cache = ShaderCache::with_backend(
            dir.join("spirv"),
            vec![],
            Box::new(StubBackend {
                compile_count: count.clone(),
            }),
        );

        for preamble in ["#define A 1\n", "#define A 2\n"] {
            cache
                .compile(&ShaderCompileRequest {
                    path: &shader,
                    stage: ShaderStage::Compute,
                    preamble,
                    options: options(true),
                    debug_name: "t",
                })
                .unwrap();
        }

        assert_eq!(count.get(), 2);
    }

    #[test]
    fn compile_errors_propagate() {
        let dir = temp_dir("error");
        let shader = dir.join("t.comp");
        std::fs::write(&shader, "#version 460\n// FORCE_COMPILE_ERROR\nvoid main() {}\n").unwrap();

        let count = Rc::new(Cell::new(0));
        let mut cache = ShaderCache::with_backend(
            dir.join("spirv"),
            vec![],
            Box::new(StubBackend {
                compile_count: count.clone(),
            }),
        );

        let result = cache.compile(&ShaderCompileRequest {
            path: &shader,
            stage: ShaderStage::Compute,
            preamble: "",
            options: options(false),
            debug_name: "t",
        });

        assert!(result.is_err());
    }
}
