use anyhow::{anyhow, Result};
use relative_path::RelativePathBuf;
use std::path::{Path, PathBuf};

pub struct PreprocessedSource {
    /// Concatenated source with the preamble injected after the `#version`
    /// directive (GLSL requires it to stay first).
    pub source: String,
    /// Every file the preprocessing referenced, root included.
    pub source_files: Vec<PathBuf>,
}

struct SearchPathProvider<'a> {
    include_dirs: &'a [PathBuf],
    touched: Vec<PathBuf>,
}

impl<'a> SearchPathProvider<'a> {
    fn resolve(&self, path: &str, parent_file: &str) -> Option<PathBuf> {
        // Absolute includes resolve against the search paths only.
        if !path.starts_with('/') && !parent_file.is_empty() {
            let mut folder: RelativePathBuf = parent_file.into();
            folder.pop();
            let candidate = PathBuf::from(folder.join(path).as_str());
            if candidate.exists() {
                return Some(candidate);
            }
        }

        let trimmed = path.trim_start_matches('/');

        for dir in self.include_dirs {
            let candidate = dir.join(trimmed);
            if candidate.exists() {
                return Some(candidate);
            }
        }

        let direct = PathBuf::from(path);
        if direct.exists() {
            return Some(direct);
        }

        None
    }
}

impl<'a> shader_prepper::IncludeProvider for SearchPathProvider<'a> {
    type IncludeContext = String;

    fn get_include(
        &mut self,
        path: &str,
        parent_file: &Self::IncludeContext,
    ) -> std::result::Result<(String, Self::IncludeContext), failure::Error> {
        let resolved = self
            .resolve(path, parent_file)
            .ok_or_else(|| failure::format_err!("could not resolve include {:?}", path))?;

        let text = std::fs::read_to_string(&resolved).map_err(|e| failure::format_err!("{}", e))?;

        let context = resolved.to_string_lossy().into_owned();
        self.touched.push(resolved);

        Ok((text, context))
    }
}

/// Resolves `#include`s against the search path list, prepends the preamble
/// and records every source file referenced.
pub fn preprocess_file(
    path: &Path,
    preamble: &str,
    include_dirs: &[PathBuf],
    emit_line_directives: bool,
) -> Result<PreprocessedSource> {
    let mut provider = SearchPathProvider {
        include_dirs,
        touched: Vec::new(),
    };

    let path_str = path.to_string_lossy().into_owned();
    let chunks = shader_prepper::process_file(&path_str, &mut provider, String::new())
        .map_err(|err| anyhow!("{}", err))?;

    let mut source = String::new();
    let mut preamble_emitted = preamble.is_empty();

    for chunk in &chunks {
        let mut remaining: &str = &chunk.source;
        let mut line_number = chunk.line_offset + 1;

        // The preamble has to land after the root `#version` directive, and
        // `#line` must not precede it either.
        if !preamble_emitted {
            if remaining.trim_start().starts_with("#version") {
                if let Some(version_end) = remaining.find('\n') {
                    source.push_str(&remaining[..=version_end]);
                    remaining = &remaining[version_end + 1..];
                    line_number += 1;
                }
            }

            source.push_str(preamble);
            preamble_emitted = true;
        }

        if emit_line_directives {
            source.push_str(&format!("#line {} \"{}\"\n", line_number, chunk.file));
        }

        source.push_str(remaining);
    }

    let mut source_files = provider.touched;
    source_files.sort();
    source_files.dedup();

    Ok(PreprocessedSource {
        source,
        source_files,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_file(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("frame-rs-pp-{}-{}", tag, std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn preamble_lands_after_version() {
        let dir = temp_dir("preamble");
        let root = write_file(&dir, "a.comp", "#version 460\nvoid main() {}\n");

        let out = preprocess_file(&root, "#define FOO 1\n", &[], false).unwrap();

        let version_at = out.source.find("#version 460").unwrap();
        let define_at = out.source.find("#define FOO 1").unwrap();
        let main_at = out.source.find("void main").unwrap();
        assert!(version_at < define_at && define_at < main_at);
    }

    #[test]
    fn includes_are_resolved_and_recorded() {
        let dir = temp_dir("includes");
        write_file(&dir, "common.glsl", "float common_fn() { return 1.0; }\n");
        let root = write_file(
            &dir,
            "b.comp",
            "#version 460\n#include \"common.glsl\"\nvoid main() {}\n",
        );

        let out = preprocess_file(&root, "", &[dir.clone()], false).unwrap();

        assert!(out.source.contains("common_fn"));
        assert!(out
            .source_files
            .iter()
            .any(|f| f.file_name().unwrap() == "common.glsl"));
    }

    #[test]
    fn search_paths_service_absolute_includes() {
        let dir = temp_dir("search");
        write_file(&dir, "lib.glsl", "int lib_fn() { return 2; }\n");
        let root = write_file(
            &dir,
            "c.comp",
            "#version 460\n#include \"/lib.glsl\"\nvoid main() {}\n",
        );

        let out = preprocess_file(&root, "", &[dir.clone()], false).unwrap();
        assert!(out.source.contains("lib_fn"));
    }
}
