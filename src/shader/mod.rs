//! GLSL front-end for the pass manager: include-resolving preprocessor,
//! interchangeable SPIR-V back-ends, on-disk cache and hot-reload watching.

pub mod backend;
pub mod cache;
pub mod preprocess;
pub mod watcher;

pub use backend::{NagaBackend, ShaderBackend};
pub use cache::ShaderCache;
pub use preprocess::{preprocess_file, PreprocessedSource};
pub use watcher::HotwatchWatcher;
