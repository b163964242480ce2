//! Renderer front-end built on the `fg` frame graph runtime: GLSL shader
//! compilation with caching and hot reload, the draw registry mapping the
//! entity store onto GPU draw batches, and the per-frame driver.

pub mod draw;
pub mod ecs;
pub mod renderer;
pub mod shader;

pub use renderer::{Renderer, RendererDesc};
