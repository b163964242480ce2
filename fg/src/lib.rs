//! Frame graph runtime: subgraph templates instantiated into a per-frame
//! DAG of passes, transient resource pooling with derived barriers, a pass /
//! pipeline manager with shader hot reload, and asynchronous GPU readback.

pub mod binding_table;
pub mod context;
pub mod download;
pub mod graph;
pub mod pass_manager;
pub mod reflection;
pub mod resource;
pub mod resource_pool;
pub mod template;
pub mod texture_registry;
pub mod topology;

mod barriers;
mod frame_alloc;
mod image_state;

pub use binding_table::*;
pub use context::*;
pub use download::AsyncDownload;
pub use graph::*;
pub use pass_manager::*;
pub use resource::*;
pub use template::*;
pub use texture_registry::*;
