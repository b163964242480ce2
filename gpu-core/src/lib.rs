//! Interface surface of the GPU abstraction consumed by the frame graph
//! runtime: typed handles, resource descriptors, the recording [`Device`]
//! trait, the upload staging ring, and a mock backend for tests.

pub mod device;
pub mod handles;
pub mod mock;
pub mod staging;
pub mod types;

pub use device::*;
pub use handles::*;
pub use staging::*;
pub use types::*;
