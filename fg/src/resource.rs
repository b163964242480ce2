use gpu_core::{self as gpu, Handle};
use std::any::TypeId;
use std::marker::PhantomData;

/// Frame-graph pin references. The raw value is the pin storage key; a node
/// declares pins as plain fields and the runtime writes the resolved storage
/// handle into them before build/execute run.
pub mod pin {
    use super::*;

    /// Marker for pin storage pool entries.
    pub enum Storage {}

    macro_rules! def_resource_pin {
        ($name:ident) => {
            #[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Debug)]
            #[repr(transparent)]
            pub struct $name(pub(crate) u32);

            impl $name {
                pub fn is_none(self) -> bool {
                    self.0 == 0
                }

                pub fn is_some(self) -> bool {
                    self.0 != 0
                }

                pub(crate) fn storage(self) -> Handle<Storage> {
                    Handle::from_raw(self.0)
                }

                #[allow(dead_code)]
                pub(crate) fn from_storage(handle: Handle<Storage>) -> Self {
                    Self(handle.raw())
                }
            }
        };
    }

    def_resource_pin!(Buffer);
    def_resource_pin!(Texture);
    def_resource_pin!(AccelerationStructure);

    /// A pin flowing arbitrary plain data of type `T` between nodes.
    #[repr(transparent)]
    pub struct Data<T> {
        pub(crate) value: u32,
        _marker: PhantomData<*const T>,
    }

    impl<T> Data<T> {
        pub fn is_some(&self) -> bool {
            self.value != 0
        }

        pub(crate) fn storage(&self) -> Handle<Storage> {
            Handle::from_raw(self.value)
        }
    }

    impl<T> Clone for Data<T> {
        fn clone(&self) -> Self {
            *self
        }
    }
    impl<T> Copy for Data<T> {}

    impl<T> Default for Data<T> {
        fn default() -> Self {
            Self {
                value: 0,
                _marker: PhantomData,
            }
        }
    }
}

/// Handle to a texture created through the frame graph whose lifetime is
/// managed by a subgraph rather than the per-frame pool.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Debug)]
#[repr(transparent)]
pub struct RetainedTexture(pub(crate) u32);

impl RetainedTexture {
    pub fn is_some(self) -> bool {
        self.0 != 0
    }

    pub(crate) fn storage(self) -> Handle<pin::Storage> {
        Handle::from_raw(self.0)
    }
}

/// Type descriptor of a POD payload: layout plus construct/destruct thunks.
#[derive(Clone, Copy)]
pub struct DataTypeDesc {
    pub size: usize,
    pub align: usize,
    pub type_id: TypeId,
    pub construct: unsafe fn(*mut u8),
    pub destruct: Option<unsafe fn(*mut u8)>,
}

unsafe fn construct_thunk<T: Default>(ptr: *mut u8) {
    std::ptr::write(ptr as *mut T, T::default());
}

unsafe fn destruct_thunk<T>(ptr: *mut u8) {
    std::ptr::drop_in_place(ptr as *mut T);
}

impl DataTypeDesc {
    pub fn of<T: Default + 'static>() -> Self {
        Self {
            size: std::mem::size_of::<T>(),
            align: std::mem::align_of::<T>(),
            type_id: TypeId::of::<T>(),
            construct: construct_thunk::<T>,
            destruct: if std::mem::needs_drop::<T>() {
                Some(destruct_thunk::<T>)
            } else {
                None
            },
        }
    }
}

impl Default for DataTypeDesc {
    fn default() -> Self {
        Self::of::<()>()
    }
}

/// Resolved GPU value a buffer pin dereferences to during execute.
#[derive(Clone, Copy, Default, Debug, PartialEq)]
pub struct FrameGraphBuffer {
    pub handle: Handle<gpu::Buffer>,
    pub offset: u64,
    pub size: u64,
}

impl FrameGraphBuffer {
    pub fn range(&self) -> gpu::BufferRange {
        gpu::BufferRange {
            buffer: self.handle,
            offset: self.offset,
            size: self.size,
        }
    }
}

/// Resolved GPU value a texture pin dereferences to during execute.
#[derive(Clone, Copy, Debug)]
pub struct FrameGraphTexture {
    pub handle: Handle<gpu::Image>,
    pub descriptor: gpu::ImageDesc,
}

impl Default for FrameGraphTexture {
    fn default() -> Self {
        Self {
            handle: Handle::NONE,
            descriptor: gpu::ImageDesc::default(),
        }
    }
}

/// One entry of the pin storage arena. The `data` box holds the pin's
/// declared type; non-owner pins reference the producer's storage through
/// `PinData::referenced_pin` instead of aliasing this pointer.
#[derive(Clone, Copy)]
pub(crate) struct PinStorage {
    pub type_desc: DataTypeDesc,
    pub data: *mut u8,
    pub owner: Handle<crate::graph::PinTag>,
    pub transient_buffer: Handle<crate::resource_pool::TransientBuffer>,
    pub transient_texture: Handle<crate::resource_pool::TransientTexture>,
    pub is_owned_texture: bool,
    pub has_path_to_output: bool,
}

impl Default for PinStorage {
    fn default() -> Self {
        Self {
            type_desc: DataTypeDesc::of::<()>(),
            data: std::ptr::null_mut(),
            owner: Handle::NONE,
            transient_buffer: Handle::NONE,
            transient_texture: Handle::NONE,
            is_owned_texture: false,
            has_path_to_output: false,
        }
    }
}

/// How a pass uses a buffer pin.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferAccess {
    StorageRead,
    StorageWrite,
    StorageUpload,
    Uniform,
    Indirect,
    Index,
    Download,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferAccessKind {
    Read,
    Write,
}

pub(crate) fn buffer_usage_flags(access: BufferAccess) -> gpu::BufferUsage {
    match access {
        BufferAccess::StorageRead | BufferAccess::StorageWrite | BufferAccess::StorageUpload => {
            gpu::BufferUsage::STORAGE
        }
        BufferAccess::Uniform => gpu::BufferUsage::UNIFORM,
        BufferAccess::Indirect => gpu::BufferUsage::INDIRECT,
        BufferAccess::Index => gpu::BufferUsage::INDEX,
        BufferAccess::Download => gpu::BufferUsage::TRANSFER_SOURCE,
    }
}

pub(crate) fn image_usage_flags(state: gpu::ImageState) -> gpu::ImageUsage {
    match state {
        gpu::ImageState::ShaderRead => gpu::ImageUsage::SHADER_SAMPLE,
        gpu::ImageState::StorageRead | gpu::ImageState::StorageWrite => gpu::ImageUsage::STORAGE,
        gpu::ImageState::RenderTargetWrite => gpu::ImageUsage::COLOR_ATTACHMENT,
        gpu::ImageState::DepthStencilRead | gpu::ImageState::DepthStencilWrite => {
            gpu::ImageUsage::DEPTH_STENCIL
        }
        gpu::ImageState::TransferSource => gpu::ImageUsage::TRANSFER_SOURCE,
        gpu::ImageState::TransferDestination => gpu::ImageUsage::TRANSFER_DESTINATION,
        _ => gpu::ImageUsage::empty(),
    }
}

/// Initializer for a frame-graph texture.
#[derive(Clone, Copy, Debug)]
pub struct TextureInit {
    pub width: u32,
    pub height: u32,
    pub format: gpu::Format,
    pub debug_label: &'static str,
    /// Pins the image to a dedicated allocation surviving across frames.
    pub is_stable: bool,
}

impl Default for TextureInit {
    fn default() -> Self {
        Self {
            width: 1,
            height: 1,
            format: gpu::Format::Undefined,
            debug_label: "",
            is_stable: false,
        }
    }
}

pub(crate) fn image_desc_from_init(init: &TextureInit, usage: gpu::ImageUsage) -> gpu::ImageDesc {
    gpu::ImageDesc {
        format: init.format,
        width: init.width,
        height: init.height,
        depth: 1,
        mip_levels: 1,
        array_layers: 1,
        usage,
        memory_usage: gpu::MemoryUsage::GpuOnly,
        debug_label: init.debug_label,
    }
}

/// Initializer for a frame-graph buffer; non-empty `data` is staged and
/// uploaded before any pass executes.
#[derive(Clone, Copy, Debug, Default)]
pub struct BufferInit<'a> {
    pub size: u64,
    pub data: &'a [u8],
    pub is_stable: bool,
}

/// Descriptor of a texture as currently registered with the resource pool.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TextureInitDesc {
    pub width: u32,
    pub height: u32,
    pub format: gpu::Format,
}
