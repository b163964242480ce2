use crate::handles::Handle;
use bitflags::bitflags;

// Opaque GPU object markers.
pub struct Image;
pub struct Buffer;
pub struct Sampler;
pub struct ShaderModule;
pub struct BindGroupLayout;
pub struct BindGroup;
pub struct PipelineLayout;
pub struct Pipeline;
pub struct AccelerationStructure;

/// Token for the command buffer the frame records into.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct CommandBuffer(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Format {
    Undefined,
    R8Unorm,
    Rgba8Unorm,
    Rgba8Srgb,
    Bgra8Unorm,
    R16Sfloat,
    Rg16Sfloat,
    Rgba16Sfloat,
    R32Sfloat,
    Rg32Sfloat,
    Rgb32Sfloat,
    Rgba32Sfloat,
    R32Uint,
    D24UnormS8Uint,
    D32Sfloat,
}

impl Default for Format {
    fn default() -> Self {
        Format::Undefined
    }
}

bitflags! {
    pub struct ImageUsage: u32 {
        const TRANSFER_SOURCE = 1 << 0;
        const TRANSFER_DESTINATION = 1 << 1;
        const SHADER_SAMPLE = 1 << 2;
        const STORAGE = 1 << 3;
        const COLOR_ATTACHMENT = 1 << 4;
        const DEPTH_STENCIL = 1 << 5;
    }
}

bitflags! {
    pub struct BufferUsage: u32 {
        const TRANSFER_SOURCE = 1 << 0;
        const TRANSFER_DESTINATION = 1 << 1;
        const STORAGE = 1 << 2;
        const UNIFORM = 1 << 3;
        const INDEX = 1 << 4;
        const INDIRECT = 1 << 5;
        const DEVICE_ADDRESS = 1 << 6;
        const ACCELERATION_STRUCTURE_INPUT = 1 << 7;
        const ACCELERATION_STRUCTURE_STORAGE = 1 << 8;
        const SHADER_BINDING_TABLE = 1 << 9;
    }
}

bitflags! {
    /// Pipeline stages for synchronization, sync2-style.
    pub struct PipelineStages: u32 {
        const TOP_OF_PIPE = 1 << 0;
        const TRANSFER = 1 << 1;
        const COMPUTE = 1 << 2;
        const GRAPHICS = 1 << 3;
        const RAYTRACING = 1 << 4;
        const ACCELERATION_STRUCTURE_BUILD = 1 << 5;
        const ALL_COMMANDS = 1 << 6;
    }
}

bitflags! {
    pub struct MemoryAccess: u32 {
        const ANY_READ = 1 << 0;
        const ANY_WRITE = 1 << 1;
    }
}

bitflags! {
    #[derive(Default)]
    pub struct ShaderStageFlags: u32 {
        const VERTEX = 1 << 0;
        const FRAGMENT = 1 << 1;
        const COMPUTE = 1 << 2;
        const MESH = 1 << 3;
        const TASK = 1 << 4;
        const RAYGEN = 1 << 5;
        const INTERSECTION = 1 << 6;
        const ANY_HIT = 1 << 7;
        const CLOSEST_HIT = 1 << 8;
        const MISS = 1 << 9;
        const CALLABLE = 1 << 10;
        const ALL = !0;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Compute,
    Mesh,
    Task,
    Raygen,
    Intersection,
    AnyHit,
    ClosestHit,
    Miss,
    Callable,
}

impl ShaderStage {
    pub fn flags(self) -> ShaderStageFlags {
        match self {
            ShaderStage::Vertex => ShaderStageFlags::VERTEX,
            ShaderStage::Fragment => ShaderStageFlags::FRAGMENT,
            ShaderStage::Compute => ShaderStageFlags::COMPUTE,
            ShaderStage::Mesh => ShaderStageFlags::MESH,
            ShaderStage::Task => ShaderStageFlags::TASK,
            ShaderStage::Raygen => ShaderStageFlags::RAYGEN,
            ShaderStage::Intersection => ShaderStageFlags::INTERSECTION,
            ShaderStage::AnyHit => ShaderStageFlags::ANY_HIT,
            ShaderStage::ClosestHit => ShaderStageFlags::CLOSEST_HIT,
            ShaderStage::Miss => ShaderStageFlags::MISS,
            ShaderStage::Callable => ShaderStageFlags::CALLABLE,
        }
    }
}

/// Logical image state used for layout transitions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ImageState {
    Undefined,
    ShaderRead,
    StorageRead,
    StorageWrite,
    RenderTargetWrite,
    DepthStencilRead,
    DepthStencilWrite,
    TransferSource,
    TransferDestination,
    Present,
}

impl Default for ImageState {
    fn default() -> Self {
        ImageState::Undefined
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MemoryUsage {
    GpuOnly,
    HostVisible,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ImageDesc {
    pub format: Format,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub usage: ImageUsage,
    pub memory_usage: MemoryUsage,
    pub debug_label: &'static str,
}

impl Default for ImageDesc {
    fn default() -> Self {
        Self {
            format: Format::Undefined,
            width: 1,
            height: 1,
            depth: 1,
            mip_levels: 1,
            array_layers: 1,
            usage: ImageUsage::empty(),
            memory_usage: MemoryUsage::GpuOnly,
            debug_label: "",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct BufferDesc {
    pub size: u64,
    pub usage: BufferUsage,
    pub memory_usage: MemoryUsage,
    pub debug_label: &'static str,
}

impl Default for BufferDesc {
    fn default() -> Self {
        Self {
            size: 0,
            usage: BufferUsage::empty(),
            memory_usage: MemoryUsage::GpuOnly,
            debug_label: "",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SamplerFilter {
    Nearest,
    Linear,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SamplerAddressMode {
    Repeat,
    ClampToEdge,
    ClampToBorderBlack,
    ClampToBorderWhite,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SamplerDesc {
    pub filter: SamplerFilter,
    pub address_mode: SamplerAddressMode,
    pub anisotropy: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DescriptorKind {
    UniformBuffer,
    StorageBuffer,
    StorageImage,
    SampledImage,
    CombinedImageSampler,
    Sampler,
    AccelerationStructure,
}

#[derive(Clone, Debug)]
pub struct BindGroupLayoutEntry {
    pub binding: u32,
    pub count: u32,
    pub kind: DescriptorKind,
    pub stages: ShaderStageFlags,
    pub immutable_samplers: Vec<Handle<Sampler>>,
}

#[derive(Clone, Debug, Default)]
pub struct BindGroupLayoutDesc {
    pub entries: Vec<BindGroupLayoutEntry>,
    /// Enables partially-bound, variable-count, update-after-bind semantics
    /// on the last entry (the bindless texture array).
    pub update_after_bind: bool,
}

impl Default for BindGroupLayoutEntry {
    fn default() -> Self {
        Self {
            binding: 0,
            count: 1,
            kind: DescriptorKind::UniformBuffer,
            stages: ShaderStageFlags::ALL,
            immutable_samplers: Vec::new(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct BufferRange {
    pub buffer: Handle<Buffer>,
    pub offset: u64,
    pub size: u64,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ImageInfo {
    pub image: Handle<Image>,
    pub state: ImageState,
}

/// A resource a binding table can feed into a reflected binding.
#[derive(Clone, Copy, Debug)]
pub enum BindableObject {
    Buffer(BufferRange),
    Image(ImageInfo),
    AccelerationStructure(Handle<AccelerationStructure>),
}

#[derive(Clone, Debug)]
pub struct BindGroupWrite {
    pub binding: u32,
    pub kind: DescriptorKind,
    pub object: BindableObject,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct BufferBarrier {
    pub range: BufferRange,
    pub previous_pipelines: PipelineStages,
    pub previous_accesses: MemoryAccess,
    pub next_pipelines: PipelineStages,
    pub next_accesses: MemoryAccess,
}

impl Default for PipelineStages {
    fn default() -> Self {
        PipelineStages::empty()
    }
}

impl Default for MemoryAccess {
    fn default() -> Self {
        MemoryAccess::empty()
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ImageTransition {
    pub image: Handle<Image>,
    pub previous_pipelines: PipelineStages,
    pub next_pipelines: PipelineStages,
    pub previous_state: ImageState,
    pub next_state: ImageState,
}

#[derive(Clone, Copy, Debug)]
pub struct GlobalBarrier {
    pub previous_pipelines: PipelineStages,
    pub previous_accesses: MemoryAccess,
    pub next_pipelines: PipelineStages,
    pub next_accesses: MemoryAccess,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Barriers<'a> {
    pub buffers: &'a [BufferBarrier],
    pub images: &'a [ImageTransition],
    pub memory: &'a [GlobalBarrier],
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BindPoint {
    Graphics,
    Compute,
    RayTracing,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IndexType {
    U16,
    U32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LoadOp {
    Load,
    Clear,
    DontCare,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Store,
    DontCare,
}

#[derive(Clone, Copy, Debug)]
pub struct RenderAttachment {
    pub image: Handle<Image>,
    pub load_op: LoadOp,
    pub store_op: StoreOp,
    pub clear_color: [f32; 4],
}

#[derive(Clone, Copy, Debug, Default)]
pub struct DepthStencilAttachment {
    pub image: Handle<Image>,
    pub clear_depth: f32,
}

/// Dynamic-rendering style pass description.
#[derive(Clone, Debug, Default)]
pub struct GraphicsPassDesc {
    pub color_attachments: Vec<RenderAttachment>,
    pub depth_attachment: Option<DepthStencilAttachment>,
    pub render_width: u32,
    pub render_height: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Never,
    Less,
    LessOrEqual,
    Greater,
    GreaterOrEqual,
    Equal,
    Always,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CullMode {
    None,
    Front,
    Back,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RasterizationState {
    pub cull_mode: CullMode,
    pub front_face_clockwise: bool,
    pub depth_clamp: bool,
    pub depth_bias: f32,
    pub line_width: f32,
}

impl Default for RasterizationState {
    fn default() -> Self {
        Self {
            cull_mode: CullMode::Back,
            front_face_clockwise: false,
            depth_clamp: false,
            depth_bias: 0.0,
            line_width: 1.0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DepthStencilState {
    pub depth_test: bool,
    pub depth_write: bool,
    pub compare_op: CompareOp,
}

impl Default for DepthStencilState {
    fn default() -> Self {
        Self {
            depth_test: false,
            depth_write: false,
            compare_op: CompareOp::GreaterOrEqual,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct RenderTargetsDesc {
    pub color_attachment_formats: Vec<Format>,
    pub depth_format: Option<Format>,
    pub stencil_format: Option<Format>,
}

#[derive(Clone, Copy, Debug)]
pub struct VertexBindingDesc {
    pub binding: u32,
    pub stride: u32,
}

#[derive(Clone, Copy, Debug)]
pub struct VertexAttributeDesc {
    pub location: u32,
    pub binding: u32,
    pub format: Format,
    pub offset: u32,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct PushConstantRange {
    pub stages: ShaderStageFlags,
    pub offset: u32,
    pub size: u32,
}

#[derive(Clone, Debug, Default)]
pub struct PipelineLayoutDesc {
    pub bind_group_layouts: Vec<Handle<BindGroupLayout>>,
    pub push_constant_ranges: Vec<PushConstantRange>,
}

#[derive(Clone, Debug)]
pub struct ShaderStageDesc {
    pub module: Handle<ShaderModule>,
    pub stage: ShaderStage,
    pub entry_point: &'static str,
}

#[derive(Clone, Debug, Default)]
pub struct GraphicsPipelineDesc {
    pub stages: Vec<ShaderStageDesc>,
    pub layout: Handle<PipelineLayout>,
    pub vertex_bindings: Vec<VertexBindingDesc>,
    pub vertex_attributes: Vec<VertexAttributeDesc>,
    pub render_targets: RenderTargetsDesc,
    pub rasterization: RasterizationState,
    pub depth_stencil: DepthStencilState,
    pub debug_label: &'static str,
}

#[derive(Clone, Debug)]
pub struct ComputePipelineDesc {
    pub module: Handle<ShaderModule>,
    pub layout: Handle<PipelineLayout>,
    pub debug_label: &'static str,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RayTracingGroupKind {
    General,
    TrianglesHitGroup,
    ProceduralHitGroup,
}

pub const SHADER_UNUSED: u32 = !0u32;

#[derive(Clone, Copy, Debug)]
pub struct RayTracingGroupDesc {
    pub kind: RayTracingGroupKind,
    pub general: u32,
    pub closest_hit: u32,
    pub any_hit: u32,
    pub intersection: u32,
}

impl Default for RayTracingGroupDesc {
    fn default() -> Self {
        Self {
            kind: RayTracingGroupKind::General,
            general: SHADER_UNUSED,
            closest_hit: SHADER_UNUSED,
            any_hit: SHADER_UNUSED,
            intersection: SHADER_UNUSED,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct RayTracingPipelineDesc {
    pub stages: Vec<ShaderStageDesc>,
    pub groups: Vec<RayTracingGroupDesc>,
    pub layout: Handle<PipelineLayout>,
    pub max_ray_recursion_depth: u32,
    pub debug_label: &'static str,
}

/// One region of the shader binding table.
#[derive(Clone, Copy, Debug, Default)]
pub struct StridedDeviceAddressRegion {
    pub device_address: u64,
    pub stride: u64,
    pub size: u64,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ShaderBindingTableRegions {
    pub raygen: StridedDeviceAddressRegion,
    pub miss: StridedDeviceAddressRegion,
    pub hit: StridedDeviceAddressRegion,
    pub callable: StridedDeviceAddressRegion,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccelerationStructureKind {
    BottomLevel,
    TopLevel,
}

/// Triangle geometry for a bottom-level build.
#[derive(Clone, Copy, Debug)]
pub struct AsTriangleGeometry {
    pub vertex_address: u64,
    pub vertex_stride: u64,
    pub max_vertex: u32,
    pub index_type: IndexType,
    pub index_address: u64,
    pub primitive_count: u32,
}

#[derive(Clone, Copy, Debug)]
pub struct AsInstanceGeometry {
    pub instance_address: u64,
    pub instance_count: u32,
}

#[derive(Clone, Copy, Debug)]
pub enum AsGeometry {
    Triangles(AsTriangleGeometry),
    Instances(AsInstanceGeometry),
}

#[derive(Clone, Copy, Debug, Default)]
pub struct AsBuildSizes {
    pub acceleration_structure_size: u64,
    pub build_scratch_size: u64,
}

#[derive(Clone, Copy, Debug)]
pub struct AccelerationStructureDesc {
    pub kind: AccelerationStructureKind,
    pub buffer: BufferRange,
}

#[derive(Clone, Copy, Debug)]
pub struct AsBuild {
    pub acceleration_structure: Handle<AccelerationStructure>,
    pub geometry: AsGeometry,
    pub scratch_address: u64,
}

/// Memory layout of one TLAS instance entry, as consumed by the
/// acceleration structure builder.
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct AsInstanceData {
    /// Row-major 3x4 object-to-world transform.
    pub transform: [[f32; 4]; 3],
    /// 24 bits of custom index, 8 bits of visibility mask.
    pub instance_custom_index_and_mask: u32,
    /// 24 bits of SBT record offset, 8 bits of flags.
    pub sbt_offset_and_flags: u32,
    pub acceleration_structure_address: u64,
}

#[derive(Clone, Copy, Debug)]
pub struct ShaderGroupInfo {
    pub handle_size: u32,
    pub handle_alignment: u32,
    pub base_alignment: u32,
}

#[derive(Clone, Copy, Debug)]
pub struct DeviceInfo {
    pub subgroup_size: u32,
    pub max_bindless_images: u32,
    pub shader_groups: ShaderGroupInfo,
    pub is_ray_tracing_supported: bool,
}

/// Any GPU object accepted for deferred destruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GpuObject {
    Image(Handle<Image>),
    Buffer(Handle<Buffer>),
    Sampler(Handle<Sampler>),
    ShaderModule(Handle<ShaderModule>),
    BindGroupLayout(Handle<BindGroupLayout>),
    PipelineLayout(Handle<PipelineLayout>),
    Pipeline(Handle<Pipeline>),
    AccelerationStructure(Handle<AccelerationStructure>),
}

/// A span inside a host-visible staging ring. Two segments to handle
/// wrap-around; unused segments are empty.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StagingSegment {
    pub begin: u64,
    pub end: u64,
}

impl StagingSegment {
    pub fn len(&self) -> u64 {
        self.end - self.begin
    }

    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StagingBufferSpan {
    pub segments: [StagingSegment; 2],
}

impl StagingBufferSpan {
    pub fn total_size(&self) -> u64 {
        self.segments[0].len() + self.segments[1].len()
    }
}
