use crate::handles::Handle;
use crate::types::*;

/// The recording/creation surface the renderer core consumes. One logical
/// graphics queue, one command buffer per frame, submitted once.
///
/// Creation failures are reported through `anyhow::Result`; recording entry
/// points are infallible (invalid handles are a programming error and are
/// logged or ignored by implementations).
pub trait Device {
    // ---------------------------------------------------------------------
    // Resource creation

    fn create_image(&self, desc: &ImageDesc) -> anyhow::Result<Handle<Image>>;
    fn create_buffer(&self, desc: &BufferDesc) -> anyhow::Result<Handle<Buffer>>;
    fn create_sampler(&self, desc: &SamplerDesc) -> anyhow::Result<Handle<Sampler>>;
    fn create_shader_module(
        &self,
        spirv: &[u32],
        debug_label: &str,
    ) -> anyhow::Result<Handle<ShaderModule>>;
    fn create_bind_group_layout(
        &self,
        desc: &BindGroupLayoutDesc,
    ) -> anyhow::Result<Handle<BindGroupLayout>>;
    fn create_pipeline_layout(
        &self,
        desc: &PipelineLayoutDesc,
    ) -> anyhow::Result<Handle<PipelineLayout>>;
    fn create_graphics_pipeline(
        &self,
        desc: &GraphicsPipelineDesc,
    ) -> anyhow::Result<Handle<Pipeline>>;
    fn create_compute_pipeline(
        &self,
        desc: &ComputePipelineDesc,
    ) -> anyhow::Result<Handle<Pipeline>>;
    fn create_raytracing_pipeline(
        &self,
        desc: &RayTracingPipelineDesc,
    ) -> anyhow::Result<Handle<Pipeline>>;
    fn create_acceleration_structure(
        &self,
        desc: &AccelerationStructureDesc,
    ) -> anyhow::Result<Handle<AccelerationStructure>>;

    /// Queries the opaque shader group handles of a ray tracing pipeline,
    /// `group_count * handle_size` bytes.
    fn get_shader_group_handles(
        &self,
        pipeline: Handle<Pipeline>,
        group_count: u32,
    ) -> anyhow::Result<Vec<u8>>;

    /// Transient bind group, valid until the current frame's submit. The
    /// descriptor pool behind it recycles sets per frame.
    fn acquire_transient_bind_group(
        &self,
        layout: Handle<BindGroupLayout>,
        writes: &[BindGroupWrite],
        variable_count: Option<u32>,
    ) -> anyhow::Result<Handle<BindGroup>>;

    /// Update-after-bind write of the bindless image array into an already
    /// acquired bind group.
    fn update_bindless_images(&self, group: Handle<BindGroup>, images: &[ImageInfo]);

    // ---------------------------------------------------------------------
    // Recording

    fn cmd_begin_debug_label(&self, cmd: CommandBuffer, label: &str);
    fn cmd_end_debug_label(&self, cmd: CommandBuffer);

    fn cmd_apply_barriers(&self, cmd: CommandBuffer, barriers: &Barriers<'_>);

    fn cmd_bind_pipeline(&self, cmd: CommandBuffer, bind_point: BindPoint, pipeline: Handle<Pipeline>);
    fn cmd_begin_rendering(&self, cmd: CommandBuffer, desc: &GraphicsPassDesc);
    fn cmd_end_rendering(&self, cmd: CommandBuffer);

    fn cmd_bind_groups(
        &self,
        cmd: CommandBuffer,
        bind_point: BindPoint,
        layout: Handle<PipelineLayout>,
        first_set: u32,
        groups: &[Handle<BindGroup>],
    );

    fn cmd_push_constants(
        &self,
        cmd: CommandBuffer,
        layout: Handle<PipelineLayout>,
        stages: ShaderStageFlags,
        offset: u32,
        data: &[u8],
    );

    fn cmd_dispatch_compute(&self, cmd: CommandBuffer, groups_x: u32, groups_y: u32, groups_z: u32);

    fn cmd_trace_rays(
        &self,
        cmd: CommandBuffer,
        regions: &ShaderBindingTableRegions,
        width: u32,
        height: u32,
        depth: u32,
    );

    fn cmd_draw_indexed(
        &self,
        cmd: CommandBuffer,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    );

    fn cmd_draw_mesh_tasks_indirect_count(
        &self,
        cmd: CommandBuffer,
        draw_buffer: BufferRange,
        draw_offset: u64,
        count_buffer: BufferRange,
        count_offset: u64,
        max_draw_count: u32,
    );

    fn cmd_blit(&self, cmd: CommandBuffer, src: Handle<Image>, dst: Handle<Image>, filter: SamplerFilter);

    fn cmd_bind_index_buffer(
        &self,
        cmd: CommandBuffer,
        buffer: Handle<Buffer>,
        offset: u64,
        index_type: IndexType,
    );

    fn cmd_set_viewport(&self, cmd: CommandBuffer, width: u32, height: u32, min_depth: f32, max_depth: f32);
    fn cmd_set_scissor(&self, cmd: CommandBuffer, x: i32, y: i32, width: u32, height: u32);

    fn cmd_copy_buffer(&self, cmd: CommandBuffer, src: BufferRange, dst: BufferRange);

    /// Copies one staged segment into a whole image (mip 0, layer 0).
    fn cmd_copy_buffer_to_image(
        &self,
        cmd: CommandBuffer,
        src: Handle<Buffer>,
        src_offset: u64,
        dst: Handle<Image>,
    );

    fn cmd_build_acceleration_structures(&self, cmd: CommandBuffer, builds: &[AsBuild]);

    // ---------------------------------------------------------------------
    // Queries

    fn get_device_info(&self) -> DeviceInfo;

    /// Index of the submit the current frame's command buffer belongs to.
    fn get_submit_index(&self) -> u64;

    /// Highest submit index the GPU has fully completed.
    fn get_last_finished_submit(&self) -> u64;

    fn get_device_address(&self, range: BufferRange) -> u64;

    fn get_acceleration_structure_address(&self, handle: Handle<AccelerationStructure>) -> u64;

    fn get_acceleration_structure_build_sizes(&self, geometry: &AsGeometry) -> AsBuildSizes;

    // ---------------------------------------------------------------------
    // Host access (host-visible allocations only)

    fn write_buffer(&self, buffer: Handle<Buffer>, offset: u64, data: &[u8]) -> anyhow::Result<()>;
    fn read_buffer(&self, buffer: Handle<Buffer>, offset: u64, out: &mut [u8]) -> anyhow::Result<()>;
    fn invalidate_mapped_ranges(&self, buffer: Handle<Buffer>) -> anyhow::Result<()>;

    // ---------------------------------------------------------------------
    // Lifetime

    /// Queues the object for destruction once `submit_index` has finished on
    /// the GPU.
    fn destroy_deferred(&self, object: GpuObject, submit_index: u64);
}
