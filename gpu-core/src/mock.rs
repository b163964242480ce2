//! Recording mock backend. Buffers are backed by host shadow memory so
//! staging, uploads and downloads round-trip for real; everything else is
//! recorded into a command log the tests can inspect.

use crate::device::Device;
use crate::handles::{Handle, HandlePool};
use crate::types::*;
use anyhow::{anyhow, bail};
use std::sync::Mutex;

pub struct MockBuffer {
    pub desc: BufferDesc,
    pub memory: Vec<u8>,
    pub base_address: u64,
}

pub struct MockImage {
    pub desc: ImageDesc,
}

pub struct MockAccelerationStructure {
    pub desc: AccelerationStructureDesc,
    pub address: u64,
    pub built: bool,
}

pub struct MockBindGroup {
    pub layout: Handle<BindGroupLayout>,
    pub writes: Vec<BindGroupWrite>,
    pub bindless_images: Vec<ImageInfo>,
}

#[derive(Clone, Debug)]
pub enum MockCommand {
    ApplyBarriers {
        buffers: Vec<BufferBarrier>,
        images: Vec<ImageTransition>,
        memory: Vec<GlobalBarrier>,
    },
    BindPipeline(BindPoint, Handle<Pipeline>),
    BeginRendering,
    EndRendering,
    BindGroups {
        bind_point: BindPoint,
        first_set: u32,
        groups: Vec<Handle<BindGroup>>,
    },
    PushConstants {
        stages: ShaderStageFlags,
        offset: u32,
        data: Vec<u8>,
    },
    DispatchCompute(u32, u32, u32),
    TraceRays(u32, u32, u32),
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
    },
    DrawMeshTasksIndirectCount {
        max_draw_count: u32,
    },
    Blit {
        src: Handle<Image>,
        dst: Handle<Image>,
    },
    BindIndexBuffer {
        buffer: Handle<Buffer>,
        offset: u64,
        index_type: IndexType,
    },
    SetViewport,
    SetScissor,
    CopyBuffer {
        src: BufferRange,
        dst: BufferRange,
    },
    CopyBufferToImage {
        src: Handle<Buffer>,
        dst: Handle<Image>,
    },
    BuildAccelerationStructures {
        count: u32,
    },
    BeginDebugLabel(String),
    EndDebugLabel,
}

#[derive(Default)]
struct MockState {
    buffers: HandlePool<MockBuffer>,
    images: HandlePool<MockImage>,
    samplers: HandlePool<SamplerDesc>,
    shader_modules: HandlePool<Vec<u32>>,
    bind_group_layouts: HandlePool<BindGroupLayoutDesc>,
    pipeline_layouts: HandlePool<PipelineLayoutDesc>,
    pipelines: HandlePool<BindPoint>,
    acceleration_structures: HandlePool<MockAccelerationStructure>,
    bind_groups: HandlePool<MockBindGroup>,

    commands: Vec<MockCommand>,
    deferred: Vec<(GpuObject, u64)>,

    submit_index: u64,
    last_finished_submit: u64,

    next_address: u64,
    fail_resource_creation: bool,

    image_creations: u64,
    buffer_creations: u64,
    as_creations: u64,
    destroyed: u64,
}

pub struct MockDevice {
    state: Mutex<MockState>,
    info: DeviceInfo,
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDevice {
    pub fn new() -> Self {
        let mut state = MockState::default();
        state.submit_index = 1;
        state.next_address = 0x1000_0000;

        Self {
            state: Mutex::new(state),
            info: DeviceInfo {
                subgroup_size: 64,
                max_bindless_images: 2048,
                shader_groups: ShaderGroupInfo {
                    handle_size: 32,
                    handle_alignment: 32,
                    base_alignment: 64,
                },
                is_ray_tracing_supported: true,
            },
        }
    }

    /// Advances the frame: the next recorded work belongs to a new submit.
    pub fn end_frame(&self) {
        let mut state = self.state.lock().unwrap();
        state.submit_index += 1;
    }

    /// Marks submits up to and including `submit` as finished on the "GPU"
    /// and drains the deferred destruction queue.
    pub fn complete_submits_up_to(&self, submit: u64) {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;

        state.last_finished_submit = submit;

        let mut retained = Vec::new();
        for (object, destroy_submit) in state.deferred.drain(..) {
            if destroy_submit <= submit {
                state.destroyed += 1;
            } else {
                retained.push((object, destroy_submit));
            }
        }
        state.deferred = retained;
    }

    pub fn set_fail_resource_creation(&self, fail: bool) {
        self.state.lock().unwrap().fail_resource_creation = fail;
    }

    pub fn commands(&self) -> Vec<MockCommand> {
        self.state.lock().unwrap().commands.clone()
    }

    pub fn clear_commands(&self) {
        self.state.lock().unwrap().commands.clear();
    }

    pub fn image_creation_count(&self) -> u64 {
        self.state.lock().unwrap().image_creations
    }

    pub fn buffer_creation_count(&self) -> u64 {
        self.state.lock().unwrap().buffer_creations
    }

    pub fn acceleration_structure_creation_count(&self) -> u64 {
        self.state.lock().unwrap().as_creations
    }

    pub fn destroyed_object_count(&self) -> u64 {
        self.state.lock().unwrap().destroyed
    }

    pub fn pending_deferred_count(&self) -> usize {
        self.state.lock().unwrap().deferred.len()
    }

    pub fn buffer_desc(&self, buffer: Handle<Buffer>) -> Option<BufferDesc> {
        self.state
            .lock()
            .unwrap()
            .buffers
            .get(buffer)
            .map(|b| b.desc.clone())
    }

    pub fn image_desc(&self, image: Handle<Image>) -> Option<ImageDesc> {
        self.state
            .lock()
            .unwrap()
            .images
            .get(image)
            .map(|i| i.desc.clone())
    }

    pub fn bind_group(&self, group: Handle<BindGroup>) -> Option<(Vec<BindGroupWrite>, Vec<ImageInfo>)> {
        self.state
            .lock()
            .unwrap()
            .bind_groups
            .get(group)
            .map(|g| (g.writes.clone(), g.bindless_images.clone()))
    }

    fn record(&self, command: MockCommand) {
        self.state.lock().unwrap().commands.push(command);
    }
}

impl Device for MockDevice {
    fn create_image(&self, desc: &ImageDesc) -> anyhow::Result<Handle<Image>> {
        let mut state = self.state.lock().unwrap();
        if state.fail_resource_creation {
            bail!("mock image creation failure");
        }
        state.image_creations += 1;
        Ok(state.images.insert_tagged(MockImage { desc: desc.clone() }))
    }

    fn create_buffer(&self, desc: &BufferDesc) -> anyhow::Result<Handle<Buffer>> {
        let mut state = self.state.lock().unwrap();
        if state.fail_resource_creation {
            bail!("mock buffer creation failure");
        }
        state.buffer_creations += 1;

        let base_address = state.next_address;
        state.next_address += desc.size.max(1).next_power_of_two().max(256);

        Ok(state.buffers.insert_tagged(MockBuffer {
            desc: desc.clone(),
            memory: vec![0u8; desc.size as usize],
            base_address,
        }))
    }

    fn create_sampler(&self, desc: &SamplerDesc) -> anyhow::Result<Handle<Sampler>> {
        Ok(self.state.lock().unwrap().samplers.insert_tagged(*desc))
    }

    fn create_shader_module(
        &self,
        spirv: &[u32],
        _debug_label: &str,
    ) -> anyhow::Result<Handle<ShaderModule>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .shader_modules
            .insert_tagged(spirv.to_vec()))
    }

    fn create_bind_group_layout(
        &self,
        desc: &BindGroupLayoutDesc,
    ) -> anyhow::Result<Handle<BindGroupLayout>> {
        Ok(self.state.lock().unwrap().bind_group_layouts.insert_tagged(desc.clone()))
    }

    fn create_pipeline_layout(
        &self,
        desc: &PipelineLayoutDesc,
    ) -> anyhow::Result<Handle<PipelineLayout>> {
        Ok(self.state.lock().unwrap().pipeline_layouts.insert_tagged(desc.clone()))
    }

    fn create_graphics_pipeline(
        &self,
        _desc: &GraphicsPipelineDesc,
    ) -> anyhow::Result<Handle<Pipeline>> {
        let mut state = self.state.lock().unwrap();
        if state.fail_resource_creation {
            bail!("mock pipeline creation failure");
        }
        Ok(state.pipelines.insert_tagged(BindPoint::Graphics))
    }

    fn create_compute_pipeline(&self, _desc: &ComputePipelineDesc) -> anyhow::Result<Handle<Pipeline>> {
        let mut state = self.state.lock().unwrap();
        if state.fail_resource_creation {
            bail!("mock pipeline creation failure");
        }
        Ok(state.pipelines.insert_tagged(BindPoint::Compute))
    }

    fn create_raytracing_pipeline(
        &self,
        _desc: &RayTracingPipelineDesc,
    ) -> anyhow::Result<Handle<Pipeline>> {
        let mut state = self.state.lock().unwrap();
        if state.fail_resource_creation {
            bail!("mock pipeline creation failure");
        }
        Ok(state.pipelines.insert_tagged(BindPoint::RayTracing))
    }

    fn create_acceleration_structure(
        &self,
        desc: &AccelerationStructureDesc,
    ) -> anyhow::Result<Handle<AccelerationStructure>> {
        let mut state = self.state.lock().unwrap();
        if state.fail_resource_creation {
            bail!("mock acceleration structure creation failure");
        }
        state.as_creations += 1;

        let address = state.next_address;
        state.next_address += 0x1000;

        Ok(state.acceleration_structures.insert_tagged(MockAccelerationStructure {
            desc: *desc,
            address,
            built: false,
        }))
    }

    fn get_shader_group_handles(
        &self,
        _pipeline: Handle<Pipeline>,
        group_count: u32,
    ) -> anyhow::Result<Vec<u8>> {
        let handle_size = self.info.shader_groups.handle_size as usize;
        let mut handles = vec![0u8; group_count as usize * handle_size];
        for (i, chunk) in handles.chunks_mut(handle_size).enumerate() {
            chunk[0] = i as u8 + 1;
        }
        Ok(handles)
    }

    fn acquire_transient_bind_group(
        &self,
        layout: Handle<BindGroupLayout>,
        writes: &[BindGroupWrite],
        _variable_count: Option<u32>,
    ) -> anyhow::Result<Handle<BindGroup>> {
        Ok(self.state.lock().unwrap().bind_groups.insert_tagged(MockBindGroup {
            layout,
            writes: writes.to_vec(),
            bindless_images: Vec::new(),
        }))
    }

    fn update_bindless_images(&self, group: Handle<BindGroup>, images: &[ImageInfo]) {
        if let Some(g) = self.state.lock().unwrap().bind_groups.get_mut(group) {
            g.bindless_images = images.to_vec();
        }
    }

    fn cmd_begin_debug_label(&self, _cmd: CommandBuffer, label: &str) {
        self.record(MockCommand::BeginDebugLabel(label.to_owned()));
    }

    fn cmd_end_debug_label(&self, _cmd: CommandBuffer) {
        self.record(MockCommand::EndDebugLabel);
    }

    fn cmd_apply_barriers(&self, _cmd: CommandBuffer, barriers: &Barriers<'_>) {
        self.record(MockCommand::ApplyBarriers {
            buffers: barriers.buffers.to_vec(),
            images: barriers.images.to_vec(),
            memory: barriers.memory.to_vec(),
        });
    }

    fn cmd_bind_pipeline(&self, _cmd: CommandBuffer, bind_point: BindPoint, pipeline: Handle<Pipeline>) {
        self.record(MockCommand::BindPipeline(bind_point, pipeline));
    }

    fn cmd_begin_rendering(&self, _cmd: CommandBuffer, _desc: &GraphicsPassDesc) {
        self.record(MockCommand::BeginRendering);
    }

    fn cmd_end_rendering(&self, _cmd: CommandBuffer) {
        self.record(MockCommand::EndRendering);
    }

    fn cmd_bind_groups(
        &self,
        _cmd: CommandBuffer,
        bind_point: BindPoint,
        _layout: Handle<PipelineLayout>,
        first_set: u32,
        groups: &[Handle<BindGroup>],
    ) {
        self.record(MockCommand::BindGroups {
            bind_point,
            first_set,
            groups: groups.to_vec(),
        });
    }

    fn cmd_push_constants(
        &self,
        _cmd: CommandBuffer,
        _layout: Handle<PipelineLayout>,
        stages: ShaderStageFlags,
        offset: u32,
        data: &[u8],
    ) {
        self.record(MockCommand::PushConstants {
            stages,
            offset,
            data: data.to_vec(),
        });
    }

    fn cmd_dispatch_compute(&self, _cmd: CommandBuffer, x: u32, y: u32, z: u32) {
        self.record(MockCommand::DispatchCompute(x, y, z));
    }

    fn cmd_trace_rays(
        &self,
        _cmd: CommandBuffer,
        _regions: &ShaderBindingTableRegions,
        width: u32,
        height: u32,
        depth: u32,
    ) {
        self.record(MockCommand::TraceRays(width, height, depth));
    }

    fn cmd_draw_indexed(
        &self,
        _cmd: CommandBuffer,
        index_count: u32,
        instance_count: u32,
        _first_index: u32,
        _vertex_offset: i32,
        _first_instance: u32,
    ) {
        self.record(MockCommand::DrawIndexed {
            index_count,
            instance_count,
        });
    }

    fn cmd_draw_mesh_tasks_indirect_count(
        &self,
        _cmd: CommandBuffer,
        _draw_buffer: BufferRange,
        _draw_offset: u64,
        _count_buffer: BufferRange,
        _count_offset: u64,
        max_draw_count: u32,
    ) {
        self.record(MockCommand::DrawMeshTasksIndirectCount { max_draw_count });
    }

    fn cmd_blit(&self, _cmd: CommandBuffer, src: Handle<Image>, dst: Handle<Image>, _filter: SamplerFilter) {
        self.record(MockCommand::Blit { src, dst });
    }

    fn cmd_bind_index_buffer(
        &self,
        _cmd: CommandBuffer,
        buffer: Handle<Buffer>,
        offset: u64,
        index_type: IndexType,
    ) {
        self.record(MockCommand::BindIndexBuffer {
            buffer,
            offset,
            index_type,
        });
    }

    fn cmd_set_viewport(&self, _cmd: CommandBuffer, _w: u32, _h: u32, _min_depth: f32, _max_depth: f32) {
        self.record(MockCommand::SetViewport);
    }

    fn cmd_set_scissor(&self, _cmd: CommandBuffer, _x: i32, _y: i32, _w: u32, _h: u32) {
        self.record(MockCommand::SetScissor);
    }

    fn cmd_copy_buffer(&self, _cmd: CommandBuffer, src: BufferRange, dst: BufferRange) {
        // Copies execute eagerly on the shadow memory; the submit-index
        // gating the runtime relies on is still exercised because reads are
        // only performed after `get_last_finished_submit` allows them.
        let mut state = self.state.lock().unwrap();

        let data: Vec<u8> = match state.buffers.get(src.buffer) {
            Some(buffer) => {
                let begin = src.offset as usize;
                let end = begin + src.size as usize;
                buffer.memory[begin..end].to_vec()
            }
            None => {
                log::error!("copy from unknown buffer {:?}", src.buffer);
                return;
            }
        };

        match state.buffers.get_mut(dst.buffer) {
            Some(buffer) => {
                let begin = dst.offset as usize;
                let end = begin + data.len();
                buffer.memory[begin..end].copy_from_slice(&data);
            }
            None => {
                log::error!("copy into unknown buffer {:?}", dst.buffer);
                return;
            }
        }

        state.commands.push(MockCommand::CopyBuffer { src, dst });
    }

    fn cmd_copy_buffer_to_image(
        &self,
        _cmd: CommandBuffer,
        src: Handle<Buffer>,
        _src_offset: u64,
        dst: Handle<Image>,
    ) {
        self.record(MockCommand::CopyBufferToImage { src, dst });
    }

    fn cmd_build_acceleration_structures(&self, _cmd: CommandBuffer, builds: &[AsBuild]) {
        let mut state = self.state.lock().unwrap();
        for build in builds {
            if let Some(a) = state.acceleration_structures.get_mut(build.acceleration_structure) {
                a.built = true;
            }
        }
        state.commands.push(MockCommand::BuildAccelerationStructures {
            count: builds.len() as u32,
        });
    }

    fn get_device_info(&self) -> DeviceInfo {
        self.info
    }

    fn get_submit_index(&self) -> u64 {
        self.state.lock().unwrap().submit_index
    }

    fn get_last_finished_submit(&self) -> u64 {
        self.state.lock().unwrap().last_finished_submit
    }

    fn get_device_address(&self, range: BufferRange) -> u64 {
        self.state
            .lock()
            .unwrap()
            .buffers
            .get(range.buffer)
            .map(|b| b.base_address + range.offset)
            .unwrap_or(0)
    }

    fn get_acceleration_structure_address(&self, handle: Handle<AccelerationStructure>) -> u64 {
        self.state
            .lock()
            .unwrap()
            .acceleration_structures
            .get(handle)
            .map(|a| a.address)
            .unwrap_or(0)
    }

    fn get_acceleration_structure_build_sizes(&self, geometry: &AsGeometry) -> AsBuildSizes {
        let units = match geometry {
            AsGeometry::Triangles(triangles) => u64::from(triangles.primitive_count),
            AsGeometry::Instances(instances) => u64::from(instances.instance_count),
        };

        AsBuildSizes {
            acceleration_structure_size: 256 + units * 64,
            build_scratch_size: 128 + units * 16,
        }
    }

    fn write_buffer(&self, buffer: Handle<Buffer>, offset: u64, data: &[u8]) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        let b = state
            .buffers
            .get_mut(buffer)
            .ok_or_else(|| anyhow!("unknown buffer"))?;

        let begin = offset as usize;
        let end = begin + data.len();
        anyhow::ensure!(end <= b.memory.len(), "write out of bounds");
        b.memory[begin..end].copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&self, buffer: Handle<Buffer>, offset: u64, out: &mut [u8]) -> anyhow::Result<()> {
        let state = self.state.lock().unwrap();
        let b = state
            .buffers
            .get(buffer)
            .ok_or_else(|| anyhow!("unknown buffer"))?;

        let begin = offset as usize;
        let end = begin + out.len();
        anyhow::ensure!(end <= b.memory.len(), "read out of bounds");
        out.copy_from_slice(&b.memory[begin..end]);
        Ok(())
    }

    fn invalidate_mapped_ranges(&self, _buffer: Handle<Buffer>) -> anyhow::Result<()> {
        Ok(())
    }

    fn destroy_deferred(&self, object: GpuObject, submit_index: u64) {
        self.state.lock().unwrap().deferred.push((object, submit_index));
    }
}
