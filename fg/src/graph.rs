use crate::context::{BuildContext, ExecuteContext, InitContext};
use crate::download::{AsyncDownload, DownloadStaging, PendingDownload};
use crate::frame_alloc::{alloc_erased, free_erased, FrameAllocator};
use crate::image_state::ImageStateTracker;
use crate::pass_manager::{
    ComputePipeline, PassManager, RayTracingPipeline, RenderPipeline, ShaderCompilerConfig,
};
use crate::resource::{pin, DataTypeDesc, FrameGraphTexture, PinStorage};
use crate::resource_pool::{ResourcePool, TransientBuffer, TransientTexture};
use crate::template::{BuildFn, ExecuteFn, GraphTemplate, InitFn, SinkClearFn};
use crate::texture_registry::{ResidentTexture, TextureRegistry};
use crate::topology::{Topology, Vertex, VertexKind, VertexState};
use anyhow::bail;
use gpu_core::{self as gpu, Device, Handle, HandlePool, StagingBuffer};
use std::any::TypeId;
use std::collections::{HashMap, HashSet};
use std::sync::mpsc;

// Size of the per-frame bump arena backing dynamic pin storage.
const FRAME_ARENA_SIZE: usize = 64 << 20;

// Fixed size for now, downloads are small (metrics, picking).
const DOWNLOAD_STAGING_SIZE: u64 = 64 << 10;

/// The global TLAS is the only acceleration structure pin for now.
pub const GLOBAL_TLAS: pin::AccelerationStructure = pin::AccelerationStructure(1);

// Handle markers for the node/pin pools.
pub enum NodeTag {}
pub enum PinTag {}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PassKind {
    None,
    Graphics,
    Compute,
    RayTracing,
    Transfer,
}

macro_rules! def_pass_instance {
    ($name:ident) => {
        #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
        pub struct $name(pub(crate) u32);

        impl $name {
            pub fn is_some(self) -> bool {
                self.0 != 0
            }
        }
    };
}

def_pass_instance!(ComputePassInstance);
def_pass_instance!(RenderPassInstance);
def_pass_instance!(RayTracingPassInstance);
def_pass_instance!(TransferPassInstance);
def_pass_instance!(EmptyPassInstance);

/// A pass recorded during a node's build step.
#[derive(Clone, Copy)]
pub(crate) struct PassData {
    pub kind: PassKind,
    pub compute_pipeline: Handle<ComputePipeline>,
    pub render_pipeline: Handle<RenderPipeline>,
    pub raytracing_pipeline: Handle<RayTracingPipeline>,
    pub texture_transition_range: (u32, u32),
    pub buffer_usage_range: (u32, u32),
    pub buffer_download_range: (u32, u32),
    pub buffer_barrier_range: (u32, u32),
}

impl Default for PassData {
    fn default() -> Self {
        Self {
            kind: PassKind::None,
            compute_pipeline: Handle::NONE,
            render_pipeline: Handle::NONE,
            raytracing_pipeline: Handle::NONE,
            texture_transition_range: (0, 0),
            buffer_usage_range: (0, 0),
            buffer_download_range: (0, 0),
            buffer_barrier_range: (0, 0),
        }
    }
}

pub(crate) struct NodeData {
    pub ptr: *mut u8,
    pub build: Option<BuildFn>,
    pub execute: Option<ExecuteFn>,
    pub init: Option<InitFn>,
    pub destruct: Option<unsafe fn(*mut u8)>,
    pub size: usize,
    pub align: usize,
    pub debug_name: &'static str,
    pub initialized: bool,
    pub subgraph: Handle<Subgraph>,
}

pub(crate) struct PinData {
    pub owned_storage: Handle<pin::Storage>,
    pub referenced_pin: Handle<pin::Storage>,
    /// Owning node vertex; boundary input/output pins have none.
    pub node_vertex: Handle<Vertex>,
    pub member_offset: u32,
    pub clear_sink: Option<SinkClearFn>,
}

pub struct Subgraph {
    pub(crate) vertices: Vec<Handle<Vertex>>,
    pub(crate) inputs: HashMap<String, Handle<Vertex>>,
    pub(crate) outputs: HashMap<String, Handle<Vertex>>,
    pub(crate) dynamic_storage: Vec<Handle<pin::Storage>>,
}

#[derive(Clone, Copy)]
pub(crate) struct TextureTransitionRec {
    pub storage: Handle<pin::Storage>,
    pub new_state: gpu::ImageState,
}

#[derive(Clone, Copy)]
pub(crate) struct BufferUsageRec {
    pub storage: Handle<pin::Storage>,
    pub stages: gpu::PipelineStages,
    pub access: gpu::MemoryAccess,
    pub access_kind: crate::resource::BufferAccessKind,
    pub uploaded_to: bool,
}

#[derive(Clone, Copy)]
pub(crate) struct BufferDownloadRec {
    pub storage: Handle<pin::Storage>,
    pub pending_id: u32,
}

#[derive(Clone, Copy)]
pub(crate) struct PendingUpload {
    pub storage: Handle<pin::Storage>,
    pub span: gpu::StagingBufferSpan,
}

#[derive(Clone, Copy)]
pub(crate) struct BindlessAcquire {
    pub resident: Handle<ResidentTexture>,
    pub texture: pin::Texture,
    pub state: gpu::ImageState,
}

pub struct MetricsEntry {
    pub type_id: TypeId,
    pub download: AsyncDownload,
}

#[derive(Default)]
pub struct Metrics {
    pub entries: Vec<MetricsEntry>,
}

/// Future side of [`FrameGraph::request_metrics`]; the next executed frame
/// fulfils it.
pub struct MetricsFuture {
    receiver: mpsc::Receiver<Metrics>,
}

impl MetricsFuture {
    pub fn try_get(&mut self) -> Option<Metrics> {
        self.receiver.try_recv().ok()
    }

    pub fn wait(self) -> Metrics {
        self.receiver.recv().unwrap_or_default()
    }
}

pub struct BuildArgs<'a> {
    pub device: &'a dyn Device,
    pub pass_manager: &'a mut PassManager,
    pub staging: &'a mut StagingBuffer,
    pub texture_registry: &'a mut TextureRegistry,
    pub config: ShaderCompilerConfig,
}

pub struct ExecuteArgs<'a> {
    pub device: &'a dyn Device,
    pub cmd: gpu::CommandBuffer,
    pub pass_manager: &'a mut PassManager,
    pub staging: &'a mut StagingBuffer,
    pub texture_registry: &'a mut TextureRegistry,
}

/// The frame graph runtime: subgraph instantiation, per-frame build and
/// execute phases, pin storage routing, transient pooling and readback.
pub struct FrameGraph {
    pub(crate) graph: Topology,
    pub(crate) nodes: HandlePool<NodeData>,
    pub(crate) pins: HandlePool<PinData>,
    pub(crate) pin_storage: HandlePool<PinStorage>,
    pub(crate) subgraphs: HandlePool<Subgraph>,

    pub(crate) sorted_nodes: Vec<Handle<Vertex>>,
    pub(crate) passes: Vec<PassData>,
    pub(crate) passes_per_node: Vec<(u32, u32)>,

    pub(crate) texture_transitions: Vec<TextureTransitionRec>,
    pub(crate) buffer_usages: Vec<BufferUsageRec>,
    pub(crate) buffer_downloads: Vec<BufferDownloadRec>,
    pub(crate) transient_buffers: Vec<(Handle<pin::Storage>, Handle<TransientBuffer>)>,
    pub(crate) transient_textures: Vec<(Handle<pin::Storage>, Handle<TransientTexture>)>,
    pub(crate) pending_uploads: Vec<PendingUpload>,
    pub(crate) pending_downloads: Vec<PendingDownload>,
    pub(crate) dynamic_pins: Vec<Handle<pin::Storage>>,
    pub(crate) reroute_stash: Vec<(Handle<pin::Storage>, PinStorage)>,
    pub(crate) retained_textures: HashSet<Handle<pin::Storage>>,
    pub(crate) pending_textures_to_free: Vec<FrameGraphTexture>,
    pub(crate) bindless_textures: Vec<BindlessAcquire>,
    pub(crate) empty_events: HashSet<TypeId>,

    pub(crate) pending_metrics: Vec<(TypeId, pin::Buffer)>,
    pub(crate) metrics_requests: Vec<mpsc::Sender<Metrics>>,
    pub(crate) pending_metrics_transfer: TransferPassInstance,

    pub(crate) resource_pool: ResourcePool,
    pub(crate) download_staging: DownloadStaging,
    pub(crate) arena: FrameAllocator,

    /// Last recorded stage/state of stable and retained images, consulted
    /// when tracking restarts next frame.
    pub(crate) persistent_image_states: HashMap<Handle<gpu::Image>, (gpu::PipelineStages, gpu::ImageState)>,

    pub(crate) frame_counter: u32,
    pub(crate) gpu_info: gpu::DeviceInfo,
    pub(crate) global_tlas: Handle<gpu::AccelerationStructure>,
}

impl FrameGraph {
    pub fn new(device: &dyn Device) -> anyhow::Result<Self> {
        Ok(Self {
            graph: Topology::default(),
            nodes: HandlePool::new(),
            pins: HandlePool::new(),
            pin_storage: HandlePool::new(),
            subgraphs: HandlePool::new(),
            sorted_nodes: Vec::new(),
            passes: Vec::new(),
            passes_per_node: Vec::new(),
            texture_transitions: Vec::new(),
            buffer_usages: Vec::new(),
            buffer_downloads: Vec::new(),
            transient_buffers: Vec::new(),
            transient_textures: Vec::new(),
            pending_uploads: Vec::new(),
            pending_downloads: Vec::new(),
            dynamic_pins: Vec::new(),
            reroute_stash: Vec::new(),
            retained_textures: HashSet::new(),
            pending_textures_to_free: Vec::new(),
            bindless_textures: Vec::new(),
            empty_events: HashSet::new(),
            pending_metrics: Vec::new(),
            metrics_requests: Vec::new(),
            pending_metrics_transfer: TransferPassInstance::default(),
            resource_pool: ResourcePool::new(),
            download_staging: DownloadStaging::new(device, DOWNLOAD_STAGING_SIZE)?,
            arena: FrameAllocator::with_capacity(FRAME_ARENA_SIZE),
            persistent_image_states: HashMap::new(),
            frame_counter: 0,
            gpu_info: device.get_device_info(),
            global_tlas: Handle::NONE,
        })
    }

    // -----------------------------------------------------------------------
    // Topology management

    pub fn instantiate(&mut self, template: &GraphTemplate) -> Handle<Subgraph> {
        let subgraph = self.subgraphs.insert(Subgraph {
            vertices: Vec::new(),
            inputs: HashMap::new(),
            outputs: HashMap::new(),
            dynamic_storage: Vec::new(),
        });

        let mut instance_vertices = Vec::with_capacity(template.vertices.len());

        for source in &template.vertices {
            let vertex = self.graph.add_vertex(Vertex::new(source.kind));

            if let Some(node_desc) = &source.node_desc {
                let node_ptr = alloc_erased(node_desc.type_desc.size, node_desc.type_desc.align);
                unsafe { (node_desc.type_desc.construct)(node_ptr) };

                for binding in &source.bindings {
                    binding(node_ptr);
                }

                let node = self.nodes.insert_tagged::<NodeTag>(NodeData {
                    ptr: node_ptr,
                    build: node_desc.build,
                    execute: node_desc.execute,
                    init: node_desc.init,
                    destruct: node_desc.type_desc.destruct,
                    size: node_desc.type_desc.size,
                    align: node_desc.type_desc.align,
                    debug_name: node_desc.debug_name,
                    initialized: false,
                    subgraph,
                });

                self.graph.get_mut(vertex).node = node;
            }

            instance_vertices.push(vertex);
        }

        // Pins are initialised second so owner nodes resolve.
        for (source, &vertex) in template.vertices.iter().zip(instance_vertices.iter()) {
            if source.kind != VertexKind::Pin {
                continue;
            }

            let node_vertex = source
                .owner_node
                .map(|id| instance_vertices[id.0 as usize])
                .unwrap_or(Handle::NONE);

            let storage = self.pin_storage.insert_tagged::<pin::Storage>(PinStorage {
                type_desc: source.pin_desc,
                ..Default::default()
            });

            let pin = self.pins.insert_tagged::<PinTag>(PinData {
                owned_storage: storage,
                referenced_pin: Handle::NONE,
                node_vertex,
                member_offset: source.pin_member_offset,
                clear_sink: source.clear_sink,
            });

            self.pin_storage.get_mut(storage).unwrap().owner = pin;
            self.graph.get_mut(vertex).pin = pin;

            // Storage is allocated lazily during build, unless constants are
            // bound into it at instantiation time.
            if !source.bindings.is_empty() {
                let data = alloc_erased(source.pin_desc.size, source.pin_desc.align);
                unsafe { (source.pin_desc.construct)(data) };
                for binding in &source.bindings {
                    binding(data);
                }
                self.pin_storage.get_mut(storage).unwrap().data = data;
            }
        }

        for (from, to) in &template.edges {
            self.graph.add_edge(
                instance_vertices[from.0 as usize],
                instance_vertices[to.0 as usize],
            );
        }

        let subgraph_data = self.subgraphs.get_mut(subgraph).unwrap();

        for input in &template.inputs {
            let vertex = instance_vertices[input.0 as usize];
            subgraph_data
                .inputs
                .insert(template.vertices[input.0 as usize].name.clone(), vertex);
        }

        for output in &template.outputs {
            let vertex = instance_vertices[output.0 as usize];
            subgraph_data
                .outputs
                .insert(template.vertices[output.0 as usize].name.clone(), vertex);
            self.graph.get_mut(vertex).state = VertexState::Enabled;
        }

        subgraph_data.vertices = instance_vertices;

        subgraph
    }

    /// Detaches the subgraph's vertices and their edges, destructs pin
    /// storages and defers any owned retained textures for GPU-safe
    /// deletion.
    pub fn remove(&mut self, subgraph: Handle<Subgraph>) {
        let data = match self.subgraphs.remove(subgraph) {
            Some(data) => data,
            None => return,
        };

        for storage in data.dynamic_storage {
            if let Some(entry) = self.pin_storage.remove(storage) {
                self.free_pin_storage(storage, &entry, false);
            }
        }

        for vertex in data.vertices {
            let (kind, node, pin) = {
                let v = self.graph.get(vertex);
                (v.kind, v.node, v.pin)
            };

            match kind {
                VertexKind::Node => {
                    if let Some(node_data) = self.nodes.remove(node) {
                        if !node_data.ptr.is_null() {
                            if let Some(destruct) = node_data.destruct {
                                unsafe { destruct(node_data.ptr) };
                            }
                            free_erased(node_data.ptr, node_data.size, node_data.align);
                        }
                    }
                }
                VertexKind::Pin => {
                    if let Some(pin_data) = self.pins.remove(pin) {
                        if let Some(storage) = self.pin_storage.remove(pin_data.owned_storage) {
                            self.free_pin_storage(pin_data.owned_storage, &storage, false);
                        }
                    }
                }
            }

            self.graph.remove_vertex(vertex);
        }
    }

    fn free_pin_storage(&mut self, key: Handle<pin::Storage>, storage: &PinStorage, frame_allocated: bool) {
        if storage.data.is_null() {
            return;
        }

        if storage.is_owned_texture {
            let texture = unsafe { &*(storage.data as *const FrameGraphTexture) };
            self.pending_textures_to_free.push(texture.clone());
            self.retained_textures.remove(&key);
        }

        if let Some(destruct) = storage.type_desc.destruct {
            unsafe { destruct(storage.data) };
        }

        debug_assert_eq!(frame_allocated, self.arena.contains(storage.data));

        if !frame_allocated {
            free_erased(storage.data, storage.type_desc.size, storage.type_desc.align);
        }
    }

    fn free_pending_textures(&mut self, device: &dyn Device) {
        for texture in self.pending_textures_to_free.drain(..) {
            if texture.handle.is_some() {
                device.destroy_deferred(gpu::GpuObject::Image(texture.handle), device.get_submit_index());
                self.persistent_image_states.remove(&texture.handle);
            }
        }
    }

    /// Connects `src_graph`'s named output to `dst_graph`'s named input,
    /// also ordering the owner nodes.
    pub fn connect(
        &mut self,
        src_graph: Handle<Subgraph>,
        src_name: &str,
        dst_graph: Handle<Subgraph>,
        dst_name: &str,
    ) -> bool {
        let src_vertex = match self.subgraphs.get(src_graph).and_then(|g| g.outputs.get(src_name)) {
            Some(v) => *v,
            None => return false,
        };
        let dst_vertex = match self.subgraphs.get(dst_graph).and_then(|g| g.inputs.get(dst_name)) {
            Some(v) => *v,
            None => return false,
        };

        let src_pin = self.graph.get(src_vertex).pin;
        let dst_pin = self.graph.get(dst_vertex).pin;
        debug_assert!(src_pin.is_some() && dst_pin.is_some());

        self.graph.add_edge(src_vertex, dst_vertex);

        // Order the producing and consuming nodes as well. Boundary pins are
        // bare, the nodes hang off them through ordering edges added at
        // template build time.
        let mut producer = Handle::NONE;
        for &vertex in self.graph.in_edges(src_vertex) {
            if self.graph.get(vertex).kind == VertexKind::Node {
                producer = vertex;
                break;
            }
        }

        let consumers: Vec<Handle<Vertex>> = self
            .graph
            .out_edges(dst_vertex)
            .iter()
            .copied()
            .filter(|&vertex| self.graph.get(vertex).kind == VertexKind::Node)
            .collect();

        if producer.is_some() {
            for consumer in consumers {
                if !self.graph.has_edge(producer, consumer) {
                    self.graph.add_edge(producer, consumer);
                }
            }
        }

        true
    }

    pub fn disable_all_outputs(&mut self, subgraph: Handle<Subgraph>) {
        let outputs: Vec<Handle<Vertex>> = match self.subgraphs.get(subgraph) {
            Some(g) => g.outputs.values().copied().collect(),
            None => return,
        };

        for vertex in outputs {
            self.graph.get_mut(vertex).state = VertexState::Disabled;
        }
    }

    pub fn set_output_state(&mut self, subgraph: Handle<Subgraph>, name: &str, enable: bool) {
        let vertex = match self.subgraphs.get(subgraph).and_then(|g| g.outputs.get(name)) {
            Some(v) => *v,
            None => {
                debug_assert!(false, "unknown output {}", name);
                return;
            }
        };

        self.graph.get_mut(vertex).state = if enable {
            VertexState::Enabled
        } else {
            VertexState::Disabled
        };
    }

    fn boundary_storage(&mut self, vertex: Handle<Vertex>, follow_reference: bool, type_id: TypeId) -> Option<*mut u8> {
        let pin = self.graph.try_get(vertex)?.pin;
        let pin_data = self.pins.get(pin)?;

        let mut storage_key = pin_data.owned_storage;
        if follow_reference && pin_data.referenced_pin.is_some() {
            storage_key = pin_data.referenced_pin;
        }

        let storage = self.pin_storage.get_mut(storage_key)?;

        if storage.type_desc.type_id != type_id {
            return None;
        }

        if storage.data.is_null() {
            let data = alloc_erased(storage.type_desc.size, storage.type_desc.align);
            unsafe { (storage.type_desc.construct)(data) };
            storage.data = data;
        }

        Some(storage.data)
    }

    /// Type-checked access to a subgraph's named input; returns `None` on a
    /// type mismatch.
    pub fn try_get_input<T: 'static>(&mut self, subgraph: Handle<Subgraph>, name: &str) -> Option<&mut T> {
        let vertex = *self.subgraphs.get(subgraph)?.inputs.get(name)?;
        let data = self.boundary_storage(vertex, false, TypeId::of::<T>())?;
        Some(unsafe { &mut *(data as *mut T) })
    }

    pub fn try_get_output<T: 'static>(&mut self, subgraph: Handle<Subgraph>, name: &str) -> Option<&mut T> {
        let vertex = *self.subgraphs.get(subgraph)?.outputs.get(name)?;
        let data = self.boundary_storage(vertex, true, TypeId::of::<T>())?;
        Some(unsafe { &mut *(data as *mut T) })
    }

    pub fn fetch_subgraphs(&self) -> Vec<Handle<Subgraph>> {
        self.subgraphs.keys()
    }

    pub fn fetch_outputs(&self, subgraph: Handle<Subgraph>) -> Vec<(String, TypeId)> {
        let mut outputs = Vec::new();

        if let Some(g) = self.subgraphs.get(subgraph) {
            for (name, vertex) in &g.outputs {
                let pin = self.graph.get(*vertex).pin;
                if let Some(pin_data) = self.pins.get(pin) {
                    if let Some(storage) = self.pin_storage.get(pin_data.owned_storage) {
                        outputs.push((name.clone(), storage.type_desc.type_id));
                    }
                }
            }
        }

        outputs
    }

    pub fn push_empty_event<T: 'static>(&mut self) {
        self.empty_events.insert(TypeId::of::<T>());
    }

    pub fn has_event<T: 'static>(&self) -> bool {
        self.empty_events.contains(&TypeId::of::<T>())
    }

    /// Arms metrics recording; the next executed frame fulfils the future.
    pub fn request_metrics(&mut self) -> MetricsFuture {
        let (sender, receiver) = mpsc::channel();
        self.metrics_requests.push(sender);
        MetricsFuture { receiver }
    }

    pub fn is_recording_metrics(&self) -> bool {
        !self.metrics_requests.is_empty()
    }

    pub fn frame_counter(&self) -> u32 {
        self.frame_counter
    }

    pub fn resource_pool(&self) -> &ResourcePool {
        &self.resource_pool
    }

    pub fn vertex_count(&self) -> usize {
        self.graph.vertex_count()
    }

    // -----------------------------------------------------------------------
    // Build phase

    fn mark_active_nodes(&mut self) {
        for vertex in self.graph.vertices() {
            let v = self.graph.get_mut(vertex);
            if v.node.is_some() {
                v.state = VertexState::Unvisited;
            }
        }

        let mut nodes_to_enable: Vec<Handle<Vertex>> = Vec::with_capacity(self.graph.vertex_count());

        for subgraph in self.subgraphs.values() {
            for output in subgraph.outputs.values() {
                let v = self.graph.get(*output);
                debug_assert!(v.pin.is_some() && v.node.is_none());

                if v.state == VertexState::Disabled {
                    continue;
                }

                nodes_to_enable.extend_from_slice(self.graph.in_edges(*output));
            }
        }

        while let Some(vertex) = nodes_to_enable.pop() {
            let v = self.graph.get_mut(vertex);

            if v.kind != VertexKind::Node || v.state != VertexState::Unvisited {
                continue;
            }

            v.state = VertexState::Enabled;
            nodes_to_enable.extend_from_slice(self.graph.in_edges(vertex));
        }
    }

    fn rebuild_runtime(&mut self, args: &mut BuildArgs<'_>) -> anyhow::Result<()> {
        self.sorted_nodes.clear();

        let mut sorted_vertices = Vec::with_capacity(self.graph.vertex_count());
        let is_dag = self.graph.visit_topological(|v| sorted_vertices.push(v));

        if !is_dag {
            bail!("frame graph contains a cycle");
        }

        let mut sorted_pins = Vec::with_capacity(self.pins.len());

        for vertex in sorted_vertices {
            let (kind, state, node) = {
                let v = self.graph.get(vertex);
                (v.kind, v.state, v.node)
            };

            match kind {
                VertexKind::Pin => sorted_pins.push(vertex),
                VertexKind::Node => {
                    // Cull disabled nodes and unvisited ones, which do not
                    // contribute to any output.
                    if state != VertexState::Enabled {
                        continue;
                    }

                    self.sorted_nodes.push(vertex);

                    let needs_init = {
                        let data = self.nodes.get(node).unwrap();
                        data.init.is_some() && !data.initialized
                    };

                    if needs_init {
                        let (ptr, init) = {
                            let data = self.nodes.get(node).unwrap();
                            (data.ptr, data.init.unwrap())
                        };

                        let mut ctx = InitContext {
                            device: args.device,
                            pass_manager: &mut *args.pass_manager,
                            gpu_info: self.gpu_info,
                        };
                        unsafe { init(ptr, &mut ctx) };

                        self.nodes.get_mut(node).unwrap().initialized = true;
                    }
                }
            }
        }

        for (_, pin) in self.pins.iter_mut() {
            pin.referenced_pin = Handle::NONE;
        }
        for (_, storage) in self.pin_storage.iter_mut() {
            storage.has_path_to_output = false;
        }

        // Regular pins propagate in node execution order, sinks in reverse.
        self.propagate_pins(&sorted_pins, false);
        let reversed: Vec<_> = sorted_pins.iter().copied().rev().collect();
        self.propagate_pins(&reversed, true);

        Ok(())
    }

    fn propagate_pins(&mut self, pins: &[Handle<Vertex>], process_sinks: bool) {
        for &vertex in pins {
            let pin_handle = self.graph.get(vertex).pin;
            debug_assert!(pin_handle.is_some());

            let (is_sink, owned_storage, node_vertex, member_offset, clear_sink) = {
                let pin = self.pins.get(pin_handle).unwrap();
                (
                    pin.clear_sink.is_some(),
                    pin.owned_storage,
                    pin.node_vertex,
                    pin.member_offset,
                    pin.clear_sink,
                )
            };

            if is_sink != process_sinks {
                continue;
            }

            // Inherit the producer's storage through the first inbound pin
            // edge (outbound for sinks, which accumulate backwards).
            let mut referenced = Handle::NONE;

            let edges = if process_sinks {
                self.graph.out_edges(vertex)
            } else {
                self.graph.in_edges(vertex)
            };

            for &other in edges {
                let other_vertex = self.graph.get(other);
                if other_vertex.kind == VertexKind::Pin && other_vertex.pin.is_some() {
                    referenced = self.pins.get(other_vertex.pin).unwrap().referenced_pin;
                    break;
                }
            }

            // A pin is an active output when it feeds an enabled boundary
            // output; nodes use this to cull work.
            let mut has_path_to_output = false;
            for &out in self.graph.out_edges(vertex) {
                let out_vertex = self.graph.get(out);
                // Ordering edges towards nodes do not count as outputs.
                if out_vertex.kind == VertexKind::Pin && out_vertex.state == VertexState::Enabled {
                    has_path_to_output = true;
                    break;
                }
            }

            let has_incoming_reference = referenced.is_some();

            if !has_incoming_reference {
                let storage = self.pin_storage.get_mut(owned_storage).unwrap();
                storage.has_path_to_output = has_path_to_output;

                if storage.data.is_null() {
                    let data = alloc_erased(storage.type_desc.size, storage.type_desc.align);
                    unsafe { (storage.type_desc.construct)(data) };
                    storage.data = data;
                }

                referenced = owned_storage;

                if let Some(clear) = clear_sink {
                    unsafe { clear(storage.data) };
                }
            } else if has_path_to_output {
                if let Some(storage) = self.pin_storage.get_mut(owned_storage) {
                    storage.has_path_to_output = true;
                }
            }

            self.pins.get_mut(pin_handle).unwrap().referenced_pin = referenced;

            // Write the resolved storage handle into the node's pin field.
            if node_vertex.is_some() {
                let node = self.graph.get(node_vertex).node;
                let node_ptr = self.nodes.get(node).unwrap().ptr;
                unsafe {
                    std::ptr::write_unaligned(
                        node_ptr.add(member_offset as usize) as *mut u32,
                        referenced.raw(),
                    );
                }
            }
        }
    }

    pub fn build(&mut self, mut args: BuildArgs<'_>) -> anyhow::Result<()> {
        // Free retained textures whose owning subgraphs were removed.
        self.free_pending_textures(args.device);

        self.arena.restore_all();

        args.pass_manager
            .begin_frame(args.device, &args.config, args.texture_registry);

        self.mark_active_nodes();
        self.rebuild_runtime(&mut args)?;

        self.passes.clear();
        self.passes.push(PassData::default()); // index 0 is invalid
        self.passes_per_node.clear();
        self.texture_transitions.clear();
        self.buffer_usages.clear();
        self.buffer_downloads.clear();
        self.transient_buffers.clear();
        self.transient_textures.clear();
        self.pending_uploads.clear();
        self.bindless_textures.clear();
        self.pending_metrics.clear();
        self.pending_metrics_transfer = TransferPassInstance::default();

        // Required because nodes may query created textures during build.
        for (_, storage) in self.pin_storage.iter_mut() {
            storage.transient_buffer = Handle::NONE;
            storage.transient_texture = Handle::NONE;
        }

        self.resource_pool.begin_build();

        // Recreate the transient entries for the retained textures.
        let retained: Vec<Handle<pin::Storage>> = self.retained_textures.iter().copied().collect();
        for storage_key in retained {
            let (texture, desc) = {
                let storage = self.pin_storage.get(storage_key).unwrap();
                debug_assert!(storage.is_owned_texture);
                let t = unsafe { &*(storage.data as *const FrameGraphTexture) };
                (t.handle, t.descriptor.clone())
            };

            let transient = self.resource_pool.add_external_texture(texture, &desc);
            self.pin_storage.get_mut(storage_key).unwrap().transient_texture = transient;
            self.transient_textures.push((storage_key, transient));
        }

        let work: Vec<(Handle<Vertex>, *mut u8, Option<BuildFn>)> = self
            .sorted_nodes
            .iter()
            .map(|&vertex| {
                let node = self.graph.get(vertex).node;
                let data = self.nodes.get(node).unwrap();
                (vertex, data.ptr, data.build)
            })
            .collect();

        let recording_metrics = !self.metrics_requests.is_empty();
        let mut metrics_transfer = TransferPassInstance::default();

        {
            let mut ctx = BuildContext {
                device: args.device,
                pass_manager: &mut *args.pass_manager,
                staging: &mut *args.staging,
                texture_registry: &mut *args.texture_registry,
                graph: &self.graph,
                nodes: &self.nodes,
                pins: &self.pins,
                pin_storage: &mut self.pin_storage,
                subgraphs: &mut self.subgraphs,
                passes: &mut self.passes,
                passes_per_node: &mut self.passes_per_node,
                texture_transitions: &mut self.texture_transitions,
                buffer_usages: &mut self.buffer_usages,
                buffer_downloads: &mut self.buffer_downloads,
                transient_buffers: &mut self.transient_buffers,
                transient_textures: &mut self.transient_textures,
                pending_uploads: &mut self.pending_uploads,
                resource_pool: &mut self.resource_pool,
                reroute_stash: &mut self.reroute_stash,
                dynamic_pins: &mut self.dynamic_pins,
                retained_textures: &mut self.retained_textures,
                bindless_textures: &mut self.bindless_textures,
                pending_metrics: &mut self.pending_metrics,
                empty_events: &self.empty_events,
                arena: &self.arena,
                global_tlas: &mut self.global_tlas,
                gpu_info: self.gpu_info,
                frame_counter: self.frame_counter,
                recording_metrics,
                current_node: Handle::NONE,
                current_pass: 0,
            };

            for (vertex, ptr, build) in work {
                ctx.current_node = vertex;
                ctx.current_pass = 0;

                let pass_cursor = ctx.passes.len() as u32;
                ctx.passes_per_node.push((pass_cursor, pass_cursor));

                if let Some(build) = build {
                    unsafe { build(ptr, &mut ctx) };
                    ctx.end_pass_build();
                }
            }

            ctx.current_node = Handle::NONE;

            // Hidden pass downloading the registered metrics buffers.
            if recording_metrics && !ctx.pending_metrics.is_empty() {
                let pass_cursor = ctx.passes.len() as u32;
                ctx.passes_per_node.push((pass_cursor, pass_cursor));
                ctx.current_pass = 0;

                metrics_transfer = ctx.transfer_pass();

                let pending: Vec<(TypeId, pin::Buffer)> = ctx.pending_metrics.clone();
                for (_, buffer) in pending {
                    ctx.acquire_buffer(buffer, crate::resource::BufferAccess::Download);
                }

                ctx.end_pass_build();
            }
        }

        self.pending_metrics_transfer = metrics_transfer;

        self.resource_pool.end_build(args.device);

        // Feed acquired bindless textures into the registry now that the
        // pool has resolved the actual images.
        for acquire in &self.bindless_textures {
            let transient = self
                .pin_storage
                .get(acquire.texture.storage())
                .map(|s| s.transient_texture)
                .unwrap_or(Handle::NONE);

            if transient.is_some() {
                let texture = self.resource_pool.get_transient_texture(transient);
                args.texture_registry
                    .set_external_texture(acquire.resident, texture.handle, acquire.state);
            }
        }

        Ok(())
    }

    // -----------------------------------------------------------------------
    // Execute phase

    pub fn execute(&mut self, mut args: ExecuteArgs<'_>) {
        let device = args.device;
        let cmd = args.cmd;

        self.download_staging.begin_frame(device.get_submit_index());

        // Resolve every transient buffer pin storage to its concrete range.
        for &(storage_key, pool_index) in &self.transient_buffers {
            let buffer = self.resource_pool.get_transient_buffer(pool_index);
            let storage = self.pin_storage.get_mut(storage_key).unwrap();

            if storage.data.is_null() {
                // Dynamic pins get frame-allocator backing on demand.
                storage.data = self.arena.allocate(
                    std::mem::size_of::<crate::resource::FrameGraphBuffer>(),
                    std::mem::align_of::<crate::resource::FrameGraphBuffer>(),
                );
            }

            unsafe {
                std::ptr::write(storage.data as *mut crate::resource::FrameGraphBuffer, buffer);
            }
        }

        if !self.pending_uploads.is_empty() {
            self.flush_uploads(device, cmd, args.staging);
        }

        // Prepare the download staging for every declared download.
        for download in &mut self.buffer_downloads {
            download.pending_id = self.pending_downloads.len() as u32;

            let size = {
                let storage = self.pin_storage.get(download.storage).unwrap();
                unsafe { (*(storage.data as *const crate::resource::FrameGraphBuffer)).size }
            };

            match self.download_staging.stage_allocate(size) {
                Ok(span) => {
                    self.pending_downloads
                        .push(PendingDownload::new(device.get_submit_index(), span));
                }
                Err(err) => {
                    log::error!("allocation of download buffer failed: {:#}", err);
                    self.pending_downloads.push(PendingDownload::new(
                        device.get_submit_index(),
                        gpu::StagingBufferSpan::default(),
                    ));
                }
            }
        }

        let mut image_tracker = ImageStateTracker::default();

        for &(storage_key, pool_index) in &self.transient_textures {
            let texture = self.resource_pool.get_transient_texture(pool_index);

            let (initial_stages, initial_state) = self
                .persistent_image_states
                .get(&texture.handle)
                .copied()
                .unwrap_or((gpu::PipelineStages::TOP_OF_PIPE, gpu::ImageState::Undefined));

            image_tracker.add_tracking(texture.handle, initial_stages, initial_state);

            let storage = self.pin_storage.get_mut(storage_key).unwrap();

            // Owned textures already hold their value; actual transients are
            // recreated every frame.
            if !storage.is_owned_texture {
                if storage.data.is_null() {
                    storage.data = self.arena.allocate(
                        std::mem::size_of::<FrameGraphTexture>(),
                        std::mem::align_of::<FrameGraphTexture>(),
                    );
                }
                unsafe {
                    std::ptr::write(storage.data as *mut FrameGraphTexture, texture);
                }
            }
        }

        let buffer_barriers = crate::barriers::build_pass_barriers(
            &mut self.passes,
            &self.buffer_usages,
            &self.pin_storage,
            &mut self.resource_pool,
        );

        let node_work: Vec<(Handle<Vertex>, *mut u8, Option<ExecuteFn>, (u32, u32))> = self
            .sorted_nodes
            .iter()
            .zip(self.passes_per_node.iter())
            .map(|(&vertex, &pass_range)| {
                let node = self.graph.get(vertex).node;
                let data = self.nodes.get(node).unwrap();
                (vertex, data.ptr, data.execute, pass_range)
            })
            .collect();

        let recording_metrics = !self.metrics_requests.is_empty();

        {
            let mut ctx = ExecuteContext {
                device,
                cmd,
                pass_manager: &*args.pass_manager,
                staging: &mut *args.staging,
                graph: &self.graph,
                nodes: &self.nodes,
                pins: &self.pins,
                pin_storage: &self.pin_storage,
                passes: &self.passes,
                buffer_usages: &self.buffer_usages,
                buffer_downloads: &self.buffer_downloads,
                texture_transitions: &self.texture_transitions,
                pending_downloads: &mut self.pending_downloads,
                download_staging: &self.download_staging,
                image_tracker: &mut image_tracker,
                buffer_barriers: &buffer_barriers,
                resource_pool: &self.resource_pool,
                empty_events: &self.empty_events,
                global_tlas: self.global_tlas,
                gpu_info: self.gpu_info,
                frame_counter: self.frame_counter,
                recording_metrics,
                current_node: Handle::NONE,
                current_pass: 0,
                pass_kind: PassKind::None,
                compute_ctx: None,
                render_ctx: None,
                rt_ctx: None,
            };

            for (vertex, ptr, execute, pass_range) in node_work {
                ctx.current_node = vertex;
                ctx.current_pass = 0;
                ctx.pass_kind = PassKind::None;

                if pass_range.0 < pass_range.1 {
                    // The first pass opens automatically.
                    ctx.begin_pass_execution(pass_range.0);
                }

                if let Some(execute) = execute {
                    unsafe { execute(ptr, &mut ctx) };
                    ctx.end_pass();
                }

                // Every pass the node declared must have been opened in
                // order.
                debug_assert!(
                    pass_range.0 == pass_range.1 || ctx.current_pass == pass_range.1 - 1,
                    "node skipped passes it declared during build"
                );
            }

            // Hidden passes at the tail (metrics download) run even when the
            // node list is empty.
            if recording_metrics {
                let mut metrics = Metrics::default();

                if self.pending_metrics_transfer.is_some() {
                    ctx.current_node = Handle::NONE;
                    ctx.current_pass = 0;
                    if ctx.begin_transfer_pass(self.pending_metrics_transfer).is_ok() {
                        for (type_id, buffer) in &self.pending_metrics {
                            metrics.entries.push(MetricsEntry {
                                type_id: *type_id,
                                download: ctx.download(*buffer),
                            });
                        }
                        ctx.end_pass();
                    }
                }

                let mut requests = std::mem::take(&mut self.metrics_requests);
                if let Some(first) = requests.drain(..).next() {
                    let _ = first.send(metrics);
                }
                // Additional same-frame requests resolve to empty metrics.

                self.pending_metrics.clear();
                self.pending_metrics_transfer = TransferPassInstance::default();
            }
        }

        // Persist final image states for stable and retained textures so the
        // next frame's first barrier is correct.
        for &(storage_key, pool_index) in &self.transient_textures {
            let storage = self.pin_storage.get(storage_key).unwrap();
            let stable = pool_index.is_some() && self.resource_pool.is_stable_texture(pool_index);

            if storage.is_owned_texture || stable {
                let texture = self.resource_pool.get_transient_texture(pool_index);
                if let Some(state) = image_tracker
                    .final_states()
                    .find(|(image, _, _)| *image == texture.handle)
                {
                    self.persistent_image_states.insert(state.0, (state.1, state.2));
                }
            }
        }

        for acquire in &self.bindless_textures {
            args.texture_registry.remove(acquire.resident);
        }
        self.bindless_textures.clear();

        self.download_staging.end_frame();
        self.poll_downloads(device);
        self.finish_frame();
    }

    fn flush_uploads(&mut self, device: &dyn Device, cmd: gpu::CommandBuffer, staging: &mut StagingBuffer) {
        debug_assert!(!self.pending_uploads.is_empty());

        device.cmd_apply_barriers(
            cmd,
            &gpu::Barriers {
                memory: &[gpu::GlobalBarrier {
                    previous_pipelines: gpu::PipelineStages::ALL_COMMANDS,
                    previous_accesses: gpu::MemoryAccess::ANY_READ,
                    next_pipelines: gpu::PipelineStages::TRANSFER,
                    next_accesses: gpu::MemoryAccess::ANY_WRITE,
                }],
                ..Default::default()
            },
        );

        for upload in self.pending_uploads.drain(..) {
            let storage = self.pin_storage.get(upload.storage).unwrap();
            let buffer = unsafe { &*(storage.data as *const crate::resource::FrameGraphBuffer) };
            staging.upload(device, cmd, &upload.span, buffer.handle, buffer.offset);
        }

        device.cmd_apply_barriers(
            cmd,
            &gpu::Barriers {
                memory: &[gpu::GlobalBarrier {
                    previous_pipelines: gpu::PipelineStages::TRANSFER,
                    previous_accesses: gpu::MemoryAccess::ANY_WRITE,
                    next_pipelines: gpu::PipelineStages::ALL_COMMANDS,
                    next_accesses: gpu::MemoryAccess::ANY_READ,
                }],
                ..Default::default()
            },
        );
    }

    /// Reaps completed downloads: copies bytes out of the staging ring and
    /// fulfils the associated futures. Downloads whose submit has not
    /// finished stay pending.
    pub fn poll_downloads(&mut self, device: &dyn Device) {
        let last_finished = device.get_last_finished_submit();

        self.download_staging.notify_finished_frames(last_finished);

        let mut completed = 0;
        let mut first_download = true;

        for pending in &self.pending_downloads {
            if pending.submit_index > last_finished {
                break;
            }

            if first_download {
                if let Err(err) = self.download_staging.invalidate_memory_ranges(device) {
                    log::error!("invalidating download memory failed: {:#}", err);
                }
                first_download = false;
            }

            let total_size = pending.span.total_size();
            let mut destination = vec![0u8; total_size as usize];

            if let Err(err) = self
                .download_staging
                .copy_from(device, &mut destination, &pending.span, 0)
            {
                log::error!("download readback failed: {:#}", err);
                destination.clear();
            }

            // The receiver may be gone; nothing to do then.
            let _ = pending.sender.send(destination);
            completed += 1;
        }

        if completed > 0 {
            self.pending_downloads.drain(..completed);
        }
    }

    fn finish_frame(&mut self) {
        // Re-establish stashed reroutes, in reverse in case of chains.
        while let Some((handle, value)) = self.reroute_stash.pop() {
            *self.pin_storage.get_mut(handle).unwrap() = value;
        }

        let dynamic_pins = std::mem::take(&mut self.dynamic_pins);
        for handle in dynamic_pins {
            if let Some(storage) = self.pin_storage.remove(handle) {
                // Dynamic pin data comes from the frame arena and needs no
                // explicit free.
                self.free_pin_storage(handle, &storage, true);
            }
        }

        self.texture_transitions.clear();
        self.transient_textures.clear();
        self.transient_buffers.clear();
        self.buffer_downloads.clear();
        self.empty_events.clear();

        self.frame_counter += 1;
        self.global_tlas = Handle::NONE;
    }

    pub fn write_dot(&self, out: &mut dyn std::io::Write) -> std::io::Result<()> {
        writeln!(out, "digraph frame_graph {{")?;

        for vertex in self.graph.vertices() {
            let v = self.graph.get(vertex);
            match v.kind {
                VertexKind::Node => {
                    let name = self.nodes.get(v.node).map(|n| n.debug_name).unwrap_or("?");
                    let color = if v.state == VertexState::Enabled { "green" } else { "red" };
                    writeln!(
                        out,
                        "  v{} [label=\"{}\" shape=\"rect\" color=\"{}\"];",
                        vertex.raw(),
                        name,
                        color
                    )?;
                }
                VertexKind::Pin => {
                    writeln!(out, "  v{} [shape=\"diamond\"];", vertex.raw())?;
                }
            }
        }

        for vertex in self.graph.vertices() {
            for &to in self.graph.out_edges(vertex) {
                writeln!(out, "  v{} -> v{};", vertex.raw(), to.raw())?;
            }
        }

        writeln!(out, "}}")
    }

    pub fn shutdown(&mut self, device: &dyn Device) {
        let node_keys = self.nodes.keys();
        for key in node_keys {
            if let Some(node) = self.nodes.remove(key) {
                if !node.ptr.is_null() {
                    if let Some(destruct) = node.destruct {
                        unsafe { destruct(node.ptr) };
                    }
                    free_erased(node.ptr, node.size, node.align);
                }
            }
        }

        let storage_keys = self.pin_storage.keys();
        for key in storage_keys {
            if let Some(storage) = self.pin_storage.remove(key) {
                let frame_allocated = self.arena.contains(storage.data);
                self.free_pin_storage(key.cast(), &storage, frame_allocated);
            }
        }

        self.free_pending_textures(device);
        self.resource_pool.shutdown(device);
    }
}
