use crate::context::{BuildContext, ExecuteContext, InitContext};
use crate::resource::DataTypeDesc;
use crate::topology::VertexKind;
use std::rc::Rc;

pub type BuildFn = unsafe fn(*mut u8, &mut BuildContext<'_>);
pub type ExecuteFn = unsafe fn(*mut u8, &mut ExecuteContext<'_>);
pub type InitFn = unsafe fn(*mut u8, &mut InitContext<'_>);
pub type SinkClearFn = unsafe fn(*mut u8);
pub type BindingFn = Rc<dyn Fn(*mut u8)>;

/// A frame-graph node: a POD payload driven by build/execute/init callbacks.
/// Pins are plain fields of the payload; the runtime writes resolved pin
/// storage handles into them at the offsets the template records.
pub trait GraphNode: Default + 'static {
    fn build(&mut self, _ctx: &mut BuildContext<'_>) {}
    fn execute(&mut self, _ctx: &mut ExecuteContext<'_>) {}
    fn init(&mut self, _ctx: &mut InitContext<'_>) {}
    const HAS_BUILD: bool = true;
    const HAS_EXECUTE: bool = true;
    const HAS_INIT: bool = false;
}

unsafe fn build_trampoline<T: GraphNode>(ptr: *mut u8, ctx: &mut BuildContext<'_>) {
    (*(ptr as *mut T)).build(ctx)
}

unsafe fn execute_trampoline<T: GraphNode>(ptr: *mut u8, ctx: &mut ExecuteContext<'_>) {
    (*(ptr as *mut T)).execute(ctx)
}

unsafe fn init_trampoline<T: GraphNode>(ptr: *mut u8, ctx: &mut InitContext<'_>) {
    (*(ptr as *mut T)).init(ctx)
}

/// Clears a sink accumulator in place. Registered per sink pin.
pub unsafe fn clear_vec_sink<T>(ptr: *mut u8) {
    (*(ptr as *mut Vec<T>)).clear()
}

#[derive(Clone)]
pub struct NodeDesc {
    pub type_desc: DataTypeDesc,
    pub build: Option<BuildFn>,
    pub execute: Option<ExecuteFn>,
    pub init: Option<InitFn>,
    pub debug_name: &'static str,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TemplateVertexId(pub(crate) u32);

pub(crate) struct TemplateVertex {
    pub kind: VertexKind,
    pub node_desc: Option<NodeDesc>,
    /// Owning node vertex; boundary input/output pins have none.
    pub owner_node: Option<TemplateVertexId>,
    pub pin_desc: DataTypeDesc,
    pub pin_member_offset: u32,
    pub clear_sink: Option<SinkClearFn>,
    pub bindings: Vec<BindingFn>,
    pub name: String,
}

/// Static description of a subgraph: nodes, pins, edges, named boundary
/// inputs and outputs. Instantiated into a frame graph any number of times.
pub struct GraphTemplate {
    pub(crate) vertices: Vec<TemplateVertex>,
    pub(crate) edges: Vec<(TemplateVertexId, TemplateVertexId)>,
    pub(crate) inputs: Vec<TemplateVertexId>,
    pub(crate) outputs: Vec<TemplateVertexId>,
}

pub struct GraphTemplateBuilder {
    template: GraphTemplate,
}

impl Default for GraphTemplateBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphTemplateBuilder {
    pub fn new() -> Self {
        Self {
            template: GraphTemplate {
                vertices: Vec::new(),
                edges: Vec::new(),
                inputs: Vec::new(),
                outputs: Vec::new(),
            },
        }
    }

    fn push_vertex(&mut self, vertex: TemplateVertex) -> TemplateVertexId {
        let id = TemplateVertexId(self.template.vertices.len() as u32);
        self.template.vertices.push(vertex);
        id
    }

    pub fn add_node<T: GraphNode>(&mut self, debug_name: &'static str) -> TemplateVertexId {
        self.push_vertex(TemplateVertex {
            kind: VertexKind::Node,
            node_desc: Some(NodeDesc {
                type_desc: DataTypeDesc::of::<T>(),
                build: if T::HAS_BUILD {
                    Some(build_trampoline::<T>)
                } else {
                    None
                },
                execute: if T::HAS_EXECUTE {
                    Some(execute_trampoline::<T>)
                } else {
                    None
                },
                init: if T::HAS_INIT {
                    Some(init_trampoline::<T>)
                } else {
                    None
                },
                debug_name,
            }),
            owner_node: None,
            pin_desc: DataTypeDesc::default(),
            pin_member_offset: 0,
            clear_sink: None,
            bindings: Vec::new(),
            name: String::new(),
        })
    }

    fn add_pin(
        &mut self,
        node: TemplateVertexId,
        member_offset: usize,
        pin_desc: DataTypeDesc,
        clear_sink: Option<SinkClearFn>,
    ) -> TemplateVertexId {
        debug_assert!(matches!(
            self.template.vertices[node.0 as usize].kind,
            VertexKind::Node
        ));

        self.push_vertex(TemplateVertex {
            kind: VertexKind::Pin,
            node_desc: None,
            owner_node: Some(node),
            pin_desc,
            pin_member_offset: member_offset as u32,
            clear_sink,
            bindings: Vec::new(),
            name: String::new(),
        })
    }

    /// Declares a buffer pin at byte offset `member_offset` of the node
    /// payload (a `pin::Buffer` field, use `std::mem::offset_of!`).
    pub fn add_buffer_pin(&mut self, node: TemplateVertexId, member_offset: usize) -> TemplateVertexId {
        self.add_pin(
            node,
            member_offset,
            DataTypeDesc::of::<crate::resource::FrameGraphBuffer>(),
            None,
        )
    }

    pub fn add_texture_pin(&mut self, node: TemplateVertexId, member_offset: usize) -> TemplateVertexId {
        self.add_pin(
            node,
            member_offset,
            DataTypeDesc::of::<crate::resource::FrameGraphTexture>(),
            None,
        )
    }

    /// Declares a pin flowing plain data of type `T` (a `pin::Data<T>`
    /// field).
    pub fn add_data_pin<T: Default + 'static>(
        &mut self,
        node: TemplateVertexId,
        member_offset: usize,
    ) -> TemplateVertexId {
        self.add_pin(node, member_offset, DataTypeDesc::of::<T>(), None)
    }

    /// Declares a sink: an accumulator propagated in reverse topological
    /// order and cleared before each frame.
    pub fn add_sink_pin<T: Default + 'static>(
        &mut self,
        node: TemplateVertexId,
        member_offset: usize,
        clear: SinkClearFn,
    ) -> TemplateVertexId {
        self.add_pin(node, member_offset, DataTypeDesc::of::<T>(), Some(clear))
    }

    /// Injects a constant into the node payload (or pin storage) at
    /// instantiation time.
    pub fn bind(&mut self, vertex: TemplateVertexId, binding: impl Fn(*mut u8) + 'static) {
        self.template.vertices[vertex.0 as usize]
            .bindings
            .push(Rc::new(binding));
    }

    /// A bare pin vertex at the template boundary, connectable from another
    /// subgraph's output of the same data type.
    pub fn add_input<T: Default + 'static>(&mut self, name: &str) -> TemplateVertexId {
        let id = self.push_vertex(TemplateVertex {
            kind: VertexKind::Pin,
            node_desc: None,
            owner_node: None,
            pin_desc: DataTypeDesc::of::<T>(),
            pin_member_offset: 0,
            clear_sink: None,
            bindings: Vec::new(),
            name: name.to_owned(),
        });
        self.template.inputs.push(id);
        id
    }

    pub fn add_output<T: Default + 'static>(&mut self, name: &str) -> TemplateVertexId {
        let id = self.push_vertex(TemplateVertex {
            kind: VertexKind::Pin,
            node_desc: None,
            owner_node: None,
            pin_desc: DataTypeDesc::of::<T>(),
            pin_member_offset: 0,
            clear_sink: None,
            bindings: Vec::new(),
            name: name.to_owned(),
        });
        self.template.outputs.push(id);
        id
    }

    pub fn add_input_buffer(&mut self, name: &str) -> TemplateVertexId {
        self.add_input::<crate::resource::FrameGraphBuffer>(name)
    }

    pub fn add_output_buffer(&mut self, name: &str) -> TemplateVertexId {
        self.add_output::<crate::resource::FrameGraphBuffer>(name)
    }

    pub fn add_input_texture(&mut self, name: &str) -> TemplateVertexId {
        self.add_input::<crate::resource::FrameGraphTexture>(name)
    }

    pub fn add_output_texture(&mut self, name: &str) -> TemplateVertexId {
        self.add_output::<crate::resource::FrameGraphTexture>(name)
    }

    /// Connects two pins, together with the ordering edges the owner nodes
    /// need: node-to-node when both pins are owned, node-to-pin / pin-to-node
    /// when one side is a boundary pin, so enablement and the topological
    /// sort can walk across the template boundary.
    pub fn connect(&mut self, from: TemplateVertexId, to: TemplateVertexId) {
        self.template.edges.push((from, to));

        let from_node = self.template.vertices[from.0 as usize].owner_node;
        let to_node = self.template.vertices[to.0 as usize].owner_node;

        let companion = match (from_node, to_node) {
            (Some(a), Some(b)) if a != b => Some((a, b)),
            (Some(a), None) => Some((a, to)),
            (None, Some(b)) => Some((from, b)),
            _ => None,
        };

        if let Some(edge) = companion {
            if !self.template.edges.contains(&edge) {
                self.template.edges.push(edge);
            }
        }
    }

    /// Pure ordering edge between two nodes.
    pub fn connect_nodes(&mut self, from: TemplateVertexId, to: TemplateVertexId) {
        if !self.template.edges.contains(&(from, to)) {
            self.template.edges.push((from, to));
        }
    }

    pub fn build(self) -> GraphTemplate {
        self.template
    }
}
