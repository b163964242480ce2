//! Draw registry scenarios against the mock device: instance batching,
//! global instance id packing, and lazy BLAS / per-frame TLAS building.

use frame_rs::draw::{
    DrawInstanceComponent, DrawInstanceIdComponent, DrawMeshComponent, DrawRaytracedTag,
    DrawRegistry, GlobalTransformComponent, InstanceDataTypeRegistry, MemoryMeshSource, MeshAsset,
    MeshIndexType, ResourceId,
};
use frame_rs::ecs::EntityRegistry;
use gpu_core::mock::MockDevice;
use gpu_core::{self as gpu, StagingBuffer};

fn triangle_mesh() -> MeshAsset {
    MeshAsset {
        positions: vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
        normals: vec![[0.0, 0.0, 1.0]; 3],
        tangents: vec![[1.0, 0.0, 0.0, 1.0]; 3],
        uvs: vec![[0.0, 0.0]; 3],
        microindices: vec![0, 1, 2],
        meshlets: vec![Default::default()],
        indices: vec![0, 1, 2],
        full_index_type: MeshIndexType::U16,
        aabb_min: [0.0; 3],
        aabb_max: [1.0; 3],
    }
}

struct Fixture {
    device: MockDevice,
    staging: StagingBuffer,
    entities: EntityRegistry,
    registry: DrawRegistry,
}

impl Fixture {
    fn new() -> Self {
        let device = MockDevice::new();
        let staging = StagingBuffer::new(&device, 8 << 20).unwrap();

        let mut entities = EntityRegistry::new();
        DrawRegistry::register_components(&mut entities);

        let mut source = MemoryMeshSource::new();
        source.insert(ResourceId(1), triangle_mesh());

        let mut instance_types = InstanceDataTypeRegistry::new();
        instance_types.register::<GlobalTransformComponent>("TRANSFORM");

        let registry =
            DrawRegistry::new(&device, Box::new(source), instance_types).unwrap();

        Self {
            device,
            staging,
            entities,
            registry,
        }
    }

    fn frame(&mut self, raytracing: bool) {
        self.staging.restore_all();

        self.registry
            .generate_draw_calls(&self.device, &mut self.staging, &mut self.entities);
        self.registry
            .flush_uploads(&self.device, gpu::CommandBuffer(0), &self.staging);

        if raytracing {
            self.registry.generate_raytracing_structures(
                &self.device,
                gpu::CommandBuffer(0),
                &mut self.staging,
                &self.entities,
            );
        }

        self.device.end_frame();
    }
}

#[test]
fn entities_receive_instances_and_packed_ids() {
    let mut fixture = Fixture::new();

    for _ in 0..3 {
        fixture
            .entities
            .entity()
            .with(DrawMeshComponent { mesh: ResourceId(1) })
            .with(GlobalTransformComponent::default())
            .spawn();
    }

    fixture.frame(false);

    // One archetype of three instances, one staged buffer for the
    // registered transform component.
    let batches = fixture.registry.get_draw_calls();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].instance_count, 3);
    assert_eq!(batches[0].instance_buffers.len(), 1);

    let staged = &batches[0].instance_buffers[0].1;
    assert_eq!(
        staged.total_size(),
        3 * std::mem::size_of::<GlobalTransformComponent>() as u64
    );

    // Ids pack (table << 20) | index.
    let table_id = batches[0].instance_table_id;
    let mut ids: Vec<u32> = fixture
        .entities
        .range(&[std::any::TypeId::of::<DrawInstanceIdComponent>()], &[], &[])
        .into_iter()
        .map(|entity| {
            fixture
                .entities
                .get::<DrawInstanceIdComponent>(entity)
                .unwrap()
                .rt_instance_id
        })
        .collect();
    ids.sort_unstable();

    for (index, id) in ids.iter().enumerate() {
        assert_eq!(*id, (table_id << 20) | index as u32);
    }

    // The mesh was cached: a second frame does not reallocate table space.
    let handle = fixture.registry.try_get_mesh(ResourceId(1));
    assert!(handle.is_some());

    fixture.frame(false);
    assert_eq!(fixture.registry.try_get_mesh(ResourceId(1)), handle);
}

#[test]
fn mesh_uploads_are_flushed_once() {
    let mut fixture = Fixture::new();

    fixture
        .entities
        .entity()
        .with(DrawMeshComponent { mesh: ResourceId(1) })
        .with(GlobalTransformComponent::default())
        .spawn();

    fixture.frame(false);

    let copies = fixture
        .device
        .commands()
        .iter()
        .filter(|c| matches!(c, gpu_core::mock::MockCommand::CopyBuffer { .. }))
        .count();
    // Positions, normals, tangents, uvs, micro-indices, meshlets, draw
    // range, aabb.
    assert_eq!(copies, 8);

    fixture.device.clear_commands();
    fixture.frame(false);

    let copies_after = fixture
        .device
        .commands()
        .iter()
        .filter(|c| matches!(c, gpu_core::mock::MockCommand::CopyBuffer { .. }))
        .count();
    assert_eq!(copies_after, 0, "cached mesh must not re-upload");
}

#[test]
fn lazy_blas_and_per_frame_tlas() {
    let mut fixture = Fixture::new();

    fixture
        .entities
        .entity()
        .with(DrawMeshComponent { mesh: ResourceId(1) })
        .with(GlobalTransformComponent::default())
        .with_tag::<DrawRaytracedTag>()
        .spawn();

    // Frame 0: the BLAS for the u16-indexed mesh is created and built, the
    // TLAS is built from the instance.
    fixture.frame(true);

    assert_eq!(fixture.device.acceleration_structure_creation_count(), 2);
    let first_tlas = fixture.registry.get_tlas();
    assert!(first_tlas.is_some());

    // Frame 1: same mesh, no BLAS creation; the TLAS is rebuilt anew.
    fixture.frame(true);

    assert_eq!(
        fixture.device.acceleration_structure_creation_count(),
        3,
        "one new TLAS, no new BLAS"
    );
    let second_tlas = fixture.registry.get_tlas();
    assert!(second_tlas.is_some());
    assert_ne!(first_tlas, second_tlas);

    // The instance entity kept its tag through the structural moves.
    let raytraced = fixture.entities.range(
        &[std::any::TypeId::of::<DrawInstanceComponent>()],
        &[std::any::TypeId::of::<DrawRaytracedTag>()],
        &[],
    );
    assert_eq!(raytraced.len(), 1);
}

#[test]
fn raytracing_barriers_bracket_the_builds() {
    let mut fixture = Fixture::new();

    fixture
        .entities
        .entity()
        .with(DrawMeshComponent { mesh: ResourceId(1) })
        .with(GlobalTransformComponent::default())
        .with_tag::<DrawRaytracedTag>()
        .spawn();

    fixture.frame(true);

    use gpu_core::mock::MockCommand;

    let commands = fixture.device.commands();

    let builds: Vec<usize> = commands
        .iter()
        .enumerate()
        .filter_map(|(i, c)| match c {
            MockCommand::BuildAccelerationStructures { .. } => Some(i),
            _ => None,
        })
        .collect();
    assert_eq!(builds.len(), 2, "one BLAS batch, one TLAS build");

    // A barrier separates the BLAS batch from the TLAS build, and one
    // follows the TLAS for the ray tracing stage.
    let blas_to_tlas = commands[builds[0]..builds[1]]
        .iter()
        .any(|c| matches!(c, MockCommand::ApplyBarriers { memory, .. } if !memory.is_empty()));
    assert!(blas_to_tlas);

    let after_tlas = commands[builds[1]..].iter().any(|c| {
        matches!(c, MockCommand::ApplyBarriers { memory, .. } if memory.iter().any(|b| {
            b.next_pipelines.contains(gpu::PipelineStages::RAYTRACING)
        }))
    });
    assert!(after_tlas);
}
