//! End-to-end smoke: the renderer drives the draw registry and the frame
//! graph against the mock device for a couple of frames.

use frame_rs::draw::{
    DrawMeshComponent, DrawRegistry, GlobalTransformComponent, InstanceDataTypeRegistry,
    MemoryMeshSource, MeshAsset, MeshIndexType, ResourceId,
};
use frame_rs::ecs::EntityRegistry;
use frame_rs::{Renderer, RendererDesc};
use gpu_core::mock::MockDevice;
use gpu_core::{self as gpu};

#[test]
fn renderer_runs_frames_against_the_mock_device() {
    let device = MockDevice::new();

    let mut entities = EntityRegistry::new();
    DrawRegistry::register_components(&mut entities);

    let mut source = MemoryMeshSource::new();
    source.insert(
        ResourceId(7),
        MeshAsset {
            positions: vec![[0.0; 3], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
            normals: vec![[0.0, 0.0, 1.0]; 3],
            tangents: vec![[1.0, 0.0, 0.0, 1.0]; 3],
            uvs: vec![[0.0; 2]; 3],
            microindices: vec![0, 1, 2],
            meshlets: vec![Default::default()],
            indices: vec![0, 1, 2],
            full_index_type: MeshIndexType::U32,
            ..Default::default()
        },
    );

    let mut instance_types = InstanceDataTypeRegistry::new();
    instance_types.register::<GlobalTransformComponent>("TRANSFORM");

    let cache_dir = std::env::temp_dir().join(format!("frame-rs-renderer-{}", std::process::id()));

    let mut renderer = Renderer::new(
        &device,
        RendererDesc {
            shader_include_dirs: vec![],
            spirv_cache_dir: cache_dir,
            mesh_source: Box::new(source),
            instance_types,
            enable_hot_reload: false,
        },
    )
    .unwrap();

    entities
        .entity()
        .with(DrawMeshComponent { mesh: ResourceId(7) })
        .with(GlobalTransformComponent::default())
        .spawn();

    for _ in 0..2 {
        renderer
            .render_frame(&device, gpu::CommandBuffer(0), &mut entities)
            .unwrap();
        device.end_frame();
    }

    assert_eq!(renderer.draw_registry.get_draw_calls().len(), 1);
    assert_eq!(renderer.draw_registry.get_draw_calls()[0].instance_count, 1);
    assert!(!renderer.draw_registry.get_mesh_database_data().is_empty());

    renderer.shutdown(&device);
}
