//! Cross-subsystem smoke test: a context assembles the resource
//! provider and render backend, and a workflow graph streams a loaded
//! resource into a GPU buffer.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use kiln::context::{Context, ContextSystem};
use kiln::memory::{AllocationGroup, InternedString};
use kiln::render::{
    BufferType, DeviceMemoryClass, HeadlessDevice, RenderBackend, RenderBackendConfig,
};
use kiln::resource::{
    write_readable_resource, ProviderConfig, RequestOutcome, ResourceProvider,
    ResourceTypeRegistry, VirtualFileSystem,
};
use kiln::task::Job;
use kiln::workflow::{AccessClass, GraphBuilder, NodeBuilder};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
struct MaterialColor {
    rgba: [u8; 4],
}

struct ResourceProviderSystem {
    provider: Arc<ResourceProvider>,
}

impl ContextSystem for ResourceProviderSystem {
    fn as_any(&mut self) -> &mut dyn Any {
        self
    }
}

struct RenderBackendSystem {
    backend: Arc<RenderBackend>,
}

impl ContextSystem for RenderBackendSystem {
    fn as_any(&mut self) -> &mut dyn Any {
        self
    }

    fn connect(&mut self, context: &Context) {
        // Frame preparation reads loaded containers, so the backend
        // keeps the provider alive for its whole lifetime.
        context.query("resource_provider").unwrap();
    }
}

#[test]
fn resource_flows_through_workflow_into_render_buffer() {
    let directory = tempfile::tempdir().unwrap();
    std::fs::write(
        directory.path().join("sky.rd"),
        write_readable_resource("material_color", &MaterialColor { rgba: [10, 20, 30, 255] })
            .unwrap(),
    )
    .unwrap();

    let vfs = Arc::new(VirtualFileSystem::new());
    vfs.mount_real("resources", directory.path()).unwrap();
    let types = Arc::new(ResourceTypeRegistry::new());
    types.register::<MaterialColor>("material_color");
    let provider = Arc::new(ResourceProvider::new(
        vfs,
        types,
        ProviderConfig::default(),
        AllocationGroup::root().child("runtime_test"),
    ));

    let device = Arc::new(HeadlessDevice::new(DeviceMemoryClass::Separate));
    let backend = Arc::new(RenderBackend::new(
        device.clone(),
        RenderBackendConfig::default(),
    ));

    let context = Context::new(AllocationGroup::root().child("runtime_test_context"));
    {
        let provider = Arc::clone(&provider);
        context
            .request_system("resource_provider", move |_group| {
                Some(Box::new(ResourceProviderSystem { provider }))
            })
            .unwrap();
    }
    {
        let backend = Arc::clone(&backend);
        context
            .request_system("render_backend", move |_group| {
                Some(Box::new(RenderBackendSystem { backend }))
            })
            .unwrap();
    }
    context.assembly();

    let request = provider.insert_request(
        Some(InternedString::intern("material_color")),
        InternedString::intern("sky"),
        10,
    );
    let uniform = backend
        .create_buffer(BufferType::Uniform, 4, InternedString::intern("sky_color"))
        .unwrap();
    let uniform_raw = backend.buffer_raw(uniform).unwrap();

    // Per-frame graph: the provider ticks, then frame preparation picks
    // up whatever finished loading.
    let uploaded = Arc::new(AtomicBool::new(false));
    let mut builder = GraphBuilder::new(AllocationGroup::IGNORE);

    let mut update_node = NodeBuilder::new("resource_provider_update");
    update_node.register_access("resource_requests", AccessClass::Modification);
    update_node.make_dependency_of("resource_provider_end");
    {
        let provider = Arc::clone(&provider);
        update_node.set_function(move |job: Job| {
            Arc::clone(&provider).update_as_task(&job);
            job.release();
        });
    }
    builder.submit(update_node).unwrap();

    let mut prepare_node = NodeBuilder::new("prepare_frame");
    prepare_node.register_access("resource_requests", AccessClass::View);
    prepare_node.register_access("frame_state", AccessClass::Modification);
    prepare_node.depend_on("resource_provider_end");
    {
        let provider = Arc::clone(&provider);
        let backend = Arc::clone(&backend);
        let uploaded = Arc::clone(&uploaded);
        prepare_node.set_function(move |job: Job| {
            if let Some(RequestOutcome::Container(container)) = provider.request_outcome(request) {
                let color = provider
                    .container::<MaterialColor>(container)
                    .expect("typed access to the loaded container");
                backend
                    .patch_buffer(uniform, 0, 4)
                    .unwrap()
                    .copy_from_slice(&color.rgba);
                uploaded.store(true, Ordering::Release);
            }
            job.release();
        });
    }
    builder.submit(prepare_node).unwrap();

    let graph = builder.finalize().unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    while !uploaded.load(Ordering::Acquire) {
        assert!(Instant::now() < deadline, "resource never reached the frame");
        graph.execute();
        std::thread::sleep(Duration::from_millis(1));
    }

    backend.next_frame().unwrap();
    assert_eq!(
        device.buffer_bytes(uniform_raw).unwrap(),
        vec![10, 20, 30, 255]
    );

    provider.delete_request(request);
    context.teardown();
}

#[test]
fn queried_systems_expose_their_payloads() {
    let context = Context::new(AllocationGroup::IGNORE);

    let vfs = Arc::new(VirtualFileSystem::new());
    let types = Arc::new(ResourceTypeRegistry::new());
    let provider = Arc::new(ResourceProvider::new(
        vfs,
        types,
        ProviderConfig::default(),
        AllocationGroup::IGNORE,
    ));

    {
        let provider = Arc::clone(&provider);
        context
            .request_system("resource_provider", move |_group| {
                Some(Box::new(ResourceProviderSystem { provider }))
            })
            .unwrap();
    }
    context.assembly();

    let instance = context.query("resource_provider").unwrap();
    let mut guard = instance.lock().unwrap();
    let system = guard
        .as_any()
        .downcast_mut::<ResourceProviderSystem>()
        .expect("system type is known to its consumers");
    assert!(Arc::ptr_eq(&system.provider, &provider));
    drop(guard);

    context.teardown();
}
