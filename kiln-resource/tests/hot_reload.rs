//! Hot reload scenarios driven through a real file system watcher.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use kiln_memory::{AllocationGroup, InternedString};
use kiln_resource::{
    write_binary_resource, ProviderConfig, RequestOutcome, ResourceProvider, ResourceTypeRegistry,
    VirtualFileSystem,
};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
struct Tunable {
    value: i32,
}

fn watched_provider(directory: &Path) -> Arc<ResourceProvider> {
    let vfs = Arc::new(VirtualFileSystem::new());
    vfs.mount_real("resources", directory).unwrap();
    let types = Arc::new(ResourceTypeRegistry::new());
    types.register::<Tunable>("tunable");

    let provider = Arc::new(ResourceProvider::new(
        vfs,
        types,
        ProviderConfig {
            scan_budget: Duration::from_millis(50),
            serve_budget: Duration::from_millis(5),
            resource_directory: "resources".to_owned(),
        },
        AllocationGroup::IGNORE,
    ));
    provider.enable_hot_reload().unwrap();
    provider
}

fn drive(provider: &ResourceProvider, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(15);
    loop {
        provider.update();
        if condition() {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "watcher never produced the expected state"
        );
        std::thread::sleep(Duration::from_millis(2));
    }
}

fn container_of(
    provider: &ResourceProvider,
    request: kiln_resource::RequestId,
) -> Option<kiln_resource::ContainerId> {
    match provider.request_outcome(request) {
        Some(RequestOutcome::Container(container)) => Some(container),
        _ => None,
    }
}

#[test]
fn modified_resources_are_republished() {
    let directory = tempfile::tempdir().unwrap();
    let file = directory.path().join("speed.bin");
    std::fs::write(&file, write_binary_resource("tunable", &Tunable { value: 1 }).unwrap())
        .unwrap();

    let provider = watched_provider(directory.path());
    let request = provider.insert_request(
        Some(InternedString::intern("tunable")),
        InternedString::intern("speed"),
        0,
    );
    drive(&provider, || container_of(&provider, request).is_some());
    let first_container = container_of(&provider, request).unwrap();

    std::fs::write(&file, write_binary_resource("tunable", &Tunable { value: 2 }).unwrap())
        .unwrap();

    // The request migrates to a fresh container holding the new data.
    drive(&provider, || {
        container_of(&provider, request)
            .and_then(|container| provider.container::<Tunable>(container))
            .is_some_and(|payload| payload.value == 2)
    });
    let second_container = container_of(&provider, request).unwrap();
    assert_ne!(first_container, second_container);

    // The invalidated container is gone once nothing references it.
    drive(&provider, || !provider.container_alive(first_container));
}

#[test]
fn added_resources_become_visible() {
    let directory = tempfile::tempdir().unwrap();
    let provider = watched_provider(directory.path());
    drive(&provider, || provider.scan_done());

    // A request for a not-yet-existing resource stays new.
    let request = provider.insert_request(
        Some(InternedString::intern("tunable")),
        InternedString::intern("late"),
        0,
    );
    provider.update();
    assert!(container_of(&provider, request).is_none());

    std::fs::write(
        directory.path().join("late.bin"),
        write_binary_resource("tunable", &Tunable { value: 9 }).unwrap(),
    )
    .unwrap();

    // The watcher may report the creation as one added event or as an
    // added/modified pair; either way the entry appears and the waiting
    // request is served.
    drive(&provider, || container_of(&provider, request).is_some());
    let payload = provider
        .container::<Tunable>(container_of(&provider, request).unwrap())
        .unwrap();
    assert_eq!(payload.value, 9);
}

#[test]
fn removed_resources_detach_requests() {
    let directory = tempfile::tempdir().unwrap();
    let file = directory.path().join("gone.bin");
    std::fs::write(&file, write_binary_resource("tunable", &Tunable { value: 5 }).unwrap())
        .unwrap();

    let provider = watched_provider(directory.path());
    let request = provider.insert_request(
        Some(InternedString::intern("tunable")),
        InternedString::intern("gone"),
        0,
    );
    drive(&provider, || container_of(&provider, request).is_some());

    std::fs::remove_file(&file).unwrap();

    drive(&provider, || {
        matches!(
            provider.request_outcome(request),
            Some(RequestOutcome::Pending)
        ) && provider
            .native_entry(
                InternedString::intern("tunable"),
                InternedString::intern("gone"),
            )
            .is_none()
    });
}
