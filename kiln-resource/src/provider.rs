//! Resource provider: scanning, request serving and hot reload.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use kiln_memory::{AllocationGroup, IdGenerator32, InternedString, TypedId32};

use crate::types::{
    peek_binary_header, peek_readable_type, ResourceIndex, ResourceTypeRegistry, TypeHeader,
    RESOURCE_INDEX_FILE, STRING_REGISTRY_FILE,
};
use crate::vfs::{VfsEntryKind, VirtualFileSystem};
use crate::watcher::ReloadWatcher;

pub struct RequestTag;
pub struct ContainerTag;
pub struct EntryTag;

/// Identifies one resource request owned by the caller.
pub type RequestId = TypedId32<RequestTag>;
/// Identifies one loaded native resource container.
pub type ContainerId = TypedId32<ContainerTag>;
/// Identifies one known resource entry.
pub type EntryId = TypedId32<EntryTag>;

/// Minimum priority available to user requests.
pub const USER_PRIORITY_MIN: u32 = 0;
/// Maximum priority available to user requests; values above it are used
/// internally.
pub const USER_PRIORITY_MAX: u32 = u32::MAX / 2;

/// Resource provider configuration.
#[derive(Clone, Debug)]
pub struct ProviderConfig {
    /// Time spent scanning for resources per update.
    pub scan_budget: Duration,
    /// Time spent loading resources per update.
    pub serve_budget: Duration,
    /// Virtual directory used as the resource root.
    pub resource_directory: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        ProviderConfig {
            scan_budget: Duration::from_millis(2),
            serve_budget: Duration::from_millis(2),
            resource_directory: "resources".to_owned(),
        }
    }
}

/// What a request currently provides.
#[derive(Clone, Debug)]
pub enum RequestOutcome {
    /// Not loaded yet (or the entry is unknown).
    Pending,
    /// Loaded native resource container.
    Container(ContainerId),
    /// Loaded third-party bytes.
    ThirdParty(Arc<[u8]>),
}

/// Sent when a request's outcome changes.
#[derive(Clone, Debug)]
pub struct RequestUpdatedEvent {
    pub request_id: RequestId,
    pub type_name: Option<InternedString>,
}

/// Sent when a known entry appears, changes or vanishes.
#[derive(Clone, Debug)]
pub struct EntryChangedEvent {
    pub type_name: Option<InternedString>,
    pub name: InternedString,
}

/// A native resource known to the provider.
#[derive(Clone, Debug)]
pub struct NativeEntry {
    pub id: EntryId,
    pub type_name: InternedString,
    pub name: InternedString,
    pub path: String,
    pub group: AllocationGroup,
    /// Set when the last load attempt failed; cleared by modification.
    failed: bool,
}

/// A third-party resource known to the provider.
#[derive(Clone, Debug)]
pub struct ThirdPartyEntry {
    pub id: EntryId,
    pub name: InternedString,
    pub path: String,
    pub size: u64,
    pub group: AllocationGroup,
    failed: bool,
}

struct RequestRecord {
    type_name: Option<InternedString>,
    name: InternedString,
    priority: u32,
    outcome: RequestOutcome,
}

struct ContainerRecord {
    type_name: InternedString,
    references: usize,
    payload: Arc<dyn Any + Send + Sync>,
}

#[derive(Default)]
struct ProviderState {
    scan_done: bool,
    scan_started: bool,
    request_reset: bool,
    scan_queue: VecDeque<String>,
    string_registry: Vec<InternedString>,

    native_entries: HashMap<(InternedString, InternedString), NativeEntry>,
    third_party_entries: HashMap<InternedString, ThirdPartyEntry>,

    requests: HashMap<RequestId, RequestRecord>,
    containers: HashMap<ContainerId, ContainerRecord>,
    loaded_native: HashMap<(InternedString, InternedString), ContainerId>,
    loaded_third_party: HashMap<InternedString, Arc<[u8]>>,
    /// Resources whose current data must be reloaded and republished.
    stale: Vec<(Option<InternedString>, InternedString)>,
    pending_destroy: Vec<ContainerId>,

    request_events: VecDeque<RequestUpdatedEvent>,
    entry_events: VecDeque<EntryChangedEvent>,
}

/// Turns reference-counted resource requests into loaded containers or
/// raw byte blobs, driven by a budgeted scanner and an optional
/// hot-reload watcher.
///
/// [`update`](Self::update) performs one scan step and one serve step
/// under the configured budgets; it is designed to be called once per
/// frame, typically from a workflow node.
pub struct ResourceProvider {
    vfs: Arc<VirtualFileSystem>,
    types: Arc<ResourceTypeRegistry>,
    config: ProviderConfig,
    group: AllocationGroup,
    request_ids: IdGenerator32<RequestTag>,
    container_ids: IdGenerator32<ContainerTag>,
    entry_ids: IdGenerator32<EntryTag>,
    state: Mutex<ProviderState>,
    watcher: Mutex<Option<ReloadWatcher>>,
}

impl ResourceProvider {
    pub fn new(
        vfs: Arc<VirtualFileSystem>,
        types: Arc<ResourceTypeRegistry>,
        config: ProviderConfig,
        group: AllocationGroup,
    ) -> Self {
        ResourceProvider {
            vfs,
            types,
            config,
            group,
            request_ids: IdGenerator32::new(),
            container_ids: IdGenerator32::new(),
            entry_ids: IdGenerator32::new(),
            state: Mutex::new(ProviderState::default()),
            watcher: Mutex::new(None),
        }
    }

    /// Starts watching the resource root for changes. Requires the root
    /// to resolve to a real directory mount.
    pub fn enable_hot_reload(&self) -> Result<(), notify::Error> {
        let root = self
            .vfs
            .resolve_real(&self.config.resource_directory)
            .ok_or_else(|| {
                notify::Error::generic("resource directory is not backed by a real mount")
            })?;
        let watcher = ReloadWatcher::attach(&root)?;
        *self.watcher.lock().unwrap() = Some(watcher);
        log::info!(target: "resource", "hot reload watching {}", root.display());
        Ok(())
    }

    /// True once the initial (or post-reset) scan has covered the whole
    /// resource directory.
    pub fn scan_done(&self) -> bool {
        self.state.lock().unwrap().scan_done
    }

    /// Drops all entries and loaded data and scans from scratch on the
    /// following updates.
    pub fn request_reset(&self) {
        self.state.lock().unwrap().request_reset = true;
    }

    /// Registers a request for a native (`type_name` set) or third-party
    /// resource. Priorities are clamped into the user range.
    pub fn insert_request(
        &self,
        type_name: Option<InternedString>,
        name: InternedString,
        priority: u32,
    ) -> RequestId {
        let id = self.request_ids.next();
        let mut state = self.state.lock().unwrap();
        state.requests.insert(
            id,
            RequestRecord {
                type_name,
                name,
                priority: priority.clamp(USER_PRIORITY_MIN, USER_PRIORITY_MAX),
                outcome: RequestOutcome::Pending,
            },
        );
        id
    }

    /// Deletes a request, releasing the underlying load. A container
    /// with no remaining references is destroyed on the next serve tick.
    pub fn delete_request(&self, id: RequestId) {
        let mut state = self.state.lock().unwrap();
        let Some(record) = state.requests.remove(&id) else {
            return;
        };
        if let RequestOutcome::Container(container) = record.outcome {
            release_container(&mut state, container);
        }
    }

    pub fn request_outcome(&self, id: RequestId) -> Option<RequestOutcome> {
        self.state
            .lock()
            .unwrap()
            .requests
            .get(&id)
            .map(|record| record.outcome.clone())
    }

    /// Typed access to a loaded container's payload.
    pub fn container<T: Send + Sync + 'static>(&self, id: ContainerId) -> Option<Arc<T>> {
        let state = self.state.lock().unwrap();
        let record = state.containers.get(&id)?;
        Arc::downcast(Arc::clone(&record.payload)).ok()
    }

    pub fn container_alive(&self, id: ContainerId) -> bool {
        self.state.lock().unwrap().containers.contains_key(&id)
    }

    pub fn native_entry(&self, type_name: InternedString, name: InternedString) -> Option<NativeEntry> {
        self.state
            .lock()
            .unwrap()
            .native_entries
            .get(&(type_name, name))
            .cloned()
    }

    pub fn third_party_entry(&self, name: InternedString) -> Option<ThirdPartyEntry> {
        self.state
            .lock()
            .unwrap()
            .third_party_entries
            .get(&name)
            .cloned()
    }

    pub fn poll_request_events(&self) -> Vec<RequestUpdatedEvent> {
        self.state.lock().unwrap().request_events.drain(..).collect()
    }

    pub fn poll_entry_events(&self) -> Vec<EntryChangedEvent> {
        self.state.lock().unwrap().entry_events.drain(..).collect()
    }

    /// Dispatches one provider tick as a task attached to `job`, which
    /// is how a workflow mutator node integrates the provider.
    pub fn update_as_task(self: Arc<Self>, job: &kiln_task::Job) {
        job.dispatch_task(kiln_task::Task::new("resource_provider_update", move || {
            self.update()
        }))
        .detach();
    }

    /// One provider tick: watcher drain, budgeted scan, budgeted serve,
    /// deferred container destruction.
    pub fn update(&self) {
        let _timer = kiln_task::section(InternedString::intern("resource_provider_update")).enter();
        let changes = {
            let watcher = self.watcher.lock().unwrap();
            watcher
                .as_ref()
                .map(|watcher| watcher.drain())
                .unwrap_or_default()
        };

        let mut state = self.state.lock().unwrap();
        for change in changes {
            self.apply_file_change(&mut state, change);
        }

        if state.request_reset {
            self.reset(&mut state);
        }

        self.scan_step(&mut state);
        self.serve_step(&mut state);
        self.destroy_unreferenced(&mut state);
    }

    fn reset(&self, state: &mut ProviderState) {
        log::info!(target: "resource", "resetting resource provider state");
        state.request_reset = false;
        state.scan_done = false;
        state.scan_started = false;
        state.scan_queue.clear();
        state.string_registry.clear();
        state.native_entries.clear();
        state.third_party_entries.clear();
        state.loaded_native.clear();
        state.loaded_third_party.clear();
        state.stale.clear();
        state.containers.clear();
        state.pending_destroy.clear();

        let ids: Vec<RequestId> = state.requests.keys().copied().collect();
        for id in ids {
            let record = state.requests.get_mut(&id).unwrap();
            if !matches!(record.outcome, RequestOutcome::Pending) {
                record.outcome = RequestOutcome::Pending;
                let type_name = record.type_name;
                state
                    .request_events
                    .push_back(RequestUpdatedEvent { request_id: id, type_name });
            }
        }
    }

    // ---------------------------------------------------------------
    // Scanning
    // ---------------------------------------------------------------

    fn scan_step(&self, state: &mut ProviderState) {
        if state.scan_done {
            return;
        }

        if !state.scan_started {
            state.scan_started = true;
            state
                .scan_queue
                .push_back(self.config.resource_directory.clone());
            self.load_string_registry(state);
        }

        let started = Instant::now();
        while let Some(directory) = state.scan_queue.pop_front() {
            self.scan_directory(state, &directory);
            if started.elapsed() >= self.config.scan_budget {
                break;
            }
        }

        if state.scan_queue.is_empty() {
            state.scan_done = true;
            log::info!(
                target: "resource",
                "scan done: {} native and {} third party entries",
                state.native_entries.len(),
                state.third_party_entries.len()
            );
        }
    }

    fn load_string_registry(&self, state: &mut ProviderState) {
        let path = format!(
            "{}/{}",
            self.config.resource_directory, STRING_REGISTRY_FILE
        );
        if !self.vfs.exists(&path) {
            return;
        }
        match self
            .vfs
            .read(&path)
            .map_err(|error| error.to_string())
            .and_then(|bytes| {
                String::from_utf8(bytes).map_err(|_| "not utf-8".to_owned())
            })
            .and_then(|text| ron::from_str::<Vec<String>>(&text).map_err(|error| error.to_string()))
        {
            Ok(names) => {
                state.string_registry = names
                    .iter()
                    .map(|name| InternedString::intern(name))
                    .collect();
                log::debug!(
                    target: "resource",
                    "loaded string registry with {} names",
                    state.string_registry.len()
                );
            }
            Err(error) => {
                log::error!(target: "resource", "broken string registry {}: {}", path, error);
            }
        }
    }

    fn scan_directory(&self, state: &mut ProviderState, directory: &str) {
        let index_path = format!("{}/{}", directory, RESOURCE_INDEX_FILE);
        if self.vfs.exists(&index_path) {
            self.register_index(state, directory, &index_path);
            return;
        }

        let entries = match self.vfs.list_directory(directory) {
            Ok(entries) => entries,
            Err(error) => {
                log::error!(target: "resource", "cannot list \"{}\": {}", directory, error);
                return;
            }
        };

        for entry in entries {
            let path = format!("{}/{}", directory, entry.name);
            match entry.kind {
                VfsEntryKind::Directory => state.scan_queue.push_back(path),
                VfsEntryKind::File => self.register_file(state, &path, &entry.name),
            }
        }
    }

    fn register_index(&self, state: &mut ProviderState, directory: &str, index_path: &str) {
        let index = match self
            .vfs
            .read(index_path)
            .map_err(|error| error.to_string())
            .and_then(|bytes| String::from_utf8(bytes).map_err(|_| "not utf-8".to_owned()))
            .and_then(|text| ron::from_str::<ResourceIndex>(&text).map_err(|error| error.to_string()))
        {
            Ok(index) => index,
            Err(error) => {
                log::error!(target: "resource", "broken index \"{}\": {}", index_path, error);
                return;
            }
        };

        for native in index.natives {
            self.add_native_entry(
                state,
                InternedString::intern(&native.type_name),
                InternedString::intern(&native.name),
                format!("{}/{}", directory, native.path),
            );
        }
        for third_party in index.third_party {
            self.add_third_party_entry(
                state,
                InternedString::intern(&third_party.name),
                format!("{}/{}", directory, third_party.path),
                third_party.size,
            );
        }
    }

    fn register_file(&self, state: &mut ProviderState, path: &str, file_name: &str) {
        if file_name == STRING_REGISTRY_FILE {
            log::debug!(target: "resource", "\"{}\" consumed as string registry", path);
            return;
        }

        if let Some(stem) = file_name.strip_suffix(".bin") {
            match self.peek_binary_type(state, path) {
                Ok(type_name) => {
                    self.add_native_entry(
                        state,
                        type_name,
                        InternedString::intern(stem),
                        path.to_owned(),
                    );
                }
                Err(reason) => {
                    log::error!(target: "resource", "rejected \"{}\": {}", path, reason);
                }
            }
            return;
        }

        if let Some(stem) = file_name.strip_suffix(".rd") {
            match self.peek_readable_type_of(path) {
                Ok(type_name) => {
                    self.add_native_entry(
                        state,
                        type_name,
                        InternedString::intern(stem),
                        path.to_owned(),
                    );
                }
                Err(reason) => {
                    log::error!(target: "resource", "rejected \"{}\": {}", path, reason);
                }
            }
            return;
        }

        let size = self.vfs.file_size(path).unwrap_or(0);
        self.add_third_party_entry(state, InternedString::intern(file_name), path.to_owned(), size);
    }

    fn peek_binary_type(
        &self,
        state: &ProviderState,
        path: &str,
    ) -> Result<InternedString, String> {
        let bytes = self.vfs.read(path).map_err(|error| error.to_string())?;
        let (header, _) = peek_binary_header(&bytes).map_err(|error| error.to_string())?;
        match header {
            TypeHeader::Literal(name) => Ok(InternedString::intern(&name)),
            TypeHeader::RegistryIndex(index) => state
                .string_registry
                .get(index as usize)
                .copied()
                .ok_or_else(|| format!("string registry index {} out of range", index)),
        }
    }

    fn peek_readable_type_of(&self, path: &str) -> Result<InternedString, String> {
        let bytes = self.vfs.read(path).map_err(|error| error.to_string())?;
        let text = String::from_utf8(bytes).map_err(|_| "not utf-8".to_owned())?;
        let name = peek_readable_type(&text).map_err(|error| error.to_string())?;
        Ok(InternedString::intern(&name))
    }

    fn add_native_entry(
        &self,
        state: &mut ProviderState,
        type_name: InternedString,
        name: InternedString,
        path: String,
    ) {
        if state.native_entries.contains_key(&(type_name, name)) {
            log::error!(
                target: "resource",
                "duplicate native resource \"{}\" of type \"{}\" at \"{}\"",
                name,
                type_name,
                path
            );
            return;
        }

        state.native_entries.insert(
            (type_name, name),
            NativeEntry {
                id: self.entry_ids.next(),
                type_name,
                name,
                path,
                group: self.group.child(type_name.as_str()),
                failed: false,
            },
        );
        state.entry_events.push_back(EntryChangedEvent {
            type_name: Some(type_name),
            name,
        });
    }

    fn add_third_party_entry(
        &self,
        state: &mut ProviderState,
        name: InternedString,
        path: String,
        size: u64,
    ) {
        if state.third_party_entries.contains_key(&name) {
            log::error!(
                target: "resource",
                "duplicate third party resource \"{}\" at \"{}\"",
                name,
                path
            );
            return;
        }

        state.third_party_entries.insert(
            name,
            ThirdPartyEntry {
                id: self.entry_ids.next(),
                name,
                path,
                size,
                group: self.group.child("third_party"),
                failed: false,
            },
        );
        state
            .entry_events
            .push_back(EntryChangedEvent { type_name: None, name });
    }

    // ---------------------------------------------------------------
    // Serving
    // ---------------------------------------------------------------

    fn serve_step(&self, state: &mut ProviderState) {
        let started = Instant::now();
        loop {
            let Some((type_name, name)) = self.pick_pending(state) else {
                break;
            };

            match type_name {
                Some(type_name) => self.serve_native(state, type_name, name),
                None => self.serve_third_party(state, name),
            }

            if started.elapsed() >= self.config.serve_budget {
                break;
            }
        }
    }

    /// Picks the (type, name) group to serve next: stale reloads first,
    /// then pending requests by maximum priority.
    fn pick_pending(
        &self,
        state: &ProviderState,
    ) -> Option<(Option<InternedString>, InternedString)> {
        if let Some(stale) = state.stale.first() {
            return Some(*stale);
        }

        let mut best: Option<(u32, (Option<InternedString>, InternedString))> = None;
        for record in state.requests.values() {
            if !matches!(record.outcome, RequestOutcome::Pending) {
                continue;
            }

            match record.type_name {
                Some(type_name) => {
                    let Some(entry) = state.native_entries.get(&(type_name, record.name)) else {
                        continue; // Entry unknown: the request stays new.
                    };
                    if entry.failed && !state.loaded_native.contains_key(&(type_name, record.name))
                    {
                        continue;
                    }
                }
                None => {
                    let Some(entry) = state.third_party_entries.get(&record.name) else {
                        continue;
                    };
                    if entry.failed && !state.loaded_third_party.contains_key(&record.name) {
                        continue;
                    }
                }
            }

            let group = (record.type_name, record.name);
            if best.map_or(true, |(priority, _)| record.priority > priority) {
                best = Some((record.priority, group));
            }
        }
        best.map(|(_, group)| group)
    }

    fn serve_native(&self, state: &mut ProviderState, type_name: InternedString, name: InternedString) {
        let was_stale = remove_stale(state, Some(type_name), name);
        let key = (type_name, name);

        // Fresh and already loaded: just bind waiting requests.
        if !was_stale {
            if let Some(&container) = state.loaded_native.get(&key) {
                self.bind_native_requests(state, type_name, name, container);
                return;
            }
        }

        let payload = match self.load_native_payload(state, type_name, name) {
            Ok(payload) => payload,
            Err(reason) => {
                log::error!(
                    target: "resource",
                    "failed to load \"{}\" of type \"{}\": {}",
                    name,
                    type_name,
                    reason
                );
                if let Some(entry) = state.native_entries.get_mut(&key) {
                    entry.failed = true;
                }
                return;
            }
        };

        let container = self.container_ids.next();
        state.containers.insert(
            container,
            ContainerRecord {
                type_name,
                references: 0,
                payload,
            },
        );

        if let Some(previous) = state.loaded_native.insert(key, container) {
            // Requests still pointing at the previous container migrate
            // below; whoever keeps it alive releases it later.
            log::debug!(
                target: "resource",
                "republishing \"{}\" of type \"{}\" over container {:?}",
                name,
                type_name,
                previous
            );
        }

        self.bind_native_requests(state, type_name, name, container);

        // Nothing referenced the fresh container: keep it out of the
        // table rather than leaking it.
        if state.containers.get(&container).map(|record| record.references) == Some(0) {
            state.containers.remove(&container);
            state.loaded_native.remove(&key);
        }
    }

    fn bind_native_requests(
        &self,
        state: &mut ProviderState,
        type_name: InternedString,
        name: InternedString,
        container: ContainerId,
    ) {
        let mut bound = 0usize;
        let mut released = Vec::new();
        let mut events = Vec::new();

        for (&id, record) in state.requests.iter_mut() {
            if record.type_name != Some(type_name) || record.name != name {
                continue;
            }
            match record.outcome {
                RequestOutcome::Container(existing) if existing == container => continue,
                RequestOutcome::Container(existing) => released.push(existing),
                _ => {}
            }
            record.outcome = RequestOutcome::Container(container);
            bound += 1;
            events.push(RequestUpdatedEvent {
                request_id: id,
                type_name: Some(type_name),
            });
        }

        if let Some(record) = state.containers.get_mut(&container) {
            record.references += bound;
        }
        for previous in released {
            release_container(state, previous);
        }
        state.request_events.extend(events);
    }

    fn load_native_payload(
        &self,
        state: &ProviderState,
        type_name: InternedString,
        name: InternedString,
    ) -> Result<Arc<dyn Any + Send + Sync>, String> {
        let entry = state
            .native_entries
            .get(&(type_name, name))
            .ok_or_else(|| "entry vanished".to_owned())?;
        let resource_type = self
            .types
            .find(type_name)
            .ok_or_else(|| format!("type \"{}\" is not registered", type_name))?;

        let bytes = self.vfs.read(&entry.path).map_err(|error| error.to_string())?;
        if entry.path.ends_with(".bin") {
            let (_, payload) = peek_binary_header(&bytes).map_err(|error| error.to_string())?;
            resource_type.deserialize_binary(payload)
        } else {
            let text = String::from_utf8(bytes).map_err(|_| "not utf-8".to_owned())?;
            resource_type.deserialize_readable(&text)
        }
    }

    fn serve_third_party(&self, state: &mut ProviderState, name: InternedString) {
        let was_stale = remove_stale(state, None, name);

        if was_stale || !state.loaded_third_party.contains_key(&name) {
            let Some(entry) = state.third_party_entries.get(&name).cloned() else {
                return;
            };
            match self.vfs.read(&entry.path) {
                Ok(bytes) => {
                    state.loaded_third_party.insert(name, Arc::from(bytes));
                }
                Err(error) => {
                    log::error!(
                        target: "resource",
                        "failed to load third party \"{}\": {}",
                        name,
                        error
                    );
                    if let Some(entry) = state.third_party_entries.get_mut(&name) {
                        entry.failed = true;
                    }
                    return;
                }
            }
        }

        let data = state.loaded_third_party.get(&name).cloned();
        let Some(data) = data else { return };

        let mut events = Vec::new();
        for (&id, record) in state.requests.iter_mut() {
            if record.type_name.is_some() || record.name != name {
                continue;
            }
            if let RequestOutcome::ThirdParty(existing) = &record.outcome {
                if Arc::ptr_eq(existing, &data) {
                    continue;
                }
            }
            record.outcome = RequestOutcome::ThirdParty(Arc::clone(&data));
            events.push(RequestUpdatedEvent {
                request_id: id,
                type_name: None,
            });
        }
        state.request_events.extend(events);
    }

    fn destroy_unreferenced(&self, state: &mut ProviderState) {
        let pending = std::mem::take(&mut state.pending_destroy);
        for container in pending {
            let Some(record) = state.containers.get(&container) else {
                continue;
            };
            if record.references > 0 {
                continue; // Resurrected by a newer request.
            }
            let type_name = record.type_name;
            state.containers.remove(&container);
            state
                .loaded_native
                .retain(|_, &mut loaded| loaded != container);
            log::debug!(
                target: "resource",
                "destroyed container {:?} of type \"{}\"",
                container,
                type_name
            );
        }
    }

    // ---------------------------------------------------------------
    // Hot reload
    // ---------------------------------------------------------------

    fn apply_file_change(&self, state: &mut ProviderState, change: crate::watcher::FileChange) {
        let Some(virtual_path) = self.vfs.virtualize_real(&change.path) else {
            return;
        };
        if !virtual_path.starts_with(&self.config.resource_directory) {
            return;
        }

        let known_native = state
            .native_entries
            .values()
            .find(|entry| entry.path == virtual_path)
            .map(|entry| (entry.type_name, entry.name));
        let known_third_party = state
            .third_party_entries
            .values()
            .find(|entry| entry.path == virtual_path)
            .map(|entry| entry.name);

        if change.exists {
            match (known_native, known_third_party) {
                (Some((type_name, name)), _) => {
                    self.invalidate_native(state, type_name, name);
                }
                (_, Some(name)) => {
                    self.invalidate_third_party(state, name);
                }
                (None, None) => {
                    // New file: register it the same way the scanner would.
                    let file_name = virtual_path.rsplit('/').next().unwrap_or("").to_owned();
                    self.register_file(state, &virtual_path, &file_name);
                }
            }
        } else {
            match (known_native, known_third_party) {
                (Some((type_name, name)), _) => self.remove_native(state, type_name, name),
                (_, Some(name)) => self.remove_third_party(state, name),
                (None, None) => {}
            }
        }
    }

    fn invalidate_native(
        &self,
        state: &mut ProviderState,
        type_name: InternedString,
        name: InternedString,
    ) {
        if let Some(entry) = state.native_entries.get_mut(&(type_name, name)) {
            entry.failed = false;
        }
        push_stale(state, Some(type_name), name);
        state.entry_events.push_back(EntryChangedEvent {
            type_name: Some(type_name),
            name,
        });
        log::info!(
            target: "resource",
            "\"{}\" of type \"{}\" changed on disk, reloading",
            name,
            type_name
        );
    }

    fn invalidate_third_party(&self, state: &mut ProviderState, name: InternedString) {
        if let Some(entry) = state.third_party_entries.get_mut(&name) {
            entry.failed = false;
        }
        state.loaded_third_party.remove(&name);
        push_stale(state, None, name);
        state
            .entry_events
            .push_back(EntryChangedEvent { type_name: None, name });
    }

    fn remove_native(
        &self,
        state: &mut ProviderState,
        type_name: InternedString,
        name: InternedString,
    ) {
        state.native_entries.remove(&(type_name, name));
        state.loaded_native.remove(&(type_name, name));
        remove_stale(state, Some(type_name), name);

        let mut events = Vec::new();
        let mut released = Vec::new();
        for (&id, record) in state.requests.iter_mut() {
            if record.type_name != Some(type_name) || record.name != name {
                continue;
            }
            if let RequestOutcome::Container(container) = record.outcome {
                released.push(container);
            }
            record.outcome = RequestOutcome::Pending;
            events.push(RequestUpdatedEvent {
                request_id: id,
                type_name: Some(type_name),
            });
        }
        for container in released {
            release_container(state, container);
        }
        state.request_events.extend(events);
        state.entry_events.push_back(EntryChangedEvent {
            type_name: Some(type_name),
            name,
        });
        log::info!(
            target: "resource",
            "\"{}\" of type \"{}\" vanished from disk",
            name,
            type_name
        );
    }

    fn remove_third_party(&self, state: &mut ProviderState, name: InternedString) {
        state.third_party_entries.remove(&name);
        state.loaded_third_party.remove(&name);
        remove_stale(state, None, name);

        let mut events = Vec::new();
        for (&id, record) in state.requests.iter_mut() {
            if record.type_name.is_some() || record.name != name {
                continue;
            }
            record.outcome = RequestOutcome::Pending;
            events.push(RequestUpdatedEvent {
                request_id: id,
                type_name: None,
            });
        }
        state.request_events.extend(events);
        state
            .entry_events
            .push_back(EntryChangedEvent { type_name: None, name });
    }
}

fn push_stale(state: &mut ProviderState, type_name: Option<InternedString>, name: InternedString) {
    if !state
        .stale
        .iter()
        .any(|&(stale_type, stale_name)| stale_type == type_name && stale_name == name)
    {
        state.stale.push((type_name, name));
    }
}

fn remove_stale(
    state: &mut ProviderState,
    type_name: Option<InternedString>,
    name: InternedString,
) -> bool {
    let before = state.stale.len();
    state
        .stale
        .retain(|&(stale_type, stale_name)| !(stale_type == type_name && stale_name == name));
    state.stale.len() != before
}

fn release_container(state: &mut ProviderState, container: ContainerId) {
    if let Some(record) = state.containers.get_mut(&container) {
        debug_assert!(record.references > 0);
        record.references -= 1;
        if record.references == 0 {
            state.pending_destroy.push(container);
        }
    }
}
