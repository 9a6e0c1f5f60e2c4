//! Context: ordered assembly and teardown of runtime systems.
//!
//! Systems are requested by name before assembly. Assembly then runs in
//! phases: every system is created, connected (a system may `query`
//! others and thereby record connection references), and initialized
//! on demand (queries during initialization lazily initialize their
//! target and record initialization references). Teardown walks the
//! recorded references in reverse so a system never outlives the
//! systems that still depend on it.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use kiln_memory::{AllocationGroup, InternedString};
use thiserror::Error;

/// One runtime system living inside a [`Context`].
///
/// Hooks run in assembly/teardown order; each receives the context so it
/// can [`Context::query`] collaborators. Dropping the system plays the
/// role of the destroy hook.
pub trait ContextSystem: Send {
    /// Downcast access for consumers that queried this system.
    fn as_any(&mut self) -> &mut dyn Any;

    fn connect(&mut self, _context: &Context) {}
    fn connected_init(&mut self, _context: &Context) {}
    fn connected_shutdown(&mut self, _context: &Context) {}
    fn disconnect(&mut self, _context: &Context) {}
}

/// Shared handle to a system instance, as returned by queries.
pub type SystemInstance = Arc<Mutex<Box<dyn ContextSystem>>>;

type SystemFactory = Box<dyn FnOnce(AllocationGroup) -> Option<Box<dyn ContextSystem>> + Send>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ContextError {
    #[error("system \"{0}\" was already requested")]
    DuplicateRequest(InternedString),
    #[error("system \"{0}\" is not part of this context")]
    NotFound(InternedString),
    #[error("querying is not allowed in the {0:?} state")]
    QueryForbidden(ContextState),
    #[error("context is in the {0:?} state")]
    WrongState(ContextState),
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ContextState {
    CollectingRequests,
    Creation,
    Connection,
    ConnectedInitialization,
    Ready,
    ConnectedShutdown,
    Disconnection,
    Destruction,
}

struct SystemNode {
    name: InternedString,
    factory: Option<SystemFactory>,
    instance: Option<SystemInstance>,
    initialized: bool,
    connection_references_to_others: usize,
    initialization_references_to_me: usize,
    /// Systems this node queried during its initialization.
    initialization_references_to_others: Vec<usize>,
    /// Systems that queried this node during connection.
    connection_references_to_me: Vec<usize>,
}

struct ContextInner {
    state: ContextState,
    nodes: Vec<SystemNode>,
    names: HashMap<InternedString, usize>,
    operation_stack: Vec<usize>,
    group: AllocationGroup,
}

/// Owner of all runtime systems and their assembly state machine.
pub struct Context {
    inner: Mutex<ContextInner>,
}

impl Context {
    pub fn new(group: AllocationGroup) -> Self {
        Context {
            inner: Mutex::new(ContextInner {
                state: ContextState::CollectingRequests,
                nodes: Vec::new(),
                names: HashMap::new(),
                operation_stack: Vec::new(),
                group,
            }),
        }
    }

    pub fn state(&self) -> ContextState {
        self.inner.lock().unwrap().state
    }

    /// Requests a system to be part of the context. Only valid before
    /// assembly; duplicate names are rejected.
    pub fn request_system(
        &self,
        name: &str,
        factory: impl FnOnce(AllocationGroup) -> Option<Box<dyn ContextSystem>> + Send + 'static,
    ) -> Result<(), ContextError> {
        let name = InternedString::intern(name);
        let mut inner = self.inner.lock().unwrap();
        if inner.state != ContextState::CollectingRequests {
            return Err(ContextError::WrongState(inner.state));
        }
        if inner.names.contains_key(&name) {
            log::error!(target: "context", "duplicate request for system \"{}\"", name);
            return Err(ContextError::DuplicateRequest(name));
        }

        let index = inner.nodes.len();
        inner.names.insert(name, index);
        inner.nodes.push(SystemNode {
            name,
            factory: Some(Box::new(factory)),
            instance: None,
            initialized: false,
            connection_references_to_others: 0,
            initialization_references_to_me: 0,
            initialization_references_to_others: Vec::new(),
            connection_references_to_me: Vec::new(),
        });
        Ok(())
    }

    /// Runs the assembly phases: create, connect, connected-init. After
    /// this the context is ready.
    pub fn assembly(&self) {
        let count;
        {
            let mut inner = self.inner.lock().unwrap();
            debug_assert_eq!(inner.state, ContextState::CollectingRequests);
            inner.state = ContextState::Creation;
            count = inner.nodes.len();
        }

        for index in 0..count {
            let (name, factory, group) = {
                let mut inner = self.inner.lock().unwrap();
                let name = inner.nodes[index].name;
                let group = inner.group.child(name.as_str());
                (
                    name,
                    inner.nodes[index].factory.take().expect("created once"),
                    group,
                )
            };

            match factory(group) {
                Some(system) => {
                    self.inner.lock().unwrap().nodes[index].instance =
                        Some(Arc::new(Mutex::new(system)));
                }
                None => {
                    log::error!(
                        target: "context",
                        "failed to create instance of system \"{}\"",
                        name
                    );
                }
            }
        }

        {
            let mut inner = self.inner.lock().unwrap();
            inner.state = ContextState::Connection;
        }

        for index in 0..count {
            if let Some(instance) = self.instance_at(index) {
                self.push_operation(index);
                instance.lock().unwrap().connect(self);
                self.pop_operation();
            }
        }

        {
            let mut inner = self.inner.lock().unwrap();
            debug_assert!(inner.operation_stack.is_empty());
            inner.state = ContextState::ConnectedInitialization;
        }

        for index in 0..count {
            self.initialize_system(index);
        }

        let mut inner = self.inner.lock().unwrap();
        debug_assert!(inner.operation_stack.is_empty());
        inner.state = ContextState::Ready;
        log::info!(target: "context", "assembly finished with {} systems", count);
    }

    /// Looks a system up by name, recording dependency references when
    /// called from inside connect or connected-init hooks.
    pub fn query(&self, name: &str) -> Result<SystemInstance, ContextError> {
        let name = InternedString::intern(name);
        let (index, state) = {
            let inner = self.inner.lock().unwrap();
            let index = *inner
                .names
                .get(&name)
                .ok_or(ContextError::NotFound(name))?;
            (index, inner.state)
        };

        match state {
            ContextState::Connection => {
                let mut inner = self.inner.lock().unwrap();
                if let Some(&querier) = inner.operation_stack.last() {
                    if !inner.nodes[index].connection_references_to_me.contains(&querier) {
                        inner.nodes[index].connection_references_to_me.push(querier);
                        inner.nodes[querier].connection_references_to_others += 1;
                    }
                }
                debug_assert!(!inner.nodes[index].initialized);
                self.instance_of(&inner, index, name)
            }
            ContextState::ConnectedInitialization => {
                {
                    let mut inner = self.inner.lock().unwrap();
                    if let Some(&querier) = inner.operation_stack.last() {
                        if !inner.nodes[querier]
                            .initialization_references_to_others
                            .contains(&index)
                        {
                            inner.nodes[querier]
                                .initialization_references_to_others
                                .push(index);
                            inner.nodes[index].initialization_references_to_me += 1;
                        }
                    }
                }
                self.initialize_system(index);
                let inner = self.inner.lock().unwrap();
                self.instance_of(&inner, index, name)
            }
            ContextState::Ready
            | ContextState::ConnectedShutdown
            | ContextState::Disconnection => {
                let inner = self.inner.lock().unwrap();
                self.instance_of(&inner, index, name)
            }
            forbidden => Err(ContextError::QueryForbidden(forbidden)),
        }
    }

    /// Tears the context down: connected-shutdown in dependency order,
    /// then disconnect, then destruction of the instances.
    pub fn teardown(&self) {
        let count;
        {
            let mut inner = self.inner.lock().unwrap();
            debug_assert_eq!(inner.state, ContextState::Ready);
            inner.state = ContextState::ConnectedShutdown;
            count = inner.nodes.len();
        }

        for index in 0..count {
            self.shutdown_system(index);
        }

        {
            let mut inner = self.inner.lock().unwrap();
            inner.state = ContextState::Disconnection;
        }

        for index in 0..count {
            if let Some(instance) = self.instance_at(index) {
                instance.lock().unwrap().disconnect(self);
            }
        }

        let mut inner = self.inner.lock().unwrap();
        inner.state = ContextState::Destruction;
        for node in &mut inner.nodes {
            node.instance = None;
        }
        debug_assert!(inner.operation_stack.is_empty());
        log::info!(target: "context", "teardown finished");
    }

    fn instance_at(&self, index: usize) -> Option<SystemInstance> {
        self.inner.lock().unwrap().nodes[index].instance.clone()
    }

    fn instance_of(
        &self,
        inner: &ContextInner,
        index: usize,
        name: InternedString,
    ) -> Result<SystemInstance, ContextError> {
        inner.nodes[index]
            .instance
            .clone()
            .ok_or(ContextError::NotFound(name))
    }

    fn push_operation(&self, index: usize) {
        self.inner.lock().unwrap().operation_stack.push(index);
    }

    fn pop_operation(&self) {
        self.inner.lock().unwrap().operation_stack.pop();
    }

    /// Demand-driven initialization: systems that connected to this one
    /// initialize first, then this system's hook runs with the operation
    /// stack recording who it queries.
    fn initialize_system(&self, index: usize) {
        let (instance, dependants) = {
            let inner = self.inner.lock().unwrap();
            let node = &inner.nodes[index];
            if node.instance.is_none() || node.initialized {
                return;
            }
            (
                node.instance.clone().expect("checked above"),
                node.connection_references_to_me.clone(),
            )
        };

        for dependant in dependants {
            self.initialize_system(dependant);
        }

        {
            let inner = self.inner.lock().unwrap();
            if inner.nodes[index].initialized {
                return;
            }
        }

        let name = self.inner.lock().unwrap().nodes[index].name;
        log::debug!(target: "context", "initializing system \"{}\"", name);
        self.push_operation(index);
        instance.lock().unwrap().connected_init(self);
        self.pop_operation();
        self.inner.lock().unwrap().nodes[index].initialized = true;
    }

    fn shutdown_system(&self, index: usize) {
        let instance = {
            let inner = self.inner.lock().unwrap();
            let node = &inner.nodes[index];
            if node.instance.is_none()
                || !node.initialized
                || node.initialization_references_to_me > 0
                || node.connection_references_to_others > 0
            {
                return;
            }
            node.instance.clone().expect("checked above")
        };

        let name = self.inner.lock().unwrap().nodes[index].name;
        log::debug!(target: "context", "shutting down system \"{}\"", name);
        self.push_operation(index);
        instance.lock().unwrap().connected_shutdown(self);
        self.pop_operation();

        let (init_others, connected_to_me) = {
            let mut inner = self.inner.lock().unwrap();
            inner.nodes[index].initialized = false;
            (
                inner.nodes[index].initialization_references_to_others.clone(),
                inner.nodes[index].connection_references_to_me.clone(),
            )
        };

        // Descend the recorded references: whoever only stayed alive for
        // this system may shut down now.
        for other in init_others {
            self.inner.lock().unwrap().nodes[other].initialization_references_to_me -= 1;
            self.shutdown_system(other);
        }
        for other in connected_to_me {
            self.inner.lock().unwrap().nodes[other].connection_references_to_others -= 1;
            self.shutdown_system(other);
        }
    }
}
