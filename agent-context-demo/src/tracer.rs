//! A bare-bones tracer: it creates segments and decides when to make them
//! ambient, leaving propagation to the context manager.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::Arc;

use agent_context::{AgentContextManager, Context, ContextManager};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub id: u64,
    pub name: String,
    pub transaction_id: u64,
    pub parent_id: Option<u64>,
    pub parameters: BTreeMap<String, String>,
}

pub struct Tracer {
    manager: Rc<AgentContextManager>,
    next_id: Cell<u64>,
    segments: RefCell<Vec<Arc<Segment>>>,
}

impl Tracer {
    pub fn new(manager: Rc<AgentContextManager>) -> Tracer {
        Tracer {
            manager,
            next_id: Cell::new(1),
            segments: RefCell::new(Vec::new()),
        }
    }

    pub fn manager(&self) -> &Rc<AgentContextManager> {
        &self.manager
    }

    /// Creates a transaction root segment and calls `f` with it ambient.
    pub fn start_transaction<F, R>(&self, name: &str, f: F) -> R
    where
        F: FnOnce(Arc<Segment>) -> R,
    {
        let id = self.next_id();
        let root = self.record(Segment {
            id,
            name: name.to_owned(),
            transaction_id: id,
            parent_id: None,
            parameters: BTreeMap::new(),
        });

        debug!(transaction_id = id, "started transaction {name}");

        let context = Context::with_segment(root.clone());
        self.manager.run_with_context(context, || f(root))
    }

    /// Creates a child of the ambient segment. Outside of a transaction there
    /// is nothing to attach it to and no segment is created.
    pub fn create_segment(&self, name: impl Into<String>) -> Option<Arc<Segment>> {
        self.create_segment_with(name, BTreeMap::new())
    }

    pub fn create_segment_with(
        &self,
        name: impl Into<String>,
        parameters: BTreeMap<String, String>,
    ) -> Option<Arc<Segment>> {
        let name = name.into();
        let Some(parent) = self.current_segment() else {
            debug!("not creating segment {name} outside of a transaction");
            return None;
        };

        let segment = self.record(Segment {
            id: self.next_id(),
            name,
            transaction_id: parent.transaction_id,
            parent_id: Some(parent.id),
            parameters,
        });

        Some(segment)
    }

    pub fn current_segment(&self) -> Option<Arc<Segment>> {
        self.manager
            .get_context()
            .segment()
            .and_then(|segment| segment.downcast::<Segment>())
    }

    pub fn current_transaction_id(&self) -> Option<u64> {
        self.current_segment().map(|segment| segment.transaction_id)
    }

    /// Captures `segment` (or the ambient context if `None`) now and makes it
    /// ambient again whenever the returned function is eventually called.
    ///
    /// This is how callers keep context across a scheduler hop when the
    /// strategy will not do it for them.
    pub fn bind_function<F, R>(
        &self,
        segment: Option<Arc<Segment>>,
        f: F,
    ) -> impl FnOnce() -> R + 'static
    where
        F: FnOnce() -> R + 'static,
        R: 'static,
    {
        let manager = self.manager.clone();
        let context = match segment {
            Some(segment) => Context::with_segment(segment),
            None => manager.get_context(),
        };

        move || manager.run_with_context(context, f)
    }

    pub fn segments(&self) -> Vec<Arc<Segment>> {
        self.segments.borrow().clone()
    }

    fn next_id(&self) -> u64 {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        id
    }

    fn record(&self, segment: Segment) -> Arc<Segment> {
        let segment = Arc::new(segment);
        self.segments.borrow_mut().push(segment.clone());
        segment
    }
}
