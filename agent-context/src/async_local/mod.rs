//! The causal-propagation strategy.
//!
//! Context is kept in an [`AsyncLocalStorage`], so a context installed by
//! `run_with_context` follows every continuation scheduled from within it,
//! however many hops removed, and stays invisible to interleaved work from
//! other chains.
//!
//! Tracking covers what goes through the storage: futures spawned with
//! `spawn_local`, `defer` and `set_timeout` on the manager, futures tied with
//! `bind`/`scope`, and every `.await` continuation inside those. Work handed
//! to the runtime directly does not belong to any chain.

use std::cell::Cell;
use std::future::Future;

use tokio::task::JoinHandle;
use tracing::debug;

use crate::context::Context;
use crate::manager::{ContextManager, ManagerState};

mod resource;
mod storage;

pub use resource::AsyncResource;
pub use storage::{AsyncLocalStorage, WithStore};

pub struct AsyncLocalContextManager {
    default_context: Context,
    storage: AsyncLocalStorage<Context>,
    state: Cell<ManagerState>,
}

impl AsyncLocalContextManager {
    #[allow(clippy::new_without_default)]
    pub fn new() -> AsyncLocalContextManager {
        AsyncLocalContextManager {
            default_context: Context::default(),
            storage: AsyncLocalStorage::new(),
            state: Cell::new(ManagerState::Uninitialized),
        }
    }

    pub fn storage(&self) -> &AsyncLocalStorage<Context> {
        &self.storage
    }

    /// Ties `future` to the current chain without spawning it.
    pub fn bind<F: Future>(&self, future: F) -> WithStore<F, Context> {
        self.storage.bind(future)
    }

    /// Ties `future` to a new chain with `context` ambient, the asynchronous
    /// counterpart of `run_with_context`.
    pub fn scope<F: Future>(&self, context: Context, future: F) -> WithStore<F, Context> {
        self.storage.scope(context, future)
    }

    /// Captures the current chain for callbacks that run later.
    pub fn async_resource(&self) -> AsyncResource<Context> {
        AsyncResource::new(&self.storage)
    }
}

impl ContextManager for AsyncLocalContextManager {
    fn get_context(&self) -> Context {
        self.storage
            .get_store()
            .unwrap_or_else(|| self.default_context.clone())
    }

    fn set_context(&self, context: Context) {
        self.storage.enter_with(context);
    }

    fn run_with_context<F, R>(&self, context: Context, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        self.storage.run(context, f)
    }

    fn spawn_local<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        self.storage.spawn_local(future)
    }

    fn enable(&self) {
        if self.state.replace(ManagerState::Enabled) != ManagerState::Enabled {
            debug!("enabled async-local context manager");
        }

        self.storage.enable();
    }

    fn disable(&self) {
        if self.state.replace(ManagerState::Disabled) != ManagerState::Disabled {
            debug!("disabled async-local context manager");
        }

        // a later enable or run_with_context turns the storage back on
        self.storage.disable();
    }

    fn state(&self) -> ManagerState {
        self.state.get()
    }
}
