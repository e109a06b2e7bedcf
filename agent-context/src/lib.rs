//! Keeps track of the segment that is currently executing as control flow
//! moves through synchronous calls, spawned futures, deferred callbacks and
//! timers on a single-threaded tokio runtime.
//!
//! A tracer creates one context manager at startup with
//! [`create_context_manager`], enables it, and from then on wraps every unit
//! of work in [`ContextManager::run_with_context`]. Anything that needs to know
//! the active segment asks [`ContextManager::get_context`].
//!
//! There are two strategies:
//!
//! - [`LegacyContextManager`] keeps a single slot and restores it when
//!   `run_with_context` returns. Context only flows along the synchronous call
//!   stack; work that runs on a later scheduler turn has to be re-entered
//!   explicitly by whoever scheduled it.
//! - [`AsyncLocalContextManager`] keeps context in an [`AsyncLocalStorage`],
//!   which ties it to the causal chain of the work. Futures spawned through
//!   the manager (and every `.await` continuation within them) observe the
//!   context that was ambient when they were scheduled.
//!
//! ```
//! use std::sync::Arc;
//!
//! use agent_context::{create_context_manager, Context, ContextManager, ContextManagerConfig};
//!
//! let manager = create_context_manager(&ContextManagerConfig::default()).unwrap();
//! manager.enable();
//!
//! let segment = Context::with_segment(Arc::new("GET /users"));
//! manager.run_with_context(segment.clone(), || {
//!     assert_eq!(manager.get_context(), segment);
//! });
//!
//! assert_eq!(manager.get_context(), Context::default());
//! ```

mod async_local;
mod context;
mod factory;
mod legacy;
mod manager;

pub use async_local::{AsyncLocalContextManager, AsyncLocalStorage, AsyncResource, WithStore};
pub use context::{Context, SegmentRef};
pub use factory::{
    create_context_manager, AgentContextManager, ContextManagerConfig, ContextStrategy,
    CreateContextManagerError, FeatureFlags,
};
pub use legacy::LegacyContextManager;
pub use manager::{ContextManager, ManagerState};
