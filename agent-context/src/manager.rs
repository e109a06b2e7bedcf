//! The operations every context manager provides.

use std::fmt::{Display, Formatter, Result as FmtResult};
use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::context::Context;

/// Where a context manager is in its lifecycle.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ManagerState {
    Uninitialized,
    Enabled,
    Disabled,
}

impl Display for ManagerState {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            ManagerState::Uninitialized => write!(f, "uninitialized"),
            ManagerState::Enabled => write!(f, "enabled"),
            ManagerState::Disabled => write!(f, "disabled"),
        }
    }
}

/// Tracks the context that is ambient for the currently executing logical
/// flow.
///
/// Implementations differ in how far an installed context reaches: see
/// [`LegacyContextManager`](crate::LegacyContextManager) and
/// [`AsyncLocalContextManager`](crate::AsyncLocalContextManager).
///
/// None of the methods panic on a disabled manager. The scheduling methods
/// (`spawn_local`, `defer`, `set_timeout`) must be called from within a tokio
/// `LocalSet`.
pub trait ContextManager {
    /// Returns the ambient context, or the default context if nothing has
    /// been installed for the current flow.
    fn get_context(&self) -> Context;

    /// Installs `context` for the remainder of the current flow. This does not
    /// unwind on its own, prefer `run_with_context` when there is a call to
    /// wrap.
    fn set_context(&self, context: Context);

    /// Calls `f` with `context` ambient. Whatever `f` returns is returned and
    /// a panic in `f` unwinds through after the previous context is restored.
    fn run_with_context<F, R>(&self, context: Context, f: F) -> R
    where
        F: FnOnce() -> R;

    /// Calls `f(this, args)` with `context` ambient.
    ///
    /// The receiver and arguments are bound to `f` before the context is
    /// entered, so both strategies see exactly the same call.
    fn apply_with_context<T, A, F, R>(&self, context: Context, f: F, this: T, args: A) -> R
    where
        F: FnOnce(T, A) -> R,
    {
        let bound = move || f(this, args);
        self.run_with_context(context, bound)
    }

    /// Schedules `future` on the current `LocalSet`.
    fn spawn_local<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static;

    /// Schedules `callback` to run on a later turn of the scheduler.
    fn defer<F>(&self, callback: F) -> JoinHandle<()>
    where
        F: FnOnce() + 'static,
    {
        self.spawn_local(async move {
            tokio::task::yield_now().await;
            callback();
        })
    }

    /// Schedules `callback` to run once `delay` has elapsed.
    fn set_timeout<F>(&self, delay: Duration, callback: F) -> JoinHandle<()>
    where
        F: FnOnce() + 'static,
    {
        self.spawn_local(async move {
            tokio::time::sleep(delay).await;
            callback();
        })
    }

    fn enable(&self);

    fn disable(&self);

    fn state(&self) -> ManagerState;
}
