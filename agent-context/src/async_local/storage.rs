use std::cell::{Cell, RefCell};
use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context as TaskContext, Poll};

use tokio::task::JoinHandle;

/// Associates a value with a causal chain of execution.
///
/// The value installed by `run` or `enter_with` is what `get_store` returns
/// until the scope ends. Work scheduled through this storage (`bind`, `scope`,
/// `spawn_local`) captures the value that is current at scheduling time and
/// installs it again every time it is polled, so the value follows the work
/// through any number of `.await` points and spawned continuations.
///
/// Work handed to the runtime without going through the storage (a bare
/// `tokio::task::spawn_local`) is not part of any chain and sees nothing.
///
/// Handles are cheap to clone and all clones share the same store.
pub struct AsyncLocalStorage<T> {
    inner: Rc<StorageInner<T>>,
}

struct StorageInner<T> {
    current: RefCell<Option<T>>,
    enabled: Cell<bool>,
}

impl<T> Clone for AsyncLocalStorage<T> {
    fn clone(&self) -> AsyncLocalStorage<T> {
        AsyncLocalStorage {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Debug for AsyncLocalStorage<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("AsyncLocalStorage")
            .field("enabled", &self.inner.enabled.get())
            .finish()
    }
}

impl<T: Clone + 'static> AsyncLocalStorage<T> {
    #[allow(clippy::new_without_default)]
    pub fn new() -> AsyncLocalStorage<T> {
        AsyncLocalStorage {
            inner: Rc::new(StorageInner {
                current: RefCell::new(None),
                enabled: Cell::new(false),
            }),
        }
    }

    /// Returns the value for the currently executing chain, if any.
    pub fn get_store(&self) -> Option<T> {
        if !self.inner.enabled.get() {
            return None;
        }

        self.inner.current.borrow().clone()
    }

    /// Replaces the value for the rest of the current chain. Nothing restores
    /// the previous value afterwards.
    pub fn enter_with(&self, value: T) {
        self.inner.enabled.set(true);
        self.inner.current.replace(Some(value));
    }

    /// Runs `f` with `value` installed and restores the previous value once
    /// `f` returns or unwinds.
    pub fn run<F, R>(&self, value: T, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        self.inner.enabled.set(true);

        let _guard = ScopeGuard::enter(&self.inner.current, Some(value));
        f()
    }

    /// Runs `f` outside of any chain.
    pub fn exit<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let _guard = ScopeGuard::enter(&self.inner.current, None);
        f()
    }

    /// Ties `future` to the chain that is current right now.
    pub fn bind<F: Future>(&self, future: F) -> WithStore<F, T> {
        WithStore {
            future: Box::pin(future),
            storage: self.inner.clone(),
            value: self.get_store(),
        }
    }

    /// Ties `future` to a new chain holding `value`.
    pub fn scope<F: Future>(&self, value: T, future: F) -> WithStore<F, T> {
        self.inner.enabled.set(true);

        WithStore {
            future: Box::pin(future),
            storage: self.inner.clone(),
            value: Some(value),
        }
    }

    /// Spawns `future` onto the current `LocalSet` as part of the current
    /// chain.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a `LocalSet`, like
    /// `tokio::task::spawn_local` does.
    pub fn spawn_local<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        tokio::task::spawn_local(self.bind(future))
    }

    /// Starts handing out values without installing one.
    pub fn enable(&self) {
        self.inner.enabled.set(true);
    }

    /// Stops handing out values until the next `enable`, `run` or
    /// `enter_with`.
    pub fn disable(&self) {
        self.inner.enabled.set(false);
        self.inner.current.replace(None);
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.get()
    }
}

/// A future that runs as part of a particular chain.
///
/// Created by [`AsyncLocalStorage::bind`] and [`AsyncLocalStorage::scope`].
/// The chain's value is installed for the duration of each poll. If the
/// future replaces the value (via `enter_with`) the replacement is carried to
/// its next poll, but it never leaks into whoever is polling it.
#[must_use = "futures do nothing unless polled"]
pub struct WithStore<F, T> {
    future: Pin<Box<F>>,
    storage: Rc<StorageInner<T>>,
    value: Option<T>,
}

// the inner future is boxed and `value` is never pinned
impl<F, T> Unpin for WithStore<F, T> {}

impl<F: Future, T> Future for WithStore<F, T> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<F::Output> {
        let WithStore {
            future,
            storage,
            value,
        } = self.get_mut();

        // swap even while disabled, `get_store` hides the value then but a
        // store entered during the poll must stay with this future
        let _guard = ScopeGuard::enter_for_poll(&storage.current, value);
        future.as_mut().poll(cx)
    }
}

/// Swaps a value into the slot and swaps the previous one back on drop.
///
/// When entered for a poll, whatever the slot holds at the end is handed back
/// to the owning future so changes made during the poll are not lost.
struct ScopeGuard<'a, T> {
    slot: &'a RefCell<Option<T>>,
    previous: Option<T>,
    write_back: Option<&'a mut Option<T>>,
}

impl<'a, T> ScopeGuard<'a, T> {
    fn enter(slot: &'a RefCell<Option<T>>, value: Option<T>) -> ScopeGuard<'a, T> {
        let previous = slot.replace(value);

        ScopeGuard {
            slot,
            previous,
            write_back: None,
        }
    }

    fn enter_for_poll(
        slot: &'a RefCell<Option<T>>,
        value: &'a mut Option<T>,
    ) -> ScopeGuard<'a, T> {
        let previous = slot.replace(value.take());

        ScopeGuard {
            slot,
            previous,
            write_back: Some(value),
        }
    }
}

impl<T> Drop for ScopeGuard<'_, T> {
    fn drop(&mut self) {
        let last = self.slot.replace(self.previous.take());

        if let Some(write_back) = self.write_back.take() {
            *write_back = last;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use std::time::Duration;

    use tokio::sync::oneshot;
    use tokio::task::LocalSet;

    use super::*;

    #[test]
    fn empty_until_something_runs() {
        let storage = AsyncLocalStorage::<u32>::new();

        assert_eq!(storage.get_store(), None);
        assert!(!storage.is_enabled());

        storage.run(1, || assert_eq!(storage.get_store(), Some(1)));

        assert!(storage.is_enabled());
        assert_eq!(storage.get_store(), None);
    }

    #[test]
    fn run_nests_and_restores() {
        let storage = AsyncLocalStorage::new();

        storage.run("outer", || {
            storage.run("inner", || {
                assert_eq!(storage.get_store(), Some("inner"));
            });
            assert_eq!(storage.get_store(), Some("outer"));

            storage.exit(|| assert_eq!(storage.get_store(), None));
            assert_eq!(storage.get_store(), Some("outer"));
        });
    }

    #[test]
    fn run_restores_after_a_panic() {
        let storage = AsyncLocalStorage::new();
        storage.enter_with("before");

        let result = catch_unwind(AssertUnwindSafe(|| {
            storage.run("during", || panic!("handler failed"))
        }));

        assert!(result.is_err());
        assert_eq!(storage.get_store(), Some("before"));
    }

    #[test]
    fn enter_with_inside_run_ends_with_the_run() {
        let storage = AsyncLocalStorage::new();

        storage.run("outer", || {
            storage.enter_with("replaced");
            assert_eq!(storage.get_store(), Some("replaced"));
        });

        assert_eq!(storage.get_store(), None);
    }

    #[test]
    fn disable_clears_until_reentered() {
        let storage = AsyncLocalStorage::new();
        storage.enter_with(1);

        storage.disable();
        storage.disable();
        assert_eq!(storage.get_store(), None);

        storage.run(2, || assert_eq!(storage.get_store(), Some(2)));
    }

    #[tokio::test]
    async fn bound_future_keeps_its_value_across_polls() {
        let storage = AsyncLocalStorage::new();

        let future = storage.run("bound", || {
            let storage = storage.clone();
            storage.clone().bind(async move {
                assert_eq!(storage.get_store(), Some("bound"));
                tokio::task::yield_now().await;
                assert_eq!(storage.get_store(), Some("bound"));

                storage.enter_with("changed");
                tokio::task::yield_now().await;
                storage.get_store()
            })
        });

        // polled from outside of any chain
        let observed = future.await;

        assert_eq!(observed, Some("changed"));
        assert_eq!(storage.get_store(), None);
    }

    #[tokio::test]
    async fn spawned_work_inherits_through_several_hops() {
        let local = LocalSet::new();

        local
            .run_until(async {
                let storage = AsyncLocalStorage::new();
                let (sender, receiver) = oneshot::channel::<()>();

                let handle = storage.run("A", || {
                    let storage = storage.clone();
                    storage.clone().spawn_local(async move {
                        receiver.await.unwrap();

                        let nested = storage.clone();
                        storage
                            .spawn_local(async move {
                                tokio::time::sleep(Duration::from_millis(1)).await;
                                nested.get_store()
                            })
                            .await
                            .unwrap()
                    })
                });

                assert_eq!(storage.get_store(), None);
                storage.run("B", || sender.send(()).unwrap());

                assert_eq!(handle.await.unwrap(), Some("A"));
            })
            .await;
    }

    #[tokio::test]
    async fn unbound_spawns_are_outside_any_chain() {
        let local = LocalSet::new();

        local
            .run_until(async {
                let storage = AsyncLocalStorage::new();

                let handle = storage.run("A", || {
                    let storage = storage.clone();
                    tokio::task::spawn_local(async move { storage.get_store() })
                });

                assert_eq!(handle.await.unwrap(), None);
            })
            .await;
    }

    #[tokio::test]
    async fn enter_with_before_any_run_stays_in_the_future() {
        let storage = AsyncLocalStorage::new();
        assert!(!storage.is_enabled());

        let in_future = storage.clone();
        let observed = storage
            .bind(async move {
                in_future.enter_with("own");
                tokio::task::yield_now().await;
                in_future.get_store()
            })
            .await;

        assert_eq!(observed, Some("own"));
        assert_eq!(storage.get_store(), None);
    }

    #[tokio::test]
    async fn bound_future_polled_after_disable_does_not_leak() {
        let storage = AsyncLocalStorage::new();

        let in_future = storage.clone();
        let future = storage.run("bound", || {
            storage.bind(async move {
                let hidden = in_future.get_store();
                in_future.enter_with("replaced");
                tokio::task::yield_now().await;
                (hidden, in_future.get_store())
            })
        });

        storage.disable();
        let (hidden, after_await) = future.await;

        assert_eq!(hidden, None);
        assert_eq!(after_await, Some("replaced"));
        assert_eq!(storage.get_store(), None);
    }

    #[test]
    fn dropping_a_bound_future_leaves_the_slot_alone() {
        let storage = AsyncLocalStorage::new();
        storage.enter_with("outer");

        let future = storage.scope("scoped", async { 1 });
        drop(future);

        assert_eq!(storage.get_store(), Some("outer"));
    }
}
