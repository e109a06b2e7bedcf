//! The manual-propagation strategy.
//!
//! A single slot holds the current context and `run_with_context` swaps it in
//! and back out around the call. Nothing follows work onto the scheduler: a
//! continuation spawned from inside `run_with_context` sees whatever happens
//! to be in the slot when it eventually runs. Callers that need a context to
//! survive a scheduler hop must capture it when scheduling and re-enter it
//! with another `run_with_context` when the continuation fires.

use std::cell::{Cell, RefCell};
use std::future::Future;

use tokio::task::JoinHandle;
use tracing::debug;

use crate::context::Context;
use crate::manager::{ContextManager, ManagerState};

pub struct LegacyContextManager {
    default_context: Context,
    current: RefCell<Context>,
    state: Cell<ManagerState>,
}

impl LegacyContextManager {
    #[allow(clippy::new_without_default)]
    pub fn new() -> LegacyContextManager {
        LegacyContextManager {
            default_context: Context::default(),
            current: RefCell::new(Context::default()),
            state: Cell::new(ManagerState::Uninitialized),
        }
    }
}

impl ContextManager for LegacyContextManager {
    fn get_context(&self) -> Context {
        self.current.borrow().clone()
    }

    fn set_context(&self, context: Context) {
        *self.current.borrow_mut() = context;
    }

    fn run_with_context<F, R>(&self, context: Context, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let _restore = RestoreGuard::install(&self.current, context);
        f()
    }

    fn spawn_local<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        tokio::task::spawn_local(future)
    }

    fn enable(&self) {
        if self.state.replace(ManagerState::Enabled) != ManagerState::Enabled {
            debug!("enabled legacy context manager");
        }
    }

    fn disable(&self) {
        if self.state.replace(ManagerState::Disabled) != ManagerState::Disabled {
            debug!("disabled legacy context manager");
        }

        *self.current.borrow_mut() = self.default_context.clone();
    }

    fn state(&self) -> ManagerState {
        self.state.get()
    }
}

/// Puts the saved context back into the slot when dropped, including while
/// unwinding.
struct RestoreGuard<'a> {
    slot: &'a RefCell<Context>,
    saved: Option<Context>,
}

impl<'a> RestoreGuard<'a> {
    fn install(slot: &'a RefCell<Context>, context: Context) -> RestoreGuard<'a> {
        let saved = slot.replace(context);

        RestoreGuard {
            slot,
            saved: Some(saved),
        }
    }
}

impl Drop for RestoreGuard<'_> {
    fn drop(&mut self) {
        if let Some(saved) = self.saved.take() {
            *self.slot.borrow_mut() = saved;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use std::rc::Rc;
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::oneshot;
    use tokio::task::LocalSet;

    use super::*;

    fn named(name: &'static str) -> Context {
        Context::with_segment(Arc::new(name))
    }

    fn name_of(context: &Context) -> Option<&'static str> {
        context
            .segment()
            .and_then(|segment| segment.downcast_ref::<&'static str>())
            .copied()
    }

    #[test]
    fn starts_with_the_default_context() {
        let manager = LegacyContextManager::new();

        assert_eq!(manager.get_context(), Context::default());
        assert_eq!(manager.state(), ManagerState::Uninitialized);
    }

    #[test]
    fn set_context_is_permanent() {
        let manager = LegacyContextManager::new();
        let context = named("A");

        manager.set_context(context.clone());
        assert_eq!(manager.get_context(), context);

        manager.run_with_context(named("B"), || {});
        assert_eq!(manager.get_context(), context);
    }

    #[test]
    fn nested_runs_restore_in_order() {
        let manager = LegacyContextManager::new();
        let outer = named("outer");
        let inner = named("inner");

        manager.run_with_context(outer.clone(), || {
            assert_eq!(manager.get_context(), outer);

            manager.run_with_context(inner.clone(), || {
                assert_eq!(manager.get_context(), inner);
            });

            assert_eq!(manager.get_context(), outer);
        });

        assert_eq!(manager.get_context(), Context::default());
    }

    #[test]
    fn returns_the_handler_result() {
        let manager = LegacyContextManager::new();

        let value = manager.run_with_context(named("A"), || 42);

        assert_eq!(value, 42);
    }

    #[test]
    fn restores_after_an_error_result() {
        let manager = LegacyContextManager::new();
        let before = named("before");
        manager.set_context(before.clone());

        let result: Result<(), &str> = manager.run_with_context(named("A"), || {
            let value: Result<u32, &str> = Err("boom");
            value?;
            Ok(())
        });

        assert_eq!(result, Err("boom"));
        assert_eq!(manager.get_context(), before);
    }

    #[test]
    fn restores_after_a_panic() {
        let manager = LegacyContextManager::new();
        let before = named("before");
        manager.set_context(before.clone());

        let result = catch_unwind(AssertUnwindSafe(|| {
            manager.run_with_context(named("A"), || panic!("handler failed"))
        }));

        assert!(result.is_err());
        assert_eq!(manager.get_context(), before);
    }

    #[test]
    fn set_context_inside_run_is_rolled_back() {
        let manager = LegacyContextManager::new();

        manager.run_with_context(named("A"), || {
            manager.set_context(named("B"));
            assert_eq!(name_of(&manager.get_context()), Some("B"));
        });

        assert_eq!(manager.get_context(), Context::default());
    }

    #[test]
    fn apply_binds_receiver_and_arguments() {
        let manager = LegacyContextManager::new();

        let total = manager.apply_with_context(
            named("A"),
            |this: &LegacyContextManager, (a, b): (u32, u32)| {
                assert_eq!(name_of(&this.get_context()), Some("A"));
                a + b
            },
            &manager,
            (1, 2),
        );

        assert_eq!(total, 3);
    }

    #[test]
    fn disable_is_idempotent_and_resets() {
        let manager = LegacyContextManager::new();
        manager.enable();
        manager.enable();
        assert_eq!(manager.state(), ManagerState::Enabled);

        manager.set_context(named("A"));
        manager.disable();
        manager.disable();

        assert_eq!(manager.state(), ManagerState::Disabled);
        assert_eq!(manager.get_context(), Context::default());
    }

    #[tokio::test]
    async fn continuations_do_not_inherit_the_context() {
        let local = LocalSet::new();

        local
            .run_until(async {
                let manager = Rc::new(LegacyContextManager::new());
                let (sender, receiver) = oneshot::channel();

                let handle = manager.run_with_context(named("A"), || {
                    let manager = manager.clone();
                    manager.clone().spawn_local(async move {
                        receiver.await.unwrap();
                        manager.get_context()
                    })
                });

                // the deferred completion is resolved from an unrelated flow
                manager.set_context(named("unrelated"));
                sender.send(()).unwrap();

                let observed = handle.await.unwrap();
                assert_eq!(name_of(&observed), Some("unrelated"));
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn timers_observe_the_context_at_invocation() {
        let local = LocalSet::new();

        local
            .run_until(async {
                let manager = Rc::new(LegacyContextManager::new());
                let observed = Rc::new(RefCell::new(None));

                let handle = manager.run_with_context(named("A"), || {
                    let manager_in_timer = manager.clone();
                    let observed = observed.clone();
                    manager.set_timeout(Duration::from_millis(10), move || {
                        *observed.borrow_mut() = Some(manager_in_timer.get_context());
                    })
                });

                handle.await.unwrap();
                assert_eq!(observed.borrow().clone(), Some(Context::default()));
            })
            .await;
    }

    #[tokio::test]
    async fn manual_capture_survives_a_hop() {
        let local = LocalSet::new();

        local
            .run_until(async {
                let manager = Rc::new(LegacyContextManager::new());

                let handle = manager.run_with_context(named("A"), || {
                    let captured = manager.get_context();
                    let manager_in_callback = manager.clone();
                    manager.defer(move || {
                        let inner = manager_in_callback.clone();
                        manager_in_callback.run_with_context(captured, move || {
                            assert_eq!(name_of(&inner.get_context()), Some("A"));
                        });
                    })
                });

                handle.await.unwrap();
                assert_eq!(manager.get_context(), Context::default());
            })
            .await;
    }
}
