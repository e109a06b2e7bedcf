use super::AsyncLocalStorage;

/// Remembers the chain that was current when it was created.
///
/// Useful for objects whose callbacks are invoked later, possibly many times,
/// from wherever the object happens to be driven. Each `run_in_scope` call
/// re-enters the remembered chain. A resource created outside of any chain
/// runs its callbacks outside of any chain too, there is nothing to inherit.
#[derive(Debug, Clone)]
pub struct AsyncResource<T> {
    storage: AsyncLocalStorage<T>,
    captured: Option<T>,
}

impl<T: Clone + 'static> AsyncResource<T> {
    pub fn new(storage: &AsyncLocalStorage<T>) -> AsyncResource<T> {
        AsyncResource {
            storage: storage.clone(),
            captured: storage.get_store(),
        }
    }

    pub fn captured(&self) -> Option<&T> {
        self.captured.as_ref()
    }

    pub fn run_in_scope<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        match &self.captured {
            Some(value) => self.storage.run(value.clone(), f),
            None => self.storage.exit(f),
        }
    }
}
