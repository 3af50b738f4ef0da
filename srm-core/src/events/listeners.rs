//! Synchronous callback registries
//!
//! A [`Listeners`] holds callbacks for one kind of event. Registering a
//! callback returns a [`Listener`] token, the callback stays registered for as
//! long as the token is alive.

use std::sync::{Arc, Mutex, Weak};

use slotmap::{DefaultKey, SlotMap};

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Inner<E> {
    callbacks: SlotMap<DefaultKey, Callback<E>>,
    /// Keys in registration order.
    order:     Vec<DefaultKey>,
}

/// A set of callbacks interested in events of type `E`.
pub struct Listeners<E> {
    inner: Arc<Mutex<Inner<E>>>,
}

impl<E> Default for Listeners<E> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                callbacks: SlotMap::new(),
                order:     Vec::new(),
            })),
        }
    }
}

impl<E> std::fmt::Debug for Listeners<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listeners")
            .field("count", &self.len())
            .finish()
    }
}

impl<E: 'static> Listeners<E> {
    /// Register a callback. It is removed when the returned [`Listener`] is
    /// dropped.
    #[must_use = "the callback is unregistered when the Listener is dropped"]
    pub fn add(&self, callback: impl Fn(&E) + Send + Sync + 'static) -> Listener {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let key = inner.callbacks.insert(Arc::new(callback));
        inner.order.push(key);
        let registry: Weak<Mutex<Inner<E>>> = Arc::downgrade(&self.inner);
        Listener {
            remove: Some(Box::new(move || {
                if let Some(registry) = registry.upgrade() {
                    let mut inner = registry.lock().unwrap_or_else(|e| e.into_inner());
                    inner.callbacks.remove(key);
                    inner.order.retain(|k| *k != key);
                }
            })),
        }
    }

    /// Call every registered callback, in registration order.
    ///
    /// The registry is not locked while the callbacks run, so a callback may
    /// add or drop listeners. Such changes take effect from the next
    /// notification.
    pub fn notify(&self, event: &E) {
        let callbacks: Vec<Callback<E>> = {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner
                .order
                .iter()
                .filter_map(|k| inner.callbacks.get(*k).cloned())
                .collect()
        };
        for callback in callbacks {
            callback(event);
        }
    }
}

impl<E> Listeners<E> {
    /// Number of registered callbacks.
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .callbacks
            .len()
    }

    /// Whether no callback is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Registration token of a callback. Dropping it unregisters the callback.
pub struct Listener {
    remove: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener").finish_non_exhaustive()
    }
}

impl Listener {
    /// Keep the callback registered for the lifetime of the registry.
    pub fn forget(mut self) {
        self.remove.take();
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}
