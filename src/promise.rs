/// Settable-once completion cell
///
/// Every asynchronous result in the crate (write, close, session requests) is a
/// `Promise`. It can be cloned freely, completed exactly once from any thread,
/// observed through callbacks or awaited from async code.

use std::fmt;
use std::future::IntoFuture;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::watch;

type Callback<T> = Box<dyn FnOnce(&T) + Send>;

struct Slot<T> {
    value: Option<T>,
    callbacks: Vec<Callback<T>>,
}

struct Inner<T> {
    slot: Mutex<Slot<T>>,
    done: watch::Sender<bool>,
}

pub struct Promise<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + 'static> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> Promise<T> {
    /// Create a pending promise
    pub fn new() -> Self {
        let (done, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                slot: Mutex::new(Slot {
                    value: None,
                    callbacks: Vec::new(),
                }),
                done,
            }),
        }
    }

    /// Create an already completed promise
    pub fn ready(value: T) -> Self {
        let promise = Self::new();
        promise.set(value);
        promise
    }

    /// Complete the promise. Returns false if it was already completed.
    ///
    /// Callbacks run on the calling thread after the internal lock is released.
    pub fn set(&self, value: T) -> bool {
        let callbacks = {
            let mut slot = self.inner.slot.lock();
            if slot.value.is_some() {
                return false;
            }
            slot.value = Some(value.clone());
            std::mem::take(&mut slot.callbacks)
        };
        self.inner.done.send_replace(true);
        for callback in callbacks {
            callback(&value);
        }
        true
    }

    pub fn is_done(&self) -> bool {
        self.inner.slot.lock().value.is_some()
    }

    pub fn try_get(&self) -> Option<T> {
        self.inner.slot.lock().value.clone()
    }

    /// Run `callback` on completion, or right now if already completed
    pub fn add_listener<F>(&self, callback: F)
    where
        F: FnOnce(&T) + Send + 'static,
    {
        let mut slot = self.inner.slot.lock();
        if let Some(value) = slot.value.clone() {
            drop(slot);
            callback(&value);
            return;
        }
        slot.callbacks.push(Box::new(callback));
    }

    /// Wait for completion
    pub async fn wait(&self) -> T {
        let mut done = self.inner.done.subscribe();
        loop {
            if let Some(value) = self.try_get() {
                return value;
            }
            // the sender lives as long as `self`, so this never errors
            let _ = done.changed().await;
        }
    }

    /// Whether two handles refer to the same promise
    pub fn ptr_eq(&self, other: &Promise<T>) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T: Clone + Send + Sync + 'static> IntoFuture for Promise<T> {
    type Output = T;
    type IntoFuture = BoxFuture<'static, T>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move { self.wait().await })
    }
}

impl<T: fmt::Debug> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slot = self.inner.slot.lock();
        match &slot.value {
            Some(value) => f.debug_tuple("Promise").field(value).finish(),
            None => f.write_str("Promise(<pending>)"),
        }
    }
}
