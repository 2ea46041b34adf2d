//! Exported objects and signal subscribers.
//!
//! Objects are keyed `path\0interface` with at most one handler per key.
//! Signal subscribers are keyed `path\0interface\0member` and hold a list
//! of `(id, handler)` pairs. Both maps are updated with single per-key
//! operations, so concurrent registration and removal never lose entries.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use dbx_proto::{Message, ObjectPath};

use crate::error::{Error, MethodError, Result, names};
use crate::handler::{ObjectHandler, SignalHandler};

fn object_key(path: &str, interface: &str) -> String {
    format!("{path}\0{interface}")
}

fn signal_key(path: &str, interface: &str, member: &str) -> String {
    format!("{path}\0{interface}\0{member}")
}

#[derive(Default)]
struct Inner {
    /// `path\0interface` → handler.
    objects: DashMap<String, Arc<dyn ObjectHandler>>,
    /// `path\0interface\0member` → subscribers.
    signals: DashMap<String, Vec<(u64, SignalHandler)>>,
    /// Source of subscriber ids.
    next_id: AtomicU64,
}

/// Shared table of exported objects and signal subscribers.
#[derive(Clone, Default)]
pub struct Registry {
    /// Shared state; registrations hold a weak reference to it.
    inner: Arc<Inner>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("objects", &self.inner.objects.len())
            .field("signals", &self.inner.signals.len())
            .finish()
    }
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Exports `handler` at `path` under its interface name.
    ///
    /// Fails with [`Error::AlreadyRegistered`] if the pair is taken. The
    /// entry is removed when the returned registration is dropped.
    pub fn register(&self, path: &ObjectPath, handler: Arc<dyn ObjectHandler>) -> Result<ObjectRegistration> {
        let interface = handler.interface().to_owned();
        let key = object_key(path.as_str(), &interface);
        match self.inner.objects.entry(key.clone()) {
            Entry::Occupied(_) => Err(Error::AlreadyRegistered {
                path: path.to_string(),
                interface,
            }),
            Entry::Vacant(slot) => {
                slot.insert(handler);
                tracing::debug!(%path, interface = interface.as_str(), "registered object");
                Ok(ObjectRegistration {
                    registry: Arc::downgrade(&self.inner),
                    key,
                    path: path.clone(),
                    interface,
                })
            }
        }
    }

    /// Handler for `interface` at `path`.
    pub fn handler(&self, path: &str, interface: &str) -> Option<Arc<dyn ObjectHandler>> {
        self.inner
            .objects
            .get(&object_key(path, interface))
            .map(|h| Arc::clone(h.value()))
    }

    /// Handler for a call, or the error reply naming what is missing.
    pub(crate) fn resolve(&self, path: &str, interface: &str) -> std::result::Result<Arc<dyn ObjectHandler>, MethodError> {
        if let Some(handler) = self.handler(path, interface) {
            return Ok(handler);
        }
        if self.handlers_at(path).is_empty() {
            Err(MethodError::new(names::TARGET_NOT_FOUND, format!("no object at {path}")))
        } else {
            Err(MethodError::new(
                names::UNKNOWN_INTERFACE,
                format!("object {path} does not implement {interface}"),
            ))
        }
    }

    /// Every handler exported at `path`, in no particular order.
    pub fn handlers_at(&self, path: &str) -> Vec<Arc<dyn ObjectHandler>> {
        let prefix = format!("{path}\0");
        self.inner
            .objects
            .iter()
            .filter(|e| e.key().starts_with(&prefix))
            .map(|e| Arc::clone(e.value()))
            .collect()
    }

    /// Adds a subscriber for signals matching the triple exactly.
    ///
    /// Dropping the returned subscription removes only this subscriber.
    pub fn subscribe(&self, path: &str, interface: &str, member: &str, handler: SignalHandler) -> SignalSubscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let key = signal_key(path, interface, member);
        self.inner.signals.entry(key.clone()).or_default().push((id, handler));
        SignalSubscription {
            registry: Arc::downgrade(&self.inner),
            key,
            id,
            on_drop: None,
        }
    }

    /// Number of subscribers for a triple.
    pub fn subscribers(&self, path: &str, interface: &str, member: &str) -> usize {
        self.inner
            .signals
            .get(&signal_key(path, interface, member))
            .map_or(0, |list| list.len())
    }

    /// Runs every subscriber matching `msg`; returns how many ran.
    ///
    /// The list is copied out first so handlers may subscribe or
    /// unsubscribe without deadlocking.
    pub fn dispatch_signal(&self, msg: &Message) -> usize {
        let (Some(path), Some(interface), Some(member)) = (msg.path(), msg.interface(), msg.member()) else {
            return 0;
        };
        let handlers: Vec<SignalHandler> = match self.inner.signals.get(&signal_key(path.as_str(), interface, member)) {
            Some(list) => list.iter().map(|(_, h)| Arc::clone(h)).collect(),
            None => return 0,
        };
        for handler in &handlers {
            handler(msg);
        }
        handlers.len()
    }
}

/// Keeps an exported object alive; dropping it unexports the object.
#[must_use = "dropping the registration unexports the object"]
pub struct ObjectRegistration {
    /// Registry the entry lives in.
    registry: Weak<Inner>,
    /// `path\0interface`.
    key: String,
    /// Object path.
    path: ObjectPath,
    /// Interface name.
    interface: String,
}

impl ObjectRegistration {
    /// Object path.
    pub const fn path(&self) -> &ObjectPath {
        &self.path
    }

    /// Interface name.
    pub fn interface(&self) -> &str {
        &self.interface
    }
}

impl fmt::Debug for ObjectRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectRegistration")
            .field("path", &self.path)
            .field("interface", &self.interface)
            .finish()
    }
}

impl Drop for ObjectRegistration {
    fn drop(&mut self) {
        if let Some(inner) = self.registry.upgrade() {
            inner.objects.remove(&self.key);
            tracing::debug!(path = %self.path, interface = self.interface.as_str(), "unregistered object");
        }
    }
}

/// Keeps a signal subscriber alive; dropping it unsubscribes.
#[must_use = "dropping the subscription unsubscribes"]
pub struct SignalSubscription {
    /// Registry the subscriber lives in.
    registry: Weak<Inner>,
    /// `path\0interface\0member`.
    key: String,
    /// Subscriber id within the key's list.
    id: u64,
    /// Extra cleanup, such as removing a bus match rule.
    on_drop: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl SignalSubscription {
    /// Runs `f` after the subscriber is removed.
    pub(crate) fn set_on_drop(&mut self, f: impl FnOnce() + Send + Sync + 'static) {
        self.on_drop = Some(Box::new(f));
    }

    /// Removes the subscriber now.
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl fmt::Debug for SignalSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalSubscription")
            .field("key", &self.key.replace('\0', " "))
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl Drop for SignalSubscription {
    fn drop(&mut self) {
        if let Some(inner) = self.registry.upgrade() {
            let id = self.id;
            inner.signals.remove_if_mut(&self.key, |_, list| {
                list.retain(|(i, _)| *i != id);
                list.is_empty()
            });
        }
        if let Some(f) = self.on_drop.take() {
            f();
        }
    }
}
