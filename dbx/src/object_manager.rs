//! `org.freedesktop.DBus.ObjectManager` for a subtree of objects.
//!
//! Objects are published below a root path. Relative paths (`./disk0`)
//! resolve against the root; absolute paths must already lie inside it.
//! Every publish and unpublish is announced with `InterfacesAdded` or
//! `InterfacesRemoved` emitted from the root.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use dbx_proto::{Body, Encoder, Message, ObjectPath, Signature};

use crate::connection::Connection;
use crate::error::{Error, MethodError, Result};
use crate::handler::ObjectHandler;
use crate::properties::PROPERTIES_INTERFACE;
use crate::registry::ObjectRegistration;

/// The object manager interface.
pub const OBJECT_MANAGER_INTERFACE: &str = "org.freedesktop.DBus.ObjectManager";

/// Interfaces exported at one managed path.
struct Published {
    /// Handlers, in publish order.
    handlers: Vec<Arc<dyn ObjectHandler>>,
    /// Keeps the handlers exported.
    registrations: Vec<ObjectRegistration>,
}

/// State shared by a manager and its exported handler.
struct Shared {
    /// Connection the objects are exported on.
    conn: Connection,
    /// Root of the managed subtree.
    root: ObjectPath,
    /// Managed objects by path.
    objects: Mutex<BTreeMap<ObjectPath, Published>>,
}

/// Locks `m`, ignoring poisoning.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Publishes objects under a root and answers `GetManagedObjects` there.
///
/// Dropping the manager unexports it and every object it published.
pub struct ObjectManager {
    /// State shared with the exported handler.
    shared: Arc<Shared>,
    /// The manager's own interface at the root.
    _registration: ObjectRegistration,
}

impl fmt::Debug for ObjectManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectManager")
            .field("root", &self.shared.root)
            .field("objects", &lock(&self.shared.objects).len())
            .finish_non_exhaustive()
    }
}

impl ObjectManager {
    /// Exports an object manager at `root` on `conn`.
    pub fn new(conn: &Connection, root: ObjectPath) -> Result<Self> {
        let shared = Arc::new(Shared {
            conn: conn.clone(),
            root,
            objects: Mutex::new(BTreeMap::new()),
        });
        let handler = ManagerHandler {
            shared: Arc::downgrade(&shared),
        };
        let registration = conn.register_object(&shared.root, Arc::new(handler))?;
        Ok(Self {
            shared,
            _registration: registration,
        })
    }

    /// Root of the managed subtree.
    pub fn root(&self) -> &ObjectPath {
        &self.shared.root
    }

    /// Currently managed paths, sorted.
    pub fn paths(&self) -> Vec<ObjectPath> {
        lock(&self.shared.objects).keys().cloned().collect()
    }

    /// Exports `handlers` at `path` and emits `InterfacesAdded`.
    ///
    /// Either every handler is registered or none is. Publishing again at a
    /// managed path adds the new interfaces to it.
    pub async fn publish(&self, path: &str, handlers: Vec<Arc<dyn ObjectHandler>>) -> Result<ObjectPath> {
        let path = resolve(&self.shared.root, path)?;
        if handlers.is_empty() {
            return Err(Error::InvalidArgument(format!("nothing to publish at {path}")));
        }
        let registrations = handlers
            .iter()
            .map(|h| self.shared.conn.register_object(&path, Arc::clone(h)))
            .collect::<Result<Vec<_>>>()?;

        let mut enc = Encoder::new();
        enc.add_object_path(&path);
        encode_interfaces(&mut enc, &handlers, false)?;
        let body = enc.finish(Signature::new("oa{sa{sv}}")?);

        {
            let mut objects = lock(&self.shared.objects);
            let entry = objects.entry(path.clone()).or_insert_with(|| Published {
                handlers: Vec::new(),
                registrations: Vec::new(),
            });
            entry.handlers.extend(handlers);
            entry.registrations.extend(registrations);
        }
        tracing::debug!(%path, root = %self.shared.root, "published object");

        self.shared
            .conn
            .emit_signal(&self.shared.root, OBJECT_MANAGER_INTERFACE, "InterfacesAdded", body)
            .await?;
        Ok(path)
    }

    /// Unexports everything at `path` and emits `InterfacesRemoved`.
    ///
    /// Returns `false` if nothing was published there.
    pub async fn unpublish(&self, path: &str) -> Result<bool> {
        let path = resolve(&self.shared.root, path)?;
        let Some(published) = lock(&self.shared.objects).remove(&path) else {
            return Ok(false);
        };
        let interfaces: Vec<String> = published
            .registrations
            .iter()
            .map(|r| r.interface().to_owned())
            .collect();
        drop(published);
        tracing::debug!(%path, root = %self.shared.root, "unpublished object");

        let mut enc = Encoder::new();
        enc.add_object_path(&path);
        enc.add_array(4, |e| interfaces.iter().try_for_each(|name| e.add_str(name)))?;
        let body = enc.finish(Signature::new("oas")?);
        self.shared
            .conn
            .emit_signal(&self.shared.root, OBJECT_MANAGER_INTERFACE, "InterfacesRemoved", body)
            .await?;
        Ok(true)
    }
}

/// Resolves a publish path against `root`.
fn resolve(root: &ObjectPath, path: &str) -> Result<ObjectPath> {
    if let Some(rel) = path.strip_prefix("./") {
        return Ok(root.join(rel)?);
    }
    let abs = ObjectPath::new(path)?;
    if root.is_ancestor_of(&abs) {
        Ok(abs)
    } else {
        Err(Error::InvalidArgument(format!("{abs} is outside {root}")))
    }
}

/// Writes `a{sa{sv}}`: each handler's interface and full property set.
fn encode_interfaces(
    enc: &mut Encoder,
    handlers: &[Arc<dyn ObjectHandler>],
    with_properties: bool,
) -> dbx_proto::Result<()> {
    enc.add_dict(|e| {
        for handler in handlers {
            e.add_dict_entry(|e| {
                e.add_str(handler.interface())?;
                e.add_dict(|e| handler.encode_properties(e))
            })?;
        }
        if with_properties {
            e.add_dict_entry(|e| {
                e.add_str(PROPERTIES_INTERFACE)?;
                e.add_dict(|_| Ok(()))
            })?;
        }
        Ok(())
    })
}

/// The manager's interface at the root.
struct ManagerHandler {
    /// Weak, so the registry does not keep the manager alive.
    shared: Weak<Shared>,
}

impl ManagerHandler {
    /// Encodes the `GetManagedObjects` reply.
    fn managed_objects(&self) -> std::result::Result<Body, MethodError> {
        let shared = self
            .shared
            .upgrade()
            .ok_or_else(|| MethodError::failed("object manager is gone"))?;
        let objects = lock(&shared.objects);
        let mut enc = Encoder::new();
        enc.add_dict(|e| {
            objects.iter().try_for_each(|(path, published)| {
                e.add_dict_entry(|e| {
                    e.add_object_path(path);
                    encode_interfaces(e, &published.handlers, true)
                })
            })
        })?;
        Ok(enc.finish(Signature::new("a{oa{sa{sv}}}")?))
    }
}

#[async_trait]
impl ObjectHandler for ManagerHandler {
    fn interface(&self) -> &str {
        OBJECT_MANAGER_INTERFACE
    }

    async fn handle_method_call(&self, call: &Message) -> std::result::Result<Body, MethodError> {
        match call.member().unwrap_or_default() {
            "GetManagedObjects" => {
                call.read_args::<()>()?;
                self.managed_objects()
            }
            other => Err(MethodError::unknown_method(OBJECT_MANAGER_INTERFACE, other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(p: &str) -> ObjectPath {
        ObjectPath::new(p).unwrap()
    }

    #[test]
    fn relative_paths_resolve_against_root() {
        assert_eq!(resolve(&path("/org/example"), "./disk0").unwrap(), path("/org/example/disk0"));
        assert_eq!(resolve(&ObjectPath::root(), "./disk0").unwrap(), path("/disk0"));
        assert_eq!(
            resolve(&path("/org/example"), "./a/b").unwrap(),
            path("/org/example/a/b")
        );
    }

    #[test]
    fn absolute_paths_must_stay_inside_root() {
        let root = path("/org/example");
        assert_eq!(resolve(&root, "/org/example/disk1").unwrap(), path("/org/example/disk1"));
        assert!(matches!(resolve(&root, "/org/other"), Err(Error::InvalidArgument(_))));
        assert!(matches!(resolve(&root, "/org/examples"), Err(Error::InvalidArgument(_))));
        assert!(matches!(resolve(&root, "disk"), Err(Error::Protocol(_))));
    }

    #[test]
    fn empty_handler_list_still_lists_properties_interface() {
        let mut enc = Encoder::new();
        encode_interfaces(&mut enc, &[], true).unwrap();
        let body = enc.finish(Signature::new("a{sa{sv}}").unwrap());
        let msg = Message::method_call(ObjectPath::root(), "x").with_body(body);
        let (ifaces,): (crate::properties::InterfaceProperties,) = msg.read_args().unwrap();
        assert_eq!(ifaces.len(), 1);
        assert!(ifaces[PROPERTIES_INTERFACE].is_empty());
    }
}
