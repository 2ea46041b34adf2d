//! `org.freedesktop.DBus.Properties`, served from the registry, plus
//! client helpers for reading and writing remote properties.

use std::collections::{BTreeMap, HashMap};

use dbx_proto::{Body, Encoder, Message, ObjectPath, Signature, Value};

use crate::connection::Connection;
use crate::error::{MethodError, Result};
use crate::registry::Registry;

/// The properties interface.
pub const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";

/// Interfaces of one object, each with its properties.
pub type InterfaceProperties = BTreeMap<String, BTreeMap<String, Value>>;

/// Reply of `GetManagedObjects`.
pub type ManagedObjects = BTreeMap<ObjectPath, InterfaceProperties>;

/// Answers a `Get`, `GetAll` or `Set` call for an exported object.
pub(crate) async fn serve(registry: &Registry, call: &Message, member: &str) -> std::result::Result<Body, MethodError> {
    let path = call.path().map_or("/", ObjectPath::as_str);
    match member {
        "Get" => {
            let (interface, name): (String, String) = call.read_args()?;
            let handler = registry.resolve(path, &interface)?;
            let mut enc = Encoder::new();
            if !handler.encode_property(&name, &mut enc)? {
                return Err(MethodError::unknown_property(&interface, &name));
            }
            Ok(enc.finish(Signature::new("v")?))
        }
        "GetAll" => {
            let (interface,): (String,) = call.read_args()?;
            // An empty interface name asks for every interface at the path.
            let handlers = if interface.is_empty() {
                registry.handlers_at(path)
            } else {
                vec![registry.resolve(path, &interface)?]
            };
            let mut enc = Encoder::new();
            enc.add_dict(|e| handlers.iter().try_for_each(|h| h.encode_properties(e)))?;
            Ok(enc.finish(Signature::new("a{sv}")?))
        }
        "Set" => {
            let (interface, name, value): (String, String, Value) = call.read_args()?;
            let handler = registry.resolve(path, &interface)?;
            handler.set_property(&name, value).await?;
            Ok(Body::empty())
        }
        other => Err(MethodError::unknown_method(PROPERTIES_INTERFACE, other)),
    }
}

/// Reads one property.
pub async fn get_property(
    conn: &Connection,
    destination: Option<&str>,
    path: &ObjectPath,
    interface: &str,
    name: &str,
) -> Result<Value> {
    let (value,): (Value,) = conn
        .call_method(
            destination,
            path,
            PROPERTIES_INTERFACE,
            "Get",
            &(interface.to_owned(), name.to_owned()),
        )
        .await?;
    Ok(value)
}

/// Reads every property of `interface`.
pub async fn get_all_properties(
    conn: &Connection,
    destination: Option<&str>,
    path: &ObjectPath,
    interface: &str,
) -> Result<HashMap<String, Value>> {
    let (props,): (HashMap<String, Value>,) = conn
        .call_method(destination, path, PROPERTIES_INTERFACE, "GetAll", &(interface.to_owned(),))
        .await?;
    Ok(props)
}

/// Writes one property.
pub async fn set_property(
    conn: &Connection,
    destination: Option<&str>,
    path: &ObjectPath,
    interface: &str,
    name: &str,
    value: Value,
) -> Result<()> {
    conn.call_method(
        destination,
        path,
        PROPERTIES_INTERFACE,
        "Set",
        &(interface.to_owned(), name.to_owned(), value),
    )
    .await
}

/// Calls `org.freedesktop.DBus.ObjectManager.GetManagedObjects` on `path`.
pub async fn get_managed_objects(
    conn: &Connection,
    destination: Option<&str>,
    path: &ObjectPath,
) -> Result<ManagedObjects> {
    let (objects,): (ManagedObjects,) = conn
        .call_method(
            destination,
            path,
            crate::object_manager::OBJECT_MANAGER_INTERFACE,
            "GetManagedObjects",
            &(),
        )
        .await?;
    Ok(objects)
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;

    use super::*;
    use crate::error::names;
    use crate::handler::ObjectHandler;

    struct Disk {
        size: Mutex<u64>,
    }

    #[async_trait]
    impl ObjectHandler for Disk {
        fn interface(&self) -> &str {
            "org.example.Disk1"
        }

        fn encode_properties(&self, enc: &mut Encoder) -> dbx_proto::Result<()> {
            let size = *self.size.lock().unwrap();
            enc.add_property("Size", &Value::UInt64(size))
        }

        fn encode_property(&self, name: &str, enc: &mut Encoder) -> dbx_proto::Result<bool> {
            if name != "Size" {
                return Ok(false);
            }
            enc.add_variant(&Value::UInt64(*self.size.lock().unwrap()))?;
            Ok(true)
        }

        async fn set_property(&self, name: &str, value: Value) -> std::result::Result<(), MethodError> {
            match (name, value) {
                ("Size", Value::UInt64(v)) => {
                    *self.size.lock().unwrap() = v;
                    Ok(())
                }
                ("Size", _) => Err(MethodError::invalid_args("Size is a u64")),
                (other, _) => Err(MethodError::unknown_property(self.interface(), other)),
            }
        }

        async fn handle_method_call(&self, call: &Message) -> std::result::Result<Body, MethodError> {
            Err(MethodError::unknown_method(self.interface(), call.member().unwrap_or_default()))
        }
    }

    fn call<T: dbx_proto::Args>(member: &str, args: &T) -> Message {
        let mut msg = Message::method_call(ObjectPath::new("/disk").unwrap(), member)
            .with_interface(PROPERTIES_INTERFACE)
            .with_body(Body::from_args(args).unwrap());
        msg.set_serial(1);
        msg
    }

    fn registry() -> (Registry, crate::registry::ObjectRegistration) {
        let reg = Registry::new();
        let handle = reg
            .register(
                &ObjectPath::new("/disk").unwrap(),
                Arc::new(Disk { size: Mutex::new(42) }),
            )
            .unwrap();
        (reg, handle)
    }

    #[tokio::test]
    async fn get_all_layout() {
        let (reg, _handle) = registry();
        let body = serve(&reg, &call("GetAll", &("org.example.Disk1".to_owned(),)), "GetAll")
            .await
            .unwrap();
        assert_eq!(body.signature(), "a{sv}");
        let mut expected = vec![24, 0, 0, 0, 0, 0, 0, 0];
        expected.extend_from_slice(&[4, 0, 0, 0, b'S', b'i', b'z', b'e', 0]);
        expected.extend_from_slice(&[1, b't', 0]);
        expected.extend_from_slice(&[0, 0, 0, 0]);
        expected.extend_from_slice(&42u64.to_le_bytes());
        assert_eq!(body.data(), expected.as_slice());
    }

    #[tokio::test]
    async fn get_and_set() {
        let (reg, _handle) = registry();
        let get = || call("Get", &("org.example.Disk1".to_owned(), "Size".to_owned()));
        let body = serve(&reg, &get(), "Get").await.unwrap();
        assert_eq!(body.signature(), "v");

        let set = call(
            "Set",
            &("org.example.Disk1".to_owned(), "Size".to_owned(), Value::UInt64(7)),
        );
        serve(&reg, &set, "Set").await.unwrap();
        let reply = Message::method_call(ObjectPath::root(), "x").with_body(serve(&reg, &get(), "Get").await.unwrap());
        let (value,): (Value,) = reply.read_args().unwrap();
        assert_eq!(value, Value::UInt64(7));
    }

    #[tokio::test]
    async fn missing_things_have_distinct_errors() {
        let (reg, _handle) = registry();
        let unknown_prop = call("Get", &("org.example.Disk1".to_owned(), "Colour".to_owned()));
        assert_eq!(
            serve(&reg, &unknown_prop, "Get").await.unwrap_err().name,
            names::UNKNOWN_PROPERTY
        );
        let unknown_iface = call("GetAll", &("org.example.Nope".to_owned(),));
        assert_eq!(
            serve(&reg, &unknown_iface, "GetAll").await.unwrap_err().name,
            names::UNKNOWN_INTERFACE
        );
        let wrong_args = call("Get", &(5u32,));
        assert_eq!(
            serve(&reg, &wrong_args, "Get").await.unwrap_err().name,
            names::INVALID_SIGNATURE
        );
    }
}
