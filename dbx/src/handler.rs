//! Server-side object interfaces.

use std::sync::Arc;

use async_trait::async_trait;
use dbx_proto::{Body, Encoder, Message, Value};

use crate::error::MethodError;

/// One interface implemented by an exported object.
///
/// Property reads are synchronous encoder callbacks so that `GetAll` and
/// `GetManagedObjects` can assemble their replies in one pass.
#[async_trait]
pub trait ObjectHandler: Send + Sync + 'static {
    /// Interface name, e.g. `org.example.Disk1`.
    fn interface(&self) -> &str;

    /// Writes every readable property as `{sv}` entries.
    ///
    /// Called inside an open `a{sv}` array; use [`Encoder::add_property`].
    fn encode_properties(&self, enc: &mut Encoder) -> dbx_proto::Result<()> {
        let _ = enc;
        Ok(())
    }

    /// Writes the property `name` as a variant. Returns `false` if there is
    /// no such property.
    fn encode_property(&self, name: &str, enc: &mut Encoder) -> dbx_proto::Result<bool> {
        let _ = (name, enc);
        Ok(false)
    }

    /// Assigns a property. The default rejects every write.
    async fn set_property(&self, name: &str, value: Value) -> Result<(), MethodError> {
        let _ = value;
        Err(MethodError::read_only(name))
    }

    /// Handles a method call addressed to this interface.
    async fn handle_method_call(&self, call: &Message) -> Result<Body, MethodError>;
}

/// Callback invoked for each matching signal.
pub type SignalHandler = Arc<dyn Fn(&Message) + Send + Sync>;
