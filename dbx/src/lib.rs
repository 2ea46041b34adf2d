//! Async D-Bus connections over Unix sockets.
//!
//! `dbx` speaks the D-Bus protocol from [`dbx_proto`] over a tokio-driven
//! Unix socket: SASL `EXTERNAL` authentication, file-descriptor passing,
//! concurrent method calls matched by serial, signal subscriptions, and
//! serving objects with built-in `Properties`, `Peer` and `ObjectManager`
//! support.
//!
//! # Quick start
//!
//! ```no_run
//! # async fn demo() -> dbx::Result<()> {
//! let conn = dbx::Connection::session().await?;
//! for name in dbx::bus::list_names(&conn).await? {
//!     println!("{name}");
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Serving an object
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use dbx::{Body, Message, MethodError, ObjectHandler, ObjectPath};
//!
//! struct Echo;
//!
//! #[async_trait::async_trait]
//! impl ObjectHandler for Echo {
//!     fn interface(&self) -> &str {
//!         "org.example.Echo1"
//!     }
//!
//!     async fn handle_method_call(&self, call: &Message) -> Result<Body, MethodError> {
//!         match call.member() {
//!             Some("Echo") => {
//!                 let (text,): (String,) = call.read_args()?;
//!                 Ok(Body::from_args(&(text,))?)
//!             }
//!             other => Err(MethodError::unknown_method(self.interface(), other.unwrap_or_default())),
//!         }
//!     }
//! }
//!
//! # async fn demo() -> dbx::Result<()> {
//! let conn = dbx::Connection::session().await?;
//! let _echo = conn.register_object(&ObjectPath::new("/org/example/Echo")?, Arc::new(Echo))?;
//! conn.closed().await;
//! # Ok(())
//! # }
//! ```

pub mod address;
mod auth;
pub mod bus;
mod config;
mod connection;
mod error;
mod fd;
mod handler;
mod match_rule;
mod object_manager;
pub mod properties;
mod registry;
mod sys;
mod transport;

pub use config::{BusKind, Config};
pub use connection::{Connection, ConnectionBuilder, PEER_INTERFACE, State};
pub use dbx_proto;
pub use dbx_proto::{Arg, Args, Body, Decoder, Encoder, Flags, Message, MessageType, ObjectPath, Signature, Type, Value};
pub use error::{Error, MethodError, Result, names};
pub use fd::UnixFd;
pub use handler::{ObjectHandler, SignalHandler};
pub use match_rule::MatchRule;
pub use object_manager::{OBJECT_MANAGER_INTERFACE, ObjectManager};
pub use properties::PROPERTIES_INTERFACE;
pub use registry::{ObjectRegistration, Registry, SignalSubscription};
pub use tokio_util::sync::CancellationToken;
