//! Connection lifecycle, call routing and method dispatch.
//!
//! A [`Connection`] is created by [`ConnectionBuilder::build`], which runs
//! connect and SASL on the blocking pool and then spawns one reader task.
//! The reader decodes frames strictly in order:
//!
//! - returns and errors complete the pending call with the same serial,
//! - signals go to the connection's signal task, which runs subscribers in
//!   arrival order,
//! - method calls are served on a spawned task.
//!
//! The reader only holds a weak reference. A connection stays up until
//! [`Connection::close`], until the peer hangs up, or until the last handle
//! is dropped.

use std::fmt;
use std::io;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use dashmap::DashMap;
use dbx_proto::{Args, Body, Encoder, Message, MessageType, ObjectPath, Signature, Value};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::address;
use crate::auth;
use crate::bus;
use crate::config::{BusKind, Config};
use crate::error::{Error, MethodError, Result};
use crate::handler::{ObjectHandler, SignalHandler};
use crate::match_rule::MatchRule;
use crate::properties::{self, PROPERTIES_INTERFACE};
use crate::registry::{ObjectRegistration, Registry, SignalSubscription};
use crate::transport::{self, Reader, Transport};

/// Interface answered by every connection.
pub const PEER_INTERFACE: &str = "org.freedesktop.DBus.Peer";

/// Where `GetMachineId` looks, in order.
const MACHINE_ID_PATHS: [&str; 2] = ["/etc/machine-id", "/var/lib/dbus/machine-id"];

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
#[repr(u8)]
pub enum State {
    /// Resolving the address and connecting the socket.
    Connecting = 0,
    /// Running the SASL handshake.
    Authenticating = 1,
    /// Exchanging messages.
    Open = 2,
    /// Shut down; every pending call has failed.
    Closed = 3,
}

impl State {
    /// Inverse of `state as u8`.
    const fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Connecting,
            1 => Self::Authenticating,
            2 => Self::Open,
            _ => Self::Closed,
        }
    }
}

/// Where the socket comes from.
#[derive(Debug)]
enum Target {
    /// The session bus from the environment.
    Session,
    /// The system bus from the environment.
    System,
    /// An explicit address list.
    Address(String),
    /// An already connected socket.
    Peer(StdUnixStream),
}

/// Configures and opens a [`Connection`].
///
/// ```no_run
/// # async fn demo() -> dbx::Result<()> {
/// let conn = dbx::ConnectionBuilder::session().build().await?;
/// println!("connected as {:?}", conn.unique_name());
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct ConnectionBuilder {
    /// Socket source.
    target: Target,
    /// Serve the SASL handshake instead of initiating it.
    server: bool,
    /// Registry shared with the caller, if any.
    registry: Option<Registry>,
    /// Ask for descriptor passing.
    negotiate_unix_fd: bool,
    /// Send `Hello`; defaults to `true` for buses and `false` for peers.
    hello: Option<bool>,
}

impl ConnectionBuilder {
    /// Defaults for a builder connecting to `target`.
    const fn with_target(target: Target) -> Self {
        Self {
            target,
            server: false,
            registry: None,
            negotiate_unix_fd: true,
            hello: None,
        }
    }

    /// Connects to the session bus.
    pub const fn session() -> Self {
        Self::with_target(Target::Session)
    }

    /// Connects to the system bus.
    pub const fn system() -> Self {
        Self::with_target(Target::System)
    }

    /// Connects to an explicit address such as `unix:path=/run/app.sock`.
    pub fn address(address: impl Into<String>) -> Self {
        Self::with_target(Target::Address(address.into()))
    }

    /// Uses an already connected socket for a peer-to-peer connection.
    pub const fn peer(stream: StdUnixStream) -> Self {
        Self::with_target(Target::Peer(stream))
    }

    /// Builder matching `config`.
    pub fn from_config(config: &Config) -> Self {
        let builder = match (&config.address, config.bus) {
            (Some(addr), _) => Self::address(addr.clone()),
            (None, BusKind::System) => Self::system(),
            (None, BusKind::Session) => Self::session(),
        };
        builder
            .negotiate_unix_fd(config.negotiate_unix_fd)
            .hello(config.hello)
    }

    /// Authenticates the peer rather than authenticating to it.
    ///
    /// The peer must present the uid of this process.
    #[must_use]
    pub const fn server(mut self) -> Self {
        self.server = true;
        self
    }

    /// Dispatches calls and signals through `registry`.
    #[must_use]
    pub fn registry(mut self, registry: Registry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Whether to ask for file-descriptor passing.
    #[must_use]
    pub const fn negotiate_unix_fd(mut self, negotiate: bool) -> Self {
        self.negotiate_unix_fd = negotiate;
        self
    }

    /// Whether to send `Hello` once authenticated.
    #[must_use]
    pub const fn hello(mut self, hello: bool) -> Self {
        self.hello = Some(hello);
        self
    }

    /// Connects, authenticates and starts the reader task.
    ///
    /// Must be called inside a tokio runtime.
    pub async fn build(self) -> Result<Connection> {
        let Self {
            target,
            server,
            registry,
            negotiate_unix_fd,
            hello,
        } = self;
        let bus = !matches!(target, Target::Peer(_));
        let hello = !server && hello.unwrap_or(bus);
        let uid = nix::unistd::Uid::current().as_raw();

        let (stream, guid, unix_fd) = tokio::task::spawn_blocking(move || -> Result<(StdUnixStream, String, bool)> {
            tracing::debug!(state = ?State::Connecting, "opening connection");
            let mut stream = match target {
                Target::Session => transport::connect(&address::parse(&address::session_bus()?)?)?,
                Target::System => transport::connect(&address::parse(&address::system_bus())?)?,
                Target::Address(addr) => transport::connect(&address::parse(&addr)?)?,
                Target::Peer(stream) => stream,
            };
            tracing::debug!(state = ?State::Authenticating, server, "authenticating");
            if server {
                let guid = auth::generate_guid();
                let unix_fd = auth::server(&mut stream, uid, &guid)?;
                Ok((stream, guid, unix_fd))
            } else {
                let authed = auth::client(&mut stream, uid, negotiate_unix_fd)?;
                Ok((stream, authed.guid, authed.unix_fd))
            }
        })
        .await
        .map_err(|e| Error::Io(io::Error::other(e)))??;

        let transport = Transport::new(stream, unix_fd)?;
        let reader = transport.reader();
        let registry = registry.unwrap_or_default();
        let (signals, queue) = mpsc::unbounded_channel();
        tokio::spawn(signal_loop(registry.clone(), queue));
        let inner = Arc::new(Inner {
            transport,
            registry,
            signals,
            pending: DashMap::new(),
            serial: AtomicU32::new(1),
            state: AtomicU8::new(State::Open as u8),
            closed: CancellationToken::new(),
            unique_name: OnceLock::new(),
            bus,
            guid,
        });
        tokio::spawn(read_loop(Arc::downgrade(&inner), reader, inner.closed.clone()));
        let conn = Connection { inner };

        if hello {
            match bus::hello(&conn).await {
                Ok(name) => {
                    let _ = conn.inner.unique_name.set(name);
                }
                Err(e) => {
                    conn.close();
                    return Err(e);
                }
            }
        }
        tracing::info!(
            guid = conn.guid(),
            unique_name = conn.unique_name(),
            unix_fd,
            "connection open"
        );
        Ok(conn)
    }
}

/// Shared connection state.
struct Inner {
    /// The authenticated socket.
    transport: Transport,
    /// Exported objects and signal subscribers.
    registry: Registry,
    /// Inbound signals, in arrival order, for the signal task.
    signals: mpsc::UnboundedSender<Message>,
    /// Calls awaiting a reply, by serial.
    pending: DashMap<u32, oneshot::Sender<Result<Message>>>,
    /// Next serial to hand out.
    serial: AtomicU32,
    /// Current [`State`].
    state: AtomicU8,
    /// Cancelled on entering [`State::Closed`].
    closed: CancellationToken,
    /// Unique bus name returned by `Hello`.
    unique_name: OnceLock<String>,
    /// Connected to a message bus rather than a single peer.
    bus: bool,
    /// Server GUID.
    guid: String,
}

impl Inner {
    /// Next non-zero serial with no call in flight.
    fn next_serial(&self) -> u32 {
        loop {
            let serial = self.serial.fetch_add(1, Ordering::Relaxed);
            if serial != 0 && !self.pending.contains_key(&serial) {
                return serial;
            }
        }
    }

    /// Enters [`State::Closed`] once and fails every pending call.
    fn finish(&self, reason: &str) {
        if self.state.swap(State::Closed as u8, Ordering::SeqCst) == State::Closed as u8 {
            return;
        }
        if let Err(e) = self.transport.shutdown() {
            tracing::debug!(error = %e, "socket shutdown failed");
        }
        self.closed.cancel();
        let serials: Vec<u32> = self.pending.iter().map(|e| *e.key()).collect();
        for serial in serials {
            if let Some((_, tx)) = self.pending.remove(&serial) {
                let _ = tx.send(Err(Error::ConnectionClosed));
            }
        }
        tracing::info!(guid = self.guid.as_str(), reason, "connection closed");
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.finish("last handle dropped");
    }
}

/// Removes a pending slot when the call finishes or is dropped.
struct PendingSlot<'a> {
    /// Owning connection.
    inner: &'a Inner,
    /// Serial of the call.
    serial: u32,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.inner.pending.remove(&self.serial);
    }
}

/// An open D-Bus connection. Cheap to clone.
#[derive(Clone)]
pub struct Connection {
    /// Shared state.
    inner: Arc<Inner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state())
            .field("guid", &self.inner.guid)
            .field("unique_name", &self.unique_name())
            .field("pending", &self.inner.pending.len())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Connects to the session bus with default settings.
    pub async fn session() -> Result<Self> {
        ConnectionBuilder::session().build().await
    }

    /// Connects to the system bus with default settings.
    pub async fn system() -> Result<Self> {
        ConnectionBuilder::system().build().await
    }

    /// Current lifecycle state.
    pub fn state(&self) -> State {
        State::from_u8(self.inner.state.load(Ordering::SeqCst))
    }

    /// Returns `true` once the connection is closed.
    pub fn is_closed(&self) -> bool {
        self.state() == State::Closed
    }

    /// Waits until the connection is closed.
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await;
    }

    /// Shuts the socket down and fails every outstanding call.
    pub fn close(&self) {
        self.inner.finish("closed locally");
    }

    /// Unique bus name, e.g. `:1.42`. `None` on peer connections.
    pub fn unique_name(&self) -> Option<&str> {
        self.inner.unique_name.get().map(String::as_str)
    }

    /// Server GUID from authentication.
    pub fn guid(&self) -> &str {
        &self.inner.guid
    }

    /// Whether descriptor passing was negotiated.
    pub fn can_pass_fds(&self) -> bool {
        self.inner.transport.unix_fd()
    }

    /// Registry used for dispatch.
    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// Fails with [`Error::ConnectionClosed`] once closed.
    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::ConnectionClosed)
        } else {
            Ok(())
        }
    }

    /// Assigns a serial and writes `msg` without waiting for a reply.
    pub async fn send(&self, mut msg: Message) -> Result<u32> {
        self.ensure_open()?;
        let serial = self.inner.next_serial();
        msg.set_serial(serial);
        self.write(&msg).await?;
        Ok(serial)
    }

    /// Encodes and writes an already numbered message.
    async fn write(&self, msg: &Message) -> Result<()> {
        let header = msg.encode_header()?;
        self.inner
            .transport
            .send(header, msg.body().to_vec(), msg.take_fds())
            .await?;
        tracing::debug!(
            serial = msg.serial(),
            kind = ?msg.message_type(),
            member = msg.member(),
            reply_serial = msg.reply_serial(),
            "sent"
        );
        Ok(())
    }

    /// Sends a method call and waits for its reply.
    ///
    /// An error reply becomes [`Error::Remote`].
    pub async fn call(&self, msg: Message) -> Result<Message> {
        self.call_cancellable(msg, &CancellationToken::new()).await
    }

    /// Like [`Connection::call`], giving up with [`Error::Cancelled`] once
    /// `cancel` fires.
    ///
    /// Cancelling, or dropping the future, forgets the call; a reply that
    /// arrives later is discarded.
    pub async fn call_cancellable(&self, mut msg: Message, cancel: &CancellationToken) -> Result<Message> {
        if msg.message_type() != MessageType::MethodCall {
            return Err(Error::InvalidArgument("only method calls have replies".to_owned()));
        }
        if msg.no_reply_expected() {
            return Err(Error::InvalidArgument(
                "call has NO_REPLY_EXPECTED set; use send".to_owned(),
            ));
        }
        self.ensure_open()?;
        let serial = self.inner.next_serial();
        msg.set_serial(serial);

        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(serial, tx);
        let _slot = PendingSlot {
            inner: &self.inner,
            serial,
        };
        self.write(&msg).await?;

        tokio::select! {
            biased;
            reply = rx => reply.unwrap_or(Err(Error::ConnectionClosed)),
            () = cancel.cancelled() => Err(Error::Cancelled),
            () = self.inner.closed.cancelled() => Err(Error::ConnectionClosed),
        }
    }

    /// Calls `interface.member` on `path` with typed arguments and reply.
    ///
    /// ```no_run
    /// # async fn demo(conn: &dbx::Connection) -> dbx::Result<()> {
    /// use dbx::dbx_proto::ObjectPath;
    ///
    /// let path = ObjectPath::new("/org/freedesktop/DBus")?;
    /// let (names,): (Vec<String>,) = conn
    ///     .call_method(Some("org.freedesktop.DBus"), &path, "org.freedesktop.DBus", "ListNames", &())
    ///     .await?;
    /// # let _ = names;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn call_method<A: Args, R: Args>(
        &self,
        destination: Option<&str>,
        path: &ObjectPath,
        interface: &str,
        member: &str,
        args: &A,
    ) -> Result<R> {
        let mut msg = Message::method_call(path.clone(), member)
            .with_interface(interface)
            .with_body(Body::from_args(args)?);
        if let Some(dest) = destination {
            msg = msg.with_destination(dest);
        }
        let reply = self.call(msg).await?;
        reply.read_args::<R>().map_err(Error::from_decode)
    }

    /// Sends a successful reply to `call`.
    pub async fn reply(&self, call: &Message, body: Body) -> Result<u32> {
        self.send(Message::method_return(call).with_body(body)).await
    }

    /// Sends an error reply to `call`.
    pub async fn reply_error(&self, call: &Message, name: &str, message: &str) -> Result<u32> {
        self.send(Message::error(call, name, message)?).await
    }

    /// Emits a signal from `path`.
    pub async fn emit_signal(&self, path: &ObjectPath, interface: &str, member: &str, body: Body) -> Result<u32> {
        let msg = Message::signal(path.clone(), interface, member).with_body(body);
        msg.validate()?;
        self.send(msg).await
    }

    /// Emits `org.freedesktop.DBus.Properties.PropertiesChanged`.
    pub async fn emit_properties_changed(
        &self,
        path: &ObjectPath,
        interface: &str,
        changed: &[(&str, Value)],
        invalidated: &[&str],
    ) -> Result<u32> {
        let mut enc = Encoder::new();
        enc.add_str(interface)?;
        enc.add_dict(|e| changed.iter().try_for_each(|(name, value)| e.add_property(name, value)))?;
        enc.add_array(4, |e| invalidated.iter().try_for_each(|name| e.add_str(name)))?;
        let body = enc.finish(Signature::new("sa{sv}as")?);
        self.emit_signal(path, PROPERTIES_INTERFACE, "PropertiesChanged", body)
            .await
    }

    /// Exports `handler` at `path`.
    pub fn register_object(&self, path: &ObjectPath, handler: Arc<dyn ObjectHandler>) -> Result<ObjectRegistration> {
        self.inner.registry.register(path, handler)
    }

    /// Runs `handler` for every matching signal.
    ///
    /// On a bus this also adds a match rule, removed again when the
    /// subscription is dropped.
    pub async fn subscribe(
        &self,
        path: &ObjectPath,
        interface: &str,
        member: &str,
        handler: SignalHandler,
    ) -> Result<SignalSubscription> {
        let mut sub = self
            .inner
            .registry
            .subscribe(path.as_str(), interface, member, handler);
        if !self.inner.bus {
            return Ok(sub);
        }
        let rule = MatchRule::signal()
            .path(path.as_str())
            .interface(interface)
            .member(member)
            .to_string();
        bus::add_match(self, &rule).await?;
        let weak = Arc::downgrade(&self.inner);
        sub.set_on_drop(move || {
            let Some(inner) = weak.upgrade() else { return };
            let conn = Self { inner };
            if conn.is_closed() {
                return;
            }
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    if let Err(e) = bus::remove_match(&conn, &rule).await {
                        tracing::warn!(error = %e, rule = rule.as_str(), "RemoveMatch failed");
                    }
                });
            }
        });
        Ok(sub)
    }

    /// Routes one decoded inbound message.
    fn route(&self, msg: Message) {
        tracing::debug!(
            serial = msg.serial(),
            kind = ?msg.message_type(),
            path = msg.path().map(ObjectPath::as_str),
            interface = msg.interface(),
            member = msg.member(),
            reply_serial = msg.reply_serial(),
            "received"
        );
        match msg.message_type() {
            MessageType::MethodReturn | MessageType::Error => self.complete(msg),
            MessageType::Signal => {
                // Only fails once the signal task is gone, i.e. while closing.
                let _ = self.inner.signals.send(msg);
            }
            MessageType::MethodCall => {
                tokio::spawn(self.clone().serve_call(msg));
            }
            other => tracing::debug!(kind = ?other, "ignoring message"),
        }
    }

    /// Completes the pending call a reply answers.
    fn complete(&self, msg: Message) {
        let Some(serial) = msg.reply_serial() else { return };
        let Some((_, tx)) = self.inner.pending.remove(&serial) else {
            tracing::debug!(serial, "discarding reply for unknown serial");
            return;
        };
        let result = if msg.message_type() == MessageType::Error {
            Err(Error::Remote {
                name: msg.error_name().unwrap_or_default().to_owned(),
                message: msg.error_message().unwrap_or_default(),
            })
        } else {
            Ok(msg)
        };
        // The caller may have given up in the meantime.
        let _ = tx.send(result);
    }

    /// Runs a method call and sends its reply.
    async fn serve_call(self, call: Message) {
        let call = Arc::new(call);
        let task = {
            let conn = self.clone();
            let call = Arc::clone(&call);
            tokio::spawn(async move { conn.dispatch(&call).await })
        };
        let outcome = match task.await {
            Ok(outcome) => outcome,
            Err(e) if e.is_panic() => {
                tracing::warn!(member = call.member(), "method handler panicked");
                Err(MethodError::failed("method handler panicked"))
            }
            Err(_) => Err(MethodError::failed("method handler was cancelled")),
        };
        if call.no_reply_expected() {
            return;
        }
        let reply = match outcome {
            Ok(body) => Ok(Message::method_return(&call).with_body(body)),
            Err(e) => Message::error(&call, e.name, &e.message),
        };
        let sent = match reply {
            Ok(reply) => self.send(reply).await.map(drop),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = sent {
            tracing::warn!(error = %e, serial = call.serial(), "failed to send reply");
        }
    }

    /// Finds and runs the handler for a method call.
    async fn dispatch(&self, call: &Message) -> std::result::Result<Body, MethodError> {
        let path = call.path().map_or("/", ObjectPath::as_str);
        let member = call.member().unwrap_or_default();
        let registry = &self.inner.registry;
        match call.interface() {
            Some(PEER_INTERFACE) => peer(member),
            Some(PROPERTIES_INTERFACE) => properties::serve(registry, call, member).await,
            Some(interface) => registry.resolve(path, interface)?.handle_method_call(call).await,
            None => {
                let mut handlers = registry.handlers_at(path);
                match handlers.len() {
                    1 => {
                        let handler = handlers.remove(0);
                        handler.handle_method_call(call).await
                    }
                    0 if matches!(member, "Ping" | "GetMachineId") => peer(member),
                    0 => Err(MethodError::new(
                        crate::error::names::TARGET_NOT_FOUND,
                        format!("no object at {path}"),
                    )),
                    _ => Err(MethodError::new(
                        crate::error::names::UNKNOWN_INTERFACE,
                        format!("{path} has several interfaces; the call must name one"),
                    )),
                }
            }
        }
    }
}

/// `org.freedesktop.DBus.Peer`.
fn peer(member: &str) -> std::result::Result<Body, MethodError> {
    match member {
        "Ping" => Ok(Body::empty()),
        "GetMachineId" => Ok(Body::from_args(&(machine_id()?,))?),
        other => Err(MethodError::unknown_method(PEER_INTERFACE, other)),
    }
}

/// Contents of the first non-empty machine id file.
fn machine_id() -> std::result::Result<String, MethodError> {
    MACHINE_ID_PATHS
        .iter()
        .filter_map(|p| std::fs::read_to_string(p).ok())
        .map(|s| s.trim().to_owned())
        .find(|id| !id.is_empty())
        .ok_or_else(|| MethodError::failed("machine id is not available"))
}

/// Runs subscribers for each queued signal, one at a time.
async fn signal_loop(registry: Registry, mut queue: mpsc::UnboundedReceiver<Message>) {
    while let Some(msg) = queue.recv().await {
        if panic::catch_unwind(AssertUnwindSafe(|| registry.dispatch_signal(&msg))).is_err() {
            tracing::warn!(member = msg.member(), "signal handler panicked");
        }
    }
}

/// Reads frames until end of stream, a fatal error or a close.
///
/// Holds the connection only while routing a frame, so dropping every
/// handle closes it.
async fn read_loop(weak: Weak<Inner>, reader: Reader, closed: CancellationToken) {
    let reason = loop {
        let frame = tokio::select! {
            biased;
            () = closed.cancelled() => return,
            frame = reader.recv() => frame,
        };
        let Some(inner) = weak.upgrade() else { return };
        let conn = Connection { inner };
        match frame {
            Ok(Some((bytes, fds))) => match Message::decode(bytes, fds) {
                Ok(msg) => conn.route(msg),
                Err(e) => tracing::warn!(error = %e, "dropping malformed message"),
            },
            Ok(None) => break "peer hung up",
            Err(e) => {
                tracing::warn!(error = %e, "stream can no longer be read");
                break "read error";
            }
        }
    };
    if let Some(inner) = weak.upgrade() {
        inner.finish(reason);
    }
}
