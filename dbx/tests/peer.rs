//! Calls, signals and descriptors over a peer-to-peer connection.

mod common;

use std::collections::HashSet;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dbx::{
    Body, CancellationToken, ConnectionBuilder, Encoder, Error, Flags, Message, MethodError, ObjectHandler,
    ObjectPath, Registry, Signature, State, UnixFd, Value, names, properties,
};

const CALC: &str = "org.example.Calc1";

/// Test object: arithmetic, a hanging method, a panicking one and an fd reader.
#[derive(Default)]
struct Calc {
    hanging: AtomicUsize,
}

#[async_trait]
impl ObjectHandler for Calc {
    fn interface(&self) -> &str {
        CALC
    }

    fn encode_properties(&self, enc: &mut Encoder) -> dbx::dbx_proto::Result<()> {
        enc.add_property("Name", &Value::from("calc"))?;
        enc.add_property("Precision", &Value::UInt32(32))
    }

    fn encode_property(&self, name: &str, enc: &mut Encoder) -> dbx::dbx_proto::Result<bool> {
        match name {
            "Name" => enc.add_variant(&Value::from("calc"))?,
            "Precision" => enc.add_variant(&Value::UInt32(32))?,
            _ => return Ok(false),
        }
        Ok(true)
    }

    async fn handle_method_call(&self, call: &Message) -> Result<Body, MethodError> {
        match call.member().unwrap_or_default() {
            "Add" => {
                let (a, b): (i32, i32) = call.read_args()?;
                Ok(Body::from_args(&(a + b,))?)
            }
            "Hang" => {
                self.hanging.fetch_add(1, Ordering::SeqCst);
                std::future::pending::<()>().await;
                Ok(Body::empty())
            }
            "Panic" => panic!("calculator exploded"),
            "ReadFd" => {
                let mut dec = call.decoder();
                dec.assert_signature("h")?;
                let fd = UnixFd::take(&mut dec, call).map_err(|e| MethodError::invalid_args(e.to_string()))?;
                let mut file = File::from(fd);
                let mut text = String::new();
                file.seek(SeekFrom::Start(0))
                    .and_then(|_| file.read_to_string(&mut text))
                    .map_err(|e| MethodError::failed(e.to_string()))?;
                Ok(Body::from_args(&(text,))?)
            }
            other => Err(MethodError::unknown_method(CALC, other)),
        }
    }
}

fn calc_path() -> ObjectPath {
    ObjectPath::new("/org/example/calc").unwrap()
}

fn calc_call(member: &str) -> Message {
    Message::method_call(calc_path(), member).with_interface(CALC)
}

async fn serve_calc() -> (dbx::Connection, dbx::Connection, Arc<Calc>, dbx::ObjectRegistration) {
    let registry = Registry::new();
    let calc = Arc::new(Calc::default());
    let registration = registry.register(&calc_path(), Arc::<Calc>::clone(&calc)).unwrap();
    let (client, server) = common::pair(registry).await;
    (client, server, calc, registration)
}

#[tokio::test]
async fn typed_call_round_trip() {
    let (client, server, _calc, _reg) = serve_calc().await;
    assert_eq!(client.state(), State::Open);
    assert_eq!(client.guid(), server.guid());
    assert!(client.can_pass_fds());

    let (sum,): (i32,) = client
        .call_method(None, &calc_path(), CALC, "Add", &(2i32, 40i32))
        .await
        .unwrap();
    assert_eq!(sum, 42);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_calls_get_their_own_replies() {
    let (client, _server, _calc, _reg) = serve_calc().await;
    let tasks: Vec<_> = (0..64i32)
        .map(|i| {
            let client = client.clone();
            tokio::spawn(async move {
                let (sum,): (i32,) = client
                    .call_method(None, &calc_path(), CALC, "Add", &(i, 1000i32))
                    .await
                    .unwrap();
                (i, sum)
            })
        })
        .collect();
    for task in tasks {
        let (i, sum) = task.await.unwrap();
        assert_eq!(sum, i + 1000);
    }
}

#[tokio::test]
async fn serials_are_unique_and_non_zero() {
    let (client, _server, _calc, _reg) = serve_calc().await;
    let mut seen = HashSet::new();
    for i in 0..100i32 {
        let msg = calc_call("Add")
            .with_flags(Flags::NO_REPLY_EXPECTED)
            .with_body(Body::from_args(&(i, i)).unwrap());
        let serial = client.send(msg).await.unwrap();
        assert_ne!(serial, 0);
        assert!(seen.insert(serial), "serial {serial} reused");
    }
}

#[tokio::test]
async fn calls_with_no_reply_flag_must_use_send() {
    let (client, _server, _calc, _reg) = serve_calc().await;
    let msg = calc_call("Add").with_flags(Flags::NO_REPLY_EXPECTED);
    assert!(matches!(client.call(msg).await, Err(Error::InvalidArgument(_))));
}

#[tokio::test]
async fn dispatch_errors_are_named() {
    let (client, _server, _calc, _reg) = serve_calc().await;

    let wrong_args = calc_call("Add").with_body(Body::from_args(&("two".to_owned(),)).unwrap());
    let err = client.call(wrong_args).await.unwrap_err();
    assert_eq!(err.remote_name(), Some(names::INVALID_SIGNATURE));

    let err = client.call(calc_call("Divide")).await.unwrap_err();
    assert_eq!(err.remote_name(), Some(names::UNKNOWN_METHOD));

    let nowhere = Message::method_call(ObjectPath::new("/nowhere").unwrap(), "Add").with_interface(CALC);
    let err = client.call(nowhere).await.unwrap_err();
    assert_eq!(err.remote_name(), Some(names::TARGET_NOT_FOUND));

    let other_iface = Message::method_call(calc_path(), "Add").with_interface("org.example.Other");
    let err = client.call(other_iface).await.unwrap_err();
    assert_eq!(err.remote_name(), Some(names::UNKNOWN_INTERFACE));
}

#[tokio::test]
async fn call_without_interface_reaches_the_only_handler() {
    let (client, _server, _calc, _reg) = serve_calc().await;
    let msg = Message::method_call(calc_path(), "Add").with_body(Body::from_args(&(1i32, 2i32)).unwrap());
    let reply = client.call(msg).await.unwrap();
    let (sum,): (i32,) = reply.read_args().unwrap();
    assert_eq!(sum, 3);
}

#[tokio::test]
async fn handler_panic_becomes_failed() {
    let (client, _server, _calc, _reg) = serve_calc().await;
    let err = client.call(calc_call("Panic")).await.unwrap_err();
    assert_eq!(err.remote_name(), Some(names::FAILED));

    // The connection survives.
    let ping = Message::method_call(calc_path(), "Ping").with_interface(dbx::PEER_INTERFACE);
    client.call(ping).await.unwrap();
}

#[tokio::test]
async fn properties_are_served_from_the_registry() {
    let (client, _server, _calc, _reg) = serve_calc().await;

    let all = properties::get_all_properties(&client, None, &calc_path(), CALC).await.unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all["Name"], Value::from("calc"));
    assert_eq!(all["Precision"], Value::UInt32(32));

    let name = properties::get_property(&client, None, &calc_path(), CALC, "Name").await.unwrap();
    assert_eq!(name.as_str(), Some("calc"));

    let err = properties::get_property(&client, None, &calc_path(), CALC, "Colour")
        .await
        .unwrap_err();
    assert_eq!(err.remote_name(), Some(names::UNKNOWN_PROPERTY));

    let err = properties::set_property(&client, None, &calc_path(), CALC, "Name", Value::from("x"))
        .await
        .unwrap_err();
    assert_eq!(err.remote_name(), Some(names::PROPERTY_READ_ONLY));
}

#[tokio::test]
async fn descriptors_are_passed_to_handlers() {
    let (client, _server, _calc, _reg) = serve_calc().await;
    let mut file = tempfile::tempfile().unwrap();
    file.write_all(b"over the wire").unwrap();

    let mut enc = Encoder::new();
    UnixFd::from(file).encode(&mut enc);
    let msg = calc_call("ReadFd").with_body(enc.finish(Signature::new("h").unwrap()));
    let reply = client.call(msg).await.unwrap();
    let (text,): (String,) = reply.read_args().unwrap();
    assert_eq!(text, "over the wire");
}

#[tokio::test]
async fn descriptors_need_negotiation() {
    let registry = Registry::new();
    let (a, b) = std::os::unix::net::UnixStream::pair().unwrap();
    let server = tokio::spawn(ConnectionBuilder::peer(b).server().registry(registry).build());
    let client = ConnectionBuilder::peer(a).negotiate_unix_fd(false).build().await.unwrap();
    let _server = server.await.unwrap().unwrap();
    assert!(!client.can_pass_fds());

    let mut enc = Encoder::new();
    UnixFd::from(tempfile::tempfile().unwrap()).encode(&mut enc);
    let msg = calc_call("ReadFd").with_body(enc.finish(Signature::new("h").unwrap()));
    assert!(matches!(client.call(msg).await, Err(Error::InvalidArgument(_))));
}

#[tokio::test]
async fn peer_close_fails_outstanding_calls() {
    let (client, server, calc, _reg) = serve_calc().await;
    let calls: Vec<_> = (0..2)
        .map(|_| {
            let client = client.clone();
            tokio::spawn(async move { client.call(calc_call("Hang")).await })
        })
        .collect();

    tokio::time::timeout(Duration::from_secs(5), async {
        while calc.hanging.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    server.close();
    for call in calls {
        assert!(matches!(call.await.unwrap(), Err(Error::ConnectionClosed)));
    }
    tokio::time::timeout(Duration::from_secs(5), client.closed()).await.unwrap();
    assert_eq!(client.state(), State::Closed);
    assert!(matches!(client.call(calc_call("Add")).await, Err(Error::ConnectionClosed)));
}

#[tokio::test]
async fn cancelled_call_leaves_connection_usable() {
    let (client, _server, _calc, _reg) = serve_calc().await;
    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
    });
    let result = client.call_cancellable(calc_call("Hang"), &token).await;
    assert!(matches!(result, Err(Error::Cancelled)));

    // A timed-out call is simply dropped.
    let timed_out = tokio::time::timeout(Duration::from_millis(20), client.call(calc_call("Hang"))).await;
    assert!(timed_out.is_err());

    let (sum,): (i32,) = client
        .call_method(None, &calc_path(), CALC, "Add", &(1i32, 1i32))
        .await
        .unwrap();
    assert_eq!(sum, 2);
}

#[tokio::test]
async fn signals_reach_subscribers_until_dropped() {
    let (client, server, _calc, _reg) = serve_calc().await;
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let sub = client
        .subscribe(
            &calc_path(),
            CALC,
            "Changed",
            Arc::new(move |msg: &Message| {
                let (n,): (u32,) = msg.read_args().unwrap();
                let _ = tx.send(n);
            }),
        )
        .await
        .unwrap();

    server
        .emit_signal(&calc_path(), CALC, "Changed", Body::from_args(&(7u32,)).unwrap())
        .await
        .unwrap();
    let got = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
    assert_eq!(got, Some(7));

    drop(sub);
    assert_eq!(client.registry().subscribers(calc_path().as_str(), CALC, "Changed"), 0);
    server
        .emit_signal(&calc_path(), CALC, "Changed", Body::from_args(&(8u32,)).unwrap())
        .await
        .unwrap();
    // The handler owned the only sender, so the channel closes once it is gone.
    let after = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
    assert_eq!(after, None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn signals_reach_subscribers_in_emission_order() {
    const COUNT: u32 = 200;
    let (client, server, _calc, _reg) = serve_calc().await;
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let _sub = client
        .subscribe(
            &calc_path(),
            CALC,
            "Changed",
            Arc::new(move |msg: &Message| {
                let (n,): (u32,) = msg.read_args().unwrap();
                let _ = tx.send(n);
            }),
        )
        .await
        .unwrap();

    for n in 0..COUNT {
        server
            .emit_signal(&calc_path(), CALC, "Changed", Body::from_args(&(n,)).unwrap())
            .await
            .unwrap();
    }
    let mut got = Vec::new();
    while got.len() < COUNT as usize {
        let n = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
        got.push(n.unwrap());
    }
    assert_eq!(got, (0..COUNT).collect::<Vec<_>>());
}

#[tokio::test]
async fn properties_changed_layout() {
    let (client, server, _calc, _reg) = serve_calc().await;
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let _sub = client
        .subscribe(
            &calc_path(),
            dbx::PROPERTIES_INTERFACE,
            "PropertiesChanged",
            Arc::new(move |msg: &Message| {
                let _ = tx.send((msg.signature().as_str().to_owned(), msg.read_args::<(
                    String,
                    std::collections::HashMap<String, Value>,
                    Vec<String>,
                )>()));
            }),
        )
        .await
        .unwrap();

    server
        .emit_properties_changed(&calc_path(), CALC, &[("Precision", Value::UInt32(64))], &["Name"])
        .await
        .unwrap();
    let (signature, args) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(signature, "sa{sv}as");
    let (iface, changed, invalidated) = args.unwrap();
    assert_eq!(iface, CALC);
    assert_eq!(changed["Precision"], Value::UInt32(64));
    assert_eq!(invalidated, ["Name"]);
}

#[tokio::test]
async fn invalid_signals_are_rejected_before_sending() {
    let (_client, server, _calc, _reg) = serve_calc().await;
    let err = server.emit_signal(&calc_path(), "", "Changed", Body::empty()).await;
    assert!(matches!(err, Err(Error::Protocol(_))));
}

#[tokio::test]
async fn servers_answer_peer_ping() {
    let (client, _server, _calc, _reg) = serve_calc().await;
    let ping = Message::method_call(ObjectPath::root(), "Ping").with_interface(dbx::PEER_INTERFACE);
    let reply = client.call(ping).await.unwrap();
    assert!(reply.body().is_empty());
}

#[tokio::test]
async fn local_close_is_seen_by_both_sides() {
    let (client, server, _calc, _reg) = serve_calc().await;
    client.close();
    assert_eq!(client.state(), State::Closed);
    tokio::time::timeout(Duration::from_secs(5), server.closed()).await.unwrap();
    assert!(server.is_closed());
}

#[tokio::test]
async fn dropping_the_last_handle_closes_the_connection() {
    let (client, server, _calc, _reg) = serve_calc().await;
    let kept = client.clone();
    drop(client);

    // Any remaining clone keeps it open.
    let ping = Message::method_call(calc_path(), "Ping").with_interface(dbx::PEER_INTERFACE);
    kept.call(ping).await.unwrap();
    assert!(!server.is_closed());

    drop(kept);
    tokio::time::timeout(Duration::from_secs(5), server.closed()).await.unwrap();
    assert_eq!(server.state(), State::Closed);
}

#[tokio::test]
async fn builds_from_a_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("bus.sock");
    let listener = std::os::unix::net::UnixListener::bind(&socket).unwrap();
    let server = tokio::spawn(async move {
        let (stream, _) = tokio::task::spawn_blocking(move || listener.accept()).await.unwrap().unwrap();
        ConnectionBuilder::peer(stream).server().build().await
    });

    let config_path = dir.path().join("dbx.json");
    std::fs::write(
        &config_path,
        format!(r#"{{"address":"unix:path={}","hello":false}}"#, socket.display()),
    )
    .unwrap();
    let config = dbx::Config::load(&config_path).unwrap();
    let client = ConnectionBuilder::from_config(&config).build().await.unwrap();
    let server = server.await.unwrap().unwrap();

    assert_eq!(client.guid(), server.guid());
    assert_eq!(client.unique_name(), None);
}
