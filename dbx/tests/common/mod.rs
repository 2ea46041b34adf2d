use std::os::unix::net::UnixStream;

use dbx::{Connection, ConnectionBuilder, Registry};

/// A client connected to a peer-to-peer server that dispatches through `registry`.
pub async fn pair(registry: Registry) -> (Connection, Connection) {
    let (a, b) = UnixStream::pair().unwrap();
    let server = tokio::spawn(ConnectionBuilder::peer(b).server().registry(registry).build());
    let client = ConnectionBuilder::peer(a).build().await.unwrap();
    let server = server.await.unwrap().unwrap();
    (client, server)
}
