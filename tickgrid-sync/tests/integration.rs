//! Integration tests for end-to-end WebSocket replication.
//!
//! These tests start real master and relay servers and connect real
//! clients, verifying the full edit pipeline.

use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tickgrid_sync::protocol::{Edit, Snapshot};
use tickgrid_sync::relay::{LinkState, RelayError};
use tickgrid_sync::server::{ServerConfig, ServerError, SyncServer};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Start a server on a free port, return it and its client URL.
async fn start_server(config: ServerConfig) -> (Arc<SyncServer>, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = Arc::new(SyncServer::new(config));
    let runner = server.clone();
    tokio::spawn(async move {
        runner.serve(listener).await.unwrap();
    });
    (server, format!("ws://127.0.0.1:{port}/ws"))
}

async fn connect(url: &str) -> Client {
    let (ws, _) = timeout(Duration::from_secs(2), tokio_tungstenite::connect_async(url))
        .await
        .expect("connect timed out")
        .expect("connect failed");
    ws
}

/// Next binary frame, skipping control frames.
async fn next_binary(client: &mut Client) -> Vec<u8> {
    loop {
        let msg = timeout(Duration::from_secs(2), client.next())
            .await
            .expect("no message within timeout")
            .expect("stream ended")
            .expect("read error");
        match msg {
            Message::Binary(data) => return data.to_vec(),
            Message::Close(_) => panic!("connection closed"),
            _ => {}
        }
    }
}

async fn send_raw(client: &mut Client, bytes: Vec<u8>) {
    client.send(Message::Binary(bytes.into())).await.unwrap();
}

async fn send_edit(client: &mut Client, edit: Edit) {
    send_raw(client, edit.encode().to_vec()).await;
}

/// Poll until the relay's master link is up.
async fn wait_relaying(relay: &SyncServer) {
    let link = relay.upstream().expect("relay has an upstream link");
    for _ in 0..100 {
        if link.state().await == LinkState::Relaying {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("relay never reached Relaying");
}

/// Poll until `n` clients are registered. Relay clients get no snapshot
/// to wait on.
async fn wait_peers(server: &SyncServer, n: usize) {
    for _ in 0..100 {
        if server.hub().peer_count().await == n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected {n} registered clients");
}

#[tokio::test]
async fn test_new_client_receives_snapshot() {
    let (_server, url) = start_server(ServerConfig::for_testing(8)).await;

    let mut alice = connect(&url).await;
    assert_eq!(next_binary(&mut alice).await, vec![0, 0, 0, 0]);

    send_edit(&mut alice, Edit::set(3)).await;
    assert_eq!(next_binary(&mut alice).await, vec![1, 0, 0, 0, 3]);

    let mut bob = connect(&url).await;
    assert_eq!(next_binary(&mut bob).await, vec![0x10, 0, 0, 0]);
}

#[tokio::test]
async fn test_edit_fans_out_to_every_client() {
    let (server, url) = start_server(ServerConfig::for_testing(64)).await;

    let mut clients = Vec::new();
    for _ in 0..3 {
        let mut c = connect(&url).await;
        assert_eq!(next_binary(&mut c).await.len(), 8);
        clients.push(c);
    }

    send_edit(&mut clients[0], Edit::set(40)).await;
    for c in clients.iter_mut() {
        assert_eq!(next_binary(c).await, vec![1, 0, 0, 0, 40]);
    }

    send_edit(&mut clients[2], Edit::clear(40)).await;
    for c in clients.iter_mut() {
        assert_eq!(next_binary(c).await, vec![0, 0, 0, 0, 40]);
    }

    assert!(!server.cells().get(40).unwrap());
    assert_eq!(server.stats().edits_applied, 2);
    assert_eq!(server.stats().active_connections, 3);
}

#[tokio::test]
async fn test_bad_messages_keep_connection_open() {
    let (server, url) = start_server(ServerConfig::for_testing(8)).await;
    let mut alice = connect(&url).await;
    next_binary(&mut alice).await;

    send_raw(&mut alice, vec![1, 0, 0]).await;
    send_raw(&mut alice, vec![9, 0, 0, 0, 1]).await;
    send_edit(&mut alice, Edit::set(8)).await;
    alice.send(Message::Text("hello".into())).await.unwrap();
    send_edit(&mut alice, Edit::set(7)).await;

    // Only the valid edit comes back.
    assert_eq!(next_binary(&mut alice).await, vec![1, 0, 0, 0, 7]);
    assert_eq!(server.cells().count_set(), 1);
    assert_eq!(server.stats().edits_rejected, 4);
}

#[tokio::test]
async fn test_wrong_path_rejected() {
    let (_server, url) = start_server(ServerConfig::for_testing(8)).await;
    let other = url.replace("/ws", "/other");

    match tokio_tungstenite::connect_async(&other).await {
        Err(tungstenite::Error::Http(resp)) => assert_eq!(resp.status(), 404),
        Err(e) => panic!("unexpected error: {e}"),
        Ok(_) => panic!("upgrade on the wrong path should fail"),
    }
}

#[tokio::test]
async fn test_disconnect_unregisters_client() {
    let (server, url) = start_server(ServerConfig::for_testing(8)).await;
    let mut alice = connect(&url).await;
    next_binary(&mut alice).await;
    assert_eq!(server.hub().peer_count().await, 1);

    alice.close(None).await.unwrap();
    drop(alice);

    wait_peers(&server, 0).await;
    assert_eq!(server.stats().connections_closed, 1);
}

#[tokio::test]
async fn test_shutdown_closes_clients() {
    let (server, url) = start_server(ServerConfig::for_testing(8)).await;
    let mut alice = connect(&url).await;
    next_binary(&mut alice).await;

    server.shutdown().await;

    let ended = timeout(Duration::from_secs(2), async {
        loop {
            match alice.next().await {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(ended.is_ok(), "client should see the connection end");
}

#[tokio::test]
async fn test_relay_mirrors_master_edits() {
    let (master, master_url) = start_server(ServerConfig::for_testing(8)).await;
    let mut writer = connect(&master_url).await;
    next_binary(&mut writer).await;
    send_edit(&mut writer, Edit::set(1)).await;
    next_binary(&mut writer).await;

    let (relay, relay_url) =
        start_server(ServerConfig::relay_for_testing(8, master_url.clone())).await;
    wait_relaying(&relay).await;
    // Snapshot from the master was loaded.
    assert!(relay.cells().get(1).unwrap());

    let mut watcher = connect(&relay_url).await;
    wait_peers(&relay, 1).await;

    send_edit(&mut writer, Edit::set(5)).await;
    assert_eq!(next_binary(&mut writer).await, vec![1, 0, 0, 0, 5]);

    // Relay clients get no snapshot, so the first frame is the edit itself.
    assert_eq!(next_binary(&mut watcher).await, vec![1, 0, 0, 0, 5]);
    assert!(relay.cells().get(5).unwrap());
    assert!(master.cells().get(5).unwrap());
    assert_eq!(relay.stats().upstream_edits, 1);
}

#[tokio::test]
async fn test_relay_forwards_client_edits_to_master() {
    let (master, master_url) = start_server(ServerConfig::for_testing(8)).await;
    let mut observer = connect(&master_url).await;
    next_binary(&mut observer).await;

    let (relay, relay_url) =
        start_server(ServerConfig::relay_for_testing(8, master_url.clone())).await;
    wait_relaying(&relay).await;

    let mut client = connect(&relay_url).await;
    send_edit(&mut client, Edit::set(2)).await;

    // Local echo first, then the master's confirmation.
    assert_eq!(next_binary(&mut client).await, vec![1, 0, 0, 0, 2]);
    assert_eq!(next_binary(&mut client).await, vec![1, 0, 0, 0, 2]);

    assert_eq!(next_binary(&mut observer).await, vec![1, 0, 0, 0, 2]);
    assert!(master.cells().get(2).unwrap());
    assert!(relay.cells().get(2).unwrap());
    assert_eq!(relay.stats().upstream_forwards, 1);
}

#[tokio::test]
async fn test_relay_startup_fails_without_master() {
    // Bind then drop to get a port with nothing listening.
    let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_url = format!("ws://{}/ws", dead.local_addr().unwrap());
    drop(dead);

    let relay = SyncServer::new(ServerConfig::relay_for_testing(8, dead_url));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let result = relay.serve(listener).await;

    assert!(matches!(
        result,
        Err(ServerError::Relay(RelayError::StartupUnreachable { .. }))
    ));
}

#[tokio::test]
async fn test_snapshot_partial_group() {
    // 40 cells pack into two 32-cell groups.
    let (_server, url) = start_server(ServerConfig::for_testing(40)).await;
    let mut alice = connect(&url).await;
    assert_eq!(next_binary(&mut alice).await.len(), 8);

    send_edit(&mut alice, Edit::set(39)).await;
    next_binary(&mut alice).await;

    let mut bob = connect(&url).await;
    let snapshot = Snapshot::from_bytes(next_binary(&mut bob).await);
    assert_eq!(snapshot.cell(39), Some(true));
    assert_eq!(snapshot.count_set(), 1);
}
