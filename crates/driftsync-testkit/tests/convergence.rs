//! Clients on separate devices converge through a remote.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use driftsync::Client;
use driftsync_store::MemoryDocStore;
use driftsync_sync::memory::MemoryRemoteServer;
use driftsync_sync::{RemoteConnect, RemoteConnector, RemoteRead};
use driftsync_testkit::fixtures::doc;
use driftsync_testkit::{init_tracing, Device, JsonDiffer};

const QUIET: Duration = Duration::from_millis(200);

async fn settle_all(clients: &mut [&mut Client<JsonDiffer>]) {
    for _ in 0..5 {
        for client in clients.iter_mut() {
            client.settle(QUIET).await.unwrap();
        }
    }
}

fn remote() -> (MemoryRemoteServer, Arc<dyn RemoteConnector>) {
    let server = MemoryRemoteServer::new(MemoryDocStore::new());
    let remote: Arc<dyn RemoteConnector> = Arc::new(server.clone());
    (server, remote)
}

#[tokio::test(start_paused = true)]
async fn test_devices_converge_through_remote() {
    init_tracing();
    let (server, remote) = remote();
    let mut laptop = Device::new("alice").with_remote(remote.clone());
    let mut phone = Device::new("bob").with_remote(remote);
    let mut a = laptop.open_client(JsonDiffer::new()).unwrap();
    let mut b = phone.open_client(JsonDiffer::new()).unwrap();
    settle_all(&mut [&mut a, &mut b]).await;
    assert_eq!(a.status().remote_connect, RemoteConnect::Online);
    assert_eq!(a.status().remote_read, RemoteRead::Ready);

    a.update_doc(
        doc(json!({"title": "draft", "owner": "alice"})),
        json!({"msg": "create"}),
    )
    .await
    .unwrap();
    b.update_doc(doc(json!({"title": "final"})), json!({"msg": "rename"}))
        .await
        .unwrap();
    settle_all(&mut [&mut a, &mut b]).await;

    assert_eq!(a.doc(), b.doc());
    assert_eq!(a.head(), b.head());
    let merged = a.doc().unwrap();
    assert_eq!(merged["title"], json!("final"));
    assert_eq!(merged["owner"], json!("alice"));
    assert!(a.unacked().is_empty());
    assert!(b.unacked().is_empty());

    // Two roots and one merge, identical on every device.
    assert_eq!(server.commits().await.unwrap().commits.len(), 3);
    assert_eq!(laptop.backing.len(), 3);
    assert_eq!(phone.backing.len(), 3);

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_one_remote_link_per_device() {
    init_tracing();
    let (server, remote) = remote();
    let mut laptop = Device::new("alice").with_remote(remote.clone());
    let mut phone = Device::new("bob").with_remote(remote);
    let mut tab1 = laptop.open_client(JsonDiffer::new()).unwrap();
    let mut tab2 = laptop.open_client(JsonDiffer::new()).unwrap();
    let mut p = phone.open_client(JsonDiffer::new()).unwrap();
    settle_all(&mut [&mut tab1, &mut tab2, &mut p]).await;
    assert_eq!(server.connection_count(), 2);

    tab2.update_doc(doc(json!({"x": 1})), json!({})).await.unwrap();
    settle_all(&mut [&mut tab1, &mut tab2, &mut p]).await;
    assert_eq!(tab1.doc(), tab2.doc());
    assert_eq!(p.doc(), tab2.doc());

    // Whichever tab led, the survivor keeps the device connected.
    tab1.shutdown().await.unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;
    settle_all(&mut [&mut tab2, &mut p]).await;
    assert_eq!(server.connection_count(), 2);

    p.update_doc(doc(json!({"x": 1, "y": 2})), json!({})).await.unwrap();
    settle_all(&mut [&mut tab2, &mut p]).await;
    assert_eq!(tab2.doc(), p.doc());

    tab2.shutdown().await.unwrap();
    p.shutdown().await.unwrap();
    assert_eq!(server.connection_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_offline_edits_sync_after_reconnect() {
    init_tracing();
    let (server, remote) = remote();
    let mut laptop = Device::new("alice").with_remote(remote.clone());
    let mut phone = Device::new("bob").with_remote(remote);
    let mut a = laptop.open_client(JsonDiffer::new()).unwrap();
    let mut b = phone.open_client(JsonDiffer::new()).unwrap();
    settle_all(&mut [&mut a, &mut b]).await;

    server.set_online(false);
    server.disconnect_all();
    a.update_doc(doc(json!({"offline": true})), json!({})).await.unwrap();
    settle_all(&mut [&mut a, &mut b]).await;
    assert_eq!(a.status().remote_connect, RemoteConnect::Offline);
    assert!(a.unacked().is_empty());
    assert!(b.doc().is_none());

    server.set_online(true);
    tokio::time::sleep(Duration::from_secs(4)).await;
    settle_all(&mut [&mut a, &mut b]).await;
    assert_eq!(b.doc(), a.doc());
    assert_eq!(b.status().remote_connect, RemoteConnect::Online);

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_late_joiner_loads_history() {
    init_tracing();
    let (_server, remote) = remote();
    let mut laptop = Device::new("alice").with_remote(remote.clone());
    let mut a = laptop.open_client(JsonDiffer::new()).unwrap();
    for i in 0..5 {
        a.update_doc(doc(json!({"count": i})), json!({})).await.unwrap();
    }
    a.settle(QUIET).await.unwrap();

    let mut phone = Device::new("bob").with_remote(remote);
    let mut b = phone.open_client(JsonDiffer::new()).unwrap();
    settle_all(&mut [&mut a, &mut b]).await;
    assert_eq!(b.doc(), Some(&doc(json!({"count": 4}))));
    assert_eq!(b.head(), a.head());

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}
