//! End-to-end persistence behavior: coalesced writes, idle unload with a
//! final flush, reload from storage, failure teardown, and shutdown.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use loro_hub::{
    Direction, DocumentSource, FrameLimits, HubConfig, HubServer, LoroReplica, MemoryStorage,
    Message, Provider, ProviderOptions, Replica, Storage, StorageError, VersionVector,
};

async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

fn fast_config(port: u16) -> HubConfig {
    let mut config = HubConfig::default();
    config.bind_addr = format!("127.0.0.1:{port}");
    config.persist.debounce = Duration::from_millis(40);
    config.persist.max_debounce = Duration::from_millis(160);
    config.registry.unload_delay = Duration::from_millis(80);
    config
}

async fn start(server: HubServer) -> Arc<HubServer> {
    let _ = env_logger::builder().is_test(true).try_init();
    let server = Arc::new(server);
    let runner = server.clone();
    tokio::spawn(async move {
        runner.run().await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    server
}

fn loro_pair() -> (Arc<LoroReplica>, Arc<dyn Replica>) {
    let replica = Arc::new(LoroReplica::new());
    let as_dyn: Arc<dyn Replica> = replica.clone();
    (replica, as_dyn)
}

fn edit(replica: &LoroReplica, pos: usize, s: &str) {
    replica.doc().get_text("text").insert(pos, s).unwrap();
    replica.doc().commit();
}

fn text_of(replica: &LoroReplica) -> String {
    replica.doc().get_text("text").to_string()
}

async fn wait_until<F: Fn() -> bool>(what: &str, check: F) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn test_updates_reach_storage_coalesced() {
    let port = free_port().await;
    let storage = Arc::new(MemoryStorage::new());
    let server = start(HubServer::with_storage(fast_config(port), storage.clone())).await;
    let url = format!("ws://127.0.0.1:{port}");

    let (replica, dyn_replica) = loro_pair();
    let provider = Provider::connect(&url, "doc", dyn_replica, ProviderOptions::default())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // A burst of edits lands in storage as a small number of blobs, not
    // one write per keystroke.
    for i in 0..10 {
        edit(&replica, i, "x");
    }
    wait_until("the burst to persist", || storage.log_len("doc") >= 1).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(
        storage.log_len("doc") <= 3,
        "expected coalesced writes, saw {}",
        storage.log_len("doc")
    );

    provider.destroy();
    drop(server);
}

#[tokio::test]
async fn test_unload_after_idle_flushes_and_reload_restores() {
    let port = free_port().await;
    let storage = Arc::new(MemoryStorage::new());
    let server = start(HubServer::with_storage(fast_config(port), storage.clone())).await;
    let url = format!("ws://127.0.0.1:{port}");

    {
        let (replica, dyn_replica) = loro_pair();
        let provider = Provider::connect(&url, "doc", dyn_replica, ProviderOptions::default())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        edit(&replica, 0, "survive me");
        tokio::time::sleep(Duration::from_millis(100)).await;
        provider.destroy();
    }

    // With the last connection gone, the idle timer flushes and evicts.
    wait_until("the document to unload", || {
        server.registry().peek("doc").is_none()
    })
    .await;
    assert!(storage.log_len("doc") >= 1);

    // A new client reloads the document from storage.
    let (replica, dyn_replica) = loro_pair();
    let provider = Provider::connect(&url, "doc", dyn_replica, ProviderOptions::default())
        .await
        .unwrap();
    wait_until("the reloaded state to sync", || {
        text_of(&replica) == "survive me"
    })
    .await;

    provider.destroy();
}

#[tokio::test]
async fn test_ephemeral_never_reaches_storage() {
    let port = free_port().await;
    let storage = Arc::new(MemoryStorage::new());
    let server = start(HubServer::with_storage(fast_config(port), storage.clone())).await;
    let url = format!("ws://127.0.0.1:{port}");

    let store = Arc::new(loro_hub::KeyedEphemeralStore::default());
    let (_replica, dyn_replica) = loro_pair();
    let options = ProviderOptions {
        ephemeral: Some(store.clone()),
        ..ProviderOptions::default()
    };
    let provider = Provider::connect(&url, "doc", dyn_replica, options)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    for i in 0..20u8 {
        store.set("cursor", &[i]);
    }

    // Give any (wrong) persistence path ample time to fire.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(storage.log_len("doc"), 0);
    let doc = server.registry().peek("doc").unwrap();
    assert_eq!(doc.pending_len().await, 0);

    provider.destroy();
}

#[tokio::test]
async fn test_shutdown_flushes_dirty_documents() {
    let port = free_port().await;
    let storage = Arc::new(MemoryStorage::new());
    // Long debounce: shutdown must not wait for it.
    let mut config = fast_config(port);
    config.persist.debounce = Duration::from_secs(60);
    config.persist.max_debounce = Duration::from_secs(120);
    let server = start(HubServer::with_storage(config, storage.clone())).await;
    let url = format!("ws://127.0.0.1:{port}");

    let (replica, dyn_replica) = loro_pair();
    let provider = Provider::connect(&url, "doc", dyn_replica, ProviderOptions::default())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    edit(&replica, 0, "do not lose this");
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(storage.log_len("doc"), 0, "debounce still pending");
    server.shutdown();
    wait_until("shutdown to flush", || storage.log_len("doc") >= 1).await;

    provider.destroy();
}

/// Storage whose writes always fail; loads succeed.
struct BrokenWrites;

#[async_trait]
impl Storage for BrokenWrites {
    async fn load_document(&self, _name: &str) -> Result<DocumentSource, StorageError> {
        Ok(DocumentSource::Updates(Vec::new()))
    }

    async fn store_document(&self, _name: &str, _update: &[u8]) -> Result<(), StorageError> {
        Err(StorageError::Backend("disk on fire".into()))
    }
}

#[tokio::test]
async fn test_storage_failure_closes_attachments() {
    let port = free_port().await;
    let server = start(HubServer::with_storage(fast_config(port), Arc::new(BrokenWrites))).await;
    let url = format!("ws://127.0.0.1:{port}");

    // Raw client so the close code is observable.
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let join = Message::SyncRequest {
        doc: "doc".into(),
        version: String::new(),
    };
    ws.send(WsMessage::Binary(join.encode().into())).await.unwrap();

    let (writer, _) = loro_pair();
    edit(&writer, 0, "x");
    let update = writer.export_from(&VersionVector::new()).unwrap().remove(0);
    let frame = Message::Update {
        doc: "doc".into(),
        update,
    };
    ws.send(WsMessage::Binary(frame.encode().into())).await.unwrap();

    // Retry budget: max_debounce * 3 = 480ms, then StorageFailure.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    let mut close_code = None;
    loop {
        match tokio::time::timeout_at(deadline, ws.next()).await {
            Ok(Some(Ok(WsMessage::Close(frame)))) => {
                close_code = frame.map(|f| u16::from(f.code));
                break;
            }
            Ok(Some(Ok(_))) => continue,
            Ok(Some(Err(_))) | Ok(None) => break,
            Err(_) => panic!("never closed after storage failure"),
        }
    }
    assert_eq!(close_code, Some(4501));

    // The corpse is not resurrected silently into the registry view.
    wait_until("document to be destroyed", || {
        server.registry().peek("doc").is_none()
    })
    .await;
}

#[tokio::test]
async fn test_load_failure_reported_to_requester() {
    struct BrokenLoads;

    #[async_trait]
    impl Storage for BrokenLoads {
        async fn load_document(&self, _name: &str) -> Result<DocumentSource, StorageError> {
            Err(StorageError::Backend("index corrupt".into()))
        }

        async fn store_document(&self, _name: &str, _update: &[u8]) -> Result<(), StorageError> {
            Ok(())
        }
    }

    let port = free_port().await;
    let server = start(HubServer::with_storage(fast_config(port), Arc::new(BrokenLoads))).await;
    let url = format!("ws://127.0.0.1:{port}");

    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let join = Message::SyncRequest {
        doc: "doc".into(),
        version: String::new(),
    };
    ws.send(WsMessage::Binary(join.encode().into())).await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let mut close_code = None;
    loop {
        match tokio::time::timeout_at(deadline, ws.next()).await {
            Ok(Some(Ok(WsMessage::Close(frame)))) => {
                close_code = frame.map(|f| u16::from(f.code));
                break;
            }
            Ok(Some(Ok(_))) => continue,
            Ok(Some(Err(_))) | Ok(None) => break,
            Err(_) => panic!("load failure never surfaced"),
        }
    }
    assert_eq!(close_code, Some(4500));
    assert!(server.registry().is_empty(), "failed load must not register");
}

#[tokio::test]
async fn test_back_to_back_flushes_idempotent() {
    // Two flushes with no intervening updates store nothing extra.
    let storage = Arc::new(MemoryStorage::new());
    let server = HubServer::with_storage(fast_config(free_port().await), storage.clone());

    let (writer, _) = loro_pair();
    edit(&writer, 0, "once");
    let update = writer.export_from(&VersionVector::new()).unwrap().remove(0);
    server.apply_update("doc", update).await.unwrap();

    let doc = server.registry().peek("doc").unwrap();
    doc.flush().await.unwrap();
    let after_first = storage.log_len("doc");
    doc.flush().await.unwrap();
    assert_eq!(storage.log_len("doc"), after_first);

    // Reloading what was stored reproduces the document.
    let blobs = match storage.load_document("doc").await.unwrap() {
        DocumentSource::Updates(blobs) => blobs,
        DocumentSource::Snapshot(snapshot) => vec![snapshot],
    };
    let (restored, _) = loro_pair();
    for blob in &blobs {
        restored.import(blob).unwrap();
    }
    assert_eq!(text_of(&restored), "once");
}

#[tokio::test]
async fn test_sync_batch_decode_over_wire_shape() {
    // The server-emitted batch is decodable with the public framer: this
    // guards the exact wire layout (count, then N varbytes).
    let port = free_port().await;
    let storage = Arc::new(MemoryStorage::new());
    let server = start(HubServer::with_storage(fast_config(port), storage)).await;
    let url = format!("ws://127.0.0.1:{port}");

    let (writer, _) = loro_pair();
    edit(&writer, 0, "payload");
    let update = writer.export_from(&VersionVector::new()).unwrap().remove(0);
    server.apply_update("doc", update).await.unwrap();

    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let join = Message::SyncRequest {
        doc: "doc".into(),
        version: String::new(),
    };
    ws.send(WsMessage::Binary(join.encode().into())).await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        match tokio::time::timeout_at(deadline, ws.next())
            .await
            .expect("no batch arrived")
        {
            Some(Ok(WsMessage::Binary(data))) => {
                let bytes: Vec<u8> = data.into();
                let message =
                    Message::decode(&bytes, Direction::ServerToClient, &FrameLimits::default())
                        .unwrap();
                match message {
                    Message::SyncBatch { doc, updates } => {
                        assert_eq!(doc, "doc");
                        assert_eq!(updates.len(), 1);
                        // Round-trip reproduces the exact frame bytes.
                        assert_eq!(
                            Message::SyncBatch { doc, updates }.encode(),
                            bytes
                        );
                        return;
                    }
                    other => panic!("expected sync batch, got {other:?}"),
                }
            }
            Some(Ok(_)) => {}
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}
