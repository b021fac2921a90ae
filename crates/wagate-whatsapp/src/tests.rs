use crate::device_store::{DeviceScope, SqlxDeviceContainer};
use crate::events::{handle_event, history_payload, Shared};
use crate::qr::{generate_qr_image, generate_qr_terminal};
use parking_lot::Mutex;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::sync::atomic::AtomicBool;
use std::time::Duration;
use tokio::sync::mpsc;
use wacore::store::traits::{DeviceStore, SignalStore};
use wacore::types::events::{Event, PresenceUpdate};
use wacore_binary::jid::{Jid, SERVER_JID};
use wagate_core::error::GatewayError;
use wagate_core::protocol::{DeviceContainer, ProtocolEvent, QrEvent};
use wagate_core::session::{ProxyConfig, ProxyType};

async fn test_pool() -> SqlitePool {
    let opts = SqliteConnectOptions::from_str("sqlite::memory:")
        .unwrap()
        .create_if_missing(true);
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(opts)
        .await
        .unwrap()
}

async fn test_container() -> (SqlxDeviceContainer, SqlitePool) {
    let pool = test_pool().await;
    let container = SqlxDeviceContainer::from_pool(pool.clone(), "WAGATE")
        .await
        .unwrap();
    (container, pool)
}

/// Simulate a pairing by giving the device a `wa_device_info` row and a JID.
async fn fake_pair(pool: &SqlitePool, key: i64, jid: &str) {
    sqlx::query("INSERT INTO wa_device_info (device_id, data) VALUES (?, ?)")
        .bind(key)
        .bind(vec![1u8, 2, 3])
        .execute(pool)
        .await
        .unwrap();
    DeviceScope::new(pool.clone(), key)
        .bind_jid(jid)
        .await
        .unwrap();
}

#[test]
fn test_generate_qr_terminal() {
    let qr = generate_qr_terminal("2@abc,def,ghi").unwrap();
    assert!(!qr.is_empty());
    let lines: Vec<&str> = qr.lines().collect();
    let width = lines[0].chars().count();
    assert!(lines.iter().all(|l| l.chars().count() == width));
    assert_eq!(lines.len(), width.div_ceil(2));
}

#[test]
fn test_generate_qr_image() {
    let png = generate_qr_image("2@abc,def,ghi").unwrap();
    // PNG magic bytes.
    assert_eq!(&png[..4], &[0x89, 0x50, 0x4E, 0x47]);
}

#[tokio::test]
async fn test_new_devices_are_distinct_and_unpaired() {
    let (container, _) = test_container().await;
    let a = container.new_device().await.unwrap();
    let b = container.new_device().await.unwrap();
    assert_ne!(a.key(), b.key());
    assert!(!a.is_paired());
    assert!(a.jid().is_none());
}

#[tokio::test]
async fn test_load_device_finds_paired_device() {
    let (container, pool) = test_container().await;
    let device = container.new_device().await.unwrap();

    let jid = "12345@s.whatsapp.net";
    assert!(container.load_device(jid).await.unwrap().is_none());
    fake_pair(&pool, device.key(), jid).await;

    let loaded = container.load_device(jid).await.unwrap().unwrap();
    assert_eq!(loaded.key(), device.key());
    assert_eq!(loaded.jid(), Some(jid));
}

#[tokio::test]
async fn test_load_device_rejects_bad_jid() {
    let (container, _) = test_container().await;
    assert!(matches!(
        container.load_device("not-a-jid").await,
        Err(GatewayError::Validation(_))
    ));
}

#[tokio::test]
async fn test_delete_device_removes_credentials() {
    let (container, pool) = test_container().await;
    let device = container.new_device().await.unwrap();
    let jid = "999@s.whatsapp.net";
    fake_pair(&pool, device.key(), jid).await;

    container.delete_device(&device).await.unwrap();
    assert!(container.load_device(jid).await.unwrap().is_none());
    let (left,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM wa_device_info")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(left, 0);
}

#[tokio::test]
async fn test_scopes_do_not_share_rows() {
    let (container, pool) = test_container().await;
    let a = container.new_device().await.unwrap();
    let b = container.new_device().await.unwrap();
    let scope_a = DeviceScope::new(pool.clone(), a.key());
    let scope_b = DeviceScope::new(pool.clone(), b.key());

    scope_a.put_identity("peer.0", [7u8; 32]).await.unwrap();
    assert_eq!(
        scope_a.load_identity("peer.0").await.unwrap(),
        Some(vec![7u8; 32])
    );
    assert!(scope_b.load_identity("peer.0").await.unwrap().is_none());
    assert!(!scope_b.exists().await.unwrap());

    scope_a.wipe().await.unwrap();
    assert!(scope_a.load_identity("peer.0").await.unwrap().is_none());
}

#[tokio::test]
async fn test_client_reports_pairing_state() {
    let (container, pool) = test_container().await;
    let (tx, _rx) = mpsc::channel(8);

    let fresh = container.new_device().await.unwrap();
    let client = container.new_client(fresh, tx.clone()).await.unwrap();
    assert!(!client.is_paired());
    assert!(!client.is_connected());
    assert!(client.qr_channel().await.is_ok());

    let paired = container.new_device().await.unwrap();
    fake_pair(&pool, paired.key(), "555@s.whatsapp.net").await;
    let paired = container
        .load_device("555@s.whatsapp.net")
        .await
        .unwrap()
        .unwrap();
    let client = container.new_client(paired, tx).await.unwrap();
    assert!(client.is_paired());
    assert_eq!(client.device_jid().as_deref(), Some("555@s.whatsapp.net"));
    assert!(matches!(
        client.qr_channel().await,
        Err(GatewayError::Validation(_))
    ));
}

#[tokio::test]
async fn test_disconnect_closes_qr_stream() {
    let (container, _) = test_container().await;
    let (tx, _events) = mpsc::channel(8);
    let device = container.new_device().await.unwrap();
    let client = container.new_client(device, tx).await.unwrap();

    let mut qr = client.qr_channel().await.unwrap();
    client.disconnect().await;
    assert_eq!(qr.recv().await, Some(QrEvent::Timeout));
    assert_eq!(qr.recv().await, None);
}

#[tokio::test]
async fn test_proxy_is_refused_by_transport() {
    let (container, _) = test_container().await;
    let (tx, _events) = mpsc::channel(8);
    let device = container.new_device().await.unwrap();
    let client = container.new_client(device, tx).await.unwrap();

    let proxy = ProxyConfig {
        proxy_type: ProxyType::Socks5,
        host: "127.0.0.1".into(),
        port: 1080,
        username: None,
        password: None,
    };
    assert!(client.set_proxy(None).await.is_ok());
    assert!(matches!(
        client.set_proxy(Some(&proxy)).await,
        Err(GatewayError::ProxyError(_))
    ));
}

#[tokio::test]
async fn test_purge_unpaired_keeps_paired_devices() {
    let (container, pool) = test_container().await;
    let paired = container.new_device().await.unwrap();
    fake_pair(&pool, paired.key(), "777@s.whatsapp.net").await;
    let orphan = container.new_device().await.unwrap();
    DeviceScope::new(pool.clone(), orphan.key())
        .put_identity("peer.0", [1u8; 32])
        .await
        .unwrap();
    container.new_device().await.unwrap();

    assert_eq!(container.purge_unpaired().await.unwrap(), 2);
    assert_eq!(container.purge_unpaired().await.unwrap(), 0);

    let (left,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM wa_devices")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(left, 1);
    assert!(container
        .load_device("777@s.whatsapp.net")
        .await
        .unwrap()
        .is_some());
    let (identities,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM wa_identities")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(identities, 0);
}

#[tokio::test]
async fn test_logout_while_offline_still_wipes() {
    let (container, pool) = test_container().await;
    let (tx, _events) = mpsc::channel(8);
    let device = container.new_device().await.unwrap();
    let jid = "888@s.whatsapp.net";
    fake_pair(&pool, device.key(), jid).await;
    let device = container.load_device(jid).await.unwrap().unwrap();
    let client = container.new_client(device, tx).await.unwrap();
    assert!(client.is_paired());

    client.logout().await.unwrap();

    assert!(!client.is_paired());
    assert!(!client.is_connected());
    assert!(container.load_device(jid).await.unwrap().is_none());
}

fn shared_for(pool: &SqlitePool) -> (Shared, mpsc::Receiver<ProtocolEvent>) {
    let (tx, rx) = mpsc::channel(8);
    let shared = Shared {
        scope: DeviceScope::new(pool.clone(), 1),
        label: "device 1".into(),
        connected: AtomicBool::new(false),
        jid: Mutex::new(None),
        qr_tx: Mutex::new(None),
        events: tx,
    };
    (shared, rx)
}

#[tokio::test]
async fn test_qr_code_carries_library_timeout() {
    let (_, pool) = test_container().await;
    let (shared, _events) = shared_for(&pool);
    let (qr_tx, mut qr) = mpsc::channel(8);
    *shared.qr_tx.lock() = Some(qr_tx);

    handle_event(
        Event::PairingQrCode {
            code: "2@abc".into(),
            timeout: Duration::from_secs(60),
        },
        &shared,
    )
    .await;

    assert_eq!(
        qr.recv().await,
        Some(QrEvent::Code {
            code: "2@abc".into(),
            timeout: Some(Duration::from_secs(60)),
        })
    );
}

#[tokio::test]
async fn test_presence_is_forwarded() {
    let (_, pool) = test_container().await;
    let (shared, mut events) = shared_for(&pool);

    let update = PresenceUpdate {
        from: Jid::new("12345", SERVER_JID),
        unavailable: true,
        last_seen: None,
    };
    handle_event(Event::Presence(update), &shared).await;

    match events.recv().await {
        Some(ProtocolEvent::Presence(payload)) => {
            assert_eq!(payload["unavailable"], true);
        }
        other => panic!("expected a presence event, got {other:?}"),
    }
}

#[test]
fn test_history_payload_summarizes_chunk() {
    let sync = waproto::whatsapp::HistorySync {
        sync_type: 2,
        chunk_order: Some(3),
        progress: Some(40),
        ..Default::default()
    };
    let payload = history_payload(&sync);
    assert_eq!(payload["syncType"], 2);
    assert_eq!(payload["conversations"], 0);
    assert_eq!(payload["chunkOrder"], 3);
    assert_eq!(payload["progress"], 40);
}
