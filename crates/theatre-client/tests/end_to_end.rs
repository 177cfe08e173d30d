use chrono::Utc;
use std::{future::Future, sync::Arc, time::Duration};
use tempfile::NamedTempFile;
use theatre_client::{
    ConnectionStatus, HttpTransport, NotificationCenter, OfflineQueue, RecordingAlertSink, TabBus,
};
use theatre_core::tabs::TabId;
use theatre_core::{NewNotification, NotificationType, Priority, Recipient};
use theatre_hub::{AppState, ConnectionRegistry, HubConfig};
use theatre_storage::{NotificationStore, QueueStore, SqliteOperationalSource};
use tokio::sync::{oneshot, watch};

struct TestHub {
    base_url: String,
    state: AppState,
    _shutdown: oneshot::Sender<()>,
}

async fn spawn_hub() -> TestHub {
    let store = Arc::new(NotificationStore::open_in_memory().expect("open store"));
    let source = Arc::new(SqliteOperationalSource::open_in_memory().expect("open source"));
    let config = HubConfig {
        poll_interval: Duration::from_millis(100),
        ..HubConfig::default()
    };
    let state = AppState::new(config, store, source, Arc::new(ConnectionRegistry::new()));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let serve_state = state.clone();
    tokio::spawn(async move {
        let _ = theatre_hub::serve(listener, serve_state, async move {
            let _ = shutdown_rx.await;
        })
        .await;
    });
    TestHub {
        base_url: format!("http://{addr}"),
        state,
        _shutdown: shutdown_tx,
    }
}

fn nurse() -> Recipient {
    Recipient::new("u-nurse", "nurse")
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check().await {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pushed_notification_reaches_both_tabs_once() {
    let hub = spawn_hub().await;
    let bus = TabBus::default();
    let alerts = Arc::new(RecordingAlertSink::default());
    let queue_file = NamedTempFile::new().expect("temp file");
    let queue_store = Arc::new(QueueStore::open(queue_file.path()).expect("open queue"));

    let make_tab = |name: &str| {
        let transport = Arc::new(HttpTransport::new(hub.base_url.clone(), nurse()));
        Arc::new(
            NotificationCenter::new(TabId(name.to_string()), transport, alerts.clone())
                .with_tab_bus(&bus)
                .with_queue(Arc::new(OfflineQueue::new(queue_store.clone(), name))),
        )
    };
    let tab_a = make_tab("tab-a");
    let tab_b = make_tab("tab-b");

    let (stop_tx, stop_rx) = watch::channel(false);
    let run_a = tokio::spawn(tab_a.clone().run(stop_rx.clone()));
    let run_b = tokio::spawn(tab_b.clone().run(stop_rx));

    eventually("both tabs connected", || async {
        tab_a.status() == ConnectionStatus::Connected
            && tab_b.status() == ConnectionStatus::Connected
    })
    .await;

    hub.state
        .store
        .create_notification(
            &NewNotification::new(NotificationType::Emergency, "Code red in OR-3", "")
                .with_priority(Priority::Urgent)
                .for_role("nurse"),
            Utc::now(),
        )
        .expect("create");
    hub.state.registry.wake_all();

    eventually("notification delivered", || async {
        tab_a.notifications().len() == 1 && tab_b.notifications().len() == 1
    })
    .await;
    assert_eq!(tab_a.unread_count(), 1);
    assert_eq!(tab_b.unread_count(), 1);
    let id = tab_a.notifications()[0].id;

    tab_a.mark_as_read(id).await.expect("mark read");
    eventually("tab b sees the read flag", || async {
        tab_b.notifications().iter().all(|n| n.read) && tab_b.unread_count() == 0
    })
    .await;
    assert_eq!(
        hub.state.store.unread_count(&nurse()).expect("server count"),
        0
    );

    let _ = stop_tx.send(true);
    run_a.await.expect("tab a stopped");
    run_b.await.expect("tab b stopped");
    assert_eq!(hub.state.registry.connection_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn offline_mark_all_read_is_replayed_when_back_online() {
    let hub = spawn_hub().await;
    for title in ["Gauze low", "Sutures out"] {
        hub.state
            .store
            .create_notification(
                &NewNotification::new(NotificationType::StockLow, title, "").for_recipient("u-nurse"),
                Utc::now(),
            )
            .expect("create");
    }

    let queue_file = NamedTempFile::new().expect("temp file");
    let queue = Arc::new(OfflineQueue::new(
        Arc::new(QueueStore::open(queue_file.path()).expect("open queue")),
        "tab-a",
    ));
    let tab = NotificationCenter::new(
        TabId("tab-a".to_string()),
        Arc::new(HttpTransport::new(hub.base_url.clone(), nurse())),
        Arc::new(RecordingAlertSink::default()),
    )
    .with_queue(queue);

    tab.fetch_notifications().await.expect("fetch");
    assert_eq!(tab.unread_count(), 2);

    tab.set_online(false).await;
    tab.mark_all_as_read().await.expect("queued");
    assert_eq!(tab.unread_count(), 0);
    assert_eq!(tab.pending_writes().expect("pending"), 1);
    assert_eq!(
        hub.state.store.unread_count(&nurse()).expect("server count"),
        2
    );

    tab.set_online(true).await;
    assert_eq!(tab.pending_writes().expect("pending"), 0);
    assert_eq!(
        hub.state.store.unread_count(&nurse()).expect("server count"),
        0
    );
    tab.fetch_notifications().await.expect("refetch");
    assert_eq!(tab.unread_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unreachable_hub_keeps_reconnecting_until_stopped() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);

    let tab = Arc::new(NotificationCenter::new(
        TabId("tab-a".to_string()),
        Arc::new(HttpTransport::new(format!("http://{addr}"), nurse())),
        Arc::new(RecordingAlertSink::default()),
    ));
    let (stop_tx, stop_rx) = watch::channel(false);
    let running = tokio::spawn(tab.clone().run(stop_rx));

    eventually("a failed attempt", || async {
        tab.snapshot().reconnect_attempts >= 1
    })
    .await;
    assert_eq!(tab.status(), ConnectionStatus::Disconnected);

    let _ = stop_tx.send(true);
    tokio::time::timeout(Duration::from_secs(1), running)
        .await
        .expect("pending reconnect cancelled")
        .expect("join");
}
