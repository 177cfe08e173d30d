//! Server push: one SSE stream per connected client.
//!
//! Each stream owns a poll task that diffs the store against the last id it
//! sent. The task stops when the stream's [`ConnectionGuard`] is dropped,
//! which happens when the client goes away and axum drops the body.

use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
};
use futures_util::Stream;
use std::{
    convert::Infallible,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};
use theatre_core::channel::{
    ChannelEvent, InitPayload, NotificationsPayload, TimelineAlert, TimelineAlertPayload,
};
use theatre_core::{NotificationId, Recipient};
use theatre_storage::{NotificationStore, StorageError};
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, info, warn};

use crate::{
    error::ApiError,
    identity::Identity,
    registry::{ConnectionGuard, Registration},
    AppState,
};

const POLL_BATCH: usize = 100;
const HEARTBEAT_TEXT: &str = "heartbeat";

pub struct ChannelStream {
    rx: mpsc::Receiver<Event>,
    _guard: ConnectionGuard,
}

impl Stream for ChannelStream {
    type Item = Result<Event, Infallible>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx).map(|event| event.map(Ok))
    }
}

pub async fn stream_handler(
    State(state): State<AppState>,
    Identity(recipient): Identity,
) -> Result<Sse<ChannelStream>, ApiError> {
    let stream = open_channel(&state, recipient).await?;
    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(state.config.heartbeat)
            .text(HEARTBEAT_TEXT),
    ))
}

/// Registers a connection, queues the `init` event and starts the poll task.
///
/// The `init` count and the poll cursor come from one store read, so a row
/// landing meanwhile is counted and delivered rather than skipped.
pub async fn open_channel(
    state: &AppState,
    recipient: Recipient,
) -> Result<ChannelStream, ApiError> {
    let (unread_count, last_id) = {
        let recipient = recipient.clone();
        state
            .with_store(move |store| store.stream_cursor(&recipient))
            .await?
    };

    let (tx, rx) = mpsc::channel(state.config.channel_capacity.max(1));
    if let Some(event) = to_sse_event(&ChannelEvent::Init(InitPayload { unread_count })) {
        let _ = tx.try_send(event);
    }

    let Registration { guard, wake, stop } = state.registry.register(&recipient.id);
    info!(
        event = "channel_open",
        conn_id = %guard.conn_id(),
        recipient = %recipient.id,
        unread = unread_count
    );

    tokio::spawn(poll_loop(PollTask {
        store: state.store.clone(),
        recipient,
        conn_id: guard.conn_id().to_string(),
        last_id,
        interval: state.config.poll_interval,
        tx,
        wake,
        stop,
    }));

    Ok(ChannelStream { rx, _guard: guard })
}

struct PollTask {
    store: Arc<NotificationStore>,
    recipient: Recipient,
    conn_id: String,
    last_id: NotificationId,
    interval: Duration,
    tx: mpsc::Sender<Event>,
    wake: Arc<Notify>,
    stop: oneshot::Receiver<()>,
}

async fn poll_loop(task: PollTask) {
    let PollTask {
        store,
        recipient,
        conn_id,
        mut last_id,
        interval,
        tx,
        wake,
        mut stop,
    } = task;

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    'poll: loop {
        tokio::select! {
            _ = &mut stop => break 'poll,
            _ = ticker.tick() => {}
            _ = wake.notified() => {}
        }

        let polled = tokio::task::spawn_blocking({
            let store = store.clone();
            let recipient = recipient.clone();
            let mut cursor = last_id;
            move || poll_once(&store, &recipient, &mut cursor).map(|events| (events, cursor))
        })
        .await;
        let events = match polled {
            Ok(Ok((events, cursor))) => {
                last_id = cursor;
                events
            }
            Ok(Err(err)) => {
                warn!(event = "channel_poll_error", conn_id = %conn_id, error = %err);
                continue;
            }
            Err(err) => {
                warn!(event = "channel_poll_task_failed", conn_id = %conn_id, error = %err);
                continue;
            }
        };

        for event in events {
            let Some(sse_event) = to_sse_event(&event) else {
                continue;
            };
            tokio::select! {
                _ = &mut stop => break 'poll,
                sent = tx.send(sse_event) => {
                    if sent.is_err() {
                        break 'poll;
                    }
                    debug!(event = "channel_emit", conn_id = %conn_id, name = event.name());
                }
            }
        }
    }

    info!(event = "channel_closed", conn_id = %conn_id, recipient = %recipient.id);
}

/// Events owed to `recipient` since `last_id`, advancing the cursor.
///
/// New rows produce one `notifications` event carrying the authoritative
/// unread count, followed by a `timeline-alert` batch when any of them are
/// timeline-critical.
pub fn poll_once(
    store: &NotificationStore,
    recipient: &Recipient,
    last_id: &mut NotificationId,
) -> Result<Vec<ChannelEvent>, StorageError> {
    let fresh = store.notifications_since(recipient, *last_id, POLL_BATCH)?;
    let Some(newest) = fresh.last() else {
        return Ok(Vec::new());
    };
    *last_id = newest.id;

    let unread_count = store.unread_count(recipient)?;
    let alerts: Vec<TimelineAlert> = fresh
        .iter()
        .filter(|notification| notification.timeline_critical)
        .map(TimelineAlert::from)
        .collect();

    let mut events = vec![ChannelEvent::Notifications(NotificationsPayload {
        notifications: fresh,
        unread_count,
    })];
    if !alerts.is_empty() {
        events.push(ChannelEvent::TimelineAlert(TimelineAlertPayload { alerts }));
    }
    Ok(events)
}

fn to_sse_event(event: &ChannelEvent) -> Option<Event> {
    match event.data_json() {
        Ok(data) => Some(Event::default().event(event.name()).data(data)),
        Err(err) => {
            warn!(event = "channel_encode_error", name = event.name(), error = %err);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::HubConfig, registry::ConnectionRegistry};
    use chrono::Utc;
    use futures_util::StreamExt;
    use theatre_core::{NewNotification, NotificationType};
    use theatre_storage::SqliteOperationalSource;

    fn nurse() -> Recipient {
        Recipient::new("u-nurse", "nurse")
    }

    fn test_state() -> AppState {
        let config = HubConfig {
            poll_interval: Duration::from_millis(50),
            ..HubConfig::default()
        };
        let store = Arc::new(NotificationStore::open_in_memory().expect("open store"));
        let source = Arc::new(SqliteOperationalSource::open_in_memory().expect("open source"));
        AppState::new(config, store, source, Arc::new(ConnectionRegistry::new()))
    }

    #[test]
    fn poll_once_emits_notifications_then_alerts() {
        let store = NotificationStore::open_in_memory().expect("open store");
        let mut last_id = NotificationId(0);
        assert!(poll_once(&store, &nurse(), &mut last_id)
            .expect("empty poll")
            .is_empty());

        store
            .create_notification(
                &NewNotification::new(NotificationType::StockLow, "Gauze low", "").for_role("nurse"),
                Utc::now(),
            )
            .expect("create");
        store
            .create_notification(
                &NewNotification::new(NotificationType::SurgeryScheduled, "Starting", "")
                    .timeline_critical(),
                Utc::now(),
            )
            .expect("create");

        let events = poll_once(&store, &nurse(), &mut last_id).expect("poll");
        assert_eq!(last_id, NotificationId(2));
        assert_eq!(events.len(), 2);
        match &events[0] {
            ChannelEvent::Notifications(payload) => {
                assert_eq!(payload.notifications.len(), 2);
                assert_eq!(payload.unread_count, 2);
            }
            other => panic!("unexpected event {other:?}"),
        }
        match &events[1] {
            ChannelEvent::TimelineAlert(payload) => {
                assert_eq!(payload.alerts.len(), 1);
                assert_eq!(payload.alerts[0].notification_id, NotificationId(2));
            }
            other => panic!("unexpected event {other:?}"),
        }

        assert!(poll_once(&store, &nurse(), &mut last_id)
            .expect("drained poll")
            .is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dropping_the_stream_releases_the_registration() {
        let state = test_state();
        let mut stream = open_channel(&state, nurse()).await.expect("open channel");
        assert_eq!(state.registry.recipient_count("u-nurse"), 1);

        let first = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("init in time");
        assert!(matches!(first, Some(Ok(_))));

        drop(stream);
        assert_eq!(state.registry.connection_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn wake_delivers_without_waiting_for_poll() {
        let mut state = test_state();
        state.config = Arc::new(HubConfig {
            poll_interval: Duration::from_secs(3_600),
            ..HubConfig::default()
        });
        let mut stream = open_channel(&state, nurse()).await.expect("open channel");
        let _init = stream.next().await;

        state
            .store
            .create_notification(
                &NewNotification::new(NotificationType::Emergency, "Code red", "").for_recipient("u-nurse"),
                Utc::now(),
            )
            .expect("create");
        state.registry.wake_recipient("u-nurse");

        let next = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .expect("event before poll interval");
        assert!(matches!(next, Some(Ok(_))));
    }
}
