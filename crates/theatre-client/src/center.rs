//! Per-tab notification runtime: holds the subscription state, keeps the
//! delivery channel open and fans local changes out to sibling tabs.

use futures_util::StreamExt;
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};
use theatre_core::channel::ChannelEvent;
use theatre_core::queue::{FlushReport, QueuedOperation};
use theatre_core::tabs::{TabId, TabMessage};
use theatre_core::{Notification, NotificationId, TimelineCategory, TimelineItem};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::{
    alerts::{AlertSink, PlatformAlert},
    error::{ClientError, TransportError},
    queue::OfflineQueue,
    state::{ConnectionStatus, SubscriptionState},
    tabs::{TabBus, TabPublisher, TabSubscriber},
    transport::NotificationApi,
};

pub const DEFAULT_PAGE_SIZE: u32 = 50;
pub const DEFAULT_TIMELINE_REFRESH: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Sent,
    Queued,
}

pub struct NotificationCenter {
    tab_id: TabId,
    api: Arc<dyn NotificationApi>,
    state: Mutex<SubscriptionState>,
    alerts: Arc<dyn AlertSink>,
    publisher: Option<TabPublisher>,
    subscriber: Mutex<Option<TabSubscriber>>,
    queue: Option<Arc<OfflineQueue>>,
    foreground: AtomicBool,
    online: AtomicBool,
    timeline_refresh: Duration,
}

impl NotificationCenter {
    pub fn new(tab_id: TabId, api: Arc<dyn NotificationApi>, alerts: Arc<dyn AlertSink>) -> Self {
        Self {
            tab_id,
            api,
            state: Mutex::new(SubscriptionState::default()),
            alerts,
            publisher: None,
            subscriber: Mutex::new(None),
            queue: None,
            foreground: AtomicBool::new(true),
            online: AtomicBool::new(true),
            timeline_refresh: DEFAULT_TIMELINE_REFRESH,
        }
    }

    /// Joins the same-origin bus. Without one the tab works on its own.
    pub fn with_tab_bus(mut self, bus: &TabBus) -> Self {
        let (publisher, subscriber) = bus.join(self.tab_id.clone());
        self.publisher = Some(publisher);
        self.subscriber = Mutex::new(Some(subscriber));
        self
    }

    pub fn with_queue(mut self, queue: Arc<OfflineQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_timeline_refresh(mut self, interval: Duration) -> Self {
        self.timeline_refresh = interval;
        self
    }

    pub fn tab_id(&self) -> &TabId {
        &self.tab_id
    }

    fn lock_state(&self) -> MutexGuard<'_, SubscriptionState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn snapshot(&self) -> SubscriptionState {
        self.lock_state().clone()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.lock_state().notifications.clone()
    }

    pub fn unread_count(&self) -> u64 {
        self.lock_state().unread_count
    }

    pub fn timeline(&self) -> Vec<TimelineItem> {
        self.lock_state().timeline.clone()
    }

    pub fn timeline_counts(&self) -> BTreeMap<TimelineCategory, usize> {
        self.lock_state().timeline_counts.clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.lock_state().status
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    fn publish(&self, message: TabMessage) {
        if let Some(publisher) = &self.publisher {
            publisher.publish(message);
        }
    }

    pub async fn fetch_notifications(&self) -> Result<(), ClientError> {
        let page = self.api.list_notifications(1, DEFAULT_PAGE_SIZE).await?;
        self.lock_state().apply_page(page);
        Ok(())
    }

    pub async fn fetch_timeline(&self) -> Result<(), ClientError> {
        let response = self.api.fetch_timeline().await?;
        self.lock_state().apply_timeline(response);
        Ok(())
    }

    async fn refresh(&self) {
        if let Err(err) = self.fetch_notifications().await {
            warn!(event = "refresh_failed", tab = %self.tab_id, what = "notifications", error = %err);
        }
        if let Err(err) = self.fetch_timeline().await {
            warn!(event = "refresh_failed", tab = %self.tab_id, what = "timeline", error = %err);
        }
    }

    /// Optimistically marks one notification read, tells sibling tabs and
    /// then confirms with the server. A transient failure is queued for replay
    /// when an offline queue is attached.
    pub async fn mark_as_read(&self, id: NotificationId) -> Result<(), ClientError> {
        self.lock_state().mark_read_local(id);
        self.publish(TabMessage::MarkRead { id });
        let operation = QueuedOperation::MarkRead { id };
        if self.queue_if_deferred(&operation)? {
            self.drain_behind(&operation).await?;
            return Ok(());
        }
        match self.api.mark_read(id).await {
            Ok(unread) => {
                self.lock_state().set_unread(unread);
                Ok(())
            }
            Err(err) => self.queue_after_failure(operation, err),
        }
    }

    pub async fn mark_all_as_read(&self) -> Result<(), ClientError> {
        self.lock_state().mark_all_read_local();
        self.publish(TabMessage::MarkAllRead);
        let operation = QueuedOperation::MarkAllRead;
        if self.queue_if_deferred(&operation)? {
            self.drain_behind(&operation).await?;
            return Ok(());
        }
        match self.api.mark_all_read().await {
            Ok(unread) => {
                self.lock_state().set_unread(unread);
                Ok(())
            }
            Err(err) => self.queue_after_failure(operation, err),
        }
    }

    /// Single entry point for mutating actions. Offline writes are queued;
    /// online writes are sent and queued only on a transient failure. A write
    /// to a record that still has queued writes goes behind them.
    pub async fn submit(&self, operation: QueuedOperation) -> Result<SubmitOutcome, ClientError> {
        if self.queue_if_deferred(&operation)? {
            return self.drain_behind(&operation).await;
        }
        match self.api.submit(&operation).await {
            Ok(()) => Ok(SubmitOutcome::Sent),
            Err(err) => self
                .queue_after_failure(operation, err)
                .map(|()| SubmitOutcome::Queued),
        }
    }

    /// Queues `operation` when offline or when an earlier write to the same
    /// record is still queued. Returns true when it went to the queue.
    fn queue_if_deferred(&self, operation: &QueuedOperation) -> Result<bool, ClientError> {
        let Some(queue) = &self.queue else {
            return Ok(false);
        };
        let online = self.is_online();
        if online && !queue.has_pending(operation)? {
            return Ok(false);
        }
        if online {
            debug!(
                event = "write_ordered_behind_queue",
                tab = %self.tab_id,
                resource = %operation.resource_key()
            );
        }
        queue.enqueue(operation)?;
        Ok(true)
    }

    /// After queueing `operation` while online, replays the queue so it lands
    /// after the writes ahead of it. `Sent` once nothing for that record is
    /// left waiting.
    async fn drain_behind(&self, operation: &QueuedOperation) -> Result<SubmitOutcome, ClientError> {
        let Some(queue) = &self.queue else {
            return Ok(SubmitOutcome::Queued);
        };
        if !self.is_online() {
            return Ok(SubmitOutcome::Queued);
        }
        if let Err(err) = self.flush_queue().await {
            warn!(event = "flush_failed", tab = %self.tab_id, error = %err);
        }
        if queue.has_pending(operation)? {
            Ok(SubmitOutcome::Queued)
        } else {
            Ok(SubmitOutcome::Sent)
        }
    }

    fn queue_after_failure(
        &self,
        operation: QueuedOperation,
        err: TransportError,
    ) -> Result<(), ClientError> {
        match &self.queue {
            Some(queue) if err.is_transient() => {
                debug!(event = "write_deferred", tab = %self.tab_id, error = %err);
                queue.enqueue(&operation)?;
                Ok(())
            }
            _ => Err(err.into()),
        }
    }

    pub fn pending_writes(&self) -> Result<u64, ClientError> {
        match &self.queue {
            Some(queue) => Ok(queue.count()?),
            None => Ok(0),
        }
    }

    /// `None` when no queue is attached or a flush is already running.
    pub async fn flush_queue(&self) -> Result<Option<FlushReport>, ClientError> {
        match &self.queue {
            Some(queue) => Ok(queue.flush(self.api.as_ref()).await?),
            None => Ok(None),
        }
    }

    /// Becoming visible triggers an immediate re-fetch.
    pub async fn set_visibility(&self, visible: bool) {
        let was_visible = self.foreground.swap(visible, Ordering::SeqCst);
        if visible && !was_visible {
            debug!(event = "tab_visible", tab = %self.tab_id);
            self.refresh().await;
        }
    }

    /// Going online re-fetches and replays queued writes.
    pub async fn set_online(&self, online: bool) {
        let was_online = self.online.swap(online, Ordering::SeqCst);
        if online && !was_online {
            info!(event = "tab_online", tab = %self.tab_id);
            self.refresh().await;
            if let Err(err) = self.flush_queue().await {
                warn!(event = "flush_failed", tab = %self.tab_id, error = %err);
            }
        } else if !online && was_online {
            info!(event = "tab_offline", tab = %self.tab_id);
        }
    }

    fn handle_event(&self, event: ChannelEvent) {
        match event {
            ChannelEvent::Init(payload) => {
                self.lock_state().apply_init(payload.unread_count);
                info!(
                    event = "channel_ready",
                    tab = %self.tab_id,
                    unread = payload.unread_count
                );
            }
            ChannelEvent::Notifications(payload) => {
                let added = {
                    let mut state = self.lock_state();
                    let added = state.merge_notifications(payload.notifications);
                    state.set_unread(payload.unread_count);
                    added
                };
                if added.is_empty() {
                    return;
                }
                info!(
                    event = "notifications_received",
                    tab = %self.tab_id,
                    count = added.len(),
                    unread = payload.unread_count
                );
                if !self.foreground.load(Ordering::SeqCst) {
                    for notification in added.iter().filter(|n| n.priority.is_elevated()) {
                        self.alerts.notify(PlatformAlert::from(notification));
                    }
                }
                self.publish(TabMessage::NewNotifications {
                    notifications: added,
                    unread_count: payload.unread_count,
                });
            }
            ChannelEvent::TimelineAlert(payload) => {
                for alert in &payload.alerts {
                    self.alerts.notify(PlatformAlert::from(alert));
                }
            }
        }
    }

    /// Applies a sibling's change locally without re-broadcasting it.
    fn apply_tab_message(&self, message: TabMessage) {
        let mut state = self.lock_state();
        match message {
            TabMessage::MarkRead { id } => {
                state.mark_read_local(id);
            }
            TabMessage::MarkAllRead => {
                state.mark_all_read_local();
            }
            TabMessage::NewNotifications {
                notifications,
                unread_count,
            } => {
                state.merge_notifications(notifications);
                state.set_unread(unread_count);
            }
        }
    }

    /// Runs the channel loop, the tab listener and the timeline timer until
    /// `shutdown` becomes true. Stopping drops the channel stream and cancels
    /// any pending reconnect.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        tokio::join!(
            self.channel_loop(shutdown.clone()),
            self.tab_loop(shutdown.clone()),
            self.timeline_loop(shutdown),
        );
        self.lock_state().status = ConnectionStatus::Disconnected;
        info!(event = "tab_stopped", tab = %self.tab_id);
    }

    async fn channel_loop(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }
            self.lock_state().begin_connect();

            let opened = tokio::select! {
                opened = self.api.open_channel() => opened,
                _ = stopped(&mut shutdown) => return,
            };

            match opened {
                Ok(mut events) => {
                    self.refresh().await;
                    loop {
                        tokio::select! {
                            next = events.next() => match next {
                                Some(Ok(event)) => self.handle_event(event),
                                Some(Err(err)) if err.is_transient() => {
                                    warn!(event = "channel_error", tab = %self.tab_id, error = %err);
                                    break;
                                }
                                Some(Err(err)) => {
                                    warn!(event = "channel_decode_error", tab = %self.tab_id, error = %err);
                                }
                                None => {
                                    info!(event = "channel_closed", tab = %self.tab_id);
                                    break;
                                }
                            },
                            _ = stopped(&mut shutdown) => return,
                        }
                    }
                }
                Err(err) => {
                    warn!(event = "channel_connect_error", tab = %self.tab_id, error = %err);
                }
            }

            let delay = self.lock_state().on_disconnected();
            info!(
                event = "channel_reconnect_scheduled",
                tab = %self.tab_id,
                delay_ms = delay.as_millis() as u64
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = stopped(&mut shutdown) => return,
            }
        }
    }

    async fn tab_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let subscriber = self
            .subscriber
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(mut subscriber) = subscriber else {
            return;
        };
        loop {
            tokio::select! {
                message = subscriber.recv() => match message {
                    Some(message) => {
                        debug!(event = "tab_message", tab = %self.tab_id, kind = message.kind());
                        self.apply_tab_message(message);
                    }
                    None => {
                        warn!(event = "tab_bus_closed", tab = %self.tab_id);
                        return;
                    }
                },
                _ = stopped(&mut shutdown) => return,
            }
        }
    }

    async fn timeline_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.timeline_refresh);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.fetch_timeline().await {
                        warn!(event = "timeline_refresh_failed", tab = %self.tab_id, error = %err);
                    }
                }
                _ = stopped(&mut shutdown) => return,
            }
        }
    }
}

/// Resolves once `shutdown` reads true or its sender is gone.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
