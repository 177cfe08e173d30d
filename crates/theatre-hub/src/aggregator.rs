//! Timeline aggregation: pulls near-term operational records, ranks them and
//! materializes critical surgeries as durable notifications.

use chrono::{DateTime, Utc};
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use theatre_core::source::{OperationalSource, ScheduledEvent, SourceError};
use theatre_core::{
    EntityRef, NewNotification, Notification, NotificationType, Priority, TimelineCategory,
    TimelineItem, TimelineResponse, TimelineWindows, Urgency,
};
use theatre_storage::NotificationStore;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{config::HubConfig, registry::ConnectionRegistry};

const SURGERY_ENTITY: &str = "surgery";
const CRITICAL_STATUSES: [&str; 4] = ["CRITICAL", "EMERGENCY", "OUT_OF_STOCK", "URGENT"];

pub struct TimelineAggregator {
    source: Arc<dyn OperationalSource>,
    store: Arc<NotificationStore>,
    registry: Arc<ConnectionRegistry>,
    config: Arc<HubConfig>,
    pass_lock: AsyncMutex<()>,
}

impl TimelineAggregator {
    pub fn new(
        source: Arc<dyn OperationalSource>,
        store: Arc<NotificationStore>,
        registry: Arc<ConnectionRegistry>,
        config: Arc<HubConfig>,
    ) -> Self {
        Self {
            source,
            store,
            registry,
            config,
            pass_lock: AsyncMutex::new(()),
        }
    }

    fn windows(&self) -> &TimelineWindows {
        &self.config.windows
    }

    /// Runs one aggregation pass. Passes never overlap: a pass that starts
    /// while another is running waits for it to finish.
    ///
    /// `viewer_role` decides whether pending approvals are included. The
    /// source and store queries block, so the pass runs on the blocking pool.
    pub async fn compute_timeline(
        self: &Arc<Self>,
        now: DateTime<Utc>,
        viewer_role: Option<&str>,
    ) -> TimelineResponse {
        let include_approvals = viewer_role.is_some_and(|role| self.config.is_approver(role));
        let _pass = self.pass_lock.lock().await;

        let aggregator = Arc::clone(self);
        match tokio::task::spawn_blocking(move || aggregator.run_pass(now, include_approvals)).await
        {
            Ok(response) => response,
            Err(err) => {
                warn!(event = "aggregation_pass_failed", error = %err);
                TimelineResponse {
                    timeline: Vec::new(),
                    counts: count_by_category(&[]),
                }
            }
        }
    }

    fn run_pass(&self, now: DateTime<Utc>, include_approvals: bool) -> TimelineResponse {
        let mut items = Vec::new();
        let window_end = self.windows().lookahead_end(now);

        let surgeries = collect(
            TimelineCategory::Surgery,
            self.source.scheduled_events(now, window_end),
        );
        items.extend(surgeries.iter().map(|event| self.surgery_item(now, event)));

        let maintenance = collect(
            TimelineCategory::Maintenance,
            self.source.maintenance_due(now, window_end),
        );
        items.extend(maintenance.into_iter().map(|record| {
            let urgency = self.classify(now, Some(record.due_at), &record.status, false);
            TimelineItem {
                category: TimelineCategory::Maintenance,
                title: format!("Maintenance due: {}", record.equipment),
                subtitle: None,
                location: record.location,
                time: Some(record.due_at),
                status: record.status,
                urgency,
                link: format!("/equipment/maintenance/{}", record.id),
                entity_id: record.id,
            }
        }));

        let stock = collect(TimelineCategory::Stock, self.source.low_stock());
        items.extend(stock.into_iter().filter_map(|record| {
            let urgency = if record.is_out_of_stock() {
                Urgency::Critical
            } else if record.is_low() {
                Urgency::Warning
            } else {
                return None;
            };
            let status = if record.is_out_of_stock() {
                "OUT_OF_STOCK"
            } else {
                "LOW_STOCK"
            };
            Some(TimelineItem {
                category: TimelineCategory::Stock,
                title: record.name,
                subtitle: Some(format!(
                    "{} left (threshold {})",
                    record.quantity, record.threshold
                )),
                location: record.location,
                time: None,
                status: status.to_string(),
                urgency,
                link: format!("/inventory/{}", record.id),
                entity_id: record.id,
            })
        }));

        let faults = collect(TimelineCategory::Fault, self.source.open_faults());
        items.extend(faults.into_iter().map(|alert| {
            let urgency = self.classify(now, Some(alert.reported_at), &alert.severity, false);
            TimelineItem {
                category: TimelineCategory::Fault,
                title: format!("Equipment fault: {}", alert.equipment),
                subtitle: Some(format!("Severity {}", alert.severity)),
                location: alert.location,
                time: Some(alert.reported_at),
                status: alert.severity,
                urgency,
                link: format!("/equipment/faults/{}", alert.id),
                entity_id: alert.id,
            }
        }));

        let waiting = collect(TimelineCategory::HoldingArea, self.source.waiting_room());
        items.extend(waiting.into_iter().map(|entry| {
            let urgency = self.classify(now, Some(entry.arrived_at), &entry.status, false);
            TimelineItem {
                category: TimelineCategory::HoldingArea,
                title: entry.patient,
                subtitle: Some("Waiting in holding area".to_string()),
                location: entry.area,
                time: Some(entry.arrived_at),
                status: entry.status,
                urgency,
                link: "/holding-area".to_string(),
                entity_id: entry.id,
            }
        }));

        let pacu = collect(TimelineCategory::Pacu, self.source.discharge_ready());
        items.extend(pacu.into_iter().map(|stay| {
            let urgency = self.classify(now, stay.ready_at, &stay.status, true);
            TimelineItem {
                category: TimelineCategory::Pacu,
                title: stay.patient,
                subtitle: Some("Ready for discharge".to_string()),
                location: stay.bed,
                time: stay.ready_at,
                status: stay.status,
                urgency,
                link: "/pacu".to_string(),
                entity_id: stay.id,
            }
        }));

        if include_approvals {
            let approvals = collect(TimelineCategory::Transfer, self.source.pending_approvals());
            items.extend(approvals.into_iter().map(|request| {
                let urgency =
                    self.classify(now, Some(request.requested_at), &request.status, true);
                TimelineItem {
                    category: TimelineCategory::Transfer,
                    title: request.summary,
                    subtitle: request
                        .requested_by
                        .map(|who| format!("Requested by {who}")),
                    location: None,
                    time: Some(request.requested_at),
                    status: request.status,
                    urgency,
                    link: format!("/transfers/{}", request.id),
                    entity_id: request.id,
                }
            }));
        }

        sort_timeline(&mut items);
        let counts = count_by_category(&items);

        let created = self.materialize_critical(now, &surgeries);
        if !created.is_empty() {
            info!(event = "timeline_alerts_created", count = created.len());
            self.registry.wake_all();
        }

        TimelineResponse {
            timeline: items,
            counts,
        }
    }

    fn surgery_item(&self, now: DateTime<Utc>, event: &ScheduledEvent) -> TimelineItem {
        let urgency = self.classify(now, Some(event.scheduled_at), &event.status, false);
        TimelineItem {
            category: TimelineCategory::Surgery,
            title: event.procedure.clone(),
            subtitle: event.patient.clone(),
            location: event.room.clone(),
            time: Some(event.scheduled_at),
            status: event.status.clone(),
            urgency,
            link: surgery_link(event),
            entity_id: event.id.clone(),
        }
    }

    /// Critical when the time falls inside the critical window or the status
    /// signals it; `warns` marks categories that are actionable right now.
    fn classify(
        &self,
        now: DateTime<Utc>,
        time: Option<DateTime<Utc>>,
        status: &str,
        warns: bool,
    ) -> Urgency {
        let in_window = time
            .map(|at| self.windows().is_within_critical(now, at))
            .unwrap_or(false);
        if in_window || signals_critical(status) {
            return Urgency::Critical;
        }
        if warns {
            return Urgency::Warning;
        }
        match time {
            Some(at) if at > now + self.windows().critical_window => Urgency::Upcoming,
            _ => Urgency::Normal,
        }
    }

    /// Creates one timeline-critical notification per surgery in the critical
    /// window, skipping any already raised within the cooldown.
    fn materialize_critical(
        &self,
        now: DateTime<Utc>,
        surgeries: &[ScheduledEvent],
    ) -> Vec<Notification> {
        let since = self.windows().cooldown_start(now);
        let mut created = Vec::new();
        for event in surgeries
            .iter()
            .filter(|event| self.windows().is_within_critical(now, event.scheduled_at))
        {
            let new = surgery_notification(now, event);
            match self.store.create_unless_recent(&new, since, now) {
                Ok(Some(notification)) => {
                    debug!(
                        event = "timeline_alert_created",
                        notification_id = %notification.id,
                        entity_id = %event.id
                    );
                    created.push(notification);
                }
                Ok(None) => {
                    debug!(event = "timeline_alert_suppressed", entity_id = %event.id);
                }
                Err(err) => {
                    warn!(
                        event = "timeline_alert_error",
                        entity_id = %event.id,
                        error = %err
                    );
                }
            }
        }
        created
    }

    /// Runs a pass every `interval` until `shutdown` flips to true.
    pub fn spawn_periodic(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let response = self.compute_timeline(Utc::now(), None).await;
                        debug!(event = "aggregation_pass", items = response.timeline.len());
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!(event = "aggregator_stopped");
        })
    }
}

fn collect<T>(category: TimelineCategory, result: Result<Vec<T>, SourceError>) -> Vec<T> {
    match result {
        Ok(records) => records,
        Err(err) => {
            warn!(event = "source_query_failed", category = %category, error = %err);
            Vec::new()
        }
    }
}

fn signals_critical(status: &str) -> bool {
    let status = status.trim();
    CRITICAL_STATUSES
        .iter()
        .any(|candidate| candidate.eq_ignore_ascii_case(status))
}

fn surgery_link(event: &ScheduledEvent) -> String {
    format!("/surgeries/{}", event.id)
}

fn surgery_notification(now: DateTime<Utc>, event: &ScheduledEvent) -> NewNotification {
    let minutes = (event.scheduled_at - now).num_minutes().max(0);
    let room = event.room.as_deref().unwrap_or("theatre");
    let message = match &event.patient {
        Some(patient) => format!("{} for {patient} in {room} in {minutes} min", event.procedure),
        None => format!("{} in {room} in {minutes} min", event.procedure),
    };
    let mut new = NewNotification::new(
        NotificationType::SurgeryScheduled,
        format!("Surgery starting soon: {}", event.procedure),
        message,
    )
    .with_priority(Priority::High)
    .with_action_url(surgery_link(event))
    .with_entity(EntityRef::new(SURGERY_ENTITY, event.id.clone()))
    .scheduled_at(event.scheduled_at)
    .timeline_critical();
    new.deadline_at = Some(event.scheduled_at);
    new
}

/// Urgency rank first, then time ascending with untimed items last.
pub fn sort_timeline(items: &mut [TimelineItem]) {
    items.sort_by(|a, b| {
        a.urgency
            .rank()
            .cmp(&b.urgency.rank())
            .then_with(|| match (a.time, b.time) {
                (Some(left), Some(right)) => left.cmp(&right),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => std::cmp::Ordering::Equal,
            })
    });
}

pub fn count_by_category(items: &[TimelineItem]) -> BTreeMap<TimelineCategory, usize> {
    let mut counts: BTreeMap<TimelineCategory, usize> =
        TimelineCategory::ALL.iter().map(|category| (*category, 0)).collect();
    for item in items {
        *counts.entry(item.category).or_insert(0) += 1;
    }
    counts
}
