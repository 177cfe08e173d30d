use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use theatre_core::{NewNotification, Notification, NotificationId, NotificationPage, TimelineResponse};
use tracing::info;

use crate::{channel::stream_handler, error::ApiError, identity::Identity, AppState};

const DEFAULT_PAGE_SIZE: u32 = 20;
const MAX_PAGE_SIZE: u32 = 100;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/notifications/stream", get(stream_handler))
        .route(
            "/api/notifications",
            get(list_notifications)
                .put(update_notifications)
                .post(create_notification),
        )
        .route("/api/timeline", get(get_timeline))
        .route("/health", get(|| async { "ok" }))
        .with_state(state)
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageQuery {
    page: Option<u32>,
    page_size: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum NotificationAction {
    MarkRead { id: NotificationId },
    MarkAllRead,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnreadResponse {
    pub unread_count: u64,
}

async fn list_notifications(
    State(state): State<AppState>,
    Identity(recipient): Identity,
    Query(query): Query<PageQuery>,
) -> Result<Json<NotificationPage>, ApiError> {
    let page = query.page.unwrap_or(1).max(1);
    let page_size = query
        .page_size
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE);
    let listing = state
        .with_store(move |store| store.list_notifications(&recipient, page, page_size))
        .await?;
    Ok(Json(listing))
}

async fn update_notifications(
    State(state): State<AppState>,
    Identity(recipient): Identity,
    body: Result<Json<NotificationAction>, JsonRejection>,
) -> Result<Json<UnreadResponse>, ApiError> {
    let Json(action) = body.map_err(|err| ApiError::BadRequest(err.body_text()))?;
    let recipient_id = recipient.id.clone();
    let now = Utc::now();
    let (outcome, unread_count) = state
        .with_store(move |store| {
            let outcome = match action {
                NotificationAction::MarkRead { id } => {
                    if store.mark_read(&recipient, id, now)? {
                        ReadOutcome::Marked(id)
                    } else {
                        ReadOutcome::Missing(id)
                    }
                }
                NotificationAction::MarkAllRead => {
                    ReadOutcome::All(store.mark_all_read(&recipient, now)?)
                }
            };
            Ok((outcome, store.unread_count(&recipient)?))
        })
        .await?;
    match outcome {
        ReadOutcome::Marked(id) => {
            info!(event = "notification_read", recipient = %recipient_id, notification_id = %id);
        }
        ReadOutcome::All(changed) => {
            info!(event = "notifications_read_all", recipient = %recipient_id, changed);
        }
        ReadOutcome::Missing(id) => return Err(ApiError::NotFound(format!("notification {id}"))),
    }
    Ok(Json(UnreadResponse { unread_count }))
}

enum ReadOutcome {
    Marked(NotificationId),
    Missing(NotificationId),
    All(usize),
}

/// Direct creation by domain actions. The caller only needs an identity; the
/// addressee comes from the body.
async fn create_notification(
    State(state): State<AppState>,
    Identity(caller): Identity,
    body: Result<Json<NewNotification>, JsonRejection>,
) -> Result<(StatusCode, Json<Notification>), ApiError> {
    let Json(new) = body.map_err(|err| ApiError::BadRequest(err.body_text()))?;
    new.validate()?;
    let created = state
        .with_store(move |store| store.create_notification(&new, Utc::now()))
        .await?;
    info!(
        event = "notification_created",
        notification_id = %created.id,
        kind = %created.kind,
        created_by = %caller.id
    );
    match &created.recipient_id {
        Some(recipient_id) => state.registry.wake_recipient(recipient_id),
        None => state.registry.wake_all(),
    }
    Ok((StatusCode::CREATED, Json(created)))
}

async fn get_timeline(
    State(state): State<AppState>,
    Identity(recipient): Identity,
) -> Json<TimelineResponse> {
    let response = state
        .aggregator
        .compute_timeline(Utc::now(), Some(recipient.role.as_str()))
        .await;
    Json(response)
}
