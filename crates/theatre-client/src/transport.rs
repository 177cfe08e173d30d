//! HTTP side of the client: REST calls and the SSE delivery channel.

use async_trait::async_trait;
use futures_util::{stream, Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::json;
use std::{collections::VecDeque, pin::Pin};
use theatre_core::channel::ChannelEvent;
use theatre_core::queue::{QueuedOperation, WriteMethod};
use theatre_core::sse::{DecodeReport, SseDecoder};
use theatre_core::{NotificationId, NotificationPage, Recipient, TimelineResponse};
use tracing::debug;

use crate::error::TransportError;

pub type EventStream = Pin<Box<dyn Stream<Item = Result<ChannelEvent, TransportError>> + Send>>;

#[async_trait]
pub trait NotificationApi: Send + Sync {
    async fn list_notifications(
        &self,
        page: u32,
        page_size: u32,
    ) -> Result<NotificationPage, TransportError>;

    async fn fetch_timeline(&self) -> Result<TimelineResponse, TransportError>;

    /// Returns the authoritative unread count after the change.
    async fn mark_read(&self, id: NotificationId) -> Result<u64, TransportError>;

    async fn mark_all_read(&self) -> Result<u64, TransportError>;

    async fn open_channel(&self) -> Result<EventStream, TransportError>;

    /// Replays one queued mutation.
    async fn submit(&self, operation: &QueuedOperation) -> Result<(), TransportError>;
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct UnreadResponse {
    unread_count: u64,
}

#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    recipient: Recipient,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, recipient: Recipient) -> Self {
        Self::with_client(reqwest::Client::new(), base_url, recipient)
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>, recipient: Recipient) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            client,
            base_url,
            recipient,
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.base_url, path))
            .header("x-recipient-id", &self.recipient.id)
            .header("x-recipient-role", &self.recipient.role)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, TransportError> {
        let response = request
            .send()
            .await
            .map_err(|err| TransportError::Network(err.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(TransportError::Rejected {
            status: status.as_u16(),
            message,
        })
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, TransportError> {
        let response = self.send(request).await?;
        response
            .json::<T>()
            .await
            .map_err(|err| TransportError::Decode(err.to_string()))
    }

    async fn put_action(&self, body: serde_json::Value) -> Result<u64, TransportError> {
        let request = self
            .request(reqwest::Method::PUT, theatre_core::queue::NOTIFICATIONS_PATH)
            .json(&body);
        let response: UnreadResponse = self.send_json(request).await?;
        Ok(response.unread_count)
    }
}

#[async_trait]
impl NotificationApi for HttpTransport {
    async fn list_notifications(
        &self,
        page: u32,
        page_size: u32,
    ) -> Result<NotificationPage, TransportError> {
        let request = self
            .request(reqwest::Method::GET, "/api/notifications")
            .query(&[("page", page), ("pageSize", page_size)]);
        self.send_json(request).await
    }

    async fn fetch_timeline(&self) -> Result<TimelineResponse, TransportError> {
        self.send_json(self.request(reqwest::Method::GET, "/api/timeline"))
            .await
    }

    async fn mark_read(&self, id: NotificationId) -> Result<u64, TransportError> {
        self.put_action(json!({ "action": "mark-read", "id": id }))
            .await
    }

    async fn mark_all_read(&self) -> Result<u64, TransportError> {
        self.put_action(json!({ "action": "mark-all-read" })).await
    }

    async fn open_channel(&self) -> Result<EventStream, TransportError> {
        let request = self
            .request(reqwest::Method::GET, "/api/notifications/stream")
            .header(reqwest::header::ACCEPT, "text/event-stream");
        let response = self.send(request).await?;
        debug!(event = "channel_connected", base_url = %self.base_url);
        Ok(sse_events(response.bytes_stream()))
    }

    async fn submit(&self, operation: &QueuedOperation) -> Result<(), TransportError> {
        match operation {
            QueuedOperation::MarkRead { id } => self.mark_read(*id).await.map(|_| ()),
            QueuedOperation::MarkAllRead => self.mark_all_read().await.map(|_| ()),
            QueuedOperation::Write { method, path, body } => {
                let mut request = self.request(to_reqwest_method(*method), path);
                if let Some(body) = body {
                    request = request.json(body);
                }
                self.send(request).await.map(|_| ())
            }
        }
    }
}

fn to_reqwest_method(method: WriteMethod) -> reqwest::Method {
    match method {
        WriteMethod::Post => reqwest::Method::POST,
        WriteMethod::Put => reqwest::Method::PUT,
        WriteMethod::Patch => reqwest::Method::PATCH,
        WriteMethod::Delete => reqwest::Method::DELETE,
    }
}

/// Turns a raw response body into decoded channel events. Unknown event
/// names are skipped; a transport error ends the stream after it is yielded.
pub fn sse_events<S, B, E>(body: S) -> EventStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    struct Decoding<S> {
        body: Pin<Box<S>>,
        decoder: SseDecoder,
        pending: VecDeque<Result<ChannelEvent, TransportError>>,
        done: bool,
    }

    let initial = Decoding {
        body: Box::pin(body),
        decoder: SseDecoder::default(),
        pending: VecDeque::new(),
        done: false,
    };

    Box::pin(stream::unfold(initial, |mut state| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                return Some((item, state));
            }
            if state.done {
                return None;
            }
            match state.body.next().await {
                Some(Ok(chunk)) => {
                    let report = state.decoder.push_chunk(chunk.as_ref());
                    queue_report(report, &mut state.pending);
                }
                Some(Err(err)) => {
                    state
                        .pending
                        .push_back(Err(TransportError::Network(err.to_string())));
                    state.done = true;
                }
                None => {
                    let report = state.decoder.finish();
                    queue_report(report, &mut state.pending);
                    state.done = true;
                }
            }
        }
    }))
}

fn queue_report(
    report: DecodeReport,
    pending: &mut VecDeque<Result<ChannelEvent, TransportError>>,
) {
    for err in report.errors {
        pending.push_back(Err(TransportError::Decode(err.to_string())));
    }
    for event in report.events {
        match ChannelEvent::from_sse(&event) {
            Ok(Some(decoded)) => pending.push_back(Ok(decoded)),
            Ok(None) => debug!(event = "channel_event_ignored", name = %event.name()),
            Err(err) => pending.push_back(Err(TransportError::Decode(err.to_string()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use theatre_core::channel::InitPayload;
    use theatre_core::sse::encode_event;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn split_chunks_decode_into_events() {
        let init = ChannelEvent::Init(InitPayload { unread_count: 2 });
        let mut raw = encode_event(init.name(), &init.data_json().expect("encode"));
        raw.push_str(":heartbeat\n\n");
        raw.push_str(&encode_event("presence", "{}"));
        let (head, tail) = raw.split_at(7);
        let chunks: Vec<Result<Vec<u8>, String>> = vec![
            Ok(head.as_bytes().to_vec()),
            Ok(tail.as_bytes().to_vec()),
            Err("connection reset".to_string()),
        ];

        let events: Vec<_> = sse_events(stream::iter(chunks)).collect().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], Ok(init));
        assert!(matches!(&events[1], Err(err) if err.is_transient()));
    }
}
