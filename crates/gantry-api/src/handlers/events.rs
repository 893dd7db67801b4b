//! Server-Sent Events subscription handler.

use crate::state::AppState;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::sse::{Event as SseEvent, Sse};
use axum::response::{IntoResponse, Response};
use futures::Stream;
use gantry_core::events::Event;
use gantry_events::{EventBroadcaster, SUBSCRIBER_BUFFER};
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::info;

/// Open a persistent event stream.
///
/// Each frame is `id: <id>\nevent: <type>\ndata: <json>\n\n`; the
/// stream closes when the subscriber goes away or the daemon stops.
pub async fn subscribe(State(state): State<Arc<AppState>>) -> Response {
    let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);

    let Some(subscriber_id) = state.broadcaster.add_subscriber(tx) else {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to register event stream subscriber",
        )
            .into_response();
    };

    info!(subscriber = %subscriber_id, "Event stream subscriber connected");

    let stream = SubscriberStream {
        rx,
        subscriber_id,
        broadcaster: state.broadcaster.clone(),
    };

    (
        [
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
        ],
        Sse::new(stream),
    )
        .into_response()
}

/// Adapts a subscriber channel into an SSE frame stream and
/// deregisters the subscriber when the connection drops.
struct SubscriberStream {
    rx: mpsc::Receiver<Event>,
    subscriber_id: String,
    broadcaster: EventBroadcaster,
}

impl Stream for SubscriberStream {
    type Item = Result<SseEvent, Infallible>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(event)) => {
                let data =
                    serde_json::to_string(&event.data).unwrap_or_else(|_| "{}".to_string());
                Poll::Ready(Some(Ok(SseEvent::default()
                    .id(event.id)
                    .event(event.event_type.to_string())
                    .data(data))))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for SubscriberStream {
    fn drop(&mut self) {
        info!(subscriber = %self.subscriber_id, "Event stream subscriber disconnected");
        self.broadcaster.remove_subscriber(&self.subscriber_id);
    }
}
