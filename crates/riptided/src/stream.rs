//! Subscriber sessions over server-sent events.
//!
//! The handler validates the filter and passes admission before anything
//! is registered with the engine; a drop guard ties subscriber removal
//! and admission release to the lifetime of the response stream, so
//! cleanup runs on client disconnect, write failure, and server shutdown
//! alike.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::Stream;
use riptide_core::{RunFilter, StateEngine, StreamEvent};
use serde::Deserialize;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;
use uuid::Uuid;

use crate::admission::AdmissionPermit;
use crate::server::AppState;

/// Comment-line cadence keeping idle streams alive through proxies.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Deserialize)]
pub struct StreamParams {
    filter: Option<String>,
}

/// `GET /v1/runs/stream?filter=<json>`
pub async fn stream_handler(
    State(state): State<AppState>,
    Query(params): Query<StreamParams>,
    headers: HeaderMap,
) -> Response {
    let filter = match params.filter.as_deref() {
        None => RunFilter::default(),
        Some(raw) => match RunFilter::from_json(raw) {
            Ok(filter) => filter,
            Err(e) => {
                return (StatusCode::BAD_REQUEST, format!("invalid filter: {e}")).into_response()
            }
        },
    };

    let permit = match state.admission.acquire().await {
        Ok(permit) => permit,
        Err(_over) => {
            return (StatusCode::TOO_MANY_REQUESTS, "subscriber limit reached").into_response()
        }
    };

    let last_event_id = headers
        .get("last-event-id")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok());

    let subscription = state.engine.attach(filter, last_event_id);
    debug!(subscriber = %subscription.id, ?last_event_id, "subscriber attached");

    let session = SessionStream {
        inner: ReceiverStream::new(subscription.receiver),
        _guard: SessionGuard {
            engine: state.engine.clone(),
            id: subscription.id,
            _permit: permit,
        },
    };

    let sse = Sse::new(session).keep_alive(
        KeepAlive::new()
            .interval(KEEPALIVE_INTERVAL)
            .text("keepalive"),
    );

    (
        [
            (header::CACHE_CONTROL, "no-cache"),
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
        ],
        sse,
    )
        .into_response()
}

/// Unregisters the subscriber (and releases admission) when the response
/// stream is dropped, whatever the exit path was.
struct SessionGuard {
    engine: Arc<StateEngine>,
    id: Uuid,
    _permit: AdmissionPermit,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        debug!(subscriber = %self.id, "subscriber detached");
        self.engine.remove_subscriber(self.id);
    }
}

/// The subscriber's queue rendered as SSE frames.
struct SessionStream {
    inner: ReceiverStream<StreamEvent>,
    _guard: SessionGuard,
}

impl Stream for SessionStream {
    type Item = Result<Event, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(event)) => Poll::Ready(Some(Ok(render_event(&event)))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

fn render_event(event: &StreamEvent) -> Event {
    let data = serde_json::to_string(&event.run).unwrap_or_else(|_| "{}".to_string());
    Event::default()
        .id(event.id.to_string())
        .event(event.kind.as_str())
        .data(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use riptide_core::EventKind;
    use std::collections::{HashMap, HashSet};

    #[test]
    fn rendered_event_carries_id_kind_and_record() {
        let run = riptide_core::RunState {
            id: Uuid::new_v4(),
            env_id: Uuid::new_v4(),
            tags: HashSet::new(),
            status: "QUEUED".to_string(),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
            seq: 7,
            data: HashMap::new(),
        };
        let event = StreamEvent {
            id: 7,
            kind: EventKind::Delta,
            run,
        };

        // The SSE text grammar: id, event name, then the record as JSON.
        let rendered = format!("{:?}", render_event(&event));
        assert!(rendered.contains('7'));
        assert!(rendered.contains("delta"));
        assert!(rendered.contains("QUEUED"));
    }

    #[tokio::test]
    async fn guard_detaches_subscriber_on_drop() {
        let engine = Arc::new(StateEngine::new());
        let admission = crate::admission::AdmissionCounter::connect(None, 10).await;

        let subscription = engine.attach(RunFilter::default(), None);
        assert_eq!(engine.subscriber_count(), 1);

        let guard = SessionGuard {
            engine: engine.clone(),
            id: subscription.id,
            _permit: admission.acquire().await.unwrap(),
        };
        drop(guard);
        assert_eq!(engine.subscriber_count(), 0);
    }
}
