//! Server-Sent-Events fan-out.
//!
//! Each subscriber drains a bounded per-client queue off the session bus
//! (oldest events dropped on overflow, see the bus). Events are serialized
//! as single-line JSON `data:` frames; keepalive comments go out every 15
//! seconds (configurable). The `types` query parameter narrows the
//! subscription; without it, the canonical client-relevant set applies.

use crate::api::error::{ApiError, ApiResult};
use crate::api::routes::AppState;
use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::Stream;
use hive_core::bus::EventFilter;
use hive_core::event::EventType;
use serde::Deserialize;
use std::convert::Infallible;

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    /// Comma-separated event type names.
    #[serde(default)]
    pub types: Option<String>,
    /// Restrict to one execution.
    #[serde(default)]
    pub execution_id: Option<String>,
    /// Restrict to one stream (entry point).
    #[serde(default)]
    pub stream_id: Option<String>,
}

fn parse_filter(query: &EventsQuery) -> ApiResult<EventFilter> {
    let mut filter = EventFilter::new();
    match &query.types {
        Some(raw) => {
            for name in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                let event_type: EventType = name
                    .parse()
                    .map_err(|e: String| ApiError::BadRequest(e))?;
                filter = filter.with_event_type(event_type);
            }
        }
        None => {
            filter = filter.with_event_types(EventType::client_default_set());
        }
    }
    if let Some(execution_id) = &query.execution_id {
        filter = filter.with_execution(execution_id);
    }
    if let Some(stream_id) = &query.stream_id {
        filter = filter.with_stream(stream_id);
    }
    Ok(filter)
}

/// GET /api/sessions/:sid/events
pub async fn events(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let session = state.manager.get(&session_id)?;
    let filter = parse_filter(&query)?;
    let subscription = session.subscribe(filter, state.manager.config().sse_queue_capacity);
    let keepalive = state.manager.config().keepalive();

    tracing::debug!(session_id = %session_id, "SSE subscriber attached");
    let stream = async_stream::stream! {
        loop {
            match subscription.recv().await {
                Some(event) => {
                    // A client that cannot parse one frame skips it; never
                    // kill the stream over serialization.
                    let Ok(payload) = event.to_json() else { continue };
                    yield Ok(Event::default().data(payload));
                }
                None => break,
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(keepalive).text("ping")))
}
