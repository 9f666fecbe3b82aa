//! Server-sent streams: the change-notification feed and per-task logs.

use std::{convert::Infallible, time::Duration};

use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
};
use futures::{Stream, StreamExt};
use services::services::logs::stream_task_logs;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use crate::{AppState, error::ApiError};

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Subscribers receive bare change notifications and re-read the task
/// list; bursts coalesce in the store's capacity-1 slot. Disconnected
/// subscribers are pruned by the bus on the next notification.
pub async fn change_stream(
    State(state): State<AppState>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let subscription = state.store.subscribe().ok_or(ApiError::TooManySubscribers)?;
    let stream = ReceiverStream::new(subscription.rx)
        .map(|()| Ok(Event::default().event("change").data("")));
    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(KEEPALIVE_INTERVAL)))
}

/// Live tail for running tasks, saved turn artifacts otherwise.
pub async fn task_logs(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    // Surface a 404 up front rather than an empty stream.
    state.store.get_task(id)?;
    let rx = stream_task_logs(state.store.clone(), id);
    let stream = ReceiverStream::new(rx).map(|chunk| Ok(Event::default().data(chunk)));
    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(KEEPALIVE_INTERVAL)))
}
