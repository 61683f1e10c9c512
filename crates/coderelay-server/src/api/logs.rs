//! SSE live-log stream for executions.
//!
//! GET /api/executions/{id}/logs?lastSeenSeq=N
//!
//! Named events:
//!   log      — one LogLine (JSON)
//!   status   — a non-terminal status transition
//!   complete — terminal status + reason; always the final event
//!
//! Reconnect with `lastSeenSeq` replays buffered lines with a higher
//! sequence number, then switches to live delivery. Replay is bounded by
//! the hub's retention buffer (default 500 lines); once the buffer is
//! swept, the durable archive backs the stream instead.

use std::convert::Infallible;

use axum::{
    extract::{Path, Query, State},
    response::sse::{Event, Sse},
};
use serde::Deserialize;
use tokio_stream::StreamExt as _;

use coderelay_core::engine::logs::LogEvent;
use coderelay_core::error::EngineError;
use coderelay_core::models::execution::{ExecutionStatus, LogLine};
use coderelay_core::state::AppState;

type SseStream =
    std::pin::Pin<Box<dyn tokio_stream::Stream<Item = Result<Event, Infallible>> + Send>>;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogStreamQuery {
    pub last_seen_seq: Option<u64>,
}

fn log_event(line: &LogLine) -> Event {
    Event::default()
        .event("log")
        .data(serde_json::to_string(line).unwrap_or_default())
}

fn status_event(execution_id: &str, status: ExecutionStatus) -> Event {
    Event::default().event("status").data(
        serde_json::json!({ "executionId": execution_id, "status": status }).to_string(),
    )
}

fn complete_event(execution_id: &str, status: ExecutionStatus, reason: Option<&str>) -> Event {
    Event::default().event("complete").data(
        serde_json::json!({
            "executionId": execution_id,
            "status": status,
            "reason": reason,
        })
        .to_string(),
    )
}

pub async fn execution_logs_sse(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LogStreamQuery>,
) -> Result<Sse<SseStream>, EngineError> {
    // Keep the connection alive through proxies.
    let heartbeat = tokio_stream::wrappers::IntervalStream::new(tokio::time::interval(
        std::time::Duration::from_secs(15),
    ))
    .map(|_| Ok(Event::default().comment("heartbeat")));

    if let Some(sub) = state.hub.subscribe(&id, query.last_seen_seq) {
        let execution_id = id.clone();
        let floor = query.last_seen_seq.unwrap_or(0);
        let events = async_stream::stream! {
            let mut high_water = floor;
            for line in sub.replay {
                high_water = line.seq;
                yield Ok::<_, Infallible>(log_event(&line));
            }

            // Already-finished execution: complete immediately after replay.
            if let Some((status, reason)) = sub.terminal {
                yield Ok(complete_event(&execution_id, status, reason.as_deref()));
                return;
            }

            let mut live = sub.live;
            loop {
                match live.recv().await {
                    Ok(LogEvent::Line(line)) => {
                        if line.seq <= high_water {
                            continue;
                        }
                        high_water = line.seq;
                        yield Ok(log_event(&line));
                    }
                    Ok(LogEvent::Status { execution_id, status }) => {
                        yield Ok(status_event(&execution_id, status));
                    }
                    Ok(LogEvent::Complete { execution_id, status, reason }) => {
                        yield Ok(complete_event(&execution_id, status, reason.as_deref()));
                        break;
                    }
                    // Slow subscriber: the hub dropped our oldest entries.
                    // The stream shows a gap but never blocks the execution.
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        };
        let stream: SseStream = Box::pin(events.merge(heartbeat));
        return Ok(Sse::new(stream));
    }

    // Buffer already swept (or execution predates this process): serve the
    // durable archive, then the terminal marker. Crash-recovered executions
    // get a synthesized complete event this way too.
    let execution = state
        .execution_store
        .get(&id)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("Execution {} not found", id)))?;
    let floor = query.last_seen_seq.unwrap_or(0);
    let lines: Vec<LogLine> = state
        .log_store
        .list(&id)
        .await?
        .into_iter()
        .filter(|l| l.seq > floor)
        .collect();

    let events = async_stream::stream! {
        for line in &lines {
            yield Ok::<_, Infallible>(log_event(line));
        }
        yield Ok(complete_event(
            &execution.id,
            execution.status,
            execution.reason.as_deref(),
        ));
    };
    let stream: SseStream = Box::pin(events.merge(heartbeat));
    Ok(Sse::new(stream))
}
