//! Log broadcast hub — per-execution ring buffer plus live subscriber fan-out.
//!
//! The hub is not the system of record: the ring buffer (newest N lines,
//! default 500) exists purely for replay-on-reconnect. Live delivery uses a
//! broadcast channel per execution, so a slow subscriber lags and loses its
//! oldest entries instead of ever blocking the drain loops.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::broadcast;

use crate::models::execution::{ExecutionStatus, LogLine, LogStream};

/// Event delivered to log subscribers.
#[derive(Debug, Clone)]
pub enum LogEvent {
    Line(LogLine),
    Status {
        execution_id: String,
        status: ExecutionStatus,
    },
    /// Terminal marker: always the last event an execution emits.
    Complete {
        execution_id: String,
        status: ExecutionStatus,
        reason: Option<String>,
    },
}

struct ExecutionLog {
    buffer: VecDeque<LogLine>,
    next_seq: u64,
    live: broadcast::Sender<LogEvent>,
    terminal: Option<(ExecutionStatus, Option<String>)>,
    finished_at: Option<Instant>,
}

/// What `subscribe` hands back: buffered replay first, then the live feed.
pub struct LogSubscription {
    pub replay: Vec<LogLine>,
    pub live: broadcast::Receiver<LogEvent>,
    /// Set when the execution already finished; late subscribers emit the
    /// terminal `complete` event immediately after replay.
    pub terminal: Option<(ExecutionStatus, Option<String>)>,
}

/// Fan-out hub for live execution logs.
pub struct LogHub {
    inner: Mutex<HashMap<String, ExecutionLog>>,
    buffer_capacity: usize,
    subscriber_capacity: usize,
    retention: Duration,
}

impl LogHub {
    pub fn new() -> Self {
        Self::with_capacity(500, 256, Duration::from_secs(300))
    }

    pub fn with_capacity(
        buffer_capacity: usize,
        subscriber_capacity: usize,
        retention: Duration,
    ) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            buffer_capacity,
            subscriber_capacity,
            retention,
        }
    }

    /// Register an execution before its first line is produced.
    pub fn start_execution(&self, execution_id: &str) {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(execution_id.to_string()).or_insert_with(|| {
            let (live, _) = broadcast::channel(self.subscriber_capacity);
            ExecutionLog {
                buffer: VecDeque::with_capacity(self.buffer_capacity.min(64)),
                next_seq: 1,
                live,
                terminal: None,
                finished_at: None,
            }
        });
    }

    /// Append one line, assigning the next sequence number. O(1); never
    /// blocks on subscribers. Returns the stamped line (the coordinator
    /// keeps it for the durable flush), or `None` for unknown executions.
    pub fn append(&self, execution_id: &str, stream: LogStream, text: String) -> Option<LogLine> {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let entry = map.get_mut(execution_id)?;

        let line = LogLine {
            execution_id: execution_id.to_string(),
            stream,
            seq: entry.next_seq,
            ts: Utc::now(),
            text,
        };
        entry.next_seq += 1;

        if entry.buffer.len() == self.buffer_capacity {
            entry.buffer.pop_front();
        }
        entry.buffer.push_back(line.clone());

        // Send errors just mean "no live subscribers right now".
        let _ = entry.live.send(LogEvent::Line(line.clone()));
        Some(line)
    }

    /// Broadcast a non-terminal status transition (e.g. `running`).
    pub fn status(&self, execution_id: &str, status: ExecutionStatus) {
        let map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = map.get(execution_id) {
            let _ = entry.live.send(LogEvent::Status {
                execution_id: execution_id.to_string(),
                status,
            });
        }
    }

    /// Record the terminal status and push the `complete` marker to every
    /// subscriber. The buffer is retained for replay until the next sweep.
    pub fn finish_execution(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        reason: Option<String>,
    ) {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = map.get_mut(execution_id) {
            entry.terminal = Some((status, reason.clone()));
            entry.finished_at = Some(Instant::now());
            let _ = entry.live.send(LogEvent::Complete {
                execution_id: execution_id.to_string(),
                status,
                reason,
            });
        }
    }

    /// Subscribe to an execution's log stream.
    ///
    /// Replays buffered lines with `seq > last_seen_seq` first, then yields
    /// live events. Replay-then-live is gap-free: the live receiver is
    /// created under the same lock that stamps sequence numbers, so a line
    /// lands in exactly one of the two phases.
    pub fn subscribe(&self, execution_id: &str, last_seen_seq: Option<u64>) -> Option<LogSubscription> {
        let map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let entry = map.get(execution_id)?;

        let floor = last_seen_seq.unwrap_or(0);
        let replay: Vec<LogLine> = entry
            .buffer
            .iter()
            .filter(|l| l.seq > floor)
            .cloned()
            .collect();

        Some(LogSubscription {
            replay,
            live: entry.live.subscribe(),
            terminal: entry.terminal.clone(),
        })
    }

    /// Current terminal state, if the execution has finished.
    pub fn terminal_of(&self, execution_id: &str) -> Option<(ExecutionStatus, Option<String>)> {
        let map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.get(execution_id).and_then(|e| e.terminal.clone())
    }

    /// Drop buffers of executions that finished longer than the retention
    /// window ago. Called periodically by the server's sweep task.
    pub fn sweep_expired(&self) -> usize {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let retention = self.retention;
        let before = map.len();
        map.retain(|_, entry| match entry.finished_at {
            Some(at) => at.elapsed() < retention,
            None => true,
        });
        before - map.len()
    }
}

impl Default for LogHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn append_n(hub: &LogHub, id: &str, n: usize) {
        for i in 0..n {
            hub.append(id, LogStream::Stdout, format!("line {}", i));
        }
    }

    #[test]
    fn sequence_numbers_are_monotonic_across_streams() {
        let hub = LogHub::new();
        hub.start_execution("e1");

        let a = hub.append("e1", LogStream::Stdout, "out".into()).unwrap();
        let b = hub.append("e1", LogStream::Stderr, "err".into()).unwrap();
        let c = hub.append("e1", LogStream::Stdout, "out2".into()).unwrap();
        assert_eq!((a.seq, b.seq, c.seq), (1, 2, 3));
    }

    #[test]
    fn replay_starts_after_last_seen_seq() {
        let hub = LogHub::new();
        hub.start_execution("e1");
        append_n(&hub, "e1", 10);

        let sub = hub.subscribe("e1", Some(4)).unwrap();
        let seqs: Vec<u64> = sub.replay.iter().map(|l| l.seq).collect();
        assert_eq!(seqs, vec![5, 6, 7, 8, 9, 10]);
    }

    #[test]
    fn ring_buffer_evicts_oldest() {
        let hub = LogHub::with_capacity(5, 16, Duration::from_secs(60));
        hub.start_execution("e1");
        append_n(&hub, "e1", 8);

        let sub = hub.subscribe("e1", None).unwrap();
        let seqs: Vec<u64> = sub.replay.iter().map(|l| l.seq).collect();
        assert_eq!(seqs, vec![4, 5, 6, 7, 8]);
    }

    #[tokio::test]
    async fn replay_then_live_is_gap_free_and_strictly_increasing() {
        let hub = LogHub::new();
        hub.start_execution("e1");
        append_n(&hub, "e1", 3);

        let mut sub = hub.subscribe("e1", None).unwrap();
        append_n(&hub, "e1", 3); // live phase lines 4..6

        let mut seen: Vec<u64> = sub.replay.iter().map(|l| l.seq).collect();
        for _ in 0..3 {
            match sub.live.recv().await.unwrap() {
                LogEvent::Line(line) => seen.push(line.seq),
                other => panic!("unexpected event: {:?}", other),
            }
        }
        assert_eq!(seen, vec![1, 2, 3, 4, 5, 6]);
    }

    #[tokio::test]
    async fn finish_pushes_terminal_marker_to_live_subscribers() {
        let hub = LogHub::new();
        hub.start_execution("e1");
        let mut sub = hub.subscribe("e1", None).unwrap();

        hub.finish_execution("e1", ExecutionStatus::Completed, None);
        match sub.live.recv().await.unwrap() {
            LogEvent::Complete { status, .. } => assert_eq!(status, ExecutionStatus::Completed),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn late_subscriber_sees_terminal_state() {
        let hub = LogHub::new();
        hub.start_execution("e1");
        hub.finish_execution(
            "e1",
            ExecutionStatus::Failed,
            Some("spawn_failure".to_string()),
        );

        let sub = hub.subscribe("e1", None).unwrap();
        let (status, reason) = sub.terminal.unwrap();
        assert_eq!(status, ExecutionStatus::Failed);
        assert_eq!(reason.as_deref(), Some("spawn_failure"));
    }

    #[test]
    fn sweep_drops_only_expired_buffers() {
        let hub = LogHub::with_capacity(500, 16, Duration::from_millis(0));
        hub.start_execution("done");
        hub.start_execution("live");
        hub.finish_execution("done", ExecutionStatus::Completed, None);

        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(hub.sweep_expired(), 1);
        assert!(hub.subscribe("done", None).is_none());
        assert!(hub.subscribe("live", None).is_some());
    }
}
