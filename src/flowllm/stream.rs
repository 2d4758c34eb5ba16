//! Transport-agnostic progressive-output streaming.
//!
//! Handlers that produce incremental output push chunks into a [`StreamSink`];
//! external transports (a web UI, an SSE bridge, a CLI spinner) subscribe per
//! session and receive [`StreamItem`]s over a channel. The sink guarantees
//! that chunks for a given `(session, agent)` pair are delivered in the order
//! of their monotonically increasing `chunk_index` — it assigns indices from
//! a per-pair counter and never reorders. Across distinct agents (a
//! collaborative fan-out) no ordering is guaranteed.
//!
//! Termination: a producer pushes a terminal [`StreamCompletion`] after its
//! last chunk, and the runner calls [`StreamSink::finish`] when the event's
//! orchestration ends, which closes every subscriber channel for the session.
//! Late subscribers get a replay only when a replay buffer is configured and
//! still retains the whole stream; otherwise their subscription opens empty
//! and closes immediately.
//!
//! Backpressure: a subscriber that cannot keep up either loses chunks — the
//! next delivered chunk carries `dropped_before = true` — or stalls the
//! producer up to a push timeout, per [`BackpressurePolicy`]. The default is
//! drop-with-marker.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};

use crate::flowllm::errors::FlowError;

/// One progressive-output fragment.
#[derive(Debug, Clone)]
pub struct StreamChunk {
    /// Name of the producing agent.
    pub agent_name: String,
    /// The text fragment.
    pub content: String,
    /// Monotonically increasing per-(session, agent) index, starting at 0.
    pub chunk_index: u64,
    /// Optional producer hint of the total chunk count.
    pub total_hint: Option<u64>,
    /// Free-form chunk annotations.
    pub metadata: HashMap<String, String>,
    /// True when this subscriber lost one or more chunks immediately before
    /// this one (drop-with-marker backpressure).
    pub dropped_before: bool,
}

impl StreamChunk {
    fn new(agent_name: &str, content: &str, chunk_index: u64) -> Self {
        Self {
            agent_name: agent_name.to_string(),
            content: content.to_string(),
            chunk_index,
            total_hint: None,
            metadata: HashMap::new(),
            dropped_before: false,
        }
    }
}

/// Token accounting reported on stream completion, when the producer has it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsageTotals {
    /// Tokens consumed by the prompt side.
    pub prompt_tokens: usize,
    /// Tokens produced by the completion side.
    pub completion_tokens: usize,
    /// Total billed tokens.
    pub total_tokens: usize,
}

/// Terminal stream record: the final content and optional usage accounting.
/// No further chunks follow for this `(session, agent)` pair.
#[derive(Debug, Clone)]
pub struct StreamCompletion {
    /// Name of the producing agent.
    pub agent_name: String,
    /// The final assembled content.
    pub content: String,
    /// Usage accounting, when the producer reports it.
    pub usage: Option<UsageTotals>,
}

/// What a subscriber receives.
#[derive(Debug, Clone)]
pub enum StreamItem {
    /// An incremental fragment.
    Chunk(StreamChunk),
    /// The terminal record for one agent's stream.
    Complete(StreamCompletion),
}

/// What the sink does when a subscriber's channel is full.
#[derive(Debug, Clone, Copy)]
pub enum BackpressurePolicy {
    /// Drop the chunk for that subscriber; the next chunk it does receive
    /// carries `dropped_before = true`.
    DropWithMarker,
    /// Block the producer until the subscriber drains, up to the timeout;
    /// past the timeout the chunk is dropped with the marker.
    Block {
        /// How long a push may wait on one subscriber.
        push_timeout: Duration,
    },
}

struct Subscriber {
    tx: mpsc::Sender<StreamItem>,
    dropped: bool,
    closed: bool,
}

#[derive(Default)]
struct SessionStreams {
    subscribers: Vec<Subscriber>,
    counters: HashMap<String, u64>,
    completed: HashSet<String>,
    replay: VecDeque<StreamItem>,
    replay_evicted: bool,
    finished: bool,
}

/// Fan-out hub for progressive agent output, keyed by session.
///
/// # Example
///
/// ```rust,no_run
/// use flowllm::stream::{StreamItem, StreamSink};
///
/// # async fn demo() -> Result<(), flowllm::errors::FlowError> {
/// let sink = StreamSink::new();
/// let mut rx = sink.subscribe("s1").await;
///
/// sink.push("s1", "writer", "partial ").await?;
/// sink.push("s1", "writer", "output").await?;
/// sink.complete("s1", "writer", "partial output", None).await?;
/// sink.finish("s1").await;
///
/// while let Some(item) = rx.recv().await {
///     if let StreamItem::Chunk(chunk) = item {
///         print!("{}", chunk.content);
///     }
/// }
/// # Ok(())
/// # }
/// ```
pub struct StreamSink {
    sessions: Mutex<HashMap<String, SessionStreams>>,
    policy: BackpressurePolicy,
    subscriber_capacity: usize,
    replay_capacity: usize,
}

impl Default for StreamSink {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamSink {
    /// Create a sink with drop-with-marker backpressure, subscriber channels
    /// of capacity 64, and no replay buffer.
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            policy: BackpressurePolicy::DropWithMarker,
            subscriber_capacity: 64,
            replay_capacity: 0,
        }
    }

    /// Set the backpressure policy.
    pub fn with_policy(mut self, policy: BackpressurePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Set the per-subscriber channel capacity.
    pub fn with_subscriber_capacity(mut self, capacity: usize) -> Self {
        self.subscriber_capacity = capacity.max(1);
        self
    }

    /// Retain up to `capacity` items per session for late-subscriber replay.
    /// Once the buffer overflows, the stream is no longer replayable and
    /// late subscribers get an empty, immediately-closed subscription.
    pub fn with_replay_buffer(mut self, capacity: usize) -> Self {
        self.replay_capacity = capacity;
        self
    }

    /// Push a chunk for `agent` on `session`. The sink assigns the next
    /// `chunk_index` for the pair and returns it.
    pub async fn push(&self, session: &str, agent: &str, content: &str) -> Result<u64, FlowError> {
        let mut sessions = self.sessions.lock().await;
        let streams = sessions.entry(session.to_string()).or_default();
        Self::check_open(streams, session, agent)?;

        let counter = streams.counters.entry(agent.to_string()).or_insert(0);
        let index = *counter;
        *counter += 1;

        let chunk = StreamChunk::new(agent, content, index);
        self.deliver(streams, StreamItem::Chunk(chunk)).await;
        Ok(index)
    }

    /// Push a producer-built chunk. The `chunk_index` must equal the pair's
    /// counter — the sink never reorders, so a gap or repeat is refused.
    pub async fn push_chunk(&self, session: &str, chunk: StreamChunk) -> Result<(), FlowError> {
        let mut sessions = self.sessions.lock().await;
        let streams = sessions.entry(session.to_string()).or_default();
        Self::check_open(streams, session, &chunk.agent_name)?;

        let counter = streams.counters.entry(chunk.agent_name.clone()).or_insert(0);
        if chunk.chunk_index != *counter {
            return Err(FlowError::ExecutionFailed(format!(
                "out-of-order chunk for '{}': got index {}, expected {}",
                chunk.agent_name, chunk.chunk_index, counter
            )));
        }
        *counter += 1;

        self.deliver(streams, StreamItem::Chunk(chunk)).await;
        Ok(())
    }

    /// Push the terminal record for `agent` on `session`. Further pushes for
    /// the pair are refused.
    pub async fn complete(
        &self,
        session: &str,
        agent: &str,
        content: &str,
        usage: Option<UsageTotals>,
    ) -> Result<(), FlowError> {
        let mut sessions = self.sessions.lock().await;
        let streams = sessions.entry(session.to_string()).or_default();
        Self::check_open(streams, session, agent)?;

        streams.completed.insert(agent.to_string());
        let completion = StreamCompletion {
            agent_name: agent.to_string(),
            content: content.to_string(),
            usage,
        };
        self.deliver(streams, StreamItem::Complete(completion)).await;
        Ok(())
    }

    /// Subscribe to `session`. Live sessions return a channel that receives
    /// every subsequent item; finished sessions return a replay (when the
    /// buffer still retains the whole stream) or an empty, closed channel.
    pub async fn subscribe(&self, session: &str) -> mpsc::Receiver<StreamItem> {
        let mut sessions = self.sessions.lock().await;
        let streams = sessions.entry(session.to_string()).or_default();

        if streams.finished {
            let replayable =
                self.replay_capacity > 0 && !streams.replay_evicted && !streams.replay.is_empty();
            let (tx, rx) = mpsc::channel(streams.replay.len().max(1));
            if replayable {
                for item in &streams.replay {
                    // Capacity covers the whole buffer, so this never fails.
                    let _ = tx.try_send(item.clone());
                }
            }
            drop(tx);
            return rx;
        }

        let (tx, rx) = mpsc::channel(self.subscriber_capacity);
        streams.subscribers.push(Subscriber {
            tx,
            dropped: false,
            closed: false,
        });
        rx
    }

    /// Close every subscriber channel for `session` and mark it finished.
    /// The replay buffer, when configured, survives for late subscribers.
    pub async fn finish(&self, session: &str) {
        let mut sessions = self.sessions.lock().await;
        if let Some(streams) = sessions.get_mut(session) {
            streams.finished = true;
            streams.subscribers.clear();
        }
    }

    /// True once [`StreamSink::finish`] has been called for `session`.
    pub async fn is_finished(&self, session: &str) -> bool {
        self.sessions
            .lock()
            .await
            .get(session)
            .map(|s| s.finished)
            .unwrap_or(false)
    }

    fn check_open(streams: &SessionStreams, session: &str, agent: &str) -> Result<(), FlowError> {
        if streams.finished {
            return Err(FlowError::ExecutionFailed(format!(
                "stream for session '{}' is finished",
                session
            )));
        }
        if streams.completed.contains(agent) {
            return Err(FlowError::ExecutionFailed(format!(
                "stream for agent '{}' already completed",
                agent
            )));
        }
        Ok(())
    }

    async fn deliver(&self, streams: &mut SessionStreams, item: StreamItem) {
        if self.replay_capacity > 0 {
            if streams.replay.len() >= self.replay_capacity {
                streams.replay.pop_front();
                streams.replay_evicted = true;
            }
            streams.replay.push_back(item.clone());
        }

        for subscriber in streams.subscribers.iter_mut() {
            let to_send = match (&item, subscriber.dropped) {
                (StreamItem::Chunk(chunk), true) => {
                    let mut marked = chunk.clone();
                    marked.dropped_before = true;
                    StreamItem::Chunk(marked)
                }
                _ => item.clone(),
            };

            match self.policy {
                BackpressurePolicy::DropWithMarker => match subscriber.tx.try_send(to_send) {
                    Ok(()) => subscriber.dropped = false,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        log::warn!("stream subscriber lagging, dropping chunk");
                        subscriber.dropped = true;
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => subscriber.closed = true,
                },
                BackpressurePolicy::Block { push_timeout } => {
                    match tokio::time::timeout(push_timeout, subscriber.tx.send(to_send)).await {
                        Ok(Ok(())) => subscriber.dropped = false,
                        Ok(Err(_)) => subscriber.closed = true,
                        Err(_) => {
                            log::warn!("stream subscriber blocked past push timeout, dropping chunk");
                            subscriber.dropped = true;
                        }
                    }
                }
            }
        }
        streams.subscribers.retain(|s| !s.closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn chunks_are_indexed_per_agent_in_order() {
        let sink = StreamSink::new();
        let mut rx = sink.subscribe("s1").await;

        assert_eq!(sink.push("s1", "a", "one").await.unwrap(), 0);
        assert_eq!(sink.push("s1", "b", "other").await.unwrap(), 0);
        assert_eq!(sink.push("s1", "a", "two").await.unwrap(), 1);

        let mut a_indices = Vec::new();
        for _ in 0..3 {
            if let StreamItem::Chunk(chunk) = rx.recv().await.unwrap() {
                if chunk.agent_name == "a" {
                    a_indices.push(chunk.chunk_index);
                }
            }
        }
        assert_eq!(a_indices, vec![0, 1]);
    }

    #[tokio::test]
    async fn out_of_order_chunk_is_refused() {
        let sink = StreamSink::new();
        let chunk = StreamChunk::new("a", "x", 5);
        let err = sink.push_chunk("s1", chunk).await.unwrap_err();
        assert!(err.to_string().contains("out-of-order"));
    }

    #[tokio::test]
    async fn push_after_complete_is_refused() {
        let sink = StreamSink::new();
        sink.complete("s1", "a", "done", None).await.unwrap();
        let err = sink.push("s1", "a", "late").await.unwrap_err();
        assert!(err.to_string().contains("already completed"));
    }

    #[tokio::test]
    async fn finish_closes_subscribers() {
        let sink = StreamSink::new();
        let mut rx = sink.subscribe("s1").await;
        sink.push("s1", "a", "only").await.unwrap();
        sink.finish("s1").await;

        assert!(matches!(rx.recv().await, Some(StreamItem::Chunk(_))));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn late_subscriber_replays_when_buffered() {
        let sink = StreamSink::new().with_replay_buffer(16);
        sink.push("s1", "a", "one").await.unwrap();
        sink.complete("s1", "a", "one", None).await.unwrap();
        sink.finish("s1").await;

        let mut rx = sink.subscribe("s1").await;
        assert!(matches!(rx.recv().await, Some(StreamItem::Chunk(_))));
        assert!(matches!(rx.recv().await, Some(StreamItem::Complete(_))));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn late_subscriber_without_buffer_gets_closed_channel() {
        let sink = StreamSink::new();
        sink.push("s1", "a", "one").await.unwrap();
        sink.finish("s1").await;

        let mut rx = sink.subscribe("s1").await;
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn slow_subscriber_sees_drop_marker() {
        let sink = StreamSink::new().with_subscriber_capacity(1);
        let mut rx = sink.subscribe("s1").await;

        // Capacity 1: the second push drops, the third carries the marker.
        sink.push("s1", "a", "kept").await.unwrap();
        sink.push("s1", "a", "lost").await.unwrap();

        if let Some(StreamItem::Chunk(first)) = rx.recv().await {
            assert_eq!(first.content, "kept");
            assert!(!first.dropped_before);
        } else {
            panic!("expected first chunk");
        }

        sink.push("s1", "a", "after-gap").await.unwrap();
        if let Some(StreamItem::Chunk(next)) = rx.recv().await {
            assert_eq!(next.content, "after-gap");
            assert!(next.dropped_before);
        } else {
            panic!("expected marked chunk");
        }
    }
}
