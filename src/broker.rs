//! Per-query streaming queues.
//!
//! The LLM streaming callback pushes chunks for a query id; an HTTP handler
//! (or the CLI) consumes them as a [`Stream`]. Either side may touch a query
//! id first: the queue is created lazily on first use. A queue is released
//! when its consumer reads the done marker, or by [`StreamingBroker::close`]
//! when nobody is reading it.
//!
//! Pushing never blocks (unbounded channel). The id→queue map sits behind a
//! `std::sync::Mutex` that is never held across an `.await`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::stream::{self, BoxStream, Stream, StreamExt};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::debug;

enum Message {
    Chunk(String),
    Done,
}

struct Queue {
    tx: UnboundedSender<Message>,
    /// Taken by the first consumer.
    rx: Option<UnboundedReceiver<Message>>,
}

impl Queue {
    fn new() -> Self {
        let (tx, rx) = unbounded_channel();
        Self { tx, rx: Some(rx) }
    }
}

#[derive(Default)]
pub struct StreamingBroker {
    queues: Mutex<HashMap<String, Queue>>,
}

impl StreamingBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn queues(&self) -> MutexGuard<'_, HashMap<String, Queue>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn send(&self, query_id: &str, message: Message) {
        let mut queues = self.queues();
        let queue = queues
            .entry(query_id.to_string())
            .or_insert_with(Queue::new);
        // Fails only when the consumer went away mid-stream; the chunk is dropped.
        let _ = queue.tx.send(message);
    }

    /// Append a chunk to the queue for `query_id`.
    pub fn push(&self, query_id: &str, chunk: impl Into<String>) {
        self.send(query_id, Message::Chunk(chunk.into()));
    }

    /// Mark the end of the stream for `query_id`.
    pub fn push_done(&self, query_id: &str) {
        self.send(query_id, Message::Done);
    }

    /// Stream the chunks for `query_id` until the done marker.
    ///
    /// Empty chunks are skipped. Reading the done marker removes the queue,
    /// so a later `consume` for the same id starts a fresh one. Only one
    /// consumer reads a live queue: a concurrent second call yields an empty
    /// stream.
    pub fn consume(self: &Arc<Self>, query_id: &str) -> BoxStream<'static, String> {
        let rx = {
            let mut queues = self.queues();
            queues
                .entry(query_id.to_string())
                .or_insert_with(Queue::new)
                .rx
                .take()
        };
        let Some(rx) = rx else {
            debug!(query_id, "stream already has a consumer");
            return stream::empty().boxed();
        };

        consume_queue(self.clone(), query_id.to_string(), rx).boxed()
    }

    pub fn contains(&self, query_id: &str) -> bool {
        self.queues().contains_key(query_id)
    }

    /// Number of live queues.
    pub fn len(&self) -> usize {
        self.queues().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// End the stream for `query_id` without creating a queue.
    ///
    /// A queue nobody is reading is dropped with its buffered chunks; an
    /// attached consumer receives the done marker instead.
    pub fn close(&self, query_id: &str) {
        let mut queues = self.queues();
        let Some(queue) = queues.get(query_id) else {
            return;
        };
        if queue.rx.is_some() {
            queues.remove(query_id);
        } else {
            let _ = queue.tx.send(Message::Done);
        }
    }

    fn release(&self, query_id: &str) {
        self.queues().remove(query_id);
    }
}

fn consume_queue(
    broker: Arc<StreamingBroker>,
    query_id: String,
    rx: UnboundedReceiver<Message>,
) -> impl Stream<Item = String> + Send + 'static {
    stream::unfold((broker, query_id, rx), |(broker, query_id, mut rx)| async move {
        loop {
            match rx.recv().await {
                Some(Message::Chunk(chunk)) if chunk.is_empty() => continue,
                Some(Message::Chunk(chunk)) => return Some((chunk, (broker, query_id, rx))),
                Some(Message::Done) | None => {
                    broker.release(&query_id);
                    return None;
                }
            }
        }
    })
}
