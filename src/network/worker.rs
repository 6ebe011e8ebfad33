// Bounded message dispatch
//
// Decoded network events pass through a bounded queue into a fixed pool
// of worker tasks. What happens when the queue is full is the overflow
// policy's call, not an unbounded buffer's.

use crate::error::NetError;
use crate::network::gossip::NetEvent;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

/// What to do with a new event when the queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Drop the newest event silently (logged at debug)
    DropNewest,
    /// Block the submitter until space frees up
    Block,
    /// Hand the submitter an error
    Reject,
}

/// Handler invoked by the workers for every event
pub type HandlerFn =
    Arc<dyn Fn(NetEvent) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

pub struct Dispatcher {
    queue: mpsc::Sender<NetEvent>,
    policy: OverflowPolicy,
}

impl Dispatcher {
    /// Spawn `workers` tasks draining a queue of `capacity` events.
    pub fn start(
        workers: usize,
        capacity: usize,
        policy: OverflowPolicy,
        handler: HandlerFn,
        cancel: CancellationToken,
    ) -> Self {
        let (queue, rx) = mpsc::channel(capacity);
        let rx = Arc::new(Mutex::new(rx));

        for worker in 0..workers.max(1) {
            let rx = rx.clone();
            let handler = handler.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                worker_loop(worker, rx, handler, cancel).await;
            });
        }

        Self { queue, policy }
    }

    /// Submit an event per the configured overflow policy.
    pub async fn submit(&self, event: NetEvent) -> Result<(), NetError> {
        match self.policy {
            OverflowPolicy::Block => self
                .queue
                .send(event)
                .await
                .map_err(|_| NetError::QueueFull),
            OverflowPolicy::DropNewest => {
                if self.queue.try_send(event).is_err() {
                    log::debug!("dispatch queue full, dropping event");
                }
                Ok(())
            }
            OverflowPolicy::Reject => self
                .queue
                .try_send(event)
                .map_err(|_| NetError::QueueFull),
        }
    }
}

async fn worker_loop(
    worker: usize,
    rx: Arc<Mutex<mpsc::Receiver<NetEvent>>>,
    handler: HandlerFn,
    cancel: CancellationToken,
) {
    loop {
        let event = {
            let mut guard = rx.lock().await;
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = guard.recv() => event,
            }
        };
        let Some(event) = event else { break };

        // Run each event in its own task so a panicking handler is
        // caught at the task boundary instead of killing the worker
        if let Err(join_err) = tokio::spawn((handler)(event)).await {
            log::error!("worker {}: message handler panicked: {}", worker, join_err);
        }
    }
}
