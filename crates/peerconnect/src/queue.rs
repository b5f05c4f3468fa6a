//! Single-consumer task queue bound to an owning context
//!
//! Any thread may post; exactly one receiver, running on the owning
//! context, executes tasks. Tasks come out ordered by deadline, ties broken
//! by post order, so immediate posts keep FIFO order and delayed posts slot
//! in when they fall due.
//!
//! Delayed tasks cannot be cancelled. Tasks that target something that may
//! be torn down in the meantime carry a liveness token and are checked by
//! the consumer before acting.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, ThreadId};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::time::Instant;
use tracing::trace;

/// State shared by every sender and the receiver
#[derive(Debug, Default)]
struct Shared {
    sequence: AtomicU64,
    owner: OnceLock<ThreadId>,
}

struct Envelope<T> {
    deadline: Instant,
    sequence: u64,
    task: T,
}

impl<T> PartialEq for Envelope<T> {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.sequence == other.sequence
    }
}

impl<T> Eq for Envelope<T> {}

impl<T> PartialOrd for Envelope<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Reversed so the std max-heap pops the earliest deadline first.
impl<T> Ord for Envelope<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// Create a queue; the receiver belongs to the owning context
pub fn message_queue<T>() -> (QueueSender<T>, QueueReceiver<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared::default());

    (
        QueueSender {
            tx,
            shared: Arc::clone(&shared),
        },
        QueueReceiver {
            rx,
            pending: BinaryHeap::new(),
            shared,
            disconnected: false,
        },
    )
}

/// Posting side of the queue, cheap to clone and usable from any thread
pub struct QueueSender<T> {
    tx: mpsc::UnboundedSender<Envelope<T>>,
    shared: Arc<Shared>,
}

impl<T> Clone for QueueSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> QueueSender<T> {
    /// Post a task for execution as soon as the owner gets to it
    pub fn post(&self, task: T) {
        self.enqueue(Instant::now(), task);
    }

    /// Post a task that becomes due after `delay`
    pub fn post_delayed(&self, delay: Duration, task: T) {
        self.enqueue(Instant::now() + delay, task);
    }

    fn enqueue(&self, deadline: Instant, task: T) {
        let sequence = self.shared.sequence.fetch_add(1, AtomicOrdering::Relaxed);
        let envelope = Envelope {
            deadline,
            sequence,
            task,
        };

        if self.tx.send(envelope).is_err() {
            trace!(sequence, "owning context is gone, dropping task");
        }
    }

    /// True when called on the thread the receiver is bound to
    pub fn is_owning_context(&self) -> bool {
        self.shared.owner.get() == Some(&thread::current().id())
    }

    /// True once the receiver has been dropped
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consuming side of the queue, owned by the owning context's run loop
pub struct QueueReceiver<T> {
    rx: mpsc::UnboundedReceiver<Envelope<T>>,
    pending: BinaryHeap<Envelope<T>>,
    shared: Arc<Shared>,
    disconnected: bool,
}

impl<T> QueueReceiver<T> {
    /// Record the current thread as the owning context
    ///
    /// Returns false if the queue was already bound.
    pub fn bind_to_current_thread(&self) -> bool {
        self.shared.owner.set(thread::current().id()).is_ok()
    }

    /// Next task that is already due, without waiting
    pub fn try_next(&mut self) -> Option<T> {
        self.drain();
        self.pop_due(Instant::now())
    }

    /// Wait for the next due task
    ///
    /// Returns `None` once every sender is gone and nothing is pending.
    pub async fn next(&mut self) -> Option<T> {
        loop {
            if let Some(task) = self.try_next() {
                return Some(task);
            }

            match self.pending.peek().map(|envelope| envelope.deadline) {
                Some(deadline) => {
                    tokio::select! {
                        received = self.rx.recv(), if !self.disconnected => self.accept(received),
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None if self.disconnected => return None,
                None => {
                    let received = self.rx.recv().await;
                    self.accept(received);
                }
            }
        }
    }

    /// Number of tasks received but not yet due or not yet taken
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    fn accept(&mut self, received: Option<Envelope<T>>) {
        match received {
            Some(envelope) => self.pending.push(envelope),
            None => self.disconnected = true,
        }
    }

    fn drain(&mut self) {
        while !self.disconnected {
            match self.rx.try_recv() {
                Ok(envelope) => self.pending.push(envelope),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => self.disconnected = true,
            }
        }
    }

    fn pop_due(&mut self, now: Instant) -> Option<T> {
        if self.pending.peek()?.deadline <= now {
            self.pending.pop().map(|envelope| envelope.task)
        } else {
            None
        }
    }
}
