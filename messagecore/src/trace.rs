//! Trace-sink interface for the external notification tracer.
//!
//! The real tracer transport (websockets, SSE, whatever the host wires
//! up) is an external collaborator; the core only needs somewhere to put
//! human-readable trace lines. [`BoundedTracer`] is the reference sink: a
//! mutex-guarded queue of fixed capacity that drops the oldest line when
//! full and fans each line out to subscribers. Any concurrent caller may
//! enqueue.

use std::collections::VecDeque;
use std::sync::Mutex;

/// Capacity of the reference tracer's queue.
pub const TRACE_QUEUE_CAPACITY: usize = 50;

/// Receiver of human-readable trace lines.
pub trait TraceSink: Send + Sync {
    /// Records one trace line. Must not block for long; callers sit on
    /// message-processing paths.
    fn trace(&self, message: &str);
}

type Subscriber = Box<dyn Fn(&str) + Send + Sync>;

struct TracerInner {
    queue: VecDeque<String>,
    subscribers: Vec<Subscriber>,
}

/// Reference trace sink: bounded queue, oldest-dropped, with fan-out.
pub struct BoundedTracer {
    inner: Mutex<TracerInner>,
    capacity: usize,
}

impl BoundedTracer {
    /// Creates a tracer with the standard capacity of 50 lines.
    pub fn new() -> Self {
        Self::with_capacity(TRACE_QUEUE_CAPACITY)
    }

    /// Creates a tracer with an explicit capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(TracerInner {
                queue: VecDeque::with_capacity(capacity),
                subscribers: Vec::new(),
            }),
            capacity,
        }
    }

    /// Registers a subscriber invoked for every subsequent trace line.
    pub fn subscribe(&self, subscriber: impl Fn(&str) + Send + Sync + 'static) {
        self.lock().subscribers.push(Box::new(subscriber));
    }

    /// The retained lines, oldest first.
    pub fn lines(&self) -> Vec<String> {
        self.lock().queue.iter().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TracerInner> {
        self.inner.lock().expect("tracer lock poisoned")
    }
}

impl Default for BoundedTracer {
    fn default() -> Self {
        Self::new()
    }
}

impl TraceSink for BoundedTracer {
    fn trace(&self, message: &str) {
        let mut inner = self.lock();
        if inner.queue.len() == self.capacity {
            inner.queue.pop_front();
        }
        inner.queue.push_back(message.to_string());
        for subscriber in &inner.subscribers {
            subscriber(message);
        }
    }
}
