//! Priority queue with single-consumer async wakeup.

use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use tokio::sync::Notify;

/// Entry stored in the heap.
///
/// Ordering only looks at `(priority, seq)` so the payload does not need to
/// be `Ord`.
struct Entry<T> {
    priority: u32,
    seq: u64,
    item: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    // BinaryHeap is a max-heap: invert so the lowest (priority, seq) pops first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Inner<T> {
    heap: BinaryHeap<Entry<T>>,
    next_seq: u64,
}

/// Priority queue for queued agent messages.
///
/// - Lower priority values are served first
/// - Items of equal priority are served in insertion order
/// - Any number of producers may [`push`](Self::push) concurrently
/// - One consumer awaits [`pop`](Self::pop), which suspends while the queue
///   is empty and wakes on the next push
pub struct PriorityQueue<T> {
    name: String,
    inner: Mutex<Inner<T>>,
    notify: Notify,
}

impl<T> PriorityQueue<T> {
    /// Creates an empty queue. The name is only used for logging.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                next_seq: 0,
            }),
            notify: Notify::new(),
        }
    }

    /// Returns the queue name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Pushes an item with the given priority and wakes the consumer.
    pub fn push(&self, priority: u32, item: T) {
        {
            let mut inner = self.inner.lock();
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.heap.push(Entry {
                priority,
                seq,
                item,
            });
        }
        tracing::trace!(queue = %self.name, priority, "Item enqueued");
        self.notify.notify_one();
    }

    /// Pops the highest-priority item without waiting.
    pub fn try_pop(&self) -> Option<T> {
        self.inner.lock().heap.pop().map(|e| e.item)
    }

    /// Pops the highest-priority item, waiting for one if the queue is empty.
    pub async fn pop(&self) -> T {
        loop {
            let notified = self.notify.notified();
            if let Some(item) = self.try_pop() {
                return item;
            }
            notified.await;
        }
    }

    /// Removes every item, in the order they would have been popped.
    pub fn drain(&self) -> Vec<T> {
        let mut inner = self.inner.lock();
        let mut items = Vec::with_capacity(inner.heap.len());
        while let Some(entry) = inner.heap.pop() {
            items.push(entry.item);
        }
        items
    }

    /// Keeps only the items for which `keep` returns true; returns how many
    /// were removed. Relative order of the kept items is unchanged.
    pub fn retain(&self, mut keep: impl FnMut(&T) -> bool) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.heap.len();
        inner.heap.retain(|e| keep(&e.item));
        before - inner.heap.len()
    }

    /// Returns the number of queued items.
    pub fn len(&self) -> usize {
        self.inner.lock().heap.len()
    }

    /// Returns true if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().heap.is_empty()
    }
}
