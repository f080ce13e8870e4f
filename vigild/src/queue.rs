// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Lock-free multi-producer single-consumer event queue.
//!
//! Vyukov-style stub-node linked queue. Producers enqueue with a single
//! atomic swap on the tail; the consumer advances the head and is the only
//! side that ever frees nodes, which closes the ABA hazard a free-on-dequeue
//! design would have under concurrent producers.
//!
//! Capacity is a soft back-pressure limit: the size counter is checked
//! before the node allocation, so a burst across many producers can
//! transiently overshoot by O(producers). Rejected pushes bump the drop
//! counter and the event is discarded.

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use vigil_common::SecurityEvent;

pub const DEFAULT_CAPACITY: usize = 4096;

struct Node {
    next: AtomicPtr<Node>,
    // None only while the node is in the stub position.
    event: Option<SecurityEvent>,
}

impl Node {
    fn stub() -> *mut Node {
        Box::into_raw(Box::new(Node {
            next: AtomicPtr::new(ptr::null_mut()),
            event: None,
        }))
    }
}

struct Inner {
    // Consumed from the consumer side only; stored here so the final
    // handle's drop can free the remaining chain.
    head: AtomicPtr<Node>,
    tail: AtomicPtr<Node>,
    capacity: usize,
    size: AtomicUsize,
    enqueued: AtomicU64,
    dequeued: AtomicU64,
    dropped: AtomicU64,
}

impl Drop for Inner {
    fn drop(&mut self) {
        // No handles remain, so no concurrent access: walk the chain and
        // free every node including the stub.
        let mut cursor = self.head.load(Ordering::Relaxed);
        while !cursor.is_null() {
            // Safety: nodes in the chain were created by Box::into_raw and
            // are only ever freed here or by the consumer.
            let node = unsafe { Box::from_raw(cursor) };
            cursor = node.next.load(Ordering::Relaxed);
        }
    }
}

/// Counters over the queue's lifetime. `enqueued = dequeued + dropped +
/// events still queued` holds at any quiescent point.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub enqueued: u64,
    pub dequeued: u64,
    pub dropped: u64,
}

#[derive(Debug, thiserror::Error)]
#[error("event queue is at capacity")]
pub struct QueueFull;

/// Producer handle. Cloneable; any number of threads may push.
#[derive(Clone)]
pub struct EventQueue {
    inner: Arc<Inner>,
}

/// The single consumer. Not cloneable, and `pop` takes `&mut self`, so the
/// one-consumer contract is enforced by the type system.
pub struct EventConsumer {
    inner: Arc<Inner>,
}

/// Creates a queue with the given soft capacity (0 means the default).
pub fn with_capacity(capacity: usize) -> (EventQueue, EventConsumer) {
    let capacity = if capacity == 0 {
        DEFAULT_CAPACITY
    } else {
        capacity
    };
    let stub = Node::stub();
    let inner = Arc::new(Inner {
        head: AtomicPtr::new(stub),
        tail: AtomicPtr::new(stub),
        capacity,
        size: AtomicUsize::new(0),
        enqueued: AtomicU64::new(0),
        dequeued: AtomicU64::new(0),
        dropped: AtomicU64::new(0),
    });
    (
        EventQueue {
            inner: Arc::clone(&inner),
        },
        EventConsumer { inner },
    )
}

impl EventQueue {
    /// Enqueues one event. Wait-free apart from the node allocation.
    /// At or over capacity the event is discarded and the drop counter
    /// incremented.
    pub fn push(&self, event: SecurityEvent) -> Result<(), QueueFull> {
        let inner = &*self.inner;
        if inner.size.load(Ordering::Acquire) >= inner.capacity {
            inner.dropped.fetch_add(1, Ordering::Relaxed);
            return Err(QueueFull);
        }

        let node = Box::into_raw(Box::new(Node {
            next: AtomicPtr::new(ptr::null_mut()),
            event: Some(event),
        }));

        // Swap ourselves in as the tail, then link the previous tail to us.
        // Between the two steps the chain is momentarily broken; the
        // consumer simply sees an empty `next` and retries later.
        let prev = inner.tail.swap(node, Ordering::AcqRel);
        // Safety: `prev` is either the stub or a node a producer published;
        // only the consumer frees nodes, and it cannot free `prev` before
        // its `next` is linked (it stops at a null `next`).
        unsafe {
            (*prev).next.store(node, Ordering::Release);
        }

        inner.size.fetch_add(1, Ordering::Release);
        inner.enqueued.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Approximate number of queued events.
    pub fn len(&self) -> usize {
        self.inner.size.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            enqueued: self.inner.enqueued.load(Ordering::Relaxed),
            dequeued: self.inner.dequeued.load(Ordering::Relaxed),
            dropped: self.inner.dropped.load(Ordering::Relaxed),
        }
    }
}

impl EventConsumer {
    /// Dequeues the oldest available event, or `None` when the queue is
    /// empty. Per producer, pop order matches push order.
    pub fn pop(&mut self) -> Option<SecurityEvent> {
        let inner = &*self.inner;
        let head = inner.head.load(Ordering::Relaxed);
        // Safety: `head` is the stub node, owned by this consumer.
        let next = unsafe { (*head).next.load(Ordering::Acquire) };
        if next.is_null() {
            return None;
        }

        // Safety: `next` is fully published (the Release store above paired
        // with our Acquire load), and only this consumer mutates it. Taking
        // the payload turns `next` into the new stub.
        let event = unsafe { (*next).event.take() };
        inner.head.store(next, Ordering::Relaxed);
        // Safety: the old stub is unreachable to producers once head moved
        // past it; this consumer is the only side that frees nodes.
        drop(unsafe { Box::from_raw(head) });

        inner.size.fetch_sub(1, Ordering::Release);
        inner.dequeued.fetch_add(1, Ordering::Relaxed);
        event
    }

    pub fn len(&self) -> usize {
        self.inner.size.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            enqueued: self.inner.enqueued.load(Ordering::Relaxed),
            dequeued: self.inner.dequeued.load(Ordering::Relaxed),
            dropped: self.inner.dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use vigil_common::EventKind;

    fn event(message: &str) -> SecurityEvent {
        let mut event = SecurityEvent::new(EventKind::Alert);
        event.message = message.to_owned();
        event
    }

    #[test]
    fn pop_on_empty_returns_none() {
        let (_queue, mut consumer) = with_capacity(8);
        assert!(consumer.pop().is_none());
    }

    #[test]
    fn push_pop_single_producer_is_fifo() {
        let (queue, mut consumer) = with_capacity(16);
        for i in 0..5 {
            queue.push(event(&format!("e{i}"))).unwrap();
        }
        for i in 0..5 {
            assert_eq!(consumer.pop().unwrap().message, format!("e{i}"));
        }
        assert!(consumer.pop().is_none());
    }

    #[test]
    fn capacity_is_enforced_with_drop_accounting() {
        let (queue, mut consumer) = with_capacity(10);
        let mut accepted = 0;
        let mut rejected = 0;
        for i in 0..15 {
            match queue.push(event(&format!("e{i}"))) {
                Ok(()) => accepted += 1,
                Err(QueueFull) => rejected += 1,
            }
        }
        assert_eq!(accepted, 10);
        assert_eq!(rejected, 5);

        let stats = queue.stats();
        assert_eq!(stats.enqueued, 10);
        assert_eq!(stats.dropped, 5);

        let mut popped = 0;
        while consumer.pop().is_some() {
            popped += 1;
        }
        assert_eq!(popped, 10);
    }

    #[test]
    fn popped_events_are_independent_of_later_pushes() {
        let (queue, mut consumer) = with_capacity(8);
        queue.push(event("first")).unwrap();
        let first = consumer.pop().unwrap();
        queue.push(event("second")).unwrap();
        assert_eq!(first.message, "first");
        assert_eq!(consumer.pop().unwrap().message, "second");
    }

    #[test]
    fn multi_producer_conservation_and_per_producer_order() {
        const PRODUCERS: usize = 4;
        const PER_PRODUCER: usize = 1000;

        let (queue, mut consumer) = with_capacity(PRODUCERS * PER_PRODUCER);
        let mut handles = Vec::new();
        for p in 0..PRODUCERS {
            let queue = queue.clone();
            handles.push(thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    queue.push(event(&format!("{p}:{i}"))).unwrap();
                }
            }));
        }

        let consumer_handle = thread::spawn(move || {
            let mut last_seen = [0usize; PRODUCERS];
            let mut counts = [0usize; PRODUCERS];
            let mut total = 0;
            while total < PRODUCERS * PER_PRODUCER {
                match consumer.pop() {
                    Some(event) => {
                        let (p, i) = event.message.split_once(':').unwrap();
                        let p: usize = p.parse().unwrap();
                        let i: usize = i.parse().unwrap();
                        // FIFO per producer: indices arrive in order.
                        if counts[p] > 0 {
                            assert!(i > last_seen[p], "producer {p} reordered");
                        }
                        last_seen[p] = i;
                        counts[p] += 1;
                        total += 1;
                    }
                    None => thread::yield_now(),
                }
            }
            counts
        });

        for handle in handles {
            handle.join().unwrap();
        }
        let counts = consumer_handle.join().unwrap();
        assert!(counts.iter().all(|&c| c == PER_PRODUCER));

        let stats = queue.stats();
        assert_eq!(stats.enqueued, (PRODUCERS * PER_PRODUCER) as u64);
        assert_eq!(stats.dequeued, (PRODUCERS * PER_PRODUCER) as u64);
        assert_eq!(stats.dropped, 0);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn remaining_events_are_freed_on_drop() {
        let (queue, consumer) = with_capacity(8);
        for i in 0..4 {
            queue.push(event(&format!("e{i}"))).unwrap();
        }
        drop(consumer);
        drop(queue);
    }
}
