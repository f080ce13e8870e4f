// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The single consumer of the event queue: persists events and fans them
//! out to filtered subscribers.

use crate::queue::EventConsumer;
use crate::storage::Storage;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{info, warn};
use vigil_common::{EventKind, SecurityEvent, Severity};

/// Events popped per tick before checking the running flag again.
const BATCH_SIZE: usize = 100;
/// Idle sleep when the queue is empty.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

type Callback = Box<dyn Fn(&SecurityEvent) + Send + Sync + 'static>;

/// Handle returned by [`EventDispatcher::subscribe`]; pass it back to
/// [`EventDispatcher::unsubscribe`] to deregister.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Subscription(u64);

struct Subscriber {
    id: u64,
    kind: Option<EventKind>,
    min_severity: Severity,
    callback: Callback,
}

impl Subscriber {
    /// Kind filter of `None` matches any kind; severity matches when the
    /// event is at least as severe (grade-wise ≤) as the threshold.
    fn matches(&self, event: &SecurityEvent) -> bool {
        if let Some(kind) = self.kind {
            if kind != event.kind {
                return false;
            }
        }
        event.severity.grade() <= self.min_severity.grade()
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct DispatchCounters {
    pub processed: u64,
    pub stored: u64,
    pub dropped: u64,
    pub callbacks_invoked: u64,
}

struct DispatchShared {
    running: AtomicBool,
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: AtomicU64,
    processed: AtomicU64,
    stored: AtomicU64,
    dropped: AtomicU64,
    callbacks_invoked: AtomicU64,
}

pub struct EventDispatcher {
    shared: Arc<DispatchShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl EventDispatcher {
    /// Spawns the dispatcher thread over the queue's consumer end.
    pub fn start(consumer: EventConsumer, storage: Arc<dyn Storage>) -> Self {
        let shared = Arc::new(DispatchShared {
            running: AtomicBool::new(true),
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            processed: AtomicU64::new(0),
            stored: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            callbacks_invoked: AtomicU64::new(0),
        });
        let thread_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("vigil-dispatch".to_owned())
            .spawn(move || dispatch_loop(consumer, storage, thread_shared))
            .ok();
        EventDispatcher {
            shared,
            thread: Mutex::new(thread),
        }
    }

    pub fn subscribe(
        &self,
        kind: Option<EventKind>,
        min_severity: Severity,
        callback: impl Fn(&SecurityEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut subscribers) = self.shared.subscribers.lock() {
            subscribers.push(Subscriber {
                id,
                kind,
                min_severity,
                callback: Box::new(callback),
            });
        }
        Subscription(id)
    }

    /// Returns true when the handle was registered.
    pub fn unsubscribe(&self, subscription: Subscription) -> bool {
        let Ok(mut subscribers) = self.shared.subscribers.lock() else {
            return false;
        };
        let before = subscribers.len();
        subscribers.retain(|s| s.id != subscription.0);
        subscribers.len() != before
    }

    pub fn counters(&self) -> DispatchCounters {
        DispatchCounters {
            processed: self.shared.processed.load(Ordering::Relaxed),
            stored: self.shared.stored.load(Ordering::Relaxed),
            dropped: self.shared.dropped.load(Ordering::Relaxed),
            callbacks_invoked: self.shared.callbacks_invoked.load(Ordering::Relaxed),
        }
    }

    /// Requests exit and joins the thread. The loop drains the queue before
    /// returning so no accepted event is lost on a graceful shutdown.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Ok(mut guard) = self.thread.lock() {
            if let Some(handle) = guard.take() {
                let _ = handle.join();
            }
        }
        info!("event dispatcher stopped");
    }
}

fn dispatch_loop(
    mut consumer: EventConsumer,
    storage: Arc<dyn Storage>,
    shared: Arc<DispatchShared>,
) {
    info!("event dispatcher started");

    while shared.running.load(Ordering::SeqCst) {
        let mut processed_any = false;
        for _ in 0..BATCH_SIZE {
            if !shared.running.load(Ordering::SeqCst) {
                break;
            }
            match consumer.pop() {
                Some(event) => {
                    process_event(&event, &storage, &shared);
                    processed_any = true;
                }
                None => break,
            }
        }
        if !processed_any {
            thread::sleep(POLL_INTERVAL);
        }
    }

    // Drain whatever is left so accepted events still reach storage.
    info!("event dispatcher draining queue");
    while let Some(event) = consumer.pop() {
        process_event(&event, &storage, &shared);
    }
}

fn process_event(event: &SecurityEvent, storage: &Arc<dyn Storage>, shared: &DispatchShared) {
    shared.processed.fetch_add(1, Ordering::Relaxed);

    info!(
        kind = %event.kind,
        severity = %event.severity,
        src = %event.src_addr,
        src_port = event.src_port,
        dst = %event.dst_addr,
        dst_port = event.dst_port,
        sid = event.rule_sid,
        message = %event.message,
        "event"
    );

    match storage.insert(event) {
        Ok(()) => {
            shared.stored.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            shared.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(error = %e, "failed to store event");
        }
    }

    if let Ok(subscribers) = shared.subscribers.lock() {
        for subscriber in subscribers.iter() {
            if subscriber.matches(event) {
                (subscriber.callback)(event);
                shared.callbacks_invoked.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}
