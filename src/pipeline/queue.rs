use crate::args::OverflowPolicy;
use crate::pipeline::error::PipelineError;
use crate::pipeline::event::RawEvent;
use crate::shared::signal::CancelToken;
use crossbeam_channel::{Receiver, SendTimeoutError, Sender, TrySendError, select};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::warn;

const BLOCK_RETRY: Duration = Duration::from_millis(100);
const DRAIN_POLL: Duration = Duration::from_millis(10);

// FIFO hand-off between the modem reader (single producer) and the worker (single consumer).
// `capacity == None` gives an unbounded queue; otherwise `policy` decides what happens when full.
pub fn event_queue(capacity: Option<usize>, policy: OverflowPolicy) -> (EventSender, EventReceiver) {
    let (tx, rx) = match capacity {
        Some(cap) => crossbeam_channel::bounded(cap.max(1)),
        None => crossbeam_channel::unbounded(),
    };
    let stats = Arc::new(QueueStats::default());
    let evict = match (capacity, policy) {
        (Some(_), OverflowPolicy::DropOldest) => Some(rx.clone()),
        _ => None,
    };
    let sender = EventSender {
        tx,
        evict,
        policy,
        stats: Arc::clone(&stats),
    };
    let receiver = EventReceiver { rx, stats };
    (sender, receiver)
}

#[derive(Debug, Default)]
pub struct QueueStats {
    in_flight: AtomicUsize,
    dropped: AtomicU64,
}

impl QueueStats {
    // Events queued or being processed but not yet acknowledged.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::SeqCst)
    }

    fn release(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    fn record_drop(&self) -> u64 {
        self.dropped.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    Dropped,
}

pub enum Dequeue {
    Event(RawEvent),
    Cancelled,
    Closed,
}

pub struct EventSender {
    tx: Sender<RawEvent>,
    // Receiver clone used only to evict the oldest entry under DropOldest.
    // While it exists the producer never observes the consumer going away.
    evict: Option<Receiver<RawEvent>>,
    policy: OverflowPolicy,
    stats: Arc<QueueStats>,
}

impl EventSender {
    pub fn push(&self, event: RawEvent, cancel: &CancelToken) -> Result<PushOutcome, PipelineError> {
        // Count before sending so the consumer's ack can never run ahead of it.
        self.stats.in_flight.fetch_add(1, Ordering::SeqCst);
        let outcome = self.push_inner(event, cancel);
        if !matches!(outcome, Ok(PushOutcome::Queued)) {
            self.stats.release();
        }
        if matches!(outcome, Ok(PushOutcome::Dropped)) {
            let total = self.stats.record_drop();
            warn!(policy = ?self.policy, dropped_total = total, "event queue full; dropped incoming event");
        }
        outcome
    }

    fn push_inner(&self, mut event: RawEvent, cancel: &CancelToken) -> Result<PushOutcome, PipelineError> {
        loop {
            match self.tx.try_send(event) {
                Ok(()) => return Ok(PushOutcome::Queued),
                Err(TrySendError::Disconnected(_)) => return Err(PipelineError::QueueClosed),
                Err(TrySendError::Full(rejected)) => event = rejected,
            }

            match self.policy {
                OverflowPolicy::DropNewest => return Ok(PushOutcome::Dropped),
                OverflowPolicy::DropOldest => {
                    if self
                        .evict
                        .as_ref()
                        .is_some_and(|evict| evict.try_recv().is_ok())
                    {
                        self.stats.release();
                        let total = self.stats.record_drop();
                        warn!(dropped_total = total, "event queue full; evicted oldest event");
                    }
                }
                OverflowPolicy::Block => loop {
                    match self.tx.send_timeout(event, BLOCK_RETRY) {
                        Ok(()) => return Ok(PushOutcome::Queued),
                        Err(SendTimeoutError::Disconnected(_)) => {
                            return Err(PipelineError::QueueClosed);
                        }
                        Err(SendTimeoutError::Timeout(rejected)) => {
                            if cancel.is_cancelled() {
                                return Ok(PushOutcome::Dropped);
                            }
                            event = rejected;
                        }
                    }
                },
            }
        }
    }
}

pub struct EventReceiver {
    rx: Receiver<RawEvent>,
    stats: Arc<QueueStats>,
}

impl EventReceiver {
    // Block until an event arrives, the token is cancelled, or every sender is gone.
    pub fn recv(&self, cancel: &CancelToken) -> Dequeue {
        if cancel.is_cancelled() {
            return Dequeue::Cancelled;
        }
        select! {
            recv(self.rx) -> msg => match msg {
                Ok(event) => Dequeue::Event(event),
                Err(_) => Dequeue::Closed,
            },
            recv(cancel.signal()) -> _ => Dequeue::Cancelled,
        }
    }

    // Mark one dequeued event as fully processed.
    pub fn ack(&self) {
        self.stats.release();
    }

    pub fn stats(&self) -> Arc<QueueStats> {
        Arc::clone(&self.stats)
    }
}

// Wait until every queued event has been acknowledged; false on timeout.
pub fn wait_drained(stats: &QueueStats, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while stats.in_flight() > 0 {
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(DRAIN_POLL);
    }
    true
}
