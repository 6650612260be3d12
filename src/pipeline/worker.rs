use crate::pipeline::ceng::parse_ceng;
use crate::pipeline::error::PipelineError;
use crate::pipeline::event::{GpsProperty, ParsedEvent, RawEvent};
use crate::pipeline::queue::{Dequeue, EventReceiver};
use crate::pipeline::sink::EventSink;
use crate::pipeline::task::TaskHandle;
use crate::shared::signal::CancelToken;
use tracing::{debug, error, info, warn};

// A sink failing this many times in a row is treated as gone for good.
const MAX_CONSECUTIVE_SINK_FAILURES: u32 = 20;

// Merge the parsed CENG metrics into the event. Never fails.
pub fn parse_event(raw: RawEvent) -> ParsedEvent {
    let fields = parse_ceng(&raw.frame);
    ParsedEvent { raw, fields }
}

// Sole consumer of the event queue.
pub struct Worker<S: EventSink> {
    queue: EventReceiver,
    sink: S,
    processed: u64,
    sink_failures: u64,
    consecutive_sink_failures: u32,
}

impl<S: EventSink> Worker<S> {
    pub fn new(queue: EventReceiver, sink: S) -> Self {
        Self {
            queue,
            sink,
            processed: 0,
            sink_failures: 0,
            consecutive_sink_failures: 0,
        }
    }

    // Parse and emit one event, then acknowledge it on the queue.
    // Errors only once the sink has failed too many times in a row.
    pub fn handle(&mut self, raw: RawEvent) -> Result<(), PipelineError> {
        debug!(ts = raw.ts, frame = %raw.frame, "event dequeued");
        let parsed = parse_event(raw);
        debug!(
            cell_id = parsed.field("cell_id"),
            rxl = parsed.field("rxl"),
            latitude = parsed.gps(GpsProperty::Latitude),
            longitude = parsed.gps(GpsProperty::Longitude),
            "event parsed"
        );
        let emitted = self.sink.emit(&parsed);
        self.processed += 1;
        self.queue.ack();

        match emitted {
            Ok(()) => {
                self.consecutive_sink_failures = 0;
                Ok(())
            }
            Err(err) => {
                self.sink_failures += 1;
                self.consecutive_sink_failures += 1;
                if self.consecutive_sink_failures >= MAX_CONSECUTIVE_SINK_FAILURES {
                    error!(error = %err, failures = self.sink_failures, "event sink keeps failing; worker giving up");
                    return Err(err);
                }
                warn!(error = %err, failures = self.sink_failures, "emitting event failed");
                Ok(())
            }
        }
    }

    // Consume events until cancelled or the queue closes. A sink that keeps failing ends the loop early.
    // A stop request wakes an idle worker immediately since the queue wait also
    // watches the cancellation signal.
    pub fn run(mut self, cancel: &CancelToken) -> Result<(), PipelineError> {
        let outcome = loop {
            match self.queue.recv(cancel) {
                Dequeue::Event(raw) => {
                    if let Err(err) = self.handle(raw) {
                        break Err(err);
                    }
                }
                Dequeue::Cancelled | Dequeue::Closed => break Ok(()),
            }
        };
        info!(
            processed = self.processed,
            sink_failures = self.sink_failures,
            "worker stopped"
        );
        outcome?;
        self.sink.flush()
    }
}

pub fn spawn_worker<S: EventSink + 'static>(
    queue: EventReceiver,
    sink: S,
    token: CancelToken,
) -> Result<TaskHandle, PipelineError> {
    let worker = Worker::new(queue, sink);
    let handle = TaskHandle::spawn("worker", token, move |cancel| worker.run(&cancel))?;
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::OverflowPolicy;
    use crate::pipeline::queue::event_queue;
    use crate::pipeline::sink::CallbackSink;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn raw(frame: &str) -> RawEvent {
        RawEvent {
            ts: 1.0,
            frame: frame.to_string(),
            gps: None,
        }
    }

    #[test]
    fn parse_event_keeps_raw_fields() {
        let parsed = parse_event(raw("+CENG: 0,\"512\",\"40\""));
        assert_eq!(parsed.raw.frame, "+CENG: 0,\"512\",\"40\"");
        assert_eq!(parsed.field("arfcn"), Some("512"));
        assert_eq!(parsed.field("rxl"), Some("40"));
        assert_eq!(parsed.field("rxq"), None);
    }

    #[test]
    fn worker_processes_in_fifo_order_and_stops_on_cancel() {
        let token = CancelToken::new();
        let (tx, rx) = event_queue(None, OverflowPolicy::Block);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let sink = CallbackSink::new(move |event: &ParsedEvent| {
            if let Ok(mut seen) = sink_seen.lock() {
                seen.push(event.field("arfcn").unwrap_or_default().to_string());
            }
        });

        tx.push(raw("+CENG: 0,1"), &token).expect("push");
        tx.push(raw("+CENG: 0,2"), &token).expect("push");
        let stats = rx.stats();
        let mut task = spawn_worker(rx, sink, token.clone()).expect("spawn");

        assert!(crate::pipeline::queue::wait_drained(&stats, Duration::from_secs(5)));
        task.stop();
        task.stop();
        assert!(task.join().is_ok());
        assert_eq!(*seen.lock().expect("lock"), ["1", "2"]);
    }

    struct BrokenSink;

    impl EventSink for BrokenSink {
        fn emit(&mut self, _: &ParsedEvent) -> Result<(), PipelineError> {
            Err(PipelineError::Io(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "closed")))
        }
    }

    #[test]
    fn worker_fails_once_the_sink_keeps_failing() {
        let token = CancelToken::new();
        let (tx, rx) = event_queue(None, OverflowPolicy::Block);
        for _ in 0..MAX_CONSECUTIVE_SINK_FAILURES + 5 {
            tx.push(raw("+CENG: 0,1"), &token).expect("push");
        }
        let stats = rx.stats();
        let mut task = spawn_worker(rx, BrokenSink, token).expect("spawn");

        assert!(matches!(task.join(), Err(PipelineError::Io(_))));
        assert_eq!(stats.in_flight(), 5);
        drop(tx);
    }

    #[test]
    fn single_sink_failure_is_tolerated() {
        let (_tx, rx) = event_queue(None, OverflowPolicy::Block);
        let mut worker = Worker::new(rx, BrokenSink);
        assert!(worker.handle(raw("+CENG: 0,1")).is_ok());
        assert_eq!(worker.sink_failures, 1);
    }

    #[test]
    fn worker_exits_when_producer_is_dropped() {
        let token = CancelToken::new();
        let (tx, rx) = event_queue(None, OverflowPolicy::Block);
        let mut task = spawn_worker(rx, CallbackSink::new(|_: &ParsedEvent| {}), token).expect("spawn");
        drop(tx);
        assert!(task.join().is_ok());
    }
}
