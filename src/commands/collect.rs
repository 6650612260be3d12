use crate::args::CollectArgs;
use crate::pipeline::error::PipelineError;
use crate::pipeline::gps::{GpsConfig, spawn_gps_poller};
use crate::pipeline::link::ReconnectPolicy;
use crate::pipeline::modem::{ModemConfig, spawn_modem_reader};
use crate::pipeline::queue::{QueueStats, event_queue, wait_drained};
use crate::pipeline::sink::{EventSink, JsonLinesSink};
use crate::pipeline::task::TaskHandle;
use crate::pipeline::worker::spawn_worker;
use crate::shared::lock::LockGuard;
use crate::shared::signal::{CancelToken, install_ctrlc_handler};
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

const SUPERVISOR_POLL: Duration = Duration::from_millis(200);

// Public collect command entrypoint.
// Starts GPS (if configured), worker and modem reader, then supervises them until Ctrl-C or a failure.
pub fn run_collect(args: CollectArgs) -> Result<()> {
    let shutdown = CancelToken::new();
    install_ctrlc_handler(&shutdown)?;
    let _lock = LockGuard::acquire(&args.lock_file, &args.modem_port)?;

    let sink = open_sink(args.output.as_deref())?;
    let reconnect = ReconnectPolicy {
        attempts: args.reconnect_attempts,
        delay: Duration::from_millis(args.reconnect_delay_ms),
    };
    let (queue_tx, queue_rx) = event_queue(args.queue_capacity(), args.overflow);
    let mut pipeline = Pipeline::new(queue_rx.stats(), Duration::from_millis(args.drain_timeout_ms));

    let gps = match &args.gps_port {
        Some(port) => {
            let config = GpsConfig {
                port: port.clone(),
                baud_rate: args.gps_baud,
                read_timeout: Duration::from_millis(args.gps_timeout_ms),
                reconnect,
            };
            let (handle, source) = spawn_gps_poller(config, CancelToken::new())
                .with_context(|| format!("starting GPS poller failed: {port}"))?;
            pipeline.gps = Some(handle);

            // Let the receiver produce a fix before the first modem frame arrives.
            info!(secs = args.gps_warm_up_secs, "GPS warm-up");
            if shutdown.wait_timeout(Duration::from_secs(args.gps_warm_up_secs)) {
                return pipeline.finish();
            }
            if source.load().is_empty() {
                warn!(port = %port, "no GPS sentence decoded during warm-up");
            }
            Some(source)
        }
        None => None,
    };

    match spawn_worker(queue_rx, sink, CancelToken::new()) {
        Ok(handle) => pipeline.worker = Some(handle),
        Err(err) => return pipeline.abort(err, "starting worker failed"),
    }

    let modem_config = ModemConfig {
        port: args.modem_port.clone(),
        baud_rate: args.modem_baud,
        read_timeout: Duration::from_millis(args.modem_timeout_ms),
        chunk_bytes: args.read_chunk_bytes,
        reconnect,
    };
    match spawn_modem_reader(modem_config, queue_tx, gps, CancelToken::new()) {
        Ok(handle) => pipeline.modem = Some(handle),
        Err(err) => return pipeline.abort(err, "starting modem reader failed"),
    }
    info!(modem = %args.modem_port, gps = ?args.gps_port, "collector running");

    while !shutdown.is_cancelled() {
        if pipeline.poll_exits() {
            break;
        }
        shutdown.wait_timeout(SUPERVISOR_POLL);
    }
    if shutdown.is_cancelled() {
        info!("interrupt received; stopping collector");
    }
    pipeline.finish()
}

// Choose the record sink: JSON lines on stdout, or appended to a file.
pub(crate) fn open_sink(output: Option<&Path>) -> Result<Box<dyn EventSink>> {
    match output {
        Some(path) => {
            let sink = JsonLinesSink::append_to(path).with_context(|| {
                format!("opening event output failed: {}", path.display())
            })?;
            info!(path = %path.display(), "writing events to file");
            Ok(Box::new(sink))
        }
        None => Ok(Box::new(JsonLinesSink::stdout())),
    }
}

// Running components plus the failures they reported.
struct Pipeline {
    gps: Option<TaskHandle>,
    modem: Option<TaskHandle>,
    worker: Option<TaskHandle>,
    queue_stats: Arc<QueueStats>,
    drain_timeout: Duration,
    failures: Vec<(String, PipelineError)>,
}

impl Pipeline {
    fn new(queue_stats: Arc<QueueStats>, drain_timeout: Duration) -> Self {
        Self {
            gps: None,
            modem: None,
            worker: None,
            queue_stats,
            drain_timeout,
            failures: Vec::new(),
        }
    }

    // Returns true once the pipeline can no longer make progress.
    // A GPS stream that simply ended leaves the last fix in place and collection goes on.
    fn poll_exits(&mut self) -> bool {
        if self.gps.as_ref().is_some_and(TaskHandle::is_finished) {
            if let Some(mut gps) = self.gps.take() {
                match gps.join() {
                    Ok(()) => info!("GPS poller exited; events keep the last known fix"),
                    Err(err) => {
                        self.record(gps.name(), err);
                        return true;
                    }
                }
            }
        }

        for task in [&self.modem, &self.worker] {
            if task.as_ref().is_some_and(TaskHandle::is_finished) {
                let name = task.as_ref().map(|t| t.name().to_string()).unwrap_or_default();
                warn!(task = %name, "component exited; stopping collector");
                return true;
            }
        }
        false
    }

    fn record(&mut self, name: &str, err: PipelineError) {
        error!(task = name, error = %err, "component failed");
        self.failures.push((name.to_string(), err));
    }

    // Stop in dependency order: producer, GPS, then let the worker drain the queue.
    fn shutdown(&mut self) {
        let producers = [self.modem.take(), self.gps.take()];
        for mut task in producers.into_iter().flatten() {
            task.stop();
            if let Err(err) = task.join() {
                self.record(task.name(), err);
            }
        }

        if let Some(mut worker) = self.worker.take() {
            if !worker.is_finished() && !wait_drained(&self.queue_stats, self.drain_timeout) {
                warn!(
                    in_flight = self.queue_stats.in_flight(),
                    "queue not drained before timeout; remaining events discarded"
                );
            }
            worker.stop();
            if let Err(err) = worker.join() {
                self.record(worker.name(), err);
            }
        }
    }

    fn finish(mut self) -> Result<()> {
        self.shutdown();
        info!(dropped = self.queue_stats.dropped(), "collector stopped");
        match self.failures.into_iter().next() {
            Some((name, err)) => Err(anyhow::Error::new(err).context(format!("{name} failed"))),
            None => Ok(()),
        }
    }

    // Start-up failure after some components are already running.
    fn abort(mut self, err: PipelineError, context: &'static str) -> Result<()> {
        self.shutdown();
        if let Some((name, other)) = self.failures.first() {
            warn!(task = %name, error = %other, "component also failed during abort");
        }
        Err(anyhow::Error::new(err).context(context))
    }
}
