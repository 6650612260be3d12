use crate::pipeline::error::{Device, PipelineError, ReadFailure, classify_read_error};
use crate::pipeline::event::RawEvent;
use crate::pipeline::framer::LineFramer;
use crate::pipeline::gps::GpsSnapshotSource;
use crate::pipeline::link::{ModemLink, ReconnectPolicy, SessionEnd, open_serial, run_sessions};
use crate::pipeline::queue::{EventSender, PushOutcome};
use crate::pipeline::task::TaskHandle;
use crate::shared::signal::CancelToken;
use std::io;
use std::time::Duration;
use tracing::{debug, info, warn};

// Switches the modem into periodic engineering-mode reports.
pub const INIT_COMMAND: &str = "AT+CENG=2";
pub const DEFAULT_CHUNK_BYTES: usize = 1_000;
const MAX_CONSECUTIVE_READ_ERRORS: u32 = 50;

#[derive(Debug, Clone)]
pub struct ModemConfig {
    pub port: String,
    pub baud_rate: u32,
    pub read_timeout: Duration,
    pub chunk_bytes: usize,
    pub reconnect: ReconnectPolicy,
}

// Write an AT command terminated by a newline. No response is awaited.
pub fn write_command<L: ModemLink>(link: &mut L, command: &str) -> io::Result<()> {
    debug!(cmd = command, "modem command");
    link.write_all(command.as_bytes())?;
    link.write_all(b"\n")?;
    link.flush()
}

// Turns modem bytes into timestamped raw events on the queue.
pub struct ModemReader {
    framer: LineFramer,
    chunk: Vec<u8>,
    chunk_bytes: usize,
    frames: Vec<String>,
    queue: EventSender,
    gps: Option<GpsSnapshotSource>,
    detected: u64,
}

impl ModemReader {
    pub fn new(queue: EventSender, gps: Option<GpsSnapshotSource>, chunk_bytes: usize) -> Self {
        let chunk_bytes = chunk_bytes.max(1);
        Self {
            framer: LineFramer::new(),
            chunk: Vec::with_capacity(chunk_bytes),
            chunk_bytes,
            frames: Vec::new(),
            queue,
            gps,
            detected: 0,
        }
    }

    // One read of up to `chunk_bytes`.
    fn read_chunk<L: ModemLink>(&mut self, link: &mut L) -> io::Result<()> {
        self.chunk.clear();
        self.chunk.resize(self.chunk_bytes, 0);
        match link.read(&mut self.chunk) {
            Ok(size) => {
                self.chunk.truncate(size);
                Ok(())
            }
            Err(err) => {
                self.chunk.clear();
                Err(err)
            }
        }
    }

    // Append whatever the device has already buffered behind the first read,
    // so a burst is not split across iterations needlessly.
    fn drain_waiting<L: ModemLink>(&mut self, link: &mut L) -> io::Result<()> {
        let waiting = link.bytes_waiting()?;
        if waiting > 0 {
            let start = self.chunk.len();
            self.chunk.resize(start + waiting, 0);
            match link.read(&mut self.chunk[start..]) {
                Ok(extra) => self.chunk.truncate(start + extra),
                Err(err) => {
                    self.chunk.truncate(start);
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    // Read once from `link` and publish an event per completed CENG frame.
    // Returns the number of events queued. Read errors are returned for the caller
    // to classify; a device lost while draining is reported after the bytes already
    // read are framed. A closed queue is fatal.
    pub fn poll_once<L: ModemLink>(
        &mut self,
        link: &mut L,
        cancel: &CancelToken,
    ) -> Result<usize, PollError> {
        self.read_chunk(link).map_err(PollError::Read)?;
        let lost = match self.drain_waiting(link) {
            Ok(()) => None,
            Err(err) => match classify_read_error(&err) {
                ReadFailure::Idle => None,
                ReadFailure::Transient => {
                    warn!(error = %err, "draining buffered modem bytes failed");
                    None
                }
                ReadFailure::DeviceGone => Some(err),
            },
        };

        let mut queued = 0;
        if !self.chunk.is_empty() {
            self.frames.clear();
            self.framer.push_bytes(&self.chunk, &mut self.frames);
            for frame in self.frames.drain(..) {
                let gps = self.gps.as_ref().map(GpsSnapshotSource::load);
                let event = RawEvent::capture(frame, gps);
                debug!(ts = event.ts, frame = %event.frame, "CENG frame detected");
                self.detected += 1;
                if self.queue.push(event, cancel).map_err(PollError::Queue)? == PushOutcome::Queued {
                    queued += 1;
                }
            }
        }

        match lost {
            Some(err) => Err(PollError::Read(err)),
            None => Ok(queued),
        }
    }

    // Read until stopped or the link fails for good.
    pub fn run<L: ModemLink>(&mut self, link: &mut L, cancel: &CancelToken) -> SessionEnd {
        let mut consecutive_errors = 0_u32;
        while !cancel.is_cancelled() {
            match self.poll_once(link, cancel) {
                Ok(_) => consecutive_errors = 0,
                Err(PollError::Queue(err)) => return SessionEnd::Failed(err),
                Err(PollError::Read(err)) => match classify_read_error(&err) {
                    ReadFailure::Idle => {}
                    ReadFailure::Transient if consecutive_errors < MAX_CONSECUTIVE_READ_ERRORS => {
                        consecutive_errors += 1;
                        warn!(error = %err, consecutive_errors, "modem read failed; retrying");
                    }
                    _ => return SessionEnd::DeviceGone(err),
                },
            }
        }
        info!(frames = self.detected, "modem reader stopped");
        SessionEnd::Stopped
    }
}

#[derive(Debug)]
pub enum PollError {
    Read(io::Error),
    Queue(PipelineError),
}

// Open the port and put the modem into engineering mode.
fn open_modem(config: &ModemConfig) -> Result<Box<dyn serialport::SerialPort>, PipelineError> {
    let mut link = open_serial(Device::Modem, &config.port, config.baud_rate, config.read_timeout)?;
    write_command(&mut link, INIT_COMMAND)
        .map_err(|err| PipelineError::device_unavailable(Device::Modem, &config.port, err))?;
    Ok(link)
}

// Open the modem port, send the engineering-mode command and start reading.
//
// Fails with `DeviceUnavailable` if the port cannot be opened. The port is owned
// by the spawned thread and closed when it exits on any path.
pub fn spawn_modem_reader(
    config: ModemConfig,
    queue: EventSender,
    gps: Option<GpsSnapshotSource>,
    token: CancelToken,
) -> Result<TaskHandle, PipelineError> {
    let link = open_modem(&config)?;
    info!(
        port = %config.port,
        baud_rate = config.baud_rate,
        gps = gps.is_some(),
        "modem port opened; engineering mode requested"
    );

    let mut reader = ModemReader::new(queue, gps, config.chunk_bytes);
    let handle = TaskHandle::spawn("modem-reader", token, move |cancel| {
        run_sessions(
            Device::Modem,
            &config.port,
            config.reconnect,
            &cancel,
            link,
            || open_modem(&config),
            |link, cancel| reader.run(link, cancel),
        )
    })?;
    Ok(handle)
}
