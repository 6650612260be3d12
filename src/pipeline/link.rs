use crate::pipeline::error::{Device, PipelineError};
use crate::shared::signal::CancelToken;
use serialport::SerialPort;
use std::io::{self, Read, Write};
use std::time::Duration;
use tracing::{info, warn};

// Byte transport to the modem. Implemented for real serial ports and for
// scripted links in tests.
pub trait ModemLink: Read + Write + Send {
    // Bytes the device has already buffered and a read would return immediately.
    fn bytes_waiting(&mut self) -> io::Result<usize>;
}

impl ModemLink for Box<dyn SerialPort> {
    fn bytes_waiting(&mut self) -> io::Result<usize> {
        let waiting = self.bytes_to_read().map_err(io::Error::from)?;
        Ok(waiting as usize)
    }
}

pub fn open_serial(
    device: Device,
    port: &str,
    baud_rate: u32,
    timeout: Duration,
) -> Result<Box<dyn SerialPort>, PipelineError> {
    serialport::new(port, baud_rate)
        .timeout(timeout)
        .open()
        .map_err(|err| PipelineError::device_unavailable(device, port, err))
}

// Reopen policy after the device disappears mid-run. Zero attempts means fail immediately.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

// Why a read loop over one open link returned.
#[derive(Debug)]
pub enum SessionEnd {
    Stopped,
    StreamEnded,
    DeviceGone(io::Error),
    Failed(PipelineError),
}

// Drive `session` over `link`, reopening it with `open` when the device goes away.
//
// The first link is opened by the caller so that an unopenable port fails at
// start-up instead of inside the thread. Reopen attempts are bounded by
// `policy` and the delay between them is cut short by cancellation; once the
// budget is spent the original read error comes back as `DeviceUnavailable`.
pub fn run_sessions<L, O, S>(
    device: Device,
    port: &str,
    policy: ReconnectPolicy,
    cancel: &CancelToken,
    mut link: L,
    mut open: O,
    mut session: S,
) -> Result<(), PipelineError>
where
    O: FnMut() -> Result<L, PipelineError>,
    S: FnMut(&mut L, &CancelToken) -> SessionEnd,
{
    loop {
        let err = match session(&mut link, cancel) {
            SessionEnd::Stopped | SessionEnd::StreamEnded => return Ok(()),
            SessionEnd::Failed(err) => return Err(err),
            SessionEnd::DeviceGone(err) => err,
        };
        // Release the dead handle before trying to reopen the same path.
        drop(link);
        warn!(%device, port, error = %err, "device lost");

        let mut attempt = 0;
        link = loop {
            if attempt >= policy.attempts {
                return Err(PipelineError::device_unavailable(device, port, &err));
            }
            attempt += 1;
            if cancel.wait_timeout(policy.delay) {
                return Ok(());
            }
            match open() {
                Ok(link) => {
                    info!(%device, port, attempt, "device reopened");
                    break link;
                }
                Err(reopen_err) => {
                    warn!(%device, port, attempt, error = %reopen_err, "reopen failed");
                }
            }
        };
    }
}

#[cfg(test)]
pub mod testing {
    use super::ModemLink;
    use std::collections::VecDeque;
    use std::io::{self, Read, Write};
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::Duration;

    pub enum Step {
        Data(Vec<u8>),
        Fail(io::ErrorKind),
        Eof,
    }

    // In-memory serial link replaying a fixed script of reads.
    // Once the script runs out every read times out, like an idle port.
    pub struct ScriptedLink {
        steps: VecDeque<Step>,
        pending: Vec<u8>,
        waiting_failure: Option<io::ErrorKind>,
        pub written: Arc<Mutex<Vec<u8>>>,
    }

    impl ScriptedLink {
        pub fn new(steps: Vec<Step>) -> Self {
            Self {
                steps: steps.into(),
                pending: Vec::new(),
                waiting_failure: None,
                written: Arc::new(Mutex::new(Vec::new())),
            }
        }

        pub fn data(chunks: &[&[u8]]) -> Self {
            Self::new(chunks.iter().map(|chunk| Step::Data(chunk.to_vec())).collect())
        }

        // Make the next buffered-bytes query fail with `kind`.
        pub fn fail_bytes_waiting(mut self, kind: io::ErrorKind) -> Self {
            self.waiting_failure = Some(kind);
            self
        }
    }

    impl Read for ScriptedLink {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.pending.is_empty() {
                match self.steps.pop_front() {
                    Some(Step::Data(bytes)) => self.pending = bytes,
                    Some(Step::Fail(kind)) => return Err(io::Error::new(kind, "scripted failure")),
                    Some(Step::Eof) => return Ok(0),
                    None => {
                        thread::sleep(Duration::from_millis(1));
                        return Err(io::Error::new(io::ErrorKind::TimedOut, "idle"));
                    }
                }
            }
            let size = buf.len().min(self.pending.len());
            buf[..size].copy_from_slice(&self.pending[..size]);
            self.pending.drain(..size);
            Ok(size)
        }
    }

    impl Write for ScriptedLink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written
                .lock()
                .map_err(|_| io::Error::other("poisoned"))?
                .extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl ModemLink for ScriptedLink {
        fn bytes_waiting(&mut self) -> io::Result<usize> {
            if let Some(kind) = self.waiting_failure.take() {
                return Err(io::Error::new(kind, "scripted failure"));
            }
            Ok(self.pending.len())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            attempts,
            delay: Duration::from_millis(1),
        }
    }

    #[test]
    fn device_gone_reopens_within_budget() {
        let cancel = CancelToken::new();
        let mut opens = 0;
        let mut sessions = 0;
        let result = run_sessions(
            Device::Modem,
            "/dev/null",
            policy(3),
            &cancel,
            0_u32,
            || {
                opens += 1;
                if opens < 2 {
                    Err(PipelineError::device_unavailable(Device::Modem, "/dev/null", "busy"))
                } else {
                    Ok(opens)
                }
            },
            |_link, _| {
                sessions += 1;
                if sessions == 1 {
                    SessionEnd::DeviceGone(io::Error::new(io::ErrorKind::BrokenPipe, "unplugged"))
                } else {
                    SessionEnd::Stopped
                }
            },
        );

        assert!(result.is_ok());
        assert_eq!(opens, 2);
        assert_eq!(sessions, 2);
    }

    #[test]
    fn exhausted_budget_surfaces_device_unavailable() {
        let cancel = CancelToken::new();
        let result = run_sessions(
            Device::Gps,
            "/dev/ttyUSB1",
            policy(0),
            &cancel,
            (),
            || Ok(()),
            |_, _| SessionEnd::DeviceGone(io::Error::new(io::ErrorKind::NotFound, "gone")),
        );

        match result {
            Err(PipelineError::DeviceUnavailable { device, port, .. }) => {
                assert_eq!(device, Device::Gps);
                assert_eq!(port, "/dev/ttyUSB1");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn stream_end_is_not_an_error() {
        let cancel = CancelToken::new();
        let result = run_sessions(
            Device::Gps,
            "gps",
            policy(1),
            &cancel,
            (),
            || Ok(()),
            |_, _| SessionEnd::StreamEnded,
        );
        assert!(result.is_ok());
    }
}
