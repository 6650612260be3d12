use std::fmt;
use std::io;
use thiserror::Error;

// Which serial device a failure belongs to, so the supervisor can name it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Modem,
    Gps,
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Modem => f.write_str("modem"),
            Device::Gps => f.write_str("GPS"),
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{device} unavailable at {port}: {reason}")]
    DeviceUnavailable {
        device: Device,
        port: String,
        reason: String,
    },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("serializing event record failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("event queue closed")]
    QueueClosed,
    #[error("{0} task panicked")]
    Panicked(String),
}

impl PipelineError {
    pub fn device_unavailable(device: Device, port: &str, reason: impl fmt::Display) -> Self {
        Self::DeviceUnavailable {
            device,
            port: port.to_string(),
            reason: reason.to_string(),
        }
    }
}

// How a failed serial read should be treated by a read loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadFailure {
    // No data before the port timeout expired.
    Idle,
    // Hiccup worth logging; the next iteration retries.
    Transient,
    // The device went away; the loop must stop or reconnect.
    DeviceGone,
}

pub fn classify_read_error(err: &io::Error) -> ReadFailure {
    match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => ReadFailure::Idle,
        io::ErrorKind::NotFound
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::NotConnected
        | io::ErrorKind::PermissionDenied
        | io::ErrorKind::UnexpectedEof => ReadFailure::DeviceGone,
        _ => ReadFailure::Transient,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_are_idle_and_disconnects_are_fatal() {
        let timeout = io::Error::new(io::ErrorKind::TimedOut, "timeout");
        let gone = io::Error::new(io::ErrorKind::BrokenPipe, "gone");
        let other = io::Error::other("framing error");

        assert_eq!(classify_read_error(&timeout), ReadFailure::Idle);
        assert_eq!(classify_read_error(&gone), ReadFailure::DeviceGone);
        assert_eq!(classify_read_error(&other), ReadFailure::Transient);
    }

    #[test]
    fn device_errors_name_the_device() {
        let err = PipelineError::device_unavailable(Device::Gps, "/dev/ttyUSB1", "no such file");
        assert_eq!(
            err.to_string(),
            "GPS unavailable at /dev/ttyUSB1: no such file"
        );
    }
}
