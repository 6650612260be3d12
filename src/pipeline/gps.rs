use crate::pipeline::error::{Device, PipelineError, ReadFailure, classify_read_error};
use crate::pipeline::event::{GpsProperty, GpsSnapshot};
use crate::pipeline::link::{ReconnectPolicy, SessionEnd, open_serial, run_sessions};
use crate::pipeline::task::TaskHandle;
use crate::shared::nmea::{NmeaSentenceCollector, decode_sentence};
use crate::shared::signal::CancelToken;
use arc_swap::ArcSwap;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const READ_BUFFER_BYTES: usize = 512;
const MAX_CONSECUTIVE_READ_ERRORS: u32 = 20;

// Shared "latest fix" published by the poller and read by the modem reader.
// Each update swaps in a new immutable snapshot, so a reader never sees half of one.
#[derive(Clone, Default)]
pub struct GpsSnapshotSource {
    current: Arc<ArcSwap<GpsSnapshot>>,
}

impl GpsSnapshotSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&self) -> Arc<GpsSnapshot> {
        self.current.load_full()
    }

    pub fn update(&self, updates: &[(GpsProperty, String)]) {
        self.current.rcu(|current| current.merged(updates));
    }
}

#[derive(Debug, Clone)]
pub struct GpsConfig {
    pub port: String,
    pub baud_rate: u32,
    pub read_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

// Decodes NMEA sentences from a byte stream into a GpsSnapshotSource.
pub struct GpsPoller {
    collector: NmeaSentenceCollector,
    source: GpsSnapshotSource,
    buf: Vec<u8>,
    sentences: Vec<String>,
    decoded: u64,
}

impl GpsPoller {
    pub fn new(source: GpsSnapshotSource) -> Self {
        Self {
            collector: NmeaSentenceCollector::new(),
            source,
            buf: vec![0_u8; READ_BUFFER_BYTES],
            sentences: Vec::new(),
            decoded: 0,
        }
    }

    // Feed raw bytes; returns how many sentences updated the snapshot.
    pub fn ingest(&mut self, bytes: &[u8]) -> usize {
        self.sentences.clear();
        self.collector.push_bytes(bytes, &mut self.sentences);

        let mut applied = 0;
        for sentence in &self.sentences {
            let Some(updates) = decode_sentence(sentence) else {
                continue;
            };
            for (property, value) in &updates {
                debug!(property = property.as_str(), value = %value, "gps property");
            }
            self.source.update(&updates);
            applied += 1;
        }
        self.decoded += applied as u64;
        applied
    }

    // Poll one open stream until stopped, the stream ends, or the device fails.
    pub fn run<R: Read>(&mut self, link: &mut R, cancel: &CancelToken) -> SessionEnd {
        let mut consecutive_errors = 0_u32;
        let mut buf = std::mem::take(&mut self.buf);
        let end = loop {
            if cancel.is_cancelled() {
                break SessionEnd::Stopped;
            }
            match link.read(&mut buf) {
                Ok(0) => {
                    info!(sentences = self.decoded, "GPS stream ended");
                    break SessionEnd::StreamEnded;
                }
                Ok(size) => {
                    consecutive_errors = 0;
                    self.ingest(&buf[..size]);
                }
                Err(err) => match classify_read_error(&err) {
                    ReadFailure::Idle => {}
                    ReadFailure::Transient if consecutive_errors < MAX_CONSECUTIVE_READ_ERRORS => {
                        consecutive_errors += 1;
                        warn!(error = %err, consecutive_errors, "GPS read failed; retrying");
                    }
                    _ => break SessionEnd::DeviceGone(err),
                },
            }
        };
        self.buf = buf;
        end
    }
}

// Open the GPS port and start polling it on a background thread.
//
// Fails with `DeviceUnavailable` when the port cannot be opened. The returned
// source starts with every property unset and is updated for the life of the task.
pub fn spawn_gps_poller(
    config: GpsConfig,
    token: CancelToken,
) -> Result<(TaskHandle, GpsSnapshotSource), PipelineError> {
    let link = open_serial(Device::Gps, &config.port, config.baud_rate, config.read_timeout)?;
    info!(port = %config.port, baud_rate = config.baud_rate, "GPS port opened");

    let source = GpsSnapshotSource::new();
    let mut poller = GpsPoller::new(source.clone());
    let handle = TaskHandle::spawn("gps-poller", token, move |cancel| {
        let reopen = || open_serial(Device::Gps, &config.port, config.baud_rate, config.read_timeout);
        run_sessions(
            Device::Gps,
            &config.port,
            config.reconnect,
            &cancel,
            link,
            reopen,
            |link, cancel| poller.run(link, cancel),
        )
    })?;
    Ok((handle, source))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::link::testing::{ScriptedLink, Step};

    const GGA: &[u8] = b"$GPGGA,000001,3700.000,N,12200.000,W,1,05,1.2,12.0,M,-30.0,M,,*4F\r\n";
    const GSA: &[u8] = b"$GPGSA,A,3,04,05,,09,12,,,24,,,,,2.5,1.3,2.1*39\r\n";

    #[test]
    fn snapshot_keeps_values_missing_from_later_sentences() {
        let source = GpsSnapshotSource::new();
        let mut poller = GpsPoller::new(source.clone());
        assert!(source.load().is_empty());

        assert_eq!(poller.ingest(GGA), 1);
        let before = source.load();
        assert_eq!(poller.ingest(GSA), 1);
        let after = source.load();

        assert_eq!(after.get(GpsProperty::Latitude), Some("37.000000"));
        assert_eq!(after.get(GpsProperty::Longitude), Some("-122.000000"));
        assert_eq!(after.get(GpsProperty::Altitude), Some("12.0"));
        assert_eq!(after.get(GpsProperty::Pdop), Some("2.5"));
        // Earlier snapshots are never mutated in place.
        assert_eq!(before.get(GpsProperty::Pdop), None);
    }

    #[test]
    fn poll_loop_ends_quietly_at_end_of_stream() {
        let source = GpsSnapshotSource::new();
        let mut poller = GpsPoller::new(source.clone());
        let mut link = ScriptedLink::new(vec![
            Step::Data(GGA[..20].to_vec()),
            Step::Fail(std::io::ErrorKind::TimedOut),
            Step::Data(GGA[20..].to_vec()),
            Step::Eof,
        ]);

        let end = poller.run(&mut link, &CancelToken::new());
        assert!(matches!(end, SessionEnd::StreamEnded));
        assert_eq!(poller.decoded, 1);
        assert_eq!(source.load().get(GpsProperty::NumSats), Some("05"));
    }

    #[test]
    fn poll_loop_reports_lost_device() {
        let mut poller = GpsPoller::new(GpsSnapshotSource::new());
        let mut link = ScriptedLink::new(vec![
            Step::Fail(std::io::ErrorKind::Other),
            Step::Fail(std::io::ErrorKind::BrokenPipe),
        ]);
        let end = poller.run(&mut link, &CancelToken::new());
        assert!(matches!(end, SessionEnd::DeviceGone(_)));
    }

    #[test]
    fn poll_loop_stops_when_cancelled() {
        let mut poller = GpsPoller::new(GpsSnapshotSource::new());
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut link = ScriptedLink::data(&[GGA]);
        assert!(matches!(poller.run(&mut link, &cancel), SessionEnd::Stopped));
        assert_eq!(poller.decoded, 0);
    }
}
