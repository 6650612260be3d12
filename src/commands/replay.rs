use crate::args::ReplayArgs;
use crate::commands::collect::open_sink;
use crate::pipeline::event::RawEvent;
use crate::pipeline::framer::LineFramer;
use crate::pipeline::sink::EventSink;
use crate::pipeline::worker::parse_event;
use anyhow::{Context, Result};
use std::fs::File;
use std::io::{self, Read};
use tracing::info;

const READ_BUFFER_BYTES: usize = 8_192;

// Public replay command entrypoint.
// Runs a captured modem byte log through the same framing and parsing as live collection.
pub fn run_replay(args: ReplayArgs) -> Result<()> {
    let file = File::open(&args.input)
        .with_context(|| format!("opening capture failed: {}", args.input.display()))?;
    let mut sink = open_sink(args.output.as_deref())?;

    let frames = replay_stream(file, &mut sink)
        .with_context(|| format!("replaying capture failed: {}", args.input.display()))?;
    sink.flush().context("flushing event output failed")?;
    info!(frames, input = %args.input.display(), "replay complete");
    Ok(())
}

// Frame, parse and emit every CENG report in `input`; returns the number emitted.
// Events are stamped with replay time since captures carry no timestamps of their own.
pub(crate) fn replay_stream<R: Read, S: EventSink>(mut input: R, sink: &mut S) -> Result<usize> {
    let mut framer = LineFramer::new();
    let mut frames = Vec::new();
    let mut buffer = vec![0_u8; READ_BUFFER_BYTES];
    let mut emitted = 0_usize;

    loop {
        let size = match input.read(&mut buffer) {
            Ok(0) => break,
            Ok(size) => size,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err).context("reading capture failed"),
        };
        framer.push_bytes(&buffer[..size], &mut frames);
        emitted += emit_frames(&mut frames, sink)?;
    }

    // A capture cut off mid-line still yields its last frame.
    if framer.pending_len() > 0 {
        framer.push_bytes(b"\n", &mut frames);
        emitted += emit_frames(&mut frames, sink)?;
    }
    Ok(emitted)
}

fn emit_frames<S: EventSink>(frames: &mut Vec<String>, sink: &mut S) -> Result<usize> {
    let count = frames.len();
    for frame in frames.drain(..) {
        let event = parse_event(RawEvent::capture(frame, None));
        sink.emit(&event).context("writing replayed event failed")?;
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::event::ParsedEvent;
    use crate::pipeline::sink::CallbackSink;
    use std::fs;

    #[test]
    fn replays_frames_including_unterminated_tail() {
        let capture: &[u8] = b"AT+CENG=2\r\nOK\r\n+CENG: 0,\"100\",\"20\",\"5\"\r\n+CENG: 1,\"1\"\r\n+CENG: 0,\"200\"";
        let mut arfcns = Vec::new();
        let mut sink = CallbackSink::new(|event: &ParsedEvent| {
            arfcns.push(event.field("arfcn").unwrap_or_default().to_string());
        });

        let emitted = replay_stream(capture, &mut sink).expect("replay");
        drop(sink);
        assert_eq!(emitted, 2);
        assert_eq!(arfcns, ["100", "200"]);
    }

    #[test]
    fn replay_to_file_writes_json_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let input = dir.path().join("capture.log");
        let output = dir.path().join("events.jsonl");
        fs::write(&input, "+CENG: 0,1,2,3,4,5,6,7,8,9,10,11\n+CENG: 0,12\n").expect("write capture");

        run_replay(ReplayArgs {
            input,
            output: Some(output.clone()),
            debug: false,
        })
        .expect("replay");

        let contents = fs::read_to_string(&output).expect("read output");
        let records: Vec<serde_json::Value> = contents
            .lines()
            .map(|line| serde_json::from_str(line).expect("json line"))
            .collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["ta"], "11");
        assert_eq!(records[1]["arfcn"], "12");
        assert!(records[1].get("rxl").is_none());
    }

    #[test]
    fn missing_capture_is_reported() {
        let err = run_replay(ReplayArgs {
            input: "/nonexistent/capture.log".into(),
            output: None,
            debug: false,
        })
        .expect_err("missing file");
        assert!(format!("{err:#}").contains("opening capture failed"));
    }
}
