use crate::pipeline::ceng::CENG_MARKER;

pub const MAX_LINE_LEN: usize = 4_096;

// Reassemble engineering-mode frames from arbitrary serial chunks.
// Partial lines are carried over to the next push, so a frame split across
// two reads is still emitted once its newline arrives.
pub struct LineFramer {
    buf: Vec<u8>,
    discarding: bool,
}

impl LineFramer {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(256),
            discarding: false,
        }
    }

    // Push raw bytes; each completed line carrying the CENG marker is appended to `out`
    // as received, minus its `\n`. Text around the marker and a trailing `\r` are kept.
    pub fn push_bytes(&mut self, bytes: &[u8], out: &mut Vec<String>) {
        for &byte in bytes {
            if byte == b'\n' {
                if !self.discarding {
                    if let Some(frame) = extract_frame(&self.buf) {
                        out.push(frame);
                    }
                }
                self.buf.clear();
                self.discarding = false;
                continue;
            }

            if self.discarding {
                continue;
            }

            if self.buf.len() >= MAX_LINE_LEN {
                // Runaway line without a newline; drop it and resync on the next one.
                self.buf.clear();
                self.discarding = true;
                continue;
            }

            self.buf.push(byte);
        }
    }

    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new()
    }
}

fn extract_frame(line: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(line);
    text.contains(CENG_MARKER).then(|| text.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(framer: &mut LineFramer, bytes: &[u8]) -> Vec<String> {
        let mut out = Vec::new();
        framer.push_bytes(bytes, &mut out);
        out
    }

    #[test]
    fn emits_marker_lines_only() {
        let mut framer = LineFramer::new();
        let out = frames(
            &mut framer,
            b"AT+CENG=2\r\nOK\r\n+CENG: 0,1,2,3\r\n+CENG: 1,9,9\r\n+CENG: 0,4,5,6\n",
        );
        assert_eq!(out, ["+CENG: 0,1,2,3\r", "+CENG: 0,4,5,6"]);
        assert_eq!(framer.pending_len(), 0);
    }

    #[test]
    fn frame_split_across_reads_is_reassembled() {
        let mut framer = LineFramer::new();
        assert!(frames(&mut framer, b"+CENG: 0,\"10").is_empty());
        assert!(frames(&mut framer, b"0\",\"20\"").is_empty());
        assert_eq!(frames(&mut framer, b"\r\n"), ["+CENG: 0,\"100\",\"20\"\r"]);
    }

    #[test]
    fn frame_keeps_the_line_as_received() {
        let mut framer = LineFramer::new();
        let out = frames(&mut framer, b"...garbage...+CENG: 0,\"100\"\r\n");
        assert_eq!(out, ["...garbage...+CENG: 0,\"100\"\r"]);
    }

    #[test]
    fn runaway_line_is_dropped_and_framer_resyncs() {
        let mut framer = LineFramer::new();
        let noise = vec![b'x'; MAX_LINE_LEN + 10];
        assert!(frames(&mut framer, &noise).is_empty());
        assert!(frames(&mut framer, b"+CENG: 0,lost\n").is_empty());
        assert_eq!(frames(&mut framer, b"+CENG: 0,kept\n"), ["+CENG: 0,kept"]);
    }
}
