// Engineering-mode (AT+CENG) report parsing.

pub const CENG_MARKER: &str = "+CENG: 0,";

// Serving-cell metrics in the order the modem reports them.
// arfcn: absolute radio frequency channel number, rxl/rxq: receive level/quality,
// mcc/mnc: mobile country/network code, bsic: base station identity code,
// rla: receive level access minimum, txp: max CCCH transmit power, ta: timing advance.
pub const CENG_FIELDS: [&str; 11] = [
    "arfcn", "rxl", "rxq", "mcc", "mnc", "bsic", "cell_id", "lac", "rla", "txp", "ta",
];

pub type CengFields = Vec<(&'static str, String)>;

// Parse one engineering-mode line into named metrics. Anything before the marker
// and the line ending are ignored. Values pair positionally with CENG_FIELDS and
// pairing stops at whichever side runs out first. Never fails.
pub fn parse_ceng(frame: &str) -> CengFields {
    let body = frame
        .find(CENG_MARKER)
        .map_or(frame, |start| &frame[start + CENG_MARKER.len()..]);
    let cleaned = body.replace('"', "");
    CENG_FIELDS
        .iter()
        .copied()
        .zip(cleaned.trim_end().split(','))
        .map(|(name, value)| (name, value.to_string()))
        .collect()
}
