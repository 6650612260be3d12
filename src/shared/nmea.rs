use crate::pipeline::event::GpsProperty;

const MAX_SENTENCE_LEN: usize = 160;

pub type PropertyUpdates = Vec<(GpsProperty, String)>;

// Extract complete NMEA sentences from arbitrary serial bytes.
pub struct NmeaSentenceCollector {
    capturing: bool,
    buf: Vec<u8>,
}

impl NmeaSentenceCollector {
    pub fn new() -> Self {
        Self {
            capturing: false,
            buf: Vec::with_capacity(MAX_SENTENCE_LEN),
        }
    }

    pub fn push_bytes(&mut self, bytes: &[u8], out: &mut Vec<String>) {
        for &byte in bytes {
            if !self.capturing {
                if byte == b'$' {
                    self.capturing = true;
                    self.buf.clear();
                    self.buf.push(byte);
                }
                continue;
            }

            if byte == b'$' {
                // Restart capture on a nested '$' to recover from malformed data.
                self.buf.clear();
                self.buf.push(byte);
                continue;
            }

            if byte == b'\n' {
                if let Ok(raw) = std::str::from_utf8(&self.buf) {
                    out.push(raw.trim_end_matches('\r').to_string());
                }
                self.capturing = false;
                self.buf.clear();
                continue;
            }

            if !is_allowed_nmea_byte(byte) || self.buf.len() >= MAX_SENTENCE_LEN {
                self.capturing = false;
                self.buf.clear();
                continue;
            }

            self.buf.push(byte);
        }
    }
}

impl Default for NmeaSentenceCollector {
    fn default() -> Self {
        Self::new()
    }
}

// Decode one sentence into the position properties it carries.
//
// Returns `None` for unsupported message types and for sentences whose
// checksum does not match. Empty fields are left out, so a merge never
// replaces a known value with nothing.
pub fn decode_sentence(sentence: &str) -> Option<PropertyUpdates> {
    if !checksum_ok(sentence) {
        return None;
    }
    let fields = parse_nmea_fields(sentence)?;
    let message_id = message_id(field(&fields, 0))?;

    let mut out = PropertyUpdates::new();
    match message_id {
        "GGA" => {
            push(&mut out, GpsProperty::Timestamp, field(&fields, 1));
            push_position(&mut out, &fields, 2);
            push(&mut out, GpsProperty::GpsQual, field(&fields, 6));
            push(&mut out, GpsProperty::NumSats, field(&fields, 7));
            push(&mut out, GpsProperty::HorizontalDil, field(&fields, 8));
            push(&mut out, GpsProperty::Altitude, field(&fields, 9));
            push(&mut out, GpsProperty::AltitudeUnits, field(&fields, 10));
            push(&mut out, GpsProperty::GeoSep, field(&fields, 11));
            push(&mut out, GpsProperty::GeoSepUnits, field(&fields, 12));
            push(&mut out, GpsProperty::AgeGpsData, field(&fields, 13));
            push(&mut out, GpsProperty::RefStationId, field(&fields, 14));
        }
        "RMC" => {
            push(&mut out, GpsProperty::Timestamp, field(&fields, 1));
            push(&mut out, GpsProperty::Fix, field(&fields, 2));
            push_position(&mut out, &fields, 3);
            push(&mut out, GpsProperty::ModeIndicator, field(&fields, 12));
        }
        "GLL" => {
            push_position(&mut out, &fields, 1);
            push(&mut out, GpsProperty::Timestamp, field(&fields, 5));
            push(&mut out, GpsProperty::Fix, field(&fields, 6));
            push(&mut out, GpsProperty::ModeIndicator, field(&fields, 7));
        }
        "GNS" => {
            push(&mut out, GpsProperty::Timestamp, field(&fields, 1));
            push_position(&mut out, &fields, 2);
            push(&mut out, GpsProperty::ModeIndicator, field(&fields, 6));
            push(&mut out, GpsProperty::NumSats, field(&fields, 7));
            push(&mut out, GpsProperty::Hdop, field(&fields, 8));
            push(&mut out, GpsProperty::Altitude, field(&fields, 9));
            push(&mut out, GpsProperty::GeoSep, field(&fields, 10));
            push(&mut out, GpsProperty::AgeGpsData, field(&fields, 11));
            push(&mut out, GpsProperty::RefStationId, field(&fields, 12));
        }
        "GSA" => {
            push(&mut out, GpsProperty::Mode, field(&fields, 1));
            let fix_type = field(&fields, 2);
            push(&mut out, GpsProperty::ModeFixType, fix_type);
            let dimension = match fix_type {
                "1" => "none",
                "2" => "2D",
                "3" => "3D",
                _ => "",
            };
            push(&mut out, GpsProperty::PosFixDim, dimension);
            push(&mut out, GpsProperty::Pdop, field(&fields, 15));
            push(&mut out, GpsProperty::Hdop, field(&fields, 16));
            push(&mut out, GpsProperty::Vdop, field(&fields, 17));
        }
        "VTG" => {
            push(&mut out, GpsProperty::ModeIndicator, field(&fields, 9));
        }
        _ => return None,
    }
    Some(out)
}

// Raw ddmm.mmmm fields plus hemisphere, followed by the derived decimal degrees.
fn push_position(out: &mut PropertyUpdates, fields: &[&str], first: usize) {
    let lat = field(fields, first);
    let lat_dir = field(fields, first + 1);
    let lon = field(fields, first + 2);
    let lon_dir = field(fields, first + 3);

    push(out, GpsProperty::Lat, lat);
    push(out, GpsProperty::LatDir, lat_dir);
    push(out, GpsProperty::Lon, lon);
    push(out, GpsProperty::LonDir, lon_dir);
    if let Some(latitude) = parse_nmea_coord(lat, lat_dir, 2) {
        out.push((GpsProperty::Latitude, format_coord(latitude)));
    }
    if let Some(longitude) = parse_nmea_coord(lon, lon_dir, 3) {
        out.push((GpsProperty::Longitude, format_coord(longitude)));
    }
}

fn push(out: &mut PropertyUpdates, property: GpsProperty, value: &str) {
    if !value.is_empty() {
        out.push((property, value.to_string()));
    }
}

fn parse_nmea_fields(sentence: &str) -> Option<Vec<&str>> {
    let core = sentence
        .strip_prefix('$')?
        .split('*')
        .next()
        .unwrap_or_default();
    Some(core.split(',').collect())
}

// A missing checksum is accepted; a present one must match.
fn checksum_ok(sentence: &str) -> bool {
    let Some(body) = sentence.strip_prefix('$') else {
        return false;
    };
    let Some((payload, checksum)) = body.split_once('*') else {
        return true;
    };
    let Ok(expected) = u8::from_str_radix(checksum.trim(), 16) else {
        return false;
    };
    payload.bytes().fold(0_u8, |acc, byte| acc ^ byte) == expected
}

fn parse_nmea_coord(value: &str, hemi: &str, degree_digits: usize) -> Option<f64> {
    if value.len() <= degree_digits || !value.is_char_boundary(degree_digits) {
        return None;
    }

    let (deg_str, min_str) = value.split_at(degree_digits);
    let degrees = deg_str.parse::<f64>().ok()?;
    let minutes = min_str.parse::<f64>().ok()?;

    let mut decimal = degrees + (minutes / 60.0);
    if hemi == "S" || hemi == "W" {
        decimal = -decimal;
    }
    Some(decimal)
}

fn format_coord(value: f64) -> String {
    format!("{value:.6}")
}

// "GPGGA" / "GNRMC" -> "GGA" / "RMC".
fn message_id(head: &str) -> Option<&str> {
    if head.len() < 3 || !head.is_ascii() {
        return None;
    }
    Some(&head[head.len() - 3..])
}

fn field<'a>(fields: &'a [&'a str], idx: usize) -> &'a str {
    fields.get(idx).copied().unwrap_or("")
}

fn is_allowed_nmea_byte(byte: u8) -> bool {
    byte == b'\r' || (0x20..=0x7E).contains(&byte)
}
