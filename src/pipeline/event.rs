use crate::pipeline::ceng::CengFields;
use chrono::Utc;
use serde::ser::{Serialize, SerializeMap, Serializer};
use std::sync::Arc;

// Position-report properties tracked from the GPS stream, in output order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpsProperty {
    Timestamp,
    Lat,
    Latitude,
    LatDir,
    Lon,
    Longitude,
    LonDir,
    GpsQual,
    ModeIndicator,
    NumSats,
    Hdop,
    Altitude,
    HorizontalDil,
    AltitudeUnits,
    GeoSep,
    GeoSepUnits,
    AgeGpsData,
    RefStationId,
    PosFixDim,
    ModeFixType,
    Mode,
    Pdop,
    Vdop,
    Fix,
}

impl GpsProperty {
    pub const COUNT: usize = 24;

    pub const ALL: [GpsProperty; Self::COUNT] = [
        GpsProperty::Timestamp,
        GpsProperty::Lat,
        GpsProperty::Latitude,
        GpsProperty::LatDir,
        GpsProperty::Lon,
        GpsProperty::Longitude,
        GpsProperty::LonDir,
        GpsProperty::GpsQual,
        GpsProperty::ModeIndicator,
        GpsProperty::NumSats,
        GpsProperty::Hdop,
        GpsProperty::Altitude,
        GpsProperty::HorizontalDil,
        GpsProperty::AltitudeUnits,
        GpsProperty::GeoSep,
        GpsProperty::GeoSepUnits,
        GpsProperty::AgeGpsData,
        GpsProperty::RefStationId,
        GpsProperty::PosFixDim,
        GpsProperty::ModeFixType,
        GpsProperty::Mode,
        GpsProperty::Pdop,
        GpsProperty::Vdop,
        GpsProperty::Fix,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            GpsProperty::Timestamp => "timestamp",
            GpsProperty::Lat => "lat",
            GpsProperty::Latitude => "latitude",
            GpsProperty::LatDir => "lat_dir",
            GpsProperty::Lon => "lon",
            GpsProperty::Longitude => "longitude",
            GpsProperty::LonDir => "lon_dir",
            GpsProperty::GpsQual => "gps_qual",
            GpsProperty::ModeIndicator => "mode_indicator",
            GpsProperty::NumSats => "num_sats",
            GpsProperty::Hdop => "hdop",
            GpsProperty::Altitude => "altitude",
            GpsProperty::HorizontalDil => "horizontal_dil",
            GpsProperty::AltitudeUnits => "altitude_units",
            GpsProperty::GeoSep => "geo_sep",
            GpsProperty::GeoSepUnits => "geo_sep_units",
            GpsProperty::AgeGpsData => "age_gps_data",
            GpsProperty::RefStationId => "ref_station_id",
            GpsProperty::PosFixDim => "pos_fix_dim",
            GpsProperty::ModeFixType => "mode_fix_type",
            GpsProperty::Mode => "mode",
            GpsProperty::Pdop => "pdop",
            GpsProperty::Vdop => "vdop",
            GpsProperty::Fix => "fix",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

// Latest known value of every `GpsProperty`; `None` until first observed.
//
// Snapshots are immutable once published. The poller builds the next one with
// `GpsSnapshot::merged` and swaps it in, so readers always see a whole update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GpsSnapshot {
    values: [Option<String>; GpsProperty::COUNT],
}

impl GpsSnapshot {
    pub fn get(&self, property: GpsProperty) -> Option<&str> {
        self.values[property.index()].as_deref()
    }

    pub fn set(&mut self, property: GpsProperty, value: impl Into<String>) {
        self.values[property.index()] = Some(value.into());
    }

    // Last-known-good merge: properties missing from `updates` keep their value.
    pub fn merged(&self, updates: &[(GpsProperty, String)]) -> Self {
        let mut next = self.clone();
        for (property, value) in updates {
            next.set(*property, value.clone());
        }
        next
    }

    pub fn iter(&self) -> impl Iterator<Item = (GpsProperty, Option<&str>)> + '_ {
        GpsProperty::ALL
            .iter()
            .map(move |property| (*property, self.get(*property)))
    }

    pub fn is_empty(&self) -> bool {
        self.values.iter().all(Option::is_none)
    }
}

// One detected modem frame, not yet parsed.
#[derive(Debug, Clone)]
pub struct RawEvent {
    pub ts: f64,
    pub frame: String,
    pub gps: Option<Arc<GpsSnapshot>>,
}

impl RawEvent {
    pub fn capture(frame: String, gps: Option<Arc<GpsSnapshot>>) -> Self {
        Self {
            ts: epoch_seconds(),
            frame,
            gps,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ParsedEvent {
    pub raw: RawEvent,
    pub fields: CengFields,
}

impl ParsedEvent {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn gps(&self, property: GpsProperty) -> Option<&str> {
        self.raw.gps.as_deref().and_then(|snapshot| snapshot.get(property))
    }
}

// Flat record: capture time, raw frame, GPS properties (when GPS is configured), CENG metrics.
impl Serialize for ParsedEvent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let gps_len = self.raw.gps.as_ref().map_or(0, |_| GpsProperty::COUNT);
        let mut map = serializer.serialize_map(Some(2 + gps_len + self.fields.len()))?;
        map.serialize_entry("ts", &self.raw.ts)?;
        map.serialize_entry("ceng0", &self.raw.frame)?;
        if let Some(snapshot) = &self.raw.gps {
            for (property, value) in snapshot.iter() {
                map.serialize_entry(property.as_str(), &value)?;
            }
        }
        for (name, value) in &self.fields {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

fn epoch_seconds() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}
