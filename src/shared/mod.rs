pub mod lock;
pub mod nmea;
pub mod signal;
