// Modem reader -> event queue -> worker, with an optional GPS poller feeding snapshots.
pub mod ceng;
pub mod error;
pub mod event;
pub mod framer;
pub mod gps;
pub mod link;
pub mod modem;
pub mod queue;
pub mod sink;
pub mod task;
pub mod worker;
