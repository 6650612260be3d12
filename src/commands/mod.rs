// Command implementations split by subcommand for clarity.
pub mod collect;
pub mod replay;

pub use collect::run_collect;
pub use replay::run_replay;
