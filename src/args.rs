use crate::pipeline::modem::DEFAULT_CHUNK_BYTES;
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

// CLI root definition. This is the single entrypoint for all supported modes.
#[derive(Parser, Debug)]
#[command(name = "ceng-logger", version)]
#[command(about = "Cellular engineering-mode collector with optional GPS tagging")]
pub struct Cli {
    #[command(subcommand)]
    pub command: AppCommand,
}

// Subcommands map directly to one module each under src/commands/.
#[derive(Subcommand, Debug)]
pub enum AppCommand {
    /// Read CENG reports from a modem, tag them with GPS, and emit JSON records
    Collect(CollectArgs),
    /// Parse a captured modem byte log offline
    Replay(ReplayArgs),
}

impl AppCommand {
    pub fn debug(&self) -> bool {
        match self {
            AppCommand::Collect(args) => args.debug,
            AppCommand::Replay(args) => args.debug,
        }
    }
}

// What the modem reader does when the event queue is full.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Wait for the worker to make room
    Block,
    /// Evict the oldest queued event
    DropOldest,
    /// Discard the incoming event
    DropNewest,
}

// Live collection configuration.
#[derive(Args, Debug, Clone)]
pub struct CollectArgs {
    #[arg(short = 'm', long, env = "CENG_MODEM_PORT")]
    pub modem_port: String,
    #[arg(short = 's', long, env = "CENG_MODEM_BAUD", default_value_t = 9_600)]
    pub modem_baud: u32,
    #[arg(short = 'G', long, env = "CENG_GPS_PORT")]
    pub gps_port: Option<String>,
    #[arg(short = 'S', long, env = "CENG_GPS_BAUD", default_value_t = 9_600)]
    pub gps_baud: u32,
    /// Enable debug logging
    #[arg(short = 'd', long, default_value_t = false)]
    pub debug: bool,
    #[arg(long, default_value_t = 5)]
    pub gps_warm_up_secs: u64,
    #[arg(long, default_value_t = DEFAULT_CHUNK_BYTES)]
    pub read_chunk_bytes: usize,
    #[arg(long, default_value_t = 10)]
    pub modem_timeout_ms: u64,
    #[arg(long, default_value_t = 1_000)]
    pub gps_timeout_ms: u64,
    /// Queue capacity; 0 means unbounded
    #[arg(long, default_value_t = 4_096)]
    pub queue_capacity: usize,
    #[arg(long, value_enum, default_value_t = OverflowPolicy::DropOldest)]
    pub overflow: OverflowPolicy,
    /// Append JSON lines here instead of writing to stdout
    #[arg(long)]
    pub output: Option<PathBuf>,
    #[arg(long, default_value_t = 3)]
    pub reconnect_attempts: u32,
    #[arg(long, default_value_t = 2_000)]
    pub reconnect_delay_ms: u64,
    #[arg(long, default_value_t = 2_000)]
    pub drain_timeout_ms: u64,
    #[arg(long, default_value = "ceng_collect.lock")]
    pub lock_file: PathBuf,
}

impl CollectArgs {
    pub fn queue_capacity(&self) -> Option<usize> {
        (self.queue_capacity > 0).then_some(self.queue_capacity)
    }
}

// Offline replay configuration.
#[derive(Args, Debug, Clone)]
pub struct ReplayArgs {
    #[arg(long)]
    pub input: PathBuf,
    #[arg(long)]
    pub output: Option<PathBuf>,
    #[arg(short = 'd', long, default_value_t = false)]
    pub debug: bool,
}
