//! # boardwatch
//!
//! Host-side supervisor for a companion control board attached over a
//! half-duplex serial link.
//!
//! The daemon keeps the board alive with heartbeats, sets its clock, drains
//! its log into a local archive every day, and reboots the board and shuts
//! the host down when the internet stays unreachable for too long.
//!
//! ## Quick Start
//!
//! ```no_run
//! use boardwatch::{Config, FileLogArchive, FileRotator, SerialTransport, Supervisor};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), boardwatch::Error> {
//!     let config = Config::load()?;
//!     let transport = SerialTransport::new(config.serial_config());
//!     let archive = FileLogArchive::new(&config.jobs.archive_path);
//!
//!     let mut supervisor = Supervisor::new(transport, config.supervisor_config()?, archive)
//!         .with_rotation(FileRotator::new(&config.jobs.archive_path, 7));
//!     supervisor.run().await
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`protocol`] - Wire framing (DLE/STX byte stuffing, checksum) and command codes
//! - [`transport`] - Serial link with deadline-bounded receive
//! - [`commands`] - One request/response exchange per board command
//! - [`supervisor`] - Liveness state machine, heartbeat and network monitor
//! - [`scheduler`] - Periodic deadlines and daily jobs
//! - [`archive`] - Log archive, rotation and hand-off
//! - [`event`] - Broadcast of what the supervisor does
//! - [`config`] - TOML and environment configuration

pub mod archive;
pub mod commands;
pub mod config;
pub mod error;
pub mod event;
pub mod protocol;
pub mod scheduler;
pub mod supervisor;
pub mod transport;

// Re-exports for convenience
pub use archive::{
    ArchiveHandoff, CommandHandoff, FileLogArchive, FileRotator, LogArchive, LogRotation,
};
pub use commands::{CommandHandler, LogTransfer};
pub use config::Config;
pub use error::{Error, FrameError, Result};
pub use event::{Event, EventDispatcher, EventFilter, EventKind, Subscription};
pub use protocol::{CommandCode, Frame, FrameDecoder, Message, ResponseCode};
pub use scheduler::{Interval, LocalClock, ScheduledTask, TaskScheduler, WallClock};
pub use supervisor::{
    ConnectionState, DeviceVariant, Flow, HeartbeatFailurePolicy, HostControl, Supervisor,
    SupervisorConfig, SystemHost,
};
pub use transport::{SerialTransport, Transport, serial::list_ports};
