#![warn(missing_docs)]

//! Netboot iSCSI subsystem: image/target lifecycle, device linkage, session telemetry, stall detection
//!
//! Sparse disk images are exposed as iSCSI targets through `tgtd`, linked
//! one-to-one with device MAC addresses, and monitored for transfer progress
//! during unattended installs. Byte counts are attributed to devices on a
//! best-effort basis and every estimate carries its source and confidence.

pub mod config;
pub mod error;
pub mod fakes;
pub mod lifecycle;
pub mod linkage;
pub mod locks;
pub mod model;
pub mod parse;
pub mod registrar;
pub mod runner;
pub mod service;
pub mod stall;
pub mod store;
pub mod telemetry;

pub use config::IscsiConfig;
pub use error::{DaemonStep, ErrorKind, IscsiError, IscsiResult};
pub use fakes::{FakeOp, FakeTargetDaemon};
pub use lifecycle::ImageLifecycle;
pub use linkage::{DeviceLinkage, LinkOutcome};
pub use locks::{NameGuard, NameLocks};
pub use model::{
    normalize_mac, BootLogEntry, Device, DeviceType, DeviceUpdate, Image, ImageStatus, TransferState,
};
pub use parse::{ByteCounters, SessionInfo, SocketStat, TargetStatus};
pub use registrar::{LunDeviceType, RegisteredTarget, RestoreOutcome, TargetRegistrar};
pub use runner::{CommandOutput, CommandRunner, ProcessError, SystemRunner};
pub use service::{CheckIn, ImageMetrics, IscsiService, OperationResult};
pub use stall::{transition, Observation, StallConfig, StallEvent, StallOutcome, StallState, StallTracker};
pub use store::{JsonFileStore, MemoryStore, RecordStore, BOOT_LOG_CAPACITY};
pub use telemetry::{attribute, Confidence, ConnectionEstimate, ConnectionTelemetry, CounterSource, Estimate};
