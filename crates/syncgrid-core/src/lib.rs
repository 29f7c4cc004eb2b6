//! Shared building blocks for SyncGrid.
//!
//! Domain enums, the `syncgrid.toml` config, the watermark window and
//! adaptive window algorithms, the error taxonomy used to classify failed
//! runs, and a clock abstraction for deterministic tests.

pub mod adaptive;
pub mod classify;
pub mod clock;
pub mod config;
pub mod types;
pub mod window;

pub use adaptive::{AdaptiveWindowState, WindowAdjustment};
pub use classify::{
    BackoffPolicy, ClassificationPolicy, Disposition, ErrorCategory, ErrorClass,
    redact_credentials,
};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock, system_clock};
pub use config::{ConfigError, SyncGridConfig};
pub use types::*;
pub use window::{
    FetchWindow, RawRecord, WalkStep, Watermark, WatermarkRecord, WindowWalker,
    compute_cursor_target, compute_fetch_window, parse_timestamp, select_batch,
};
