//! syncgrid-metrics — observability for a SyncGrid deployment.
//!
//! Reads the state store into a [`StatusReport`] and renders it.
//!
//! ```text
//! StatusReport::collect(store, now)
//!   ├── render_text()        → operator summary for `syncd status`
//!   ├── serde_json           → `syncd status --json`
//!   └── render_prometheus()  → `syncd status --prometheus`
//! ```

pub mod prometheus;
pub mod status;
pub mod text;

pub use prometheus::render_prometheus;
pub use status::{
    BreakerStatus, BucketView, CursorLag, LockView, RunSummary, StatusReport,
};
pub use text::render_text;
