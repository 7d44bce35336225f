//! Durable state for the runtime.
//!
//! Every JSON-backed store writes through [`atomic::write_json`], so a crash
//! mid-write leaves either the old or the new file, never a torn one.

pub mod approval;
pub mod atomic;
pub mod checkpoint;
pub mod executions;
pub mod tool_stream;

pub use approval::ApprovalStore;
pub use checkpoint::{Checkpoint, CheckpointStore};
pub use executions::ExecutionStore;
pub use tool_stream::{ExportFormat, ExportOptions, ToolStreamLog};
