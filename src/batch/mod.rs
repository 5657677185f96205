//! Batch reset engine.
//!
//! A batch turns a list of devices into concurrent single-device workflows
//! bounded by an admission gate, then optionally verifies every successfully
//! reset device after a settle delay. Progress is reported as an append-only
//! [`EventStream`] that ends with a summary event.

pub mod down_only;
pub mod events;
pub mod orchestrator;
pub mod run;

pub use down_only::ScreeningPolicy;
pub use events::{BatchEvent, BatchSummary, EventKind, EventSink, EventStream, FrameDecoder};
pub use orchestrator::{BatchConfig, BatchOrchestrator};
pub use run::{BatchMode, BatchPhase, BatchRun, ScreeningRecord};
