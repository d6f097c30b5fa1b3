//! Built-in tracing backends.
//!
//! - [`LogBackend`] mirrors spans into the `tracing` ecosystem so they show up
//!   in the process log.
//! - [`SegmentRecorder`] keeps finished spans in memory for inspection.
//! - [`ErrorReporter`] forwards span failures to an error-reporting sink.

mod log;
mod recorder;
mod reporter;

pub use log::LogBackend;
pub use recorder::{RecordedSpan, SegmentRecorder};
pub use reporter::{ErrorReport, ErrorReporter};
