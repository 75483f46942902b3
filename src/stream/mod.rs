//! Streaming of instance graphs: resolution tables, the streamer itself, and
//! its options, metrics and diagnostics.

pub mod inspect;
pub mod metrics;
pub mod options;
pub mod resolve;
mod streamer;

pub use inspect::{summarize, StreamSummary};
pub use metrics::{CounterMetrics, MetricsSnapshot, NoopMetrics, StreamMetrics};
pub use options::StreamerOptions;
pub use resolve::{ResolutionEntry, ResolutionTables};
pub use streamer::Streamer;
