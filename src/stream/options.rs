use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::metrics::StreamMetrics;

/// Limits and tuning applied by a [`super::Streamer`].
#[derive(Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StreamerOptions {
    /// Free bytes reserved in every deserialized instance chunk for cheap
    /// in-place edits such as host or namespace rewrites.
    pub instance_headroom: usize,
    /// Largest class or instance chunk accepted from a stream, in bytes.
    pub max_chunk_len: u64,
    /// Largest class, instance or reference count accepted from a stream.
    pub max_object_count: u32,
    /// Optional metrics collection implementation.
    #[serde(skip)]
    pub metrics: Option<Arc<dyn StreamMetrics>>,
}

impl StreamerOptions {
    /// Default instance headroom in bytes.
    pub const DEFAULT_INSTANCE_HEADROOM: usize = 64;
    /// Default chunk length limit (256 MiB).
    pub const DEFAULT_MAX_CHUNK_LEN: u64 = 256 * 1024 * 1024;
    /// Default per-table object limit.
    pub const DEFAULT_MAX_OBJECT_COUNT: u32 = 1 << 20;

    /// Creates options with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the headroom reserved in deserialized instances.
    pub fn instance_headroom(mut self, bytes: usize) -> Self {
        self.instance_headroom = bytes;
        self
    }

    /// Sets the largest accepted chunk.
    pub fn max_chunk_len(mut self, bytes: u64) -> Self {
        self.max_chunk_len = bytes;
        self
    }

    /// Sets the largest accepted table length.
    pub fn max_object_count(mut self, count: u32) -> Self {
        self.max_object_count = count;
        self
    }

    /// Sets the metrics collection implementation.
    pub fn metrics(mut self, metrics: Arc<dyn StreamMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

impl Default for StreamerOptions {
    fn default() -> Self {
        Self {
            instance_headroom: Self::DEFAULT_INSTANCE_HEADROOM,
            max_chunk_len: Self::DEFAULT_MAX_CHUNK_LEN,
            max_object_count: Self::DEFAULT_MAX_OBJECT_COUNT,
            metrics: None,
        }
    }
}

impl fmt::Debug for StreamerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamerOptions")
            .field("instance_headroom", &self.instance_headroom)
            .field("max_chunk_len", &self.max_chunk_len)
            .field("max_object_count", &self.max_object_count)
            .field("metrics", &self.metrics.is_some())
            .finish()
    }
}
