use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

/// Trait for tracking streamer activity.
///
/// Implementations collect statistics about serialized and deserialized
/// streams, the objects they carry, and the streams that were rejected. This
/// information can be used for monitoring and capacity planning.
pub trait StreamMetrics: Send + Sync {
    /// Records a stream written by `serialize`.
    ///
    /// # Parameters
    /// * `classes` - Number of distinct classes written.
    /// * `instances` - Number of instances written.
    /// * `bytes` - Total stream length in bytes.
    fn stream_written(&self, classes: u64, instances: u64, bytes: u64);

    /// Records a stream accepted by `deserialize`.
    fn stream_read(&self, classes: u64, instances: u64, bytes: u64);

    /// Records a stream rejected as malformed.
    fn stream_rejected(&self);
}

/// A no-op implementation of [`StreamMetrics`] that discards all recorded metrics.
#[derive(Default)]
pub struct NoopMetrics;

impl StreamMetrics for NoopMetrics {
    fn stream_written(&self, _classes: u64, _instances: u64, _bytes: u64) {}
    fn stream_read(&self, _classes: u64, _instances: u64, _bytes: u64) {}
    fn stream_rejected(&self) {}
}

/// A thread-safe counter-based implementation of [`StreamMetrics`].
#[derive(Default)]
pub struct CounterMetrics {
    /// Number of streams written.
    pub streams_written: AtomicU64,

    /// Number of streams read successfully.
    pub streams_read: AtomicU64,

    /// Number of streams rejected as malformed.
    pub streams_rejected: AtomicU64,

    /// Number of class chunks written.
    pub classes_written: AtomicU64,

    /// Number of instance chunks written.
    pub instances_written: AtomicU64,

    /// Number of class chunks reconstructed.
    pub classes_read: AtomicU64,

    /// Number of instance chunks reconstructed.
    pub instances_read: AtomicU64,

    /// Total bytes written.
    pub bytes_written: AtomicU64,

    /// Total bytes consumed by successful reads.
    pub bytes_read: AtomicU64,
}

/// Point-in-time copy of a [`CounterMetrics`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
#[allow(missing_docs)]
pub struct MetricsSnapshot {
    pub streams_written: u64,
    pub streams_read: u64,
    pub streams_rejected: u64,
    pub classes_written: u64,
    pub instances_written: u64,
    pub classes_read: u64,
    pub instances_read: u64,
    pub bytes_written: u64,
    pub bytes_read: u64,
}

impl CounterMetrics {
    /// Reads every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            streams_written: self.streams_written.load(Ordering::Relaxed),
            streams_read: self.streams_read.load(Ordering::Relaxed),
            streams_rejected: self.streams_rejected.load(Ordering::Relaxed),
            classes_written: self.classes_written.load(Ordering::Relaxed),
            instances_written: self.instances_written.load(Ordering::Relaxed),
            classes_read: self.classes_read.load(Ordering::Relaxed),
            instances_read: self.instances_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
        }
    }
}

impl StreamMetrics for CounterMetrics {
    fn stream_written(&self, classes: u64, instances: u64, bytes: u64) {
        self.streams_written.fetch_add(1, Ordering::Relaxed);
        self.classes_written.fetch_add(classes, Ordering::Relaxed);
        self.instances_written.fetch_add(instances, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    fn stream_read(&self, classes: u64, instances: u64, bytes: u64) {
        self.streams_read.fetch_add(1, Ordering::Relaxed);
        self.classes_read.fetch_add(classes, Ordering::Relaxed);
        self.instances_read.fetch_add(instances, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    fn stream_rejected(&self) {
        self.streams_rejected.fetch_add(1, Ordering::Relaxed);
    }
}

/// Returns the default metrics implementation wrapped in an [`Arc`].
///
/// The default implementation is [`NoopMetrics`].
pub fn default_metrics() -> Arc<dyn StreamMetrics> {
    Arc::new(NoopMetrics)
}
