//! Configuration knobs recognized at open time.

/// Runtime configuration shared by the disk B+tree, the binary file engine,
/// and the WAL engine. Constructed programmatically; no CLI or config-file
/// loader is provided.
#[derive(Debug, Clone)]
pub struct Config {
    /// Primary-tree node-cache cap. Larger reduces I/O at the cost of memory.
    pub cache_size: usize,
    /// Enable the document-region page cache.
    pub mmap_enabled: bool,
    /// WAL engine batch flush size threshold (records per append).
    pub batch_size: usize,
    /// Binary file engine batch flush size threshold (buffered writes).
    /// Larger than `batch_size` since individual document writes are cheaper
    /// to buffer than WAL records.
    pub file_batch_size: usize,
    /// WAL / binary-engine batch flush time threshold, in milliseconds.
    pub batch_time_ms: u64,
    /// Encode WAL records and the index catalog as MessagePack instead of JSON.
    pub use_msgpack: bool,
    /// WAL record count that triggers compaction.
    pub compact_threshold: usize,
    /// Binary-engine auto-flush interval, in milliseconds.
    pub auto_flush_ms: u64,
    /// Whether a timer-driven background compaction task runs at all.
    pub background_compaction: bool,
    /// Interval between background compaction attempts, in milliseconds.
    pub compaction_interval_ms: u64,
    /// Minimum interval enforced between any two compactions, in milliseconds.
    pub min_compaction_interval_ms: u64,
    /// Whether an empty table still creates a record on disk.
    pub persist_empty: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_size: 1000,
            mmap_enabled: true,
            batch_size: 1000,
            file_batch_size: 5000,
            batch_time_ms: 20,
            use_msgpack: false,
            compact_threshold: 10_000,
            auto_flush_ms: 100,
            background_compaction: true,
            compaction_interval_ms: 60_000,
            min_compaction_interval_ms: 60_000,
            persist_empty: false,
        }
    }
}
