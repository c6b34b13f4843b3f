//! Construction-time options for the persistent engine.

use std::time::Duration;

const GIB: u64 = 1 << 30;
const MIB: u64 = 1 << 20;

/// Options applied when opening a disk-backed index. Builder calls compose
/// left to right, so a later call overrides an earlier one.
#[derive(Debug, Clone)]
pub struct IndexConfig {
    /// Bit-width used to seed the key-table sizing of the on-disk index.
    pub index_bit_size: u8,
    /// Data-log size that triggers a compaction pass.
    pub index_file_size: u64,
    /// Period of the background flush.
    pub sync_interval: Duration,
    /// Un-synced write bytes tolerated before an inline flush.
    pub burst_rate: u64,
    /// Period of the background garbage collection check.
    pub gc_interval: Duration,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            index_bit_size: 24,
            index_file_size: GIB,
            sync_interval: Duration::from_secs(1),
            burst_rate: 4 * MIB,
            gc_interval: Duration::from_secs(30 * 60),
        }
    }
}

impl IndexConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_index_bit_size(mut self, bits: u8) -> Self {
        self.index_bit_size = bits;
        self
    }

    pub fn with_index_file_size(mut self, bytes: u64) -> Self {
        self.index_file_size = bytes;
        self
    }

    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    pub fn with_burst_rate(mut self, bytes: u64) -> Self {
        self.burst_rate = bytes;
        self
    }

    pub fn with_gc_interval(mut self, interval: Duration) -> Self {
        self.gc_interval = interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = IndexConfig::default();
        assert_eq!(config.index_bit_size, 24);
        assert_eq!(config.index_file_size, GIB);
        assert_eq!(config.sync_interval, Duration::from_secs(1));
        assert_eq!(config.burst_rate, 4 * MIB);
        assert_eq!(config.gc_interval, Duration::from_secs(1800));
    }

    #[test]
    fn test_later_option_wins() {
        let config = IndexConfig::new()
            .with_index_bit_size(16)
            .with_index_bit_size(20);
        assert_eq!(config.index_bit_size, 20);
    }
}
