//! Database configuration.

/// Configuration for opening a database.
#[derive(Debug, Clone)]
pub struct Config {
    /// B+Tree branching factor: the maximum child count of an internal
    /// node. Leaves overflow above `branching_factor - 1` values.
    pub branching_factor: usize,

    /// Fixed capacity of each segment file in bytes.
    pub segment_capacity: u64,

    /// Log file size above which the log rotates to a fresh file.
    pub log_rotate_size: u64,

    /// Whether to fsync segment data on every commit (safer but slower).
    pub sync_on_commit: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            branching_factor: 64,
            segment_capacity: 64 * 1024 * 1024, // 64 MB
            log_rotate_size: 4 * 1024 * 1024,   // 4 MB
            sync_on_commit: true,
        }
    }
}

impl Config {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the branching factor.
    ///
    /// # Panics
    ///
    /// Panics if `value` is outside `4..=255`; the node record encodes
    /// child counts in one byte and a tree below order 4 cannot balance.
    #[must_use]
    pub fn branching_factor(mut self, value: usize) -> Self {
        assert!(
            (4..=255).contains(&value),
            "branching factor must be in 4..=255"
        );
        self.branching_factor = value;
        self
    }

    /// Sets the segment file capacity.
    #[must_use]
    pub const fn segment_capacity(mut self, bytes: u64) -> Self {
        self.segment_capacity = bytes;
        self
    }

    /// Sets the log rotation threshold.
    #[must_use]
    pub const fn log_rotate_size(mut self, bytes: u64) -> Self {
        self.log_rotate_size = bytes;
        self
    }

    /// Sets whether to fsync on every commit.
    #[must_use]
    pub const fn sync_on_commit(mut self, value: bool) -> Self {
        self.sync_on_commit = value;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.branching_factor, 64);
        assert!(config.sync_on_commit);
    }

    #[test]
    fn builder_pattern() {
        let config = Config::new()
            .branching_factor(4)
            .segment_capacity(1024)
            .sync_on_commit(false);

        assert_eq!(config.branching_factor, 4);
        assert_eq!(config.segment_capacity, 1024);
        assert!(!config.sync_on_commit);
    }

    #[test]
    #[should_panic(expected = "branching factor")]
    fn rejects_tiny_branching_factor() {
        let _ = Config::new().branching_factor(2);
    }
}
