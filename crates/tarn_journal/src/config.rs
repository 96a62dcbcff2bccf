//! Journal configuration.

use crate::entry::ENTRY_SIZE;
use crate::error::{JournalError, JournalResult};

/// Configuration for opening a journal.
#[derive(Debug, Clone)]
pub struct JournalConfig {
    /// Hole-punching granularity in bytes.
    ///
    /// Journal positions are rounded down to this boundary before a
    /// punch, so a few already-processed records may linger past a
    /// punch; recovery tolerates that because replay is idempotent.
    /// Must be a power of two and a multiple of the record size.
    pub block_size: u64,

    /// Whether to punch out consumed journal regions after apply.
    ///
    /// Disabling retains the full journal on disk, which can be useful
    /// for tests and forensics.
    pub punch_holes: bool,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            block_size: 4096,
            punch_holes: true,
        }
    }
}

impl JournalConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the hole-punching granularity.
    #[must_use]
    pub const fn block_size(mut self, size: u64) -> Self {
        self.block_size = size;
        self
    }

    /// Sets whether consumed journal regions are punched out.
    #[must_use]
    pub const fn punch_holes(mut self, value: bool) -> Self {
        self.punch_holes = value;
        self
    }

    pub(crate) fn validate(&self) -> JournalResult<()> {
        if !self.block_size.is_power_of_two() || self.block_size < ENTRY_SIZE as u64 {
            return Err(JournalError::invalid_operation(format!(
                "block_size must be a power of two >= {ENTRY_SIZE}, got {}",
                self.block_size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(JournalConfig::default().validate().is_ok());
    }

    #[test]
    fn builder_pattern() {
        let config = JournalConfig::new().block_size(512).punch_holes(false);
        assert_eq!(config.block_size, 512);
        assert!(!config.punch_holes);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_non_power_of_two() {
        assert!(JournalConfig::new().block_size(1000).validate().is_err());
    }

    #[test]
    fn rejects_block_smaller_than_record() {
        assert!(JournalConfig::new().block_size(64).validate().is_err());
    }
}
