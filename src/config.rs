use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Result, UniqError};

/// Engine configuration, shared by both pipelines.
///
/// Every field has a serde default so embedders can deserialize a partial
/// document and get the reference behaviour for everything left unsaid.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct UniqConfig {
    /// Directory for temporary runs. The system temp directory if unset.
    #[serde(default = "default::temp_dir")]
    pub temp_dir: Option<PathBuf>,
    /// Emit bins in key order even when nothing forced a sort.
    #[serde(default = "default::sort_output")]
    pub sort_output: bool,
    /// Bins held in memory before the table spills.
    #[serde(default = "default::bin_capacity")]
    pub bin_capacity: usize,
    /// Byte budget for distinct counting; a refused charge triggers a spill.
    #[serde(default = "default::distinct_mem_bytes")]
    pub distinct_mem_bytes: usize,
    /// Temporary runs (or input streams) merged in one pass.
    #[serde(default = "default::merge_fan_in")]
    pub merge_fan_in: usize,
    /// Also count the distinct values of the first distinct field across
    /// all bins.
    #[serde(default = "default::total_distinct")]
    pub total_distinct: bool,
    /// Emit progress summaries (spills, merge passes, budget fill) at info
    /// level instead of leaving them on the debug channel.
    #[serde(default = "default::debug")]
    pub debug: bool,
}

impl Default for UniqConfig {
    fn default() -> Self {
        Self {
            temp_dir: default::temp_dir(),
            sort_output: default::sort_output(),
            bin_capacity: default::bin_capacity(),
            distinct_mem_bytes: default::distinct_mem_bytes(),
            merge_fan_in: default::merge_fan_in(),
            total_distinct: default::total_distinct(),
            debug: default::debug(),
        }
    }
}

impl UniqConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.bin_capacity == 0 {
            return Err(UniqError::config("bin_capacity must be at least 1".to_string()));
        }
        if self.merge_fan_in < 2 {
            return Err(UniqError::config("merge_fan_in must be at least 2".to_string()));
        }
        Ok(())
    }
}

/// Default values for configurations.
#[allow(missing_docs)]
pub mod default {
    use std::path::PathBuf;

    use crate::merge::MAX_MERGE_FILES;

    pub fn temp_dir() -> Option<PathBuf> {
        None
    }

    pub fn sort_output() -> bool {
        false
    }

    pub fn bin_capacity() -> usize {
        500_000
    }

    pub fn distinct_mem_bytes() -> usize {
        512 * 1024 * 1024
    }

    pub fn merge_fan_in() -> usize {
        MAX_MERGE_FILES
    }

    pub fn total_distinct() -> bool {
        false
    }

    pub fn debug() -> bool {
        false
    }
}
