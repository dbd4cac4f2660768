use serde::{Deserialize, Serialize};

use crate::storage::bracket::page::LEAF_HEADER_LEN;
use crate::storage::branch::page::BRANCH_HEADER_LEN;
use crate::types::page::{DEFAULT_PAGE_SIZE, PAGE_HDR_LEN};
use crate::types::{ArborError, Result};

const MIN_PAGE_SIZE: usize = 1024;
const MAX_PAGE_SIZE: usize = 32 * 1024;

/// Configuration shared by the page-context factory and its contexts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreOptions {
    /// Size of every page in bytes; a power of two in `1024..=32768`.
    pub page_size: usize,
    /// Largest leaf value kept in the page. `None` derives it from the page size.
    pub inline_threshold: Option<usize>,
    /// Largest branch value kept in the page. `None` derives it from the page size.
    pub branch_inline_threshold: Option<usize>,
    /// Fraction of used leaf space that stays on the left page of a split.
    pub split_occupancy: f64,
    /// Verify page checksums when a sealed page is fetched.
    pub verify_checksums: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE as usize,
            inline_threshold: None,
            branch_inline_threshold: None,
            split_occupancy: 0.5,
            verify_checksums: false,
        }
    }
}

impl StoreOptions {
    /// Default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the page size.
    pub fn page_size(mut self, bytes: usize) -> Self {
        self.page_size = bytes;
        self
    }

    /// Sets the leaf inline threshold.
    pub fn inline_threshold(mut self, bytes: usize) -> Self {
        self.inline_threshold = Some(bytes);
        self
    }

    /// Sets the branch inline threshold.
    pub fn branch_inline_threshold(mut self, bytes: usize) -> Self {
        self.branch_inline_threshold = Some(bytes);
        self
    }

    /// Sets the split occupancy.
    pub fn split_occupancy(mut self, fraction: f64) -> Self {
        self.split_occupancy = fraction;
        self
    }

    /// Enables or disables checksum verification on fetch.
    pub fn verify_checksums(mut self, enabled: bool) -> Self {
        self.verify_checksums = enabled;
        self
    }

    /// Bytes a formatted leaf without high key offers to keys and values.
    pub fn leaf_usable_space(&self) -> usize {
        self.page_size.saturating_sub(PAGE_HDR_LEN + LEAF_HEADER_LEN + 1)
    }

    /// Bytes an empty branch offers to records and slots.
    pub fn branch_usable_space(&self) -> usize {
        self.page_size.saturating_sub(PAGE_HDR_LEN + BRANCH_HEADER_LEN)
    }

    /// Leaf values longer than this are externalized.
    pub fn effective_inline_threshold(&self) -> usize {
        self.inline_threshold
            .unwrap_or_else(|| self.leaf_usable_space() / 6)
    }

    /// Branch values longer than this are externalized.
    pub fn effective_branch_inline_threshold(&self) -> usize {
        self.branch_inline_threshold
            .unwrap_or_else(|| self.branch_usable_space() / 8)
    }

    /// Checks every field.
    pub fn validate(&self) -> Result<()> {
        if !self.page_size.is_power_of_two() || !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&self.page_size) {
            return Err(ArborError::Config(format!(
                "page_size {} must be a power of two in {MIN_PAGE_SIZE}..={MAX_PAGE_SIZE}",
                self.page_size
            )));
        }
        if !(self.split_occupancy > 0.0 && self.split_occupancy < 1.0) {
            return Err(ArborError::Config(format!(
                "split_occupancy {} must lie strictly between 0 and 1",
                self.split_occupancy
            )));
        }
        let inline = self.effective_inline_threshold();
        if inline == 0 || inline > self.leaf_usable_space() / 2 {
            return Err(ArborError::Config(format!(
                "inline_threshold {inline} must be in 1..={}",
                self.leaf_usable_space() / 2
            )));
        }
        let branch = self.effective_branch_inline_threshold();
        if branch < 8 || branch > self.branch_usable_space() / 4 {
            return Err(ArborError::Config(format!(
                "branch_inline_threshold {branch} must be in 8..={}",
                self.branch_usable_space() / 4
            )));
        }
        Ok(())
    }

    /// Parses and validates options from TOML. Missing keys keep their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let options: StoreOptions = toml::from_str(text).map_err(|err| ArborError::Config(err.to_string()))?;
        options.validate()?;
        Ok(options)
    }

    /// Renders the options as TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string(self).map_err(|err| ArborError::Config(err.to_string()))
    }
}
