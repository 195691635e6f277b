//! Bring-up configuration
//!
//! Defaults come from the generation; everything can be overridden before
//! the device is brought up, mostly so tests and simulations can shrink or
//! reshape the arenas.

use crate::generation::{Generation, BOOTLOADER_DLIST_END};
use hvs_allocator::DEFAULT_HANDLE_SLOTS;
use std::time::Duration;

/// Default fallback sweep interval
pub const DEFAULT_FALLBACK_SWEEP: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HvsConfig {
    pub generation: Generation,

    /// First allocatable display-list word. Words below it hold the
    /// firmware's boot-time list and are never handed out.
    pub dlist_base: usize,

    /// Allocatable display-list words, `None` for "everything above
    /// `dlist_base`", read from the hardware on gen 6
    pub dlist_size: Option<usize>,

    /// Line-buffer memory in words
    pub lbm_size: usize,

    /// Unified pixel memory in words
    pub upm_size: usize,

    /// Refcounted handle slots over the unified pixel memory
    pub upm_handles: usize,

    /// Allocate and upload the scaler filter kernels at bring-up
    pub filter_kernels: bool,

    /// Sweep on a timer as well as on demand, `None` to rely on interrupts
    pub fallback_sweep: Option<Duration>,
}

impl HvsConfig {
    /// Defaults for `generation`
    pub fn for_generation(generation: Generation) -> Self {
        Self {
            generation,
            dlist_base: BOOTLOADER_DLIST_END,
            dlist_size: None,
            lbm_size: generation.lbm_words(),
            upm_size: generation.upm_words(),
            upm_handles: DEFAULT_HANDLE_SLOTS,
            filter_kernels: true,
            fallback_sweep: Some(DEFAULT_FALLBACK_SWEEP),
        }
    }

    pub fn with_dlist_base(mut self, base: usize) -> Self {
        self.dlist_base = base;
        self
    }

    pub fn with_dlist_size(mut self, words: usize) -> Self {
        self.dlist_size = Some(words);
        self
    }

    pub fn with_lbm_size(mut self, words: usize) -> Self {
        self.lbm_size = words;
        self
    }

    pub fn with_upm_size(mut self, words: usize) -> Self {
        self.upm_size = words;
        self
    }

    pub fn with_upm_handles(mut self, slots: usize) -> Self {
        self.upm_handles = slots;
        self
    }

    pub fn with_filter_kernels(mut self, upload: bool) -> Self {
        self.filter_kernels = upload;
        self
    }

    pub fn with_fallback_sweep(mut self, interval: Option<Duration>) -> Self {
        self.fallback_sweep = interval;
        self
    }

    /// Display-list arena capacity given the total memory size
    pub(crate) fn dlist_capacity(&self, total_words: usize) -> usize {
        self.dlist_size
            .unwrap_or_else(|| total_words.saturating_sub(self.dlist_base))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legacy_defaults() {
        let config = HvsConfig::for_generation(Generation::Vc4);
        assert_eq!(config.dlist_base, 32);
        assert_eq!(config.dlist_capacity(4096), 4096 - 32);
        assert_eq!(config.lbm_size, 48 * 1024);
        assert_eq!(config.upm_size, 0);
        assert_eq!(config.upm_handles, 32);
        assert!(config.filter_kernels);
        assert_eq!(config.fallback_sweep, Some(Duration::from_millis(100)));
    }

    #[test]
    fn test_overrides() {
        let config = HvsConfig::for_generation(Generation::Vc6D)
            .with_dlist_base(0)
            .with_dlist_size(16000)
            .with_filter_kernels(false)
            .with_fallback_sweep(None);

        assert_eq!(config.dlist_capacity(4096), 16000);
        assert_eq!(config.upm_size, 1024 * 256);
        assert!(!config.filter_kernels);
        assert!(config.fallback_sweep.is_none());
    }
}
