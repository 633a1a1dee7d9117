use std::{num::NonZeroUsize, thread, time::Duration};

use thiserror::Error;

use crate::trigger::TriggerType;

/// Tunables for the runner pool, the sort manager and repositories.
#[derive(Debug, Clone)]
pub struct EngineOption {
    pub(crate) runners: usize,
    pub(crate) frame_pool_capacity: usize,
    pub(crate) idle_spins: usize,
    pub(crate) idle_sleep_min: Duration,
    pub(crate) idle_sleep_max: Duration,
    pub(crate) sort_buffer_capacity: usize,
    pub(crate) parallel_sort_threshold: usize,
    pub(crate) consolidation_threshold: usize,
    pub(crate) block_size: usize,
    pub(crate) read_ahead_frames: usize,
    pub(crate) seal_trigger: TriggerType,
    pub(crate) disk_merge_threshold: usize,
}

impl Default for EngineOption {
    fn default() -> Self {
        EngineOption {
            runners: thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1),
            frame_pool_capacity: 256,
            idle_spins: 100,
            idle_sleep_min: Duration::from_micros(10),
            idle_sleep_max: Duration::from_millis(1),
            sort_buffer_capacity: 4096,
            parallel_sort_threshold: 16 * 1024,
            consolidation_threshold: 10,
            block_size: 16 * 1024,
            read_ahead_frames: 4,
            seal_trigger: TriggerType::Length(64 * 1024),
            disk_merge_threshold: 4,
        }
    }
}

impl EngineOption {
    /// Number of runner threads.
    pub fn runners(self, runners: usize) -> Self {
        EngineOption { runners, ..self }
    }

    /// Terminated frames kept for reuse.
    pub fn frame_pool_capacity(self, frame_pool_capacity: usize) -> Self {
        EngineOption {
            frame_pool_capacity,
            ..self
        }
    }

    /// Empty passes a runner spins through before it sleeps.
    pub fn idle_spins(self, idle_spins: usize) -> Self {
        EngineOption { idle_spins, ..self }
    }

    /// Bounds of an idle runner's exponential sleep.
    pub fn idle_sleep(self, min: Duration, max: Duration) -> Self {
        EngineOption {
            idle_sleep_min: min,
            idle_sleep_max: max,
            ..self
        }
    }

    /// Records a sort manager buffers before it spills a generation.
    pub fn sort_buffer_capacity(self, sort_buffer_capacity: usize) -> Self {
        EngineOption {
            sort_buffer_capacity,
            ..self
        }
    }

    /// Buffer length above which spills sort in parallel.
    pub fn parallel_sort_threshold(self, parallel_sort_threshold: usize) -> Self {
        EngineOption {
            parallel_sort_threshold,
            ..self
        }
    }

    /// Generations per index that trigger a consolidation.
    pub fn consolidation_threshold(self, consolidation_threshold: usize) -> Self {
        EngineOption {
            consolidation_threshold,
            ..self
        }
    }

    /// Target size of a generation frame in bytes.
    pub fn block_size(self, block_size: usize) -> Self {
        EngineOption { block_size, ..self }
    }

    /// Frames a generation reader fetches per read.
    pub fn read_ahead_frames(self, read_ahead_frames: usize) -> Self {
        EngineOption {
            read_ahead_frames,
            ..self
        }
    }

    /// When a memory layer is sealed.
    pub fn seal_trigger(self, seal_trigger: TriggerType) -> Self {
        EngineOption {
            seal_trigger,
            ..self
        }
    }

    /// Disk layers a repository accumulates before they are merged.
    pub fn disk_merge_threshold(self, disk_merge_threshold: usize) -> Self {
        EngineOption {
            disk_merge_threshold,
            ..self
        }
    }

    /// Check the invariants the runtime relies on.
    pub fn validate(&self) -> Result<(), OptionError> {
        if self.runners == 0 {
            return Err(OptionError::ZeroRunners);
        }
        if self.sort_buffer_capacity == 0 {
            return Err(OptionError::ZeroBuffer);
        }
        if self.consolidation_threshold == 0 {
            return Err(OptionError::ZeroConsolidationThreshold);
        }
        if self.block_size == 0 {
            return Err(OptionError::ZeroBlockSize);
        }
        if self.idle_sleep_min > self.idle_sleep_max {
            return Err(OptionError::IdleSleepRange {
                min: self.idle_sleep_min,
                max: self.idle_sleep_max,
            });
        }
        Ok(())
    }
}

/// Invalid [`EngineOption`] combinations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum OptionError {
    /// `runners` is zero.
    #[error("option error: runner pool needs at least one runner")]
    ZeroRunners,
    /// `sort_buffer_capacity` is zero.
    #[error("option error: sort buffer capacity must be positive")]
    ZeroBuffer,
    /// `consolidation_threshold` is zero.
    #[error("option error: consolidation threshold must be positive")]
    ZeroConsolidationThreshold,
    /// `block_size` is zero.
    #[error("option error: block size must be positive")]
    ZeroBlockSize,
    /// `min` is above `max`.
    #[error("option error: idle sleep range {min:?}..{max:?} is empty")]
    IdleSleepRange {
        /// Configured lower bound.
        min: Duration,
        /// Configured upper bound.
        max: Duration,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_defaults() {
        let option = EngineOption::default()
            .runners(3)
            .sort_buffer_capacity(8)
            .consolidation_threshold(2);
        assert_eq!(option.runners, 3);
        assert_eq!(option.sort_buffer_capacity, 8);
        assert_eq!(option.consolidation_threshold, 2);
        assert!(option.validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_threshold() {
        let option = EngineOption::default().consolidation_threshold(0);
        assert_eq!(
            option.validate(),
            Err(OptionError::ZeroConsolidationThreshold)
        );
        let option = EngineOption::default().runners(0);
        assert_eq!(option.validate(), Err(OptionError::ZeroRunners));
        let option = EngineOption::default()
            .idle_sleep(Duration::from_millis(2), Duration::from_millis(1));
        assert!(matches!(
            option.validate(),
            Err(OptionError::IdleSleepRange { .. })
        ));
    }
}
