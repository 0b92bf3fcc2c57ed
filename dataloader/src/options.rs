use crate::error::BuildError;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// The default maximum number of keys per batch.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 1000;

/// The default number of existing cache entries offered to a
/// cache-key match function before falling back to an exact lookup.
pub const DEFAULT_FUZZY_MATCH_SAMPLE: usize = 128;

/// Selects how a loader turns pending keys into fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum DispatchMode {
  /// Coalesce keys into batches of up to `max_batch_size`, fetching each
  /// batch on the next tick of the loader's scheduler.
  #[default]
  Batched,
  /// Fetch every key on its own as soon as it misses the cache. Results are
  /// still cached and de-duplicated.
  Immediate,
}

/// The plain-data part of a loader's configuration.
///
/// Everything that isn't a closure or a trait object lives here, so it can be
/// loaded from a config file when the `serde` feature is enabled. Missing
/// fields take their default values.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct LoaderOptions {
  /// Reported in logs, metrics and tick metadata.
  pub name: String,
  pub max_batch_size: usize,
  pub dispatch_mode: DispatchMode,
  /// Upper bound on entries scanned per lookup by a cache-key match function.
  pub fuzzy_match_sample: usize,
  /// Number of cache shards; rounded up to a power of two.
  pub shards: usize,
}

impl Default for LoaderOptions {
  fn default() -> Self {
    Self {
      name: "dataloader".to_string(),
      max_batch_size: DEFAULT_MAX_BATCH_SIZE,
      dispatch_mode: DispatchMode::Batched,
      fuzzy_match_sample: DEFAULT_FUZZY_MATCH_SAMPLE,
      shards: (num_cpus::get() * 4).max(1).next_power_of_two(),
    }
  }
}

impl LoaderOptions {
  /// Checks the options without building anything.
  pub fn validate(&self) -> Result<(), BuildError> {
    if self.max_batch_size == 0 {
      return Err(BuildError::ZeroBatchSize);
    }
    if self.fuzzy_match_sample == 0 {
      return Err(BuildError::ZeroFuzzySample);
    }
    Ok(())
  }
}
