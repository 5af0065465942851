use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;

/// Which features force the single-tile scheduler instead of a persistent
/// one.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Copy, Clone)]
#[serde(default)]
pub struct SchedulerPolicy {
    pub single_tile_for_split: bool,
    pub single_tile_for_paged_kv: bool,
    pub single_tile_for_append_kv: bool,
}

impl Default for SchedulerPolicy {
    fn default() -> Self {
        Self {
            single_tile_for_split: true,
            single_tile_for_paged_kv: true,
            single_tile_for_append_kv: true,
        }
    }
}

/// Tuned constants of the planner. The defaults are the values measured on
/// one accelerator generation.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
#[serde(default)]
pub struct EnginePolicy {
    pub pack_gqa_margin: f32,
    pub forward_seqlen_rounding: usize,
    pub max_num_splits: usize,
    pub max_head_dim: usize,
    pub scheduler: SchedulerPolicy,
    pub num_workers: Option<usize>,
}

impl EnginePolicy {
    pub const NUM_SPLITS_LIMIT: usize = 256;
    pub const HEAD_DIM_LIMIT: usize = 256;

    pub fn from_json(json: &str) -> Result<Self, ConfigurationError> {
        let policy: EnginePolicy = serde_json::from_str(json)
            .map_err(|err| ConfigurationError::InvalidPolicy(err.to_string()))?;
        policy.validate()?;
        Ok(policy)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if !(self.pack_gqa_margin > 0.0 && self.pack_gqa_margin <= 1.0) {
            return Err(ConfigurationError::InvalidPolicy(format!(
                "pack_gqa_margin must be in (0, 1], got {}",
                self.pack_gqa_margin
            )));
        }
        if self.forward_seqlen_rounding == 0 {
            return Err(ConfigurationError::InvalidPolicy(
                "forward_seqlen_rounding must be positive".to_string(),
            ));
        }
        if self.max_num_splits == 0
            || self.max_num_splits > Self::NUM_SPLITS_LIMIT
        {
            return Err(ConfigurationError::InvalidPolicy(format!(
                "max_num_splits must be in 1..={}, got {}",
                Self::NUM_SPLITS_LIMIT,
                self.max_num_splits
            )));
        }
        if self.max_head_dim == 0 || self.max_head_dim > Self::HEAD_DIM_LIMIT
        {
            return Err(ConfigurationError::InvalidPolicy(format!(
                "max_head_dim must be in 1..={}, got {}",
                Self::HEAD_DIM_LIMIT,
                self.max_head_dim
            )));
        }
        if self.num_workers == Some(0) {
            return Err(ConfigurationError::InvalidPolicy(
                "num_workers must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for EnginePolicy {
    fn default() -> Self {
        Self {
            pack_gqa_margin: 0.95,
            forward_seqlen_rounding: 128,
            max_num_splits: Self::NUM_SPLITS_LIMIT,
            max_head_dim: Self::HEAD_DIM_LIMIT,
            scheduler: SchedulerPolicy::default(),
            num_workers: None,
        }
    }
}
