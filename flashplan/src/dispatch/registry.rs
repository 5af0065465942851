use std::collections::HashMap;

use super::{HeadDimBucket, TileConfig, VariantFeatures, VariantKey};
use crate::{
    DataType, config::SchedulerPolicy, error::ConfigurationError,
    scheduler::SchedulerKind,
};

/// A concrete kernel instantiation: the variant plus its tiling and
/// scheduling strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelVariant {
    pub key: VariantKey,
    pub tile: TileConfig,
    pub scheduler: SchedulerKind,
}

impl KernelVariant {
    fn new(
        key: VariantKey,
        policy: &SchedulerPolicy,
    ) -> Self {
        Self {
            key,
            tile: TileConfig::forward(&key),
            scheduler: SchedulerKind::select(&key, policy),
        }
    }

    pub fn name(&self) -> String {
        self.key.to_string()
    }
}

/// Every permitted variant, generated once up front.
#[derive(Debug)]
pub struct VariantRegistry {
    variants: HashMap<VariantKey, KernelVariant>,
}

impl VariantRegistry {
    pub const DATA_TYPES: [DataType; 3] =
        [DataType::F16, DataType::BF16, DataType::F8E4M3];

    pub fn new(policy: &SchedulerPolicy) -> Self {
        let mut variants = HashMap::new();
        for &data_type in &Self::DATA_TYPES {
            for &head_dim in &HeadDimBucket::ALL {
                for (is_causal, is_local) in
                    [(false, false), (true, false), (false, true)]
                {
                    // One bit per boolean feature.
                    for bits in 0u32..(1 << 7) {
                        let flag = |bit: u32| bits & (1 << bit) != 0;
                        let features = VariantFeatures {
                            data_type,
                            head_dim,
                            is_causal,
                            is_local,
                            has_softcap: flag(0),
                            varlen: flag(1),
                            paged_kv: flag(2),
                            append_kv: flag(3),
                            pack_gqa: flag(4),
                            split: flag(5),
                            v_colmajor: flag(6),
                        };
                        if let Ok(key) = VariantKey::new(features) {
                            variants.insert(key, KernelVariant::new(key, policy));
                        }
                    }
                }
            }
        }
        log::debug!("registered {} attention variants", variants.len());
        Self {
            variants,
        }
    }

    pub fn len(&self) -> usize {
        self.variants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variants.is_empty()
    }

    /// Validates `features` and returns the matching instantiation.
    pub fn select(
        &self,
        features: VariantFeatures,
    ) -> Result<&KernelVariant, ConfigurationError> {
        let key = VariantKey::new(features)?;
        self.variants.get(&key).ok_or(ConfigurationError::InvalidVariant(
            "no kernel instantiated for this feature combination",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_permitted_combinations() {
        let registry = VariantRegistry::new(&SchedulerPolicy::default());
        // Per (type, hdim, mask, softcap, pack, split): fixed-length without
        // append, and varlen with or without append, times paged. Column-major
        // V doubles the 8-bit variants without append.
        let per_half = 5 * 3 * 2 * 2 * 2 * 2 * 3;
        let per_fp8 = 5 * 3 * 2 * 2 * 2 * 2 * (3 + 2);
        assert_eq!(registry.len(), 2 * per_half + per_fp8);
        assert!(!registry.is_empty());
    }

    #[test]
    fn test_select() {
        let registry = VariantRegistry::new(&SchedulerPolicy::default());
        let mut features =
            VariantFeatures::new(DataType::F16, HeadDimBucket::D64);
        features.split = true;
        let variant = registry.select(features).unwrap();
        assert_eq!(variant.scheduler, SchedulerKind::SingleTile);
        assert_eq!(variant.name(), "f16_hdim64_split");

        features.append_kv = true;
        assert!(registry.select(features).is_err());
    }
}
