use super::{HeadDimBucket, VariantKey};

/// Forward tiling constants of one variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileConfig {
    pub block_m: usize,
    pub block_n: usize,
    pub stages: usize,
    /// Clustering is allowed for this variant; the actual cluster size also
    /// depends on the number of query tiles.
    pub enable_cluster: bool,
}

impl TileConfig {
    pub fn forward(key: &VariantKey) -> Self {
        let masked = key.mask().is_masked();
        let (block_m, block_n, stages) = if key.data_type().is_float8() {
            match key.head_dim() {
                HeadDimBucket::D64 => (192, 160, 3),
                HeadDimBucket::D96 => (192, 128, 3),
                HeadDimBucket::D128 => {
                    (128, if key.v_colmajor() { 192 } else { 224 }, 2)
                },
                HeadDimBucket::D192 => (128, 160, 2),
                HeadDimBucket::D256 => (128, 128, 2),
            }
        } else {
            match key.head_dim() {
                HeadDimBucket::D64 => (192, if masked { 128 } else { 192 }, 2),
                HeadDimBucket::D96 => (192, if masked { 128 } else { 144 }, 2),
                HeadDimBucket::D128 => {
                    (128, if masked { 128 } else { 176 }, 2)
                },
                HeadDimBucket::D192 => (128, 112, 2),
                HeadDimBucket::D256 => (128, 80, 2),
            }
        };
        Self {
            block_m,
            block_n,
            stages,
            enable_cluster: key.head_dim().value() >= 192
                && !masked
                && !key.split(),
        }
    }

    /// Cluster size along the query-tile axis. Pairs of query tiles only
    /// cluster when the tile count is known and even.
    pub fn cluster_m(
        &self,
        key: &VariantKey,
        num_blocks_m: usize,
    ) -> usize {
        if self.enable_cluster && !key.varlen() && num_blocks_m % 2 == 0 {
            2
        } else {
            1
        }
    }
}

/// Backward tiling constants, keyed on the rounded head dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackwardTileConfig {
    pub block_m: usize,
    pub block_n: usize,
}

impl BackwardTileConfig {
    pub fn new(
        head_size_rounded: usize,
        has_softcap: bool,
    ) -> Self {
        let block_m = if head_size_rounded <= 64 {
            if has_softcap {
                96
            } else {
                128
            }
        } else {
            64
        };
        let block_n = if head_size_rounded <= 128 {
            128
        } else if head_size_rounded <= 192 {
            96
        } else {
            80
        };
        Self {
            block_m,
            block_n,
        }
    }
}
