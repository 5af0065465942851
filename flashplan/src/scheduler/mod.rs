mod counter;
mod dynamic_persistent;
mod single_tile;
mod static_persistent;
mod varlen_dynamic;

pub use counter::TileCounter;
pub use dynamic_persistent::DynamicPersistentTileScheduler;
pub use single_tile::SingleTileScheduler;
pub use static_persistent::StaticPersistentTileScheduler;
pub use varlen_dynamic::VarlenDynamicPersistentTileScheduler;

use serde::{Deserialize, Serialize};

use crate::{config::SchedulerPolicy, dispatch::VariantKey};

/// Coordinates of one unit of work. `head` is a kv head when query heads
/// are packed, a query head otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkTile {
    pub tile_idx: usize,
    pub block: usize,
    pub head: usize,
    pub batch: usize,
    pub split: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerKind {
    SingleTile,
    StaticPersistent,
    DynamicPersistent,
    VarlenDynamicPersistent,
}

impl SchedulerKind {
    pub fn select(
        key: &VariantKey,
        policy: &SchedulerPolicy,
    ) -> Self {
        let single_tile = (key.split() && policy.single_tile_for_split)
            || (key.paged_kv() && policy.single_tile_for_paged_kv)
            || (key.append_kv() && policy.single_tile_for_append_kv);
        if single_tile {
            SchedulerKind::SingleTile
        } else if key.varlen() {
            SchedulerKind::VarlenDynamicPersistent
        } else if !key.mask().is_masked() {
            SchedulerKind::StaticPersistent
        } else {
            SchedulerKind::DynamicPersistent
        }
    }

    pub fn is_persistent(&self) -> bool {
        !matches!(self, SchedulerKind::SingleTile)
    }

    /// Whether the launch owns a shared tile counter.
    pub fn uses_tile_counter(&self) -> bool {
        matches!(
            self,
            SchedulerKind::DynamicPersistent
                | SchedulerKind::VarlenDynamicPersistent
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerArgs {
    /// Query tiles per (head, batch), already rounded to the cluster size.
    pub num_blocks_m: usize,
    pub num_heads: usize,
    pub batch_size: usize,
    pub num_splits: usize,
    pub qheads_per_kvhead: usize,
    pub seqlen_q: usize,
    pub block_m: usize,
    pub pack_gqa: bool,
    /// Heavy (masked) query tiles first.
    pub reverse_blocks: bool,
    pub num_workers: usize,
}

impl SchedulerArgs {
    pub fn total_tiles(&self) -> usize {
        self.num_blocks_m * self.num_heads * self.num_splits * self.batch_size
    }

    /// Row-major decode: block fastest, then split, then head, then batch.
    pub fn decode(
        &self,
        tile_idx: usize,
    ) -> WorkTile {
        let block = tile_idx % self.num_blocks_m;
        let rest = tile_idx / self.num_blocks_m;
        let head_split = rest % (self.num_heads * self.num_splits);
        let batch = rest / (self.num_heads * self.num_splits);
        WorkTile {
            tile_idx,
            block: if self.reverse_blocks {
                self.num_blocks_m - 1 - block
            } else {
                block
            },
            head: head_split / self.num_splits,
            batch,
            split: head_split % self.num_splits,
        }
    }

    /// Query rows a tile covers in one batch row (packed rows when heads
    /// are packed).
    pub fn rows_per_sequence(
        &self,
        seqlen_q: usize,
    ) -> usize {
        if self.pack_gqa {
            seqlen_q * self.qheads_per_kvhead
        } else {
            seqlen_q
        }
    }
}

/// Hands out tiles to compute units. Every tile is produced exactly once
/// across all workers of a launch; `None` means no more work.
pub trait TileScheduler: Send + Sync {
    fn kind(&self) -> SchedulerKind;

    /// Number of compute units to launch.
    fn grid_size(&self) -> usize;

    fn initial_work(
        &self,
        worker: usize,
    ) -> Option<WorkTile>;

    fn next_work(
        &self,
        worker: usize,
        current: &WorkTile,
    ) -> Option<WorkTile>;
}

/// Builds the scheduler of a launch. `varlen_rows` holds the per-batch
/// row lengths tiles are cut from when sequences are ragged.
pub fn build_scheduler(
    kind: SchedulerKind,
    args: SchedulerArgs,
    varlen_rows: Option<Vec<usize>>,
) -> Box<dyn TileScheduler> {
    let scheduler: Box<dyn TileScheduler> = match kind {
        SchedulerKind::SingleTile => {
            Box::new(SingleTileScheduler::new(args, varlen_rows))
        },
        SchedulerKind::StaticPersistent => {
            Box::new(StaticPersistentTileScheduler::new(args))
        },
        SchedulerKind::DynamicPersistent => {
            Box::new(DynamicPersistentTileScheduler::new(args))
        },
        SchedulerKind::VarlenDynamicPersistent => {
            Box::new(VarlenDynamicPersistentTileScheduler::new(
                args,
                varlen_rows.unwrap_or_else(|| {
                    vec![args.seqlen_q; args.batch_size]
                }),
            ))
        },
    };
    log::trace!(
        "scheduler {:?}: grid={} tiles={} persistent={} tile_counter={}",
        kind,
        scheduler.grid_size(),
        args.total_tiles(),
        kind.is_persistent(),
        kind.uses_tile_counter()
    );
    scheduler
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        DataType,
        dispatch::{HeadDimBucket, VariantFeatures},
        mask::MaskKind,
    };

    fn key(configure: impl Fn(&mut VariantFeatures)) -> VariantKey {
        let mut features =
            VariantFeatures::new(DataType::BF16, HeadDimBucket::D128);
        configure(&mut features);
        VariantKey::new(features).unwrap()
    }

    #[test]
    fn test_selection() {
        let policy = SchedulerPolicy::default();
        assert_eq!(
            SchedulerKind::select(&key(|f| f.split = true), &policy),
            SchedulerKind::SingleTile
        );
        assert_eq!(
            SchedulerKind::select(&key(|f| f.paged_kv = true), &policy),
            SchedulerKind::SingleTile
        );
        assert_eq!(
            SchedulerKind::select(&key(|f| f.varlen = true), &policy),
            SchedulerKind::VarlenDynamicPersistent
        );
        assert_eq!(
            SchedulerKind::select(&key(|_| {}), &policy),
            SchedulerKind::StaticPersistent
        );
        assert_eq!(
            SchedulerKind::select(
                &key(|f| *f = f.with_mask(MaskKind::Local)),
                &policy
            ),
            SchedulerKind::DynamicPersistent
        );
    }

    #[test]
    fn test_policy_can_keep_persistent_scheduler() {
        let policy = SchedulerPolicy {
            single_tile_for_split: false,
            ..SchedulerPolicy::default()
        };
        assert_eq!(
            SchedulerKind::select(&key(|f| f.split = true), &policy),
            SchedulerKind::StaticPersistent
        );
    }

    #[test]
    fn test_decode() {
        let args = SchedulerArgs {
            num_blocks_m: 3,
            num_heads: 2,
            batch_size: 2,
            num_splits: 2,
            qheads_per_kvhead: 1,
            seqlen_q: 300,
            block_m: 128,
            pack_gqa: false,
            reverse_blocks: false,
            num_workers: 4,
        };
        assert_eq!(args.total_tiles(), 24);
        let tile = args.decode(3 * (2 * 2 + 2 + 1) + 1);
        assert_eq!(
            (tile.block, tile.head, tile.split, tile.batch),
            (1, 1, 1, 1)
        );
    }
}
