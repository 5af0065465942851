use super::{SchedulerArgs, SchedulerKind, TileScheduler, WorkTile};

/// Worker `w` processes tiles `w, w + G, w + 2G, ...`.
#[derive(Debug)]
pub struct StaticPersistentTileScheduler {
    args: SchedulerArgs,
    grid: usize,
}

impl StaticPersistentTileScheduler {
    pub fn new(args: SchedulerArgs) -> Self {
        Self {
            grid: args.num_workers.min(args.total_tiles()),
            args,
        }
    }

    fn tile(
        &self,
        tile_idx: usize,
    ) -> Option<WorkTile> {
        (tile_idx < self.args.total_tiles()).then(|| self.args.decode(tile_idx))
    }
}

impl TileScheduler for StaticPersistentTileScheduler {
    fn kind(&self) -> SchedulerKind {
        SchedulerKind::StaticPersistent
    }

    fn grid_size(&self) -> usize {
        self.grid
    }

    fn initial_work(
        &self,
        worker: usize,
    ) -> Option<WorkTile> {
        self.tile(worker)
    }

    fn next_work(
        &self,
        _worker: usize,
        current: &WorkTile,
    ) -> Option<WorkTile> {
        self.tile(current.tile_idx + self.grid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::test_utils::{assert_exactly_once, drain};

    #[test]
    fn test_strided_assignment() {
        let scheduler = StaticPersistentTileScheduler::new(SchedulerArgs {
            num_blocks_m: 5,
            num_heads: 4,
            batch_size: 2,
            num_splits: 1,
            qheads_per_kvhead: 1,
            seqlen_q: 600,
            block_m: 128,
            pack_gqa: false,
            reverse_blocks: false,
            num_workers: 7,
        });
        assert_eq!(scheduler.grid_size(), 7);
        let first = scheduler.initial_work(3).unwrap();
        let second = scheduler.next_work(3, &first).unwrap();
        assert_eq!(second.tile_idx, 10);
        assert_exactly_once(&drain(&scheduler), 40);
    }

    #[test]
    fn test_grid_never_exceeds_tiles() {
        let scheduler = StaticPersistentTileScheduler::new(SchedulerArgs {
            num_blocks_m: 1,
            num_heads: 1,
            batch_size: 2,
            num_splits: 1,
            qheads_per_kvhead: 1,
            seqlen_q: 1,
            block_m: 128,
            pack_gqa: false,
            reverse_blocks: false,
            num_workers: 64,
        });
        assert_eq!(scheduler.grid_size(), 2);
    }
}
