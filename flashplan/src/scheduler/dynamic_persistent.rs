use super::{
    SchedulerArgs, SchedulerKind, TileCounter, TileScheduler, WorkTile,
};

/// Work stealing through a shared counter: a worker starts at its own index
/// and then claims `G + counter++` until the claim runs past the last tile.
#[derive(Debug)]
pub struct DynamicPersistentTileScheduler {
    args: SchedulerArgs,
    grid: usize,
    counter: TileCounter,
}

impl DynamicPersistentTileScheduler {
    pub fn new(args: SchedulerArgs) -> Self {
        Self {
            grid: args.num_workers.min(args.total_tiles()),
            args,
            counter: TileCounter::new(),
        }
    }

    #[cfg(test)]
    fn counter(&self) -> &TileCounter {
        &self.counter
    }

    fn tile(
        &self,
        tile_idx: usize,
    ) -> Option<WorkTile> {
        (tile_idx < self.args.total_tiles()).then(|| self.args.decode(tile_idx))
    }
}

impl TileScheduler for DynamicPersistentTileScheduler {
    fn kind(&self) -> SchedulerKind {
        SchedulerKind::DynamicPersistent
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
        _current: &WorkTile,
    ) -> Option<WorkTile> {
        self.tile(self.grid + self.counter.claim())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::test_utils::{assert_exactly_once, drain};

    fn args(num_workers: usize) -> SchedulerArgs {
        SchedulerArgs {
            num_blocks_m: 6,
            num_heads: 4,
            batch_size: 3,
            num_splits: 1,
            qheads_per_kvhead: 1,
            seqlen_q: 700,
            block_m: 128,
            pack_gqa: false,
            reverse_blocks: true,
            num_workers,
        }
    }

    #[test]
    fn test_every_tile_claimed_once() {
        for num_workers in [1, 3, 16, 200] {
            let scheduler = DynamicPersistentTileScheduler::new(args(num_workers));
            assert_exactly_once(&drain(&scheduler), 72);
        }
    }

    #[test]
    fn test_heavy_blocks_first() {
        let scheduler = DynamicPersistentTileScheduler::new(args(2));
        assert_eq!(scheduler.initial_work(0).unwrap().block, 5);
        assert_eq!(scheduler.initial_work(1).unwrap().block, 4);
    }

    #[test]
    fn test_out_of_range_claims_end_work() {
        let scheduler = DynamicPersistentTileScheduler::new(args(4));
        let tiles = drain(&scheduler);
        assert_eq!(tiles.len(), 72);
        // Every worker makes one final claim that lands past the end.
        assert_eq!(scheduler.counter().claimed(), 72 - 4 + 4);
    }
}
