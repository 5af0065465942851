use super::{
    SchedulerArgs, SchedulerKind, TileCounter, TileScheduler, WorkTile,
};

/// Dynamic persistent scheduling over ragged rows. The tile count is only
/// known from the per-row lengths, so linear indices are decoded through a
/// prefix sum of tiles per batch row.
#[derive(Debug)]
pub struct VarlenDynamicPersistentTileScheduler {
    args: SchedulerArgs,
    blocks_per_row: Vec<usize>,
    tile_prefix: Vec<usize>,
    grid: usize,
    counter: TileCounter,
}

impl VarlenDynamicPersistentTileScheduler {
    pub fn new(
        args: SchedulerArgs,
        row_lengths: Vec<usize>,
    ) -> Self {
        let tiles_per_block = args.num_heads * args.num_splits;
        let blocks_per_row: Vec<usize> = row_lengths
            .iter()
            .map(|&len| args.rows_per_sequence(len).div_ceil(args.block_m))
            .collect();
        let mut tile_prefix = Vec::with_capacity(blocks_per_row.len() + 1);
        tile_prefix.push(0);
        for blocks in &blocks_per_row {
            let last = tile_prefix[tile_prefix.len() - 1];
            tile_prefix.push(last + blocks * tiles_per_block);
        }
        let total = tile_prefix[tile_prefix.len() - 1];
        Self {
            grid: args.num_workers.min(total),
            args,
            blocks_per_row,
            tile_prefix,
            counter: TileCounter::new(),
        }
    }

    pub fn total_tiles(&self) -> usize {
        self.tile_prefix[self.tile_prefix.len() - 1]
    }

    fn tile(
        &self,
        tile_idx: usize,
    ) -> Option<WorkTile> {
        if tile_idx >= self.total_tiles() {
            return None;
        }
        let batch = self.tile_prefix.partition_point(|&start| start <= tile_idx) - 1;
        let local = tile_idx - self.tile_prefix[batch];
        let num_blocks = self.blocks_per_row[batch];
        let block = local % num_blocks;
        let head_split = local / num_blocks;
        Some(WorkTile {
            tile_idx,
            block: if self.args.reverse_blocks {
                num_blocks - 1 - block
            } else {
                block
            },
            head: head_split / self.args.num_splits,
            batch,
            split: head_split % self.args.num_splits,
        })
    }
}

impl TileScheduler for VarlenDynamicPersistentTileScheduler {
    fn kind(&self) -> SchedulerKind {
        SchedulerKind::VarlenDynamicPersistent
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
