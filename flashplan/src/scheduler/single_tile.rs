use super::{SchedulerArgs, SchedulerKind, TileScheduler, WorkTile};

/// One tile per launched compute unit, no shared state.
#[derive(Debug)]
pub struct SingleTileScheduler {
    args: SchedulerArgs,
    varlen_rows: Option<Vec<usize>>,
}

impl SingleTileScheduler {
    pub fn new(
        args: SchedulerArgs,
        varlen_rows: Option<Vec<usize>>,
    ) -> Self {
        Self {
            args,
            varlen_rows,
        }
    }
}

impl TileScheduler for SingleTileScheduler {
    fn kind(&self) -> SchedulerKind {
        SchedulerKind::SingleTile
    }

    fn grid_size(&self) -> usize {
        self.args.total_tiles()
    }

    fn initial_work(
        &self,
        worker: usize,
    ) -> Option<WorkTile> {
        if worker >= self.grid_size() {
            return None;
        }
        let tile = self.args.decode(worker);
        // The grid is sized for the longest row; shorter rows leave idle
        // trailing tiles.
        if let Some(rows) = &self.varlen_rows {
            let rows = self.args.rows_per_sequence(rows[tile.batch]);
            if tile.block * self.args.block_m >= rows {
                return None;
            }
        }
        Some(tile)
    }

    fn next_work(
        &self,
        _worker: usize,
        _current: &WorkTile,
    ) -> Option<WorkTile> {
        None
    }
}
