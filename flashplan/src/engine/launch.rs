use std::sync::atomic::{AtomicBool, Ordering};

use crate::{
    error::{AccumulationError, AttentionError, MainloopError, Result},
    scheduler::{TileScheduler, WorkTile},
};

/// Runs `abort` if the owning worker unwinds, so no other worker keeps
/// waiting on a contribution that will never arrive.
struct AbortOnUnwind<'a> {
    aborted: &'a AtomicBool,
    abort: &'a (dyn Fn() + Sync),
}

impl Drop for AbortOnUnwind<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.aborted.store(true, Ordering::Release);
            (self.abort)();
        }
    }
}

fn is_secondary(error: &AttentionError) -> bool {
    matches!(
        error,
        AttentionError::Mainloop(MainloopError::Aborted)
            | AttentionError::Accumulation(AccumulationError::Aborted {
                ..
            })
    )
}

/// Drains `scheduler` and returns what every tile produced.
///
/// The scheduler's workers are spread over at most `num_threads` scoped
/// threads; a thread owning several workers drains them one after the
/// other.
///
/// The first failing tile stops the launch: remaining workers stop
/// claiming tiles and `abort` releases anything blocked on shared state.
/// The reported error is the failure that caused the abort, not one of
/// the aborted waits it triggered.
pub(crate) fn run_tiles<R, F>(
    scheduler: &dyn TileScheduler,
    num_threads: usize,
    abort: &(dyn Fn() + Sync),
    run: F,
) -> Result<Vec<(WorkTile, R)>>
where
    R: Send,
    F: Fn(&WorkTile) -> Result<R> + Sync,
{
    let aborted = AtomicBool::new(false);
    let grid = scheduler.grid_size();
    let num_threads = num_threads.clamp(1, grid.max(1));
    log::trace!(
        "launching {:?}: grid={} threads={}",
        scheduler.kind(),
        grid,
        num_threads
    );

    let outcomes: Vec<Result<Vec<(WorkTile, R)>>> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..num_threads)
            .map(|thread| {
                let aborted = &aborted;
                let run = &run;
                scope.spawn(move || {
                    let _guard = AbortOnUnwind {
                        aborted,
                        abort,
                    };
                    let mut produced = Vec::new();
                    for worker in (thread..grid).step_by(num_threads) {
                        let mut work = scheduler.initial_work(worker);
                        while let Some(tile) = work {
                            if aborted.load(Ordering::Acquire) {
                                return Err(MainloopError::Aborted.into());
                            }
                            match run(&tile) {
                                Ok(result) => produced.push((tile, result)),
                                Err(error) => {
                                    aborted.store(true, Ordering::Release);
                                    abort();
                                    return Err(error);
                                },
                            }
                            work = scheduler.next_work(worker, &tile);
                        }
                    }
                    Ok(produced)
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| {
                handle.join().unwrap_or_else(|_| {
                    Err(MainloopError::Tile("worker panicked".to_string()).into())
                })
            })
            .collect()
    });

    let mut produced = Vec::new();
    let mut first_error: Option<AttentionError> = None;
    for outcome in outcomes {
        match outcome {
            Ok(results) => produced.extend(results),
            Err(error) => {
                let replace = match &first_error {
                    None => true,
                    Some(current) => is_secondary(current) && !is_secondary(&error),
                };
                if replace {
                    first_error = Some(error);
                }
            },
        }
    }
    match first_error {
        Some(error) => Err(error),
        None => Ok(produced),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        accumulate::{AccumulationOrder, AccumulationTurnstile},
        scheduler::{
            DynamicPersistentTileScheduler, SchedulerArgs, SingleTileScheduler,
        },
    };

    fn args(tiles: usize) -> SchedulerArgs {
        SchedulerArgs {
            num_blocks_m: tiles,
            num_heads: 1,
            batch_size: 1,
            num_splits: 1,
            qheads_per_kvhead: 1,
            seqlen_q: tiles,
            block_m: 1,
            pack_gqa: false,
            reverse_blocks: false,
            num_workers: 4,
        }
    }

    #[test]
    fn test_every_tile_runs_once() {
        let scheduler = DynamicPersistentTileScheduler::new(args(37));
        let mut results = run_tiles(&scheduler, 4, &|| {}, |tile| Ok(tile.block)).unwrap();
        results.sort_by_key(|(tile, _)| tile.tile_idx);
        assert_eq!(
            results.iter().map(|(_, block)| *block).collect::<Vec<_>>(),
            (0..37).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_failure_releases_waiters() {
        let scheduler = DynamicPersistentTileScheduler::new(args(16));
        let turnstile =
            AccumulationTurnstile::new(1, AccumulationOrder::Deterministic);
        let abort = || turnstile.abort();
        let result = run_tiles(&scheduler, 4, &abort, |tile| {
            if tile.block == 3 {
                return Err(MainloopError::PageOutOfRange {
                    page: -1,
                    num_pages: 2,
                }
                .into());
            }
            // Tile 3 never takes its turn, so later tiles block until the
            // launch is aborted.
            turnstile.with_turn(0, tile.block, || ())?;
            Ok(())
        });
        assert_eq!(
            result.unwrap_err(),
            AttentionError::Mainloop(MainloopError::PageOutOfRange {
                page: -1,
                num_pages: 2,
            })
        );
    }

    #[test]
    fn test_single_tile_grid_shares_threads() {
        let scheduler = SingleTileScheduler::new(args(50), None);
        assert_eq!(scheduler.grid_size(), 50);
        let results = run_tiles(&scheduler, 3, &|| {}, |_| {
            Ok(std::thread::current().id())
        })
        .unwrap();
        assert_eq!(results.len(), 50);
        let threads: std::collections::HashSet<_> =
            results.iter().map(|(_, id)| *id).collect();
        assert!(threads.len() <= 3);
    }
}
