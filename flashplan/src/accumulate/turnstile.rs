use std::sync::{
    Condvar, Mutex, PoisonError,
    atomic::{AtomicBool, Ordering},
};

use crate::error::AccumulationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccumulationOrder {
    /// Contributions to a cell are applied in ordinal order, so results are
    /// bit-identical across runs.
    Deterministic,
    /// Contributions are serialized but applied in arrival order.
    Arrival,
}

#[derive(Debug, Default)]
struct Cell {
    ticket: Mutex<usize>,
    turn: Condvar,
}

/// One ticket counter per accumulation cell.
#[derive(Debug)]
pub struct AccumulationTurnstile {
    cells: Vec<Cell>,
    order: AccumulationOrder,
    aborted: AtomicBool,
}

impl AccumulationTurnstile {
    pub fn new(
        num_cells: usize,
        order: AccumulationOrder,
    ) -> Self {
        Self {
            cells: (0..num_cells).map(|_| Cell::default()).collect(),
            order,
            aborted: AtomicBool::new(false),
        }
    }

    pub fn order(&self) -> AccumulationOrder {
        self.order
    }

    pub fn num_cells(&self) -> usize {
        self.cells.len()
    }

    /// Runs `update` as contribution `ordinal` of `cell` and advances the
    /// cell's ticket. In deterministic order this blocks until every lower
    /// ordinal of the cell has passed.
    pub fn with_turn<R>(
        &self,
        cell: usize,
        ordinal: usize,
        update: impl FnOnce() -> R,
    ) -> Result<R, AccumulationError> {
        let slot = self.cells.get(cell).ok_or(
            AccumulationError::CellOutOfRange {
                cell,
                num_cells: self.cells.len(),
            },
        )?;
        let mut ticket =
            slot.ticket.lock().unwrap_or_else(PoisonError::into_inner);
        if self.order == AccumulationOrder::Deterministic {
            while *ticket != ordinal {
                if self.is_aborted() {
                    return Err(AccumulationError::Aborted {
                        cell,
                    });
                }
                ticket = slot
                    .turn
                    .wait(ticket)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        }
        if self.is_aborted() {
            return Err(AccumulationError::Aborted {
                cell,
            });
        }
        let result = update();
        *ticket += 1;
        slot.turn.notify_all();
        Ok(result)
    }

    /// Fails every current and future wait.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
        for slot in &self.cells {
            let _guard =
                slot.ticket.lock().unwrap_or_else(PoisonError::into_inner);
            slot.turn.notify_all();
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// Contributions applied to `cell` so far.
    #[cfg(test)]
    fn ticket(
        &self,
        cell: usize,
    ) -> usize {
        self.cells.get(cell).map_or(0, |slot| {
            *slot.ticket.lock().unwrap_or_else(PoisonError::into_inner)
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[test]
    fn test_deterministic_order_is_ordinal_order() {
        let turnstile =
            AccumulationTurnstile::new(1, AccumulationOrder::Deterministic);
        let log = Mutex::new(Vec::new());
        std::thread::scope(|scope| {
            for ordinal in (0..8).rev() {
                let turnstile = &turnstile;
                let log = &log;
                scope.spawn(move || {
                    turnstile
                        .with_turn(0, ordinal, || {
                            log.lock().unwrap().push(ordinal)
                        })
                        .unwrap();
                });
            }
        });
        assert_eq!(log.into_inner().unwrap(), (0..8).collect::<Vec<_>>());
        assert_eq!(turnstile.ticket(0), 8);
    }

    #[test]
    fn test_arrival_order_does_not_wait() {
        let turnstile = AccumulationTurnstile::new(2, AccumulationOrder::Arrival);
        assert_eq!(turnstile.with_turn(1, 5, || 7), Ok(7));
        assert_eq!(turnstile.ticket(1), 1);
        assert_eq!(turnstile.ticket(0), 0);
    }

    #[test]
    fn test_abort_wakes_waiters() {
        let turnstile =
            AccumulationTurnstile::new(1, AccumulationOrder::Deterministic);
        std::thread::scope(|scope| {
            let waiter = scope.spawn(|| turnstile.with_turn(0, 3, || ()));
            std::thread::sleep(std::time::Duration::from_millis(20));
            turnstile.abort();
            assert_eq!(
                waiter.join().unwrap(),
                Err(AccumulationError::Aborted {
                    cell: 0,
                })
            );
        });
    }

    #[test]
    fn test_out_of_range_cell() {
        let turnstile =
            AccumulationTurnstile::new(1, AccumulationOrder::Deterministic);
        assert_eq!(
            turnstile.with_turn(4, 0, || ()),
            Err(AccumulationError::CellOutOfRange {
                cell: 4,
                num_cells: 1,
            })
        );
        turnstile.with_turn(0, 0, || ()).unwrap();
        assert_eq!(turnstile.ticket(0), 1);
    }
}
