use std::sync::{Mutex, PoisonError};

use crate::error::AccumulationError;

/// f32 accumulation storage split into independently locked cells of
/// `cell_len` values. Cells are allocated on first contribution.
#[derive(Debug)]
pub struct BlockAccumulator {
    cells: Vec<Mutex<Option<Vec<f32>>>>,
    cell_len: usize,
}

impl BlockAccumulator {
    pub fn new(
        num_cells: usize,
        cell_len: usize,
    ) -> Self {
        Self {
            cells: (0..num_cells).map(|_| Mutex::new(None)).collect(),
            cell_len,
        }
    }

    pub fn num_cells(&self) -> usize {
        self.cells.len()
    }

    pub fn cell_len(&self) -> usize {
        self.cell_len
    }

    /// Adds `values` to the first `values.len()` entries of `cell`.
    pub fn add(
        &self,
        cell: usize,
        values: &[f32],
    ) -> Result<(), AccumulationError> {
        let slot = self.cells.get(cell).ok_or(
            AccumulationError::CellOutOfRange {
                cell,
                num_cells: self.cells.len(),
            },
        )?;
        let mut guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
        let data = guard.get_or_insert_with(|| vec![0.0; self.cell_len]);
        for (acc, value) in data.iter_mut().zip(values) {
            *acc += value;
        }
        Ok(())
    }

    /// Consumes the accumulator, yielding every cell (zeros where nothing
    /// was added).
    pub fn into_cells(self) -> Vec<Vec<f32>> {
        let cell_len = self.cell_len;
        self.cells
            .into_iter()
            .map(|slot| {
                slot.into_inner()
                    .unwrap_or_else(PoisonError::into_inner)
                    .unwrap_or_else(|| vec![0.0; cell_len])
            })
            .collect()
    }
}
