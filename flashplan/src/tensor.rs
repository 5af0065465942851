use ndarray::{ArrayView3, ArrayView4, ArrayViewD, Axis};

use crate::{ArrayElement, error::ContractError};

/// Shape and element strides of an attention operand in
/// `(seq, dim, heads, batch)` order. A batch stride of 0 marks ragged
/// storage where rows are located through per-row offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TensorLayout {
    pub shape: [usize; 4],
    pub stride: [usize; 4],
}

impl TensorLayout {
    pub fn row_major(
        batch: usize,
        seq: usize,
        heads: usize,
        dim: usize,
    ) -> Self {
        Self {
            shape: [seq, dim, heads, batch],
            stride: [heads * dim, 1, dim, seq * heads * dim],
        }
    }

    pub fn ragged(
        total: usize,
        heads: usize,
        dim: usize,
    ) -> Self {
        Self {
            shape: [total, dim, heads, 1],
            stride: [heads * dim, 1, dim, 0],
        }
    }

    /// Sequence-contiguous layout (column-major V).
    pub fn seq_major(
        batch: usize,
        seq: usize,
        heads: usize,
        dim: usize,
    ) -> Self {
        Self {
            shape: [seq, dim, heads, batch],
            stride: [1, seq, seq * dim, heads * seq * dim],
        }
    }

    pub fn seq(&self) -> usize {
        self.shape[0]
    }

    pub fn dim(&self) -> usize {
        self.shape[1]
    }

    pub fn heads(&self) -> usize {
        self.shape[2]
    }

    pub fn batch(&self) -> usize {
        self.shape[3]
    }

    pub fn is_ragged(&self) -> bool {
        self.stride[3] == 0
    }

    pub fn is_seq_major(&self) -> bool {
        self.stride[0] == 1 && self.stride[1] != 1
    }

    pub fn num_elements(&self) -> usize {
        self.shape.iter().product()
    }

    /// Element offset of `(row, 0, head, batch)`.
    pub fn offset(
        &self,
        row: usize,
        head: usize,
        batch: usize,
    ) -> usize {
        row * self.stride[0] + head * self.stride[2] + batch * self.stride[3]
    }
}

/// An operand converted to f32 and zero-padded on the head dimension.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedTensor {
    pub data: Vec<f32>,
    pub layout: TensorLayout,
}

impl StagedTensor {
    pub fn zeros(layout: TensorLayout) -> Self {
        Self {
            data: vec![0.0; layout.num_elements()],
            layout,
        }
    }

    /// Stages a `(batch, seq, heads, dim)` tensor.
    pub fn stage<T: ArrayElement>(
        view: &ArrayView4<'_, T>,
        head_size: usize,
        seq_major: bool,
    ) -> Self {
        let (batch, seq, heads, _) = view.dim();
        let layout = if seq_major {
            TensorLayout::seq_major(batch, seq, heads, head_size)
        } else {
            TensorLayout::row_major(batch, seq, heads, head_size)
        };
        let mut staged = Self::zeros(layout);
        for ((b, s, h, d), value) in view.indexed_iter() {
            let index = layout.offset(s, h, b) + d * layout.stride[1];
            staged.data[index] = value.to_f32_value();
        }
        staged
    }

    /// Stages a `(total, heads, dim)` ragged tensor.
    pub fn stage_ragged<T: ArrayElement>(
        view: &ArrayView3<'_, T>,
        head_size: usize,
    ) -> Self {
        let (total, heads, _) = view.dim();
        let layout = TensorLayout::ragged(total, heads, head_size);
        let mut staged = Self::zeros(layout);
        for ((s, h, d), value) in view.indexed_iter() {
            staged.data[layout.offset(s, h, 0) + d] = value.to_f32_value();
        }
        staged
    }

    pub fn load(
        &self,
        row: usize,
        head: usize,
        batch: usize,
        dst: &mut [f32],
    ) {
        let base = self.layout.offset(row, head, batch);
        let dim_stride = self.layout.stride[1];
        if dim_stride == 1 {
            dst.copy_from_slice(&self.data[base..base + dst.len()]);
        } else {
            for (d, value) in dst.iter_mut().enumerate() {
                *value = self.data[base + d * dim_stride];
            }
        }
    }

    pub fn store(
        &mut self,
        row: usize,
        head: usize,
        batch: usize,
        src: &[f32],
    ) {
        let base = self.layout.offset(row, head, batch);
        let dim_stride = self.layout.stride[1];
        for (d, value) in src.iter().enumerate() {
            self.data[base + d * dim_stride] = *value;
        }
    }
}

/// Checks rank, shape and stride contract of a caller tensor.
pub fn check_tensor<T>(
    name: &'static str,
    view: &ArrayViewD<'_, T>,
    expected: &[usize],
) -> Result<(), ContractError> {
    if view.ndim() != expected.len() {
        return Err(ContractError::Rank {
            name,
            expected: expected.len(),
            actual: view.ndim(),
        });
    }
    if view.shape() != expected {
        return Err(ContractError::Shape {
            name,
            expected: expected.to_vec(),
            actual: view.shape().to_vec(),
        });
    }
    check_last_dim_contiguous(name, view)
}

pub fn check_rank<T>(
    name: &'static str,
    view: &ArrayViewD<'_, T>,
    expected: usize,
) -> Result<(), ContractError> {
    if view.ndim() != expected {
        return Err(ContractError::Rank {
            name,
            expected,
            actual: view.ndim(),
        });
    }
    Ok(())
}

pub fn check_last_dim_contiguous<T>(
    name: &'static str,
    view: &ArrayViewD<'_, T>,
) -> Result<(), ContractError> {
    // Empty arrays report zero strides on every axis.
    if view.is_empty() {
        return Ok(());
    }
    let Some(last) = view.ndim().checked_sub(1) else {
        return Ok(());
    };
    if view.len_of(Axis(last)) > 1 && view.strides()[last] != 1 {
        return Err(ContractError::NonContiguousLastDim {
            name,
        });
    }
    Ok(())
}

/// A `(batch, seq, heads, dim)` V tensor stored sequence-contiguous.
/// Every other stride must be a multiple of 16 elements.
pub fn check_seq_major_v<T>(
    view: &ArrayViewD<'_, T>,
) -> Result<bool, ContractError> {
    if view.is_empty()
        || view.ndim() != 4
        || view.shape()[1] <= 1
        || view.strides()[1] != 1
    {
        return Ok(false);
    }
    for axis in [0, 2, 3] {
        let stride = view.strides()[axis];
        if view.shape()[axis] > 1 && stride.unsigned_abs() % 16 != 0 {
            return Err(ContractError::StrideAlignment {
                name: "v",
                stride: stride.unsigned_abs(),
                divisor: 16,
            });
        }
    }
    Ok(true)
}
