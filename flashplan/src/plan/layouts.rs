/// Output destination in `(seq, dim, heads, batch, split)` order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLayout {
    pub shape: [usize; 5],
    pub stride: [usize; 5],
}

impl OutputLayout {
    /// `(batch, seq, heads, dim)` output, or `(total, heads, dim)` when
    /// `batch` is `None`.
    pub fn direct(
        batch: Option<usize>,
        seq: usize,
        heads: usize,
        dim: usize,
    ) -> Self {
        let batch_size = batch.unwrap_or(1);
        Self {
            shape: [seq, dim, heads, batch_size, 1],
            stride: [
                heads * dim,
                1,
                dim,
                if batch.is_some() {
                    seq * heads * dim
                } else {
                    0
                },
                0,
            ],
        }
    }

    /// `(splits, batch, heads, seq, dim)` accumulator, or
    /// `(splits, heads, total, dim)` when `batch` is `None`.
    pub fn split_accum(
        num_splits: usize,
        batch: Option<usize>,
        seq: usize,
        heads: usize,
        dim: usize,
    ) -> Self {
        let batch_size = batch.unwrap_or(1);
        Self {
            shape: [seq, dim, heads, batch_size, num_splits],
            stride: [
                dim,
                1,
                seq * dim,
                if batch.is_some() {
                    heads * seq * dim
                } else {
                    0
                },
                batch_size * heads * seq * dim,
            ],
        }
    }

    pub fn num_elements(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn offset(
        &self,
        row: usize,
        head: usize,
        batch: usize,
        split: usize,
    ) -> usize {
        row * self.stride[0]
            + head * self.stride[2]
            + batch * self.stride[3]
            + split * self.stride[4]
    }
}

/// Log-sum-exp destination in `(row, head, batch, split)` order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LseLayout {
    pub len: usize,
    pub stride: [usize; 4],
}

impl LseLayout {
    /// `(splits, batch, heads, seq)`, or `(splits, heads, total)` when
    /// `batch` is `None`. One split is the plain `(batch, heads, seq)` lse.
    pub fn new(
        num_splits: usize,
        batch: Option<usize>,
        seq: usize,
        heads: usize,
    ) -> Self {
        let batch_size = batch.unwrap_or(1);
        Self {
            len: num_splits * batch_size * heads * seq,
            stride: [
                1,
                seq,
                if batch.is_some() {
                    heads * seq
                } else {
                    0
                },
                batch_size * heads * seq,
            ],
        }
    }

    pub fn offset(
        &self,
        row: usize,
        head: usize,
        batch: usize,
        split: usize,
    ) -> usize {
        row * self.stride[0]
            + head * self.stride[1]
            + batch * self.stride[2]
            + split * self.stride[3]
    }
}

/// Row addressing of a float32 gradient accumulator padded per tile.
///
/// Fixed-length problems use `(batch, heads, seq_rounded, width)`; ragged
/// problems use `(heads, total_padded_rounded, width)` where every batch
/// row starts at a tile-aligned padded offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccumLayout {
    pub shape: Vec<usize>,
    pub width: usize,
    pub head_stride_rows: usize,
    pub batch_stride_rows: usize,
    pub row_offsets: Vec<usize>,
}

impl AccumLayout {
    pub fn fixed(
        batch: usize,
        heads: usize,
        seq_rounded: usize,
        width: usize,
    ) -> Self {
        Self {
            shape: vec![batch, heads, seq_rounded, width],
            width,
            head_stride_rows: seq_rounded,
            batch_stride_rows: heads * seq_rounded,
            row_offsets: vec![0; batch],
        }
    }

    pub fn ragged(
        cu_seqlens: &[usize],
        heads: usize,
        total: usize,
        block: usize,
        width: usize,
    ) -> Self {
        let batch = cu_seqlens.len().saturating_sub(1);
        let total_padded_rounded =
            (total + batch * block).div_ceil(block) * block;
        let row_offsets = (0..batch)
            .map(|b| (cu_seqlens[b] + b * block) / block * block)
            .collect();
        Self {
            shape: vec![heads, total_padded_rounded, width],
            width,
            head_stride_rows: total_padded_rounded,
            batch_stride_rows: 0,
            row_offsets,
        }
    }

    pub fn num_rows(&self) -> usize {
        self.shape[..self.shape.len() - 1].iter().product()
    }

    pub fn row_index(
        &self,
        batch: usize,
        head: usize,
        row: usize,
    ) -> usize {
        batch * self.batch_stride_rows
            + head * self.head_stride_rows
            + self.row_offsets[batch]
            + row
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_accum_strides() {
        let layout = OutputLayout::split_accum(3, Some(2), 5, 4, 8);
        assert_eq!(layout.num_elements(), 3 * 2 * 4 * 5 * 8);
        assert_eq!(layout.offset(1, 2, 1, 2), 8 + 2 * 40 + 160 + 2 * 320);
        let lse = LseLayout::new(3, Some(2), 5, 4);
        assert_eq!(lse.offset(1, 2, 1, 2), 1 + 10 + 20 + 80);
    }

    #[test]
    fn test_ragged_accum_offsets() {
        let layout = AccumLayout::ragged(&[0, 1, 6, 9], 2, 9, 4, 8);
        // 9 rows + 3 * 4 padding rounded to 4.
        assert_eq!(layout.shape, vec![2, 24, 8]);
        assert_eq!(layout.row_offsets, vec![0, 4, 12]);
        assert_eq!(layout.row_index(2, 1, 2), 24 + 12 + 2);
    }
}
