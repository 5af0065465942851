use super::{AttentionMask, MaskKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitIndex {
    pub split: usize,
    pub num_splits: usize,
}

impl SplitIndex {
    pub fn unsplit() -> Self {
        Self {
            split: 0,
            num_splits: 1,
        }
    }
}

/// Key blocks a query tile has to visit.
///
/// `[n_block_min, n_block_max)` is the window range of this split; sink
/// blocks `[0, n_block_sink_max)` are visited by split 0 only and never
/// overlap the window range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRange {
    pub n_block_min: usize,
    pub n_block_max: usize,
    pub n_block_sink_max: usize,
}

impl BlockRange {
    /// Key blocks for query rows `[row_begin, row_end)` of one batch row.
    pub fn for_rows(
        mask: &AttentionMask,
        row_begin: usize,
        row_end: usize,
        seqlen_q: usize,
        seqlen_k: usize,
        block_n: usize,
        split: SplitIndex,
    ) -> Self {
        let num_key_blocks = seqlen_k.div_ceil(block_n);
        if row_end <= row_begin || num_key_blocks == 0 {
            return Self::empty();
        }
        let offset = seqlen_k as i64 - seqlen_q as i64;
        let last_row = row_end as i64 - 1;

        let mut n_block_max = num_key_blocks;
        let right = match mask.kind {
            MaskKind::None => None,
            MaskKind::Causal => Some(0),
            MaskKind::Local => Some(mask.window_right),
        };
        if let Some(right) = right {
            let last_col = last_row + offset + right;
            let blocks = if last_col < 0 {
                0
            } else {
                (last_col as usize + 1).div_ceil(block_n)
            };
            n_block_max = n_block_max.min(blocks);
        }

        let mut n_block_min = 0;
        if mask.kind == MaskKind::Local {
            let first_col = row_begin as i64 + offset - mask.window_left;
            if first_col > 0 {
                n_block_min = first_col as usize / block_n;
            }
        }

        let mut n_block_sink_max = 0;
        if split.split == 0 && mask.sink_token_length > 0 {
            n_block_sink_max = mask
                .sink_token_length
                .div_ceil(block_n)
                .min(n_block_min)
                .min(num_key_blocks);
        }

        if split.num_splits > 1 {
            let total = n_block_max.saturating_sub(n_block_min);
            let per_split = total.div_ceil(split.num_splits);
            let begin = n_block_min + split.split * per_split;
            n_block_min = begin.min(n_block_max);
            n_block_max = n_block_max.min(begin + per_split);
        }

        Self {
            n_block_min,
            n_block_max: n_block_max.max(n_block_min),
            n_block_sink_max,
        }
    }

    pub fn empty() -> Self {
        Self {
            n_block_min: 0,
            n_block_max: 0,
            n_block_sink_max: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.n_block_max <= self.n_block_min && self.n_block_sink_max == 0
    }

    /// Block indices in visiting order: sink blocks, then the window range.
    pub fn blocks(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.n_block_sink_max).chain(self.n_block_min..self.n_block_max)
    }
}
