use super::AccumLayout;
use crate::{
    config::{BackwardParams, Dropout},
    dispatch::BackwardTileConfig,
    error::{ConfigurationError, ContractError, Result},
    mask::AttentionMask,
    plan::forward::check_dropout,
    problem::{ProblemDescriptor, round_up},
    scheduler::{SchedulerArgs, SchedulerKind},
    tensor::TensorLayout,
};

/// Everything a backward launch needs besides the tensor data.
#[derive(Debug, Clone)]
pub struct BackwardSetup<'a> {
    pub problem: ProblemDescriptor,
    pub params: &'a BackwardParams,
    pub q: TensorLayout,
    pub k: TensorLayout,
    pub v: TensorLayout,
    pub out: TensorLayout,
    pub num_workers: usize,
}

/// Immutable argument bundle of one backward launch. Work is cut into key
/// tiles `(n_block, head, batch)`; query gradients of one key tile are
/// spread over every query tile of its row and meet in `dq_accum`.
#[derive(Debug, Clone)]
pub struct BackwardPlan {
    pub problem: ProblemDescriptor,
    pub tile: BackwardTileConfig,
    pub mask: AttentionMask,
    pub softmax_scale: f32,
    pub softcap: f32,
    pub dropout: Option<Dropout>,
    pub deterministic: bool,
    pub q: TensorLayout,
    pub k: TensorLayout,
    pub v: TensorLayout,
    pub out: TensorLayout,
    pub seqlen_q_rounded: usize,
    pub seqlen_k_rounded: usize,
    pub num_blocks_m: usize,
    pub num_blocks_n: usize,
    pub dq_accum: AccumLayout,
    /// Present only when key/value heads are shared by several query heads.
    pub dk_accum: Option<AccumLayout>,
    pub dv_accum: Option<AccumLayout>,
    /// Row layout of `softmax_d` and `softmax_lse_log2`.
    pub softmax_stats: AccumLayout,
    pub dq_semaphore: [usize; 3],
    pub dkv_semaphore: [usize; 3],
    pub scheduler_kind: SchedulerKind,
    pub scheduler: SchedulerArgs,
    pub varlen_rows: Option<Vec<usize>>,
}

impl BackwardPlan {
    pub fn build(setup: BackwardSetup<'_>) -> Result<Self> {
        let BackwardSetup {
            problem,
            params,
            q,
            k,
            v,
            out,
            num_workers,
        } = setup;

        if !cfg!(feature = "backward") {
            return Err(ConfigurationError::FeatureDisabled("backward").into());
        }
        if !problem.data_type.is_half() {
            return Err(ConfigurationError::UnsupportedElementType(
                problem.data_type,
            )
            .into());
        }
        let sequences = &problem.sequences;
        if sequences.has_leftpad_k() {
            return Err(ContractError::Invalid(
                "leftpad_k is not supported in backward".to_string(),
            )
            .into());
        }
        let mask = AttentionMask::new(
            params.is_causal,
            params.window_size_left,
            params.window_size_right,
            params.sink_token_length,
            problem.seqlen_q,
            problem.seqlen_k,
        )?;
        let dropout = check_dropout(params.dropout)?;

        let head_dim = problem.head_dim;
        let tile = BackwardTileConfig::new(
            head_dim.head_size_rounded,
            params.softcap > 0.0,
        );
        let seqlen_q_rounded = round_up(problem.seqlen_q, tile.block_m);
        let seqlen_k_rounded = round_up(problem.seqlen_k, tile.block_n);
        let num_blocks_m = problem.seqlen_q.div_ceil(tile.block_m);
        let num_blocks_n = problem.seqlen_k.div_ceil(tile.block_n);

        let width = head_dim.head_size_rounded;
        let grouped = problem.num_heads != problem.num_heads_k;
        let (dq_accum, softmax_stats) = if sequences.is_varlen_q() {
            let cu = cumulative(sequences.rows().iter().map(|row| row.q_offset), problem.total_q);
            (
                AccumLayout::ragged(&cu, problem.num_heads, problem.total_q, tile.block_m, width),
                AccumLayout::ragged(&cu, problem.num_heads, problem.total_q, tile.block_m, 1),
            )
        } else {
            (
                AccumLayout::fixed(problem.batch_size, problem.num_heads, seqlen_q_rounded, width),
                AccumLayout::fixed(problem.batch_size, problem.num_heads, seqlen_q_rounded, 1),
            )
        };
        let dkv_accum = grouped.then(|| {
            if sequences.is_varlen_k() {
                let cu = cumulative(
                    sequences.rows().iter().map(|row| row.k_offset),
                    problem.total_k,
                );
                AccumLayout::ragged(&cu, problem.num_heads_k, problem.total_k, tile.block_n, width)
            } else {
                AccumLayout::fixed(
                    problem.batch_size,
                    problem.num_heads_k,
                    seqlen_k_rounded,
                    width,
                )
            }
        });

        let scheduler_kind = if sequences.is_varlen() {
            SchedulerKind::VarlenDynamicPersistent
        } else if mask.kind.is_masked() {
            SchedulerKind::DynamicPersistent
        } else {
            SchedulerKind::StaticPersistent
        };
        // Tiles must be visited with the key block innermost, then the
        // head, then the batch row, so ordered accumulation never waits on
        // a tile that was handed out later.
        let scheduler = SchedulerArgs {
            num_blocks_m: num_blocks_n,
            num_heads: problem.num_heads,
            batch_size: problem.batch_size,
            num_splits: 1,
            qheads_per_kvhead: problem.qheads_per_kvhead(),
            seqlen_q: problem.seqlen_k,
            block_m: tile.block_n,
            pack_gqa: false,
            reverse_blocks: false,
            num_workers,
        };
        let varlen_rows = sequences
            .is_varlen()
            .then(|| sequences.rows().iter().map(|row| row.k_len).collect());

        log::debug!(
            "backward plan: tile={}x{} scheduler={:?} deterministic={} grouped={}",
            tile.block_m,
            tile.block_n,
            scheduler_kind,
            params.deterministic,
            grouped
        );

        Ok(Self {
            tile,
            mask,
            softmax_scale: params.softmax_scale,
            softcap: params.softcap,
            dropout,
            deterministic: params.deterministic,
            q,
            k,
            v,
            out,
            seqlen_q_rounded,
            seqlen_k_rounded,
            num_blocks_m,
            num_blocks_n,
            dq_accum,
            dk_accum: dkv_accum.clone(),
            dv_accum: dkv_accum,
            softmax_stats,
            dq_semaphore: [num_blocks_m, problem.batch_size, problem.num_heads],
            dkv_semaphore: [num_blocks_n, problem.batch_size, problem.num_heads_k],
            scheduler_kind,
            scheduler,
            varlen_rows,
            problem,
        })
    }

    pub fn is_grouped(&self) -> bool {
        self.dk_accum.is_some()
    }

    pub fn num_dq_cells(&self) -> usize {
        self.dq_semaphore.iter().product()
    }

    pub fn num_dkv_cells(&self) -> usize {
        self.dkv_semaphore.iter().product()
    }

    /// Ordering cell of query block `m_block` of `(batch, head)`.
    pub fn dq_cell(
        &self,
        m_block: usize,
        batch: usize,
        head: usize,
    ) -> usize {
        (m_block * self.dq_semaphore[1] + batch) * self.dq_semaphore[2] + head
    }

    /// Ordering cell of key block `n_block` of `(batch, kv_head)`.
    pub fn dkv_cell(
        &self,
        n_block: usize,
        batch: usize,
        kv_head: usize,
    ) -> usize {
        (n_block * self.dkv_semaphore[1] + batch) * self.dkv_semaphore[2]
            + kv_head
    }
}

fn cumulative(
    offsets: impl Iterator<Item = usize>,
    total: usize,
) -> Vec<usize> {
    offsets.chain(std::iter::once(total)).collect()
}
