use ndarray::{ArrayD, ArrayViewD, Ix3, Ix4, IxDyn};

use super::{AttentionEngine, VarlenArgs, launch::run_tiles};
use crate::{
    accumulate::{AccumulationOrder, AccumulationTurnstile, BlockAccumulator},
    backends::{AttentionMainloop, BackwardInputs, BlockContribution},
    config::BackwardParams,
    data_type::AttentionElement,
    error::{ContractError, MainloopError, Result},
    plan::{AccumLayout, BackwardPlan, BackwardSetup},
    problem::{ProblemDescriptor, SequenceSpec},
    scheduler::build_scheduler,
    tensor::{StagedTensor, TensorLayout, check_rank, check_tensor},
};

#[derive(Debug, Clone, PartialEq)]
pub struct BackwardOutput<T> {
    /// Shaped like `q`.
    pub dq: ArrayD<T>,
    /// Shaped like `k`.
    pub dk: ArrayD<T>,
    /// Shaped like `v`.
    pub dv: ArrayD<T>,
    /// Row sums of `dO ∘ O`, `(batch, num_heads, seqlen_q_rounded)` or
    /// `(num_heads, total_q_padded)`.
    pub softmax_d: ArrayD<f32>,
    /// Forward log-sum-exp in base 2, laid out like `softmax_d`; padding
    /// rows hold `+inf`.
    pub softmax_lse_log2: ArrayD<f32>,
    pub dq_accum: ArrayD<f32>,
    /// Present only when key/value heads are grouped.
    pub dk_accum: Option<ArrayD<f32>>,
    pub dv_accum: Option<ArrayD<f32>>,
}

fn to_array(
    shape: &[usize],
    data: Vec<f32>,
) -> Result<ArrayD<f32>> {
    ArrayD::from_shape_vec(IxDyn(shape), data)
        .map_err(|err| ContractError::Invalid(err.to_string()).into())
}

fn narrow<T: AttentionElement>(
    shape: &[usize],
    data: &[f32],
) -> Result<ArrayD<T>> {
    ArrayD::from_shape_vec(
        IxDyn(shape),
        data.iter().map(|&value| T::from_f32_value(value)).collect(),
    )
    .map_err(|err| ContractError::Invalid(err.to_string()).into())
}

fn stage<T: AttentionElement>(
    view: &ArrayViewD<'_, T>,
    layout: &TensorLayout,
) -> Result<StagedTensor> {
    let head_size = layout.dim();
    let staged = if layout.is_ragged() {
        let view = view
            .view()
            .into_dimensionality::<Ix3>()
            .map_err(|err| ContractError::Invalid(err.to_string()))?;
        StagedTensor::stage_ragged(&view, head_size)
    } else {
        let view = view
            .view()
            .into_dimensionality::<Ix4>()
            .map_err(|err| ContractError::Invalid(err.to_string()))?;
        StagedTensor::stage(&view, head_size, false)
    };
    Ok(staged)
}

/// Scatters accumulator cells of `block` rows into the dense accumulator
/// described by `layout`. `cell_of(block, batch, head)` names the cell and
/// `lengths` holds the valid rows of each batch row.
fn gather_cells(
    cells: &[Vec<f32>],
    layout: &AccumLayout,
    block: usize,
    num_heads: usize,
    lengths: &[usize],
    cell_of: impl Fn(usize, usize, usize) -> usize,
) -> Vec<f32> {
    let width = layout.width;
    let mut dense = vec![0.0; layout.num_rows() * width];
    for (batch, &length) in lengths.iter().enumerate() {
        for head in 0..num_heads {
            for row in 0..length {
                let cell = &cells[cell_of(row / block, batch, head)];
                let local = (row % block) * width;
                let index = layout.row_index(batch, head, row) * width;
                dense[index..index + width]
                    .copy_from_slice(&cell[local..local + width]);
            }
        }
    }
    dense
}

/// Copies the valid rows of a dense accumulator into a caller-shaped
/// gradient.
fn accum_to_gradient(
    dense: &[f32],
    layout: &AccumLayout,
    target: &TensorLayout,
    num_heads: usize,
    rows: &[(usize, usize)],
) -> Vec<f32> {
    let width = layout.width;
    let dim = target.dim();
    let mut gradient = vec![0.0; target.num_elements()];
    for (batch, &(offset, length)) in rows.iter().enumerate() {
        let target_batch = if target.is_ragged() {
            0
        } else {
            batch
        };
        for head in 0..num_heads {
            for row in 0..length {
                let source = layout.row_index(batch, head, row) * width;
                let base = target.offset(offset + row, head, target_batch);
                gradient[base..base + dim]
                    .copy_from_slice(&dense[source..source + dim]);
            }
        }
    }
    gradient
}

/// Lines a tile's query contributions up with every query block of its
/// row. A block the tile reports nothing for still takes its turn, so
/// ordered accumulation of that block never waits on it.
fn contributions_by_block(
    dq: &[BlockContribution],
    num_blocks: usize,
) -> std::result::Result<Vec<Option<&[f32]>>, MainloopError> {
    let mut blocks = vec![None; num_blocks];
    for contribution in dq {
        let slot = blocks
            .get_mut(contribution.block)
            .filter(|slot| slot.is_none())
            .ok_or_else(|| {
                MainloopError::Tile(format!(
                    "query block {} reported twice or beyond {num_blocks} blocks",
                    contribution.block
                ))
            })?;
        *slot = Some(contribution.values.as_slice());
    }
    Ok(blocks)
}

impl<M: AttentionMainloop> AttentionEngine<M> {
    /// Fixed-length backward: `dout`/`q`/`out (batch, seqlen_q, num_heads,
    /// d)`, `k`/`v (batch, seqlen_k, num_heads_k, d)` and the forward
    /// `lse (batch, num_heads, seqlen_q)`.
    #[allow(clippy::too_many_arguments)]
    pub fn backward<'a, T: AttentionElement>(
        &self,
        dout: &ArrayViewD<'a, T>,
        q: &ArrayViewD<'a, T>,
        k: &ArrayViewD<'a, T>,
        v: &ArrayViewD<'a, T>,
        out: &ArrayViewD<'a, T>,
        lse: &ArrayViewD<'_, f32>,
        params: &BackwardParams,
    ) -> Result<BackwardOutput<T>> {
        check_rank("q", q, 4)?;
        check_rank("k", k, 4)?;
        let (batch_size, seqlen_q, num_heads, head_size_og) =
            (q.shape()[0], q.shape()[1], q.shape()[2], q.shape()[3]);
        let (seqlen_k, num_heads_k) = (k.shape()[1], k.shape()[2]);
        let q_shape = [batch_size, seqlen_q, num_heads, head_size_og];
        let k_shape = [batch_size, seqlen_k, num_heads_k, head_size_og];
        check_tensor("q", q, &q_shape)?;
        check_tensor("k", k, &k_shape)?;
        check_tensor("v", v, &k_shape)?;
        check_tensor("out", out, &q_shape)?;
        check_tensor("dout", dout, &q_shape)?;
        check_tensor("softmax_lse", lse, &[batch_size, num_heads, seqlen_q])?;

        let spec = SequenceSpec {
            batch_size,
            seqlen_q,
            seqlen_k,
            total_q: batch_size * seqlen_q,
            total_k: batch_size * seqlen_k,
            ..Default::default()
        };
        let problem = ProblemDescriptor::resolve(
            num_heads,
            num_heads_k,
            head_size_og,
            T::data_type(),
            &spec,
            &self.policy,
        )?;
        let head_size = problem.head_dim.head_size;
        let q_layout =
            TensorLayout::row_major(batch_size, seqlen_q, num_heads, head_size);
        let k_layout =
            TensorLayout::row_major(batch_size, seqlen_k, num_heads_k, head_size);
        let plan = BackwardPlan::build(BackwardSetup {
            problem,
            params,
            q: q_layout,
            k: k_layout,
            v: k_layout,
            out: q_layout,
            num_workers: self.num_workers(),
        })?;
        self.execute_backward(&plan, [dout, q, k, v, out], |batch, head, row| {
            lse[[batch, head, row].as_slice()]
        })
    }

    /// Ragged backward: `dout`/`q`/`out (total_q, num_heads, d)`,
    /// `k`/`v (total_k, num_heads_k, d)` and the forward
    /// `lse (num_heads, total_q)`.
    #[allow(clippy::too_many_arguments)]
    pub fn backward_varlen<'a, T: AttentionElement>(
        &self,
        dout: &ArrayViewD<'a, T>,
        q: &ArrayViewD<'a, T>,
        k: &ArrayViewD<'a, T>,
        v: &ArrayViewD<'a, T>,
        out: &ArrayViewD<'a, T>,
        lse: &ArrayViewD<'_, f32>,
        sequences: &VarlenArgs<'_>,
        params: &BackwardParams,
    ) -> Result<BackwardOutput<T>> {
        check_rank("q", q, 3)?;
        check_rank("k", k, 3)?;
        let (total_q, num_heads, head_size_og) =
            (q.shape()[0], q.shape()[1], q.shape()[2]);
        let (total_k, num_heads_k) = (k.shape()[0], k.shape()[1]);
        let q_shape = [total_q, num_heads, head_size_og];
        let k_shape = [total_k, num_heads_k, head_size_og];
        check_tensor("q", q, &q_shape)?;
        check_tensor("k", k, &k_shape)?;
        check_tensor("v", v, &k_shape)?;
        check_tensor("out", out, &q_shape)?;
        check_tensor("dout", dout, &q_shape)?;
        check_tensor("softmax_lse", lse, &[num_heads, total_q])?;

        let spec = SequenceSpec {
            batch_size: sequences.cu_seqlens_q.len().saturating_sub(1),
            seqlen_q: sequences.max_seqlen_q,
            seqlen_k: sequences.max_seqlen_k,
            total_q,
            total_k,
            cu_seqlens_q: Some(sequences.cu_seqlens_q),
            cu_seqlens_k: Some(sequences.cu_seqlens_k),
            seqused_q: sequences.seqused_q,
            seqused_k: sequences.seqused_k,
            ..Default::default()
        };
        let problem = ProblemDescriptor::resolve(
            num_heads,
            num_heads_k,
            head_size_og,
            T::data_type(),
            &spec,
            &self.policy,
        )?;
        let head_size = problem.head_dim.head_size;
        let q_layout = TensorLayout::ragged(total_q, num_heads, head_size);
        let k_layout = TensorLayout::ragged(total_k, num_heads_k, head_size);
        let plan = BackwardPlan::build(BackwardSetup {
            problem,
            params,
            q: q_layout,
            k: k_layout,
            v: k_layout,
            out: q_layout,
            num_workers: self.num_workers(),
        })?;
        let offsets: Vec<usize> = plan
            .problem
            .sequences
            .rows()
            .iter()
            .map(|row| row.q_offset)
            .collect();
        self.execute_backward(&plan, [dout, q, k, v, out], |batch, head, row| {
            lse[[head, offsets[batch] + row].as_slice()]
        })
    }

    fn execute_backward<'a, T: AttentionElement>(
        &self,
        plan: &BackwardPlan,
        [dout, q, k, v, out]: [&ArrayViewD<'a, T>; 5],
        forward_lse: impl Fn(usize, usize, usize) -> f32,
    ) -> Result<BackwardOutput<T>> {
        let problem = &plan.problem;
        let sequences = &problem.sequences;
        let head_size = problem.head_dim.head_size;
        let head_size_og = problem.head_dim.head_size_og;
        let (num_heads, num_heads_k) = (problem.num_heads, problem.num_heads_k);
        let q_rows: Vec<(usize, usize)> = sequences
            .rows()
            .iter()
            .map(|row| (row.q_offset, row.q_len))
            .collect();
        let k_rows: Vec<(usize, usize)> = sequences
            .rows()
            .iter()
            .map(|row| (row.k_offset, row.k_len))
            .collect();

        let dout = stage(dout, &plan.q)?;
        let q = stage(q, &plan.q)?;
        let k = stage(k, &plan.k)?;
        let v = stage(v, &plan.v)?;
        let out = stage(out, &plan.out)?;

        // Preprocess: per-row statistics in the accumulator row layout.
        let stats = &plan.softmax_stats;
        let mut lse = vec![f32::INFINITY; stats.num_rows()];
        let mut softmax_d = vec![0.0; stats.num_rows()];
        let (mut out_row, mut dout_row) = (vec![0.0; head_size], vec![0.0; head_size]);
        for (batch, &(offset, length)) in q_rows.iter().enumerate() {
            let q_batch = if plan.q.is_ragged() {
                0
            } else {
                batch
            };
            for head in 0..num_heads {
                for row in 0..length {
                    let index = stats.row_index(batch, head, row);
                    out.load(offset + row, head, q_batch, &mut out_row);
                    dout.load(offset + row, head, q_batch, &mut dout_row);
                    softmax_d[index] =
                        out_row.iter().zip(&dout_row).map(|(o, d)| o * d).sum();
                    lse[index] = forward_lse(batch, head, row);
                }
            }
        }
        let lse_log2: Vec<f32> =
            lse.iter().map(|value| value * std::f32::consts::LOG2_E).collect();

        let order = if plan.deterministic {
            AccumulationOrder::Deterministic
        } else {
            AccumulationOrder::Arrival
        };
        let (block_m, block_n) = (plan.tile.block_m, plan.tile.block_n);
        let width = plan.dq_accum.width;
        let group = problem.qheads_per_kvhead();
        let dq_turnstile = AccumulationTurnstile::new(plan.num_dq_cells(), order);
        let dq_cells = BlockAccumulator::new(plan.num_dq_cells(), block_m * width);
        let dkv_cells = plan.is_grouped().then(|| {
            (
                AccumulationTurnstile::new(plan.num_dkv_cells(), order),
                BlockAccumulator::new(plan.num_dkv_cells(), block_n * width),
                BlockAccumulator::new(plan.num_dkv_cells(), block_n * width),
            )
        });
        let abort = || {
            dq_turnstile.abort();
            if let Some((turnstile, _, _)) = &dkv_cells {
                turnstile.abort();
            }
        };

        let inputs = BackwardInputs {
            q: &q,
            k: &k,
            v: &v,
            dout: &dout,
            lse: &lse,
            softmax_d: &softmax_d,
        };
        let degenerate = problem.batch_size == 0
            || problem.seqlen_q == 0
            || problem.seqlen_k == 0;
        let direct = if degenerate {
            log::warn!(
                "degenerate backward (batch={}, seqlen_q={}, seqlen_k={}): zero gradients",
                problem.batch_size,
                problem.seqlen_q,
                problem.seqlen_k
            );
            Vec::new()
        } else {
            let scheduler = build_scheduler(
                plan.scheduler_kind,
                plan.scheduler,
                plan.varlen_rows.clone(),
            );
            run_tiles(scheduler.as_ref(), self.num_workers(), &abort, |tile| {
                let gradients = self.mainloop.backward_tile(plan, &inputs, tile)?;
                let num_blocks = sequences.row(tile.batch).q_len.div_ceil(block_m);
                let blocks = contributions_by_block(&gradients.dq, num_blocks)?;
                for (m_block, values) in blocks.into_iter().enumerate() {
                    let cell = plan.dq_cell(m_block, tile.batch, tile.head);
                    dq_turnstile.with_turn(cell, tile.block, || match values {
                        Some(values) => dq_cells.add(cell, values),
                        None => Ok(()),
                    })??;
                }
                match &dkv_cells {
                    Some((turnstile, dk_cells, dv_cells)) => {
                        let cell =
                            plan.dkv_cell(tile.block, tile.batch, tile.head / group);
                        turnstile.with_turn(cell, tile.head % group, || {
                            dk_cells.add(cell, &gradients.dk)?;
                            dv_cells.add(cell, &gradients.dv)
                        })??;
                        Ok(None)
                    },
                    None => Ok(Some((gradients.dk, gradients.dv))),
                }
            })?
        };

        let q_lengths: Vec<usize> = q_rows.iter().map(|&(_, length)| length).collect();
        let dq_accum = gather_cells(
            &dq_cells.into_cells(),
            &plan.dq_accum,
            block_m,
            num_heads,
            &q_lengths,
            |block: usize, batch: usize, head: usize| plan.dq_cell(block, batch, head),
        );
        let q_target = if plan.q.is_ragged() {
            TensorLayout::ragged(problem.total_q, num_heads, head_size_og)
        } else {
            TensorLayout::row_major(problem.batch_size, problem.seqlen_q, num_heads, head_size_og)
        };
        let dq = accum_to_gradient(&dq_accum, &plan.dq_accum, &q_target, num_heads, &q_rows);

        let k_target = if plan.k.is_ragged() {
            TensorLayout::ragged(problem.total_k, num_heads_k, head_size_og)
        } else {
            TensorLayout::row_major(problem.batch_size, problem.seqlen_k, num_heads_k, head_size_og)
        };
        let (dk, dv, dk_accum, dv_accum) = match (dkv_cells, &plan.dk_accum) {
            (Some((_, dk_cells, dv_cells)), Some(layout)) => {
                let k_lengths: Vec<usize> =
                    k_rows.iter().map(|&(_, length)| length).collect();
                let cell_of = |block: usize, batch: usize, head: usize| {
                    plan.dkv_cell(block, batch, head)
                };
                let dk_accum = gather_cells(
                    &dk_cells.into_cells(),
                    layout,
                    block_n,
                    num_heads_k,
                    &k_lengths,
                    cell_of,
                );
                let dv_accum = gather_cells(
                    &dv_cells.into_cells(),
                    layout,
                    block_n,
                    num_heads_k,
                    &k_lengths,
                    cell_of,
                );
                (
                    accum_to_gradient(&dk_accum, layout, &k_target, num_heads_k, &k_rows),
                    accum_to_gradient(&dv_accum, layout, &k_target, num_heads_k, &k_rows),
                    Some(to_array(&layout.shape, dk_accum)?),
                    Some(to_array(&layout.shape, dv_accum)?),
                )
            },
            _ => {
                let mut dk = vec![0.0; k_target.num_elements()];
                let mut dv = vec![0.0; k_target.num_elements()];
                for (tile, gradients) in direct {
                    let Some((tile_dk, tile_dv)) = gradients else {
                        continue;
                    };
                    let (offset, length) = k_rows[tile.batch];
                    let target_batch = if k_target.is_ragged() {
                        0
                    } else {
                        tile.batch
                    };
                    let first = tile.block * block_n;
                    for j in 0..block_n.min(length.saturating_sub(first)) {
                        let base = k_target.offset(offset + first + j, tile.head, target_batch);
                        let source = j * width;
                        dk[base..base + head_size_og]
                            .copy_from_slice(&tile_dk[source..source + head_size_og]);
                        dv[base..base + head_size_og]
                            .copy_from_slice(&tile_dv[source..source + head_size_og]);
                    }
                }
                (dk, dv, None, None)
            },
        };

        let stats_shape = &stats.shape[..stats.shape.len() - 1];
        Ok(BackwardOutput {
            dq: narrow::<T>(&caller_shape(&q_target), &dq)?,
            dk: narrow::<T>(&caller_shape(&k_target), &dk)?,
            dv: narrow::<T>(&caller_shape(&k_target), &dv)?,
            softmax_d: to_array(stats_shape, softmax_d)?,
            softmax_lse_log2: to_array(stats_shape, lse_log2)?,
            dq_accum: to_array(&plan.dq_accum.shape, dq_accum)?,
            dk_accum,
            dv_accum,
        })
    }
}

/// Caller-facing shape of a staged layout.
fn caller_shape(layout: &TensorLayout) -> Vec<usize> {
    if layout.is_ragged() {
        vec![layout.seq(), layout.heads(), layout.dim()]
    } else {
        vec![layout.batch(), layout.seq(), layout.heads(), layout.dim()]
    }
}
