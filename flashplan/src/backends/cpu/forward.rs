use super::{DropoutMask, dot, keys::KeySource};
use crate::{
    backends::{ForwardInputs, OutputRow, TileOutput},
    error::MainloopError,
    mask::{BlockRange, SplitIndex},
    plan::ForwardPlan,
    scheduler::WorkTile,
};

/// Online softmax state of one query row.
struct RowState {
    row: usize,
    head: usize,
    q: Vec<f32>,
    max: f32,
    sum: f32,
    acc: Vec<f32>,
}

pub(super) fn forward_tile(
    plan: &ForwardPlan,
    inputs: &ForwardInputs<'_>,
    tile: &WorkTile,
) -> Result<TileOutput, MainloopError> {
    let problem = &plan.problem;
    let sequence = problem.sequences.row(tile.batch);
    let group = if plan.pack_gqa {
        problem.qheads_per_kvhead()
    } else {
        1
    };
    let block_m = plan.variant.tile.block_m;
    let block_n = plan.block_n();
    let begin = tile.block * block_m;
    let end = ((tile.block + 1) * block_m).min(sequence.q_len * group);
    let mut output = TileOutput {
        split: tile.split,
        rows: Vec::new(),
    };
    if begin >= end {
        return Ok(output);
    }

    let head_size = problem.head_dim.head_size;
    let kv_head = if plan.pack_gqa {
        tile.head
    } else {
        tile.head / problem.qheads_per_kvhead()
    };
    let q_batch = if inputs.q.layout.is_ragged() {
        0
    } else {
        tile.batch
    };
    let mut rows: Vec<RowState> = (begin..end)
        .map(|index| {
            let (row, head) = if plan.pack_gqa {
                (index / group, tile.head * group + index % group)
            } else {
                (index, tile.head)
            };
            let mut q = vec![0.0; head_size];
            inputs.q.load(sequence.q_offset + row, head, q_batch, &mut q);
            RowState {
                row,
                head,
                q,
                max: f32::NEG_INFINITY,
                sum: 0.0,
                acc: vec![0.0; head_size],
            }
        })
        .collect();

    let range = BlockRange::for_rows(
        &plan.mask,
        begin / group,
        (end - 1) / group + 1,
        sequence.q_len,
        sequence.k_len,
        block_n,
        SplitIndex {
            split: tile.split,
            num_splits: plan.num_splits,
        },
    );
    let keys = KeySource::new(plan, tile.batch, &sequence);
    let dropout = plan.dropout.as_ref().map(DropoutMask::new);
    let scale = plan.softmax_scale * plan.descale.q * plan.descale.k;

    let mut k_block = vec![0.0; block_n * head_size];
    let mut v_block = vec![0.0; block_n * head_size];
    let mut scores = vec![0.0; block_n];
    for n_block in range.blocks() {
        let first = n_block * block_n;
        let count = block_n.min(sequence.k_len.saturating_sub(first));
        for j in 0..count {
            let span = j * head_size..(j + 1) * head_size;
            keys.load(inputs.k, first + j, kv_head, &mut k_block[span.clone()])?;
            keys.load(inputs.v, first + j, kv_head, &mut v_block[span])?;
        }

        for state in rows.iter_mut() {
            let mut block_max = f32::NEG_INFINITY;
            for j in 0..count {
                let visible = plan.mask.is_visible(
                    state.row,
                    first + j,
                    sequence.q_len,
                    sequence.k_len,
                );
                scores[j] = if visible {
                    let mut score = dot(
                        &state.q,
                        &k_block[j * head_size..(j + 1) * head_size],
                    ) * scale;
                    if plan.softcap > 0.0 {
                        score = plan.softcap * (score / plan.softcap).tanh();
                    }
                    score
                } else {
                    f32::NEG_INFINITY
                };
                block_max = block_max.max(scores[j]);
            }
            let new_max = state.max.max(block_max);
            if new_max == f32::NEG_INFINITY {
                continue;
            }
            let correction = (state.max - new_max).exp();
            state.sum *= correction;
            state.acc.iter_mut().for_each(|value| *value *= correction);
            for j in 0..count {
                if scores[j] == f32::NEG_INFINITY {
                    continue;
                }
                let p = (scores[j] - new_max).exp();
                state.sum += p;
                let kept = dropout.is_none_or(|mask| {
                    mask.keep(tile.batch, state.head, state.row, first + j)
                });
                if kept {
                    let v = &v_block[j * head_size..(j + 1) * head_size];
                    for (acc, value) in state.acc.iter_mut().zip(v) {
                        *acc += p * value;
                    }
                }
            }
            state.max = new_max;
        }
    }

    let out_batch = if problem.sequences.is_varlen_q() {
        0
    } else {
        tile.batch
    };
    let rescale = dropout.map_or(1.0, |mask| mask.rescale()) * plan.descale.v;
    let is_split = plan.num_splits > 1;
    output.rows = rows
        .into_iter()
        .map(|state| {
            let (lse, out) = if state.sum == 0.0 || state.sum.is_nan() {
                let lse = if is_split {
                    f32::NEG_INFINITY
                } else {
                    f32::INFINITY
                };
                (lse, vec![0.0; head_size])
            } else {
                let factor = rescale / state.sum;
                (
                    state.max + state.sum.ln(),
                    state.acc.iter().map(|value| value * factor).collect(),
                )
            };
            OutputRow {
                row: sequence.q_offset + state.row,
                head: state.head,
                batch: out_batch,
                lse,
                out,
            }
        })
        .collect();
    Ok(output)
}
