use super::{DropoutMask, dot};
use crate::{
    backends::{BackwardInputs, BlockContribution, TileGradients},
    error::MainloopError,
    plan::BackwardPlan,
    scheduler::WorkTile,
};

/// Gradients of one key tile `(n_block, head, batch)`.
///
/// Query blocks the tile cannot see are reported with zero contributions.
pub(super) fn backward_tile(
    plan: &BackwardPlan,
    inputs: &BackwardInputs<'_>,
    tile: &WorkTile,
) -> Result<TileGradients, MainloopError> {
    let problem = &plan.problem;
    let sequence = problem.sequences.row(tile.batch);
    let head_size = problem.head_dim.head_size;
    let width = plan.dq_accum.width;
    let (block_m, block_n) = (plan.tile.block_m, plan.tile.block_n);
    let head = tile.head;
    let kv_head = head / problem.qheads_per_kvhead();
    let q_batch = if inputs.q.layout.is_ragged() {
        0
    } else {
        tile.batch
    };
    let k_batch = if inputs.k.layout.is_ragged() {
        0
    } else {
        tile.batch
    };

    let first = tile.block * block_n;
    let count = block_n.min(sequence.k_len.saturating_sub(first));
    let mut k_block = vec![0.0; count * head_size];
    let mut v_block = vec![0.0; count * head_size];
    for j in 0..count {
        let span = j * head_size..(j + 1) * head_size;
        inputs.k.load(
            sequence.k_offset + first + j,
            kv_head,
            k_batch,
            &mut k_block[span.clone()],
        );
        inputs
            .v
            .load(sequence.k_offset + first + j, kv_head, k_batch, &mut v_block[span]);
    }

    let dropout = plan.dropout.as_ref().map(DropoutMask::new);
    let scale = plan.softmax_scale;
    let mut gradients = TileGradients {
        dq: Vec::with_capacity(sequence.q_len.div_ceil(block_m)),
        dk: vec![0.0; block_n * width],
        dv: vec![0.0; block_n * width],
    };
    let mut q = vec![0.0; head_size];
    let mut dout = vec![0.0; head_size];
    for m_block in 0..sequence.q_len.div_ceil(block_m) {
        let mut dq = vec![0.0; block_m * width];
        let rows = m_block * block_m..((m_block + 1) * block_m).min(sequence.q_len);
        for (local, row) in rows.enumerate() {
            let visible: Vec<usize> = (0..count)
                .filter(|&j| {
                    plan.mask.is_visible(
                        row,
                        first + j,
                        sequence.q_len,
                        sequence.k_len,
                    )
                })
                .collect();
            if visible.is_empty() {
                continue;
            }
            inputs.q.load(sequence.q_offset + row, head, q_batch, &mut q);
            inputs
                .dout
                .load(sequence.q_offset + row, head, q_batch, &mut dout);
            let stats = plan.softmax_stats.row_index(tile.batch, head, row);
            let lse = inputs.lse[stats];
            let softmax_d = inputs.softmax_d[stats];
            let dq_row = &mut dq[local * width..local * width + head_size];

            for j in visible {
                let k = &k_block[j * head_size..(j + 1) * head_size];
                let v = &v_block[j * head_size..(j + 1) * head_size];
                let raw = dot(&q, k) * scale;
                let (score, softcap_grad) = if plan.softcap > 0.0 {
                    let t = (raw / plan.softcap).tanh();
                    (plan.softcap * t, 1.0 - t * t)
                } else {
                    (raw, 1.0)
                };
                let p = (score - lse).exp();
                let kept = match &dropout {
                    Some(mask) => {
                        mask.keep(tile.batch, head, row, first + j)
                            .then_some(mask.rescale())
                    },
                    None => Some(1.0),
                };
                let mut dp = dot(&dout, v);
                match kept {
                    Some(rescale) => {
                        let z = p * rescale;
                        let dv_row = &mut gradients.dv[j * width..j * width + head_size];
                        for (acc, value) in dv_row.iter_mut().zip(&dout) {
                            *acc += z * value;
                        }
                        dp *= rescale;
                    },
                    None => dp = 0.0,
                }
                let ds = p * (dp - softmax_d) * softcap_grad * scale;
                for (acc, value) in dq_row.iter_mut().zip(k) {
                    *acc += ds * value;
                }
                let dk_row = &mut gradients.dk[j * width..j * width + head_size];
                for (acc, value) in dk_row.iter_mut().zip(&q) {
                    *acc += ds * value;
                }
            }
        }
        gradients.dq.push(BlockContribution {
            block: m_block,
            values: dq,
        });
    }
    Ok(gradients)
}
