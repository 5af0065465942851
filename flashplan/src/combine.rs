use std::cmp::Ordering;

use ndarray::{ArrayD, ArrayViewD, IxDyn};

use crate::{
    data_type::CombineElement,
    error::{ContractError, ResourceLimitError, Result},
    plan::{LseLayout, OutputLayout},
    problem::round_up,
    tensor::{check_rank, check_tensor},
};

/// Head dimension alignment of the standalone combine stage.
const COMBINE_ALIGNMENT: usize = 4;
const COMBINE_MAX_HEAD_DIM: usize = 256;

/// One split's partial result for a single query row.
#[derive(Debug, Clone, Copy)]
pub struct PartialRow<'a> {
    pub lse: f32,
    pub out: &'a [f32],
}

fn total_order(
    a: &PartialRow<'_>,
    b: &PartialRow<'_>,
) -> Ordering {
    a.lse.total_cmp(&b.lse).then_with(|| {
        a.out
            .iter()
            .zip(b.out)
            .map(|(x, y)| x.total_cmp(y))
            .find(|ordering| ordering.is_ne())
            .unwrap_or(Ordering::Equal)
    })
}

/// Merges the partial results of one row into `out` and returns the row's
/// log-sum-exp.
///
/// Partials are reduced in a canonical order, so the result does not depend
/// on how splits are numbered. A row where every split is empty yields
/// `+inf` and zeros.
pub fn combine_row(
    partials: &mut [PartialRow<'_>],
    out: &mut [f32],
) -> f32 {
    partials.sort_by(total_order);
    let max = partials
        .iter()
        .map(|partial| partial.lse)
        .fold(f32::NEG_INFINITY, f32::max);
    let max = if max == f32::NEG_INFINITY {
        0.0
    } else {
        max
    };
    let sum: f32 = partials
        .iter()
        .map(|partial| (partial.lse - max).exp())
        .sum();
    let lse = if sum == 0.0 || sum.is_nan() {
        f32::INFINITY
    } else {
        sum.ln() + max
    };

    out.fill(0.0);
    for partial in partials.iter() {
        let scale = (partial.lse - lse).exp();
        if scale == 0.0 || scale.is_nan() {
            continue;
        }
        for (acc, value) in out.iter_mut().zip(partial.out) {
            *acc += scale * value;
        }
    }
    lse
}

/// Reduces split accumulators into their final destination.
///
/// Every `(row, head, batch)` of `out_layout` is combined from the
/// `num_splits` slices of `out_accum`.
#[allow(clippy::too_many_arguments)]
pub fn reduce_splits(
    out_accum: &[f32],
    out_accum_layout: &OutputLayout,
    lse_accum: &[f32],
    lse_accum_layout: &LseLayout,
    out: &mut [f32],
    out_layout: &OutputLayout,
    lse: &mut [f32],
    lse_layout: &LseLayout,
) {
    let [seq, dim, heads, batch, num_splits] = out_accum_layout.shape;
    let mut row_out = vec![0.0f32; dim];
    let mut partials = Vec::with_capacity(num_splits);
    for b in 0..batch {
        for h in 0..heads {
            for row in 0..seq {
                partials.clear();
                partials.extend((0..num_splits).map(|split| {
                    let base = out_accum_layout.offset(row, h, b, split);
                    PartialRow {
                        lse: lse_accum[lse_accum_layout.offset(row, h, b, split)],
                        out: &out_accum[base..base + dim],
                    }
                }));
                lse[lse_layout.offset(row, h, b, 0)] =
                    combine_row(&mut partials, &mut row_out);
                let base = out_layout.offset(row, h, b, 0);
                out[base..base + dim].copy_from_slice(&row_out);
            }
        }
    }
    log::trace!(
        "combined {} splits over {} rows",
        num_splits,
        seq * heads * batch
    );
}

/// Result of the standalone combine stage.
#[derive(Debug, Clone, PartialEq)]
pub struct CombineOutput<O> {
    /// `(batch, seq, heads, head_dim)`
    pub out: ArrayD<O>,
    /// `(batch, seq, heads)`
    pub lse: ArrayD<f32>,
}

/// Combines `(splits, batch, seq, heads, d)` partial outputs with their
/// `(splits, batch, seq, heads)` log-sum-exps.
pub fn combine_partials<O: CombineElement>(
    out_partial: &ArrayViewD<'_, f32>,
    lse_partial: &ArrayViewD<'_, f32>,
    max_num_splits: usize,
) -> Result<CombineOutput<O>> {
    check_rank("out_partial", out_partial, 5)?;
    let &[num_splits, batch, seq, heads, head_size_og] = out_partial.shape() else {
        return Err(ContractError::Invalid("out_partial must have rank 5".to_string()).into());
    };
    check_tensor("out_partial", out_partial, &[num_splits, batch, seq, heads, head_size_og])?;
    check_tensor("lse_partial", lse_partial, &[num_splits, batch, seq, heads])?;
    if head_size_og > COMBINE_MAX_HEAD_DIM {
        return Err(ResourceLimitError::HeadDim {
            actual: head_size_og,
            max: COMBINE_MAX_HEAD_DIM,
        }
        .into());
    }
    if num_splits == 0 || num_splits > max_num_splits {
        return Err(ResourceLimitError::NumSplits {
            actual: num_splits,
            max: max_num_splits,
        }
        .into());
    }

    let head_size = round_up(head_size_og, COMBINE_ALIGNMENT);
    let out_accum_layout =
        OutputLayout::split_accum(num_splits, Some(batch), seq, heads, head_size);
    let lse_accum_layout = LseLayout::new(num_splits, Some(batch), seq, heads);
    let mut out_accum = vec![0.0f32; out_accum_layout.num_elements()];
    let mut lse_accum = vec![0.0f32; lse_accum_layout.len];
    for (index, value) in out_partial.indexed_iter() {
        let (s, b, row, h, d) = (index[0], index[1], index[2], index[3], index[4]);
        out_accum[out_accum_layout.offset(row, h, b, s) + d] = *value;
    }
    for (index, value) in lse_partial.indexed_iter() {
        let (s, b, row, h) = (index[0], index[1], index[2], index[3]);
        lse_accum[lse_accum_layout.offset(row, h, b, s)] = *value;
    }

    let out_layout = OutputLayout::direct(Some(batch), seq, heads, head_size);
    let lse_layout = LseLayout::new(1, Some(batch), seq, heads);
    let mut out = vec![0.0f32; out_layout.num_elements()];
    let mut lse = vec![0.0f32; lse_layout.len];
    reduce_splits(
        &out_accum,
        &out_accum_layout,
        &lse_accum,
        &lse_accum_layout,
        &mut out,
        &out_layout,
        &mut lse,
        &lse_layout,
    );

    let out = ArrayD::from_shape_fn(IxDyn(&[batch, seq, heads, head_size_og]), |index| {
        O::from_f32_value(out[out_layout.offset(index[1], index[2], index[0], 0) + index[3]])
    });
    let lse = ArrayD::from_shape_fn(IxDyn(&[batch, seq, heads]), |index| {
        lse[lse_layout.offset(index[1], index[2], index[0], 0)]
    });
    Ok(CombineOutput {
        out,
        lse,
    })
}

#[cfg(test)]
mod tests {
    use half::bf16;
    use ndarray::{Array4, Array5};

    use super::*;
    use crate::error::AttentionError;

    #[test]
    fn test_single_split_is_identity() {
        let values = [0.25, -1.5, 3.0];
        let mut partials = [PartialRow {
            lse: 2.5,
            out: &values,
        }];
        let mut out = [0.0; 3];
        let lse = combine_row(&mut partials, &mut out);
        assert!(is_close!(lse, 2.5));
        assert_eq!(out, values);
    }

    #[test]
    fn test_two_equal_splits() {
        let a = [1.0, 2.0];
        let b = [3.0, 4.0];
        let mut partials = [
            PartialRow {
                lse: 0.0,
                out: &a,
            },
            PartialRow {
                lse: 0.0,
                out: &b,
            },
        ];
        let mut out = [0.0; 2];
        let lse = combine_row(&mut partials, &mut out);
        assert!(is_close!(lse, 2.0f32.ln()));
        assert!((out[0] - 2.0).abs() < 1e-6);
        assert!((out[1] - 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_empty_split_contributes_nothing() {
        let a = [5.0];
        let zeros = [0.0];
        let mut partials = [
            PartialRow {
                lse: f32::NEG_INFINITY,
                out: &zeros,
            },
            PartialRow {
                lse: 1.0,
                out: &a,
            },
        ];
        let mut out = [0.0];
        assert_eq!(combine_row(&mut partials, &mut out), 1.0);
        assert_eq!(out, [5.0]);
    }

    #[test]
    fn test_all_empty_row() {
        let zeros = [0.0, 0.0];
        let mut partials = [
            PartialRow {
                lse: f32::NEG_INFINITY,
                out: &zeros,
            };
            3
        ];
        let mut out = [7.0, 7.0];
        assert_eq!(combine_row(&mut partials, &mut out), f32::INFINITY);
        assert_eq!(out, [0.0, 0.0]);
    }

    #[test]
    fn test_order_invariance_is_bitwise() {
        let rows: Vec<[f32; 4]> = (0..6)
            .map(|s| {
                let s = s as f32;
                [s.sin(), s.cos() * 3.0, 1.0 / (s + 1.0), -s]
            })
            .collect();
        let lses = [0.3, -1.2, 2.7, 0.3, f32::NEG_INFINITY, 1.1];
        let run = |order: &[usize]| {
            let mut partials: Vec<_> = order
                .iter()
                .map(|&s| PartialRow {
                    lse: lses[s],
                    out: &rows[s],
                })
                .collect();
            let mut out = [0.0; 4];
            let lse = combine_row(&mut partials, &mut out);
            (lse.to_bits(), out.map(f32::to_bits))
        };
        let reference = run(&[0, 1, 2, 3, 4, 5]);
        assert_eq!(run(&[5, 4, 3, 2, 1, 0]), reference);
        assert_eq!(run(&[3, 0, 5, 1, 4, 2]), reference);
    }

    #[test]
    fn test_combine_partials_pads_and_slices() {
        let out_partial = Array5::from_shape_fn((2, 1, 3, 2, 5), |(s, _, r, h, d)| {
            (s * 100 + r * 10 + h + d) as f32
        });
        let lse_partial = Array4::<f32>::zeros((2, 1, 3, 2));
        let result = combine_partials::<bf16>(
            &out_partial.view().into_dyn(),
            &lse_partial.view().into_dyn(),
            256,
        )
        .unwrap();
        assert_eq!(result.out.shape(), &[1, 3, 2, 5]);
        assert_eq!(result.lse.shape(), &[1, 3, 2]);
        // Equal weights: the mean of the two splits.
        assert_eq!(result.out[[0, 2, 1, 4]], bf16::from_f32(75.0));
        assert!(is_close!(result.lse[[0, 1, 1]], 2.0f32.ln()));
    }

    #[test]
    fn test_combine_partials_limits() {
        let out_partial = ArrayD::<f32>::zeros(IxDyn(&[1, 1, 1, 1, 260]));
        let lse_partial = ArrayD::<f32>::zeros(IxDyn(&[1, 1, 1, 1]));
        assert_eq!(
            combine_partials::<f32>(&out_partial.view(), &lse_partial.view(), 256),
            Err(AttentionError::ResourceLimit(ResourceLimitError::HeadDim {
                actual: 260,
                max: 256,
            }))
        );
        let lse_bad = ArrayD::<f32>::zeros(IxDyn(&[1, 1, 2, 1]));
        assert!(matches!(
            combine_partials::<f32>(
                &ArrayD::<f32>::zeros(IxDyn(&[1, 1, 1, 1, 8])).view(),
                &lse_bad.view(),
                256
            ),
            Err(AttentionError::Contract(ContractError::Shape { .. }))
        ));
    }
}
