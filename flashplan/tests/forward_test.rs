mod common;

use common::{Reference, engine, max_abs_diff, random_tensor, reference_forward, widen};
use flashplan::{
    AttentionElement, Descale, Dropout, F8E4M3, ForwardParams, KvCacheArgs, VarlenArgs,
};
use half::f16;
use ndarray::{Array4, ArrayD, ArrayViewD, Axis, s};

/// Rows `start..end` of a ragged tensor as a single-row fixed batch.
fn batch_row(
    tensor: &ArrayD<f16>,
    start: usize,
    end: usize,
) -> ArrayViewD<'_, f16> {
    tensor
        .slice(s![start..end, .., ..])
        .insert_axis(Axis(0))
        .into_dyn()
}

#[test]
fn test_causal_forward_matches_reference() {
    let (batch, seq, heads, dim) = (1, 128, 2, 64);
    let q = random_tensor(&[batch, seq, heads, dim], 1);
    let k = random_tensor(&[batch, seq, heads, dim], 2);
    let v = random_tensor(&[batch, seq, heads, dim], 3);
    let params = ForwardParams::new(dim).causal();

    let output = engine(4)
        .forward(&q.view(), &k.view(), &v.view(), &params)
        .unwrap();
    let expected =
        reference_forward(&widen(&q), &widen(&k), &widen(&v), params.softmax_scale, true);

    assert_eq!(output.out.shape(), &[batch, seq, heads, dim]);
    assert_eq!(output.lse.shape(), &[batch, heads, seq]);
    assert!(max_abs_diff(&output.out, &expected.out.into_dyn()) < 1e-2);
    for (actual, expected) in output.lse.iter().zip(expected.lse.iter()) {
        assert!((actual - expected).abs() < 1e-3, "{actual} vs {expected}");
    }
    assert!(output.out_accum.is_none());
}

#[test]
fn test_gqa_forward_matches_reference() {
    let (batch, seq_q, seq_k, heads, heads_k, dim) = (2, 3, 40, 8, 2, 64);
    let q = random_tensor(&[batch, seq_q, heads, dim], 11);
    let k = random_tensor(&[batch, seq_k, heads_k, dim], 12);
    let v = random_tensor(&[batch, seq_k, heads_k, dim], 13);
    let params = ForwardParams::new(dim).causal();

    let output = engine(3)
        .forward(&q.view(), &k.view(), &v.view(), &params)
        .unwrap();
    let expected =
        reference_forward(&widen(&q), &widen(&k), &widen(&v), params.softmax_scale, true);
    assert!(max_abs_diff(&output.out, &expected.out.into_dyn()) < 1e-2);
}

#[test]
fn test_padded_head_dim_is_sliced() {
    let (batch, seq, heads, dim) = (1, 17, 2, 60);
    let q = random_tensor(&[batch, seq, heads, dim], 21);
    let k = random_tensor(&[batch, seq, heads, dim], 22);
    let v = random_tensor(&[batch, seq, heads, dim], 23);
    let params = ForwardParams::new(dim);

    let output = engine(2)
        .forward(&q.view(), &k.view(), &v.view(), &params)
        .unwrap();
    let expected =
        reference_forward(&widen(&q), &widen(&k), &widen(&v), params.softmax_scale, false);
    assert_eq!(output.out.shape(), &[batch, seq, heads, dim]);
    assert_eq!(output.out_padded.as_ref().unwrap().shape(), &[batch, seq, heads, 64]);
    assert!(max_abs_diff(&output.out, &expected.out.into_dyn()) < 1e-2);
}

#[test]
fn test_varlen_matches_per_row_forward() {
    let lengths = [1usize, 5, 3];
    let cu_seqlens: Vec<i32> = std::iter::once(0)
        .chain(lengths.iter().scan(0, |total, &len| {
            *total += len as i32;
            Some(*total)
        }))
        .collect();
    let total = *cu_seqlens.last().unwrap() as usize;
    let (heads, dim) = (2, 64);
    let q = random_tensor(&[total, heads, dim], 31);
    let k = random_tensor(&[total, heads, dim], 32);
    let v = random_tensor(&[total, heads, dim], 33);
    let engine = engine(4);

    for causal in [false, true] {
        let mut params = ForwardParams::new(dim);
        params.is_causal = causal;
        let sequences = VarlenArgs {
            cu_seqlens_q: &cu_seqlens,
            cu_seqlens_k: &cu_seqlens,
            seqused_q: None,
            seqused_k: None,
            max_seqlen_q: 5,
            max_seqlen_k: 5,
        };
        let ragged = engine
            .forward_varlen(&q.view(), &k.view(), &v.view(), &sequences, &params)
            .unwrap();
        assert_eq!(ragged.out.shape(), &[total, heads, dim]);
        assert_eq!(ragged.lse.shape(), &[heads, total]);

        for (row, window) in cu_seqlens.windows(2).enumerate() {
            let (start, end) = (window[0] as usize, window[1] as usize);
            let fixed = engine
                .forward(
                    &batch_row(&q, start, end),
                    &batch_row(&k, start, end),
                    &batch_row(&v, start, end),
                    &params,
                )
                .unwrap();
            let expected = ragged.out.slice(s![start..end, .., ..]);
            for (a, b) in fixed.out.iter().zip(expected.iter()) {
                assert!((a.to_f32() - b.to_f32()).abs() < 1e-3, "row {row}: {a} vs {b}");
            }
            for h in 0..heads {
                for i in 0..lengths[row] {
                    let a = fixed.lse[[0, h, i].as_slice()];
                    let b = ragged.lse[[h, start + i].as_slice()];
                    assert!((a - b).abs() < 1e-4);
                }
            }
        }
    }
}

#[test]
fn test_paged_split_matches_unsplit() {
    let (batch, heads, heads_k, dim, page_size) = (2, 4, 1, 64, 16);
    let pages = [[2, 0], [3, 1]];
    let num_pages = 4;
    let page_table = ndarray::Array2::from_shape_fn((batch, 2), |(b, p)| pages[b][p]);
    let q = random_tensor(&[batch, 1, heads, dim], 41);
    let mut k_cache = random_tensor(&[num_pages, page_size, heads_k, dim], 42);
    let mut v_cache = random_tensor(&[num_pages, page_size, heads_k, dim], 43);

    let seq_k = 2 * page_size;
    let gather = |cache: &ArrayD<f16>| {
        Array4::from_shape_fn((batch, seq_k, heads_k, dim), |(b, pos, h, d)| {
            cache[[pages[b][pos / page_size] as usize, pos % page_size, h, d].as_slice()].to_f32()
        })
    };
    let expected = reference_forward(
        &widen(&q),
        &gather(&k_cache),
        &gather(&v_cache),
        1.0 / (dim as f32).sqrt(),
        false,
    );

    let engine = engine(4);
    let mut run = |num_splits: usize| {
        let args = KvCacheArgs {
            page_table: Some(page_table.view()),
            ..Default::default()
        };
        engine
            .forward_kvcache(
                &q.view(),
                k_cache.view_mut(),
                v_cache.view_mut(),
                &args,
                &ForwardParams::new(dim).splits(num_splits),
            )
            .unwrap()
    };
    let unsplit = run(1);
    let split = run(4);

    assert_eq!(split.summary.num_splits, 4);
    assert_eq!(split.out_accum.as_ref().unwrap().shape()[0], 4);
    for (a, b) in split.out.iter().zip(unsplit.out.iter()) {
        assert!((a.to_f32() - b.to_f32()).abs() < 2e-3);
    }
    for (a, b) in split.lse.iter().zip(unsplit.lse.iter()) {
        assert!((a - b).abs() < 1e-4);
    }
    assert!(max_abs_diff(&unsplit.out, &expected.out.into_dyn()) < 1e-2);
}

#[test]
fn test_fully_masked_rows_are_zero() {
    let (seq_q, seq_k, heads, dim) = (4, 2, 1, 64);
    let q = random_tensor(&[1, seq_q, heads, dim], 51);
    let k = random_tensor(&[1, seq_k, heads, dim], 52);
    let v = random_tensor(&[1, seq_k, heads, dim], 53);

    // Bottom-right alignment hides every key from the first two queries.
    let output = engine(1)
        .forward(&q.view(), &k.view(), &v.view(), &ForwardParams::new(dim).causal())
        .unwrap();
    for i in 0..2 {
        assert!(output.out.slice(s![0, i, .., ..]).iter().all(|x| x.to_f32() == 0.0));
        assert_eq!(output.lse[[0, 0, i].as_slice()], f32::INFINITY);
    }
    assert!(output.lse[[0, 0, 3].as_slice()].is_finite());
}

/// Runs `params` on random `(1, seq_q, heads, 64)` queries against
/// `(1, seq_k, heads_k, 64)` keys and compares with the reference.
fn check_against_reference<T: AttentionElement>(
    [seq_q, seq_k, heads, heads_k]: [usize; 4],
    params: &ForwardParams,
    convert: impl Fn(f16) -> T,
    seed: u64,
) {
    let dim = 64;
    let q = random_tensor(&[1, seq_q, heads, dim], seed).mapv(&convert);
    let k = random_tensor(&[1, seq_k, heads_k, dim], seed + 1).mapv(&convert);
    let v = random_tensor(&[1, seq_k, heads_k, dim], seed + 2).mapv(&convert);
    let output = engine(4)
        .forward(&q.view(), &k.view(), &v.view(), params)
        .unwrap();
    let expected = Reference::from(params).forward(&widen(&q), &widen(&k), &widen(&v));

    let diff = max_abs_diff(&output.out, &expected.out.into_dyn());
    assert!(diff < 2e-2, "out differs by {diff}");
    for (actual, expected) in output.lse.iter().zip(expected.lse.iter()) {
        assert!(
            actual == expected || (actual - expected).abs() < 1e-3,
            "{actual} vs {expected}"
        );
    }
}

#[test]
fn test_softcap_forward_matches_reference() {
    let mut params = ForwardParams::new(64);
    params.softcap = 0.5;
    check_against_reference([100, 140, 2, 2], &params, |x| x, 61);
    check_against_reference([100, 140, 2, 2], &params.causal(), |x| x, 62);
}

#[test]
fn test_dropout_forward_matches_reference() {
    let mut params = ForwardParams::new(64).causal();
    params.dropout = Some(Dropout {
        probability: 0.2,
        seed: 1234,
    });
    check_against_reference([150, 150, 4, 2], &params, |x| x, 71);
}

#[test]
fn test_local_window_with_sinks_matches_reference() {
    let mut params = ForwardParams::new(64).window(40, 8);
    params.sink_token_length = 4;
    check_against_reference([300, 300, 2, 1], &params, |x| x, 81);
    // Fewer queries than keys: the window follows the bottom-right diagonal.
    check_against_reference([50, 300, 2, 1], &params, |x| x, 82);
}

#[test]
fn test_float8_descale_matches_reference() {
    let mut params = ForwardParams::new(64).causal();
    params.descale = Some(Descale {
        q: 0.5,
        k: 2.5,
        v: 1.5,
    });
    check_against_reference([90, 90, 2, 2], &params, |x| F8E4M3::from_f32(x.to_f32()), 91);
}

#[test]
fn test_empty_keys_forward_is_degenerate() {
    let q = random_tensor(&[2, 4, 2, 64], 101);
    let k = random_tensor(&[2, 0, 2, 64], 102);
    let output = engine(2)
        .forward(&q.view(), &k.view(), &k.view(), &ForwardParams::new(64).causal())
        .unwrap();
    assert_eq!(output.out.shape(), &[2, 4, 2, 64]);
    assert!(output.out.iter().all(|x| x.to_f32() == 0.0));
    assert_eq!(output.lse.shape(), &[2, 2, 4]);
    assert!(output.lse.iter().all(|&lse| lse == f32::INFINITY));
}
