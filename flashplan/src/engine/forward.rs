use ndarray::{
    ArrayD, ArrayView2, ArrayView3, ArrayView4, ArrayViewD, ArrayViewMutD,
    Axis, Ix3, Ix4, IxDyn, Slice,
};

use super::{AttentionEngine, PlanSummary, launch::run_tiles};
use crate::{
    backends::{AttentionMainloop, ForwardInputs, TileOutput},
    combine::reduce_splits,
    config::ForwardParams,
    data_type::{ArrayElement, AttentionElement, DataType},
    error::{ContractError, Result},
    plan::{
        AppendPlan, EpilogueDestination, ForwardPlan, ForwardSetup,
        KeyAddressing, LseLayout, OutputLayout, PageTable, RotaryTables,
    },
    problem::{ProblemDescriptor, SequenceSpec},
    scheduler::build_scheduler,
    tensor::{
        StagedTensor, TensorLayout, check_last_dim_contiguous, check_rank,
        check_seq_major_v, check_tensor,
    },
};

/// Ragged sequence description of a variable-length batch.
#[derive(Debug, Clone, Copy)]
pub struct VarlenArgs<'a> {
    pub cu_seqlens_q: &'a [i32],
    pub cu_seqlens_k: &'a [i32],
    pub seqused_q: Option<&'a [i32]>,
    pub seqused_k: Option<&'a [i32]>,
    pub max_seqlen_q: usize,
    pub max_seqlen_k: usize,
}

/// Rotary embedding applied to `q` and the appended keys,
/// `(seqlen_ro, rotary_dim / 2)` each.
#[derive(Debug, Clone)]
pub struct RotaryArgs<'a> {
    pub cos: ArrayView2<'a, f32>,
    pub sin: ArrayView2<'a, f32>,
    pub interleaved: bool,
}

/// Optional parts of a key/value cache launch.
#[derive(Debug, Clone)]
pub struct KvCacheArgs<'a, T> {
    /// `(batch, seqlen_new, num_heads_k, head_dim)` rows appended at
    /// `seqused_k` before attention.
    pub k_new: Option<ArrayViewD<'a, T>>,
    pub v_new: Option<ArrayViewD<'a, T>>,
    /// Ragged queries `(total_q, num_heads, head_dim)`.
    pub cu_seqlens_q: Option<&'a [i32]>,
    pub max_seqlen_q: Option<usize>,
    /// End of the valid cache rows per batch row, counting `leftpad_k`.
    pub seqused_k: Option<&'a [i32]>,
    pub leftpad_k: Option<&'a [i32]>,
    pub cache_batch_idx: Option<&'a [i32]>,
    /// `(batch_k, max_pages_per_seq)`; the caches are then
    /// `(num_pages, page_size, num_heads_k, head_dim)`.
    pub page_table: Option<ArrayView2<'a, i32>>,
    pub rotary: Option<RotaryArgs<'a>>,
}

impl<T> Default for KvCacheArgs<'_, T> {
    fn default() -> Self {
        Self {
            k_new: None,
            v_new: None,
            cu_seqlens_q: None,
            max_seqlen_q: None,
            seqused_k: None,
            leftpad_k: None,
            cache_batch_idx: None,
            page_table: None,
            rotary: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForwardOutput<O> {
    /// `(batch, seqlen_q, num_heads, head_dim)` or
    /// `(total_q, num_heads, head_dim)`.
    pub out: ArrayD<O>,
    /// `(batch, num_heads, seqlen_q)` or `(num_heads, total_q)`.
    pub lse: ArrayD<f32>,
    /// The output before slicing, present when the head dimension was
    /// padded.
    pub out_padded: Option<ArrayD<O>>,
    /// Split accumulators, present when the launch was split.
    pub out_accum: Option<ArrayD<f32>>,
    pub lse_accum: Option<ArrayD<f32>>,
    pub summary: PlanSummary,
}

fn shape_of<const N: usize, T>(
    name: &'static str,
    view: &ArrayViewD<'_, T>,
) -> Result<[usize; N]> {
    check_rank(name, view, N)?;
    let mut shape = [0; N];
    shape.copy_from_slice(view.shape());
    Ok(shape)
}

fn as_view4<'a, T>(view: &'a ArrayViewD<'_, T>) -> Result<ArrayView4<'a, T>> {
    view.view()
        .into_dimensionality::<Ix4>()
        .map_err(|err| ContractError::Invalid(err.to_string()).into())
}

fn as_view3<'a, T>(view: &'a ArrayViewD<'_, T>) -> Result<ArrayView3<'a, T>> {
    view.view()
        .into_dimensionality::<Ix3>()
        .map_err(|err| ContractError::Invalid(err.to_string()).into())
}

/// Checks V and reports whether it is stored sequence-contiguous.
fn check_v<T>(
    v: &ArrayViewD<'_, T>,
    expected: &[usize],
) -> Result<bool> {
    check_rank("v", v, expected.len())?;
    if v.shape() != expected {
        return Err(ContractError::Shape {
            name: "v",
            expected: expected.to_vec(),
            actual: v.shape().to_vec(),
        }
        .into());
    }
    if check_seq_major_v(v)? {
        return Ok(true);
    }
    check_last_dim_contiguous("v", v)?;
    Ok(false)
}

fn to_usize(
    name: &'static str,
    values: &[i32],
) -> Result<Vec<usize>> {
    values
        .iter()
        .map(|&value| {
            usize::try_from(value).map_err(|_| {
                ContractError::Invalid(format!("{name} must be non-negative"))
                    .into()
            })
        })
        .collect()
}

fn to_array<O: ArrayElement>(
    shape: &[usize],
    data: &[f32],
) -> Result<ArrayD<O>> {
    ArrayD::from_shape_vec(
        IxDyn(shape),
        data.iter().map(|&value| O::from_f32_value(value)).collect(),
    )
    .map_err(|err| ContractError::Invalid(err.to_string()).into())
}

fn slice_head_dim<O: ArrayElement>(
    padded: ArrayD<O>,
    head_size_og: usize,
) -> (ArrayD<O>, Option<ArrayD<O>>) {
    let last = Axis(padded.ndim() - 1);
    if padded.len_of(last) == head_size_og {
        return (padded, None);
    }
    let out = padded
        .slice_axis(last, Slice::from(0..head_size_og))
        .to_owned();
    (out, Some(padded))
}

/// Destination shapes `(out, lse, out_accum, lse_accum)` of a forward
/// launch with head dimension `head_size`.
fn output_shapes(
    plan: &ForwardPlan,
    head_size: usize,
) -> [Vec<usize>; 4] {
    let problem = &plan.problem;
    let (h, splits) = (problem.num_heads, plan.num_splits);
    if problem.sequences.is_varlen_q() {
        let total = problem.total_q;
        [
            vec![total, h, head_size],
            vec![h, total],
            vec![splits, h, total, head_size],
            vec![splits, h, total],
        ]
    } else {
        let (b, s) = (problem.batch_size, problem.seqlen_q);
        [
            vec![b, s, h, head_size],
            vec![b, h, s],
            vec![splits, b, h, s, head_size],
            vec![splits, b, h, s],
        ]
    }
}

fn scatter_rows(
    results: &[TileOutput],
    out: &mut [f32],
    out_layout: &OutputLayout,
    lse: &mut [f32],
    lse_layout: &LseLayout,
) {
    for tile in results {
        for row in &tile.rows {
            let base = out_layout.offset(row.row, row.head, row.batch, tile.split);
            out[base..base + row.out.len()].copy_from_slice(&row.out);
            lse[lse_layout.offset(row.row, row.head, row.batch, tile.split)] =
                row.lse;
        }
    }
}

fn degenerate_forward<O: ArrayElement>(
    plan: &ForwardPlan
) -> Result<ForwardOutput<O>> {
    log::warn!(
        "degenerate forward (batch={}, seqlen_k={}): zero output",
        plan.problem.batch_size,
        plan.problem.seqlen_k
    );
    let [out_shape, lse_shape, _, _] =
        output_shapes(plan, plan.problem.head_dim.head_size_og);
    Ok(ForwardOutput {
        out: ArrayD::from_elem(IxDyn(&out_shape), O::from_f32_value(0.0)),
        lse: ArrayD::from_elem(IxDyn(&lse_shape), f32::INFINITY),
        out_padded: None,
        out_accum: None,
        lse_accum: None,
        summary: PlanSummary::new(plan),
    })
}

/// Applies the rotary embedding to every query row in place.
fn rotate_queries<T: ArrayElement>(
    plan: &ForwardPlan,
    rotary: &RotaryTables,
    q: &mut StagedTensor,
) {
    let problem = &plan.problem;
    let ragged = q.layout.is_ragged();
    let mut row_values = vec![0.0; problem.head_dim.head_size];
    for (batch, sequence) in problem.sequences.rows().iter().enumerate() {
        let q_batch = if ragged {
            0
        } else {
            batch
        };
        for row in 0..sequence.q_len {
            // Unmasked queries all sit at the end of the cache.
            let pos = if plan.mask.kind.is_masked() {
                sequence.k_len_og + row
            } else {
                sequence.k_len_og
            };
            for head in 0..problem.num_heads {
                q.load(sequence.q_offset + row, head, q_batch, &mut row_values);
                rotary.apply(&mut row_values, pos);
                row_values
                    .iter_mut()
                    .for_each(|value| *value = T::from_f32_value(*value).to_f32_value());
                q.store(sequence.q_offset + row, head, q_batch, &row_values);
            }
        }
    }
}

/// Staged and caller-owned copies of one cache.
struct CacheUpdate<'a, 'b, T> {
    staged: &'a mut StagedTensor,
    caller: ArrayViewMutD<'b, T>,
}

impl<T: ArrayElement> CacheUpdate<'_, '_, T> {
    fn write(
        &mut self,
        row: usize,
        head: usize,
        batch: usize,
        values: &[f32],
    ) -> Result<()> {
        self.staged.store(row, head, batch, values);
        let mut caller = self
            .caller
            .view_mut()
            .into_dimensionality::<Ix4>()
            .map_err(|err| ContractError::Invalid(err.to_string()))?;
        let head_size_og = caller.len_of(Axis(3));
        for (d, value) in values.iter().take(head_size_og).enumerate() {
            caller[[batch, row, head, d]] = T::from_f32_value(*value);
        }
        Ok(())
    }
}

/// Writes the new keys and values into both caches at `seqused_k`.
fn append_kv<T: ArrayElement>(
    plan: &ForwardPlan,
    append: &AppendPlan,
    k_new: &StagedTensor,
    v_new: &StagedTensor,
    k_cache: &mut CacheUpdate<'_, '_, T>,
    v_cache: &mut CacheUpdate<'_, '_, T>,
) -> Result<()> {
    let problem = &plan.problem;
    let mut k_row = vec![0.0; problem.head_dim.head_size];
    let mut v_row = vec![0.0; problem.head_dim.head_size];
    for (batch, sequence) in problem.sequences.rows().iter().enumerate() {
        for index in 0..append.seqlen_k_new {
            let pos = sequence.k_offset + sequence.k_len_og + index;
            let (row, cache_batch) = plan.key_location(batch, pos)?;
            for head in 0..problem.num_heads_k {
                k_new.load(index, head, batch, &mut k_row);
                v_new.load(index, head, batch, &mut v_row);
                if let Some(rotary) = &append.rotary {
                    rotary.apply(&mut k_row, sequence.k_len_og + index);
                }
                for value in k_row.iter_mut().chain(v_row.iter_mut()) {
                    *value = T::from_f32_value(*value).to_f32_value();
                }
                k_cache.write(row, head, cache_batch, &k_row)?;
                v_cache.write(row, head, cache_batch, &v_row)?;
            }
        }
    }
    log::debug!(
        "appended {} rows to {} cache rows",
        append.seqlen_k_new,
        problem.batch_size
    );
    Ok(())
}

impl<M: AttentionMainloop> AttentionEngine<M> {
    #[allow(clippy::too_many_arguments)]
    fn plan_forward(
        &self,
        problem: ProblemDescriptor,
        params: &ForwardParams,
        q: TensorLayout,
        k: TensorLayout,
        v: TensorLayout,
        key_addressing: KeyAddressing,
        cache_batch_idx: Option<Vec<usize>>,
        append: Option<AppendPlan>,
    ) -> Result<ForwardPlan> {
        ForwardPlan::build(ForwardSetup {
            problem,
            params,
            policy: &self.policy,
            registry: &self.registry,
            q,
            k,
            v,
            key_addressing,
            cache_batch_idx,
            append,
            num_workers: self.num_workers(),
        })
    }

    /// Plans a fixed-length launch without staging or running it.
    pub fn plan_summary(
        &self,
        data_type: DataType,
        [batch_size, seqlen_q, num_heads, head_size_og]: [usize; 4],
        [seqlen_k, num_heads_k]: [usize; 2],
        params: &ForwardParams,
    ) -> Result<PlanSummary> {
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
            data_type,
            &spec,
            &self.policy,
        )?;
        let head_size = problem.head_dim.head_size;
        let k_layout =
            TensorLayout::row_major(batch_size, seqlen_k, num_heads_k, head_size);
        let plan = self.plan_forward(
            problem,
            params,
            TensorLayout::row_major(batch_size, seqlen_q, num_heads, head_size),
            k_layout,
            k_layout,
            KeyAddressing::Batched,
            None,
            None,
        )?;
        Ok(PlanSummary::new(&plan))
    }

    /// Fixed-length attention: `q (batch, seqlen_q, num_heads, d)`,
    /// `k`/`v (batch, seqlen_k, num_heads_k, d)`.
    pub fn forward<T: AttentionElement>(
        &self,
        q: &ArrayViewD<'_, T>,
        k: &ArrayViewD<'_, T>,
        v: &ArrayViewD<'_, T>,
        params: &ForwardParams,
    ) -> Result<ForwardOutput<T::Output>> {
        let [batch_size, seqlen_q, num_heads, head_size_og] = shape_of::<4, _>("q", q)?;
        let [_, seqlen_k, num_heads_k, _] = shape_of::<4, _>("k", k)?;
        check_tensor("q", q, &[batch_size, seqlen_q, num_heads, head_size_og])?;
        check_tensor("k", k, &[batch_size, seqlen_k, num_heads_k, head_size_og])?;
        let v_seq_major =
            check_v(v, &[batch_size, seqlen_k, num_heads_k, head_size_og])?;

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
        let k_layout =
            TensorLayout::row_major(batch_size, seqlen_k, num_heads_k, head_size);
        let v_layout = if v_seq_major {
            TensorLayout::seq_major(batch_size, seqlen_k, num_heads_k, head_size)
        } else {
            k_layout
        };
        let plan = self.plan_forward(
            problem,
            params,
            TensorLayout::row_major(batch_size, seqlen_q, num_heads, head_size),
            k_layout,
            v_layout,
            KeyAddressing::Batched,
            None,
            None,
        )?;
        if plan.problem.is_degenerate() {
            return degenerate_forward(&plan);
        }

        let q = StagedTensor::stage(&as_view4(q)?, head_size, false);
        let k = StagedTensor::stage(&as_view4(k)?, head_size, false);
        let v = StagedTensor::stage(&as_view4(v)?, head_size, v_seq_major);
        self.execute_forward(&plan, &ForwardInputs {
            q: &q,
            k: &k,
            v: &v,
        })
    }

    /// Ragged attention: `q (total_q, num_heads, d)`,
    /// `k`/`v (total_k, num_heads_k, d)`.
    pub fn forward_varlen<T: AttentionElement>(
        &self,
        q: &ArrayViewD<'_, T>,
        k: &ArrayViewD<'_, T>,
        v: &ArrayViewD<'_, T>,
        sequences: &VarlenArgs<'_>,
        params: &ForwardParams,
    ) -> Result<ForwardOutput<T::Output>> {
        let [total_q, num_heads, head_size_og] = shape_of::<3, _>("q", q)?;
        let [total_k, num_heads_k, _] = shape_of::<3, _>("k", k)?;
        check_tensor("q", q, &[total_q, num_heads, head_size_og])?;
        check_tensor("k", k, &[total_k, num_heads_k, head_size_og])?;
        check_tensor("v", v, &[total_k, num_heads_k, head_size_og])?;

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
        let k_layout = TensorLayout::ragged(total_k, num_heads_k, head_size);
        let plan = self.plan_forward(
            problem,
            params,
            TensorLayout::ragged(total_q, num_heads, head_size),
            k_layout,
            k_layout,
            KeyAddressing::Ragged,
            None,
            None,
        )?;
        if plan.problem.is_degenerate() {
            return degenerate_forward(&plan);
        }

        let q = StagedTensor::stage_ragged(&as_view3(q)?, head_size);
        let k = StagedTensor::stage_ragged(&as_view3(k)?, head_size);
        let v = StagedTensor::stage_ragged(&as_view3(v)?, head_size);
        self.execute_forward(&plan, &ForwardInputs {
            q: &q,
            k: &k,
            v: &v,
        })
    }

    /// Attention against a key/value cache, optionally paged, after
    /// appending `k_new`/`v_new`. The caches are updated in place.
    pub fn forward_kvcache<T: AttentionElement>(
        &self,
        q: &ArrayViewD<'_, T>,
        k_cache: ArrayViewMutD<'_, T>,
        v_cache: ArrayViewMutD<'_, T>,
        args: &KvCacheArgs<'_, T>,
        params: &ForwardParams,
    ) -> Result<ForwardOutput<T::Output>> {
        let (batch_size, seqlen_q, total_q, num_heads, head_size_og) =
            match args.cu_seqlens_q {
                Some(cu_seqlens_q) => {
                    let [total_q, num_heads, head_size_og] = shape_of::<3, _>("q", q)?;
                    let max_seqlen_q = args.max_seqlen_q.ok_or(
                        ContractError::MissingCompanion(
                            "cu_seqlens_q",
                            "max_seqlen_q",
                        ),
                    )?;
                    let batch_size = cu_seqlens_q.len().saturating_sub(1);
                    (batch_size, max_seqlen_q, total_q, num_heads, head_size_og)
                },
                None => {
                    let [batch_size, seqlen_q, num_heads, head_size_og] =
                        shape_of::<4, _>("q", q)?;
                    (
                        batch_size,
                        seqlen_q,
                        batch_size * seqlen_q,
                        num_heads,
                        head_size_og,
                    )
                },
            };
        check_last_dim_contiguous("q", q)?;

        let k_view = k_cache.view();
        let [cache_rows, cache_seqlen, num_heads_k, _] = shape_of::<4, _>("k_cache", &k_view)?;
        let cache_shape = [cache_rows, cache_seqlen, num_heads_k, head_size_og];
        check_tensor("k_cache", &k_view, &cache_shape)?;
        check_tensor("v_cache", &v_cache.view(), &cache_shape)?;

        let page_table = args
            .page_table
            .as_ref()
            .map(|table| {
                let (batch_size_k, max_pages) = table.dim();
                for &entry in table.iter() {
                    if entry >= 0 && entry as usize >= cache_rows {
                        return Err(ContractError::PageOutOfRange {
                            page: entry as usize,
                            num_pages: cache_rows,
                        });
                    }
                }
                PageTable::new(
                    table.iter().copied().collect(),
                    batch_size_k,
                    max_pages,
                    cache_seqlen,
                    cache_rows,
                )
            })
            .transpose()?;
        let (batch_size_k, seqlen_k) = match &page_table {
            Some(table) => (table.batch_size_k(), table.seqlen_k()),
            None => (cache_rows, cache_seqlen),
        };

        let cache_batch_idx = match args.cache_batch_idx {
            Some(indices) => {
                if indices.len() != batch_size {
                    return Err(ContractError::OffsetsLength {
                        name: "cache_batch_idx",
                        expected: batch_size,
                        actual: indices.len(),
                    }
                    .into());
                }
                let indices = to_usize("cache_batch_idx", indices)?;
                if let Some(&index) = indices.iter().find(|&&index| index >= batch_size_k) {
                    return Err(ContractError::CacheBatchIndex {
                        index,
                        batch_size_k,
                    }
                    .into());
                }
                Some(indices)
            },
            None if batch_size_k != batch_size => {
                return Err(ContractError::CacheBatchMismatch {
                    batch_size,
                    batch_size_k,
                }
                .into());
            },
            None => None,
        };

        let new_rows = match (&args.k_new, &args.v_new) {
            (Some(k_new), Some(v_new)) => {
                if args.seqused_k.is_none() {
                    return Err(
                        ContractError::MissingCompanion("k_new", "seqused_k").into()
                    );
                }
                let [_, seqlen_new, _, _] = shape_of::<4, _>("k_new", k_new)?;
                let shape = [batch_size, seqlen_new, num_heads_k, head_size_og];
                check_tensor("k_new", k_new, &shape)?;
                check_tensor("v_new", v_new, &shape)?;
                Some((k_new, v_new, seqlen_new))
            },
            (Some(_), None) => {
                return Err(ContractError::MissingCompanion("k_new", "v_new").into());
            },
            (None, Some(_)) => {
                return Err(ContractError::MissingCompanion("v_new", "k_new").into());
            },
            (None, None) => None,
        };

        let spec = SequenceSpec {
            batch_size,
            seqlen_q,
            seqlen_k,
            total_q,
            total_k: batch_size_k * seqlen_k,
            cu_seqlens_q: args.cu_seqlens_q,
            seqused_k: args.seqused_k,
            leftpad_k: args.leftpad_k,
            seqlen_k_new: new_rows.as_ref().map_or(0, |(_, _, rows)| *rows),
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

        let rotary = args
            .rotary
            .as_ref()
            .map(|rotary| {
                if rotary.cos.dim() != rotary.sin.dim() {
                    return Err(ContractError::Shape {
                        name: "rotary_sin",
                        expected: rotary.cos.shape().to_vec(),
                        actual: rotary.sin.shape().to_vec(),
                    });
                }
                let (seqlen_ro, half) = rotary.cos.dim();
                let rotary_dim = 2 * half;
                if rotary_dim == 0 || rotary_dim > head_size_og || rotary_dim % 16 != 0 {
                    return Err(ContractError::Invalid(format!(
                        "rotary dimension {rotary_dim} must be a positive multiple of 16 not above {head_size_og}"
                    )));
                }
                if seqlen_ro < seqlen_k {
                    return Err(ContractError::Invalid(format!(
                        "rotary tables cover {seqlen_ro} positions, cache holds {seqlen_k}"
                    )));
                }
                Ok(RotaryTables {
                    cos: rotary.cos.iter().copied().collect(),
                    sin: rotary.sin.iter().copied().collect(),
                    seqlen_ro,
                    rotary_dim,
                    interleaved: rotary.interleaved,
                })
            })
            .transpose()?;

        let append = new_rows.as_ref().map(|(_, _, seqlen_new)| {
            let layout =
                TensorLayout::row_major(batch_size, *seqlen_new, num_heads_k, head_size);
            AppendPlan {
                k_new: layout,
                v_new: layout,
                seqlen_k_new: *seqlen_new,
                rotary: rotary.clone(),
            }
        });
        let q_layout = if args.cu_seqlens_q.is_some() {
            TensorLayout::ragged(total_q, num_heads, head_size)
        } else {
            TensorLayout::row_major(batch_size, seqlen_q, num_heads, head_size)
        };
        let cache_layout =
            TensorLayout::row_major(cache_rows, cache_seqlen, num_heads_k, head_size);
        let key_addressing = match page_table {
            Some(table) => KeyAddressing::Paged(table),
            None => KeyAddressing::Batched,
        };
        let plan = self.plan_forward(
            problem,
            params,
            q_layout,
            cache_layout,
            cache_layout,
            key_addressing,
            cache_batch_idx,
            append,
        )?;
        if plan.problem.is_degenerate() {
            return degenerate_forward(&plan);
        }

        let mut q = if args.cu_seqlens_q.is_some() {
            StagedTensor::stage_ragged(&as_view3(q)?, head_size)
        } else {
            StagedTensor::stage(&as_view4(q)?, head_size, false)
        };
        let mut k = StagedTensor::stage(&as_view4(&k_cache.view())?, head_size, false);
        let mut v = StagedTensor::stage(&as_view4(&v_cache.view())?, head_size, false);
        if let (Some(append), Some((k_new, v_new, _))) = (&plan.append, &new_rows) {
            let k_new = StagedTensor::stage(&as_view4(k_new)?, head_size, false);
            let v_new = StagedTensor::stage(&as_view4(v_new)?, head_size, false);
            append_kv(
                &plan,
                append,
                &k_new,
                &v_new,
                &mut CacheUpdate {
                    staged: &mut k,
                    caller: k_cache,
                },
                &mut CacheUpdate {
                    staged: &mut v,
                    caller: v_cache,
                },
            )?;
        }
        if let Some(rotary) = &rotary {
            rotate_queries::<T>(&plan, rotary, &mut q);
        }
        self.execute_forward(&plan, &ForwardInputs {
            q: &q,
            k: &k,
            v: &v,
        })
    }

    /// Launches every tile of `plan`, writes the epilogue and, for split
    /// launches, combines the partial results once all tiles are done.
    fn execute_forward<O: ArrayElement>(
        &self,
        plan: &ForwardPlan,
        inputs: &ForwardInputs<'_>,
    ) -> Result<ForwardOutput<O>> {
        let sequences = &plan.problem.sequences;
        let varlen_rows = sequences
            .is_varlen()
            .then(|| sequences.rows().iter().map(|row| row.q_len).collect());
        let scheduler =
            build_scheduler(plan.variant.scheduler, plan.scheduler, varlen_rows);
        let results: Vec<TileOutput> = run_tiles(
            scheduler.as_ref(),
            self.num_workers(),
            &|| {},
            |tile| Ok(self.mainloop.forward_tile(plan, inputs, tile)?),
        )?
        .into_iter()
        .map(|(_, output)| output)
        .collect();

        let head_size = plan.problem.head_dim.head_size;
        let [out_shape, lse_shape, out_accum_shape, lse_accum_shape] =
            output_shapes(plan, head_size);
        let (out, lse, accumulators) = match &plan.epilogue {
            EpilogueDestination::Direct {
                out: out_layout,
                lse: lse_layout,
            } => {
                let mut out = vec![0.0; out_layout.num_elements()];
                let mut lse = vec![f32::INFINITY; lse_layout.len];
                scatter_rows(&results, &mut out, out_layout, &mut lse, lse_layout);
                (out, lse, None)
            },
            EpilogueDestination::SplitAccum {
                out_accum: out_accum_layout,
                lse_accum: lse_accum_layout,
            } => {
                let mut out_accum = vec![0.0; out_accum_layout.num_elements()];
                let mut lse_accum = vec![f32::NEG_INFINITY; lse_accum_layout.len];
                scatter_rows(
                    &results,
                    &mut out_accum,
                    out_accum_layout,
                    &mut lse_accum,
                    lse_accum_layout,
                );
                let batch = (!sequences.is_varlen_q()).then_some(plan.problem.batch_size);
                let seq = out_accum_layout.shape[0];
                let out_layout =
                    OutputLayout::direct(batch, seq, plan.problem.num_heads, head_size);
                let lse_layout = LseLayout::new(1, batch, seq, plan.problem.num_heads);
                let mut out = vec![0.0; out_layout.num_elements()];
                let mut lse = vec![0.0; lse_layout.len];
                reduce_splits(
                    &out_accum,
                    out_accum_layout,
                    &lse_accum,
                    lse_accum_layout,
                    &mut out,
                    &out_layout,
                    &mut lse,
                    &lse_layout,
                );
                (out, lse, Some((out_accum, lse_accum)))
            },
        };

        let (out, out_padded) = slice_head_dim(
            to_array::<O>(&out_shape, &out)?,
            plan.problem.head_dim.head_size_og,
        );
        let (out_accum, lse_accum) = match accumulators {
            Some((out_accum, lse_accum)) => (
                Some(to_array::<f32>(&out_accum_shape, &out_accum)?),
                Some(to_array::<f32>(&lse_accum_shape, &lse_accum)?),
            ),
            None => (None, None),
        };
        Ok(ForwardOutput {
            out,
            lse: to_array::<f32>(&lse_shape, &lse)?,
            out_padded,
            out_accum,
            lse_accum,
            summary: PlanSummary::new(plan),
        })
    }
}
