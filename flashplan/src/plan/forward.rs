use super::{LseLayout, OutputLayout};
use crate::{
    config::{Descale, Dropout, EnginePolicy, ForwardParams},
    dispatch::{
        HeadDimBucket, KernelVariant, TileConfig, VariantFeatures, VariantKey,
        VariantRegistry, resolve_pack_gqa,
    },
    error::{
        ConfigurationError, ContractError, MainloopError, ResourceLimitError,
        Result,
    },
    mask::AttentionMask,
    problem::ProblemDescriptor,
    scheduler::{SchedulerArgs, SchedulerKind},
    tensor::TensorLayout,
};

/// Page table of a paged key/value cache, `(batch_size_k, max_pages)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageTable {
    entries: Vec<i32>,
    batch_size_k: usize,
    max_pages_per_seq: usize,
    page_size: usize,
    num_pages: usize,
}

impl PageTable {
    pub fn new(
        entries: Vec<i32>,
        batch_size_k: usize,
        max_pages_per_seq: usize,
        page_size: usize,
        num_pages: usize,
    ) -> std::result::Result<Self, ContractError> {
        if entries.len() != batch_size_k * max_pages_per_seq {
            return Err(ContractError::Shape {
                name: "page_table",
                expected: vec![batch_size_k, max_pages_per_seq],
                actual: vec![entries.len()],
            });
        }
        if page_size == 0 {
            return Err(ContractError::Invalid(
                "page_size must be positive".to_string(),
            ));
        }
        Ok(Self {
            entries,
            batch_size_k,
            max_pages_per_seq,
            page_size,
            num_pages,
        })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn num_pages(&self) -> usize {
        self.num_pages
    }

    pub fn batch_size_k(&self) -> usize {
        self.batch_size_k
    }

    pub fn max_pages_per_seq(&self) -> usize {
        self.max_pages_per_seq
    }

    /// Logical capacity of one cache row.
    pub fn seqlen_k(&self) -> usize {
        self.max_pages_per_seq * self.page_size
    }

    /// `(physical page, slot)` holding position `pos` of cache row `row`.
    pub fn locate(
        &self,
        row: usize,
        pos: usize,
    ) -> std::result::Result<(usize, usize), MainloopError> {
        let page_index = pos / self.page_size;
        let entry = if page_index < self.max_pages_per_seq {
            self.entries[row * self.max_pages_per_seq + page_index]
        } else {
            -1
        };
        if entry < 0 || entry as usize >= self.num_pages {
            return Err(MainloopError::PageOutOfRange {
                page: entry as i64,
                num_pages: self.num_pages,
            });
        }
        Ok((entry as usize, pos % self.page_size))
    }
}

/// How key/value rows of a batch row are found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyAddressing {
    /// One cache row per batch row (or per remapped batch row).
    Batched,
    /// Rows located through `cu_seqlens_k` offsets.
    Ragged,
    Paged(PageTable),
}

/// Rotary embedding tables, `(seqlen_ro, rotary_dim / 2)` each.
#[derive(Debug, Clone, PartialEq)]
pub struct RotaryTables {
    pub cos: Vec<f32>,
    pub sin: Vec<f32>,
    pub seqlen_ro: usize,
    pub rotary_dim: usize,
    pub interleaved: bool,
}

impl RotaryTables {
    /// Rotates the first `rotary_dim` channels of `x` to position `pos`.
    pub fn apply(
        &self,
        x: &mut [f32],
        pos: usize,
    ) {
        let half = self.rotary_dim / 2;
        let base = pos * half;
        for i in 0..half {
            let (cos, sin) = (self.cos[base + i], self.sin[base + i]);
            let (a, b) = if self.interleaved {
                (2 * i, 2 * i + 1)
            } else {
                (i, i + half)
            };
            let (x0, x1) = (x[a], x[b]);
            x[a] = x0 * cos - x1 * sin;
            x[b] = x0 * sin + x1 * cos;
        }
    }
}

/// Keys and values appended to the cache before attention.
#[derive(Debug, Clone, PartialEq)]
pub struct AppendPlan {
    pub k_new: TensorLayout,
    pub v_new: TensorLayout,
    pub seqlen_k_new: usize,
    pub rotary: Option<RotaryTables>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EpilogueDestination {
    Direct {
        out: OutputLayout,
        lse: LseLayout,
    },
    SplitAccum {
        out_accum: OutputLayout,
        lse_accum: LseLayout,
    },
}

impl EpilogueDestination {
    pub fn out_layout(&self) -> &OutputLayout {
        match self {
            EpilogueDestination::Direct {
                out,
                ..
            } => out,
            EpilogueDestination::SplitAccum {
                out_accum,
                ..
            } => out_accum,
        }
    }

    pub fn lse_layout(&self) -> &LseLayout {
        match self {
            EpilogueDestination::Direct {
                lse,
                ..
            } => lse,
            EpilogueDestination::SplitAccum {
                lse_accum,
                ..
            } => lse_accum,
        }
    }
}

/// Everything a forward launch needs besides the tensor data.
#[derive(Debug, Clone)]
pub struct ForwardSetup<'a> {
    pub problem: ProblemDescriptor,
    pub params: &'a ForwardParams,
    pub policy: &'a EnginePolicy,
    pub registry: &'a VariantRegistry,
    pub q: TensorLayout,
    pub k: TensorLayout,
    pub v: TensorLayout,
    pub key_addressing: KeyAddressing,
    pub cache_batch_idx: Option<Vec<usize>>,
    pub append: Option<AppendPlan>,
    pub num_workers: usize,
}

/// Immutable argument bundle of one forward launch.
#[derive(Debug, Clone)]
pub struct ForwardPlan {
    pub problem: ProblemDescriptor,
    pub variant: KernelVariant,
    pub mask: AttentionMask,
    pub pack_gqa: bool,
    pub cluster_m: usize,
    pub q: TensorLayout,
    pub k: TensorLayout,
    pub v: TensorLayout,
    pub key_addressing: KeyAddressing,
    pub cache_batch_idx: Option<Vec<usize>>,
    pub append: Option<AppendPlan>,
    pub softmax_scale: f32,
    pub descale: Descale,
    pub softcap: f32,
    pub dropout: Option<Dropout>,
    pub num_splits: usize,
    pub epilogue: EpilogueDestination,
    pub scheduler: SchedulerArgs,
}

pub(crate) fn check_dropout(
    dropout: Option<Dropout>
) -> Result<Option<Dropout>> {
    let Some(dropout) = dropout else {
        return Ok(None);
    };
    if !(0.0..1.0).contains(&dropout.probability) {
        return Err(ContractError::Invalid(format!(
            "dropout probability must be in [0, 1), got {}",
            dropout.probability
        ))
        .into());
    }
    if dropout.probability == 0.0 {
        return Ok(None);
    }
    if !cfg!(feature = "dropout") {
        return Err(ConfigurationError::FeatureDisabled("dropout").into());
    }
    Ok(Some(dropout))
}

impl ForwardPlan {
    pub fn build(setup: ForwardSetup<'_>) -> Result<Self> {
        let ForwardSetup {
            problem,
            params,
            policy,
            registry,
            q,
            k,
            v,
            key_addressing,
            cache_batch_idx,
            append,
            num_workers,
        } = setup;

        if params.num_splits == 0 || params.num_splits > policy.max_num_splits {
            return Err(ResourceLimitError::NumSplits {
                actual: params.num_splits,
                max: policy.max_num_splits,
            }
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

        let mut features = VariantFeatures::new(
            problem.data_type,
            HeadDimBucket::for_head_size(problem.head_dim.head_size),
        )
        .with_mask(mask.kind);
        features.has_softcap = params.softcap > 0.0;
        features.varlen = problem.is_varlen();
        features.paged_kv = matches!(key_addressing, KeyAddressing::Paged(_));
        features.append_kv = append.is_some();
        features.split = params.num_splits > 1;
        features.v_colmajor = v.is_seq_major();

        // Tiling does not depend on packing, so the packing heuristic can
        // use the tile height of the unpacked variant.
        let block_m = TileConfig::forward(&VariantKey::new(features)?).block_m;
        let pack_gqa = resolve_pack_gqa(
            params.pack_gqa,
            problem.num_heads,
            problem.num_heads_k,
            features.varlen,
            mask.kind.is_causal(),
            problem.seqlen_q,
            block_m,
            policy.pack_gqa_margin,
        );
        features.pack_gqa = pack_gqa;
        let variant = *registry.select(features)?;

        let qheads_per_kvhead = problem.qheads_per_kvhead();
        let packed_heads = if pack_gqa {
            qheads_per_kvhead
        } else {
            1
        };
        let num_blocks_m =
            (problem.seqlen_q * packed_heads).div_ceil(variant.tile.block_m);
        let cluster_m = variant.tile.cluster_m(&variant.key, num_blocks_m);
        let num_blocks_m = num_blocks_m.div_ceil(cluster_m) * cluster_m;

        let scheduler = SchedulerArgs {
            num_blocks_m,
            num_heads: if pack_gqa {
                problem.num_heads_k
            } else {
                problem.num_heads
            },
            batch_size: problem.batch_size,
            num_splits: params.num_splits,
            qheads_per_kvhead,
            seqlen_q: problem.seqlen_q,
            block_m: variant.tile.block_m,
            pack_gqa,
            reverse_blocks: variant.scheduler == SchedulerKind::DynamicPersistent,
            num_workers,
        };

        let batch = (!problem.sequences.is_varlen_q()).then_some(problem.batch_size);
        let seq = if problem.sequences.is_varlen_q() {
            problem.total_q
        } else {
            problem.seqlen_q
        };
        let head_size = problem.head_dim.head_size;
        let epilogue = if params.num_splits > 1 {
            EpilogueDestination::SplitAccum {
                out_accum: OutputLayout::split_accum(
                    params.num_splits,
                    batch,
                    seq,
                    problem.num_heads,
                    head_size,
                ),
                lse_accum: LseLayout::new(
                    params.num_splits,
                    batch,
                    seq,
                    problem.num_heads,
                ),
            }
        } else {
            EpilogueDestination::Direct {
                out: OutputLayout::direct(batch, seq, problem.num_heads, head_size),
                lse: LseLayout::new(1, batch, seq, problem.num_heads),
            }
        };

        let descale = if problem.data_type.is_float8() {
            params.descale.unwrap_or_default()
        } else {
            Descale::default()
        };

        log::debug!(
            "forward plan: variant={} tile={}x{} cluster={} scheduler={:?} pack_gqa={} splits={}",
            variant.name(),
            variant.tile.block_m,
            variant.tile.block_n,
            cluster_m,
            variant.scheduler,
            pack_gqa,
            params.num_splits
        );

        Ok(Self {
            problem,
            variant,
            mask,
            pack_gqa,
            cluster_m,
            q,
            k,
            v,
            key_addressing,
            cache_batch_idx,
            append,
            softmax_scale: params.softmax_scale,
            descale,
            softcap: params.softcap,
            dropout,
            num_splits: params.num_splits,
            epilogue,
            scheduler,
        })
    }

    pub fn key(&self) -> &VariantKey {
        &self.variant.key
    }

    pub fn block_n(&self) -> usize {
        self.variant.tile.block_n
    }

    /// Batch row of the key/value cache backing query batch row `batch`.
    pub fn cache_row(
        &self,
        batch: usize,
    ) -> usize {
        self.cache_batch_idx
            .as_ref()
            .map_or(batch, |indices| indices[batch])
    }

    /// Staged `(row, batch)` holding key position `pos` of batch row
    /// `batch`. Positions count from the start of the cache row, left
    /// padding included.
    pub fn key_location(
        &self,
        batch: usize,
        pos: usize,
    ) -> std::result::Result<(usize, usize), MainloopError> {
        match &self.key_addressing {
            KeyAddressing::Batched => Ok((pos, self.cache_row(batch))),
            KeyAddressing::Ragged => Ok((pos, 0)),
            KeyAddressing::Paged(table) => {
                let (page, slot) = table.locate(self.cache_row(batch), pos)?;
                Ok((slot, page))
            },
        }
    }
}
