use super::{
    HeadDimPadding, SequenceSpec, SequenceTable, check_head_grouping, round_up,
};
use crate::{DataType, config::EnginePolicy, error::Result};

/// A logical attention problem resolved into padded, tile-aligned extents.
#[derive(Debug, Clone, PartialEq)]
pub struct ProblemDescriptor {
    pub batch_size: usize,
    pub num_heads: usize,
    pub num_heads_k: usize,
    pub head_dim: HeadDimPadding,
    pub data_type: DataType,
    /// Static length, or the maximum length in ragged mode.
    pub seqlen_q: usize,
    pub seqlen_k: usize,
    pub seqlen_q_rounded: usize,
    pub seqlen_k_rounded: usize,
    pub total_q: usize,
    pub total_k: usize,
    pub sequences: SequenceTable,
}

impl ProblemDescriptor {
    pub fn resolve(
        num_heads: usize,
        num_heads_k: usize,
        head_size_og: usize,
        data_type: DataType,
        spec: &SequenceSpec<'_>,
        policy: &EnginePolicy,
    ) -> Result<Self> {
        let head_dim =
            HeadDimPadding::resolve(head_size_og, data_type, policy.max_head_dim)?;
        check_head_grouping(num_heads, num_heads_k)?;
        let sequences = SequenceTable::resolve(spec)?;

        let rounding = policy.forward_seqlen_rounding;
        let descriptor = Self {
            batch_size: spec.batch_size,
            num_heads,
            num_heads_k,
            head_dim,
            data_type,
            seqlen_q: spec.seqlen_q,
            seqlen_k: spec.seqlen_k,
            seqlen_q_rounded: round_up(spec.seqlen_q, rounding),
            seqlen_k_rounded: round_up(spec.seqlen_k, rounding),
            total_q: spec.total_q,
            total_k: spec.total_k,
            sequences,
        };
        log::debug!(
            "resolved problem: b={} h={} h_k={} d={}->{}/{} sq={} sk={} varlen={}",
            descriptor.batch_size,
            descriptor.num_heads,
            descriptor.num_heads_k,
            head_dim.head_size_og,
            head_dim.head_size,
            head_dim.head_size_rounded,
            descriptor.seqlen_q,
            descriptor.seqlen_k,
            descriptor.is_varlen()
        );
        Ok(descriptor)
    }

    pub fn qheads_per_kvhead(&self) -> usize {
        self.num_heads / self.num_heads_k
    }

    pub fn is_varlen(&self) -> bool {
        self.sequences.is_varlen()
    }

    /// Quantized inputs produce a wider-precision output.
    pub fn output_type(&self) -> DataType {
        match self.data_type {
            DataType::F8E4M3 => DataType::BF16,
            other => other,
        }
    }

    /// Zero keys or zero rows: outputs are zero-filled without launching.
    pub fn is_degenerate(&self) -> bool {
        self.batch_size == 0 || self.seqlen_k == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AttentionError, ContractError, ResourceLimitError};

    fn fixed_spec(
        batch_size: usize,
        seqlen_q: usize,
        seqlen_k: usize,
    ) -> SequenceSpec<'static> {
        SequenceSpec {
            batch_size,
            seqlen_q,
            seqlen_k,
            total_q: batch_size * seqlen_q,
            total_k: batch_size * seqlen_k,
            ..Default::default()
        }
    }

    #[test]
    fn test_resolve_fixed() {
        let policy = EnginePolicy::default();
        let problem = ProblemDescriptor::resolve(
            8,
            2,
            100,
            DataType::F8E4M3,
            &fixed_spec(2, 130, 7),
            &policy,
        )
        .unwrap();
        assert_eq!(problem.qheads_per_kvhead(), 4);
        assert_eq!(problem.head_dim.head_size, 112);
        assert_eq!(problem.seqlen_q_rounded, 256);
        assert_eq!(problem.seqlen_k_rounded, 128);
        assert_eq!(problem.output_type(), DataType::BF16);
        assert!(!problem.is_varlen());
        assert!(!problem.is_degenerate());
    }

    #[test]
    fn test_resolve_errors() {
        let policy = EnginePolicy::default();
        let spec = fixed_spec(1, 4, 4);
        assert_eq!(
            ProblemDescriptor::resolve(6, 4, 64, DataType::F16, &spec, &policy),
            Err(AttentionError::Contract(ContractError::HeadGrouping {
                num_heads: 6,
                num_kv_heads: 4,
            }))
        );
        assert_eq!(
            ProblemDescriptor::resolve(4, 4, 320, DataType::F16, &spec, &policy),
            Err(AttentionError::ResourceLimit(ResourceLimitError::HeadDim {
                actual: 320,
                max: 256,
            }))
        );
    }

    #[test]
    fn test_degenerate() {
        let policy = EnginePolicy::default();
        let problem = ProblemDescriptor::resolve(
            2,
            2,
            64,
            DataType::BF16,
            &fixed_spec(3, 4, 0),
            &policy,
        )
        .unwrap();
        assert!(problem.is_degenerate());
    }
}
