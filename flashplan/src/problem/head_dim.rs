use crate::{
    DataType,
    error::{ContractError, ResourceLimitError},
};

pub fn round_up(
    value: usize,
    multiple: usize,
) -> usize {
    value.div_ceil(multiple) * multiple
}

/// Head dimension after alignment padding.
///
/// `head_size` is what the mainloop computes over (inputs are zero-padded up
/// to it), `head_size_rounded` is the bucket used for tiling and for the
/// backward accumulators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadDimPadding {
    pub head_size_og: usize,
    pub alignment: usize,
    pub head_size: usize,
    pub head_size_rounded: usize,
}

impl HeadDimPadding {
    pub fn alignment_for(data_type: DataType) -> usize {
        if data_type.is_float8() {
            16
        } else {
            8
        }
    }

    pub fn resolve(
        head_size_og: usize,
        data_type: DataType,
        max_head_dim: usize,
    ) -> Result<Self, ResourceLimitError> {
        if head_size_og > max_head_dim {
            return Err(ResourceLimitError::HeadDim {
                actual: head_size_og,
                max: max_head_dim,
            });
        }
        let alignment = Self::alignment_for(data_type);
        let head_size = round_up(head_size_og, alignment);
        let head_size_rounded = if head_size <= 64 {
            64
        } else if head_size <= 128 {
            round_up(head_size, 32)
        } else {
            round_up(head_size, 64)
        };
        Ok(Self {
            head_size_og,
            alignment,
            head_size,
            head_size_rounded,
        })
    }

    /// Whether outputs carry alignment padding that must be sliced away.
    pub fn needs_slice(&self) -> bool {
        self.head_size_og % self.alignment != 0
    }
}

pub fn check_head_grouping(
    num_heads: usize,
    num_heads_k: usize,
) -> Result<usize, ContractError> {
    if num_heads_k == 0 || num_heads % num_heads_k != 0 {
        return Err(ContractError::HeadGrouping {
            num_heads,
            num_kv_heads: num_heads_k,
        });
    }
    Ok(num_heads / num_heads_k)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_head_dim_rounding() {
        let cases = [
            (DataType::F16, 40, 40, 64),
            (DataType::F16, 64, 64, 64),
            (DataType::BF16, 72, 72, 96),
            (DataType::F16, 100, 104, 128),
            (DataType::F16, 130, 136, 192),
            (DataType::F8E4M3, 72, 80, 96),
            (DataType::F8E4M3, 250, 256, 256),
        ];
        for (data_type, og, head_size, rounded) in cases {
            let padding = HeadDimPadding::resolve(og, data_type, 256).unwrap();
            assert_eq!(padding.head_size, head_size, "{data_type} {og}");
            assert_eq!(padding.head_size_rounded, rounded, "{data_type} {og}");
        }
    }

    #[test]
    fn test_head_dim_rounding_is_monotonic() {
        for data_type in [DataType::F16, DataType::F8E4M3] {
            let mut previous = HeadDimPadding::resolve(1, data_type, 256).unwrap();
            for og in 2..=256 {
                let padding = HeadDimPadding::resolve(og, data_type, 256).unwrap();
                assert!(padding.head_size >= og);
                assert!(padding.head_size_rounded >= padding.head_size);
                assert!(padding.head_size >= previous.head_size);
                assert!(padding.head_size_rounded >= previous.head_size_rounded);
                previous = padding;
            }
        }
    }

    #[test]
    fn test_needs_slice() {
        let aligned = HeadDimPadding::resolve(64, DataType::F16, 256).unwrap();
        assert!(!aligned.needs_slice());
        let padded = HeadDimPadding::resolve(60, DataType::F16, 256).unwrap();
        assert!(padded.needs_slice());
        let fp8 = HeadDimPadding::resolve(72, DataType::F8E4M3, 256).unwrap();
        assert!(fp8.needs_slice());
    }

    #[test]
    fn test_head_dim_limit() {
        assert_eq!(
            HeadDimPadding::resolve(257, DataType::F16, 256),
            Err(ResourceLimitError::HeadDim {
                actual: 257,
                max: 256,
            })
        );
    }

    #[test]
    fn test_head_grouping() {
        assert_eq!(check_head_grouping(8, 2), Ok(4));
        assert!(check_head_grouping(6, 4).is_err());
        assert!(check_head_grouping(6, 0).is_err());
    }
}
