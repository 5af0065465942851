use std::fmt;

use crate::{DataType, error::ConfigurationError, mask::MaskKind};

/// Compiled head dimensions; a problem runs with the smallest bucket that
/// holds its padded head size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HeadDimBucket {
    D64,
    D96,
    D128,
    D192,
    D256,
}

impl HeadDimBucket {
    pub const ALL: [HeadDimBucket; 5] = [
        HeadDimBucket::D64,
        HeadDimBucket::D96,
        HeadDimBucket::D128,
        HeadDimBucket::D192,
        HeadDimBucket::D256,
    ];

    pub fn for_head_size(head_size: usize) -> Self {
        match head_size {
            0..=64 => HeadDimBucket::D64,
            65..=96 => HeadDimBucket::D96,
            97..=128 => HeadDimBucket::D128,
            129..=192 => HeadDimBucket::D192,
            _ => HeadDimBucket::D256,
        }
    }

    pub fn value(&self) -> usize {
        match self {
            HeadDimBucket::D64 => 64,
            HeadDimBucket::D96 => 96,
            HeadDimBucket::D128 => 128,
            HeadDimBucket::D192 => 192,
            HeadDimBucket::D256 => 256,
        }
    }
}

/// Raw problem features before validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VariantFeatures {
    pub data_type: DataType,
    pub head_dim: HeadDimBucket,
    pub is_causal: bool,
    pub is_local: bool,
    pub has_softcap: bool,
    pub varlen: bool,
    pub paged_kv: bool,
    pub append_kv: bool,
    pub pack_gqa: bool,
    pub split: bool,
    pub v_colmajor: bool,
}

impl VariantFeatures {
    pub fn new(
        data_type: DataType,
        head_dim: HeadDimBucket,
    ) -> Self {
        Self {
            data_type,
            head_dim,
            is_causal: false,
            is_local: false,
            has_softcap: false,
            varlen: false,
            paged_kv: false,
            append_kv: false,
            pack_gqa: false,
            split: false,
            v_colmajor: false,
        }
    }

    pub fn with_mask(
        mut self,
        mask: MaskKind,
    ) -> Self {
        self.is_causal = mask.is_causal();
        self.is_local = mask.is_local();
        self
    }
}

/// A validated feature combination. Only combinations that can actually
/// co-occur are constructible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VariantKey {
    data_type: DataType,
    head_dim: HeadDimBucket,
    mask: MaskKind,
    has_softcap: bool,
    varlen: bool,
    paged_kv: bool,
    append_kv: bool,
    pack_gqa: bool,
    split: bool,
    v_colmajor: bool,
}

impl VariantKey {
    pub fn new(features: VariantFeatures) -> Result<Self, ConfigurationError> {
        if !matches!(
            features.data_type,
            DataType::F16 | DataType::BF16 | DataType::F8E4M3
        ) {
            return Err(ConfigurationError::UnsupportedElementType(
                features.data_type,
            ));
        }
        if features.is_causal && features.is_local {
            return Err(ConfigurationError::InvalidVariant(
                "causal and local masking cannot be enabled at the same time",
            ));
        }
        if features.append_kv && !features.varlen {
            return Err(ConfigurationError::InvalidVariant(
                "cache append requires variable-length batching",
            ));
        }
        if features.append_kv && features.v_colmajor {
            return Err(ConfigurationError::InvalidVariant(
                "cache append and column-major V cannot be enabled at the same time",
            ));
        }
        if features.v_colmajor && !features.data_type.is_float8() {
            return Err(ConfigurationError::InvalidVariant(
                "column-major V is only available for 8-bit inputs",
            ));
        }
        let mask = if features.is_causal {
            MaskKind::Causal
        } else if features.is_local {
            MaskKind::Local
        } else {
            MaskKind::None
        };
        Ok(Self {
            data_type: features.data_type,
            head_dim: features.head_dim,
            mask,
            has_softcap: features.has_softcap,
            varlen: features.varlen,
            paged_kv: features.paged_kv,
            append_kv: features.append_kv,
            pack_gqa: features.pack_gqa,
            split: features.split,
            v_colmajor: features.v_colmajor,
        })
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn head_dim(&self) -> HeadDimBucket {
        self.head_dim
    }

    pub fn mask(&self) -> MaskKind {
        self.mask
    }

    pub fn has_softcap(&self) -> bool {
        self.has_softcap
    }

    pub fn varlen(&self) -> bool {
        self.varlen
    }

    pub fn paged_kv(&self) -> bool {
        self.paged_kv
    }

    pub fn append_kv(&self) -> bool {
        self.append_kv
    }

    pub fn pack_gqa(&self) -> bool {
        self.pack_gqa
    }

    pub fn split(&self) -> bool {
        self.split
    }

    pub fn v_colmajor(&self) -> bool {
        self.v_colmajor
    }

    /// Element type written by the tile epilogue.
    pub fn epilogue_output_type(&self) -> DataType {
        if self.split {
            DataType::F32
        } else if self.data_type.is_float8() {
            DataType::BF16
        } else {
            self.data_type
        }
    }
}

impl fmt::Display for VariantKey {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "{}_hdim{}", self.data_type, self.head_dim.value())?;
        match self.mask {
            MaskKind::None => {},
            MaskKind::Causal => f.write_str("_causal")?,
            MaskKind::Local => f.write_str("_local")?,
        }
        let flags = [
            (self.has_softcap, "_softcap"),
            (self.varlen, "_varlen"),
            (self.paged_kv, "_paged"),
            (self.append_kv, "_append"),
            (self.pack_gqa, "_packgqa"),
            (self.split, "_split"),
            (self.v_colmajor, "_vcolmajor"),
        ];
        for (enabled, suffix) in flags {
            if enabled {
                f.write_str(suffix)?;
            }
        }
        Ok(())
    }
}
