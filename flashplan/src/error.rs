use thiserror::Error;

use crate::data_type::DataType;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigurationError {
    #[error(
        "Device does not support asynchronous bulk copy and warp-cooperative execution"
    )]
    UnsupportedDevice,
    #[error("Unsupported element type: {0}")]
    UnsupportedElementType(DataType),
    #[error("Feature \"{0}\" is disabled in this build")]
    FeatureDisabled(&'static str),
    #[error("Invalid variant: {0}")]
    InvalidVariant(&'static str),
    #[error("Invalid policy: {0}")]
    InvalidPolicy(String),
}

#[derive(Debug, Error, PartialEq)]
pub enum ContractError {
    #[error("{name} must have rank {expected}, got {actual}")]
    Rank {
        name: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("{name} must have shape {expected:?}, got {actual:?}")]
    Shape {
        name: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("{name} must have contiguous last dimension")]
    NonContiguousLastDim {
        name: &'static str,
    },
    #[error("{name} stride {stride} must be divisible by {divisor}")]
    StrideAlignment {
        name: &'static str,
        stride: usize,
        divisor: usize,
    },
    #[error("Number of heads in key/value ({num_kv_heads}) must divide number of heads in query ({num_heads})")]
    HeadGrouping {
        num_heads: usize,
        num_kv_heads: usize,
    },
    #[error("{name} must have {expected} entries, got {actual}")]
    OffsetsLength {
        name: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("{name} must be non-decreasing (index {index})")]
    OffsetsDecreasing {
        name: &'static str,
        index: usize,
    },
    #[error("{name} ends at {last}, beyond the {total} available rows")]
    OffsetsOverflow {
        name: &'static str,
        last: usize,
        total: usize,
    },
    #[error("{name}[{index}] = {used} exceeds the sequence length {length}")]
    UsedLengthOverflow {
        name: &'static str,
        index: usize,
        used: usize,
        length: usize,
    },
    #[error("{0} requires {1}")]
    MissingCompanion(&'static str, &'static str),
    #[error("Cache batch size {batch_size_k} must equal batch size {batch_size} without a cache batch index")]
    CacheBatchMismatch {
        batch_size: usize,
        batch_size_k: usize,
    },
    #[error("Cache batch index {index} out of range for {batch_size_k} cache rows")]
    CacheBatchIndex {
        index: usize,
        batch_size_k: usize,
    },
    #[error("Page table entry {page} out of range for {num_pages} pages")]
    PageOutOfRange {
        page: usize,
        num_pages: usize,
    },
    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Error, PartialEq)]
pub enum ResourceLimitError {
    #[error("Head dimension {actual} exceeds the maximum {max}")]
    HeadDim {
        actual: usize,
        max: usize,
    },
    #[error("Number of splits {actual} must be in 1..={max}")]
    NumSplits {
        actual: usize,
        max: usize,
    },
}

#[derive(Debug, Error, PartialEq)]
pub enum MainloopError {
    #[error("Physical page {page} out of range for {num_pages} pages")]
    PageOutOfRange {
        page: i64,
        num_pages: usize,
    },
    #[error("Tile failed: {0}")]
    Tile(String),
    #[error("Launch aborted after a tile failure")]
    Aborted,
}

#[derive(Debug, Error, PartialEq)]
pub enum AccumulationError {
    #[error("Accumulation turn wait aborted at cell {cell}")]
    Aborted {
        cell: usize,
    },
    #[error("Accumulation cell {cell} out of range for {num_cells} cells")]
    CellOutOfRange {
        cell: usize,
        num_cells: usize,
    },
}

#[derive(Debug, Error, PartialEq)]
pub enum AttentionError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),
    #[error("Contract violation: {0}")]
    Contract(#[from] ContractError),
    #[error("Resource limit: {0}")]
    ResourceLimit(#[from] ResourceLimitError),
    #[error("Mainloop error: {0}")]
    Mainloop(#[from] MainloopError),
    #[error("Accumulation error: {0}")]
    Accumulation(#[from] AccumulationError),
}

pub type Result<T> = std::result::Result<T, AttentionError>;
