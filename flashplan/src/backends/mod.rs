pub mod cpu;

use crate::{
    error::{ConfigurationError, MainloopError},
    plan::{BackwardPlan, ForwardPlan},
    scheduler::WorkTile,
    tensor::StagedTensor,
};

/// Execution features of the device running the mainloop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCapabilities {
    pub async_bulk_copy: bool,
    pub warp_cooperative: bool,
    pub compute_units: usize,
}

impl DeviceCapabilities {
    pub fn check(&self) -> Result<(), ConfigurationError> {
        if self.async_bulk_copy && self.warp_cooperative {
            Ok(())
        } else {
            Err(ConfigurationError::UnsupportedDevice)
        }
    }
}

/// Operands of a forward launch after staging.
#[derive(Debug, Clone, Copy)]
pub struct ForwardInputs<'a> {
    pub q: &'a StagedTensor,
    pub k: &'a StagedTensor,
    pub v: &'a StagedTensor,
}

/// One finished query row of a forward tile.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputRow {
    /// Row index in the destination sequence axis.
    pub row: usize,
    pub head: usize,
    /// Batch index in the destination, `0` for ragged outputs.
    pub batch: usize,
    pub lse: f32,
    pub out: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct TileOutput {
    pub split: usize,
    pub rows: Vec<OutputRow>,
}

/// Operands of a backward launch after staging. `lse` holds the natural
/// log-sum-exp and `softmax_d` the row sums of `dO ∘ O`, both addressed
/// through the plan's statistics layout.
#[derive(Debug, Clone, Copy)]
pub struct BackwardInputs<'a> {
    pub q: &'a StagedTensor,
    pub k: &'a StagedTensor,
    pub v: &'a StagedTensor,
    pub dout: &'a StagedTensor,
    pub lse: &'a [f32],
    pub softmax_d: &'a [f32],
}

/// Query-gradient contribution of a key tile to one query block,
/// `block_m` rows of accumulator width.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockContribution {
    pub block: usize,
    pub values: Vec<f32>,
}

/// Gradients produced by one key tile. `dk` and `dv` hold `block_n` rows of
/// accumulator width.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TileGradients {
    pub dq: Vec<BlockContribution>,
    pub dk: Vec<f32>,
    pub dv: Vec<f32>,
}

/// The per-tile compute of attention.
///
/// Implementations only read the plan and inputs, so tiles of one launch
/// may run concurrently on any number of workers.
pub trait AttentionMainloop: Send + Sync {
    fn capabilities(&self) -> DeviceCapabilities;

    fn forward_tile(
        &self,
        plan: &ForwardPlan,
        inputs: &ForwardInputs<'_>,
        tile: &WorkTile,
    ) -> Result<TileOutput, MainloopError>;

    /// Each query block of the tile's row may be reported at most once;
    /// blocks left out contribute nothing.
    fn backward_tile(
        &self,
        plan: &BackwardPlan,
        inputs: &BackwardInputs<'_>,
        tile: &WorkTile,
    ) -> Result<TileGradients, MainloopError>;
}
