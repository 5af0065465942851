mod backward;
mod dropout;
mod forward;
mod keys;

pub use dropout::DropoutMask;

use super::{
    AttentionMainloop, BackwardInputs, DeviceCapabilities, ForwardInputs,
    TileGradients, TileOutput,
};
use crate::{
    error::MainloopError,
    plan::{BackwardPlan, ForwardPlan},
    scheduler::WorkTile,
};

/// Reference mainloop running every tile on the host in f32.
#[derive(Debug, Clone)]
pub struct CpuMainloop {
    capabilities: DeviceCapabilities,
}

impl CpuMainloop {
    pub fn new() -> Self {
        let compute_units = std::thread::available_parallelism()
            .map(|units| units.get())
            .unwrap_or(1);
        Self::with_capabilities(DeviceCapabilities {
            async_bulk_copy: true,
            warp_cooperative: true,
            compute_units,
        })
    }

    pub fn with_capabilities(capabilities: DeviceCapabilities) -> Self {
        Self {
            capabilities,
        }
    }
}

impl Default for CpuMainloop {
    fn default() -> Self {
        Self::new()
    }
}

impl AttentionMainloop for CpuMainloop {
    fn capabilities(&self) -> DeviceCapabilities {
        self.capabilities
    }

    fn forward_tile(
        &self,
        plan: &ForwardPlan,
        inputs: &ForwardInputs<'_>,
        tile: &WorkTile,
    ) -> Result<TileOutput, MainloopError> {
        forward::forward_tile(plan, inputs, tile)
    }

    fn backward_tile(
        &self,
        plan: &BackwardPlan,
        inputs: &BackwardInputs<'_>,
        tile: &WorkTile,
    ) -> Result<TileGradients, MainloopError> {
        backward::backward_tile(plan, inputs, tile)
    }
}

fn dot(
    a: &[f32],
    b: &[f32],
) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}
