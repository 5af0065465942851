mod backward;
mod forward;
mod launch;

pub use backward::BackwardOutput;
pub use forward::{ForwardOutput, KvCacheArgs, RotaryArgs, VarlenArgs};
use ndarray::ArrayViewD;
use serde::Serialize;

use crate::{
    backends::AttentionMainloop,
    combine::{CombineOutput, combine_partials},
    config::EnginePolicy,
    data_type::CombineElement,
    dispatch::VariantRegistry,
    error::Result,
    plan::ForwardPlan,
    scheduler::SchedulerKind,
};

/// What a forward launch decided, for inspection and logging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanSummary {
    pub variant: String,
    pub scheduler: SchedulerKind,
    pub block_m: usize,
    pub block_n: usize,
    pub cluster_m: usize,
    pub pack_gqa: bool,
    pub num_splits: usize,
    pub num_workers: usize,
    pub total_tiles: usize,
}

impl PlanSummary {
    pub fn new(plan: &ForwardPlan) -> Self {
        Self {
            variant: plan.variant.name(),
            scheduler: plan.variant.scheduler,
            block_m: plan.variant.tile.block_m,
            block_n: plan.variant.tile.block_n,
            cluster_m: plan.cluster_m,
            pack_gqa: plan.pack_gqa,
            num_splits: plan.num_splits,
            num_workers: plan.scheduler.num_workers,
            total_tiles: plan.scheduler.total_tiles(),
        }
    }
}

/// Plans and runs attention launches on one mainloop.
#[derive(Debug)]
pub struct AttentionEngine<M: AttentionMainloop> {
    mainloop: M,
    policy: EnginePolicy,
    registry: VariantRegistry,
}

impl<M: AttentionMainloop> AttentionEngine<M> {
    pub fn new(
        mainloop: M,
        policy: EnginePolicy,
    ) -> Result<Self> {
        mainloop.capabilities().check()?;
        policy.validate()?;
        let registry = VariantRegistry::new(&policy.scheduler);
        log::debug!("registered {} kernel variants", registry.len());
        Ok(Self {
            mainloop,
            policy,
            registry,
        })
    }

    pub fn mainloop(&self) -> &M {
        &self.mainloop
    }

    pub fn policy(&self) -> &EnginePolicy {
        &self.policy
    }

    pub fn registry(&self) -> &VariantRegistry {
        &self.registry
    }

    /// Parallel compute units used per launch.
    pub fn num_workers(&self) -> usize {
        self.policy
            .num_workers
            .unwrap_or(self.mainloop.capabilities().compute_units)
            .max(1)
    }

    /// Merges externally produced split results.
    pub fn combine<O: CombineElement>(
        &self,
        out_partial: &ArrayViewD<'_, f32>,
        lse_partial: &ArrayViewD<'_, f32>,
    ) -> Result<CombineOutput<O>> {
        combine_partials(out_partial, lse_partial, self.policy.max_num_splits)
    }
}
