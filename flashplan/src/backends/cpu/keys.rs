use crate::{
    error::MainloopError, plan::ForwardPlan, problem::BatchSequence,
    tensor::StagedTensor,
};

/// Key rows of one batch row, addressed by logical position.
pub(super) struct KeySource<'a> {
    plan: &'a ForwardPlan,
    batch: usize,
    offset: usize,
}

impl<'a> KeySource<'a> {
    pub fn new(
        plan: &'a ForwardPlan,
        batch: usize,
        sequence: &BatchSequence,
    ) -> Self {
        Self {
            plan,
            batch,
            offset: sequence.k_offset,
        }
    }

    pub fn load(
        &self,
        tensor: &StagedTensor,
        pos: usize,
        head: usize,
        dst: &mut [f32],
    ) -> Result<(), MainloopError> {
        let (row, batch) = self.plan.key_location(self.batch, self.offset + pos)?;
        tensor.load(row, head, batch, dst);
        Ok(())
    }
}
