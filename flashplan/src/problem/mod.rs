mod descriptor;
mod head_dim;
mod sequences;

pub use descriptor::ProblemDescriptor;
pub use head_dim::{HeadDimPadding, check_head_grouping, round_up};
pub use sequences::{BatchSequence, SequenceSpec, SequenceTable};
