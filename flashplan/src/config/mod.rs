mod attention_params;
mod engine_policy;

pub use attention_params::{BackwardParams, Descale, Dropout, ForwardParams};
pub use engine_policy::{EnginePolicy, SchedulerPolicy};
