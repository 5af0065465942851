#[cfg(test)]
#[macro_use]
extern crate is_close;

pub mod accumulate;

pub mod backends;
pub use backends::{AttentionMainloop, DeviceCapabilities, cpu::CpuMainloop};

pub mod combine;

pub mod config;
pub use config::{BackwardParams, Descale, Dropout, EnginePolicy, ForwardParams};

pub mod data_type;
pub use data_type::{ArrayElement, AttentionElement, DataType, F8E4M3};

pub mod dispatch;

pub mod engine;
pub use engine::{
    AttentionEngine, BackwardOutput, ForwardOutput, KvCacheArgs, PlanSummary,
    RotaryArgs, VarlenArgs,
};

pub mod error;
pub use error::{AttentionError, Result};

pub mod mask;
pub mod plan;
pub mod problem;
pub mod scheduler;
pub mod tensor;
