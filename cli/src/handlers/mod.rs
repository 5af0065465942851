mod plan;
mod policy;
mod run;

use std::{error::Error, fs};

use clap::{Args, ValueEnum};
use flashplan::{
    AttentionEngine, CpuMainloop, DataType, EnginePolicy, ForwardParams,
};
pub use plan::handle_plan;
pub use policy::handle_policy;
pub use run::handle_run;

pub type HandlerResult = Result<(), Box<dyn Error>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ElementType {
    F16,
    Bf16,
    F8,
}

impl From<ElementType> for DataType {
    fn from(element: ElementType) -> Self {
        match element {
            ElementType::F16 => DataType::F16,
            ElementType::Bf16 => DataType::BF16,
            ElementType::F8 => DataType::F8E4M3,
        }
    }
}

/// Shape and options of one fixed-length attention problem.
#[derive(Debug, Clone, Args)]
pub struct ProblemArgs {
    #[arg(long, default_value_t = 1)]
    pub batch: usize,
    #[arg(long, default_value_t = 128)]
    pub seqlen_q: usize,
    #[arg(long, default_value_t = 128)]
    pub seqlen_k: usize,
    #[arg(long, default_value_t = 8)]
    pub heads: usize,
    /// Key/value heads, defaults to `--heads`
    #[arg(long)]
    pub heads_k: Option<usize>,
    #[arg(long, default_value_t = 64)]
    pub head_dim: usize,
    #[arg(long, value_enum, default_value_t = ElementType::F16)]
    pub dtype: ElementType,
    #[arg(long)]
    pub causal: bool,
    /// Left window size, -1 for unbounded
    #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
    pub window_left: i64,
    /// Right window size, -1 for unbounded
    #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
    pub window_right: i64,
    #[arg(long, default_value_t = 0.0)]
    pub softcap: f32,
    #[arg(long, default_value_t = 1)]
    pub splits: usize,
    /// JSON engine policy file
    #[arg(long)]
    pub policy: Option<String>,
    /// Parallel workers, overriding the policy
    #[arg(long)]
    pub workers: Option<usize>,
}

impl ProblemArgs {
    pub fn heads_k(&self) -> usize {
        self.heads_k.unwrap_or(self.heads)
    }

    pub fn q_shape(&self) -> [usize; 4] {
        [self.batch, self.seqlen_q, self.heads, self.head_dim]
    }

    pub fn k_shape(&self) -> [usize; 4] {
        [self.batch, self.seqlen_k, self.heads_k(), self.head_dim]
    }

    pub fn params(&self) -> ForwardParams {
        let mut params = ForwardParams::new(self.head_dim)
            .window(self.window_left, self.window_right)
            .splits(self.splits);
        params.is_causal = self.causal;
        params.softcap = self.softcap;
        params
    }

    pub fn engine(&self) -> Result<AttentionEngine<CpuMainloop>, Box<dyn Error>> {
        let mut policy = load_policy(self.policy.as_deref())?;
        if self.workers.is_some() {
            policy.num_workers = self.workers;
        }
        Ok(AttentionEngine::new(CpuMainloop::new(), policy)?)
    }
}

pub fn load_policy(path: Option<&str>) -> Result<EnginePolicy, Box<dyn Error>> {
    match path {
        Some(path) => {
            let json = fs::read_to_string(path)?;
            Ok(EnginePolicy::from_json(&json)?)
        },
        None => Ok(EnginePolicy::default()),
    }
}
