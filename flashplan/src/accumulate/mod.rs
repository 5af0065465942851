mod buffer;
mod turnstile;

pub use buffer::BlockAccumulator;
pub use turnstile::{AccumulationOrder, AccumulationTurnstile};
