mod block_range;
mod window;

pub use block_range::{BlockRange, SplitIndex};
pub use window::{AttentionMask, MaskKind, resolve_window};
