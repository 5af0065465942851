mod features;
mod pack_gqa;
mod registry;
mod tile_size;

pub use features::{HeadDimBucket, VariantFeatures, VariantKey};
pub use pack_gqa::{resolve_pack_gqa, should_pack_gqa};
pub use registry::{KernelVariant, VariantRegistry};
pub use tile_size::{BackwardTileConfig, TileConfig};
