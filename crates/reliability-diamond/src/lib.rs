mod identify;
mod storage;
mod types;

pub use identify::{identify_and_group_diamonds, identify_diamond_at_join};
pub use storage::{build_unique_diamond_storage, build_unique_diamond_storage_parallel};
pub use types::{diamond_hash, Diamond, DiamondComputationData, DiamondHash, DiamondsAtNode, UniqueDiamondStorage};
