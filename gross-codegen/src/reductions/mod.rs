//! Graph-level optimization passes driven by the fix-point reducer.

mod cse;
mod dce;
mod memory;
mod peephole;
mod value_promotion;

pub use self::cse::CseReducer;
pub use self::dce::{run_dce, DceReducer};
pub use self::memory::{AllocationLayout, MemAllocationLowering, MemoryLegalize, MemoryNormalize};
pub use self::peephole::PeepholeReducer;
pub use self::value_promotion::ValuePromotion;
