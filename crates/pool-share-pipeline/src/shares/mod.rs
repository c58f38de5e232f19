pub mod queue;
pub mod types;

pub use queue::ShareQueue;
pub use types::ShareRecord;
