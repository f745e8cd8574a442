pub mod pow;
pub mod types;

pub use types::{Block, BlockHeader};
