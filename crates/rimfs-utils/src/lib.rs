pub mod crc;
pub mod size_parse;
pub mod token_bucket;
pub mod unique_queue;

pub use crc::{crc32, crc32_combine, crc32_zero_block, crc32_zero_expanded};
pub use size_parse::parse_human_size;
pub use token_bucket::TokenBucket;
pub use unique_queue::UniqueQueue;
