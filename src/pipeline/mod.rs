pub mod export;
pub mod frames;
pub mod pipeline;
