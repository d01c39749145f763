pub mod gpu_pipeline;
pub mod pool;
pub mod warp;
