use crate::state::RequestId;

pub type WarpResult<T> = Result<T, WarpError>;

#[derive(thiserror::Error, Debug)]
pub enum WarpError {
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    #[error("invalid image: {0}")]
    InvalidImage(String),

    #[error("invalid result size {width}x{height}")]
    InvalidResultSize { width: u32, height: u32 },

    #[error("request {0} is already pending")]
    DuplicateRequest(RequestId),

    #[error("warp worker {0} is unavailable")]
    WorkerUnavailable(usize),

    #[error("dispatcher shut down before request {0} completed")]
    Disconnected(RequestId),

    #[error("no compatible gpu adapter")]
    GpuUnavailable,

    #[error("gpu setup failed: {0}")]
    GpuSetup(String),

    #[error("gpu draw failed: {0}")]
    GpuDraw(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl WarpError {
    pub fn geometry(msg: impl Into<String>) -> Self {
        Self::InvalidGeometry(msg.into())
    }

    pub fn image(msg: impl Into<String>) -> Self {
        Self::InvalidImage(msg.into())
    }

    pub fn gpu_setup(msg: impl Into<String>) -> Self {
        Self::GpuSetup(msg.into())
    }

    pub fn gpu_draw(msg: impl Into<String>) -> Self {
        Self::GpuDraw(msg.into())
    }
}
