//! Error types.

use crate::config::FeatureLevel;
use crate::device::{BindSlot, Kernel};

/// Errors raised while building or running the sorting network.
#[derive(Debug, thiserror::Error)]
pub enum SortError {
    #[error("invalid sort geometry: {0}")]
    InvalidGeometry(String),
    #[error("feature level {0:?} does not support compute kernels")]
    UnsupportedFeatureLevel(FeatureLevel),
    #[error(
        "surface is {width}x{height}, the sort matrix needs {expected_width}x{expected_height}"
    )]
    SurfaceSize {
        width: u32,
        height: u32,
        expected_width: u32,
        expected_height: u32,
    },
    #[error("no compute device available: {0}")]
    DeviceUnavailable(String),
    #[error("shader compilation failed: {0}")]
    ShaderCompilation(String),
    #[error("resource allocation failed: {0}")]
    ResourceAllocation(String),
    #[error("{kernel} kernel has no view bound to its {slot:?} slot")]
    Unbound { kernel: Kernel, slot: BindSlot },
    #[error("{0} kernel dispatched before its parameters were set")]
    MissingParameters(Kernel),
    #[error("invalid {kernel} dispatch: {reason}")]
    InvalidDispatch { kernel: Kernel, reason: String },
    #[error("GPU execution failed: {0}")]
    GpuExecution(String),
    #[error("device views were already released")]
    ViewsReleased,
    #[error("failed to spawn sort worker: {0}")]
    WorkerSpawn(#[source] std::io::Error),
    #[error("failed to read config file: {0}")]
    ConfigRead(#[source] std::io::Error),
    #[error("invalid config: {0}")]
    ConfigParse(#[from] toml::de::Error),
}

/// Errors raised while capturing the sorted surface to an image.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("surface readback produced no pixels")]
    NoPixels,
    #[error("row stride of {stride} bytes cannot hold {width} pixels")]
    Stride { stride: usize, width: u32 },
    #[error("readback holds {actual} bytes, expected at least {expected}")]
    Truncated { actual: usize, expected: usize },
    #[error("surface readback failed: {0}")]
    Device(#[from] SortError),
    #[error("failed to create screenshot directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to write bitmap: {0}")]
    Image(#[from] image::ImageError),
}
