//! Bitonic sort of a fixed-size surface on a compute device.
//!
//! The network sorts `NUM_ELEMENTS` 32-bit cells ascending. Comparisons within a
//! block run in threadgroup memory; longer distances are brought into a block by
//! transposing the surface viewed as a matrix. See [`scheduler`] for the dispatch
//! sequence and [`device`] for the kernel contract.
//!
//! ```no_run
//! use bitonic_transpose_sort::{ReferenceDevice, SortComponent, SortConfig, SortGeometry};
//! use std::time::Duration;
//!
//! let device = ReferenceDevice::new(&SortGeometry::STANDARD);
//! let component = SortComponent::create(&SortConfig::default(), device)?;
//! component.set_input_data(&[[0.5f32, 0.25, 0.0, 1.0]]);
//! component.request_sort([0.0, 0.0, 0.0, 1.0]);
//! component.wait_for_idle(Duration::from_secs(5));
//! # Ok::<(), bitonic_transpose_sort::SortError>(())
//! ```

pub mod capture;
pub mod component;
pub mod config;
pub mod device;
pub mod error;
pub mod geometry;
pub mod metal_device;
pub mod params;
pub mod reference_device;
pub mod resources;
pub mod scheduler;
pub mod state;

pub use component::SortComponent;
pub use config::{FeatureLevel, SortConfig};
pub use device::{BindSlot, ComputeDevice, GroupCount, Kernel, SurfaceReadback};
pub use error::{CaptureError, SortError};
pub use geometry::SortGeometry;
pub use metal_device::MetalDevice;
pub use params::Element;
pub use reference_device::ReferenceDevice;
pub use scheduler::{Dispatch, PassScheduler, RunOutcome, Storage};
pub use state::ExecutionState;
