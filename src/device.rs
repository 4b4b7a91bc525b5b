//! Compute device contract
//!
//! The sorting core only talks to the device through [`ComputeDevice`]: it
//! allocates one surface and two linear buffers, creates writable views on them,
//! binds views to the two kernels and dispatches workgroup grids.
//!
//! ## Kernels
//!
//! **Sort** (`BLOCK_SIZE x 1 x 1` threads per group). Group `g` owns the cells
//! `[g * BLOCK_SIZE, (g + 1) * BLOCK_SIZE)` of the view bound to [`BindSlot::Target`].
//! For `j = level / 2, level / 4, ..., 1` each thread `gi` (global index `i`)
//! synchronously replaces its cell with
//!
//! ```text
//! ((s[gi & !j] <= s[gi | j]) == ((level_mask & i) != 0)) ? s[gi ^ j] : s[gi]
//! ```
//!
//! **Transpose** (`T x T x 1` threads per group). Thread `(x, y)`, `x < width`,
//! `y < height`, performs `target[y * width + x] = source[x * height + y]`.

use std::fmt;

use crate::error::SortError;
use crate::params::{ConstantParameters, VariableParameters};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kernel {
    Sort,
    Transpose,
}

impl Kernel {
    pub const ALL: [Kernel; 2] = [Kernel::Sort, Kernel::Transpose];

    pub fn name(&self) -> &'static str {
        match self {
            Kernel::Sort => "sort",
            Kernel::Transpose => "transpose",
        }
    }
}

impl fmt::Display for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Binding slot on a kernel. The Sort Kernel only reads and writes `Target`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindSlot {
    Source,
    Target,
}

/// Number of workgroups in each dimension of a dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupCount {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl GroupCount {
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        GroupCount { x, y, z }
    }

    pub fn total(&self) -> u64 {
        self.x as u64 * self.y as u64 * self.z as u64
    }
}

/// Bytes read back from a surface. Rows start `row_stride` bytes apart, which may
/// exceed `width * 4`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SurfaceReadback {
    pub width: u32,
    pub height: u32,
    pub row_stride: usize,
    pub bytes: Vec<u8>,
}

/// Resource layer and kernels of a compute device.
///
/// Resources are owned values: dropping a surface, buffer or view releases it.
/// Views bound to a kernel stay alive in the device until [`unbind`](ComputeDevice::unbind).
pub trait ComputeDevice: Send + 'static {
    type Surface: Send;
    /// Shareable handle downstream consumers sample the sorted surface through.
    type SurfaceHandle: Clone + Send + Sync + 'static;
    type Buffer: Send;
    type View: Send;

    fn name(&self) -> String;

    /// Allocate a `width x height` surface of 32-bit cells.
    fn create_surface(&mut self, width: u32, height: u32) -> Result<Self::Surface, SortError>;

    /// Allocate a zeroed linear buffer of `words` 32-bit words.
    fn create_buffer(&mut self, words: usize) -> Result<Self::Buffer, SortError>;

    fn surface_view(&mut self, surface: &Self::Surface) -> Result<Self::View, SortError>;

    fn buffer_view(&mut self, buffer: &Self::Buffer) -> Result<Self::View, SortError>;

    fn surface_handle(&self, surface: &Self::Surface) -> Self::SurfaceHandle;

    /// Copy `words` into the start of `buffer`.
    fn write_buffer(&mut self, buffer: &Self::Buffer, words: &[u32]) -> Result<(), SortError>;

    /// Fill every word behind `view` with `value`.
    fn clear_view(&mut self, view: &Self::View, value: u32) -> Result<(), SortError>;

    /// Seed the surface from a staging buffer of [`Element`](crate::params::Element)
    /// records: cell `i` becomes `staging[i].pack()`.
    fn seed_surface(
        &mut self,
        staging: &Self::Buffer,
        surface: &Self::Surface,
    ) -> Result<(), SortError>;

    fn bind(&mut self, kernel: Kernel, slot: BindSlot, view: &Self::View);

    fn set_parameters(
        &mut self,
        kernel: Kernel,
        constants: &ConstantParameters,
        variables: &VariableParameters,
    );

    /// Run `kernel` over `groups` workgroups and wait for it to finish.
    fn dispatch(&mut self, kernel: Kernel, groups: GroupCount) -> Result<(), SortError>;

    /// Drop every view bound to `kernel`.
    fn unbind(&mut self, kernel: Kernel);

    fn read_surface(&mut self, surface: &Self::Surface) -> Result<SurfaceReadback, SortError>;
}
