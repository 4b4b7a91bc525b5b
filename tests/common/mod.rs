//! Helpers shared by the integration tests.

#![allow(dead_code)]

use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};

use bitonic_transpose_sort::device::{
    BindSlot, ComputeDevice, GroupCount, Kernel, SurfaceReadback,
};
use bitonic_transpose_sort::params::{ConstantParameters, VariableParameters};
use bitonic_transpose_sort::{ReferenceDevice, SortConfig, SortError, SortGeometry};

pub const TIMEOUT: Duration = Duration::from_secs(30);

/// The 8-cell network used throughout: two blocks of four, a 4x2 surface.
pub fn toy_geometry() -> SortGeometry {
    SortGeometry::new(8, 4, 1).unwrap()
}

/// A config whose surface matches `geometry`'s matrix.
pub fn config_for(geometry: &SortGeometry) -> SortConfig {
    SortConfig {
        surface_width: geometry.matrix_width(),
        surface_height: geometry.matrix_height(),
        ..SortConfig::default()
    }
}

/// One record whose packed cell is `value` (x channel only).
pub fn record(value: u8) -> [f32; 4] {
    [value as f32 / 255.0, 0.0, 0.0, 0.0]
}

/// Test side of a [`GatedDevice`].
pub struct Gate {
    /// Receives the dispatch index once the worker is parked in front of it.
    pub reached: Receiver<usize>,
    /// Send once to let the parked dispatch run.
    pub release: Sender<()>,
}

/// Reference device that parks the worker inside dispatch number `gate_at`
/// until the test releases it.
pub struct GatedDevice {
    inner: ReferenceDevice,
    gate_at: usize,
    dispatched: usize,
    reached: Sender<usize>,
    release: Receiver<()>,
}

impl GatedDevice {
    pub fn new(inner: ReferenceDevice, gate_at: usize) -> (Self, Gate) {
        let (reached_tx, reached_rx) = crossbeam_channel::unbounded();
        let (release_tx, release_rx) = crossbeam_channel::unbounded();
        let device = GatedDevice {
            inner,
            gate_at,
            dispatched: 0,
            reached: reached_tx,
            release: release_rx,
        };
        let gate = Gate {
            reached: reached_rx,
            release: release_tx,
        };
        (device, gate)
    }
}

impl ComputeDevice for GatedDevice {
    type Surface = <ReferenceDevice as ComputeDevice>::Surface;
    type SurfaceHandle = <ReferenceDevice as ComputeDevice>::SurfaceHandle;
    type Buffer = <ReferenceDevice as ComputeDevice>::Buffer;
    type View = <ReferenceDevice as ComputeDevice>::View;

    fn name(&self) -> String {
        format!("gated {}", self.inner.name())
    }

    fn create_surface(&mut self, width: u32, height: u32) -> Result<Self::Surface, SortError> {
        self.inner.create_surface(width, height)
    }

    fn create_buffer(&mut self, words: usize) -> Result<Self::Buffer, SortError> {
        self.inner.create_buffer(words)
    }

    fn surface_view(&mut self, surface: &Self::Surface) -> Result<Self::View, SortError> {
        self.inner.surface_view(surface)
    }

    fn buffer_view(&mut self, buffer: &Self::Buffer) -> Result<Self::View, SortError> {
        self.inner.buffer_view(buffer)
    }

    fn surface_handle(&self, surface: &Self::Surface) -> Self::SurfaceHandle {
        self.inner.surface_handle(surface)
    }

    fn write_buffer(&mut self, buffer: &Self::Buffer, words: &[u32]) -> Result<(), SortError> {
        self.inner.write_buffer(buffer, words)
    }

    fn clear_view(&mut self, view: &Self::View, value: u32) -> Result<(), SortError> {
        self.inner.clear_view(view, value)
    }

    fn seed_surface(
        &mut self,
        staging: &Self::Buffer,
        surface: &Self::Surface,
    ) -> Result<(), SortError> {
        self.inner.seed_surface(staging, surface)
    }

    fn bind(&mut self, kernel: Kernel, slot: BindSlot, view: &Self::View) {
        self.inner.bind(kernel, slot, view)
    }

    fn set_parameters(
        &mut self,
        kernel: Kernel,
        constants: &ConstantParameters,
        variables: &VariableParameters,
    ) {
        self.inner.set_parameters(kernel, constants, variables)
    }

    fn dispatch(&mut self, kernel: Kernel, groups: GroupCount) -> Result<(), SortError> {
        if self.dispatched == self.gate_at {
            let _ = self.reached.send(self.dispatched);
            let _ = self.release.recv();
        }
        self.dispatched += 1;
        self.inner.dispatch(kernel, groups)
    }

    fn unbind(&mut self, kernel: Kernel) {
        self.inner.unbind(kernel)
    }

    fn read_surface(&mut self, surface: &Self::Surface) -> Result<SurfaceReadback, SortError> {
        self.inner.read_surface(surface)
    }
}

/// Reference device that fails dispatch number `fail_at`, counted across runs.
pub struct FailingDevice {
    inner: ReferenceDevice,
    fail_at: usize,
    panics: bool,
    dispatched: usize,
}

impl FailingDevice {
    pub fn new(inner: ReferenceDevice, fail_at: usize) -> Self {
        FailingDevice {
            inner,
            fail_at,
            panics: false,
            dispatched: 0,
        }
    }

    /// Like [`FailingDevice::new`], but the dispatch panics instead of erroring.
    pub fn panicking(inner: ReferenceDevice, fail_at: usize) -> Self {
        FailingDevice {
            panics: true,
            ..Self::new(inner, fail_at)
        }
    }
}

impl ComputeDevice for FailingDevice {
    type Surface = <ReferenceDevice as ComputeDevice>::Surface;
    type SurfaceHandle = <ReferenceDevice as ComputeDevice>::SurfaceHandle;
    type Buffer = <ReferenceDevice as ComputeDevice>::Buffer;
    type View = <ReferenceDevice as ComputeDevice>::View;

    fn name(&self) -> String {
        format!("failing {}", self.inner.name())
    }

    fn create_surface(&mut self, width: u32, height: u32) -> Result<Self::Surface, SortError> {
        self.inner.create_surface(width, height)
    }

    fn create_buffer(&mut self, words: usize) -> Result<Self::Buffer, SortError> {
        self.inner.create_buffer(words)
    }

    fn surface_view(&mut self, surface: &Self::Surface) -> Result<Self::View, SortError> {
        self.inner.surface_view(surface)
    }

    fn buffer_view(&mut self, buffer: &Self::Buffer) -> Result<Self::View, SortError> {
        self.inner.buffer_view(buffer)
    }

    fn surface_handle(&self, surface: &Self::Surface) -> Self::SurfaceHandle {
        self.inner.surface_handle(surface)
    }

    fn write_buffer(&mut self, buffer: &Self::Buffer, words: &[u32]) -> Result<(), SortError> {
        self.inner.write_buffer(buffer, words)
    }

    fn clear_view(&mut self, view: &Self::View, value: u32) -> Result<(), SortError> {
        self.inner.clear_view(view, value)
    }

    fn seed_surface(
        &mut self,
        staging: &Self::Buffer,
        surface: &Self::Surface,
    ) -> Result<(), SortError> {
        self.inner.seed_surface(staging, surface)
    }

    fn bind(&mut self, kernel: Kernel, slot: BindSlot, view: &Self::View) {
        self.inner.bind(kernel, slot, view)
    }

    fn set_parameters(
        &mut self,
        kernel: Kernel,
        constants: &ConstantParameters,
        variables: &VariableParameters,
    ) {
        self.inner.set_parameters(kernel, constants, variables)
    }

    fn dispatch(&mut self, kernel: Kernel, groups: GroupCount) -> Result<(), SortError> {
        let index = self.dispatched;
        self.dispatched += 1;
        if index == self.fail_at {
            if self.panics {
                panic!("injected panic at dispatch {}", index);
            }
            return Err(SortError::GpuExecution(format!(
                "injected failure at dispatch {}",
                index
            )));
        }
        self.inner.dispatch(kernel, groups)
    }

    fn unbind(&mut self, kernel: Kernel) {
        self.inner.unbind(kernel)
    }

    fn read_surface(&mut self, surface: &Self::Surface) -> Result<SurfaceReadback, SortError> {
        self.inner.read_surface(surface)
    }
}
