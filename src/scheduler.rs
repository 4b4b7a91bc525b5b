//! Pass scheduler for the bitonic/transpose sorting network
//!
//! Sorting `N` cells with a bitonic network needs comparisons up to `N / 2` cells
//! apart, but the Sort Kernel can only compare cells inside its own block. The
//! schedule works in two phases:
//!
//! 1. **Local phase**: for every level up to the block size, sort each block of
//!    the surface in place.
//! 2. **Global phase**: for every larger level, transpose the surface into the
//!    scratch buffer so cells `BLOCK_SIZE` apart become neighbours, sort the
//!    columns there, transpose back, and finish the level's short-distance
//!    comparisons on the rows.
//!
//! The result is a deterministic list of [`Dispatch`]es. [`PassScheduler::run`]
//! replays it against a device.

use std::ops::{Deref, DerefMut};

use log::trace;

use crate::device::{BindSlot, ComputeDevice, GroupCount, Kernel};
use crate::error::SortError;
use crate::geometry::SortGeometry;
use crate::params::{ConstantParameters, PassParams, VariableParameters};
use crate::resources::Views;

/// Storage a dispatch reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Storage {
    Surface,
    Scratch,
}

/// One kernel invocation of the schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dispatch {
    pub kernel: Kernel,
    pub params: PassParams,
    pub groups: GroupCount,
    /// Storage bound to the `Source` slot (transpose only).
    pub source: Option<Storage>,
    /// Storage bound to the `Target` slot.
    pub target: Storage,
}

impl Dispatch {
    fn sort(params: PassParams, groups: GroupCount, target: Storage) -> Self {
        Dispatch {
            kernel: Kernel::Sort,
            params,
            groups,
            source: None,
            target,
        }
    }

    fn transpose(params: PassParams, groups: GroupCount, source: Storage, target: Storage) -> Self {
        Dispatch {
            kernel: Kernel::Transpose,
            params,
            groups,
            source: Some(source),
            target,
        }
    }
}

/// How a run of the schedule ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every dispatch ran.
    Completed { dispatches: usize },
    /// The abort check fired before dispatch number `dispatches`.
    Aborted { dispatches: usize },
}

#[derive(Debug, Clone)]
pub struct PassScheduler {
    geometry: SortGeometry,
}

impl PassScheduler {
    pub fn new(geometry: SortGeometry) -> Self {
        PassScheduler { geometry }
    }

    pub fn geometry(&self) -> &SortGeometry {
        &self.geometry
    }

    /// The full dispatch sequence that sorts the surface ascending.
    pub fn dispatches(&self) -> Vec<Dispatch> {
        let geometry = &self.geometry;
        let n = geometry.num_elements();
        let block = geometry.block_size();
        let width = geometry.matrix_width();
        let height = geometry.matrix_height();
        let rows = geometry.sort_groups();

        let mut dispatches = Vec::with_capacity(geometry.dispatch_count());

        for level in geometry.local_levels() {
            let params = PassParams {
                level,
                level_mask: level,
                height,
                width,
            };
            dispatches.push(Dispatch::sort(params, rows, Storage::Surface));
        }

        for level in geometry.global_levels() {
            // Surface (height x width) -> scratch (width x height).
            let columns = PassParams {
                level: level / block,
                level_mask: (level & !n) / block,
                height: width,
                width: height,
            };
            dispatches.push(Dispatch::transpose(
                columns,
                geometry.transpose_groups(columns.width, columns.height),
                Storage::Surface,
                Storage::Scratch,
            ));
            dispatches.push(Dispatch::sort(
                PassParams {
                    height,
                    width,
                    ..columns
                },
                rows,
                Storage::Scratch,
            ));

            // Scratch back to the surface, then the remaining in-block distances.
            let rows_params = PassParams {
                level: block,
                level_mask: level,
                height,
                width,
            };
            dispatches.push(Dispatch::transpose(
                rows_params,
                geometry.transpose_groups(rows_params.width, rows_params.height),
                Storage::Scratch,
                Storage::Surface,
            ));
            dispatches.push(Dispatch::sort(rows_params, rows, Storage::Surface));
        }

        dispatches
    }

    /// Replay the schedule on `device`.
    ///
    /// `should_abort` is checked before every dispatch; once it returns `true` no
    /// further kernel is dispatched. Both kernels are unbound on every exit path.
    pub fn run<D: ComputeDevice>(
        &self,
        device: &mut D,
        views: &Views<'_, D>,
        constants: &ConstantParameters,
        view_position: [f32; 4],
        mut should_abort: impl FnMut() -> bool,
    ) -> Result<RunOutcome, SortError> {
        let mut device = BindingScope { device };
        let view_of = |storage: Storage| match storage {
            Storage::Surface => views.surface,
            Storage::Scratch => views.scratch,
        };

        let dispatches = self.dispatches();
        for (index, dispatch) in dispatches.iter().enumerate() {
            if should_abort() {
                trace!("aborting sort before dispatch {}/{}", index, dispatches.len());
                return Ok(RunOutcome::Aborted { dispatches: index });
            }

            if let Some(source) = dispatch.source {
                device.bind(dispatch.kernel, BindSlot::Source, view_of(source));
            }
            device.bind(dispatch.kernel, BindSlot::Target, view_of(dispatch.target));

            let variables = VariableParameters {
                view_position,
                pass: dispatch.params,
            };
            device.set_parameters(dispatch.kernel, constants, &variables);

            trace!(
                "dispatch {}: {} {:?} groups {:?}",
                index,
                dispatch.kernel,
                dispatch.params,
                dispatch.groups
            );
            device.dispatch(dispatch.kernel, dispatch.groups)?;
        }

        Ok(RunOutcome::Completed {
            dispatches: dispatches.len(),
        })
    }
}

/// Unbinds both kernels when dropped, so no binding outlives a run.
struct BindingScope<'a, D: ComputeDevice> {
    device: &'a mut D,
}

impl<D: ComputeDevice> Deref for BindingScope<'_, D> {
    type Target = D;

    fn deref(&self) -> &D {
        self.device
    }
}

impl<D: ComputeDevice> DerefMut for BindingScope<'_, D> {
    fn deref_mut(&mut self) -> &mut D {
        self.device
    }
}

impl<D: ComputeDevice> Drop for BindingScope<'_, D> {
    fn drop(&mut self) {
        for kernel in Kernel::ALL {
            self.device.unbind(kernel);
        }
    }
}
