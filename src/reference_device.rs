//! CPU reference device
//!
//! Emulates the Sort and Transpose kernels exactly as the device contract in
//! [`crate::device`] describes them, running workgroups in parallel with rayon.
//! Every allocation and release is counted in a [`ResourceLedger`], which makes the
//! device useful for checking resource lifetimes as well as sort results.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rayon::prelude::*;

use crate::device::{BindSlot, ComputeDevice, GroupCount, Kernel, SurfaceReadback};
use crate::error::SortError;
use crate::geometry::SortGeometry;
use crate::params::{ConstantParameters, Element, VariableParameters};

/// Default row alignment of surface readbacks, in bytes.
const DEFAULT_ROW_ALIGNMENT: usize = 256;
/// Fill byte for readback row padding.
const PADDING_BYTE: u8 = 0xCD;

/// One kernel invocation as seen by the device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DispatchRecord {
    pub kernel: Kernel,
    pub groups: GroupCount,
    pub variables: VariableParameters,
}

/// Counts of resources created and released by a [`ReferenceDevice`].
#[derive(Debug, Default)]
pub struct ResourceLedger {
    storages_created: AtomicUsize,
    storages_released: AtomicUsize,
    views_created: AtomicUsize,
    views_released: AtomicUsize,
    unbinds: AtomicUsize,
    history: Mutex<Vec<DispatchRecord>>,
}

impl ResourceLedger {
    /// Surfaces and buffers created.
    pub fn storages_created(&self) -> usize {
        self.storages_created.load(Ordering::SeqCst)
    }

    /// Surfaces and buffers whose memory has been freed.
    pub fn storages_released(&self) -> usize {
        self.storages_released.load(Ordering::SeqCst)
    }

    pub fn views_created(&self) -> usize {
        self.views_created.load(Ordering::SeqCst)
    }

    pub fn views_released(&self) -> usize {
        self.views_released.load(Ordering::SeqCst)
    }

    /// `unbind` calls received.
    pub fn unbinds(&self) -> usize {
        self.unbinds.load(Ordering::SeqCst)
    }

    pub fn dispatches(&self) -> usize {
        self.history().len()
    }

    /// Every dispatch so far, oldest first.
    pub fn history(&self) -> Vec<DispatchRecord> {
        lock(&self.history).clone()
    }

    /// True when everything created has been released.
    pub fn all_released(&self) -> bool {
        self.storages_created() == self.storages_released()
            && self.views_created() == self.views_released()
    }
}

/// Backing memory of a surface or buffer.
#[derive(Debug)]
struct DeviceMemory {
    words: Mutex<Vec<u32>>,
    ledger: Arc<ResourceLedger>,
}

impl DeviceMemory {
    fn new(words: usize, ledger: &Arc<ResourceLedger>) -> Arc<Self> {
        ledger.storages_created.fetch_add(1, Ordering::SeqCst);
        Arc::new(DeviceMemory {
            words: Mutex::new(vec![0; words]),
            ledger: Arc::clone(ledger),
        })
    }

    fn words(&self) -> MutexGuard<'_, Vec<u32>> {
        lock(&self.words)
    }
}

impl Drop for DeviceMemory {
    fn drop(&mut self) {
        self.ledger.storages_released.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug)]
pub struct ReferenceSurface {
    storage: Arc<DeviceMemory>,
    width: u32,
    height: u32,
}

#[derive(Debug)]
pub struct ReferenceBuffer {
    storage: Arc<DeviceMemory>,
}

#[derive(Debug)]
pub struct ReferenceView {
    storage: Arc<DeviceMemory>,
}

impl Drop for ReferenceView {
    fn drop(&mut self) {
        self.storage.ledger.views_released.fetch_add(1, Ordering::SeqCst);
    }
}

/// Read access to a surface for downstream consumers.
#[derive(Debug, Clone)]
pub struct ReferenceSurfaceHandle {
    storage: Arc<DeviceMemory>,
    width: u32,
    height: u32,
}

impl ReferenceSurfaceHandle {
    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Snapshot of all cells, row-major.
    pub fn cells(&self) -> Vec<u32> {
        self.storage.words().clone()
    }
}

/// CPU implementation of [`ComputeDevice`].
pub struct ReferenceDevice {
    block_size: u32,
    transpose_block: u32,
    row_alignment: usize,
    ledger: Arc<ResourceLedger>,
    bindings: HashMap<(Kernel, BindSlot), Arc<DeviceMemory>>,
    parameters: HashMap<Kernel, VariableParameters>,
}

impl ReferenceDevice {
    /// Device whose kernels are built for `geometry`'s block and tile sizes.
    pub fn new(geometry: &SortGeometry) -> Self {
        ReferenceDevice {
            block_size: geometry.block_size(),
            transpose_block: geometry.transpose_block(),
            row_alignment: DEFAULT_ROW_ALIGNMENT,
            ledger: Arc::new(ResourceLedger::default()),
            bindings: HashMap::new(),
            parameters: HashMap::new(),
        }
    }

    /// Pad readback rows to a multiple of `alignment` bytes.
    pub fn with_row_alignment(mut self, alignment: usize) -> Self {
        self.row_alignment = alignment.max(1);
        self
    }

    pub fn ledger(&self) -> Arc<ResourceLedger> {
        Arc::clone(&self.ledger)
    }

    /// Overwrite the surface cells directly.
    pub fn write_surface(
        &mut self,
        surface: &ReferenceSurface,
        cells: &[u32],
    ) -> Result<(), SortError> {
        copy_into(&surface.storage, cells)
    }

    fn bound(&self, kernel: Kernel, slot: BindSlot) -> Result<&Arc<DeviceMemory>, SortError> {
        self.bindings
            .get(&(kernel, slot))
            .ok_or(SortError::Unbound { kernel, slot })
    }

    fn run_sort(&self, groups: GroupCount, params: &VariableParameters) -> Result<(), SortError> {
        let target = self.bound(Kernel::Sort, BindSlot::Target)?;
        let block = self.block_size as usize;
        let level = params.pass.level;
        let level_mask = params.pass.level_mask;

        let mut words = target.words();
        let group_total = groups.total() as usize;
        if group_total * block > words.len() {
            return Err(SortError::InvalidDispatch {
                kernel: Kernel::Sort,
                reason: format!(
                    "{} groups of {} cells exceed a view of {} cells",
                    group_total,
                    block,
                    words.len()
                ),
            });
        }

        words
            .par_chunks_mut(block)
            .take(group_total)
            .enumerate()
            .for_each(|(group, cells)| {
                let base = (group * block) as u32;
                let mut shared = cells.to_vec();
                let mut next = vec![0u32; block];
                let mut j = level >> 1;
                while j > 0 {
                    let ju = j as usize;
                    for (gi, out) in next.iter_mut().enumerate() {
                        let descending = (level_mask & (base + gi as u32)) != 0;
                        let ordered = shared[gi & !ju] <= shared[gi | ju];
                        *out = if ordered == descending {
                            shared[gi ^ ju]
                        } else {
                            shared[gi]
                        };
                    }
                    std::mem::swap(&mut shared, &mut next);
                    j >>= 1;
                }
                cells.copy_from_slice(&shared);
            });
        Ok(())
    }

    fn run_transpose(
        &self,
        groups: GroupCount,
        params: &VariableParameters,
    ) -> Result<(), SortError> {
        let source = self.bound(Kernel::Transpose, BindSlot::Source)?;
        let target = self.bound(Kernel::Transpose, BindSlot::Target)?;
        let invalid = |reason: String| SortError::InvalidDispatch {
            kernel: Kernel::Transpose,
            reason,
        };

        if Arc::ptr_eq(source, target) {
            return Err(invalid("source and target are the same storage".into()));
        }
        let width = params.pass.width as usize;
        let height = params.pass.height as usize;
        let tile = self.transpose_block as usize;
        if groups.z != 1
            || groups.x as usize * tile != width
            || groups.y as usize * tile != height
        {
            return Err(invalid(format!(
                "groups {:?} of {}x{} threads do not cover a {}x{} grid",
                groups, tile, tile, width, height
            )));
        }

        let source = source.words();
        let mut target = target.words();
        if source.len() < width * height || target.len() < width * height {
            return Err(invalid(format!(
                "a {}x{} transpose needs {} cells, views hold {} and {}",
                width,
                height,
                width * height,
                source.len(),
                target.len()
            )));
        }

        target
            .par_chunks_mut(width)
            .take(height)
            .enumerate()
            .for_each(|(y, row)| {
                for (x, cell) in row.iter_mut().enumerate() {
                    *cell = source[x * height + y];
                }
            });
        Ok(())
    }
}

impl ComputeDevice for ReferenceDevice {
    type Surface = ReferenceSurface;
    type SurfaceHandle = ReferenceSurfaceHandle;
    type Buffer = ReferenceBuffer;
    type View = ReferenceView;

    fn name(&self) -> String {
        format!("CPU reference ({} rayon threads)", rayon::current_num_threads())
    }

    fn create_surface(&mut self, width: u32, height: u32) -> Result<Self::Surface, SortError> {
        if width == 0 || height == 0 {
            return Err(SortError::ResourceAllocation(format!(
                "surface of {}x{} cells",
                width, height
            )));
        }
        Ok(ReferenceSurface {
            storage: DeviceMemory::new(width as usize * height as usize, &self.ledger),
            width,
            height,
        })
    }

    fn create_buffer(&mut self, words: usize) -> Result<Self::Buffer, SortError> {
        if words == 0 {
            return Err(SortError::ResourceAllocation("empty buffer".into()));
        }
        Ok(ReferenceBuffer {
            storage: DeviceMemory::new(words, &self.ledger),
        })
    }

    fn surface_view(&mut self, surface: &Self::Surface) -> Result<Self::View, SortError> {
        Ok(self.view_of(&surface.storage))
    }

    fn buffer_view(&mut self, buffer: &Self::Buffer) -> Result<Self::View, SortError> {
        Ok(self.view_of(&buffer.storage))
    }

    fn surface_handle(&self, surface: &Self::Surface) -> Self::SurfaceHandle {
        ReferenceSurfaceHandle {
            storage: Arc::clone(&surface.storage),
            width: surface.width,
            height: surface.height,
        }
    }

    fn write_buffer(&mut self, buffer: &Self::Buffer, words: &[u32]) -> Result<(), SortError> {
        copy_into(&buffer.storage, words)
    }

    fn clear_view(&mut self, view: &Self::View, value: u32) -> Result<(), SortError> {
        view.storage.words().fill(value);
        Ok(())
    }

    fn seed_surface(
        &mut self,
        staging: &Self::Buffer,
        surface: &Self::Surface,
    ) -> Result<(), SortError> {
        let staging = staging.storage.words();
        let records: &[Element] = bytemuck::try_cast_slice(&staging[..])
            .map_err(|e| SortError::InvalidDispatch {
                kernel: Kernel::Sort,
                reason: format!("staging buffer does not hold whole records: {}", e),
            })?;
        let mut cells = surface.storage.words();
        for (cell, record) in cells.iter_mut().zip(records) {
            *cell = record.pack();
        }
        Ok(())
    }

    fn bind(&mut self, kernel: Kernel, slot: BindSlot, view: &Self::View) {
        self.bindings.insert((kernel, slot), Arc::clone(&view.storage));
    }

    fn set_parameters(
        &mut self,
        kernel: Kernel,
        _constants: &ConstantParameters,
        variables: &VariableParameters,
    ) {
        self.parameters.insert(kernel, *variables);
    }

    fn dispatch(&mut self, kernel: Kernel, groups: GroupCount) -> Result<(), SortError> {
        let variables = *self
            .parameters
            .get(&kernel)
            .ok_or(SortError::MissingParameters(kernel))?;

        match kernel {
            Kernel::Sort => self.run_sort(groups, &variables)?,
            Kernel::Transpose => self.run_transpose(groups, &variables)?,
        }

        lock(&self.ledger.history).push(DispatchRecord {
            kernel,
            groups,
            variables,
        });
        Ok(())
    }

    fn unbind(&mut self, kernel: Kernel) {
        self.bindings.retain(|&(bound, _), _| bound != kernel);
        self.ledger.unbinds.fetch_add(1, Ordering::SeqCst);
    }

    fn read_surface(&mut self, surface: &Self::Surface) -> Result<SurfaceReadback, SortError> {
        let row_bytes = surface.width as usize * 4;
        let row_stride = row_bytes.div_ceil(self.row_alignment) * self.row_alignment;
        let mut bytes = vec![PADDING_BYTE; row_stride * surface.height as usize];

        let cells = surface.storage.words();
        for (row, chunk) in cells.chunks(surface.width as usize).enumerate() {
            let start = row * row_stride;
            for (i, cell) in chunk.iter().enumerate() {
                bytes[start + i * 4..start + i * 4 + 4].copy_from_slice(&cell.to_le_bytes());
            }
        }

        Ok(SurfaceReadback {
            width: surface.width,
            height: surface.height,
            row_stride,
            bytes,
        })
    }
}

impl ReferenceDevice {
    fn view_of(&self, storage: &Arc<DeviceMemory>) -> ReferenceView {
        self.ledger.views_created.fetch_add(1, Ordering::SeqCst);
        ReferenceView {
            storage: Arc::clone(storage),
        }
    }
}

fn copy_into(storage: &DeviceMemory, data: &[u32]) -> Result<(), SortError> {
    let mut words = storage.words();
    if data.len() > words.len() {
        return Err(SortError::ResourceAllocation(format!(
            "write of {} words into {} words",
            data.len(),
            words.len()
        )));
    }
    words[..data.len()].copy_from_slice(data);
    Ok(())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::PassParams;
    use rand::Rng;

    fn params(level: u32, level_mask: u32, height: u32, width: u32) -> VariableParameters {
        VariableParameters {
            view_position: [0.0; 4],
            pass: PassParams {
                level,
                level_mask,
                height,
                width,
            },
        }
    }

    fn run(
        device: &mut ReferenceDevice,
        kernel: Kernel,
        variables: VariableParameters,
        groups: GroupCount,
    ) -> Result<(), SortError> {
        device.set_parameters(kernel, &ConstantParameters::default(), &variables);
        device.dispatch(kernel, groups)
    }

    #[test]
    fn test_sort_kernel_sorts_one_block() {
        let geometry = SortGeometry::new(16, 16, 1).unwrap();
        let mut device = ReferenceDevice::new(&geometry);
        let surface = device.create_surface(16, 1).unwrap();
        let view = device.surface_view(&surface).unwrap();

        let mut rng = rand::thread_rng();
        let data: Vec<u32> = (0..16).map(|_| rng.gen()).collect();
        device.write_surface(&surface, &data).unwrap();
        device.bind(Kernel::Sort, BindSlot::Target, &view);

        for level in geometry.local_levels() {
            let groups = GroupCount::new(1, 1, 1);
            run(&mut device, Kernel::Sort, params(level, level, 1, 16), groups).unwrap();
        }

        let mut expected = data.clone();
        expected.sort_unstable();
        assert_eq!(device.surface_handle(&surface).cells(), expected);
    }

    #[test]
    fn test_sort_kernel_direction_follows_mask() {
        let geometry = SortGeometry::new(8, 4, 1).unwrap();
        let mut device = ReferenceDevice::new(&geometry);
        let surface = device.create_surface(4, 2).unwrap();
        let view = device.surface_view(&surface).unwrap();
        device.write_surface(&surface, &[5, 3, 8, 1, 9, 2, 7, 4]).unwrap();
        device.bind(Kernel::Sort, BindSlot::Target, &view);

        run(&mut device, Kernel::Sort, params(2, 2, 2, 4), GroupCount::new(1, 2, 1)).unwrap();
        assert_eq!(device.surface_handle(&surface).cells(), vec![3, 5, 8, 1, 2, 9, 7, 4]);

        run(&mut device, Kernel::Sort, params(4, 4, 2, 4), GroupCount::new(1, 2, 1)).unwrap();
        assert_eq!(device.surface_handle(&surface).cells(), vec![1, 3, 5, 8, 9, 7, 4, 2]);
    }

    #[test]
    fn test_transpose_kernel() {
        let geometry = SortGeometry::new(8, 4, 1).unwrap();
        let mut device = ReferenceDevice::new(&geometry);
        let surface = device.create_surface(4, 2).unwrap();
        let scratch = device.create_buffer(8).unwrap();
        let surface_view = device.surface_view(&surface).unwrap();
        let scratch_view = device.buffer_view(&scratch).unwrap();
        device.write_surface(&surface, &[0, 1, 2, 3, 4, 5, 6, 7]).unwrap();

        device.bind(Kernel::Transpose, BindSlot::Source, &surface_view);
        device.bind(Kernel::Transpose, BindSlot::Target, &scratch_view);
        // Read 2 rows of 4, write 4 rows of 2.
        run(&mut device, Kernel::Transpose, params(0, 0, 4, 2), GroupCount::new(2, 4, 1)).unwrap();
        assert_eq!(*scratch.storage.words(), vec![0, 4, 1, 5, 2, 6, 3, 7]);

        device.bind(Kernel::Transpose, BindSlot::Source, &scratch_view);
        device.bind(Kernel::Transpose, BindSlot::Target, &surface_view);
        run(&mut device, Kernel::Transpose, params(0, 0, 2, 4), GroupCount::new(4, 2, 1)).unwrap();
        assert_eq!(device.surface_handle(&surface).cells(), vec![0, 1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn test_transpose_rejects_mismatched_groups() {
        let geometry = SortGeometry::new(64, 8, 2).unwrap();
        let mut device = ReferenceDevice::new(&geometry);
        let a = device.create_buffer(64).unwrap();
        let b = device.create_buffer(64).unwrap();
        let va = device.buffer_view(&a).unwrap();
        let vb = device.buffer_view(&b).unwrap();
        device.bind(Kernel::Transpose, BindSlot::Source, &va);
        device.bind(Kernel::Transpose, BindSlot::Target, &vb);

        let groups = GroupCount::new(8, 8, 1);
        let result = run(&mut device, Kernel::Transpose, params(0, 0, 8, 8), groups);
        assert!(matches!(result, Err(SortError::InvalidDispatch { .. })));
    }

    #[test]
    fn test_transpose_rejects_aliased_views() {
        let geometry = SortGeometry::new(8, 4, 1).unwrap();
        let mut device = ReferenceDevice::new(&geometry);
        let buffer = device.create_buffer(8).unwrap();
        let view = device.buffer_view(&buffer).unwrap();
        device.bind(Kernel::Transpose, BindSlot::Source, &view);
        device.bind(Kernel::Transpose, BindSlot::Target, &view);

        let groups = GroupCount::new(2, 4, 1);
        let result = run(&mut device, Kernel::Transpose, params(0, 0, 4, 2), groups);
        assert!(matches!(result, Err(SortError::InvalidDispatch { .. })));
    }

    #[test]
    fn test_dispatch_without_binding_fails() {
        let geometry = SortGeometry::new(8, 4, 1).unwrap();
        let mut device = ReferenceDevice::new(&geometry);
        let result = run(&mut device, Kernel::Sort, params(2, 2, 2, 4), GroupCount::new(1, 2, 1));
        assert!(matches!(
            result,
            Err(SortError::Unbound {
                kernel: Kernel::Sort,
                slot: BindSlot::Target
            })
        ));
        assert_eq!(device.ledger().dispatches(), 0);
    }

    #[test]
    fn test_dispatch_without_parameters_fails() {
        let geometry = SortGeometry::new(8, 4, 1).unwrap();
        let mut device = ReferenceDevice::new(&geometry);
        let result = device.dispatch(Kernel::Transpose, GroupCount::new(2, 4, 1));
        assert!(matches!(result, Err(SortError::MissingParameters(Kernel::Transpose))));
    }

    #[test]
    fn test_sort_rejects_oversized_grid() {
        let geometry = SortGeometry::new(8, 4, 1).unwrap();
        let mut device = ReferenceDevice::new(&geometry);
        let buffer = device.create_buffer(8).unwrap();
        let view = device.buffer_view(&buffer).unwrap();
        device.bind(Kernel::Sort, BindSlot::Target, &view);
        let result = run(&mut device, Kernel::Sort, params(2, 2, 2, 4), GroupCount::new(1, 3, 1));
        assert!(matches!(result, Err(SortError::InvalidDispatch { .. })));
    }

    #[test]
    fn test_seed_surface_packs_records() {
        let geometry = SortGeometry::new(8, 4, 1).unwrap();
        let mut device = ReferenceDevice::new(&geometry);
        let surface = device.create_surface(4, 2).unwrap();
        let staging = device.create_buffer(8 * Element::WORDS).unwrap();

        let mut records = vec![Element::UNSET; 8];
        records[0] = Element::new(1.0, 0.0, 0.0, 0.0);
        records[7] = Element::new(0.0, 0.0, 0.0, 1.0);
        device.write_buffer(&staging, bytemuck::cast_slice(&records)).unwrap();
        device.seed_surface(&staging, &surface).unwrap();

        let cells = device.surface_handle(&surface).cells();
        assert_eq!(cells[0], 0xFF);
        assert!(cells[1..7].iter().all(|&cell| cell == 0));
        assert_eq!(cells[7], 0xFF00_0000);
    }

    #[test]
    fn test_write_buffer_rejects_overflow() {
        let geometry = SortGeometry::new(8, 4, 1).unwrap();
        let mut device = ReferenceDevice::new(&geometry);
        let buffer = device.create_buffer(4).unwrap();
        assert!(device.write_buffer(&buffer, &[0; 5]).is_err());
    }

    #[test]
    fn test_read_surface_pads_rows() {
        let geometry = SortGeometry::new(8, 4, 1).unwrap();
        let mut device = ReferenceDevice::new(&geometry).with_row_alignment(32);
        let surface = device.create_surface(4, 2).unwrap();
        device.write_surface(&surface, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();

        let readback = device.read_surface(&surface).unwrap();
        assert_eq!(readback.row_stride, 32);
        assert_eq!(readback.bytes.len(), 64);
        assert_eq!(&readback.bytes[0..4], &1u32.to_le_bytes());
        assert_eq!(readback.bytes[16], PADDING_BYTE);
        assert_eq!(&readback.bytes[32..36], &5u32.to_le_bytes());
    }

    #[test]
    fn test_unbind_releases_binding_references() {
        let geometry = SortGeometry::new(8, 4, 1).unwrap();
        let mut device = ReferenceDevice::new(&geometry);
        let ledger = device.ledger();
        let buffer = device.create_buffer(8).unwrap();
        let view = device.buffer_view(&buffer).unwrap();
        device.bind(Kernel::Sort, BindSlot::Target, &view);

        drop(view);
        drop(buffer);
        // Still bound: the memory is alive.
        assert_eq!(ledger.storages_released(), 0);
        assert_eq!(ledger.views_released(), 1);

        device.unbind(Kernel::Sort);
        assert_eq!(ledger.storages_released(), 1);
        assert!(ledger.all_released());
    }
}
