//! Metal implementation of the compute device.
//!
//! Both kernels are compiled from source when the device is created. Every
//! dispatch gets its own command buffer and is waited on, so a dispatch that
//! returns has finished on the GPU.
//!
//! This module only compiles on macOS. On other platforms [`MetalDevice`] is an
//! uninhabited type whose constructor returns [`SortError::DeviceUnavailable`].

#[cfg(target_os = "macos")]
mod metal_impl {
    use std::collections::HashMap;
    use std::mem;

    use log::debug;
    use metal::*;

    use crate::device::{BindSlot, ComputeDevice, GroupCount, Kernel, SurfaceReadback};
    use crate::error::SortError;
    use crate::geometry::SortGeometry;
    use crate::params::{ConstantParameters, Element, VariableParameters};

    const SHADER_SOURCE: &str = r#"
#include <metal_stdlib>
using namespace metal;

struct VariableParameters {
    float4 view_position;
    uint level;
    uint level_mask;
    uint height;
    uint width;
};

struct ConstantParameters {
    float simulation_speed;
};

/// One group sorts BLOCK_SIZE consecutive cells in threadgroup memory,
/// comparing at distances level / 2 down to 1.
kernel void bitonic_sort(
    device uint *data [[buffer(0)]],
    constant VariableParameters &params [[buffer(1)]],
    constant ConstantParameters &constants [[buffer(2)]],
    threadgroup uint *shared_data [[threadgroup(0)]],
    uint3 tgid [[threadgroup_position_in_grid]],
    uint3 groups [[threadgroups_per_grid]],
    uint3 tpg [[threads_per_threadgroup]],
    uint gi [[thread_index_in_threadgroup]])
{
    uint group = tgid.x + tgid.y * groups.x + tgid.z * groups.x * groups.y;
    uint i = group * tpg.x + gi;

    shared_data[gi] = data[i];
    threadgroup_barrier(mem_flags::mem_threadgroup);

    bool descending = (params.level_mask & i) != 0;
    for (uint j = params.level >> 1; j > 0; j >>= 1) {
        uint result = ((shared_data[gi & ~j] <= shared_data[gi | j]) == descending)
            ? shared_data[gi ^ j]
            : shared_data[gi];
        threadgroup_barrier(mem_flags::mem_threadgroup);
        shared_data[gi] = result;
        threadgroup_barrier(mem_flags::mem_threadgroup);
    }

    data[i] = shared_data[gi];
}

/// target[y * width + x] = source[x * height + y], staged through a tile so
/// both the read and the write walk memory in order.
kernel void matrix_transpose(
    device const uint *source [[buffer(0)]],
    device uint *target [[buffer(1)]],
    constant VariableParameters &params [[buffer(2)]],
    constant ConstantParameters &constants [[buffer(3)]],
    threadgroup uint *tile [[threadgroup(0)]],
    uint2 gid [[thread_position_in_grid]],
    uint2 lid [[thread_position_in_threadgroup]],
    uint2 tpg [[threads_per_threadgroup]])
{
    uint2 origin = gid - lid;
    tile[lid.y * tpg.x + lid.x] = source[(origin.x + lid.y) * params.height + origin.y + lid.x];
    threadgroup_barrier(mem_flags::mem_threadgroup);
    target[gid.y * params.width + gid.x] = tile[lid.x * tpg.x + lid.y];
}

/// Quantise staged records into surface cells, x in the lowest byte.
kernel void pack_elements(
    device const float4 *staging [[buffer(0)]],
    device uint *cells [[buffer(1)]],
    constant uint &count [[buffer(2)]],
    uint i [[thread_position_in_grid]])
{
    if (i >= count) return;
    uint4 c = uint4(round(clamp(staging[i], 0.0, 1.0) * 255.0));
    cells[i] = c.x | (c.y << 8) | (c.z << 16) | (c.w << 24);
}
"#;

    pub struct MetalSurface {
        buffer: Buffer,
        width: u32,
        height: u32,
    }

    impl MetalSurface {
        fn cells(&self) -> usize {
            self.width as usize * self.height as usize
        }
    }

    pub struct MetalBuffer {
        buffer: Buffer,
        words: usize,
    }

    pub struct MetalView {
        buffer: Buffer,
        words: usize,
    }

    /// Retained reference to the surface's device memory.
    #[derive(Clone)]
    pub struct MetalSurfaceHandle {
        buffer: Buffer,
        width: u32,
        height: u32,
    }

    impl MetalSurfaceHandle {
        pub fn buffer(&self) -> &BufferRef {
            &self.buffer
        }

        pub fn width(&self) -> u32 {
            self.width
        }

        pub fn height(&self) -> u32 {
            self.height
        }

        /// Copy of the cells, row-major.
        pub fn cells(&self) -> Vec<u32> {
            let len = self.width as usize * self.height as usize;
            let cells = self.buffer.contents() as *const u32;
            unsafe { std::slice::from_raw_parts(cells, len) }.to_vec()
        }
    }

    pub struct MetalDevice {
        device: Device,
        command_queue: CommandQueue,
        sort_pipeline: ComputePipelineState,
        transpose_pipeline: ComputePipelineState,
        pack_pipeline: ComputePipelineState,
        block_size: u32,
        transpose_block: u32,
        bindings: HashMap<(Kernel, BindSlot), Buffer>,
        parameters: HashMap<Kernel, (ConstantParameters, VariableParameters)>,
    }

    impl MetalDevice {
        /// Create a device with kernels sized for `geometry`.
        ///
        /// Returns an error if Metal is not available or a kernel does not compile.
        pub fn new(geometry: &SortGeometry) -> Result<Self, SortError> {
            let device = Device::system_default().ok_or_else(|| {
                SortError::DeviceUnavailable("no Metal device found".into())
            })?;
            let command_queue = device.new_command_queue();

            let library = device
                .new_library_with_source(SHADER_SOURCE, &CompileOptions::new())
                .map_err(|e| SortError::ShaderCompilation(e.to_string()))?;
            let pipeline = |name: &str| -> Result<ComputePipelineState, SortError> {
                let function = library
                    .get_function(name, None)
                    .map_err(|e| SortError::ShaderCompilation(format!("{}: {}", name, e)))?;
                device
                    .new_compute_pipeline_state_with_function(&function)
                    .map_err(|e| SortError::ShaderCompilation(format!("{}: {}", name, e)))
            };
            let sort_pipeline = pipeline("bitonic_sort")?;
            let transpose_pipeline = pipeline("matrix_transpose")?;
            let pack_pipeline = pipeline("pack_elements")?;

            let block_size = geometry.block_size();
            let transpose_block = geometry.transpose_block();
            let sort_limit = sort_pipeline.max_total_threads_per_threadgroup();
            let transpose_limit = transpose_pipeline.max_total_threads_per_threadgroup();
            if u64::from(block_size) > sort_limit
                || u64::from(transpose_block * transpose_block) > transpose_limit
            {
                return Err(SortError::DeviceUnavailable(format!(
                    "{} supports {} sort and {} transpose threads per group, \
                     the geometry needs {} and {}",
                    device.name(),
                    sort_limit,
                    transpose_limit,
                    block_size,
                    transpose_block * transpose_block
                )));
            }
            debug!(
                "compiled sort, transpose and pack kernels on {}",
                device.name()
            );

            Ok(Self {
                device,
                command_queue,
                sort_pipeline,
                transpose_pipeline,
                pack_pipeline,
                block_size,
                transpose_block,
                bindings: HashMap::new(),
                parameters: HashMap::new(),
            })
        }

        fn new_words(&self, words: usize) -> Buffer {
            let buffer = self.device.new_buffer(
                (words * mem::size_of::<u32>()) as u64,
                MTLResourceOptions::StorageModeShared,
            );
            // Shared buffers are not guaranteed to start zeroed.
            unsafe {
                std::ptr::write_bytes(buffer.contents() as *mut u32, 0, words);
            }
            buffer
        }

        fn bound(&self, kernel: Kernel, slot: BindSlot) -> Result<&Buffer, SortError> {
            self.bindings
                .get(&(kernel, slot))
                .ok_or(SortError::Unbound { kernel, slot })
        }

        fn submit(&self, encode: impl FnOnce(&ComputeCommandEncoderRef)) -> Result<(), SortError> {
            let command_buffer = self.command_queue.new_command_buffer();
            let encoder = command_buffer.new_compute_command_encoder();
            encode(encoder);
            encoder.end_encoding();

            command_buffer.commit();
            command_buffer.wait_until_completed();

            match command_buffer.status() {
                MTLCommandBufferStatus::Completed => Ok(()),
                status => Err(SortError::GpuExecution(format!(
                    "command buffer finished with status {:?}",
                    status
                ))),
            }
        }
    }

    fn set_bytes_of<T: bytemuck::Pod>(encoder: &ComputeCommandEncoderRef, index: u64, value: &T) {
        let bytes = bytemuck::bytes_of(value);
        encoder.set_bytes(index, bytes.len() as u64, bytes.as_ptr() as *const _);
    }

    impl ComputeDevice for MetalDevice {
        type Surface = MetalSurface;
        type SurfaceHandle = MetalSurfaceHandle;
        type Buffer = MetalBuffer;
        type View = MetalView;

        fn name(&self) -> String {
            format!("Metal ({})", self.device.name())
        }

        fn create_surface(&mut self, width: u32, height: u32) -> Result<Self::Surface, SortError> {
            if width == 0 || height == 0 {
                return Err(SortError::ResourceAllocation(format!(
                    "surface of {}x{} cells",
                    width, height
                )));
            }
            Ok(MetalSurface {
                buffer: self.new_words(width as usize * height as usize),
                width,
                height,
            })
        }

        fn create_buffer(&mut self, words: usize) -> Result<Self::Buffer, SortError> {
            if words == 0 {
                return Err(SortError::ResourceAllocation("empty buffer".into()));
            }
            Ok(MetalBuffer {
                buffer: self.new_words(words),
                words,
            })
        }

        fn surface_view(&mut self, surface: &Self::Surface) -> Result<Self::View, SortError> {
            Ok(MetalView {
                buffer: surface.buffer.clone(),
                words: surface.cells(),
            })
        }

        fn buffer_view(&mut self, buffer: &Self::Buffer) -> Result<Self::View, SortError> {
            Ok(MetalView {
                buffer: buffer.buffer.clone(),
                words: buffer.words,
            })
        }

        fn surface_handle(&self, surface: &Self::Surface) -> Self::SurfaceHandle {
            MetalSurfaceHandle {
                buffer: surface.buffer.clone(),
                width: surface.width,
                height: surface.height,
            }
        }

        fn write_buffer(&mut self, buffer: &Self::Buffer, words: &[u32]) -> Result<(), SortError> {
            if words.len() > buffer.words {
                return Err(SortError::ResourceAllocation(format!(
                    "write of {} words into {} words",
                    words.len(),
                    buffer.words
                )));
            }
            unsafe {
                std::ptr::copy_nonoverlapping(
                    words.as_ptr(),
                    buffer.buffer.contents() as *mut u32,
                    words.len(),
                );
            }
            Ok(())
        }

        fn clear_view(&mut self, view: &Self::View, value: u32) -> Result<(), SortError> {
            let cells = unsafe {
                std::slice::from_raw_parts_mut(view.buffer.contents() as *mut u32, view.words)
            };
            cells.fill(value);
            Ok(())
        }

        fn seed_surface(
            &mut self,
            staging: &Self::Buffer,
            surface: &Self::Surface,
        ) -> Result<(), SortError> {
            let count = (staging.words / Element::WORDS).min(surface.cells()) as u32;
            if count == 0 {
                return Ok(());
            }
            let group = self
                .pack_pipeline
                .max_total_threads_per_threadgroup()
                .min(u64::from(count));

            self.submit(|encoder| {
                encoder.set_compute_pipeline_state(&self.pack_pipeline);
                encoder.set_buffer(0, Some(&staging.buffer), 0);
                encoder.set_buffer(1, Some(&surface.buffer), 0);
                set_bytes_of(encoder, 2, &count);
                encoder.dispatch_threads(
                    MTLSize::new(u64::from(count), 1, 1),
                    MTLSize::new(group, 1, 1),
                );
            })
        }

        fn bind(&mut self, kernel: Kernel, slot: BindSlot, view: &Self::View) {
            self.bindings.insert((kernel, slot), view.buffer.clone());
        }

        fn set_parameters(
            &mut self,
            kernel: Kernel,
            constants: &ConstantParameters,
            variables: &VariableParameters,
        ) {
            self.parameters.insert(kernel, (*constants, *variables));
        }

        fn dispatch(&mut self, kernel: Kernel, groups: GroupCount) -> Result<(), SortError> {
            let (constants, variables) = *self
                .parameters
                .get(&kernel)
                .ok_or(SortError::MissingParameters(kernel))?;
            let grid = MTLSize::new(u64::from(groups.x), u64::from(groups.y), u64::from(groups.z));

            match kernel {
                Kernel::Sort => {
                    let target = self.bound(kernel, BindSlot::Target)?;
                    let block = u64::from(self.block_size);
                    self.submit(|encoder| {
                        encoder.set_compute_pipeline_state(&self.sort_pipeline);
                        encoder.set_buffer(0, Some(target), 0);
                        set_bytes_of(encoder, 1, &variables);
                        set_bytes_of(encoder, 2, &constants);
                        let shared_bytes = block * mem::size_of::<u32>() as u64;
                        encoder.set_threadgroup_memory_length(0, shared_bytes);
                        encoder.dispatch_thread_groups(grid, MTLSize::new(block, 1, 1));
                    })
                }
                Kernel::Transpose => {
                    let source = self.bound(kernel, BindSlot::Source)?;
                    let target = self.bound(kernel, BindSlot::Target)?;
                    let tile = u64::from(self.transpose_block);
                    self.submit(|encoder| {
                        encoder.set_compute_pipeline_state(&self.transpose_pipeline);
                        encoder.set_buffer(0, Some(source), 0);
                        encoder.set_buffer(1, Some(target), 0);
                        set_bytes_of(encoder, 2, &variables);
                        set_bytes_of(encoder, 3, &constants);
                        encoder.set_threadgroup_memory_length(
                            0,
                            tile * tile * mem::size_of::<u32>() as u64,
                        );
                        encoder.dispatch_thread_groups(grid, MTLSize::new(tile, tile, 1));
                    })
                }
            }
        }

        fn unbind(&mut self, kernel: Kernel) {
            self.bindings.retain(|&(bound, _), _| bound != kernel);
        }

        fn read_surface(&mut self, surface: &Self::Surface) -> Result<SurfaceReadback, SortError> {
            let cells = unsafe {
                std::slice::from_raw_parts(surface.buffer.contents() as *const u32, surface.cells())
            };
            Ok(SurfaceReadback {
                width: surface.width,
                height: surface.height,
                row_stride: surface.width as usize * 4,
                bytes: bytemuck::cast_slice(cells).to_vec(),
            })
        }
    }
}

#[cfg(target_os = "macos")]
pub use metal_impl::{MetalBuffer, MetalDevice, MetalSurface, MetalSurfaceHandle, MetalView};

#[cfg(not(target_os = "macos"))]
mod unsupported {
    use std::convert::Infallible;

    use crate::device::{BindSlot, ComputeDevice, GroupCount, Kernel, SurfaceReadback};
    use crate::error::SortError;
    use crate::geometry::SortGeometry;
    use crate::params::{ConstantParameters, VariableParameters};

    /// Metal is not available on this platform; no value of this type exists.
    pub enum MetalDevice {}

    impl MetalDevice {
        /// Always returns an error on non-macOS platforms.
        pub fn new(_geometry: &SortGeometry) -> Result<Self, SortError> {
            Err(SortError::DeviceUnavailable(
                "Metal is only available on macOS".into(),
            ))
        }
    }

    impl ComputeDevice for MetalDevice {
        type Surface = Infallible;
        type SurfaceHandle = Infallible;
        type Buffer = Infallible;
        type View = Infallible;

        fn name(&self) -> String {
            match *self {}
        }

        fn create_surface(&mut self, _: u32, _: u32) -> Result<Self::Surface, SortError> {
            match *self {}
        }

        fn create_buffer(&mut self, _: usize) -> Result<Self::Buffer, SortError> {
            match *self {}
        }

        fn surface_view(&mut self, _: &Self::Surface) -> Result<Self::View, SortError> {
            match *self {}
        }

        fn buffer_view(&mut self, _: &Self::Buffer) -> Result<Self::View, SortError> {
            match *self {}
        }

        fn surface_handle(&self, _: &Self::Surface) -> Self::SurfaceHandle {
            match *self {}
        }

        fn write_buffer(&mut self, _: &Self::Buffer, _: &[u32]) -> Result<(), SortError> {
            match *self {}
        }

        fn clear_view(&mut self, _: &Self::View, _: u32) -> Result<(), SortError> {
            match *self {}
        }

        fn seed_surface(&mut self, _: &Self::Buffer, _: &Self::Surface) -> Result<(), SortError> {
            match *self {}
        }

        fn bind(&mut self, _: Kernel, _: BindSlot, _: &Self::View) {
            match *self {}
        }

        fn set_parameters(&mut self, _: Kernel, _: &ConstantParameters, _: &VariableParameters) {
            match *self {}
        }

        fn dispatch(&mut self, _: Kernel, _: GroupCount) -> Result<(), SortError> {
            match *self {}
        }

        fn unbind(&mut self, _: Kernel) {
            match *self {}
        }

        fn read_surface(&mut self, _: &Self::Surface) -> Result<SurfaceReadback, SortError> {
            match *self {}
        }
    }
}

#[cfg(not(target_os = "macos"))]
pub use unsupported::MetalDevice;
