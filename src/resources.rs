//! Device resources owned by one sort component.

use log::debug;

use crate::device::ComputeDevice;
use crate::error::SortError;
use crate::geometry::SortGeometry;
use crate::params::Element;

/// Writable views the pass scheduler binds.
pub struct Views<'a, D: ComputeDevice> {
    pub surface: &'a D::View,
    pub scratch: &'a D::View,
}

struct ViewSet<D: ComputeDevice> {
    surface: D::View,
    // No kernel binds it; it is created and released with the others.
    _staging: D::View,
    scratch: D::View,
}

/// The surface, the staging and scratch buffers, and their views.
///
/// Every resource is released exactly once when this value is dropped. Views can
/// be released early with [`release_views`](DeviceResources::release_views).
pub struct DeviceResources<D: ComputeDevice> {
    views: Option<ViewSet<D>>,
    surface: D::Surface,
    staging: D::Buffer,
    scratch: D::Buffer,
}

impl<D: ComputeDevice> DeviceResources<D> {
    /// Allocate resources for `geometry` and upload `initial` into the staging buffer.
    pub fn allocate(
        device: &mut D,
        geometry: &SortGeometry,
        width: u32,
        height: u32,
        initial: &[Element],
    ) -> Result<Self, SortError> {
        let cells = geometry.num_elements() as usize;

        let surface = device.create_surface(width, height)?;
        let staging = device.create_buffer(cells * Element::WORDS)?;
        let scratch = device.create_buffer(cells)?;

        let views = ViewSet {
            surface: device.surface_view(&surface)?,
            _staging: device.buffer_view(&staging)?,
            scratch: device.buffer_view(&scratch)?,
        };

        device.write_buffer(&staging, bytemuck::cast_slice(initial))?;

        debug!(
            "allocated {}x{} surface and two {}-cell buffers on {}",
            width,
            height,
            cells,
            device.name()
        );

        Ok(DeviceResources {
            views: Some(views),
            surface,
            staging,
            scratch,
        })
    }

    pub fn surface(&self) -> &D::Surface {
        &self.surface
    }

    pub fn staging(&self) -> &D::Buffer {
        &self.staging
    }

    /// Views, or `None` once they have been released.
    pub fn views(&self) -> Option<Views<'_, D>> {
        self.views.as_ref().map(|views| Views {
            surface: &views.surface,
            scratch: &views.scratch,
        })
    }

    /// Release all views. Later calls do nothing.
    pub fn release_views(&mut self) -> bool {
        match self.views.take() {
            Some(views) => {
                drop(views);
                debug!("released surface and buffer views");
                true
            }
            None => false,
        }
    }
}
