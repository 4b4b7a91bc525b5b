//! Records and parameter blocks shared between the host and the kernels.
//!
//! Everything here is `#[repr(C)]` and `Pod` so it can be copied into device
//! memory byte-for-byte. `VariableParameters` matches the `VariableParameters`
//! struct in the Metal shader source (a `float4` followed by four `uint`s).

use bytemuck::{Pod, Zeroable};

/// A four-component record as supplied by the caller (position or colour data).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Element {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
}

impl Element {
    /// Sentinel for staging slots that were never written.
    pub const UNSET: Element = Element::new(-1.0, -1.0, -1.0, -1.0);

    /// 32-bit words occupied by one record in a device buffer.
    pub const WORDS: usize = 4;

    pub const fn new(x: f32, y: f32, z: f32, w: f32) -> Self {
        Element { x, y, z, w }
    }

    /// Pack into a surface cell: each component quantised to 8-bit unorm,
    /// x in byte 0 through w in byte 3 (little-endian).
    pub fn pack(&self) -> u32 {
        u32::from_le_bytes([
            unorm8(self.x),
            unorm8(self.y),
            unorm8(self.z),
            unorm8(self.w),
        ])
    }
}

impl From<[f32; 4]> for Element {
    fn from([x, y, z, w]: [f32; 4]) -> Self {
        Element::new(x, y, z, w)
    }
}

impl From<(f32, f32, f32, f32)> for Element {
    fn from((x, y, z, w): (f32, f32, f32, f32)) -> Self {
        Element::new(x, y, z, w)
    }
}

fn unorm8(value: f32) -> u8 {
    // NaN saturates to 0 through the float-to-int cast.
    (value.clamp(0.0, 1.0) * 255.0).round() as u8
}

/// Per-pass network parameters, regenerated before every dispatch.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct PassParams {
    pub level: u32,
    pub level_mask: u32,
    pub height: u32,
    pub width: u32,
}

/// Parameters fixed for the lifetime of a component.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct ConstantParameters {
    pub simulation_speed: f32,
}

/// Parameters uploaded with every dispatch.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct VariableParameters {
    /// Live view position supplied with the sort request.
    pub view_position: [f32; 4],
    pub pass: PassParams,
}
