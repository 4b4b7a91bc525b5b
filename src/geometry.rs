//! Sorting network geometry
//!
//! The network sorts `NUM_ELEMENTS` cells viewed as a row-major matrix of
//! `MATRIX_HEIGHT` rows by `MATRIX_WIDTH` columns. Rows are sorted inside a single
//! workgroup (`BITONIC_BLOCK_SIZE` threads); comparisons further apart than a block
//! are brought into a row by transposing the matrix.
//!
//! The production sizes are compile-time constants. [`SortGeometry`] carries them
//! as a value so they can be validated once at startup, and so reduced networks can
//! be built for tests and benchmarks.

use std::iter;

use crate::device::GroupCount;
use crate::error::SortError;

/// Number of cells sorted by one component.
pub const NUM_ELEMENTS: u32 = 1024 * 1024;
/// Cells sorted by one Sort Kernel workgroup.
pub const BITONIC_BLOCK_SIZE: u32 = 1024;
/// Edge length of a Transpose Kernel workgroup tile.
pub const TRANSPOSE_BLOCK_SIZE: u32 = 16;
pub const MATRIX_WIDTH: u32 = BITONIC_BLOCK_SIZE;
pub const MATRIX_HEIGHT: u32 = NUM_ELEMENTS / BITONIC_BLOCK_SIZE;

/// Sizes of one bitonic/transpose network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SortGeometry {
    num_elements: u32,
    block_size: u32,
    transpose_block: u32,
}

impl SortGeometry {
    /// The fixed production network: 1M cells, 1024-cell blocks, 16x16 transpose tiles.
    pub const STANDARD: SortGeometry = SortGeometry {
        num_elements: NUM_ELEMENTS,
        block_size: BITONIC_BLOCK_SIZE,
        transpose_block: TRANSPOSE_BLOCK_SIZE,
    };

    /// Build and validate a geometry.
    pub fn new(
        num_elements: u32,
        block_size: u32,
        transpose_block: u32,
    ) -> Result<Self, SortError> {
        let geometry = SortGeometry {
            num_elements,
            block_size,
            transpose_block,
        };
        geometry.validate()?;
        Ok(geometry)
    }

    /// Check every relation the pass arithmetic relies on.
    pub fn validate(&self) -> Result<(), SortError> {
        let invalid = |reason: String| Err(SortError::InvalidGeometry(reason));

        if self.block_size < 2 || !self.block_size.is_power_of_two() {
            return invalid(format!(
                "block size must be a power of two >= 2, got {}",
                self.block_size
            ));
        }
        if !self.num_elements.is_power_of_two() {
            return invalid(format!(
                "element count must be a power of two, got {}",
                self.num_elements
            ));
        }
        // Both are powers of two, so this is the divisibility check.
        if self.num_elements < self.block_size {
            return invalid(format!(
                "element count {} is not a multiple of block size {}",
                self.num_elements, self.block_size
            ));
        }
        if self.matrix_height() > self.block_size {
            return invalid(format!(
                "matrix height {} exceeds block size {}; a transposed column must fit one block",
                self.matrix_height(),
                self.block_size
            ));
        }
        if !self.transpose_block.is_power_of_two()
            || self.matrix_width() % self.transpose_block != 0
            || self.matrix_height() % self.transpose_block != 0
        {
            return invalid(format!(
                "transpose block {} must be a power of two dividing the {}x{} matrix",
                self.transpose_block,
                self.matrix_height(),
                self.matrix_width()
            ));
        }
        Ok(())
    }

    pub fn num_elements(&self) -> u32 {
        self.num_elements
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn transpose_block(&self) -> u32 {
        self.transpose_block
    }

    /// Columns of the matrix view (one block per row).
    pub fn matrix_width(&self) -> u32 {
        self.block_size
    }

    /// Rows of the matrix view.
    pub fn matrix_height(&self) -> u32 {
        self.num_elements / self.block_size
    }

    /// `(row, col)` of a linear index in the matrix view.
    pub fn position(&self, index: u32) -> (u32, u32) {
        (index / self.block_size, index % self.block_size)
    }

    /// Workgroup grid of every Sort Kernel dispatch: one group per block.
    pub fn sort_groups(&self) -> GroupCount {
        GroupCount::new(1, self.num_elements / self.block_size, 1)
    }

    /// Workgroup grid of a Transpose Kernel dispatch over a `width x height` thread grid.
    pub fn transpose_groups(&self, width: u32, height: u32) -> GroupCount {
        GroupCount::new(width / self.transpose_block, height / self.transpose_block, 1)
    }

    /// Levels handled inside one block: 2, 4, ..., block size.
    pub fn local_levels(&self) -> impl Iterator<Item = u32> {
        doubling(2, self.block_size)
    }

    /// Levels that need the transpose: 2 * block size, ..., element count.
    pub fn global_levels(&self) -> impl Iterator<Item = u32> {
        doubling(self.block_size.saturating_mul(2), self.num_elements)
    }

    /// Kernel dispatches in one full sort.
    pub fn dispatch_count(&self) -> usize {
        self.local_levels().count() + 4 * self.global_levels().count()
    }
}

impl Default for SortGeometry {
    fn default() -> Self {
        Self::STANDARD
    }
}

fn doubling(start: u32, last: u32) -> impl Iterator<Item = u32> {
    iter::successors(Some(start), |level| level.checked_mul(2))
        .take_while(move |&level| level <= last)
}
