//! Cell assignment and per-cell boundary extraction.
//!
//! Each step the assigner writes one cell id per particle and resets the
//! particle-id permutation to the identity. After the bitonic sort has
//! permuted `particle_ids`, the boundary builder scans the sorted order once
//! and records, for every grid cell, the half-open range of sorted positions
//! holding that cell's particles.
//!
//! Cell ids stay indexed by particle id. The sort only permutes the id
//! array and looks keys up through it, so particle records never move.

use std::ops::Range;

use bytemuck::{Pod, Zeroable};
use rayon::prelude::*;

use crate::error::CapacityError;
use crate::grid::{GridGeometry, SENTINEL_CELL};
use crate::particle::Particle;

/// Parallel `(particle_ids, cell_ids)` arrays for one step.
///
/// `particle_ids` is allocated at the next power of two so the sort can run
/// on padded input; only the first `len` entries are ever exposed.
#[derive(Clone, Debug, Default)]
pub struct CellPairs {
    particle_ids: Vec<u32>,
    cell_ids: Vec<u32>,
}

impl CellPairs {
    /// Allocate pairs for `len` particles. Contents are unspecified until
    /// [`assign_cells`] runs.
    pub fn new(len: usize) -> Result<Self, CapacityError> {
        let padded = match len {
            0 => 0,
            _ => len
                .checked_next_power_of_two()
                .ok_or(CapacityError::AllocationFailed {
                    label: "Particle Ids",
                    requested: u64::MAX,
                })?,
        };
        let mut pairs = Self {
            particle_ids: try_filled("Particle Ids", padded, 0)?,
            cell_ids: try_filled("Cell Ids", len, 0)?,
        };
        pairs.reset_ids();
        Ok(pairs)
    }

    /// Pairs with explicit cell ids and an identity permutation.
    pub fn from_cell_ids(cell_ids: Vec<u32>) -> Self {
        debug_assert!(cell_ids.iter().all(|&c| c != SENTINEL_CELL));
        let mut pairs = Self {
            particle_ids: vec![0; padded_len(cell_ids.len())],
            cell_ids,
        };
        pairs.reset_ids();
        pairs
    }

    /// Number of real particles.
    #[inline]
    pub fn len(&self) -> usize {
        self.cell_ids.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.cell_ids.is_empty()
    }

    /// Length the sort network operates on.
    #[inline]
    pub fn padded_len(&self) -> usize {
        self.particle_ids.len()
    }

    /// Particle ids in sorted order (the first `len` entries).
    #[inline]
    pub fn particle_ids(&self) -> &[u32] {
        &self.particle_ids[..self.len()]
    }

    /// Cell of each particle, indexed by particle id.
    #[inline]
    pub fn cell_ids(&self) -> &[u32] {
        &self.cell_ids
    }

    /// Cell id of the particle at sorted position `i`.
    #[inline]
    pub fn sorted_cell(&self, i: usize) -> u32 {
        self.cell_ids[self.particle_ids[i] as usize]
    }

    /// Whether `cellIds[particleIds[i]]` is non-decreasing.
    pub fn is_sorted_by_cell(&self) -> bool {
        (1..self.len()).all(|i| self.sorted_cell(i - 1) <= self.sorted_cell(i))
    }

    pub(crate) fn sort_parts(&mut self) -> (&mut [u32], &[u32]) {
        (&mut self.particle_ids, &self.cell_ids)
    }

    /// Rebuild from a GPU download. `particle_ids` holds at least `len` entries.
    pub(crate) fn from_raw(mut particle_ids: Vec<u32>, cell_ids: Vec<u32>) -> Self {
        particle_ids.truncate(cell_ids.len());
        particle_ids.resize(padded_len(cell_ids.len()), 0);
        Self { particle_ids, cell_ids }
    }

    fn reset_ids(&mut self) {
        self.particle_ids
            .par_iter_mut()
            .enumerate()
            .for_each(|(i, id)| *id = i as u32);
    }
}

/// Next power of two at or above `len`, or 0 for an empty input.
#[inline]
pub fn padded_len(len: usize) -> usize {
    if len == 0 {
        0
    } else {
        len.next_power_of_two()
    }
}

/// `len` copies of `value`, reporting allocation failure instead of aborting.
pub(crate) fn try_filled<T: Clone>(
    label: &'static str,
    len: usize,
    value: T,
) -> Result<Vec<T>, CapacityError> {
    let mut buffer = Vec::new();
    buffer
        .try_reserve_exact(len)
        .map_err(|_| CapacityError::AllocationFailed {
            label,
            requested: (len as u64).saturating_mul(std::mem::size_of::<T>() as u64),
        })?;
    buffer.resize(len, value);
    Ok(buffer)
}

/// Write the cell id of every particle and reset the permutation.
///
/// Every particle is independent, so the pass runs fully parallel.
pub fn assign_cells(
    grid: &GridGeometry,
    particles: &[Particle],
    pairs: &mut CellPairs,
) -> Result<(), CapacityError> {
    if particles.len() != pairs.len() {
        return Err(CapacityError::ParticleCountMismatch {
            capacity: pairs.len(),
            particles: particles.len(),
        });
    }
    pairs
        .cell_ids
        .par_iter_mut()
        .zip(particles.par_iter())
        .for_each(|(cell, p)| *cell = grid.cell_id_of(p.position));
    pairs.reset_ids();
    Ok(())
}

/// Half-open range `[start, end)` into the sorted particle-id array.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Pod, Zeroable)]
pub struct CellRange {
    pub start: u32,
    pub end: u32,
}

impl CellRange {
    /// The range of a cell with no particles.
    pub const EMPTY: CellRange = CellRange { start: 0, end: 0 };

    #[inline]
    pub fn len(&self) -> usize {
        (self.end - self.start) as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    #[inline]
    pub fn as_range(&self) -> Range<usize> {
        self.start as usize..self.end as usize
    }
}

/// One [`CellRange`] per grid cell, stamped with the step that built it.
#[derive(Clone, Debug)]
pub struct BoundaryTable {
    ranges: Vec<CellRange>,
    built_for: Option<u64>,
}

impl BoundaryTable {
    /// Table for `num_cells` cells, all empty and not yet built.
    pub fn new(num_cells: u32) -> Result<Self, CapacityError> {
        Ok(Self {
            ranges: try_filled("Cell Bounds", num_cells as usize, CellRange::EMPTY)?,
            built_for: None,
        })
    }

    /// Resize after a grid change. Invalidates the current contents.
    pub fn resize(&mut self, num_cells: u32) -> Result<(), CapacityError> {
        self.built_for = None;
        self.ranges.clear();
        self.ranges
            .try_reserve_exact(num_cells as usize)
            .map_err(|_| CapacityError::AllocationFailed {
                label: "Cell Bounds",
                requested: num_cells as u64 * std::mem::size_of::<CellRange>() as u64,
            })?;
        self.ranges.resize(num_cells as usize, CellRange::EMPTY);
        Ok(())
    }

    /// Wrap ranges produced elsewhere (the GPU backend).
    pub(crate) fn from_ranges(ranges: Vec<CellRange>, built_for: Option<u64>) -> Self {
        Self { ranges, built_for }
    }

    #[inline]
    pub fn num_cells(&self) -> u32 {
        self.ranges.len() as u32
    }

    /// Step whose sorted pairs this table describes, if it was ever built.
    #[inline]
    pub fn built_for(&self) -> Option<u64> {
        self.built_for
    }

    /// Range of `cell`. Ids past the table are empty.
    #[inline]
    pub fn get(&self, cell: u32) -> CellRange {
        self.ranges
            .get(cell as usize)
            .copied()
            .unwrap_or(CellRange::EMPTY)
    }

    #[inline]
    pub fn as_slice(&self) -> &[CellRange] {
        &self.ranges
    }

    /// Rebuild from sorted pairs.
    ///
    /// The table is reset to empty first, because cells without particles
    /// never show up in the scan. Each sorted position then decides on its
    /// own whether it starts a new cell by comparing with its left neighbour.
    /// Consecutive starts delimit the ranges, and the last range ends at `len`.
    ///
    /// A cell id past the end of the table leaves the table unbuilt.
    pub fn build(&mut self, pairs: &CellPairs, step: u64) -> Result<(), CapacityError> {
        self.built_for = None;
        self.ranges.par_iter_mut().for_each(|r| *r = CellRange::EMPTY);
        let num_cells = self.num_cells();

        let n = pairs.len();
        let starts: Vec<usize> = (0..n)
            .into_par_iter()
            .filter(|&i| i == 0 || pairs.sorted_cell(i) != pairs.sorted_cell(i - 1))
            .collect();

        for (k, &start) in starts.iter().enumerate() {
            let end = starts.get(k + 1).copied().unwrap_or(n);
            let cell = pairs.sorted_cell(start);
            let slot = self
                .ranges
                .get_mut(cell as usize)
                .ok_or(CapacityError::CellOutsideTable { cell, num_cells })?;
            *slot = CellRange {
                start: start as u32,
                end: end as u32,
            };
        }

        self.built_for = Some(step);
        Ok(())
    }
}

/// WGSL kernel writing cell ids and resetting the padded permutation.
pub const ASSIGN_CELLS_WGSL: &str = r#"
@compute @workgroup_size(128)
fn assign_cells(
    @builtin(global_invocation_id) gid: vec3<u32>,
    @builtin(num_workgroups) nwg: vec3<u32>,
) {
    let idx = linear_index(gid, nwg);
    if idx >= grid.padded_len {
        return;
    }
    particle_ids[idx] = idx;
    if idx < grid.num_particles {
        cell_ids[idx] = linear_cell_id(cell_coord(particles[idx].position));
    }
}
"#;

/// WGSL kernels resetting and rebuilding the boundary table.
///
/// `bounds` is a flat `array<u32>`; cell `c` owns `bounds[2c]` (start) and
/// `bounds[2c + 1]` (end). A position writes the start of its own cell and
/// the end of its left neighbour's cell, so no two lanes write one word.
pub const BOUNDARIES_WGSL: &str = r#"
@compute @workgroup_size(128)
fn clear_boundaries(
    @builtin(global_invocation_id) gid: vec3<u32>,
    @builtin(num_workgroups) nwg: vec3<u32>,
) {
    let idx = linear_index(gid, nwg);
    if idx >= grid.num_cells {
        return;
    }
    bounds[2u * idx] = 0u;
    bounds[2u * idx + 1u] = 0u;
}

@compute @workgroup_size(128)
fn build_boundaries(
    @builtin(global_invocation_id) gid: vec3<u32>,
    @builtin(num_workgroups) nwg: vec3<u32>,
) {
    let idx = linear_index(gid, nwg);
    let n = grid.num_particles;
    if idx >= n {
        return;
    }

    let cell = cell_ids[particle_ids[idx]];
    if idx == 0u {
        bounds[2u * cell] = 0u;
    } else {
        let prev = cell_ids[particle_ids[idx - 1u]];
        if cell != prev {
            bounds[2u * cell] = idx;
            bounds[2u * prev + 1u] = idx;
        }
    }

    if idx == n - 1u {
        bounds[2u * cell + 1u] = n;
    }
}
"#;
