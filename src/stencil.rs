//! 3x3x3 neighbour stencil over the boundary table.
//!
//! A particle's candidate neighbours are all particles in its own cell and
//! the up to 26 cells around it. Cells outside the grid are skipped; the
//! grid does not wrap. Stencils are recomputed per particle since each
//! boundary lookup is O(1).

use glam::{IVec3, UVec3, Vec3};

use crate::error::OrderingViolation;
use crate::grid::GridGeometry;
use crate::spatial::{BoundaryTable, CellPairs, CellRange};

/// Maximum number of cells in a stencil.
pub const STENCIL_SIZE: usize = 27;

/// One resolved stencil cell.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NeighborCell {
    pub cell_id: u32,
    pub range: CellRange,
}

/// Up to 27 resolved cells, in ascending cell-id order.
#[derive(Clone, Copy, Debug)]
pub struct Stencil {
    cells: [NeighborCell; STENCIL_SIZE],
    len: usize,
}

impl Stencil {
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn as_slice(&self) -> &[NeighborCell] {
        &self.cells[..self.len]
    }

    pub fn iter(&self) -> impl Iterator<Item = &NeighborCell> {
        self.as_slice().iter()
    }

    /// Cell ids of the stencil.
    pub fn cell_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.iter().map(|c| c.cell_id)
    }

    /// Total number of candidate particles across all cells.
    pub fn candidate_count(&self) -> usize {
        self.iter().map(|c| c.range.len()).sum()
    }
}

/// In-grid cell ids of the 3x3x3 block around `center`, including `center`.
///
/// Offsets run z outermost, x innermost, so ids come out ascending.
pub fn stencil_cell_ids(grid: &GridGeometry, center: UVec3) -> impl Iterator<Item = u32> + '_ {
    let center = center.as_ivec3();
    (-1..=1).flat_map(move |dz| {
        (-1..=1).flat_map(move |dy| {
            (-1..=1).filter_map(move |dx| {
                let c = center + IVec3::new(dx, dy, dz);
                grid.contains(c).then(|| grid.cell_id(c.as_uvec3()))
            })
        })
    })
}

/// Look up the boundary ranges of every cell around `center`.
pub fn resolve_stencil(grid: &GridGeometry, bounds: &BoundaryTable, center: UVec3) -> Stencil {
    let mut stencil = Stencil {
        cells: [NeighborCell::default(); STENCIL_SIZE],
        len: 0,
    };
    for cell_id in stencil_cell_ids(grid, center) {
        stencil.cells[stencil.len] = NeighborCell {
            cell_id,
            range: bounds.get(cell_id),
        };
        stencil.len += 1;
    }
    stencil
}

/// Read-only neighbour lookup for one step.
///
/// Only constructible from a boundary table built during the current step,
/// so stale ranges from an earlier step can never be consulted.
#[derive(Clone, Copy)]
pub struct NeighborIndex<'a> {
    grid: &'a GridGeometry,
    pairs: &'a CellPairs,
    bounds: &'a BoundaryTable,
}

impl<'a> NeighborIndex<'a> {
    /// Arm the index for `step`.
    pub fn new(
        grid: &'a GridGeometry,
        pairs: &'a CellPairs,
        bounds: &'a BoundaryTable,
        step: u64,
    ) -> Result<Self, OrderingViolation> {
        match bounds.built_for() {
            Some(built) if built == step => Ok(Self { grid, pairs, bounds }),
            built => Err(OrderingViolation::StaleBoundaries {
                built_for: built,
                current: step,
            }),
        }
    }

    #[inline]
    pub fn grid(&self) -> &GridGeometry {
        self.grid
    }

    /// Stencil around the cell containing `position`.
    #[inline]
    pub fn stencil_at(&self, position: Vec3) -> Stencil {
        resolve_stencil(self.grid, self.bounds, self.grid.cell_coord(position))
    }

    /// Stencil around a cell id.
    #[inline]
    pub fn stencil_of_cell(&self, cell_id: u32) -> Stencil {
        resolve_stencil(self.grid, self.bounds, self.grid.coord_of(cell_id))
    }

    /// Particle ids in the given stencil, cell by cell.
    pub fn particles_in<'s>(&'s self, stencil: &'s Stencil) -> impl Iterator<Item = u32> + 's {
        let sorted = self.pairs.particle_ids();
        stencil
            .iter()
            .flat_map(move |cell| sorted[cell.range.as_range()].iter().copied())
    }

    /// Candidate neighbour ids of `particle` (including itself).
    pub fn candidates_of(&self, particle: u32) -> Vec<u32> {
        let cell = self.pairs.cell_ids()[particle as usize];
        let stencil = self.stencil_of_cell(cell);
        self.particles_in(&stencil).collect()
    }
}

/// WGSL stencil walk; calls `visit_neighbor(self_id, other_id)` for every
/// candidate. The caller supplies `visit_neighbor`.
pub const STENCIL_WGSL: &str = r#"
fn cell_range(cell: u32) -> vec2<u32> {
    return vec2<u32>(bounds[2u * cell], bounds[2u * cell + 1u]);
}

fn walk_stencil(self_id: u32, center: vec3<u32>) {
    let c = vec3<i32>(center);
    for (var dz = -1; dz <= 1; dz++) {
        for (var dy = -1; dy <= 1; dy++) {
            for (var dx = -1; dx <= 1; dx++) {
                let nc = c + vec3<i32>(dx, dy, dz);
                if !in_grid(nc) {
                    continue;
                }
                let r = cell_range(linear_cell_id(vec3<u32>(nc)));
                for (var s = r.x; s < r.y; s++) {
                    visit_neighbor(self_id, particle_ids[s]);
                }
            }
        }
    }
}
"#;
