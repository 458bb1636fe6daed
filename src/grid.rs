//! Uniform grid geometry.
//!
//! The box is always an exact multiple of the cell size. A caller-supplied
//! box is rounded to the nearest multiple (ties to even) with at least one
//! cell per axis, and the grid dimensions are that multiple.

use glam::{IVec3, UVec3, Vec3};

use crate::error::ConfigError;

/// Cell id reserved for sort padding. Real cell ids are always smaller.
pub const SENTINEL_CELL: u32 = u32::MAX;

/// Consistent `(cell_size, dims, box)` triple for one grid configuration.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GridGeometry {
    cell_size: f32,
    dims: UVec3,
    box_size: Vec3,
}

impl GridGeometry {
    /// Build the grid for `cell_size` and the requested `box_size`.
    ///
    /// The box is rounded with [`round_box`]. Fails if the cell size or any
    /// box extent is not a positive finite number, or if the grid would need
    /// so many cells that a cell id could equal [`SENTINEL_CELL`].
    pub fn new(cell_size: f32, box_size: Vec3) -> Result<Self, ConfigError> {
        if !cell_size.is_finite() {
            return Err(ConfigError::NonFiniteValue("cell_size"));
        }
        if cell_size <= 0.0 {
            return Err(ConfigError::NonPositiveCellSize(cell_size));
        }
        for axis in 0..3 {
            let value = box_size[axis];
            if !value.is_finite() {
                return Err(ConfigError::NonFiniteValue("box"));
            }
            if value <= 0.0 {
                return Err(ConfigError::NonPositiveBox { axis, value });
            }
        }

        let counts = cells_per_axis(cell_size, box_size);
        let cells = counts
            .iter()
            .fold(1u64, |acc, &c| acc.saturating_mul(c as u64));
        if cells >= SENTINEL_CELL as u64 || counts.iter().any(|&c| c > u32::MAX as f32) {
            return Err(ConfigError::GridTooLarge { cells });
        }

        let dims = UVec3::new(counts[0] as u32, counts[1] as u32, counts[2] as u32);
        Ok(Self {
            cell_size,
            dims,
            box_size: dims.as_vec3() * cell_size,
        })
    }

    /// Edge length of one cell.
    #[inline]
    pub fn cell_size(&self) -> f32 {
        self.cell_size
    }

    /// Number of cells along each axis.
    #[inline]
    pub fn dims(&self) -> UVec3 {
        self.dims
    }

    /// Rounded box extents; each is `dims[i] * cell_size`.
    #[inline]
    pub fn box_size(&self) -> Vec3 {
        self.box_size
    }

    /// Total number of cells, `dims.x * dims.y * dims.z`.
    #[inline]
    pub fn num_cells(&self) -> u32 {
        self.dims.x * self.dims.y * self.dims.z
    }

    /// Grid coordinate of the cell containing `position`.
    ///
    /// Positions outside the box are clamped onto the nearest border cell.
    pub fn cell_coord(&self, position: Vec3) -> UVec3 {
        let hi = (self.dims - UVec3::ONE).as_vec3();
        let coord = (position / self.cell_size).floor().clamp(Vec3::ZERO, hi);
        // NaN survives the clamp and saturates to 0 on the cast.
        coord.as_uvec3()
    }

    /// Linear id of the cell at `coord`: `x + y*dx + z*dx*dy`.
    #[inline]
    pub fn cell_id(&self, coord: UVec3) -> u32 {
        coord.x + coord.y * self.dims.x + coord.z * self.dims.x * self.dims.y
    }

    /// Linear cell id for a world position.
    #[inline]
    pub fn cell_id_of(&self, position: Vec3) -> u32 {
        self.cell_id(self.cell_coord(position))
    }

    /// Inverse of [`cell_id`](Self::cell_id).
    pub fn coord_of(&self, cell_id: u32) -> UVec3 {
        let layer = self.dims.x * self.dims.y;
        UVec3::new(
            cell_id % self.dims.x,
            (cell_id % layer) / self.dims.x,
            cell_id / layer,
        )
    }

    /// Whether a signed grid coordinate lies inside `[0, dims)` on every axis.
    #[inline]
    pub fn contains(&self, coord: IVec3) -> bool {
        coord.cmpge(IVec3::ZERO).all() && coord.cmplt(self.dims.as_ivec3()).all()
    }

    /// Fold a particle back into `[0, box)` with reflective walls.
    ///
    /// A coordinate below zero is mirrored about 0 and a coordinate at or
    /// past the box is mirrored about the wall; the velocity component is
    /// pointed back inside. The result is clamped so it never equals `box`.
    pub fn reflect_into_box(&self, position: &mut Vec3, velocity: &mut Vec3) {
        for axis in 0..3 {
            let hi = self.box_size[axis];
            let mut x = position[axis];
            if x < 0.0 {
                x = -x;
                velocity[axis] = velocity[axis].abs();
            } else if x >= hi {
                x = 2.0 * hi - x;
                velocity[axis] = -velocity[axis].abs();
            }
            position[axis] = if x.is_nan() { 0.0 } else { x.clamp(0.0, below(hi)) };
        }
    }
}

/// Round `box_size` to the nearest multiple of `cell_size` on each axis.
///
/// Ties go to even (`2.5 cells` becomes 2), and an axis never rounds below
/// one cell. Applying the rounding to its own output is a no-op.
pub fn round_box(cell_size: f32, box_size: Vec3) -> Vec3 {
    Vec3::from_array(cells_per_axis(cell_size, box_size)) * cell_size
}

fn cells_per_axis(cell_size: f32, box_size: Vec3) -> [f32; 3] {
    (box_size / cell_size).to_array().map(|c| c.round_ties_even().max(1.0))
}

/// Largest f32 strictly below a positive finite `x`.
#[inline]
pub(crate) fn below(x: f32) -> f32 {
    f32::from_bits(x.to_bits() - 1)
}

/// WGSL helpers mirroring [`GridGeometry`]; expects a `grid: GridParams` binding.
pub const GRID_WGSL: &str = r#"
struct GridParams {
    box_size: vec3<f32>,
    cell_size: f32,
    dims: vec3<u32>,
    num_particles: u32,
    num_cells: u32,
    padded_len: u32,
    step: u32,
    delta_time: f32,
    speed: f32,
    noise: f32,
    radius: f32,
    _pad: u32,
};

fn cell_coord(pos: vec3<f32>) -> vec3<u32> {
    let hi = vec3<f32>(grid.dims - vec3<u32>(1u));
    let c = clamp(floor(pos / grid.cell_size), vec3<f32>(0.0), hi);
    return vec3<u32>(c);
}

fn linear_cell_id(c: vec3<u32>) -> u32 {
    return c.x + c.y * grid.dims.x + c.z * grid.dims.x * grid.dims.y;
}

fn in_grid(c: vec3<i32>) -> bool {
    let d = vec3<i32>(grid.dims);
    return all(c >= vec3<i32>(0)) && all(c < d);
}

fn below(x: f32) -> f32 {
    return bitcast<f32>(bitcast<u32>(x) - 1u);
}

fn reflect_into_box(pos: ptr<function, vec3<f32>>, vel: ptr<function, vec3<f32>>) {
    for (var axis = 0u; axis < 3u; axis++) {
        let hi = grid.box_size[axis];
        var x = (*pos)[axis];
        if x < 0.0 {
            x = -x;
            (*vel)[axis] = abs((*vel)[axis]);
        } else if x >= hi {
            x = 2.0 * hi - x;
            (*vel)[axis] = -abs((*vel)[axis]);
        }
        (*pos)[axis] = clamp(x, 0.0, below(hi));
    }
}
"#;
