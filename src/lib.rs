//! # cellgrid - uniform-grid neighbour search for particles
//!
//! Bins particles into a uniform 3D grid every step so each particle only
//! looks at the 27 cells around it instead of every other particle.
//!
//! ## Quick Start
//!
//! ```ignore
//! use cellgrid::prelude::*;
//!
//! fn main() -> Result<(), StepError> {
//!     let config = SimConfig::new(50_000)
//!         .with_radius(0.05)
//!         .with_box(Vec3::ONE)
//!         .with_rule(Rule::Separate { strength: 2.0 })
//!         .with_rule(Rule::ConstantSpeed);
//!
//!     let mut sim = Simulation::new(config)?;
//!     for _ in 0..100 {
//!         sim.step(1.0 / 60.0)?;
//!     }
//!     println!("{}", sim.inspect()?);
//!     Ok(())
//! }
//! ```
//!
//! ## The step pipeline
//!
//! Each call to [`Simulation::step`] runs five states in a fixed order:
//!
//! 1. **AssignCells** - every particle gets the linear id of its cell,
//!    `x + y*dx + z*dx*dy`, and the particle-id array is reset to the
//!    identity.
//! 2. **Sort** - a bitonic network sorts the particle ids by cell id. Keys are
//!    looked up through the ids, so particle records never move.
//! 3. **BuildBoundaries** - one scan over the sorted ids writes a
//!    `[start, end)` range per cell. Empty cells stay `start == end`.
//! 4. **ResolveNeighbors** - the stencil lookup is armed for this step only.
//! 5. **IntegrateMotion** - each particle walks its 3x3x3 stencil, the
//!    configured [`Rule`]s update its velocity, and it moves.
//!
//! Derived buffers are reused across steps but rebuilt from scratch every
//! step. A boundary table from an earlier step is never consulted.
//!
//! ## Backends
//!
//! - [`Backend::Cpu`] runs every pass as a rayon job.
//! - [`Backend::Gpu`] runs every pass as a wgpu compute pass on a headless
//!   device, 128 lanes per work group.
//!
//! ## Grid geometry
//!
//! The cell size equals the interaction radius. The box is rounded to the
//! nearest multiple of the cell size (ties to even, at least one cell per
//! axis), and particles bounce off its walls.

pub mod config;
pub mod cpu;
pub mod dispatch;
pub mod error;
pub mod gpu;
pub mod grid;
pub mod inspect;
pub mod particle;
pub mod rules;
pub mod sort;
pub mod spatial;
pub mod stencil;

pub use config::{Backend, InspectConfig, SimConfig};
pub use cpu::CpuBackend;
pub use dispatch::{PipelineSnapshot, Simulation, Stage, StageTracker, StepBackend, StepContext};
pub use error::{CapacityError, ConfigError, ConfigLoadError, GpuError, OrderingViolation, StepError};
pub use glam::{UVec3, Vec3};
pub use gpu::{GpuBackend, GpuContext};
pub use grid::{round_box, GridGeometry};
pub use inspect::InspectionReport;
pub use particle::{Particle, ParticleStore};
pub use rules::{MotionParams, NeighborSums, Rule};
pub use sort::bitonic_sort;
pub use spatial::{assign_cells, BoundaryTable, CellPairs, CellRange};
pub use stencil::{NeighborIndex, Stencil};

/// Convenient re-exports for common usage.
///
/// ```ignore
/// use cellgrid::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::{Backend, InspectConfig, SimConfig};
    pub use crate::dispatch::Simulation;
    pub use crate::error::StepError;
    pub use crate::particle::{Particle, ParticleStore};
    pub use crate::rules::Rule;
    pub use crate::Vec3;
}
