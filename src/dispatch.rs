//! The per-step state machine.
//!
//! Every call to [`Simulation::step`] runs
//! `AssignCells -> Sort -> BuildBoundaries -> ResolveNeighbors -> IntegrateMotion`
//! exactly once, in that order, on the configured backend. A state only
//! starts after the previous one returned, which is the barrier between
//! dispatches. A failed state poisons the simulation: later states and
//! later steps are refused, because they would run on partial data.

use glam::Vec3;
use rand::rngs::SmallRng;
use rand::SeedableRng;

use crate::config::{Backend, SimConfig};
use crate::cpu::CpuBackend;
use crate::error::{CapacityError, ConfigError, OrderingViolation, StepError};
use crate::gpu::GpuBackend;
use crate::grid::GridGeometry;
use crate::inspect::InspectionReport;
use crate::particle::ParticleStore;
use crate::rules::MotionParams;
use crate::spatial::{BoundaryTable, CellPairs};

/// One state of the step pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Stage {
    AssignCells,
    Sort,
    BuildBoundaries,
    ResolveNeighbors,
    IntegrateMotion,
}

impl Stage {
    /// All states in execution order.
    pub const ORDER: [Stage; 5] = [
        Stage::AssignCells,
        Stage::Sort,
        Stage::BuildBoundaries,
        Stage::ResolveNeighbors,
        Stage::IntegrateMotion,
    ];

    /// The state after this one. `IntegrateMotion` ends the step.
    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::AssignCells => Some(Stage::Sort),
            Stage::Sort => Some(Stage::BuildBoundaries),
            Stage::BuildBoundaries => Some(Stage::ResolveNeighbors),
            Stage::ResolveNeighbors => Some(Stage::IntegrateMotion),
            Stage::IntegrateMotion => None,
        }
    }
}

/// Enforces the state order and counts completed steps.
#[derive(Clone, Debug)]
pub struct StageTracker {
    expected: Stage,
    step: u64,
}

impl Default for StageTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StageTracker {
    pub fn new() -> Self {
        Self {
            expected: Stage::AssignCells,
            step: 0,
        }
    }

    /// Index of the step in progress (or the next one to run).
    #[inline]
    pub fn step(&self) -> u64 {
        self.step
    }

    /// The state allowed to run next.
    #[inline]
    pub fn expected(&self) -> Stage {
        self.expected
    }

    /// Record that `stage` starts. Advances to the following state, and to
    /// the next step after `IntegrateMotion`.
    pub fn enter(&mut self, stage: Stage) -> Result<(), OrderingViolation> {
        if stage != self.expected {
            return Err(OrderingViolation::OutOfOrder {
                expected: self.expected,
                found: stage,
            });
        }
        match stage.next() {
            Some(next) => self.expected = next,
            None => {
                self.expected = Stage::AssignCells;
                self.step += 1;
            }
        }
        Ok(())
    }
}

/// Read-only inputs of one step.
#[derive(Clone, Copy, Debug)]
pub struct StepContext<'a> {
    pub grid: &'a GridGeometry,
    pub motion: MotionParams,
}

impl StepContext<'_> {
    #[inline]
    pub fn step(&self) -> u64 {
        self.motion.step
    }
}

/// Downloaded pipeline buffers from the last step.
#[derive(Clone, Debug)]
pub struct PipelineSnapshot {
    pub pairs: CellPairs,
    pub bounds: BoundaryTable,
}

/// An executor for the five states.
///
/// The dispatcher calls the state methods strictly in [`Stage::ORDER`].
/// Implementations must not return from a state before all its work is
/// visible to the next one.
pub trait StepBackend {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Write cell ids and reset the permutation.
    fn assign_cells(&mut self, ctx: &StepContext<'_>, store: &ParticleStore) -> Result<(), StepError>;

    /// Sort particle ids by cell id.
    fn sort(&mut self, ctx: &StepContext<'_>) -> Result<(), StepError>;

    /// Reset and rebuild the boundary table, stamped with the current step.
    fn build_boundaries(&mut self, ctx: &StepContext<'_>) -> Result<(), StepError>;

    /// Arm neighbour lookups for this step. Fails on a stale table.
    fn resolve_neighbors(&mut self, ctx: &StepContext<'_>) -> Result<(), StepError>;

    /// Advance every particle using its neighbour stencil.
    fn integrate(&mut self, ctx: &StepContext<'_>, store: &mut ParticleStore) -> Result<(), StepError>;

    /// Adopt a new grid. The boundary table is invalidated.
    fn resize_grid(&mut self, grid: &GridGeometry) -> Result<(), StepError>;

    /// Particle count the step buffers were allocated for.
    fn num_particles(&self) -> usize;

    /// Whether `integrate` leaves the authoritative particles on a device.
    fn device_resident(&self) -> bool {
        false
    }

    /// Copy device particles into `store`.
    fn download_particles(&mut self, _store: &mut ParticleStore) -> Result<(), StepError> {
        Ok(())
    }

    /// Replace device particles with `store`.
    fn upload_particles(&mut self, _store: &ParticleStore) -> Result<(), StepError> {
        Ok(())
    }

    /// Copy of the cell pairs and boundary table.
    fn snapshot(&mut self) -> Result<PipelineSnapshot, StepError>;
}

/// A running simulation: particle store, grid and backend.
pub struct Simulation {
    config: SimConfig,
    grid: GridGeometry,
    store: ParticleStore,
    backend: Box<dyn StepBackend>,
    tracker: StageTracker,
    poisoned: bool,
    host_stale: bool,
}

impl Simulation {
    /// Validate `config`, seed its particles and create its backend.
    pub fn new(config: SimConfig) -> Result<Self, StepError> {
        let grid = config.validate()?;
        let mut rng = match config.seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_entropy(),
        };
        let store = ParticleStore::seeded(
            config.num_particles as usize,
            grid.box_size(),
            config.speed,
            &mut rng,
        );
        Self::build(config, grid, store)
    }

    /// Run on caller-supplied particles. `config.num_particles` is ignored
    /// and the store may be empty.
    ///
    /// Positions are expected inside the rounded box; anything outside is
    /// binned into the nearest border cell until the first step folds it in.
    pub fn with_particles(config: SimConfig, store: ParticleStore) -> Result<Self, StepError> {
        config.validate_motion()?;
        let grid = GridGeometry::new(config.radius, config.box_size)?;
        Self::build(config, grid, store)
    }

    /// Run on a caller-supplied backend.
    ///
    /// The backend must be sized for `store`. It is moved onto the grid of
    /// `config` and handed the particles before the first step.
    pub fn with_backend(
        config: SimConfig,
        store: ParticleStore,
        mut backend: Box<dyn StepBackend>,
    ) -> Result<Self, StepError> {
        config.validate_motion()?;
        let grid = GridGeometry::new(config.radius, config.box_size)?;
        if backend.num_particles() != store.len() {
            return Err(CapacityError::ParticleCountMismatch {
                capacity: backend.num_particles(),
                particles: store.len(),
            }
            .into());
        }
        backend.resize_grid(&grid)?;
        backend.upload_particles(&store)?;
        Ok(Self::assemble(config, grid, store, backend))
    }

    fn build(config: SimConfig, grid: GridGeometry, store: ParticleStore) -> Result<Self, StepError> {
        let backend: Box<dyn StepBackend> = match config.backend {
            Backend::Cpu => Box::new(CpuBackend::new(&grid, store.len(), config.rules.clone())?),
            Backend::Gpu => Box::new(GpuBackend::headless(&grid, &store, &config.rules)?),
        };
        Ok(Self::assemble(config, grid, store, backend))
    }

    fn assemble(
        config: SimConfig,
        grid: GridGeometry,
        store: ParticleStore,
        backend: Box<dyn StepBackend>,
    ) -> Self {
        log::info!(
            "Simulation ready: {} particles, grid {}x{}x{} ({} cells, cell size {}), {} backend",
            store.len(),
            grid.dims().x,
            grid.dims().y,
            grid.dims().z,
            grid.num_cells(),
            grid.cell_size(),
            backend.name()
        );
        Self {
            config,
            grid,
            store,
            backend,
            tracker: StageTracker::new(),
            poisoned: false,
            host_stale: false,
        }
    }

    /// Advance the simulation by `delta_time` seconds.
    pub fn step(&mut self, delta_time: f32) -> Result<(), StepError> {
        if self.poisoned {
            return Err(StepError::Poisoned);
        }
        if !delta_time.is_finite() {
            return Err(ConfigError::NonFiniteValue("delta_time").into());
        }

        let result = self.run_step(delta_time);
        if let Err(e) = &result {
            log::error!("Step {} failed: {}", self.tracker.step(), e);
            self.poisoned = true;
        }
        result
    }

    fn run_step(&mut self, delta_time: f32) -> Result<(), StepError> {
        let grid = self.grid;
        let ctx = StepContext {
            grid: &grid,
            motion: MotionParams {
                delta_time,
                speed: self.config.speed,
                noise: self.config.noise,
                radius: self.config.radius,
                step: self.tracker.step(),
            },
        };
        log::trace!("Step {} ({} s)", ctx.step(), delta_time);

        for stage in Stage::ORDER {
            self.tracker.enter(stage)?;
            match stage {
                Stage::AssignCells => self.backend.assign_cells(&ctx, &self.store)?,
                Stage::Sort => self.backend.sort(&ctx)?,
                Stage::BuildBoundaries => self.backend.build_boundaries(&ctx)?,
                Stage::ResolveNeighbors => self.backend.resolve_neighbors(&ctx)?,
                Stage::IntegrateMotion => {
                    self.backend.integrate(&ctx, &mut self.store)?;
                    self.host_stale = self.backend.device_resident();
                }
            }
        }
        Ok(())
    }

    /// Change the box mid-run.
    ///
    /// The box is re-rounded, the grid rebuilt, and every particle folded
    /// into the new box with reflective walls before the next step.
    ///
    /// An invalid box leaves the simulation untouched. If the backend fails
    /// to adopt the new grid, its buffers no longer match the host and the
    /// simulation is poisoned.
    pub fn set_box(&mut self, box_size: Vec3) -> Result<(), StepError> {
        if self.poisoned {
            return Err(StepError::Poisoned);
        }
        let grid = GridGeometry::new(self.config.radius, box_size)?;
        self.sync_store()?;

        let mut folded = self.store.clone();
        for p in folded.as_mut_slice() {
            grid.reflect_into_box(&mut p.position, &mut p.velocity);
        }
        let adopted = self
            .backend
            .resize_grid(&grid)
            .and_then(|()| self.backend.upload_particles(&folded));
        if let Err(e) = adopted {
            log::error!("Backend rejected box {:?}: {}", grid.box_size(), e);
            self.poisoned = true;
            return Err(e);
        }
        self.store = folded;

        log::info!(
            "Box resized to {:?}: grid {}x{}x{} ({} cells)",
            grid.box_size(),
            grid.dims().x,
            grid.dims().y,
            grid.dims().z,
            grid.num_cells()
        );
        self.config.box_size = box_size;
        self.grid = grid;
        Ok(())
    }

    fn sync_store(&mut self) -> Result<(), StepError> {
        if self.host_stale {
            self.backend.download_particles(&mut self.store)?;
            self.host_stale = false;
        }
        Ok(())
    }

    /// Particles after the last completed step.
    pub fn particles(&mut self) -> Result<&ParticleStore, StepError> {
        self.sync_store()?;
        Ok(&self.store)
    }

    /// Cell pairs and boundary table of the last step.
    pub fn snapshot(&mut self) -> Result<PipelineSnapshot, StepError> {
        self.backend.snapshot()
    }

    /// Collect the tables selected by the inspection config.
    pub fn inspect(&mut self) -> Result<InspectionReport, StepError> {
        let options = self.config.inspect;
        let snapshot = self.backend.snapshot()?;
        self.sync_store()?;
        Ok(InspectionReport::collect(
            &self.grid,
            &self.store,
            &snapshot,
            &options,
        ))
    }

    #[inline]
    pub fn grid(&self) -> &GridGeometry {
        &self.grid
    }

    #[inline]
    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    /// Number of completed steps.
    #[inline]
    pub fn step_count(&self) -> u64 {
        self.tracker.step()
    }

    /// Whether an earlier failure stopped the simulation.
    #[inline]
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }
}
