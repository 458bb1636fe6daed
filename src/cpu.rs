//! Host backend. Every state is one or more rayon passes; a pass returns
//! only after all of its tasks finished.

use glam::Vec3;
use rayon::prelude::*;

use crate::dispatch::{PipelineSnapshot, StepBackend, StepContext};
use crate::error::{CapacityError, OrderingViolation, StepError};
use crate::grid::GridGeometry;
use crate::particle::ParticleStore;
use crate::rules::{crowding_color, gather_neighbors, next_velocity, Rule};
use crate::sort::bitonic_sort;
use crate::spatial::{assign_cells, try_filled, BoundaryTable, CellPairs};
use crate::stencil::NeighborIndex;

/// Step buffers for the host backend, allocated once and reused.
pub struct CpuBackend {
    rules: Vec<Rule>,
    pairs: CellPairs,
    bounds: BoundaryTable,
    /// New velocity and neighbour count per particle.
    scratch: Vec<(Vec3, u32)>,
    resolved_for: Option<u64>,
}

impl CpuBackend {
    /// Allocate every step buffer up front. Fails instead of aborting when
    /// the host cannot hold them.
    pub fn new(
        grid: &GridGeometry,
        num_particles: usize,
        rules: Vec<Rule>,
    ) -> Result<Self, CapacityError> {
        let pairs = CellPairs::new(num_particles)?;
        let bounds = BoundaryTable::new(grid.num_cells())?;
        let scratch = try_filled("Velocity Scratch", num_particles, (Vec3::ZERO, 0))?;
        log::debug!(
            "CPU buffers: {} pairs (padded {}), {} cells",
            num_particles,
            pairs.padded_len(),
            grid.num_cells()
        );
        Ok(Self {
            rules,
            pairs,
            bounds,
            scratch,
            resolved_for: None,
        })
    }

    pub fn pairs(&self) -> &CellPairs {
        &self.pairs
    }

    pub fn bounds(&self) -> &BoundaryTable {
        &self.bounds
    }
}

impl StepBackend for CpuBackend {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn assign_cells(&mut self, ctx: &StepContext<'_>, store: &ParticleStore) -> Result<(), StepError> {
        self.resolved_for = None;
        assign_cells(ctx.grid, store.as_slice(), &mut self.pairs)?;
        Ok(())
    }

    fn sort(&mut self, _ctx: &StepContext<'_>) -> Result<(), StepError> {
        bitonic_sort(&mut self.pairs);
        Ok(())
    }

    fn build_boundaries(&mut self, ctx: &StepContext<'_>) -> Result<(), StepError> {
        self.bounds.build(&self.pairs, ctx.step())?;
        Ok(())
    }

    fn resolve_neighbors(&mut self, ctx: &StepContext<'_>) -> Result<(), StepError> {
        NeighborIndex::new(ctx.grid, &self.pairs, &self.bounds, ctx.step())?;
        self.resolved_for = Some(ctx.step());
        Ok(())
    }

    fn integrate(&mut self, ctx: &StepContext<'_>, store: &mut ParticleStore) -> Result<(), StepError> {
        if self.resolved_for != Some(ctx.step()) {
            return Err(OrderingViolation::StaleBoundaries {
                built_for: self.bounds.built_for(),
                current: ctx.step(),
            }
            .into());
        }
        let index = NeighborIndex::new(ctx.grid, &self.pairs, &self.bounds, ctx.step())?;
        let params = ctx.motion;
        let rules = &self.rules;

        // Every velocity is computed from the pre-step state before any
        // particle moves.
        let particles = store.as_slice();
        self.scratch
            .par_iter_mut()
            .enumerate()
            .for_each(|(id, out)| {
                let sums = gather_neighbors(&index, particles, id, params.radius);
                let v = next_velocity(rules, &particles[id], id as u32, &sums, &params);
                *out = (v, sums.count);
            });

        let grid = ctx.grid;
        store
            .as_mut_slice()
            .par_iter_mut()
            .zip(self.scratch.par_iter())
            .for_each(|(p, &(velocity, count))| {
                let mut position = p.position + velocity * params.delta_time;
                let mut velocity = velocity;
                grid.reflect_into_box(&mut position, &mut velocity);
                p.position = position;
                p.velocity = velocity;
                p.color = crowding_color(count);
            });
        Ok(())
    }

    fn resize_grid(&mut self, grid: &GridGeometry) -> Result<(), StepError> {
        self.resolved_for = None;
        self.bounds.resize(grid.num_cells())?;
        Ok(())
    }

    fn num_particles(&self) -> usize {
        self.pairs.len()
    }

    fn snapshot(&mut self) -> Result<PipelineSnapshot, StepError> {
        Ok(PipelineSnapshot {
            pairs: self.pairs.clone(),
            bounds: self.bounds.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::particle::Particle;
    use crate::rules::MotionParams;

    fn ctx(grid: &GridGeometry, step: u64) -> StepContext<'_> {
        StepContext {
            grid,
            motion: MotionParams {
                delta_time: 0.1,
                speed: 1.0,
                noise: 0.0,
                radius: grid.cell_size(),
                step,
            },
        }
    }

    fn store(positions: &[Vec3]) -> ParticleStore {
        ParticleStore::from_particles(
            positions
                .iter()
                .map(|&position| Particle {
                    position,
                    velocity: Vec3::X,
                    ..Default::default()
                })
                .collect(),
        )
    }

    #[test]
    fn test_states_in_order() {
        let grid = GridGeometry::new(1.0, Vec3::splat(4.0)).unwrap();
        let mut store = store(&[Vec3::splat(3.5), Vec3::splat(0.5), Vec3::splat(0.6)]);
        let mut backend =
            CpuBackend::new(&grid, store.len(), vec![Rule::ConstantSpeed]).unwrap();
        let c = ctx(&grid, 0);

        backend.assign_cells(&c, &store).unwrap();
        backend.sort(&c).unwrap();
        assert!(backend.pairs().is_sorted_by_cell());
        backend.build_boundaries(&c).unwrap();
        assert_eq!(backend.bounds().get(0).len(), 2);
        backend.resolve_neighbors(&c).unwrap();
        backend.integrate(&c, &mut store).unwrap();

        for p in store.as_slice() {
            assert!((p.velocity.length() - 1.0).abs() < 1e-5);
            assert!(p.position.cmplt(grid.box_size()).all());
        }
    }

    #[test]
    fn test_integrate_without_resolve_is_rejected() {
        let grid = GridGeometry::new(1.0, Vec3::splat(2.0)).unwrap();
        let mut store = store(&[Vec3::splat(0.5)]);
        let mut backend = CpuBackend::new(&grid, 1, Vec::new()).unwrap();
        let c = ctx(&grid, 0);

        backend.assign_cells(&c, &store).unwrap();
        backend.sort(&c).unwrap();
        backend.build_boundaries(&c).unwrap();
        assert!(matches!(
            backend.integrate(&c, &mut store),
            Err(StepError::Ordering(OrderingViolation::StaleBoundaries { .. }))
        ));
    }

    #[test]
    fn test_resolve_with_last_steps_table_is_rejected() {
        let grid = GridGeometry::new(1.0, Vec3::splat(2.0)).unwrap();
        let store = store(&[Vec3::splat(0.5)]);
        let mut backend = CpuBackend::new(&grid, 1, Vec::new()).unwrap();

        let first = ctx(&grid, 0);
        backend.assign_cells(&first, &store).unwrap();
        backend.sort(&first).unwrap();
        backend.build_boundaries(&first).unwrap();

        let second = ctx(&grid, 1);
        backend.assign_cells(&second, &store).unwrap();
        backend.sort(&second).unwrap();
        assert!(matches!(
            backend.resolve_neighbors(&second),
            Err(StepError::Ordering(OrderingViolation::StaleBoundaries {
                built_for: Some(0),
                current: 1
            }))
        ));
    }

    #[test]
    fn test_resize_grid_invalidates_table() {
        let grid = GridGeometry::new(1.0, Vec3::splat(2.0)).unwrap();
        let bigger = GridGeometry::new(1.0, Vec3::splat(3.0)).unwrap();
        let mut backend = CpuBackend::new(&grid, 0, Vec::new()).unwrap();
        backend.resize_grid(&bigger).unwrap();
        assert_eq!(backend.bounds().num_cells(), 27);
        assert_eq!(backend.bounds().built_for(), None);
    }

    #[test]
    fn test_unallocatable_buffers_are_reported() {
        let grid = GridGeometry::new(1.0, Vec3::splat(2.0)).unwrap();
        assert!(matches!(
            CpuBackend::new(&grid, usize::MAX / 4, Vec::new()),
            Err(CapacityError::AllocationFailed { .. })
        ));
    }
}
