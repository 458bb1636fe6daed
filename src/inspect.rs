//! Debug dumps of the pipeline tables.
//!
//! Purely observational: a report is built from downloaded copies and
//! nothing in it feeds back into the next step.

use std::fmt;

use glam::{UVec3, Vec3};

use crate::config::InspectConfig;
use crate::dispatch::PipelineSnapshot;
use crate::grid::GridGeometry;
use crate::particle::{Particle, ParticleStore};
use crate::spatial::CellRange;
use crate::stencil::{resolve_stencil, NeighborCell};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GridSummary {
    pub cell_size: f32,
    pub dims: UVec3,
    pub box_size: Vec3,
    pub num_cells: u32,
}

/// First-K views of the particle store, cell pairs, boundaries and the
/// stencil of particle 0.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InspectionReport {
    pub grid: Option<GridSummary>,
    /// `(particle id, particle)` for the first particles.
    pub particles: Vec<(u32, Particle)>,
    /// `(particle id, cell id)` at the first sorted positions.
    pub pairs: Vec<(u32, u32)>,
    /// Non-empty cells among the first cell ids, with their ranges.
    pub cells: Vec<(u32, CellRange)>,
    /// Step the boundary table was built for.
    pub built_for: Option<u64>,
    /// Stencil around particle 0's cell.
    pub neighbor_cells: Vec<NeighborCell>,
    /// First candidate ids in that stencil.
    pub neighbor_particles: Vec<u32>,
}

impl InspectionReport {
    pub fn collect(
        grid: &GridGeometry,
        store: &ParticleStore,
        snapshot: &PipelineSnapshot,
        options: &InspectConfig,
    ) -> Self {
        let k = options.limit;
        let mut report = InspectionReport {
            built_for: snapshot.bounds.built_for(),
            ..Default::default()
        };

        if options.grid {
            report.grid = Some(GridSummary {
                cell_size: grid.cell_size(),
                dims: grid.dims(),
                box_size: grid.box_size(),
                num_cells: grid.num_cells(),
            });
        }

        if options.particles {
            report.particles = store
                .as_slice()
                .iter()
                .take(k)
                .enumerate()
                .map(|(i, p)| (i as u32, *p))
                .collect();
        }

        let pairs = &snapshot.pairs;
        if options.cells {
            report.pairs = pairs
                .particle_ids()
                .iter()
                .take(k)
                .map(|&id| (id, pairs.cell_ids()[id as usize]))
                .collect();
            report.cells = (0..snapshot.bounds.num_cells().min(k as u32))
                .map(|c| (c, snapshot.bounds.get(c)))
                .filter(|(_, r)| !r.is_empty())
                .collect();
        }

        if options.neighbours {
            if let Some(&cell) = pairs.cell_ids().first() {
                let stencil = resolve_stencil(grid, &snapshot.bounds, grid.coord_of(cell));
                report.neighbor_cells = stencil.as_slice().to_vec();
                let sorted = pairs.particle_ids();
                report.neighbor_particles = stencil
                    .iter()
                    .flat_map(|c| sorted.get(c.range.as_range()).unwrap_or(&[]).iter().copied())
                    .take(k)
                    .collect();
            }
        }

        report
    }
}

impl fmt::Display for InspectionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(grid) = &self.grid {
            writeln!(f, "----------Grid----------")?;
            writeln!(
                f,
                "cell size {}, dims {}x{}x{} ({} cells), box {:?}",
                grid.cell_size, grid.dims.x, grid.dims.y, grid.dims.z, grid.num_cells, grid.box_size
            )?;
        }

        if !self.particles.is_empty() {
            writeln!(f, "----------Particles----------")?;
            for (id, p) in &self.particles {
                writeln!(f, "{}: position {:?} velocity {:?}", id, p.position, p.velocity)?;
            }
        }

        if !self.pairs.is_empty() {
            writeln!(f, "----------Particle/Cell Pairs----------")?;
            for (i, (id, cell)) in self.pairs.iter().enumerate() {
                writeln!(f, "{}: {{{}, {}}}", i, id, cell)?;
            }
        }

        if !self.cells.is_empty() {
            match self.built_for {
                Some(step) => writeln!(f, "----------Cell Bounds (step {})----------", step)?,
                None => writeln!(f, "----------Cell Bounds (never built)----------")?,
            }
            for (cell, range) in &self.cells {
                writeln!(f, "cell {}: [{}, {})", cell, range.start, range.end)?;
            }
        }

        if !self.neighbor_cells.is_empty() {
            writeln!(f, "----------Neighbours of particle 0----------")?;
            let ids: Vec<String> = self
                .neighbor_cells
                .iter()
                .map(|c| c.cell_id.to_string())
                .collect();
            writeln!(f, "cells: {}", ids.join(", "))?;
            writeln!(f, "particles: {:?}", self.neighbor_particles)?;
        }

        Ok(())
    }
}
