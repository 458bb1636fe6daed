//! End-to-end tests of the step pipeline on the CPU backend.

use std::cell::{Cell, RefCell};
use std::collections::BTreeSet;
use std::rc::Rc;

use cellgrid::prelude::*;
use cellgrid::{
    assign_cells, bitonic_sort, round_box, BoundaryTable, CapacityError, CellPairs, CellRange,
    CpuBackend, GridGeometry, NeighborIndex, OrderingViolation, PipelineSnapshot, Stage,
    StepBackend, StepContext, UVec3,
};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

fn still_config(radius: f32, box_size: Vec3) -> SimConfig {
    SimConfig::new(1)
        .with_radius(radius)
        .with_box(box_size)
        .with_noise(0.0)
        .with_rules(Vec::new())
}

fn particles_at(positions: &[Vec3]) -> ParticleStore {
    ParticleStore::from_particles(
        positions
            .iter()
            .map(|&position| Particle {
                position,
                ..Default::default()
            })
            .collect(),
    )
}

fn random_positions(rng: &mut SmallRng, n: usize, box_size: Vec3) -> Vec<Vec3> {
    (0..n)
        .map(|_| {
            Vec3::new(
                rng.gen_range(0.0..box_size.x),
                rng.gen_range(0.0..box_size.y),
                rng.gen_range(0.0..box_size.z),
            )
        })
        .collect()
}

/// Check every property the sorted pairs and boundary table must satisfy.
fn assert_pipeline_invariants(snapshot: &PipelineSnapshot, num_particles: usize) {
    let pairs = &snapshot.pairs;
    let bounds = &snapshot.bounds;
    assert_eq!(pairs.len(), num_particles);

    // Sorted by cell id
    assert!(pairs.is_sorted_by_cell());

    // A permutation of 0..n
    let ids: BTreeSet<u32> = pairs.particle_ids().iter().copied().collect();
    assert_eq!(ids.len(), num_particles);
    assert!(ids.iter().all(|&id| (id as usize) < num_particles));

    // Ranges partition [0, n) and match their cell
    let mut covered = vec![false; num_particles];
    for cell in 0..bounds.num_cells() {
        let range = bounds.get(cell);
        assert!(range.start <= range.end);
        for i in range.as_range() {
            assert!(!covered[i], "position {} covered twice", i);
            covered[i] = true;
            assert_eq!(pairs.sorted_cell(i), cell);
        }
    }
    assert!(covered.iter().all(|&c| c), "some sorted positions are in no range");
}

#[test]
fn test_eight_particles_in_2x2x2_grid() {
    // One particle per cell, listed in cell-id order.
    let mut positions = Vec::new();
    for z in [0.1, 1.9] {
        for y in [0.1, 1.9] {
            for x in [0.1, 1.9] {
                positions.push(Vec3::new(x, y, z));
            }
        }
    }
    let config = still_config(1.0, Vec3::splat(2.0));
    let mut sim = Simulation::with_particles(config, particles_at(&positions)).unwrap();
    sim.step(0.01).unwrap();

    let snapshot = sim.snapshot().unwrap();
    assert_eq!(snapshot.pairs.cell_ids(), &[0, 1, 2, 3, 4, 5, 6, 7]);
    for cell in 0..8u32 {
        assert_eq!(
            snapshot.bounds.get(cell),
            CellRange {
                start: cell,
                end: cell + 1
            }
        );
    }
    assert_pipeline_invariants(&snapshot, 8);
}

#[test]
fn test_two_particles_in_one_cell() {
    let config = still_config(1.0, Vec3::splat(2.0));
    let mut sim = Simulation::with_particles(config, particles_at(&[Vec3::ZERO, Vec3::ZERO])).unwrap();
    sim.step(0.01).unwrap();

    let snapshot = sim.snapshot().unwrap();
    let range = snapshot.bounds.get(0);
    assert_eq!(range.len(), 2);
    let mut ids = snapshot.pairs.particle_ids()[range.as_range()].to_vec();
    ids.sort_unstable();
    assert_eq!(ids, vec![0, 1]);
    assert!((1..8).all(|c| snapshot.bounds.get(c).is_empty()));
}

#[test]
fn test_zero_particles_is_a_noop() {
    let config = still_config(1.0, Vec3::splat(3.0));
    let mut sim = Simulation::with_particles(config, ParticleStore::default()).unwrap();
    for _ in 0..3 {
        sim.step(0.01).unwrap();
    }
    assert_eq!(sim.step_count(), 3);

    let snapshot = sim.snapshot().unwrap();
    assert!(snapshot.pairs.particle_ids().is_empty());
    assert_eq!(snapshot.bounds.num_cells(), 27);
    assert!(snapshot.bounds.as_slice().iter().all(CellRange::is_empty));
    assert_eq!(snapshot.bounds.built_for(), Some(2));
    assert!(sim.particles().unwrap().is_empty());
}

#[test]
fn test_random_populations_keep_invariants() {
    let mut rng = SmallRng::seed_from_u64(42);
    for n in [1usize, 2, 3, 17, 100, 511, 512, 513, 2000] {
        let radius = rng.gen_range(0.05..0.5);
        let box_size = Vec3::new(
            rng.gen_range(0.5..2.0),
            rng.gen_range(0.5..2.0),
            rng.gen_range(0.5..2.0),
        );
        let grid = GridGeometry::new(radius, box_size).unwrap();
        let positions = random_positions(&mut rng, n, grid.box_size());

        let config = SimConfig::new(1)
            .with_radius(radius)
            .with_box(box_size)
            .with_rules(vec![Rule::Separate { strength: 1.0 }, Rule::ConstantSpeed]);
        let mut sim = Simulation::with_particles(config, particles_at(&positions)).unwrap();
        for _ in 0..3 {
            sim.step(1.0 / 60.0).unwrap();
            assert_pipeline_invariants(&sim.snapshot().unwrap(), n);
        }
    }
}

#[test]
fn test_all_equal_and_all_distinct_cells() {
    // All in one cell
    let config = still_config(1.0, Vec3::splat(4.0));
    let same = vec![Vec3::splat(2.5); 300];
    let mut sim = Simulation::with_particles(config.clone(), particles_at(&same)).unwrap();
    sim.step(0.01).unwrap();
    let snapshot = sim.snapshot().unwrap();
    assert_pipeline_invariants(&snapshot, 300);
    let cell = sim.grid().cell_id_of(Vec3::splat(2.5));
    assert_eq!(snapshot.bounds.get(cell), CellRange { start: 0, end: 300 });

    // One per cell, in reverse cell order
    let grid = *sim.grid();
    let distinct: Vec<Vec3> = (0..grid.num_cells())
        .rev()
        .map(|c| (grid.coord_of(c).as_vec3() + 0.5) * grid.cell_size())
        .collect();
    let mut sim = Simulation::with_particles(config, particles_at(&distinct)).unwrap();
    sim.step(0.01).unwrap();
    let snapshot = sim.snapshot().unwrap();
    assert_pipeline_invariants(&snapshot, distinct.len());
    assert!(snapshot.bounds.as_slice().iter().all(|r| r.len() == 1));
}

#[test]
fn test_neighbor_containment() {
    let mut rng = SmallRng::seed_from_u64(5);
    let grid = GridGeometry::new(0.25, Vec3::new(1.0, 1.5, 0.75)).unwrap();
    let positions = random_positions(&mut rng, 400, grid.box_size());
    let store = particles_at(&positions);

    let mut pairs = CellPairs::new(store.len()).unwrap();
    assign_cells(&grid, store.as_slice(), &mut pairs).unwrap();
    bitonic_sort(&mut pairs);
    let mut bounds = BoundaryTable::new(grid.num_cells()).unwrap();
    bounds.build(&pairs, 0).unwrap();
    let index = NeighborIndex::new(&grid, &pairs, &bounds, 0).unwrap();

    let coords: Vec<UVec3> = positions.iter().map(|&p| grid.cell_coord(p)).collect();
    for (p, &c) in coords.iter().enumerate() {
        let found: BTreeSet<u32> = index.candidates_of(p as u32).into_iter().collect();
        let expected: BTreeSet<u32> = coords
            .iter()
            .enumerate()
            .filter(|(_, &o)| {
                let d = (o.as_ivec3() - c.as_ivec3()).abs();
                d.max_element() <= 1
            })
            .map(|(q, _)| q as u32)
            .collect();
        assert_eq!(found, expected, "particle {}", p);
    }
}

#[test]
fn test_geometry_rounding_is_idempotent() {
    let mut rng = SmallRng::seed_from_u64(8);
    for _ in 0..500 {
        let cell = rng.gen_range(0.01..3.0f32);
        let requested = Vec3::new(
            rng.gen_range(0.001..20.0),
            rng.gen_range(0.001..20.0),
            rng.gen_range(0.001..20.0),
        );
        let once = GridGeometry::new(cell, requested).unwrap();
        let twice = GridGeometry::new(cell, once.box_size()).unwrap();
        assert_eq!(once.dims(), twice.dims());
        assert_eq!(once.box_size(), twice.box_size());
        assert_eq!(round_box(cell, once.box_size()), once.box_size());
    }
}

#[test]
fn test_particles_stay_in_box() {
    let config = SimConfig::new(2000)
        .with_radius(0.1)
        .with_box(Vec3::new(1.0, 0.5, 0.7))
        .with_speed(3.0)
        .with_noise(0.1)
        .with_seed(3)
        .with_rules(vec![
            Rule::Separate { strength: 2.0 },
            Rule::Align { strength: 1.0 },
            Rule::Cohere { strength: 0.5 },
            Rule::Drag(0.1),
            Rule::ConstantSpeed,
        ]);
    let mut sim = Simulation::new(config).unwrap();
    for _ in 0..30 {
        sim.step(1.0 / 30.0).unwrap();
    }

    let box_size = sim.grid().box_size();
    for p in sim.particles().unwrap().as_slice() {
        assert!(p.position.cmpge(Vec3::ZERO).all(), "{:?}", p.position);
        assert!(p.position.cmplt(box_size).all(), "{:?}", p.position);
        assert!(p.velocity.is_finite());
        assert!((p.velocity.length() - 3.0).abs() < 1e-3);
    }
}

#[test]
fn test_seeded_runs_are_deterministic() {
    let config = SimConfig::new(500)
        .with_radius(0.2)
        .with_seed(77)
        .with_rule(Rule::Separate { strength: 1.0 });
    let mut a = Simulation::new(config.clone()).unwrap();
    let mut b = Simulation::new(config).unwrap();
    for _ in 0..5 {
        a.step(0.02).unwrap();
        b.step(0.02).unwrap();
    }
    assert_eq!(
        a.particles().unwrap().as_slice(),
        b.particles().unwrap().as_slice()
    );
}

#[test]
fn test_set_box_folds_particles() {
    let config = SimConfig::new(1000)
        .with_radius(0.5)
        .with_box(Vec3::splat(4.0))
        .with_seed(1);
    let mut sim = Simulation::new(config).unwrap();
    sim.step(0.01).unwrap();

    sim.set_box(Vec3::new(2.2, 1.0, 4.0)).unwrap();
    assert_eq!(sim.grid().box_size(), Vec3::new(2.0, 1.0, 4.0));
    let box_size = sim.grid().box_size();
    for p in sim.particles().unwrap().as_slice() {
        assert!(p.position.cmplt(box_size).all());
        assert!(p.position.cmpge(Vec3::ZERO).all());
    }

    sim.step(0.01).unwrap();
    assert_pipeline_invariants(&sim.snapshot().unwrap(), 1000);

    // Growing needs a larger boundary table.
    sim.set_box(Vec3::splat(6.0)).unwrap();
    sim.step(0.01).unwrap();
    let snapshot = sim.snapshot().unwrap();
    assert_eq!(snapshot.bounds.num_cells(), 12 * 12 * 12);
    assert_pipeline_invariants(&snapshot, 1000);
}

#[test]
fn test_invalid_configuration_is_reported() {
    assert!(matches!(
        Simulation::new(SimConfig::new(0)),
        Err(StepError::Config(cellgrid::ConfigError::NoParticles))
    ));
    assert!(matches!(
        Simulation::new(SimConfig::new(10).with_box(Vec3::new(1.0, 0.0, 1.0))),
        Err(StepError::Config(cellgrid::ConfigError::NonPositiveBox { axis: 1, .. }))
    ));

    let mut sim = Simulation::new(SimConfig::new(10).with_radius(0.5)).unwrap();
    assert!(matches!(sim.set_box(Vec3::splat(-1.0)), Err(StepError::Config(_))));
    // A rejected box leaves the simulation usable.
    sim.step(0.01).unwrap();
}

#[test]
fn test_non_finite_delta_time_is_rejected() {
    let mut sim = Simulation::new(SimConfig::new(10).with_radius(0.5)).unwrap();
    assert!(sim.step(f32::NAN).is_err());
    assert!(!sim.is_poisoned());
    sim.step(0.01).unwrap();
}

#[test]
fn test_inspect_report() {
    let config = SimConfig::new(50).with_radius(0.25).with_seed(4);
    let mut sim = Simulation::new(config).unwrap();
    sim.step(0.01).unwrap();

    let report = sim.inspect().unwrap();
    assert_eq!(report.particles.len(), 10);
    assert_eq!(report.pairs.len(), 10);
    assert_eq!(report.built_for, Some(0));
    let own_cell = sim.snapshot().unwrap().pairs.cell_ids()[0];
    assert!(report.neighbor_cells.iter().any(|c| c.cell_id == own_cell));
    assert!(!report.neighbor_particles.is_empty());
    assert!(report.to_string().contains("Particle/Cell Pairs"));
}

/// Delegates to the CPU backend and records every state it is asked to run.
struct RecordingBackend {
    inner: CpuBackend,
    log: Rc<RefCell<Vec<(u64, Stage)>>>,
    fail_at: Option<Stage>,
    fail_resize: Rc<Cell<bool>>,
}

impl RecordingBackend {
    fn record(&self, ctx: &StepContext<'_>, stage: Stage) -> Result<(), StepError> {
        self.log.borrow_mut().push((ctx.step(), stage));
        if self.fail_at == Some(stage) {
            return Err(OrderingViolation::StaleBoundaries {
                built_for: None,
                current: ctx.step(),
            }
            .into());
        }
        Ok(())
    }
}

impl StepBackend for RecordingBackend {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn assign_cells(&mut self, ctx: &StepContext<'_>, store: &ParticleStore) -> Result<(), StepError> {
        self.record(ctx, Stage::AssignCells)?;
        self.inner.assign_cells(ctx, store)
    }

    fn sort(&mut self, ctx: &StepContext<'_>) -> Result<(), StepError> {
        self.record(ctx, Stage::Sort)?;
        self.inner.sort(ctx)
    }

    fn build_boundaries(&mut self, ctx: &StepContext<'_>) -> Result<(), StepError> {
        self.record(ctx, Stage::BuildBoundaries)?;
        self.inner.build_boundaries(ctx)
    }

    fn resolve_neighbors(&mut self, ctx: &StepContext<'_>) -> Result<(), StepError> {
        self.record(ctx, Stage::ResolveNeighbors)?;
        self.inner.resolve_neighbors(ctx)
    }

    fn integrate(&mut self, ctx: &StepContext<'_>, store: &mut ParticleStore) -> Result<(), StepError> {
        self.record(ctx, Stage::IntegrateMotion)?;
        self.inner.integrate(ctx, store)
    }

    fn resize_grid(&mut self, grid: &GridGeometry) -> Result<(), StepError> {
        if self.fail_resize.get() {
            return Err(CapacityError::BufferTooLarge {
                label: "Cell Bounds",
                requested: grid.num_cells() as u64 * 8,
                limit: 0,
            }
            .into());
        }
        self.inner.resize_grid(grid)
    }

    fn num_particles(&self) -> usize {
        self.inner.num_particles()
    }

    fn snapshot(&mut self) -> Result<PipelineSnapshot, StepError> {
        self.inner.snapshot()
    }
}

fn recording_sim(fail_at: Option<Stage>) -> (Simulation, Rc<RefCell<Vec<(u64, Stage)>>>) {
    let config = still_config(1.0, Vec3::splat(3.0));
    let store = particles_at(&[Vec3::splat(0.5), Vec3::splat(2.5)]);
    let grid = GridGeometry::new(config.radius, config.box_size).unwrap();
    let log = Rc::new(RefCell::new(Vec::new()));
    let backend = RecordingBackend {
        inner: CpuBackend::new(&grid, store.len(), Vec::new()).unwrap(),
        log: Rc::clone(&log),
        fail_at,
        fail_resize: Rc::new(Cell::new(false)),
    };
    let sim = Simulation::with_backend(config, store, Box::new(backend)).unwrap();
    (sim, log)
}

#[test]
fn test_states_run_in_order_every_step() {
    let (mut sim, log) = recording_sim(None);
    for _ in 0..3 {
        sim.step(0.01).unwrap();
    }

    let expected: Vec<(u64, Stage)> = (0..3)
        .flat_map(|step| Stage::ORDER.iter().map(move |&s| (step, s)))
        .collect();
    assert_eq!(*log.borrow(), expected);
}

#[test]
fn test_failed_state_poisons_simulation() {
    let (mut sim, log) = recording_sim(Some(Stage::BuildBoundaries));
    assert!(matches!(sim.step(0.01), Err(StepError::Ordering(_))));
    assert!(sim.is_poisoned());

    // Nothing after the failing state ran.
    assert_eq!(
        *log.borrow(),
        vec![(0, Stage::AssignCells), (0, Stage::Sort), (0, Stage::BuildBoundaries)]
    );

    assert!(matches!(sim.step(0.01), Err(StepError::Poisoned)));
    assert!(matches!(sim.set_box(Vec3::ONE), Err(StepError::Poisoned)));
    assert_eq!(log.borrow().len(), 3);
}

#[test]
fn test_backend_for_smaller_grid_is_resized() {
    let config = still_config(1.0, Vec3::splat(4.0));
    let store = particles_at(&[Vec3::splat(0.5), Vec3::splat(2.5), Vec3::splat(3.5)]);
    let small = GridGeometry::new(1.0, Vec3::splat(2.0)).unwrap();
    let backend = CpuBackend::new(&small, store.len(), Vec::new()).unwrap();

    let mut sim = Simulation::with_backend(config, store, Box::new(backend)).unwrap();
    sim.step(0.01).unwrap();

    let snapshot = sim.snapshot().unwrap();
    assert_eq!(snapshot.bounds.num_cells(), 64);
    assert_pipeline_invariants(&snapshot, 3);
}

#[test]
fn test_backend_for_other_particle_count_is_rejected() {
    let config = still_config(1.0, Vec3::splat(2.0));
    let store = particles_at(&[Vec3::splat(0.5), Vec3::splat(1.0), Vec3::splat(1.5)]);
    let grid = GridGeometry::new(1.0, Vec3::splat(2.0)).unwrap();
    let backend = CpuBackend::new(&grid, 2, Vec::new()).unwrap();

    assert!(matches!(
        Simulation::with_backend(config, store, Box::new(backend)),
        Err(StepError::Capacity(CapacityError::ParticleCountMismatch {
            capacity: 2,
            particles: 3
        }))
    ));
}

#[test]
fn test_boundary_table_too_small_for_cells_is_an_error() {
    let big = GridGeometry::new(1.0, Vec3::splat(4.0)).unwrap();
    let store = particles_at(&[Vec3::splat(0.5), Vec3::splat(3.5)]);
    let mut pairs = CellPairs::new(store.len()).unwrap();
    assign_cells(&big, store.as_slice(), &mut pairs).unwrap();
    bitonic_sort(&mut pairs);

    let mut bounds = BoundaryTable::new(8).unwrap();
    assert_eq!(
        bounds.build(&pairs, 0),
        Err(CapacityError::CellOutsideTable {
            cell: 63,
            num_cells: 8
        })
    );
    assert_eq!(bounds.built_for(), None);
}

#[test]
fn test_unallocatable_cpu_buffers_are_a_capacity_error() {
    let grid = GridGeometry::new(1.0, Vec3::splat(2.0)).unwrap();
    assert!(matches!(
        CpuBackend::new(&grid, usize::MAX / 4, Vec::new()),
        Err(CapacityError::AllocationFailed { .. })
    ));
}

#[test]
fn test_rejected_box_change_keeps_old_grid_and_poisons() {
    let config = still_config(1.0, Vec3::splat(3.0));
    let store = particles_at(&[Vec3::splat(0.5), Vec3::splat(2.5)]);
    let grid = GridGeometry::new(config.radius, config.box_size).unwrap();
    let fail_resize = Rc::new(Cell::new(false));
    let backend = RecordingBackend {
        inner: CpuBackend::new(&grid, store.len(), Vec::new()).unwrap(),
        log: Rc::new(RefCell::new(Vec::new())),
        fail_at: None,
        fail_resize: Rc::clone(&fail_resize),
    };
    let mut sim = Simulation::with_backend(config, store, Box::new(backend)).unwrap();
    sim.step(0.01).unwrap();

    fail_resize.set(true);
    assert!(matches!(
        sim.set_box(Vec3::ONE),
        Err(StepError::Capacity(CapacityError::BufferTooLarge { .. }))
    ));
    assert!(sim.is_poisoned());
    assert_eq!(sim.grid().num_cells(), 27);
    assert_eq!(sim.config().box_size, Vec3::splat(3.0));
    // The fold into the rejected box was never committed.
    assert_eq!(sim.particles().unwrap().as_slice()[1].position, Vec3::splat(2.5));
    assert!(matches!(sim.step(0.01), Err(StepError::Poisoned)));
}
