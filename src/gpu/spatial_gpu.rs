//! GPU step pipeline.
//!
//! Handles cell assignment, bitonic sort, boundary building and
//! integration as compute passes recorded into one encoder per step.

use std::num::NonZeroU64;

use bytemuck::{Pod, Zeroable};
use wgpu::util::DeviceExt;

use super::{align_to, dispatch_size, pipeline_wgsl, GpuContext};
use crate::dispatch::{PipelineSnapshot, StepBackend, StepContext};
use crate::error::{OrderingViolation, StepError};
use crate::grid::GridGeometry;
use crate::particle::{ParticleGpu, ParticleStore};
use crate::rules::{MotionParams, Rule};
use crate::sort::{bitonic_passes, BitonicPass, SortPassParams};
use crate::spatial::{padded_len, BoundaryTable, CellPairs, CellRange};

/// Uniform block shared by every kernel; matches `GridParams` in WGSL.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct GridParams {
    pub box_size: [f32; 3],
    pub cell_size: f32,
    pub dims: [u32; 3],
    pub num_particles: u32,
    pub num_cells: u32,
    pub padded_len: u32,
    pub step: u32,
    pub delta_time: f32,
    pub speed: f32,
    pub noise: f32,
    pub radius: f32,
    pub _pad: u32,
}

impl GridParams {
    pub fn new(grid: &GridGeometry, num_particles: u32, motion: &MotionParams) -> Self {
        Self {
            box_size: grid.box_size().to_array(),
            cell_size: grid.cell_size(),
            dims: grid.dims().to_array(),
            num_particles,
            num_cells: grid.num_cells(),
            padded_len: padded_len(num_particles as usize) as u32,
            // Only feeds the noise hash; wrapping is harmless.
            step: motion.step as u32,
            delta_time: motion.delta_time,
            speed: motion.speed,
            noise: motion.noise,
            radius: motion.radius,
            _pad: 0,
        }
    }
}

struct Pipelines {
    assign_cells: wgpu::ComputePipeline,
    bitonic_pass: wgpu::ComputePipeline,
    clear_boundaries: wgpu::ComputePipeline,
    build_boundaries: wgpu::ComputePipeline,
    compute_velocities: wgpu::ComputePipeline,
    apply_motion: wgpu::ComputePipeline,
}

/// GPU resources for the step pipeline.
pub struct GpuBackend {
    gpu: GpuContext,

    // Buffers
    particles: wgpu::Buffer,
    particle_ids: wgpu::Buffer,
    cell_ids: wgpu::Buffer,
    bounds: wgpu::Buffer,
    scratch: wgpu::Buffer,
    params: wgpu::Buffer,
    /// One `SortPassParams` per bitonic pass, `sort_stride` bytes apart.
    sort_params: wgpu::Buffer,

    // Bind groups
    main_layout: wgpu::BindGroupLayout,
    main_bind_group: wgpu::BindGroup,
    sort_bind_group: wgpu::BindGroup,

    pipelines: Pipelines,
    passes: Vec<BitonicPass>,
    sort_stride: u64,

    num_particles: u32,
    num_cells: u32,
    cell_capacity: u32,
    max_workgroups: u32,

    encoder: Option<wgpu::CommandEncoder>,
    built_for: Option<u64>,
    resolved_for: Option<u64>,
}

impl GpuBackend {
    /// Create a headless device and upload `store`.
    pub fn headless(grid: &GridGeometry, store: &ParticleStore, rules: &[Rule]) -> Result<Self, StepError> {
        let gpu = GpuContext::headless()?;
        Self::new(gpu, grid, store, rules)
    }

    /// Allocate every step buffer on `gpu` and upload `store`.
    ///
    /// Fails with a capacity error if any buffer exceeds the device limits.
    pub fn new(
        gpu: GpuContext,
        grid: &GridGeometry,
        store: &ParticleStore,
        rules: &[Rule],
    ) -> Result<Self, StepError> {
        let n = store.len();
        let padded = padded_len(n);
        let num_cells = grid.num_cells();

        // Zero-sized bindings are invalid, so every buffer keeps one slot.
        let particles_size = (n.max(1) * std::mem::size_of::<ParticleGpu>()) as u64;
        let ids_size = (padded.max(1) * std::mem::size_of::<u32>()) as u64;
        let cells_size = (n.max(1) * std::mem::size_of::<u32>()) as u64;
        let scratch_size = (n.max(1) * 16) as u64;
        let bounds_size = bounds_bytes(num_cells);

        gpu.check_storage("Particles", particles_size)?;
        gpu.check_storage("Particle Ids", ids_size)?;
        gpu.check_storage("Cell Ids", cells_size)?;
        gpu.check_storage("Scratch", scratch_size)?;
        gpu.check_storage("Cell Bounds", bounds_size)?;

        let passes = bitonic_passes(padded);
        let limits = gpu.device.limits();
        let sort_stride = align_to(
            std::mem::size_of::<SortPassParams>() as u64,
            limits.min_uniform_buffer_offset_alignment as u64,
        );
        let sort_size = passes.len().max(1) as u64 * sort_stride;
        gpu.check_uniform("Sort Params", sort_size)?;

        log::info!(
            "GPU buffers: {} particles (padded {}), {} cells, {} sort passes",
            n,
            padded,
            num_cells,
            passes.len()
        );

        let device = &gpu.device;
        let particles = storage_buffer(device, "Particles", particles_size);
        let particle_ids = storage_buffer(device, "Particle Ids", ids_size);
        let cell_ids = storage_buffer(device, "Cell Ids", cells_size);
        let scratch = storage_buffer(device, "Velocity Scratch", scratch_size);
        let bounds = storage_buffer(device, "Cell Bounds", bounds_size);

        if n > 0 {
            gpu.queue
                .write_buffer(&particles, 0, bytemuck::cast_slice(&store.to_gpu()));
        }

        let params = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Grid Params"),
            contents: bytemuck::cast_slice(&[GridParams::default()]),
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        });

        let mut sort_bytes = vec![0u8; sort_size as usize];
        for (i, pass) in passes.iter().enumerate() {
            let offset = i * sort_stride as usize;
            let block = SortPassParams::from(*pass);
            sort_bytes[offset..offset + std::mem::size_of::<SortPassParams>()]
                .copy_from_slice(bytemuck::bytes_of(&block));
        }
        let sort_params = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Sort Params"),
            contents: &sort_bytes,
            usage: wgpu::BufferUsages::UNIFORM,
        });

        let main_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Step Bind Group Layout"),
            entries: &[
                storage_entry(0),
                storage_entry(1),
                storage_entry(2),
                storage_entry(3),
                storage_entry(4),
                wgpu::BindGroupLayoutEntry {
                    binding: 5,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });

        let sort_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Sort Pass Bind Group Layout"),
            entries: &[wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: true,
                    min_binding_size: NonZeroU64::new(std::mem::size_of::<SortPassParams>() as u64),
                },
                count: None,
            }],
        });

        let main_bind_group = create_main_bind_group(
            device,
            &main_layout,
            [&particles, &particle_ids, &cell_ids, &bounds, &scratch, &params],
        );

        let sort_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Sort Pass Bind Group"),
            layout: &sort_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                    buffer: &sort_params,
                    offset: 0,
                    size: NonZeroU64::new(std::mem::size_of::<SortPassParams>() as u64),
                }),
            }],
        });

        let pipelines = create_pipelines(device, &main_layout, &sort_layout, rules);

        Ok(Self {
            max_workgroups: limits.max_compute_workgroups_per_dimension,
            particles,
            particle_ids,
            cell_ids,
            bounds,
            scratch,
            params,
            sort_params,
            main_layout,
            main_bind_group,
            sort_bind_group,
            pipelines,
            passes,
            sort_stride,
            num_particles: n as u32,
            num_cells,
            cell_capacity: num_cells,
            encoder: None,
            built_for: None,
            resolved_for: None,
            gpu,
        })
    }

    pub fn context(&self) -> &GpuContext {
        &self.gpu
    }

    fn take_encoder(&mut self) -> wgpu::CommandEncoder {
        self.encoder.take().unwrap_or_else(|| {
            self.gpu
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("Step Encoder"),
                })
        })
    }

    /// Record one compute pass over `lanes` invocations.
    fn record(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        label: &str,
        pipeline: &wgpu::ComputePipeline,
        lanes: u32,
    ) {
        if lanes == 0 {
            return;
        }
        let (x, y) = dispatch_size(lanes, self.max_workgroups);
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some(label),
            timestamp_writes: None,
        });
        pass.set_pipeline(pipeline);
        pass.set_bind_group(0, &self.main_bind_group, &[]);
        pass.dispatch_workgroups(x, y, 1);
    }

    fn padded_len(&self) -> u32 {
        padded_len(self.num_particles as usize) as u32
    }
}

impl StepBackend for GpuBackend {
    fn name(&self) -> &'static str {
        "gpu"
    }

    fn assign_cells(&mut self, ctx: &StepContext<'_>, _store: &ParticleStore) -> Result<(), StepError> {
        self.resolved_for = None;
        let params = GridParams::new(ctx.grid, self.num_particles, &ctx.motion);
        // Queued writes land before the step's single submit.
        self.gpu
            .queue
            .write_buffer(&self.params, 0, bytemuck::cast_slice(&[params]));

        let mut encoder = self.take_encoder();
        self.record(
            &mut encoder,
            "Assign Cells",
            &self.pipelines.assign_cells,
            self.padded_len(),
        );
        self.encoder = Some(encoder);
        Ok(())
    }

    fn sort(&mut self, _ctx: &StepContext<'_>) -> Result<(), StepError> {
        let mut encoder = self.take_encoder();
        let lanes = self.padded_len() / 2;
        let (x, y) = dispatch_size(lanes, self.max_workgroups);

        // One compute pass per (k, j): the pass boundary is the barrier.
        for i in 0..self.passes.len() {
            let offset = (i as u64 * self.sort_stride) as u32;
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("Bitonic Pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.pipelines.bitonic_pass);
            pass.set_bind_group(0, &self.main_bind_group, &[]);
            pass.set_bind_group(1, &self.sort_bind_group, &[offset]);
            pass.dispatch_workgroups(x, y, 1);
        }

        self.encoder = Some(encoder);
        Ok(())
    }

    fn build_boundaries(&mut self, ctx: &StepContext<'_>) -> Result<(), StepError> {
        let mut encoder = self.take_encoder();
        self.record(
            &mut encoder,
            "Clear Boundaries",
            &self.pipelines.clear_boundaries,
            self.num_cells,
        );
        self.record(
            &mut encoder,
            "Build Boundaries",
            &self.pipelines.build_boundaries,
            self.num_particles,
        );
        self.encoder = Some(encoder);
        self.built_for = Some(ctx.step());
        Ok(())
    }

    fn resolve_neighbors(&mut self, ctx: &StepContext<'_>) -> Result<(), StepError> {
        // The stencil walk itself is fused into the velocity kernel.
        if self.built_for != Some(ctx.step()) {
            return Err(OrderingViolation::StaleBoundaries {
                built_for: self.built_for,
                current: ctx.step(),
            }
            .into());
        }
        self.resolved_for = Some(ctx.step());
        Ok(())
    }

    fn integrate(&mut self, ctx: &StepContext<'_>, _store: &mut ParticleStore) -> Result<(), StepError> {
        if self.resolved_for != Some(ctx.step()) {
            self.encoder = None;
            return Err(OrderingViolation::StaleBoundaries {
                built_for: self.built_for,
                current: ctx.step(),
            }
            .into());
        }

        let mut encoder = self.take_encoder();
        self.record(
            &mut encoder,
            "Compute Velocities",
            &self.pipelines.compute_velocities,
            self.num_particles,
        );
        self.record(
            &mut encoder,
            "Apply Motion",
            &self.pipelines.apply_motion,
            self.num_particles,
        );
        self.gpu.queue.submit(std::iter::once(encoder.finish()));
        Ok(())
    }

    fn resize_grid(&mut self, grid: &GridGeometry) -> Result<(), StepError> {
        let num_cells = grid.num_cells();
        if num_cells > self.cell_capacity {
            let size = bounds_bytes(num_cells);
            self.gpu.check_storage("Cell Bounds", size)?;
            log::debug!("Growing cell bounds to {} cells", num_cells);

            self.bounds = storage_buffer(&self.gpu.device, "Cell Bounds", size);
            self.main_bind_group = create_main_bind_group(
                &self.gpu.device,
                &self.main_layout,
                [
                    &self.particles,
                    &self.particle_ids,
                    &self.cell_ids,
                    &self.bounds,
                    &self.scratch,
                    &self.params,
                ],
            );
            self.cell_capacity = num_cells;
        }
        self.num_cells = num_cells;
        self.built_for = None;
        self.resolved_for = None;
        Ok(())
    }

    fn num_particles(&self) -> usize {
        self.num_particles as usize
    }

    fn device_resident(&self) -> bool {
        true
    }

    fn download_particles(&mut self, store: &mut ParticleStore) -> Result<(), StepError> {
        let particles: Vec<ParticleGpu> = self
            .gpu
            .read_pod(&self.particles, self.num_particles as usize)?;
        store.copy_from_gpu(&particles);
        Ok(())
    }

    fn upload_particles(&mut self, store: &ParticleStore) -> Result<(), StepError> {
        if !store.is_empty() {
            self.gpu
                .queue
                .write_buffer(&self.particles, 0, bytemuck::cast_slice(&store.to_gpu()));
        }
        Ok(())
    }

    fn snapshot(&mut self) -> Result<PipelineSnapshot, StepError> {
        let n = self.num_particles as usize;
        let ids: Vec<u32> = self.gpu.read_pod(&self.particle_ids, padded_len(n))?;
        let cells: Vec<u32> = self.gpu.read_pod(&self.cell_ids, n)?;
        let ranges: Vec<CellRange> = self
            .gpu
            .read_pod(&self.bounds, self.num_cells as usize)?;
        Ok(PipelineSnapshot {
            pairs: CellPairs::from_raw(ids, cells),
            bounds: BoundaryTable::from_ranges(ranges, self.built_for),
        })
    }
}

fn bounds_bytes(num_cells: u32) -> u64 {
    num_cells.max(1) as u64 * std::mem::size_of::<CellRange>() as u64
}

fn storage_buffer(device: &wgpu::Device, label: &str, size: u64) -> wgpu::Buffer {
    device.create_buffer(&wgpu::BufferDescriptor {
        label: Some(label),
        size,
        usage: wgpu::BufferUsages::STORAGE
            | wgpu::BufferUsages::COPY_DST
            | wgpu::BufferUsages::COPY_SRC,
        mapped_at_creation: false,
    })
}

fn storage_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only: false },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

/// Group 0 in binding order: particles, ids, cells, bounds, scratch, params.
fn create_main_bind_group(
    device: &wgpu::Device,
    layout: &wgpu::BindGroupLayout,
    buffers: [&wgpu::Buffer; 6],
) -> wgpu::BindGroup {
    let entries: Vec<wgpu::BindGroupEntry> = buffers
        .iter()
        .enumerate()
        .map(|(i, buffer)| wgpu::BindGroupEntry {
            binding: i as u32,
            resource: buffer.as_entire_binding(),
        })
        .collect();
    device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("Step Bind Group"),
        layout,
        entries: &entries,
    })
}

fn create_pipelines(
    device: &wgpu::Device,
    main_layout: &wgpu::BindGroupLayout,
    sort_layout: &wgpu::BindGroupLayout,
    rules: &[Rule],
) -> Pipelines {
    let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some("Step Shader"),
        source: wgpu::ShaderSource::Wgsl(pipeline_wgsl(rules).into()),
    });

    let base_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some("Step Pipeline Layout"),
        bind_group_layouts: &[main_layout],
        push_constant_ranges: &[],
    });
    let sort_pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some("Sort Pipeline Layout"),
        bind_group_layouts: &[main_layout, sort_layout],
        push_constant_ranges: &[],
    });

    Pipelines {
        assign_cells: create_compute_pipeline(device, &base_layout, &shader, "assign_cells", "Assign Cells Pipeline"),
        bitonic_pass: create_compute_pipeline(device, &sort_pipeline_layout, &shader, "bitonic_pass", "Bitonic Pass Pipeline"),
        clear_boundaries: create_compute_pipeline(device, &base_layout, &shader, "clear_boundaries", "Clear Boundaries Pipeline"),
        build_boundaries: create_compute_pipeline(device, &base_layout, &shader, "build_boundaries", "Build Boundaries Pipeline"),
        compute_velocities: create_compute_pipeline(device, &base_layout, &shader, "compute_velocities", "Compute Velocities Pipeline"),
        apply_motion: create_compute_pipeline(device, &base_layout, &shader, "apply_motion", "Apply Motion Pipeline"),
    }
}

fn create_compute_pipeline(
    device: &wgpu::Device,
    layout: &wgpu::PipelineLayout,
    shader: &wgpu::ShaderModule,
    entry_point: &str,
    label: &str,
) -> wgpu::ComputePipeline {
    device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some(label),
        layout: Some(layout),
        module: shader,
        entry_point: Some(entry_point),
        compilation_options: Default::default(),
        cache: None,
    })
}
