//! Shader assembly.
//!
//! All kernels live in one module so they share struct definitions and
//! bindings. Group 0 carries the step buffers; group 1 carries the bitonic
//! pass parameters and is only bound for the sort kernel.

use crate::grid::GRID_WGSL;
use crate::particle::PARTICLE_WGSL;
use crate::rules::{motion_kernels_wgsl, Rule};
use crate::sort::BITONIC_WGSL;
use crate::spatial::{ASSIGN_CELLS_WGSL, BOUNDARIES_WGSL};
use crate::stencil::STENCIL_WGSL;

/// Group 0 bindings and the flat invocation index.
pub const BINDINGS_WGSL: &str = r#"
@group(0) @binding(0) var<storage, read_write> particles: array<Particle>;
@group(0) @binding(1) var<storage, read_write> particle_ids: array<u32>;
@group(0) @binding(2) var<storage, read_write> cell_ids: array<u32>;
@group(0) @binding(3) var<storage, read_write> bounds: array<u32>;
@group(0) @binding(4) var<storage, read_write> scratch: array<vec4<f32>>;
@group(0) @binding(5) var<uniform> grid: GridParams;

fn linear_index(gid: vec3<u32>, nwg: vec3<u32>) -> u32 {
    return gid.x + gid.y * nwg.x * 128u;
}
"#;

/// The complete compute module for the given integration rules.
pub fn pipeline_wgsl(rules: &[Rule]) -> String {
    let motion = motion_kernels_wgsl(rules);
    [
        PARTICLE_WGSL,
        GRID_WGSL,
        BINDINGS_WGSL,
        ASSIGN_CELLS_WGSL,
        BITONIC_WGSL,
        BOUNDARIES_WGSL,
        STENCIL_WGSL,
        motion.as_str(),
    ]
    .join("\n")
}
