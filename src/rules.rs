//! Motion rules applied during integration.
//!
//! The neighbour pipeline only produces candidate sets; what particles do
//! with them is pluggable. Every rule reads the same per-particle neighbour
//! aggregate and adjusts the new velocity. Rules run in the order given,
//! after the per-step noise kick.
//!
//! Each rule has a CPU form ([`Rule::apply`]) and a WGSL form
//! ([`Rule::to_wgsl`]) that the GPU backend splices into its velocity kernel.
//!
//! ```ignore
//! SimConfig::default()
//!     .with_rule(Rule::Separate { strength: 2.0 })
//!     .with_rule(Rule::Align { strength: 1.0 })
//!     .with_rule(Rule::ConstantSpeed)
//! ```

use glam::Vec3;
use serde::{Deserialize, Serialize};

use crate::particle::Particle;
use crate::stencil::NeighborIndex;

/// A velocity rule.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum Rule {
    /// Push away from neighbours inside the interaction radius.
    ///
    /// Each neighbour contributes a unit push scaled by
    /// `1 - dist / radius`, so the force fades to zero at the radius.
    Separate {
        /// Acceleration per unit of accumulated push.
        strength: f32,
    },

    /// Steer toward the average velocity of neighbours.
    Align {
        /// Blend rate per second; the blend factor is `min(strength * dt, 1)`.
        strength: f32,
    },

    /// Accelerate toward the centroid of neighbours.
    Cohere {
        /// Acceleration per unit of distance to the centroid.
        strength: f32,
    },

    /// Velocity damping. 1.0 stops a particle in about one second.
    Drag(f32),

    /// Rescale velocity to the configured speed. Zero velocity stays zero.
    ConstantSpeed,
}

/// What a particle sees of its neighbours in one step.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct NeighborSums {
    /// Neighbours strictly inside the radius, excluding the particle itself.
    pub count: u32,
    /// Sum of falloff-weighted unit vectors pointing away from neighbours.
    pub separation: Vec3,
    /// Sum of neighbour velocities.
    pub velocity: Vec3,
    /// Sum of neighbour positions.
    pub position: Vec3,
}

/// Per-step inputs shared by every particle.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MotionParams {
    pub delta_time: f32,
    pub speed: f32,
    pub noise: f32,
    pub radius: f32,
    pub step: u64,
}

impl Rule {
    /// Adjust `velocity` of particle `p`.
    pub fn apply(&self, velocity: &mut Vec3, p: &Particle, sums: &NeighborSums, params: &MotionParams) {
        let dt = params.delta_time;
        match *self {
            Rule::Separate { strength } => {
                *velocity += sums.separation * strength * dt;
            }
            Rule::Align { strength } => {
                if sums.count > 0 {
                    let average = sums.velocity / sums.count as f32;
                    *velocity += (average - *velocity) * (strength * dt).min(1.0);
                }
            }
            Rule::Cohere { strength } => {
                if sums.count > 0 {
                    let centroid = sums.position / sums.count as f32;
                    *velocity += (centroid - p.position) * strength * dt;
                }
            }
            Rule::Drag(drag) => {
                *velocity *= (1.0 - drag * dt).max(0.0);
            }
            Rule::ConstantSpeed => {
                let len = velocity.length();
                if len > 1e-12 {
                    *velocity *= params.speed / len;
                }
            }
        }
    }

    /// WGSL statements for this rule. Operates on `vel`, `pos` and the
    /// private `n_*` aggregate variables.
    pub fn to_wgsl(&self) -> String {
        match *self {
            Rule::Separate { strength } => format!(
                r#"    // Separate
    vel += n_separation * {} * grid.delta_time;"#,
                wgsl_f32(strength)
            ),
            Rule::Align { strength } => format!(
                r#"    // Align
    if n_count > 0u {{
        let avg = n_velocity / f32(n_count);
        vel += (avg - vel) * min({} * grid.delta_time, 1.0);
    }}"#,
                wgsl_f32(strength)
            ),
            Rule::Cohere { strength } => format!(
                r#"    // Cohere
    if n_count > 0u {{
        let centroid = n_position / f32(n_count);
        vel += (centroid - pos) * {} * grid.delta_time;
    }}"#,
                wgsl_f32(strength)
            ),
            Rule::Drag(drag) => format!(
                r#"    // Drag
    vel *= max(1.0 - {} * grid.delta_time, 0.0);"#,
                wgsl_f32(drag)
            ),
            Rule::ConstantSpeed => r#"    // Constant speed
    {
        let len = length(vel);
        if len > 1e-12 {
            vel *= grid.speed / len;
        }
    }"#
            .to_string(),
        }
    }

    /// Rule parameters, for finiteness checks.
    pub(crate) fn parameters(&self) -> Option<f32> {
        match *self {
            Rule::Separate { strength } | Rule::Align { strength } | Rule::Cohere { strength } => {
                Some(strength)
            }
            Rule::Drag(drag) => Some(drag),
            Rule::ConstantSpeed => None,
        }
    }
}

/// Format an f32 as a WGSL float literal (always with a decimal point).
fn wgsl_f32(value: f32) -> String {
    format!("{:?}", value)
}

/// Gather the neighbour aggregate of particle `id` from its stencil.
pub fn gather_neighbors(
    index: &NeighborIndex<'_>,
    particles: &[Particle],
    id: usize,
    radius: f32,
) -> NeighborSums {
    let me = &particles[id];
    let stencil = index.stencil_at(me.position);
    let mut sums = NeighborSums::default();

    for other in index.particles_in(&stencil) {
        let other = other as usize;
        if other == id {
            continue;
        }
        let o = &particles[other];
        let offset = o.position - me.position;
        let dist = offset.length();
        if dist >= radius {
            continue;
        }
        sums.count += 1;
        sums.velocity += o.velocity;
        sums.position += o.position;
        if dist > 1e-6 {
            sums.separation -= offset / dist * (1.0 - dist / radius);
        }
    }
    sums
}

/// New velocity of particle `id`: noise kick, then every rule in order.
pub fn next_velocity(
    rules: &[Rule],
    p: &Particle,
    id: u32,
    sums: &NeighborSums,
    params: &MotionParams,
) -> Vec3 {
    let mut velocity = p.velocity + noise_vector(id, params.step) * (params.noise * params.speed);
    for rule in rules {
        rule.apply(&mut velocity, p, sums, params);
    }
    velocity
}

/// Colour encoding local crowding: blue when alone, red at 8+ neighbours.
pub fn crowding_color(count: u32) -> Vec3 {
    let t = (count as f32 / 8.0).min(1.0);
    Vec3::new(0.1, 0.3, 1.0).lerp(Vec3::new(1.0, 0.3, 0.1), t)
}

/// Stateless PCG hash.
#[inline]
pub fn pcg_hash(v: u32) -> u32 {
    let state = v.wrapping_mul(747_796_405).wrapping_add(2_891_336_453);
    let word = ((state >> ((state >> 28) + 4)) ^ state).wrapping_mul(277_803_737);
    (word >> 22) ^ word
}

/// Deterministic per-particle, per-step jitter in `[-1, 1]^3`.
pub fn noise_vector(id: u32, step: u64) -> Vec3 {
    let step = step as u32;
    let component = |axis: u32| {
        let h = pcg_hash(id ^ pcg_hash(step.wrapping_mul(3).wrapping_add(axis)));
        h as f32 / u32::MAX as f32 * 2.0 - 1.0
    };
    Vec3::new(component(0), component(1), component(2))
}

/// WGSL twins of [`pcg_hash`], [`noise_vector`] and [`crowding_color`].
pub const MOTION_HELPERS_WGSL: &str = r#"
fn pcg_hash(v: u32) -> u32 {
    let state = v * 747796405u + 2891336453u;
    let word = ((state >> ((state >> 28u) + 4u)) ^ state) * 277803737u;
    return (word >> 22u) ^ word;
}

fn noise_vector(id: u32, step: u32) -> vec3<f32> {
    var jitter = vec3<f32>(0.0);
    for (var axis = 0u; axis < 3u; axis++) {
        let h = pcg_hash(id ^ pcg_hash(step * 3u + axis));
        jitter[axis] = f32(h) / 4294967295.0 * 2.0 - 1.0;
    }
    return jitter;
}

fn crowding_color(count: f32) -> vec3<f32> {
    let t = min(count / 8.0, 1.0);
    return mix(vec3<f32>(0.1, 0.3, 1.0), vec3<f32>(1.0, 0.3, 0.1), t);
}

var<private> n_count: u32;
var<private> n_separation: vec3<f32>;
var<private> n_velocity: vec3<f32>;
var<private> n_position: vec3<f32>;

fn visit_neighbor(self_id: u32, other: u32) {
    if other == self_id {
        return;
    }
    let me = particles[self_id].position;
    let o = particles[other];
    let offset = o.position - me;
    let dist = length(offset);
    if dist >= grid.radius {
        return;
    }
    n_count += 1u;
    n_velocity += o.velocity;
    n_position += o.position;
    if dist > 1e-6 {
        n_separation -= offset / dist * (1.0 - dist / grid.radius);
    }
}
"#;

/// Generate the integration kernels for `rules`.
///
/// `compute_velocities` walks each particle's stencil and writes the new
/// velocity (xyz) and neighbour count (w) into `scratch`. `apply_motion`
/// then moves every particle. The split keeps reads of neighbour state and
/// writes of particle state in different dispatches.
pub fn motion_kernels_wgsl(rules: &[Rule]) -> String {
    let rules_code = rules
        .iter()
        .map(Rule::to_wgsl)
        .collect::<Vec<_>>()
        .join("\n\n");

    format!(
        r#"{MOTION_HELPERS_WGSL}

@compute @workgroup_size(128)
fn compute_velocities(
    @builtin(global_invocation_id) gid: vec3<u32>,
    @builtin(num_workgroups) nwg: vec3<u32>,
) {{
    let index = linear_index(gid, nwg);
    if index >= grid.num_particles {{
        return;
    }}

    n_count = 0u;
    n_separation = vec3<f32>(0.0);
    n_velocity = vec3<f32>(0.0);
    n_position = vec3<f32>(0.0);

    let p = particles[index];
    let pos = p.position;
    walk_stencil(index, cell_coord(pos));

    var vel = p.velocity + noise_vector(index, grid.step) * (grid.noise * grid.speed);

{rules_code}

    scratch[index] = vec4<f32>(vel, f32(n_count));
}}

@compute @workgroup_size(128)
fn apply_motion(
    @builtin(global_invocation_id) gid: vec3<u32>,
    @builtin(num_workgroups) nwg: vec3<u32>,
) {{
    let index = linear_index(gid, nwg);
    if index >= grid.num_particles {{
        return;
    }}

    var p = particles[index];
    let s = scratch[index];
    var pos = p.position + s.xyz * grid.delta_time;
    var vel = s.xyz;
    reflect_into_box(&pos, &vel);
    p.position = pos;
    p.velocity = vel;
    p.color = crowding_color(s.w);
    particles[index] = p;
}}
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> MotionParams {
        MotionParams {
            delta_time: 0.1,
            speed: 2.0,
            noise: 0.0,
            radius: 1.0,
            step: 0,
        }
    }

    #[test]
    fn test_constant_speed() {
        let p = Particle::default();
        let sums = NeighborSums::default();
        let mut v = Vec3::new(3.0, 4.0, 0.0);
        Rule::ConstantSpeed.apply(&mut v, &p, &sums, &params());
        assert!((v.length() - 2.0).abs() < 1e-6);

        let mut zero = Vec3::ZERO;
        Rule::ConstantSpeed.apply(&mut zero, &p, &sums, &params());
        assert_eq!(zero, Vec3::ZERO);
    }

    #[test]
    fn test_align_without_neighbors_is_noop() {
        let p = Particle::default();
        let mut v = Vec3::X;
        Rule::Align { strength: 5.0 }.apply(&mut v, &p, &NeighborSums::default(), &params());
        assert_eq!(v, Vec3::X);
    }

    #[test]
    fn test_align_moves_toward_average() {
        let p = Particle::default();
        let sums = NeighborSums {
            count: 2,
            velocity: Vec3::new(0.0, 4.0, 0.0),
            ..Default::default()
        };
        let mut v = Vec3::ZERO;
        // blend factor min(5 * 0.1, 1) = 0.5 toward (0, 2, 0)
        Rule::Align { strength: 5.0 }.apply(&mut v, &p, &sums, &params());
        assert!((v - Vec3::new(0.0, 1.0, 0.0)).length() < 1e-6);
    }

    #[test]
    fn test_drag_never_reverses() {
        let p = Particle::default();
        let mut v = Vec3::ONE;
        Rule::Drag(100.0).apply(&mut v, &p, &NeighborSums::default(), &params());
        assert_eq!(v, Vec3::ZERO);
    }

    #[test]
    fn test_noise_is_deterministic_and_bounded() {
        assert_eq!(noise_vector(5, 9), noise_vector(5, 9));
        assert_ne!(noise_vector(5, 9), noise_vector(6, 9));
        assert_ne!(noise_vector(5, 9), noise_vector(5, 10));
        for id in 0..200 {
            let n = noise_vector(id, 3);
            assert!(n.abs().max_element() <= 1.0);
        }
    }

    #[test]
    fn test_wgsl_float_literals() {
        assert_eq!(wgsl_f32(2.0), "2.0");
        assert!(Rule::Drag(1.0).to_wgsl().contains("1.0 * grid.delta_time"));
    }

    #[test]
    fn test_crowding_color_saturates() {
        assert_eq!(crowding_color(0), Vec3::new(0.1, 0.3, 1.0));
        assert_eq!(crowding_color(8), crowding_color(100));
    }
}
